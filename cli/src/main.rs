use crate::cli_options::{CliCommand, CliOptions};
use crate::commands::RepoContext;
use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod cli_options;
mod commands;
mod user_config;

#[tokio::main]
async fn main() -> ExitCode {
    let CliOptions {
        chdir,
        log_level,
        feature_store_yaml,
        command,
    } = CliOptions::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::from(log_level).into())
                .from_env_lossy(),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(chdir, feature_store_yaml, command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(
    chdir: Option<std::path::PathBuf>,
    feature_store_yaml: Option<std::path::PathBuf>,
    command: CliCommand,
) -> Result<()> {
    let cwd = match chdir {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    let ctx = RepoContext {
        cwd,
        feature_store_yaml,
    };

    match command {
        CliCommand::Version { client_only } => commands::version(&ctx, client_only).await,
        CliCommand::Config(command) => commands::config(command),
        CliCommand::Entities(command) => commands::entities(&ctx, command).await,
        CliCommand::FeatureTables(command) => commands::feature_tables(&ctx, command).await,
        CliCommand::Projects(command) => commands::projects(&ctx, command).await,
        CliCommand::Apply { repo_path } => commands::apply(&ctx, repo_path.as_deref()).await,
        CliCommand::Teardown { repo_path } => commands::teardown(&ctx, repo_path.as_deref()).await,
        CliCommand::RegistryDump { repo_path } => commands::registry_dump(&ctx, &repo_path).await,
        CliCommand::Materialize {
            start_ts,
            end_ts,
            repo_path,
            views,
        } => {
            commands::materialize(&ctx, &start_ts, &end_ts, repo_path.as_deref(), views).await
        }
        CliCommand::Init { minimal } => commands::init(&ctx, minimal).await,
    }
}
