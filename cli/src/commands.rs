use crate::cli_options::{ConfigCommand, EntitiesCommand, FeatureTablesCommand, ProjectsCommand};
use crate::user_config::{self, UserConfig};
use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use comfy_table::presets::NOTHING;
use comfy_table::{ContentArrangement, Table};
use feast_core::FeatureStore;
use feast_core::config::RepoConfig;
use feast_core::materializer::ViewProgress;
use feast_core::model::{Labels, RegistryObject, parse_labels};
use feast_core::registry::ApplyReport;
use feast_core::repo_operations;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Where the feature repo and its config live for this invocation.
pub struct RepoContext {
    pub cwd: PathBuf,
    pub feature_store_yaml: Option<PathBuf>,
}

impl RepoContext {
    pub fn repo_dir(&self, repo_path: Option<&Path>) -> PathBuf {
        match repo_path {
            Some(path) if path.is_absolute() => path.to_path_buf(),
            Some(path) => self.cwd.join(path),
            None => self.cwd.clone(),
        }
    }

    pub async fn repo_config(&self, repo_dir: &Path) -> Result<RepoConfig> {
        let yaml = self
            .feature_store_yaml
            .as_ref()
            .map(|path| repo_dir.join(path));
        Ok(repo_operations::load_repo_config(repo_dir, yaml.as_deref()).await?)
    }

    pub async fn store(&self, repo_dir: &Path) -> Result<FeatureStore> {
        let config = self.repo_config(repo_dir).await?;
        Ok(FeatureStore::from_repo_config(config).await?)
    }
}

/// Accepts ISO 8601 with or without an offset; naive timestamps are UTC.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(naive.and_utc());
        }
    }
    Err(anyhow!(
        "Invalid timestamp '{}', expected ISO 8601 such as 2021-07-16T19:20:01",
        value
    ))
}

fn new_table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(NOTHING)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.to_vec());
    table
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_report(report: &ApplyReport) {
    if report.is_noop() {
        println!("No changes to registry");
        return;
    }
    for object in &report.added {
        println!("Created {} {}", object.kind, object.name);
    }
    for object in &report.updated {
        println!("Updated {} {}", object.kind, object.name);
    }
    for object in &report.deleted {
        println!("Deleted {} {}", object.kind, object.name);
    }
}

pub async fn version(ctx: &RepoContext, client_only: bool) -> Result<()> {
    let mut versions = serde_json::json!({
        "sdk": { "version": env!("CARGO_PKG_VERSION") }
    });
    if !client_only {
        let store = ctx
            .store(&ctx.repo_dir(None))
            .await
            .context("Error initializing backend store")?;
        let snapshot = store.registry().snapshot().await?;
        versions["registry"] = serde_json::json!({
            "location": store.registry().location(),
            "version": snapshot.version,
        });
    }
    println!("{}", versions);
    Ok(())
}

pub fn config(command: ConfigCommand) -> Result<()> {
    let mut config = UserConfig::load(user_config::default_path()?)?;
    match command {
        ConfigCommand::List => print_json(config.properties()),
        ConfigCommand::Set { prop, value } => {
            config.set(&prop, &value)?;
            config.save()
        }
    }
}

async fn load_objects(path: &Path, wanted: &str) -> Result<Vec<RegistryObject>> {
    let objects = repo_operations::load_definitions_file(path).await?;
    let misplaced = objects.iter().find(|object| match object {
        RegistryObject::Entity(_) => wanted != "entity",
        RegistryObject::FeatureView(_) => wanted != "feature_view",
    });
    if let Some(object) = misplaced {
        bail!(
            "{} defines '{}' which is not of kind {}",
            path.display(),
            object.name(),
            wanted
        );
    }
    Ok(objects)
}

pub async fn entities(ctx: &RepoContext, command: EntitiesCommand) -> Result<()> {
    let store = ctx.store(&ctx.repo_dir(None)).await?;
    match command {
        EntitiesCommand::Apply { filename, project } => {
            let objects = load_objects(&ctx.repo_dir(Some(&filename)), "entity").await?;
            let project = project.unwrap_or_else(|| store.project().to_string());
            print_report(&store.registry().apply(objects, &project).await?);
        }
        EntitiesCommand::Describe { name, project } => {
            let project = project.unwrap_or_else(|| store.project().to_string());
            let entity = store.registry().get_entity(&name, &project).await?;
            print_json(&entity)?;
        }
        EntitiesCommand::List { project, labels } => {
            let labels = parse_labels(&labels)?;
            let mut table = new_table(&["NAME", "DESCRIPTION", "TYPE"]);
            for entity in store.registry().list_entities(&project, &labels).await? {
                table.add_row(vec![
                    entity.name,
                    entity.description,
                    entity.value_type.to_string(),
                ]);
            }
            println!("{}", table);
        }
    }
    Ok(())
}

pub async fn feature_tables(ctx: &RepoContext, command: FeatureTablesCommand) -> Result<()> {
    let store = ctx.store(&ctx.repo_dir(None)).await?;
    match command {
        FeatureTablesCommand::Apply { filename } => {
            let objects = load_objects(&ctx.repo_dir(Some(&filename)), "feature_view").await?;
            print_report(&store.apply(objects).await?);
        }
        FeatureTablesCommand::Describe { name, project } => {
            let project = project.unwrap_or_else(|| store.project().to_string());
            let view = store.registry().get_feature_view(&name, &project).await?;
            print_json(&view)?;
        }
        FeatureTablesCommand::List { project, labels } => {
            let labels = parse_labels(&labels)?;
            let mut table = new_table(&["NAME", "ENTITIES"]);
            for view in store.registry().list_feature_views(&project, &labels).await? {
                table.add_row(vec![view.name, view.entities.join(", ")]);
            }
            println!("{}", table);
        }
    }
    Ok(())
}

pub async fn projects(ctx: &RepoContext, command: ProjectsCommand) -> Result<()> {
    let store = ctx.store(&ctx.repo_dir(None)).await?;
    let registry = store.registry();
    match command {
        ProjectsCommand::Create { name } => registry.create_project(&name).await?,
        ProjectsCommand::Archive { name } => registry.archive_project(&name).await?,
        ProjectsCommand::List => {
            let mut table = new_table(&["NAME"]);
            for project in registry.list_projects().await? {
                if !project.archived {
                    table.add_row(vec![project.name]);
                }
            }
            println!("{}", table);
        }
    }
    Ok(())
}

pub async fn apply(ctx: &RepoContext, repo_path: Option<&Path>) -> Result<()> {
    let repo_dir = ctx.repo_dir(repo_path);
    let config = ctx.repo_config(&repo_dir).await?;
    let report = repo_operations::apply_total(config, &repo_dir).await?;
    print_report(&report);
    Ok(())
}

pub async fn teardown(ctx: &RepoContext, repo_path: Option<&Path>) -> Result<()> {
    let repo_dir = ctx.repo_dir(repo_path);
    let config = ctx.repo_config(&repo_dir).await?;
    Ok(repo_operations::teardown(config).await?)
}

pub async fn registry_dump(ctx: &RepoContext, repo_path: &Path) -> Result<()> {
    let repo_dir = ctx.repo_dir(Some(repo_path));
    let config = ctx.repo_config(&repo_dir).await?;
    println!("{}", repo_operations::registry_dump(config).await?);
    Ok(())
}

pub async fn init(ctx: &RepoContext, minimal: bool) -> Result<()> {
    let repo_dir = ctx.repo_dir(None);
    repo_operations::init_repo(&repo_dir, minimal).await?;
    println!("Created a new Feast repository in {}", repo_dir.display());
    Ok(())
}

pub async fn materialize(
    ctx: &RepoContext,
    start_ts: &str,
    end_ts: &str,
    repo_path: Option<&Path>,
    views: Vec<String>,
) -> Result<()> {
    let start = parse_timestamp(start_ts)?;
    let end = parse_timestamp(end_ts)?;
    let store = ctx.store(&ctx.repo_dir(repo_path)).await?;

    let targets: Vec<String> = if views.is_empty() {
        store
            .list_feature_views(&Labels::new())
            .await?
            .into_iter()
            .map(|view| view.name)
            .collect()
    } else {
        views.clone()
    };
    let multi = MultiProgress::new();
    let style = ProgressStyle::with_template("{spinner:.green} {prefix:.bold} {pos} rows")?;
    let bars: HashMap<String, ProgressBar> = targets
        .iter()
        .map(|name| {
            let bar = multi.add(ProgressBar::new_spinner());
            bar.set_style(style.clone());
            bar.set_prefix(name.clone());
            bar.enable_steady_tick(Duration::from_millis(120));
            (name.clone(), bar)
        })
        .collect();
    let bars = Arc::new(bars);
    let progress_bars = bars.clone();
    let progress: ViewProgress = Arc::new(move |view: &str, rows: usize| {
        if let Some(bar) = progress_bars.get(view) {
            bar.set_position(rows as u64);
        }
    });

    let selected = if views.is_empty() {
        None
    } else {
        Some(views.as_slice())
    };
    let outcomes = store.materialize(selected, start, end, Some(progress)).await;
    for bar in bars.values() {
        bar.finish_and_clear();
    }
    let outcomes = outcomes?;

    let mut table = new_table(&["FEATURE VIEW", "ROWS READ", "WRITTEN", "IGNORED", "STATUS"]);
    let mut failed = 0;
    for outcome in &outcomes {
        match &outcome.result {
            Ok(stats) => {
                table.add_row(vec![
                    outcome.feature_view.clone(),
                    stats.rows_read.to_string(),
                    stats.written.to_string(),
                    stats.ignored.to_string(),
                    "ok".to_string(),
                ]);
            }
            Err(err) => {
                failed += 1;
                table.add_row(vec![
                    outcome.feature_view.clone(),
                    "-".to_string(),
                    "-".to_string(),
                    "-".to_string(),
                    format!("failed: {}", err),
                ]);
            }
        }
    }
    println!("{}", table);
    if failed > 0 {
        bail!(
            "{} of {} feature views failed to materialize",
            failed,
            outcomes.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_default_to_utc() -> Result<()> {
        let expected = Utc.with_ymd_and_hms(2021, 7, 16, 19, 20, 1).unwrap();
        assert_eq!(parse_timestamp("2021-07-16T19:20:01")?, expected);
        assert_eq!(parse_timestamp("2021-07-16 19:20:01")?, expected);
        assert_eq!(parse_timestamp("2021-07-16T21:20:01+02:00")?, expected);
        assert_eq!(parse_timestamp("2021-07-16T19:20:01Z")?, expected);
        assert_eq!(
            parse_timestamp("2021-07-16")?,
            Utc.with_ymd_and_hms(2021, 7, 16, 0, 0, 0).unwrap()
        );
        assert!(parse_timestamp("yesterday").is_err());
        Ok(())
    }

    #[test]
    fn repo_dir_resolves_against_cwd() {
        let ctx = RepoContext {
            cwd: PathBuf::from("/work"),
            feature_store_yaml: None,
        };
        assert_eq!(ctx.repo_dir(None), PathBuf::from("/work"));
        assert_eq!(ctx.repo_dir(Some(Path::new("repo"))), PathBuf::from("/work/repo"));
        assert_eq!(ctx.repo_dir(Some(Path::new("/abs"))), PathBuf::from("/abs"));
    }

    #[tokio::test]
    async fn apply_then_dump_through_commands() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ctx = RepoContext {
            cwd: dir.path().to_path_buf(),
            feature_store_yaml: None,
        };
        init(&ctx, false).await?;
        apply(&ctx, None).await?;
        let store = ctx.store(dir.path()).await?;
        let view = store.get_feature_view("driver_hourly_stats").await?;
        assert_eq!(view.entities, vec!["driver_id"]);
        teardown(&ctx, None).await?;
        Ok(())
    }
}
