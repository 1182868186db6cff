use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl From<LogLevel> for tracing::Level {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warning => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Critical => tracing::Level::ERROR,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Display version information
    Version {
        /// Print only the version of the CLI
        #[arg(short = 'c', long = "client-only", default_value_t = false)]
        client_only: bool,
    },
    /// View and edit Feast properties
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Create and manage entities
    #[command(subcommand)]
    Entities(EntitiesCommand),
    /// Create and manage feature tables
    #[command(name = "feature-tables", subcommand)]
    FeatureTables(FeatureTablesCommand),
    /// Create and manage projects
    #[command(subcommand)]
    Projects(ProjectsCommand),
    /// Apply a feature repo
    Apply {
        /// Feature repo directory, defaults to the current one
        repo_path: Option<PathBuf>,
    },
    /// Tear down infra for a feature repo
    Teardown {
        repo_path: Option<PathBuf>,
    },
    /// Print the contents of the metadata registry
    #[command(name = "registry-dump")]
    RegistryDump { repo_path: PathBuf },
    /// Load feature values between START_TS and END_TS from the batch sources into the online
    /// store. All registered feature views are materialized unless --views is given.
    /// Timestamps are ISO 8601, e.g. '2021-07-16T19:20:01'; a missing offset means UTC.
    Materialize {
        start_ts: String,
        end_ts: String,
        repo_path: Option<PathBuf>,
        /// Feature views to materialize
        #[arg(short = 'v', long = "views")]
        views: Vec<String>,
    },
    /// Create a new feature repo in the current directory
    Init {
        /// Only generate the config
        #[arg(short = 'm', long = "minimal", default_value_t = false)]
        minimal: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// List Feast properties
    List,
    /// Set a Feast property
    Set { prop: String, value: String },
}

#[derive(Subcommand, Debug)]
pub enum EntitiesCommand {
    /// Create or update entities from a definitions file
    Apply {
        /// Path to an entity definitions file
        #[arg(short = 'f', long = "filename")]
        filename: PathBuf,
        /// Project the entities belong to, defaults to the repo project
        #[arg(short = 'p', long = "project")]
        project: Option<String>,
    },
    /// Describe an entity
    Describe {
        name: String,
        #[arg(short = 'p', long = "project")]
        project: Option<String>,
    },
    /// List entities
    List {
        /// Project to list, all projects when empty
        #[arg(short = 'p', long = "project", default_value = "")]
        project: String,
        /// Comma-separated key,value pairs the labels must contain
        #[arg(short = 'l', long = "labels", default_value = "")]
        labels: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum FeatureTablesCommand {
    /// Create or update feature tables from a definitions file
    Apply {
        #[arg(short = 'f', long = "filename")]
        filename: PathBuf,
    },
    /// Describe a feature table
    Describe {
        name: String,
        #[arg(short = 'p', long = "project")]
        project: Option<String>,
    },
    /// List feature tables
    List {
        #[arg(short = 'p', long = "project", default_value = "")]
        project: String,
        #[arg(short = 'l', long = "labels", default_value = "")]
        labels: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum ProjectsCommand {
    /// Create a project
    Create { name: String },
    /// Archive a project
    Archive { name: String },
    /// List active projects
    List,
}

#[derive(Parser, Debug)]
#[command(name = "feast", version, about, long_about = None)]
pub struct CliOptions {
    /// Switch to a different feature repository directory before executing the given subcommand.
    #[arg(short = 'c', long = "chdir", env = "FEATURE_REPO_DIR_ENV_VAR")]
    pub chdir: Option<PathBuf>,
    /// The logging level. Case-insensitive.
    #[arg(
        value_enum,
        long = "log-level",
        ignore_case = true,
        default_value = "info"
    )]
    pub log_level: LogLevel,
    /// Override the directory where the CLI should look for the feature_store.yaml file.
    #[arg(short = 'f', long = "feature-store-yaml", env = "FEAST_FS_YAML_FILE_PATH")]
    pub feature_store_yaml: Option<PathBuf>,
    #[command(subcommand)]
    pub command: CliCommand,
}
