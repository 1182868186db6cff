use crate::error::{FeastError, Result};
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_MATERIALIZATION_BATCH_SIZE: usize = 10_000;

#[derive(Clone, Debug, Default, PartialEq)]
#[allow(clippy::upper_case_acronyms)]
pub enum Provider {
    #[default]
    Local,
    AWS,
    GCP,
    Unknown(String),
}

impl Serialize for Provider {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Provider::Local => serializer.serialize_str("local"),
            Provider::AWS => serializer.serialize_str("aws"),
            Provider::GCP => serializer.serialize_str("gcp"),
            Provider::Unknown(other) => serializer.serialize_str(other.as_str()),
        }
    }
}

impl<'de> Deserialize<'de> for Provider {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        let provider = match value.to_ascii_lowercase().as_str() {
            "local" => Provider::Local,
            "aws" => Provider::AWS,
            "gcp" => Provider::GCP,
            _ => Provider::Unknown(value),
        };
        Ok(provider)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "RegistryConfigDef")]
pub struct RegistryConfig {
    pub path: String,
    pub cache_ttl_seconds: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum RegistryConfigDef {
    Path(String),
    Detailed {
        path: String,
        #[serde(default)]
        cache_ttl_seconds: Option<u64>,
    },
}

impl From<RegistryConfigDef> for RegistryConfig {
    fn from(value: RegistryConfigDef) -> Self {
        match value {
            RegistryConfigDef::Path(path) => RegistryConfig {
                path,
                cache_ttl_seconds: None,
            },
            RegistryConfigDef::Detailed {
                path,
                cache_ttl_seconds,
            } => RegistryConfig {
                path,
                cache_ttl_seconds,
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OnlineStoreConfig {
    Sqlite { path: String },
    Memory,
}

impl Default for OnlineStoreConfig {
    fn default() -> Self {
        OnlineStoreConfig::Sqlite {
            path: "data/online_store.db".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaterializationConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    DEFAULT_MATERIALIZATION_BATCH_SIZE
}

impl Default for MaterializationConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_MATERIALIZATION_BATCH_SIZE,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RepoConfig {
    pub project: String,
    #[serde(default)]
    pub project_description: Option<String>,
    #[serde(default)]
    pub provider: Option<Provider>,
    pub registry: RegistryConfig,
    #[serde(default)]
    pub online_store: OnlineStoreConfig,
    #[serde(default)]
    pub materialization: MaterializationConfig,
    /// Directory that relative paths in this config resolve against.
    #[serde(skip)]
    pub repo_path: Option<PathBuf>,
}

impl RepoConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Err(FeastError::validation("Empty configuration file"));
        }
        let config: RepoConfig = serde_saphyr::from_str(yaml)
            .map_err(|err| FeastError::validation(format!("Invalid feature_store.yaml: {}", err)))?;
        if config.project.is_empty() {
            return Err(FeastError::validation("Project name must not be empty"));
        }
        if config.materialization.batch_size == 0 {
            return Err(FeastError::validation(
                "materialization.batch_size must be positive",
            ));
        }
        Ok(config)
    }

    pub fn with_repo_path(mut self, repo_path: impl Into<PathBuf>) -> Self {
        self.repo_path = Some(repo_path.into());
        self
    }

    /// Resolves a config-relative path (remote URLs are returned untouched).
    pub fn resolve_path(&self, path: &str) -> String {
        if path.contains("://") {
            return path.to_string();
        }
        let candidate = Path::new(path);
        match &self.repo_path {
            Some(base) if candidate.is_relative() => base.join(candidate).display().to_string(),
            _ => path.to_string(),
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    fn read_test_config(name: &str) -> Result<RepoConfig> {
        let project_dir = env!("CARGO_MANIFEST_DIR");
        let config_path = format!("{}/test_data/{}", project_dir, name);
        let yaml_str = fs::read_to_string(config_path)
            .map_err(|e| FeastError::backend("Failed to read test config", e))?;
        RepoConfig::from_yaml_str(&yaml_str)
    }

    #[test]
    fn parse_config_local_sqlite() -> Result<()> {
        let repo_config = read_test_config("local_sqlite.yaml")?;
        assert_eq!(repo_config.project, "local_sqlite");
        assert_eq!(repo_config.provider(), Provider::Local);
        let expected_registry = RegistryConfig {
            path: "data/registry.pb".to_string(),
            cache_ttl_seconds: None,
        };
        assert_eq!(repo_config.registry, expected_registry);
        let expected_online_store = OnlineStoreConfig::Sqlite {
            path: "data/online_store.db".to_string(),
        };
        assert_eq!(repo_config.online_store, expected_online_store);
        assert_eq!(
            repo_config.materialization.batch_size,
            DEFAULT_MATERIALIZATION_BATCH_SIZE
        );
        Ok(())
    }

    #[test]
    fn parse_config_memory_with_detailed_registry() -> Result<()> {
        let repo_config = read_test_config("local_memory.yaml")?;
        assert_eq!(repo_config.project, "local_memory");
        assert_eq!(repo_config.registry.path, "s3://feast-bucket/registry.pb");
        assert_eq!(repo_config.registry.cache_ttl_seconds, Some(60));
        assert_eq!(repo_config.online_store, OnlineStoreConfig::Memory);
        assert_eq!(repo_config.materialization.batch_size, 500);
        Ok(())
    }

    #[test]
    fn unknown_provider_is_kept_verbatim() -> Result<()> {
        let yaml = "project: p\nprovider: Azure\nregistry: data/registry.pb\n";
        let repo_config = RepoConfig::from_yaml_str(yaml)?;
        assert_eq!(
            repo_config.provider(),
            Provider::Unknown("Azure".to_string())
        );
        Ok(())
    }

    #[test]
    fn empty_config_is_rejected() {
        assert!(RepoConfig::from_yaml_str("  \n").unwrap_err().is_validation());
    }

    #[test]
    fn relative_paths_resolve_against_repo() -> Result<()> {
        let repo_config = RepoConfig::from_yaml_str("project: p\nregistry: data/registry.pb\n")?
            .with_repo_path("/tmp/repo");
        assert_eq!(
            repo_config.resolve_path("data/registry.pb"),
            "/tmp/repo/data/registry.pb"
        );
        assert_eq!(
            repo_config.resolve_path("/abs/registry.pb"),
            "/abs/registry.pb"
        );
        assert_eq!(
            repo_config.resolve_path("s3://bucket/registry.pb"),
            "s3://bucket/registry.pb"
        );
        Ok(())
    }
}
