use crate::config::{Provider, RegistryConfig, RepoConfig};
use crate::error::{FeastError, Result};
use crate::registry::file_registry::FileRegistryStore;
use crate::registry::s3_registry::S3RegistryStore;
use crate::registry::snapshot::RegistrySnapshot;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Persistence of the whole registry snapshot at one location.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Loads the stored snapshot, or an empty one at version 0 when nothing is stored yet.
    async fn load(&self) -> Result<RegistrySnapshot>;

    /// Replaces the stored snapshot. Fails with `StaleRegistry` when the stored version is
    /// not `expected_version`.
    async fn save(&self, snapshot: &RegistrySnapshot, expected_version: u64) -> Result<()>;

    /// Removes the stored snapshot. Removing a missing snapshot succeeds.
    async fn teardown(&self) -> Result<()>;

    fn location(&self) -> &str;
}

pub(crate) fn stale(location: &str, expected: u64, found: u64) -> FeastError {
    FeastError::StaleRegistry {
        location: location.to_string(),
        expected,
        found,
    }
}

fn get_provider(path: &str) -> Provider {
    if path.starts_with("s3://") {
        Provider::AWS
    } else if path.starts_with("gs://") {
        Provider::GCP
    } else {
        Provider::Local
    }
}

pub async fn get_registry_store(
    conf: &RegistryConfig,
    repo_config: &RepoConfig,
) -> Result<Arc<dyn RegistryStore>> {
    match get_provider(conf.path.as_str()) {
        Provider::Local => {
            let path = repo_config.resolve_path(&conf.path);
            debug!("Using local registry store at {}", path);
            Ok(Arc::new(FileRegistryStore::new(path)))
        }
        Provider::AWS => {
            debug!("Using S3 registry store at {}", conf.path);
            Ok(Arc::new(S3RegistryStore::from_url(&conf.path).await?))
        }
        other => Err(FeastError::validation(format!(
            "Unsupported registry location {} for provider {:?}",
            conf.path, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_follows_url_scheme() {
        assert_eq!(get_provider("s3://bucket/registry.pb"), Provider::AWS);
        assert_eq!(get_provider("gs://bucket/registry.pb"), Provider::GCP);
        assert_eq!(get_provider("data/registry.pb"), Provider::Local);
    }

    #[tokio::test]
    async fn gcs_registry_is_rejected() -> anyhow::Result<()> {
        let repo_config = RepoConfig::from_yaml_str("project: p\nregistry: gs://b/registry.pb\n")?;
        let result = get_registry_store(&repo_config.registry, &repo_config).await;
        assert!(matches!(result, Err(FeastError::Validation(_))));
        Ok(())
    }
}
