//! Data path between the registry-described views and their storage.

use crate::config::{Provider as ProviderKind, RepoConfig};
use crate::error::{FeastError, Result};
use crate::model::{Entity, EntityKey, FeatureMap, FeatureView, WriteRecord};
use crate::offlinestore::{FileOfflineStore, OfflineStore, RecordChunks};
use crate::onlinestore::{OnlineStore, OnlineStoreRow, WriteSummary, get_online_store};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Records handed to the online store per write call.
const WRITE_CHUNK: usize = 1_000;

/// Called with the cumulative number of records processed.
pub type Progress<'a> = &'a (dyn Fn(usize) + Send + Sync);

#[async_trait]
pub trait Provider: Send + Sync {
    /// Creates online storage for kept views and drops it for deleted ones.
    async fn update_infra(
        &self,
        project: &str,
        views_to_delete: &[FeatureView],
        views_to_keep: &[FeatureView],
    ) -> Result<()>;

    async fn teardown_infra(&self, project: &str, views: &[FeatureView]) -> Result<()>;

    /// Writes `records`; a stored cell is only replaced by a strictly newer version.
    ///
    /// `entities` are the registered entities of `feature_view`, used to type-check keys.
    async fn online_write_batch(
        &self,
        project: &str,
        feature_view: &FeatureView,
        entities: &[Entity],
        records: Vec<WriteRecord>,
        progress: Option<Progress<'_>>,
    ) -> Result<WriteSummary>;

    /// Stored features per key, in input order.
    async fn online_read(
        &self,
        project: &str,
        feature_view: &FeatureView,
        entity_keys: &[EntityKey],
    ) -> Result<Vec<(EntityKey, FeatureMap)>>;

    /// Blocking iterator over the view's batch-source rows in `[start, end)`.
    fn materialize_single_feature_view(
        &self,
        feature_view: &FeatureView,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        chunk_size: usize,
    ) -> Result<RecordChunks>;
}

/// Local online store backend plus file batch sources.
pub struct LocalProvider {
    online_store: Arc<dyn OnlineStore>,
    offline_store: Arc<dyn OfflineStore>,
}

impl LocalProvider {
    pub fn new(online_store: Arc<dyn OnlineStore>, offline_store: Arc<dyn OfflineStore>) -> Self {
        Self {
            online_store,
            offline_store,
        }
    }
}

pub async fn get_provider(repo_config: &RepoConfig) -> Result<Arc<dyn Provider>> {
    match repo_config.provider() {
        ProviderKind::Local => {
            debug!("Create local provider for project {}", repo_config.project);
            let online_store = get_online_store(repo_config).await?;
            let offline_store = Arc::new(FileOfflineStore::new(repo_config.clone()));
            Ok(Arc::new(LocalProvider::new(online_store, offline_store)))
        }
        other => Err(FeastError::validation(format!(
            "Unsupported provider: {:?}",
            other
        ))),
    }
}

fn check_record(feature_view: &FeatureView, entities: &[Entity], record: &WriteRecord) -> Result<()> {
    let key_names = record.entity_key.entity_names();
    let expected: BTreeSet<&str> = feature_view.entities.iter().map(String::as_str).collect();
    if key_names.len() != expected.len() || !key_names.iter().all(|n| expected.contains(n.as_str())) {
        return Err(FeastError::validation(format!(
            "Entity key [{}] does not match entities [{}] of feature view '{}'",
            key_names.join(", "),
            feature_view.entities.join(", "),
            feature_view.name
        )));
    }
    for (name, value) in key_names.iter().zip(record.entity_key.entity_values()) {
        let entity = entities
            .iter()
            .find(|entity| &entity.name == name)
            .ok_or_else(|| {
                FeastError::validation(format!(
                    "Entity '{}' of feature view '{}' has no registered type",
                    name, feature_view.name
                ))
            })?;
        if value.value_type() != entity.value_type {
            return Err(FeastError::validation(format!(
                "Entity '{}' of feature view '{}' expects {} but got {}",
                name,
                feature_view.name,
                entity.value_type,
                value.value_type()
            )));
        }
    }
    for (name, value) in &record.values {
        let feature = feature_view.feature(name).ok_or_else(|| {
            FeastError::validation(format!(
                "Feature '{}' is not declared by feature view '{}'",
                name, feature_view.name
            ))
        })?;
        if value.value_type() != feature.dtype {
            return Err(FeastError::validation(format!(
                "Feature '{}:{}' expects {} but got {}",
                feature_view.name,
                name,
                feature.dtype,
                value.value_type()
            )));
        }
    }
    Ok(())
}

fn to_rows(records: &[WriteRecord]) -> Vec<OnlineStoreRow> {
    let mut rows = Vec::new();
    for record in records {
        let entity_key = record.entity_key.to_bytes();
        let version = record.version();
        for (feature_name, value) in &record.values {
            rows.push(OnlineStoreRow {
                entity_key: entity_key.clone(),
                feature_name: feature_name.clone(),
                value: value.clone(),
                version,
            });
        }
    }
    rows
}

#[async_trait]
impl Provider for LocalProvider {
    async fn update_infra(
        &self,
        project: &str,
        views_to_delete: &[FeatureView],
        views_to_keep: &[FeatureView],
    ) -> Result<()> {
        for view in views_to_keep {
            self.online_store.create_table(project, &view.name).await?;
        }
        for view in views_to_delete {
            self.online_store.drop_table(project, &view.name).await?;
        }
        Ok(())
    }

    async fn teardown_infra(&self, project: &str, views: &[FeatureView]) -> Result<()> {
        for view in views {
            self.online_store.drop_table(project, &view.name).await?;
        }
        Ok(())
    }

    async fn online_write_batch(
        &self,
        project: &str,
        feature_view: &FeatureView,
        entities: &[Entity],
        records: Vec<WriteRecord>,
        progress: Option<Progress<'_>>,
    ) -> Result<WriteSummary> {
        for record in &records {
            check_record(feature_view, entities, record)?;
        }
        let mut summary = WriteSummary::default();
        if records.is_empty() {
            if let Some(progress) = progress {
                progress(0);
            }
            return Ok(summary);
        }
        let mut processed = 0;
        for chunk in records.chunks(WRITE_CHUNK) {
            summary += self
                .online_store
                .write_rows(project, &feature_view.name, to_rows(chunk))
                .await?;
            processed += chunk.len();
            if let Some(progress) = progress {
                progress(processed);
            }
        }
        Ok(summary)
    }

    async fn online_read(
        &self,
        project: &str,
        feature_view: &FeatureView,
        entity_keys: &[EntityKey],
    ) -> Result<Vec<(EntityKey, FeatureMap)>> {
        let serialized: Vec<Vec<u8>> = entity_keys.iter().map(EntityKey::to_bytes).collect();
        let maps = self
            .online_store
            .read_rows(project, &feature_view.name, &serialized)
            .await?;
        Ok(entity_keys.iter().cloned().zip(maps).collect())
    }

    fn materialize_single_feature_view(
        &self,
        feature_view: &FeatureView,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        chunk_size: usize,
    ) -> Result<RecordChunks> {
        self.offline_store
            .pull_records(feature_view, start, end, chunk_size)
    }
}
