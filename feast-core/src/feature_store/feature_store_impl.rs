use crate::config::RepoConfig;
use crate::error::{FeastError, Result};
use crate::feature_store::response_builder::ResponseBuilder;
use crate::feature_store::{EntityRow, FeatureRef, OnlineResponse};
use crate::materializer::{Materializer, ViewMaterialization, ViewProgress};
use crate::model::{
    Entity, EntityKey, FeatureMap, FeatureView, Labels, RegistryObject, Value, WriteRecord,
};
use crate::onlinestore::WriteSummary;
use crate::provider::{Provider, get_provider};
use crate::registry::{ApplyReport, Registry, get_registry_store};
use crate::util::now;
use chrono::{DateTime, Utc};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info};

pub struct FeatureStore {
    config: RepoConfig,
    registry: Arc<Registry>,
    provider: Arc<dyn Provider>,
}

impl FeatureStore {
    pub fn new(config: RepoConfig, registry: Arc<Registry>, provider: Arc<dyn Provider>) -> Self {
        Self {
            config,
            registry,
            provider,
        }
    }

    /// Builds the registry and provider described by `config`.
    pub async fn from_repo_config(config: RepoConfig) -> Result<Self> {
        let store = get_registry_store(&config.registry, &config).await?;
        let registry = Arc::new(Registry::new(store, config.registry.cache_ttl_seconds));
        let provider = get_provider(&config).await?;
        debug!(
            "Feature store for project {} uses registry {}",
            config.project,
            registry.location()
        );
        Ok(Self::new(config, registry, provider))
    }

    pub fn project(&self) -> &str {
        &self.config.project
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Registers `objects` and prepares online storage for the applied views.
    pub async fn apply(&self, objects: Vec<RegistryObject>) -> Result<ApplyReport> {
        let views = feature_views_of(&objects);
        let report = self.registry.apply(objects, self.project()).await?;
        self.provider
            .update_infra(self.project(), &[], &views)
            .await?;
        Ok(report)
    }

    /// Makes the project hold exactly `objects`, dropping online storage of removed views.
    pub async fn apply_total(&self, objects: Vec<RegistryObject>) -> Result<ApplyReport> {
        let stored = self
            .registry
            .list_feature_views(self.project(), &Labels::new())
            .await?;
        let views = feature_views_of(&objects);
        let report = self.registry.apply_total(objects, self.project()).await?;
        let deleted: HashSet<&str> = report.deleted_feature_views().collect();
        let to_delete: Vec<FeatureView> = stored
            .into_iter()
            .filter(|view| deleted.contains(view.name.as_str()))
            .collect();
        self.provider
            .update_infra(self.project(), &to_delete, &views)
            .await?;
        Ok(report)
    }

    pub async fn get_entity(&self, name: &str) -> Result<Entity> {
        self.registry.get_entity(name, self.project()).await
    }

    pub async fn get_feature_view(&self, name: &str) -> Result<FeatureView> {
        self.registry.get_feature_view(name, self.project()).await
    }

    pub async fn list_entities(&self, labels: &Labels) -> Result<Vec<Entity>> {
        self.registry.list_entities(self.project(), labels).await
    }

    pub async fn list_feature_views(&self, labels: &Labels) -> Result<Vec<FeatureView>> {
        self.registry
            .list_feature_views(self.project(), labels)
            .await
    }

    pub async fn delete_feature_view(&self, name: &str) -> Result<()> {
        let view = self.get_feature_view(name).await?;
        self.registry
            .delete_feature_view(name, self.project())
            .await?;
        self.provider
            .teardown_infra(self.project(), &[view])
            .await
    }

    /// Pushes `records` for the named view through the online write path.
    pub async fn write_to_online_store(
        &self,
        feature_view: &str,
        records: Vec<WriteRecord>,
    ) -> Result<WriteSummary> {
        let view = self.get_feature_view(feature_view).await?;
        let entities = self
            .registry
            .get_feature_view_entities(&view, self.project())
            .await?;
        self.provider
            .online_write_batch(self.project(), &view, &entities, records, None)
            .await
    }

    pub async fn materialize(
        &self,
        views: Option<&[String]>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        progress: Option<ViewProgress>,
    ) -> Result<Vec<ViewMaterialization>> {
        Materializer::new(
            self.registry.clone(),
            self.provider.clone(),
            self.project(),
            self.config.materialization.batch_size,
        )
        .materialize(views, start, end, progress)
        .await
    }

    /// Drops online storage of every view the registry knows, in every project, then the
    /// registry itself.
    pub async fn teardown(&self) -> Result<()> {
        let snapshot = self.registry.snapshot().await?;
        for (project, state) in &snapshot.projects {
            let views: Vec<FeatureView> = state.feature_views.values().cloned().collect();
            self.provider.teardown_infra(project, &views).await?;
            debug!("Dropped {} feature views of project {}", views.len(), project);
        }
        self.registry.teardown().await?;
        info!("Tore down registry {}", self.registry.location());
        Ok(())
    }

    /// Latest stored values of `feature_refs` for each entity row.
    ///
    /// All references and entity values are checked before any online read is issued.
    pub async fn get_online_features<S: AsRef<str>>(
        &self,
        feature_refs: &[S],
        entity_rows: &[EntityRow],
    ) -> Result<OnlineResponse> {
        let mut refs: Vec<FeatureRef> = Vec::with_capacity(feature_refs.len());
        for reference in feature_refs {
            let parsed = FeatureRef::parse(reference.as_ref())?;
            if !refs.contains(&parsed) {
                refs.push(parsed);
            }
        }
        if refs.is_empty() {
            return Err(FeastError::validation("No feature references were requested"));
        }

        let snapshot = self.registry.snapshot().await?;
        let project = self.project();
        let state = snapshot
            .project(project)
            .ok_or_else(|| FeastError::project_not_found(project))?;

        let mut views: BTreeMap<String, FeatureView> = BTreeMap::new();
        for feature_ref in &refs {
            let view = state
                .feature_views
                .get(&feature_ref.feature_view)
                .ok_or_else(|| FeastError::feature_view_not_found(&feature_ref.feature_view, project))?;
            if view.feature(&feature_ref.feature).is_none() {
                return Err(FeastError::validation(format!(
                    "Feature '{}' is not declared by feature view '{}'",
                    feature_ref.feature, view.name
                )));
            }
            views
                .entry(view.name.clone())
                .or_insert_with(|| view.clone());
        }

        let entity_columns = entity_columns(entity_rows)?;
        let mut keys_per_view: HashMap<String, Vec<EntityKey>> = HashMap::default();
        for view in views.values() {
            let mut keys = Vec::with_capacity(entity_rows.len());
            for (row_index, row) in entity_rows.iter().enumerate() {
                let mut pairs = Vec::with_capacity(view.entities.len());
                for entity_name in &view.entities {
                    let entity = state
                        .entities
                        .get(entity_name)
                        .ok_or_else(|| FeastError::entity_not_found(entity_name, project))?;
                    let value = row.get(entity_name).ok_or_else(|| {
                        FeastError::validation(format!(
                            "Entity row {} is missing entity '{}' required by feature view '{}'",
                            row_index, entity_name, view.name
                        ))
                    })?;
                    check_entity_value(entity, value, row_index)?;
                    pairs.push((entity_name.clone(), value.clone()));
                }
                keys.push(EntityKey::new(pairs)?);
            }
            keys_per_view.insert(view.name.clone(), keys);
        }

        let mut join_set = JoinSet::new();
        for view in views.values() {
            let keys = keys_per_view.remove(&view.name).unwrap_or_default();
            let provider = self.provider.clone();
            let project = project.to_string();
            let view = view.clone();
            join_set.spawn(async move {
                let rows = provider.online_read(&project, &view, &keys).await?;
                let maps: Vec<FeatureMap> = rows.into_iter().map(|(_, map)| map).collect();
                Ok::<_, FeastError>((view.name, maps))
            });
        }

        let mut reads: HashMap<String, Vec<FeatureMap>> = HashMap::default();
        while let Some(joined) = join_set.join_next().await {
            let (name, maps) = joined
                .map_err(|err| FeastError::backend("Online read task failed", err))??;
            reads.insert(name, maps);
        }

        Ok(ResponseBuilder {
            feature_refs: &refs,
            views: &views,
            entity_columns,
            reads,
            now: now(),
        }
        .build())
    }
}

fn feature_views_of(objects: &[RegistryObject]) -> Vec<FeatureView> {
    objects
        .iter()
        .filter_map(|object| match object {
            RegistryObject::FeatureView(view) => Some(view.clone()),
            RegistryObject::Entity(_) => None,
        })
        .collect()
}

/// Every row must carry the same entity columns; they are echoed back in the response.
fn entity_columns(entity_rows: &[EntityRow]) -> Result<BTreeMap<String, Vec<Value>>> {
    let Some(first) = entity_rows.first() else {
        return Ok(BTreeMap::new());
    };
    let mut columns: BTreeMap<String, Vec<Value>> = first
        .keys()
        .map(|name| (name.clone(), Vec::with_capacity(entity_rows.len())))
        .collect();
    for (row_index, row) in entity_rows.iter().enumerate() {
        if row.len() != columns.len() || !row.keys().all(|name| columns.contains_key(name)) {
            return Err(FeastError::validation(format!(
                "Entity row {} has columns [{}], expected [{}]",
                row_index,
                row.keys().cloned().collect::<Vec<_>>().join(", "),
                columns.keys().cloned().collect::<Vec<_>>().join(", ")
            )));
        }
        for (name, value) in row {
            if let Some(column) = columns.get_mut(name) {
                column.push(value.clone());
            }
        }
    }
    Ok(columns)
}

fn check_entity_value(entity: &Entity, value: &Value, row_index: usize) -> Result<()> {
    if value.value_type() != entity.value_type {
        return Err(FeastError::validation(format!(
            "Entity '{}' in row {} expects {} but got {}",
            entity.name,
            row_index,
            entity.value_type,
            value.value_type()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OnlineStoreConfig, RegistryConfig};
    use crate::feature_store::FeatureStatus;
    use crate::model::{BatchSource, Feature, ValueType};
    use crate::offlinestore::RecordChunks;
    use crate::onlinestore::MemoryOnlineStore;
    use crate::provider::tests::NoOfflineStore;
    use crate::provider::{LocalProvider, Progress};
    use crate::registry::FileRegistryStore;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts reads going through the wrapped provider.
    struct CountingProvider {
        inner: LocalProvider,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl Provider for CountingProvider {
        async fn update_infra(
            &self,
            project: &str,
            views_to_delete: &[FeatureView],
            views_to_keep: &[FeatureView],
        ) -> crate::Result<()> {
            self.inner
                .update_infra(project, views_to_delete, views_to_keep)
                .await
        }

        async fn teardown_infra(&self, project: &str, views: &[FeatureView]) -> crate::Result<()> {
            self.inner.teardown_infra(project, views).await
        }

        async fn online_write_batch(
            &self,
            project: &str,
            feature_view: &FeatureView,
            entities: &[Entity],
            records: Vec<WriteRecord>,
            progress: Option<Progress<'_>>,
        ) -> crate::Result<WriteSummary> {
            self.inner
                .online_write_batch(project, feature_view, entities, records, progress)
                .await
        }

        async fn online_read(
            &self,
            project: &str,
            feature_view: &FeatureView,
            entity_keys: &[EntityKey],
        ) -> crate::Result<Vec<(EntityKey, FeatureMap)>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.online_read(project, feature_view, entity_keys).await
        }

        fn materialize_single_feature_view(
            &self,
            feature_view: &FeatureView,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
            chunk_size: usize,
        ) -> crate::Result<RecordChunks> {
            self.inner
                .materialize_single_feature_view(feature_view, start, end, chunk_size)
        }
    }

    fn repo_config(dir: &tempfile::TempDir) -> RepoConfig {
        RepoConfig {
            project: "test".to_string(),
            project_description: None,
            provider: None,
            registry: RegistryConfig {
                path: "registry.pb".to_string(),
                cache_ttl_seconds: None,
            },
            online_store: OnlineStoreConfig::Memory,
            materialization: Default::default(),
            repo_path: None,
        }
        .with_repo_path(dir.path())
    }

    fn store_with(dir: &tempfile::TempDir) -> (FeatureStore, Arc<CountingProvider>) {
        let registry = Arc::new(Registry::new(
            Arc::new(FileRegistryStore::new(dir.path().join("registry.pb"))),
            None,
        ));
        let provider = Arc::new(CountingProvider {
            inner: LocalProvider::new(
                Arc::new(MemoryOnlineStore::default()),
                Arc::new(NoOfflineStore),
            ),
            reads: AtomicUsize::new(0),
        });
        let store = FeatureStore::new(repo_config(dir), registry, provider.clone());
        (store, provider)
    }

    fn driver() -> Entity {
        Entity::new("driver_id", ValueType::Int64)
    }

    fn driver_stats() -> FeatureView {
        FeatureView::new(
            "driver_hourly_stats",
            vec!["driver_id".to_string()],
            vec![
                Feature::new("conv_rate", ValueType::Double),
                Feature::new("avg_daily_trips", ValueType::Int64),
            ],
            BatchSource::parquet("data/driver_stats.parquet", "datetime"),
        )
    }

    fn stats_record(driver_id: i64, conv_rate: f64, trips: i64, event_ts: DateTime<Utc>) -> WriteRecord {
        WriteRecord {
            entity_key: EntityKey::single("driver_id", Value::Int64(driver_id)),
            values: BTreeMap::from([
                ("conv_rate".to_string(), Value::Double(conv_rate)),
                ("avg_daily_trips".to_string(), Value::Int64(trips)),
            ]),
            event_ts,
            created_ts: None,
        }
    }

    fn row(driver_id: i64) -> EntityRow {
        EntityRow::from([("driver_id".to_string(), Value::Int64(driver_id))])
    }

    async fn applied_store(dir: &tempfile::TempDir) -> Result<(FeatureStore, Arc<CountingProvider>)> {
        let (store, provider) = store_with(dir);
        store
            .apply(vec![driver().into(), driver_stats().into()])
            .await?;
        Ok((store, provider))
    }

    #[tokio::test]
    async fn online_features_follow_latest_write() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (store, provider) = applied_store(&dir).await?;
        let recent = now() - Duration::minutes(1);
        store
            .write_to_online_store(
                "driver_hourly_stats",
                vec![
                    stats_record(1001, 0.5, 10, recent - Duration::hours(1)),
                    stats_record(1001, 0.75, 12, recent),
                ],
            )
            .await?;

        let response = store
            .get_online_features(
                &[
                    "driver_hourly_stats:conv_rate",
                    "driver_hourly_stats:avg_daily_trips",
                    "driver_hourly_stats:conv_rate",
                ],
                &[row(1001), row(1002)],
            )
            .await?;
        assert_eq!(
            response.feature_names,
            vec![
                "driver_id",
                "driver_hourly_stats:conv_rate",
                "driver_hourly_stats:avg_daily_trips"
            ]
        );
        assert_eq!(
            response.values("driver_id").unwrap(),
            &[Some(Value::Int64(1001)), Some(Value::Int64(1002))]
        );
        let conv_rate = response.column("driver_hourly_stats:conv_rate").unwrap();
        assert_eq!(conv_rate.values, vec![Some(Value::Double(0.75)), None]);
        assert_eq!(
            conv_rate.statuses,
            vec![FeatureStatus::Present, FeatureStatus::NotFound]
        );
        assert_eq!(conv_rate.event_timestamps[0], Some(recent));
        assert_eq!(provider.reads.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn expired_values_are_flagged() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (store, _) = store_with(&dir);
        let view = driver_stats().with_ttl(Duration::hours(1));
        store.apply(vec![driver().into(), view.into()]).await?;
        store
            .write_to_online_store(
                "driver_hourly_stats",
                vec![stats_record(1001, 0.5, 10, now() - Duration::hours(3))],
            )
            .await?;
        let response = store
            .get_online_features(&["driver_hourly_stats:conv_rate"], &[row(1001)])
            .await?;
        let column = response.column("driver_hourly_stats:conv_rate").unwrap();
        assert_eq!(column.values, vec![Some(Value::Double(0.5))]);
        assert_eq!(column.statuses, vec![FeatureStatus::OutsideMaxAge]);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_requests_fail_before_reading() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (store, provider) = applied_store(&dir).await?;

        let err = store
            .get_online_features(
                &["driver_hourly_stats:conv_rate", "missing_view:conv_rate"],
                &[row(1001)],
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let err = store
            .get_online_features(&["driver_hourly_stats:speed"], &[row(1001)])
            .await
            .unwrap_err();
        assert!(err.is_validation());

        let wrong_type = EntityRow::from([("driver_id".to_string(), Value::String("1001".to_string()))]);
        let err = store
            .get_online_features(&["driver_hourly_stats:conv_rate"], &[row(1001), wrong_type])
            .await
            .unwrap_err();
        assert!(err.is_validation());

        let missing_entity = EntityRow::from([("rider_id".to_string(), Value::Int64(1))]);
        let err = store
            .get_online_features(&["driver_hourly_stats:conv_rate"], &[missing_entity])
            .await
            .unwrap_err();
        assert!(err.is_validation());

        let err = store
            .get_online_features(&["conv_rate"], &[row(1001)])
            .await
            .unwrap_err();
        assert!(err.is_validation());

        assert_eq!(provider.reads.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn mistyped_entity_key_is_not_written() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (store, _) = applied_store(&dir).await?;
        let mut record = stats_record(1001, 0.5, 10, now());
        record.entity_key = EntityKey::single("driver_id", Value::String("1001".to_string()));
        let err = store
            .write_to_online_store("driver_hourly_stats", vec![record])
            .await
            .unwrap_err();
        assert!(err.is_validation());

        let response = store
            .get_online_features(&["driver_hourly_stats:conv_rate"], &[row(1001)])
            .await?;
        assert_eq!(response.values("driver_hourly_stats:conv_rate").unwrap(), &[None]);
        Ok(())
    }

    #[tokio::test]
    async fn apply_total_drops_removed_views() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (store, _) = applied_store(&dir).await?;
        store
            .write_to_online_store("driver_hourly_stats", vec![stats_record(1001, 0.5, 10, now())])
            .await?;

        let report = store.apply_total(vec![driver().into()]).await?;
        assert_eq!(
            report.deleted_feature_views().collect::<Vec<_>>(),
            vec!["driver_hourly_stats"]
        );
        assert!(store.get_feature_view("driver_hourly_stats").await.unwrap_err().is_not_found());

        // Re-applying the view starts from empty storage.
        store.apply(vec![driver_stats().into()]).await?;
        let response = store
            .get_online_features(&["driver_hourly_stats:conv_rate"], &[row(1001)])
            .await?;
        assert_eq!(response.values("driver_hourly_stats:conv_rate").unwrap(), &[None]);
        Ok(())
    }

    #[tokio::test]
    async fn teardown_removes_registry() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (store, _) = applied_store(&dir).await?;
        store.teardown().await?;
        assert!(!dir.path().join("registry.pb").exists());
        assert!(store.list_feature_views(&Labels::new()).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn teardown_drops_storage_of_every_project() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (store, provider) = applied_store(&dir).await?;
        store
            .registry()
            .apply(vec![driver().into(), driver_stats().into()], "other")
            .await?;
        let record = stats_record(1001, 0.5, 10, now());
        store
            .write_to_online_store("driver_hourly_stats", vec![record.clone()])
            .await?;
        let view = driver_stats();
        provider
            .online_write_batch("other", &view, &[driver()], vec![record.clone()], None)
            .await?;

        store.teardown().await?;

        let key = record.entity_key;
        for project in ["test", "other"] {
            let read = provider.online_read(project, &view, &[key.clone()]).await?;
            assert!(read[0].1.is_empty(), "{} kept online rows", project);
        }
        Ok(())
    }
}
