//! Registry of entities and feature views, scoped by project.
//!
//! Every mutation loads the stored snapshot, applies the change in memory and writes the
//! snapshot back with the loaded version as the expected one. Reads may be served from a
//! cached snapshot for `cache_ttl_seconds`.

use crate::error::{FeastError, ObjectKind, Result};
use crate::model::{Entity, FeatureView, Labels, MaterializationInterval, RegistryObject, labels_match};
use crate::util::now;
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

pub mod file_registry;
mod registry_store;
mod s3_registry;
mod snapshot;

pub use file_registry::FileRegistryStore;
pub use registry_store::{RegistryStore, get_registry_store};
pub use s3_registry::S3RegistryStore;
pub use snapshot::{ProjectState, RegistrySnapshot};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ObjectRef {
    #[serde(serialize_with = "serialize_kind")]
    pub kind: ObjectKind,
    pub name: String,
}

fn serialize_kind<S: serde::Serializer>(
    kind: &ObjectKind,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(kind)
}

impl ObjectRef {
    fn entity(name: &str) -> Self {
        Self {
            kind: ObjectKind::Entity,
            name: name.to_string(),
        }
    }

    fn feature_view(name: &str) -> Self {
        Self {
            kind: ObjectKind::FeatureView,
            name: name.to_string(),
        }
    }
}

/// What an apply changed, per object.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ApplyReport {
    pub added: Vec<ObjectRef>,
    pub updated: Vec<ObjectRef>,
    pub unchanged: Vec<ObjectRef>,
    pub deleted: Vec<ObjectRef>,
}

impl ApplyReport {
    pub fn deleted_feature_views(&self) -> impl Iterator<Item = &str> {
        self.deleted
            .iter()
            .filter(|r| r.kind == ObjectKind::FeatureView)
            .map(|r| r.name.as_str())
    }

    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    fn record(&mut self, change: Change, object: ObjectRef) {
        match change {
            Change::Added => self.added.push(object),
            Change::Updated => self.updated.push(object),
            Change::Unchanged => self.unchanged.push(object),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectInfo {
    pub name: String,
    pub archived: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Added,
    Updated,
    Unchanged,
}

struct CachedSnapshot {
    snapshot: Arc<RegistrySnapshot>,
    loaded_at: Instant,
}

pub struct Registry {
    store: Arc<dyn RegistryStore>,
    cache: ArcSwapOption<CachedSnapshot>,
    cache_ttl: Option<Duration>,
    write_lock: Mutex<()>,
}

impl Registry {
    pub fn new(store: Arc<dyn RegistryStore>, cache_ttl_seconds: Option<u64>) -> Self {
        Self {
            store,
            cache: ArcSwapOption::empty(),
            cache_ttl: cache_ttl_seconds
                .filter(|ttl| *ttl > 0)
                .map(Duration::from_secs),
            write_lock: Mutex::new(()),
        }
    }

    pub fn location(&self) -> &str {
        self.store.location()
    }

    async fn read_snapshot(&self) -> Result<Arc<RegistrySnapshot>> {
        if let Some(ttl) = self.cache_ttl {
            if let Some(cached) = self.cache.load_full() {
                if cached.loaded_at.elapsed() < ttl {
                    return Ok(cached.snapshot.clone());
                }
            }
        }
        let snapshot = Arc::new(self.store.load().await?);
        self.refresh_cache(snapshot.clone());
        Ok(snapshot)
    }

    fn refresh_cache(&self, snapshot: Arc<RegistrySnapshot>) {
        if self.cache_ttl.is_some() {
            self.cache.store(Some(Arc::new(CachedSnapshot {
                snapshot,
                loaded_at: Instant::now(),
            })));
        }
    }

    /// Runs `mutation` against a freshly loaded snapshot and persists the result. Nothing is
    /// written when the mutation fails.
    async fn mutate<T, F>(&self, mutation: F) -> Result<T>
    where
        F: FnOnce(&mut RegistrySnapshot) -> Result<T>,
    {
        let _guard = self.write_lock.lock().await;
        let mut snapshot = self.store.load().await?;
        let expected_version = snapshot.version;
        let result = mutation(&mut snapshot)?;
        snapshot.version = expected_version + 1;
        snapshot.last_updated = Some(now());
        self.store.save(&snapshot, expected_version).await?;
        debug!(
            "Registry {} moved to version {}",
            self.store.location(),
            snapshot.version
        );
        self.refresh_cache(Arc::new(snapshot));
        Ok(result)
    }

    pub async fn snapshot(&self) -> Result<Arc<RegistrySnapshot>> {
        self.read_snapshot().await
    }

    /// Upserts `objects` into `project`, creating the project when needed.
    pub async fn apply(&self, objects: Vec<RegistryObject>, project: &str) -> Result<ApplyReport> {
        let report = self
            .mutate(|snapshot| {
                let state = writable_project(snapshot, project)?;
                let (entities, views) = split_objects(objects)?;
                check_references(project, &views, |name| {
                    entities.contains_key(name) || state.entities.contains_key(name)
                })?;
                let mut report = ApplyReport::default();
                upsert_all(state, entities, views, &mut report);
                Ok(report)
            })
            .await?;
        info!(
            "Applied to project {}: {} added, {} updated, {} unchanged",
            project,
            report.added.len(),
            report.updated.len(),
            report.unchanged.len()
        );
        Ok(report)
    }

    /// Makes `project` hold exactly `objects`: every desired object is upserted and every
    /// stored object missing from the desired set is deleted. Other projects are untouched.
    pub async fn apply_total(
        &self,
        objects: Vec<RegistryObject>,
        project: &str,
    ) -> Result<ApplyReport> {
        let report = self
            .mutate(|snapshot| {
                let state = writable_project(snapshot, project)?;
                let (entities, views) = split_objects(objects)?;
                check_references(project, &views, |name| entities.contains_key(name))?;
                let mut report = ApplyReport::default();
                let stale_views: Vec<String> = state
                    .feature_views
                    .keys()
                    .filter(|name| !views.contains_key(*name))
                    .cloned()
                    .collect();
                let stale_entities: Vec<String> = state
                    .entities
                    .keys()
                    .filter(|name| !entities.contains_key(*name))
                    .cloned()
                    .collect();
                for name in stale_views {
                    state.feature_views.remove(&name);
                    report.deleted.push(ObjectRef::feature_view(&name));
                }
                for name in stale_entities {
                    state.entities.remove(&name);
                    report.deleted.push(ObjectRef::entity(&name));
                }
                upsert_all(state, entities, views, &mut report);
                Ok(report)
            })
            .await?;
        info!(
            "Applied total state to project {}: {} added, {} updated, {} unchanged, {} deleted",
            project,
            report.added.len(),
            report.updated.len(),
            report.unchanged.len(),
            report.deleted.len()
        );
        Ok(report)
    }

    pub async fn get_entity(&self, name: &str, project: &str) -> Result<Entity> {
        let snapshot = self.read_snapshot().await?;
        snapshot
            .project(project)
            .and_then(|state| state.entities.get(name))
            .cloned()
            .ok_or_else(|| FeastError::entity_not_found(name, project))
    }

    pub async fn get_feature_view(&self, name: &str, project: &str) -> Result<FeatureView> {
        let snapshot = self.read_snapshot().await?;
        snapshot
            .project(project)
            .and_then(|state| state.feature_views.get(name))
            .cloned()
            .ok_or_else(|| FeastError::feature_view_not_found(name, project))
    }

    /// The registered entities keying `feature_view`, in the view's declared order.
    pub async fn get_feature_view_entities(
        &self,
        feature_view: &FeatureView,
        project: &str,
    ) -> Result<Vec<Entity>> {
        let snapshot = self.read_snapshot().await?;
        let state = snapshot
            .project(project)
            .ok_or_else(|| FeastError::project_not_found(project))?;
        feature_view
            .entities
            .iter()
            .map(|name| {
                state
                    .entities
                    .get(name)
                    .cloned()
                    .ok_or_else(|| FeastError::entity_not_found(name, project))
            })
            .collect()
    }

    /// Entities whose labels contain `labels`. An empty `project` lists every project.
    pub async fn list_entities(&self, project: &str, labels: &Labels) -> Result<Vec<Entity>> {
        let snapshot = self.read_snapshot().await?;
        Ok(projects_in_scope(&snapshot, project)
            .flat_map(|state| state.entities.values())
            .filter(|entity| labels_match(&entity.labels, labels))
            .cloned()
            .collect())
    }

    /// Feature views whose tags contain `labels`. An empty `project` lists every project.
    pub async fn list_feature_views(
        &self,
        project: &str,
        labels: &Labels,
    ) -> Result<Vec<FeatureView>> {
        let snapshot = self.read_snapshot().await?;
        Ok(projects_in_scope(&snapshot, project)
            .flat_map(|state| state.feature_views.values())
            .filter(|view| labels_match(&view.tags, labels))
            .cloned()
            .collect())
    }

    pub async fn delete_feature_view(&self, name: &str, project: &str) -> Result<()> {
        self.mutate(|snapshot| {
            let state = existing_project(snapshot, project)?;
            state
                .feature_views
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| FeastError::feature_view_not_found(name, project))
        })
        .await?;
        info!("Deleted feature view {} from project {}", name, project);
        Ok(())
    }

    pub async fn delete_entity(&self, name: &str, project: &str) -> Result<()> {
        self.mutate(|snapshot| {
            let state = existing_project(snapshot, project)?;
            if !state.entities.contains_key(name) {
                return Err(FeastError::entity_not_found(name, project));
            }
            if let Some(view) = state
                .feature_views
                .values()
                .find(|view| view.entities.iter().any(|e| e == name))
            {
                return Err(FeastError::validation(format!(
                    "Entity '{}' is still referenced by feature view '{}' in project '{}'",
                    name, view.name, project
                )));
            }
            state.entities.remove(name);
            Ok(())
        })
        .await?;
        info!("Deleted entity {} from project {}", name, project);
        Ok(())
    }

    pub async fn create_project(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(FeastError::validation("Project name must not be empty"));
        }
        self.mutate(|snapshot| {
            if snapshot.projects.contains_key(name) {
                return Err(FeastError::validation(format!(
                    "Project '{}' already exists",
                    name
                )));
            }
            snapshot
                .projects
                .insert(name.to_string(), ProjectState::default());
            Ok(())
        })
        .await?;
        info!("Created project {}", name);
        Ok(())
    }

    pub async fn archive_project(&self, name: &str) -> Result<()> {
        self.mutate(|snapshot| {
            let state = snapshot
                .projects
                .get_mut(name)
                .ok_or_else(|| FeastError::project_not_found(name))?;
            state.archived = true;
            Ok(())
        })
        .await?;
        info!("Archived project {}", name);
        Ok(())
    }

    pub async fn list_projects(&self) -> Result<Vec<ProjectInfo>> {
        let snapshot = self.read_snapshot().await?;
        Ok(snapshot
            .projects
            .iter()
            .map(|(name, state)| ProjectInfo {
                name: name.clone(),
                archived: state.archived,
            })
            .collect())
    }

    /// Appends `[start, end)` to the materialized intervals of a stored view.
    pub async fn record_materialization(
        &self,
        project: &str,
        view: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<()> {
        self.mutate(|snapshot| {
            let view_state = snapshot
                .projects
                .get_mut(project)
                .and_then(|state| state.feature_views.get_mut(view))
                .ok_or_else(|| FeastError::feature_view_not_found(view, project))?;
            view_state
                .materialization_intervals
                .push(MaterializationInterval { start, end });
            Ok(())
        })
        .await
    }

    /// Removes the stored registry.
    pub async fn teardown(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.store.teardown().await?;
        self.cache.store(None);
        Ok(())
    }
}

fn projects_in_scope<'a>(
    snapshot: &'a RegistrySnapshot,
    project: &'a str,
) -> impl Iterator<Item = &'a ProjectState> + 'a {
    snapshot
        .projects
        .iter()
        .filter(move |(name, _)| project.is_empty() || name.as_str() == project)
        .map(|(_, state)| state)
}

fn existing_project<'a>(
    snapshot: &'a mut RegistrySnapshot,
    project: &str,
) -> Result<&'a mut ProjectState> {
    let state = snapshot
        .projects
        .get_mut(project)
        .ok_or_else(|| FeastError::project_not_found(project))?;
    if state.archived {
        return Err(FeastError::validation(format!(
            "Project '{}' is archived",
            project
        )));
    }
    Ok(state)
}

fn writable_project<'a>(
    snapshot: &'a mut RegistrySnapshot,
    project: &str,
) -> Result<&'a mut ProjectState> {
    if project.is_empty() {
        return Err(FeastError::validation("Project name must not be empty"));
    }
    if !snapshot.projects.contains_key(project) {
        debug!("Creating project {} on apply", project);
        snapshot
            .projects
            .insert(project.to_string(), ProjectState::default());
    }
    existing_project(snapshot, project)
}

type SplitObjects = (BTreeMap<String, Entity>, BTreeMap<String, FeatureView>);

fn split_objects(objects: Vec<RegistryObject>) -> Result<SplitObjects> {
    let mut entities = BTreeMap::new();
    let mut views = BTreeMap::new();
    for object in objects {
        match object {
            RegistryObject::Entity(entity) => {
                if entity.name.is_empty() {
                    return Err(FeastError::validation("Entity without a name"));
                }
                if entity.value_type == crate::model::ValueType::Invalid {
                    return Err(FeastError::validation(format!(
                        "Entity '{}' has no value type",
                        entity.name
                    )));
                }
                if entities.contains_key(&entity.name) {
                    return Err(FeastError::validation(format!(
                        "Entity '{}' declared twice",
                        entity.name
                    )));
                }
                entities.insert(entity.name.clone(), entity);
            }
            RegistryObject::FeatureView(view) => {
                view.validate()?;
                if views.contains_key(&view.name) {
                    return Err(FeastError::validation(format!(
                        "Feature view '{}' declared twice",
                        view.name
                    )));
                }
                views.insert(view.name.clone(), view);
            }
        }
    }
    Ok((entities, views))
}

fn check_references<F>(
    project: &str,
    views: &BTreeMap<String, FeatureView>,
    entity_exists: F,
) -> Result<()>
where
    F: Fn(&str) -> bool,
{
    for view in views.values() {
        let mut seen = BTreeSet::new();
        for entity in &view.entities {
            if !seen.insert(entity.as_str()) {
                return Err(FeastError::validation(format!(
                    "Feature view '{}' references entity '{}' twice",
                    view.name, entity
                )));
            }
            if !entity_exists(entity) {
                return Err(FeastError::validation(format!(
                    "Feature view '{}' references unknown entity '{}' in project '{}'",
                    view.name, entity, project
                )));
            }
        }
    }
    Ok(())
}

fn upsert_all(
    state: &mut ProjectState,
    entities: BTreeMap<String, Entity>,
    views: BTreeMap<String, FeatureView>,
    report: &mut ApplyReport,
) {
    let ts = now();
    for (name, entity) in entities {
        let change = upsert_entity(state, entity, ts);
        report.record(change, ObjectRef::entity(&name));
    }
    for (name, view) in views {
        let change = upsert_feature_view(state, view, ts);
        report.record(change, ObjectRef::feature_view(&name));
    }
}

fn upsert_entity(state: &mut ProjectState, mut entity: Entity, ts: DateTime<Utc>) -> Change {
    let change = match state.entities.get(&entity.name) {
        Some(stored) if stored.same_definition(&entity) => return Change::Unchanged,
        Some(_) => Change::Updated,
        None => Change::Added,
    };
    entity.last_updated_timestamp = Some(ts);
    state.entities.insert(entity.name.clone(), entity);
    change
}

/// A changed definition keeps its creation time; materialized intervals only survive
/// while the definition is unchanged.
fn upsert_feature_view(state: &mut ProjectState, mut view: FeatureView, ts: DateTime<Utc>) -> Change {
    let change = match state.feature_views.get(&view.name) {
        Some(stored) if stored.same_definition(&view) => return Change::Unchanged,
        Some(stored) => {
            view.created_timestamp = stored.created_timestamp.or(Some(ts));
            Change::Updated
        }
        None => {
            view.created_timestamp = Some(ts);
            Change::Added
        }
    };
    view.last_updated_timestamp = Some(ts);
    view.materialization_intervals.clear();
    state.feature_views.insert(view.name.clone(), view);
    change
}
