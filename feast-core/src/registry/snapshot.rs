use crate::error::{FeastError, Result};
use crate::feast::core::{
    Entity as EntityProto, FeatureView as FeatureViewProto, Project as ProjectProto,
    Registry as RegistryProto,
};
use crate::model::{Entity, FeatureView};
use crate::util::{datetime_to_prost_timestamp, prost_timestamp_to_datetime};
use chrono::{DateTime, Utc};
use prost::Message;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProjectState {
    pub archived: bool,
    pub entities: BTreeMap<String, Entity>,
    pub feature_views: BTreeMap<String, FeatureView>,
}

/// The full persisted registry: every project with its objects, plus the version token
/// used to detect concurrent writers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistrySnapshot {
    pub projects: BTreeMap<String, ProjectState>,
    pub last_updated: Option<DateTime<Utc>>,
    pub version: u64,
}

impl RegistrySnapshot {
    pub fn project(&self, name: &str) -> Option<&ProjectState> {
        self.projects.get(name)
    }

    pub fn encode(&self) -> Vec<u8> {
        RegistryProto::from(self).encode_to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let proto = RegistryProto::decode(bytes)
            .map_err(|e| FeastError::backend("Failed to decode registry", e))?;
        RegistrySnapshot::try_from(proto)
    }
}

impl TryFrom<ProjectProto> for ProjectState {
    type Error = FeastError;

    fn try_from(project: ProjectProto) -> Result<Self> {
        let mut state = ProjectState {
            archived: project.archived,
            ..Default::default()
        };
        for entity_proto in project.entities {
            let entity = Entity::try_from(entity_proto)?;
            if state.entities.contains_key(&entity.name) {
                return Err(FeastError::validation(format!(
                    "Entity '{}' stored twice in project '{}'",
                    entity.name, project.name
                )));
            }
            state.entities.insert(entity.name.clone(), entity);
        }
        for view_proto in project.feature_views {
            let view = FeatureView::try_from(view_proto)?;
            if state.feature_views.contains_key(&view.name) {
                return Err(FeastError::validation(format!(
                    "Feature view '{}' stored twice in project '{}'",
                    view.name, project.name
                )));
            }
            state.feature_views.insert(view.name.clone(), view);
        }
        Ok(state)
    }
}

impl TryFrom<RegistryProto> for RegistrySnapshot {
    type Error = FeastError;

    fn try_from(proto: RegistryProto) -> Result<Self> {
        let mut projects = BTreeMap::new();
        for project in proto.projects {
            let name = project.name.clone();
            let state = ProjectState::try_from(project)?;
            if projects.insert(name.clone(), state).is_some() {
                return Err(FeastError::validation(format!(
                    "Project '{}' stored twice in registry",
                    name
                )));
            }
        }
        Ok(RegistrySnapshot {
            projects,
            last_updated: proto
                .last_updated
                .map(|ts| prost_timestamp_to_datetime(&ts)),
            version: proto.version,
        })
    }
}

impl From<&RegistrySnapshot> for RegistryProto {
    fn from(snapshot: &RegistrySnapshot) -> Self {
        RegistryProto {
            projects: snapshot
                .projects
                .iter()
                .map(|(name, state)| ProjectProto {
                    name: name.clone(),
                    archived: state.archived,
                    entities: state.entities.values().map(EntityProto::from).collect(),
                    feature_views: state
                        .feature_views
                        .values()
                        .map(FeatureViewProto::from)
                        .collect(),
                })
                .collect(),
            last_updated: snapshot
                .last_updated
                .as_ref()
                .map(datetime_to_prost_timestamp),
            version: snapshot.version,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{BatchSource, Feature, MaterializationInterval, ValueType};
    use chrono::{Duration, TimeZone};

    pub(crate) fn sample_snapshot() -> RegistrySnapshot {
        let ts = Utc.with_ymd_and_hms(2021, 4, 12, 10, 59, 42).unwrap();
        let mut entity = Entity::new("driver_id", ValueType::Int64)
            .with_description("driver id")
            .with_label("team", "matchmaking");
        entity.last_updated_timestamp = Some(ts);
        let mut view = FeatureView::new(
            "driver_hourly_stats",
            vec!["driver_id".to_string()],
            vec![
                Feature::new("conv_rate", ValueType::Double),
                Feature::new("trips", ValueType::Int64List),
            ],
            BatchSource::parquet("data/driver_stats.parquet", "event_timestamp")
                .with_created_timestamp_column("created"),
        )
        .with_ttl(Duration::days(1));
        view.created_timestamp = Some(ts);
        view.last_updated_timestamp = Some(ts);
        view.materialization_intervals.push(MaterializationInterval {
            start: ts - Duration::days(7),
            end: ts,
        });
        let mut default_project = ProjectState::default();
        default_project
            .entities
            .insert(entity.name.clone(), entity.clone());
        default_project
            .feature_views
            .insert(view.name.clone(), view);
        let mut archived = ProjectState {
            archived: true,
            ..Default::default()
        };
        archived.entities.insert(entity.name.clone(), entity);
        RegistrySnapshot {
            projects: BTreeMap::from([
                ("default".to_string(), default_project),
                ("old".to_string(), archived),
            ]),
            last_updated: Some(ts),
            version: 7,
        }
    }

    #[test]
    fn snapshot_round_trips_through_protobuf() -> Result<()> {
        let snapshot = sample_snapshot();
        let decoded = RegistrySnapshot::decode(&snapshot.encode())?;
        assert_eq!(decoded, snapshot);
        Ok(())
    }

    #[test]
    fn empty_bytes_decode_to_empty_snapshot() -> Result<()> {
        let decoded = RegistrySnapshot::decode(&[])?;
        assert_eq!(decoded, RegistrySnapshot::default());
        Ok(())
    }

    #[test]
    fn duplicate_projects_are_rejected() {
        let mut proto = RegistryProto::from(&sample_snapshot());
        let first = proto.projects[0].clone();
        proto.projects.push(first);
        assert!(RegistrySnapshot::try_from(proto).unwrap_err().is_validation());
    }
}
