use crate::feature_store::FeatureRef;
use crate::model::{FeatureMap, FeatureView, StoredValue, Value};
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeatureStatus {
    Present,
    NotFound,
    OutsideMaxAge,
}

/// One output column, one entry per requested entity row.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeatureResults {
    pub values: Vec<Option<Value>>,
    pub statuses: Vec<FeatureStatus>,
    pub event_timestamps: Vec<Option<DateTime<Utc>>>,
}

impl FeatureResults {
    fn push(&mut self, value: Option<Value>, status: FeatureStatus, ts: Option<DateTime<Utc>>) {
        self.values.push(value);
        self.statuses.push(status);
        self.event_timestamps.push(ts);
    }
}

/// Columns of an online lookup: echoed entity columns first, then one column per feature
/// reference in request order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OnlineResponse {
    pub feature_names: Vec<String>,
    pub results: Vec<FeatureResults>,
}

impl OnlineResponse {
    pub fn column(&self, name: &str) -> Option<&FeatureResults> {
        self.feature_names
            .iter()
            .position(|n| n == name)
            .map(|idx| &self.results[idx])
    }

    pub fn values(&self, name: &str) -> Option<&[Option<Value>]> {
        self.column(name).map(|c| c.values.as_slice())
    }
}

fn status_of(stored: &StoredValue, view: &FeatureView, now: DateTime<Utc>) -> FeatureStatus {
    if view.ttl > chrono::Duration::zero() && stored.version.event_ts + view.ttl < now {
        FeatureStatus::OutsideMaxAge
    } else {
        FeatureStatus::Present
    }
}

pub(crate) struct ResponseBuilder<'a> {
    pub feature_refs: &'a [FeatureRef],
    pub views: &'a BTreeMap<String, FeatureView>,
    pub entity_columns: BTreeMap<String, Vec<Value>>,
    /// Per view, the stored features of every entity row in row order.
    pub reads: FxHashMap<String, Vec<FeatureMap>>,
    pub now: DateTime<Utc>,
}

impl ResponseBuilder<'_> {
    pub(crate) fn build(self) -> OnlineResponse {
        let mut response = OnlineResponse::default();
        for (name, values) in self.entity_columns {
            let mut column = FeatureResults::default();
            for value in values {
                column.push(Some(value), FeatureStatus::Present, None);
            }
            response.feature_names.push(name);
            response.results.push(column);
        }
        let empty = Vec::new();
        for feature_ref in self.feature_refs {
            let Some(view) = self.views.get(&feature_ref.feature_view) else {
                continue;
            };
            let rows = self.reads.get(&feature_ref.feature_view).unwrap_or(&empty);
            let mut column = FeatureResults::default();
            for features in rows {
                match features.get(&feature_ref.feature) {
                    Some(stored) => column.push(
                        Some(stored.value.clone()),
                        status_of(stored, view, self.now),
                        Some(stored.version.event_ts),
                    ),
                    None => column.push(None, FeatureStatus::NotFound, None),
                }
            }
            response.feature_names.push(feature_ref.to_string());
            response.results.push(column);
        }
        response
    }
}
