mod memory_onlinestore;
pub mod sqlite_onlinestore;

pub use memory_onlinestore::MemoryOnlineStore;

use crate::config::{OnlineStoreConfig, RepoConfig};
use crate::error::Result;
use crate::model::{FeatureMap, RecordVersion, Value};
use crate::onlinestore::sqlite_onlinestore::{ConnectionOptions, SqliteOnlineStore};
use async_trait::async_trait;
use serde::Serialize;
use std::ops::AddAssign;
use std::sync::Arc;
use tracing::debug;

/// One candidate value for a (serialized entity key, feature) cell.
#[derive(Debug, Clone, PartialEq)]
pub struct OnlineStoreRow {
    pub entity_key: Vec<u8>,
    pub feature_name: String,
    pub value: Value,
    pub version: RecordVersion,
}

/// Outcome of a write: cells replaced and cells left alone because the stored version
/// was not older.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteSummary {
    pub written: usize,
    pub ignored: usize,
}

impl AddAssign for WriteSummary {
    fn add_assign(&mut self, other: Self) {
        self.written += other.written;
        self.ignored += other.ignored;
    }
}

/// Storage of the latest value per (project, view, entity key, feature).
///
/// `write_rows` must replace a stored cell only when the candidate version is strictly
/// greater, atomically per cell.
#[async_trait]
pub trait OnlineStore: Send + Sync + 'static {
    async fn write_rows(
        &self,
        project: &str,
        feature_view: &str,
        rows: Vec<OnlineStoreRow>,
    ) -> Result<WriteSummary>;

    /// One map per key, in the order of `entity_keys`; never-written keys map to nothing.
    async fn read_rows(
        &self,
        project: &str,
        feature_view: &str,
        entity_keys: &[Vec<u8>],
    ) -> Result<Vec<FeatureMap>>;

    async fn create_table(&self, project: &str, feature_view: &str) -> Result<()>;

    async fn drop_table(&self, project: &str, feature_view: &str) -> Result<()>;
}

/// Physical table of a (project, view) pair. The project length prefix keeps
/// `("a_b", "c")` and `("a", "b_c")` apart.
pub(crate) fn table_name(project: &str, feature_view: &str) -> String {
    format!("{}_{}_{}", project.len(), project, feature_view)
}

pub async fn get_online_store(repo_config: &RepoConfig) -> Result<Arc<dyn OnlineStore>> {
    match &repo_config.online_store {
        OnlineStoreConfig::Sqlite { path } => {
            let full_path = repo_config.resolve_path(path);
            debug!("Create SQLite online store with path: {}", full_path);
            SqliteOnlineStore::from_options(&full_path, ConnectionOptions::default())
                .await
                .map(|sqlite| Arc::new(sqlite) as Arc<dyn OnlineStore>)
        }
        OnlineStoreConfig::Memory => {
            debug!("Create in-memory online store");
            Ok(Arc::new(MemoryOnlineStore::default()))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{EntityKey, StoredValue};
    use chrono::{DateTime, TimeZone, Utc};

    pub(crate) fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 4, 12, hour, 0, 0).unwrap()
    }

    pub(crate) fn key(id: i64) -> Vec<u8> {
        EntityKey::single("driver_id", Value::Int64(id)).to_bytes()
    }

    pub(crate) fn row(
        id: i64,
        value: f64,
        event_ts: DateTime<Utc>,
        created_ts: Option<DateTime<Utc>>,
    ) -> OnlineStoreRow {
        OnlineStoreRow {
            entity_key: key(id),
            feature_name: "conv_rate".to_string(),
            value: Value::Double(value),
            version: RecordVersion::new(event_ts, created_ts),
        }
    }

    fn stored(map: &FeatureMap) -> Option<&StoredValue> {
        map.get("conv_rate")
    }

    /// Conflict-resolution behaviour every backend must share.
    pub(crate) async fn check_conflict_resolution(store: &dyn OnlineStore) -> anyhow::Result<()> {
        store.create_table("project", "stats").await?;

        let summary = store
            .write_rows("project", "stats", vec![row(1, 1.0, ts(10), None)])
            .await?;
        assert_eq!(summary, WriteSummary { written: 1, ignored: 0 });

        // Older event time loses even with a later created time.
        let summary = store
            .write_rows("project", "stats", vec![row(1, 2.0, ts(9), Some(ts(23)))])
            .await?;
        assert_eq!(summary, WriteSummary { written: 0, ignored: 1 });

        // Same event time, present created time wins over missing.
        store
            .write_rows("project", "stats", vec![row(1, 3.0, ts(10), Some(ts(11)))])
            .await?;
        // Exact same version is not strictly greater.
        let summary = store
            .write_rows("project", "stats", vec![row(1, 4.0, ts(10), Some(ts(11)))])
            .await?;
        assert_eq!(summary.ignored, 1);

        let maps = store
            .read_rows("project", "stats", &[key(1), key(2)])
            .await?;
        assert_eq!(maps.len(), 2);
        let value = stored(&maps[0]).map(|s| s.value.clone());
        assert_eq!(value, Some(Value::Double(3.0)));
        assert_eq!(
            stored(&maps[0]).map(|s| s.version),
            Some(RecordVersion::new(ts(10), Some(ts(11))))
        );
        assert!(maps[1].is_empty());
        Ok(())
    }

    /// Applying the same rows in any order leaves the same state.
    pub(crate) async fn check_order_independence(
        forward: &dyn OnlineStore,
        backward: &dyn OnlineStore,
    ) -> anyhow::Result<()> {
        let rows = vec![
            row(1, 1.0, ts(8), None),
            row(1, 2.0, ts(12), Some(ts(1))),
            row(1, 3.0, ts(12), None),
            row(2, 4.0, ts(3), Some(ts(4))),
            row(2, 5.0, ts(3), Some(ts(5))),
        ];
        let mut reversed = rows.clone();
        reversed.reverse();
        forward.write_rows("project", "stats", rows).await?;
        backward.write_rows("project", "stats", reversed).await?;
        let keys = [key(1), key(2)];
        let a = forward.read_rows("project", "stats", &keys).await?;
        let b = backward.read_rows("project", "stats", &keys).await?;
        assert_eq!(a, b);
        assert_eq!(stored(&a[0]).map(|s| s.value.clone()), Some(Value::Double(2.0)));
        assert_eq!(stored(&a[1]).map(|s| s.value.clone()), Some(Value::Double(5.0)));
        Ok(())
    }

    pub(crate) async fn check_drop_table(store: &dyn OnlineStore) -> anyhow::Result<()> {
        store
            .write_rows("project", "stats", vec![row(1, 1.0, ts(10), None)])
            .await?;
        store.drop_table("project", "stats").await?;
        store.drop_table("project", "stats").await?;
        let maps = store.read_rows("project", "stats", &[key(1)]).await?;
        assert!(maps[0].is_empty());
        Ok(())
    }

    /// Pairs whose joined names look alike must not share storage.
    pub(crate) async fn check_project_isolation(store: &dyn OnlineStore) -> anyhow::Result<()> {
        store.create_table("a_b", "c").await?;
        store.create_table("a", "b_c").await?;
        store
            .write_rows("a_b", "c", vec![row(1, 0.5, ts(10), None)])
            .await?;

        let maps = store.read_rows("a", "b_c", &[key(1)]).await?;
        assert!(maps[0].is_empty());

        store.drop_table("a", "b_c").await?;
        let maps = store.read_rows("a_b", "c", &[key(1)]).await?;
        assert_eq!(
            stored(&maps[0]).map(|s| s.value.clone()),
            Some(Value::Double(0.5))
        );
        Ok(())
    }

    #[test]
    fn table_names_do_not_collide() {
        assert_ne!(table_name("a_b", "c"), table_name("a", "b_c"));
        assert_eq!(table_name("project", "stats"), "7_project_stats");
    }
}
