use crate::error::{FeastError, Result};
use crate::model::{FeatureMap, StoredValue};
use crate::onlinestore::{OnlineStore, OnlineStoreRow, WriteSummary, table_name};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

type Table = FxHashMap<Vec<u8>, FeatureMap>;

/// Process-local online store. Compare-and-replace runs under the write lock.
#[derive(Default)]
pub struct MemoryOnlineStore {
    tables: RwLock<FxHashMap<String, Table>>,
}

impl MemoryOnlineStore {
    fn read_tables(&self) -> Result<RwLockReadGuard<'_, FxHashMap<String, Table>>> {
        self.tables
            .read()
            .map_err(|_| FeastError::backend("Online store lock poisoned", anyhow::anyhow!("poisoned")))
    }

    fn write_tables(&self) -> Result<RwLockWriteGuard<'_, FxHashMap<String, Table>>> {
        self.tables
            .write()
            .map_err(|_| FeastError::backend("Online store lock poisoned", anyhow::anyhow!("poisoned")))
    }
}

#[async_trait]
impl OnlineStore for MemoryOnlineStore {
    async fn write_rows(
        &self,
        project: &str,
        feature_view: &str,
        rows: Vec<OnlineStoreRow>,
    ) -> Result<WriteSummary> {
        let mut tables = self.write_tables()?;
        let table = tables.entry(table_name(project, feature_view)).or_default();
        let mut summary = WriteSummary::default();
        for row in rows {
            let features = table.entry(row.entity_key).or_default();
            let replace = features
                .get(&row.feature_name)
                .is_none_or(|stored| row.version.supersedes(&stored.version));
            if replace {
                features.insert(
                    row.feature_name,
                    StoredValue {
                        value: row.value,
                        version: row.version,
                    },
                );
                summary.written += 1;
            } else {
                summary.ignored += 1;
            }
        }
        Ok(summary)
    }

    async fn read_rows(
        &self,
        project: &str,
        feature_view: &str,
        entity_keys: &[Vec<u8>],
    ) -> Result<Vec<FeatureMap>> {
        let tables = self.read_tables()?;
        let table = tables.get(&table_name(project, feature_view));
        Ok(entity_keys
            .iter()
            .map(|key| {
                table
                    .and_then(|t| t.get(key))
                    .cloned()
                    .unwrap_or_default()
            })
            .collect())
    }

    async fn create_table(&self, project: &str, feature_view: &str) -> Result<()> {
        self.write_tables()?
            .entry(table_name(project, feature_view))
            .or_default();
        Ok(())
    }

    async fn drop_table(&self, project: &str, feature_view: &str) -> Result<()> {
        self.write_tables()?
            .remove(&table_name(project, feature_view));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onlinestore::tests::{
        check_conflict_resolution, check_drop_table, check_order_independence,
        check_project_isolation,
    };
    use anyhow::Result;

    #[tokio::test]
    async fn conflict_resolution() -> Result<()> {
        check_conflict_resolution(&MemoryOnlineStore::default()).await
    }

    #[tokio::test]
    async fn order_independence() -> Result<()> {
        check_order_independence(&MemoryOnlineStore::default(), &MemoryOnlineStore::default())
            .await
    }

    #[tokio::test]
    async fn drop_table() -> Result<()> {
        check_drop_table(&MemoryOnlineStore::default()).await
    }

    #[tokio::test]
    async fn projects_are_isolated() -> Result<()> {
        check_project_isolation(&MemoryOnlineStore::default()).await
    }
}
