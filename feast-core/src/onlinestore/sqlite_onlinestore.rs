use crate::error::{BackendContext, FeastError, Result};
use crate::model::{FeatureMap, RecordVersion, StoredValue, Value};
use crate::onlinestore::{OnlineStore, OnlineStoreRow, WriteSummary, table_name};
use async_trait::async_trait;
use chrono::Duration;
use rustc_hash::FxHashMap;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{FromRow, Pool, Row, Sqlite};
use std::path::Path;
use tracing::debug;

/// Bound parameters per `IN (...)` lookup, below SQLite's host parameter limit.
const READ_CHUNK: usize = 500;

pub struct ConnectionOptions {
    max_connections: u32,
    min_connections: u32,
    acquire_timeout: Duration,
    idle_timeout: Duration,
    busy_timeout: Duration,
    test_before_acquire: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_connections: 5,
            min_connections: 1,
            acquire_timeout: Duration::seconds(5),
            idle_timeout: Duration::seconds(600),
            busy_timeout: Duration::seconds(5),
            test_before_acquire: true,
        }
    }
}

#[derive(Debug)]
pub struct SqliteStoreRow {
    pub entity_key: Vec<u8>,
    pub feature_name: String,
    pub value: Vec<u8>,
    pub event_ts: i64,
    pub created_ts: i64,
}

impl SqliteStoreRow {
    fn into_stored_value(self, table: &str) -> Result<(Vec<u8>, String, StoredValue)> {
        let Self {
            entity_key,
            feature_name,
            value,
            event_ts,
            created_ts,
        } = self;
        let value = Value::from_bytes(&value).map_err(|e| {
            FeastError::backend(
                format!("Failed to decode value for {}:{}", table, feature_name),
                e,
            )
        })?;
        let stored = StoredValue {
            value,
            version: RecordVersion::from_nanos(event_ts, created_ts),
        };
        Ok((entity_key, feature_name, stored))
    }
}

impl FromRow<'_, SqliteRow> for SqliteStoreRow {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            entity_key: row.try_get("entity_key")?,
            feature_name: row.try_get("feature_name")?,
            value: row.try_get("value")?,
            event_ts: row.try_get("event_ts")?,
            created_ts: row.try_get("created_ts")?,
        })
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn is_missing_table(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.message().contains("no such table"))
}

pub struct SqliteOnlineStore {
    connection_pool: Pool<Sqlite>,
}

impl SqliteOnlineStore {
    pub async fn from_options(path: &str, connection_options: ConnectionOptions) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_backend(|| format!("Failed to create directory {}", parent.display()))?;
        }
        let to_std = |d: Duration| d.to_std().unwrap_or_else(|_| std::time::Duration::from_secs(0));
        let connect_options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(to_std(connection_options.busy_timeout));
        let pool = SqlitePoolOptions::new()
            .max_connections(connection_options.max_connections)
            .min_connections(connection_options.min_connections)
            .acquire_timeout(to_std(connection_options.acquire_timeout))
            .idle_timeout(to_std(connection_options.idle_timeout))
            .test_before_acquire(connection_options.test_before_acquire)
            .connect_with(connect_options)
            .await
            .with_backend(|| format!("Failed to open SQLite online store {}", path))?;
        Ok(Self {
            connection_pool: pool,
        })
    }

    async fn ensure_table(&self, table: &str) -> Result<()> {
        let query = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             entity_key BLOB NOT NULL, \
             feature_name TEXT NOT NULL, \
             value BLOB NOT NULL, \
             event_ts INTEGER NOT NULL, \
             created_ts INTEGER NOT NULL, \
             PRIMARY KEY (entity_key, feature_name))",
            quote_identifier(table)
        );
        sqlx::query(&query)
            .execute(&self.connection_pool)
            .await
            .with_backend(|| format!("Failed to create table {}", table))?;
        Ok(())
    }
}

#[async_trait]
impl OnlineStore for SqliteOnlineStore {
    async fn write_rows(
        &self,
        project: &str,
        feature_view: &str,
        rows: Vec<OnlineStoreRow>,
    ) -> Result<WriteSummary> {
        let table = table_name(project, feature_view);
        if rows.is_empty() {
            return Ok(WriteSummary::default());
        }
        self.ensure_table(&table).await?;
        let quoted = quote_identifier(&table);
        // The row-value comparison is the whole conflict policy: the stored cell changes
        // only when the incoming (event_ts, created_ts) is strictly greater.
        let query = format!(
            "INSERT INTO {t} (entity_key, feature_name, value, event_ts, created_ts) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(entity_key, feature_name) DO UPDATE SET \
             value = excluded.value, event_ts = excluded.event_ts, created_ts = excluded.created_ts \
             WHERE (excluded.event_ts, excluded.created_ts) > ({t}.event_ts, {t}.created_ts)",
            t = quoted
        );
        let mut tx = self
            .connection_pool
            .begin()
            .await
            .with_backend(|| format!("Failed to start write to {}", table))?;
        let mut summary = WriteSummary::default();
        for row in rows {
            let (event_ts, created_ts) = row.version.to_nanos()?;
            let result = sqlx::query(&query)
                .bind(row.entity_key)
                .bind(row.feature_name)
                .bind(row.value.to_bytes())
                .bind(event_ts)
                .bind(created_ts)
                .execute(&mut *tx)
                .await
                .with_backend(|| format!("Failed to write to {}", table))?;
            if result.rows_affected() > 0 {
                summary.written += 1;
            } else {
                summary.ignored += 1;
            }
        }
        tx.commit()
            .await
            .with_backend(|| format!("Failed to commit write to {}", table))?;
        debug!(
            "Wrote {} and ignored {} cells in {}",
            summary.written, summary.ignored, table
        );
        Ok(summary)
    }

    async fn read_rows(
        &self,
        project: &str,
        feature_view: &str,
        entity_keys: &[Vec<u8>],
    ) -> Result<Vec<FeatureMap>> {
        let table = table_name(project, feature_view);
        let mut found: FxHashMap<Vec<u8>, FeatureMap> = FxHashMap::default();
        for keys in entity_keys.chunks(READ_CHUNK) {
            let parameters = format!("?{}", ", ?".repeat(keys.len() - 1));
            let query = format!(
                "SELECT entity_key, feature_name, value, event_ts, created_ts \
                 FROM {} WHERE entity_key IN ({})",
                quote_identifier(&table),
                parameters
            );
            let mut sqlx_query = sqlx::query_as(&query);
            for key in keys {
                sqlx_query = sqlx_query.bind(key);
            }
            let rows: Vec<SqliteStoreRow> = match sqlx_query.fetch_all(&self.connection_pool).await
            {
                Ok(rows) => rows,
                Err(err) if is_missing_table(&err) => {
                    debug!("Table {} does not exist yet", table);
                    return Ok(vec![FeatureMap::new(); entity_keys.len()]);
                }
                Err(err) => {
                    return Err(err).with_backend(|| format!("Failed to read from {}", table));
                }
            };
            for row in rows {
                let (entity_key, feature_name, stored) = row.into_stored_value(&table)?;
                found
                    .entry(entity_key)
                    .or_default()
                    .insert(feature_name, stored);
            }
        }
        Ok(entity_keys
            .iter()
            .map(|key| found.get(key).cloned().unwrap_or_default())
            .collect())
    }

    async fn create_table(&self, project: &str, feature_view: &str) -> Result<()> {
        self.ensure_table(&table_name(project, feature_view)).await
    }

    async fn drop_table(&self, project: &str, feature_view: &str) -> Result<()> {
        let table = table_name(project, feature_view);
        let query = format!("DROP TABLE IF EXISTS {}", quote_identifier(&table));
        sqlx::query(&query)
            .execute(&self.connection_pool)
            .await
            .with_backend(|| format!("Failed to drop table {}", table))?;
        debug!("Dropped table {}", table);
        Ok(())
    }
}
