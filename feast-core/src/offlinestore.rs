pub mod parquet_source;

use crate::config::RepoConfig;
use crate::error::Result;
use crate::model::{FeatureView, FileFormat, WriteRecord};
use crate::offlinestore::parquet_source::ParquetSource;
use chrono::{DateTime, Utc};

/// Blocking stream of write-record chunks pulled from a batch source.
pub type RecordChunks = Box<dyn Iterator<Item = Result<Vec<WriteRecord>>> + Send>;

/// Historical store the materializer reads from. Reads are blocking and must be driven
/// from a blocking thread.
pub trait OfflineStore: Send + Sync {
    /// Rows of `feature_view`'s batch source with `start <= event_ts < end`, converted to
    /// write records, at most `chunk_size` per chunk.
    fn pull_records(
        &self,
        feature_view: &FeatureView,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        chunk_size: usize,
    ) -> Result<RecordChunks>;
}

/// Batch sources stored as files, with paths relative to the feature repo.
pub struct FileOfflineStore {
    repo_config: RepoConfig,
}

impl FileOfflineStore {
    pub fn new(repo_config: RepoConfig) -> Self {
        Self { repo_config }
    }
}

impl OfflineStore for FileOfflineStore {
    fn pull_records(
        &self,
        feature_view: &FeatureView,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        chunk_size: usize,
    ) -> Result<RecordChunks> {
        let source = &feature_view.batch_source;
        match source.file_format {
            FileFormat::Parquet => {
                let path = self.repo_config.resolve_path(&source.path);
                let reader = ParquetSource::open(&path, feature_view, start, end, chunk_size)?;
                Ok(Box::new(reader))
            }
        }
    }
}
