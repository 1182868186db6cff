use crate::error::{BackendContext, FeastError, Result};
use crate::model::{FeatureView, Labels, WriteRecord};
use crate::provider::{Progress, Provider};
use crate::registry::Registry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Chunks buffered between the batch-source reader and the online writer.
const CHANNEL_CAPACITY: usize = 2;

/// Called with a view name and the cumulative number of records written for it.
pub type ViewProgress = Arc<dyn Fn(&str, usize) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaterializeStats {
    pub rows_read: usize,
    pub written: usize,
    pub ignored: usize,
}

/// Outcome of one view. A failed view does not affect the others.
#[derive(Debug)]
pub struct ViewMaterialization {
    pub feature_view: String,
    pub result: Result<MaterializeStats>,
}

pub struct Materializer {
    registry: Arc<Registry>,
    provider: Arc<dyn Provider>,
    project: String,
    batch_size: usize,
}

impl Materializer {
    pub fn new(
        registry: Arc<Registry>,
        provider: Arc<dyn Provider>,
        project: impl Into<String>,
        batch_size: usize,
    ) -> Self {
        Self {
            registry,
            provider,
            project: project.into(),
            batch_size: batch_size.max(1),
        }
    }

    async fn target_views(&self, views: Option<&[String]>) -> Result<Vec<FeatureView>> {
        match views {
            None => {
                self.registry
                    .list_feature_views(&self.project, &Labels::new())
                    .await
            }
            Some(names) => {
                let mut targets: Vec<FeatureView> = Vec::with_capacity(names.len());
                for name in names {
                    if targets.iter().any(|view| &view.name == name) {
                        continue;
                    }
                    targets.push(self.registry.get_feature_view(name, &self.project).await?);
                }
                Ok(targets)
            }
        }
    }

    /// Loads `[start, end)` of every targeted view (all views of the project when `views`
    /// is `None`) into the online store. Views run concurrently; the result lists one
    /// outcome per view in target order.
    pub async fn materialize(
        &self,
        views: Option<&[String]>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        progress: Option<ViewProgress>,
    ) -> Result<Vec<ViewMaterialization>> {
        if start >= end {
            return Err(FeastError::validation(format!(
                "Materialization start {} must be before end {}",
                start, end
            )));
        }
        let targets = self.target_views(views).await?;
        info!(
            "Materializing {} feature views of project {} from {} to {}",
            targets.len(),
            self.project,
            start,
            end
        );

        let mut join_set = JoinSet::new();
        for (index, view) in targets.into_iter().enumerate() {
            let task = ViewTask {
                registry: self.registry.clone(),
                provider: self.provider.clone(),
                project: self.project.clone(),
                batch_size: self.batch_size,
                progress: progress.clone(),
                start,
                end,
            };
            join_set.spawn(async move {
                let name = view.name.clone();
                // A panicking view becomes that view's failure.
                let result = tokio::spawn(task.run(view))
                    .await
                    .with_backend(|| format!("Materialization task of {} failed", name))
                    .and_then(|result| result);
                (index, ViewMaterialization {
                    feature_view: name,
                    result,
                })
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            let (index, outcome) = joined.backend("Materialization task failed")?;
            match &outcome.result {
                Ok(stats) => info!(
                    "Materialized {}: {} rows read, {} written, {} ignored",
                    outcome.feature_view, stats.rows_read, stats.written, stats.ignored
                ),
                Err(err) => warn!("Materialization of {} failed: {}", outcome.feature_view, err),
            }
            outcomes.push((index, outcome));
        }
        outcomes.sort_by_key(|(index, _)| *index);
        Ok(outcomes.into_iter().map(|(_, outcome)| outcome).collect())
    }
}

struct ViewTask {
    registry: Arc<Registry>,
    provider: Arc<dyn Provider>,
    project: String,
    batch_size: usize,
    progress: Option<ViewProgress>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl ViewTask {
    async fn run(self, view: FeatureView) -> Result<MaterializeStats> {
        let entities = self
            .registry
            .get_feature_view_entities(&view, &self.project)
            .await?;
        let (tx, mut rx) = mpsc::channel::<Result<Vec<WriteRecord>>>(CHANNEL_CAPACITY);
        let reader = {
            let provider = self.provider.clone();
            let view = view.clone();
            let (start, end, batch_size) = (self.start, self.end, self.batch_size);
            tokio::task::spawn_blocking(move || {
                let chunks =
                    match provider.materialize_single_feature_view(&view, start, end, batch_size) {
                        Ok(chunks) => chunks,
                        Err(err) => {
                            let _ = tx.blocking_send(Err(err));
                            return;
                        }
                    };
                for chunk in chunks {
                    let failed = chunk.is_err();
                    // A closed channel means the writer gave up on this view.
                    if tx.blocking_send(chunk).is_err() || failed {
                        break;
                    }
                }
            })
        };

        if let Some(progress) = &self.progress {
            progress(&view.name, 0);
        }
        let mut stats = MaterializeStats::default();
        while let Some(chunk) = rx.recv().await {
            let records = chunk?;
            let base = stats.rows_read;
            stats.rows_read += records.len();
            debug!("Writing {} records of {}", records.len(), view.name);
            let chunk_progress = |n: usize| {
                if let Some(progress) = &self.progress {
                    progress(&view.name, base + n);
                }
            };
            let chunk_progress: Progress<'_> = &chunk_progress;
            let summary = self
                .provider
                .online_write_batch(&self.project, &view, &entities, records, Some(chunk_progress))
                .await?;
            stats.written += summary.written;
            stats.ignored += summary.ignored;
        }
        reader.await.backend("Batch source reader failed")?;

        self.registry
            .record_materialization(&self.project, &view.name, self.start, self.end)
            .await?;
        Ok(stats)
    }
}
