//! Pipeline orchestration: Extract -> Validate -> Deduplicate -> Load
//!
//! A run walks the states below, timestamping each transition into its metrics.
//! Any stage error moves the run to `FAILED`; the partial metrics are still
//! finalized and persisted. Stages are never retried.
//!
//! ```text
//! CREATED -> EXTRACTING -> VALIDATING -> DEDUPLICATING -> LOADING -> SUCCEEDED
//!                 \______________\______________\_____________\____> FAILED
//! ```

use crate::dedup::{deduplicate, DedupStrategy};
use crate::error::{EtlError, Result};
use crate::load::{LoadStats, UpsertLoader};
use crate::metrics::{MetricsStore, PipelineMetrics, RunStatus};
use crate::model::Column;
use crate::source::{write_records_csv, RecordSource};
use crate::store::OperationStore;
use crate::validation::{ValidationOptions, Validator};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Created,
    Extracting,
    Validating,
    Deduplicating,
    Loading,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Created => "CREATED",
            RunState::Extracting => "EXTRACTING",
            RunState::Validating => "VALIDATING",
            RunState::Deduplicating => "DEDUPLICATING",
            RunState::Loading => "LOADING",
            RunState::Succeeded => "SUCCEEDED",
            RunState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed)
    }

    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Created, Extracting)
            | (Extracting, Validating)
            | (Validating, Deduplicating)
            | (Deduplicating, Loading)
            | (Loading, Succeeded) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `etl_<YYYYmmdd_HHMMSS>_<8 hex>`
pub fn new_pipeline_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "etl_{}_{}",
        chrono::Local::now().format("%Y%m%d_%H%M%S"),
        &suffix[..8]
    )
}

#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub strategy: DedupStrategy,
    pub validation: ValidationOptions,
    /// Where `deduped_<pipeline_id>.csv` is written; skipped when unset
    pub processed_dir: Option<PathBuf>,
    pub conflict_key: Option<Column>,
}

/// Current state of one run, mirrored into its metrics
struct RunTracker {
    state: RunState,
}

impl RunTracker {
    fn start(metrics: &mut PipelineMetrics) -> Self {
        metrics.record_transition(RunState::Created);
        Self {
            state: RunState::Created,
        }
    }

    fn advance(&mut self, next: RunState, metrics: &mut PipelineMetrics) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(EtlError::IllegalTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        metrics.record_transition(next);
        Ok(())
    }
}

pub struct Pipeline {
    store: Arc<dyn OperationStore>,
    metrics_store: MetricsStore,
    validator: Validator,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn OperationStore>,
        metrics_store: MetricsStore,
        options: PipelineOptions,
    ) -> Result<Self> {
        options.strategy.check()?;
        Ok(Self {
            store,
            metrics_store,
            validator: Validator::new()?,
            options,
        })
    }

    pub fn metrics_store(&self) -> &MetricsStore {
        &self.metrics_store
    }

    /// Execute one run end to end.
    ///
    /// Stage failures are reported through the returned metrics (`status =
    /// failed`); the only error is failing to persist those metrics.
    #[tracing::instrument(skip_all, fields(source = %source.describe(), pipeline_id = tracing::field::Empty))]
    pub async fn run(&self, source: &dyn RecordSource) -> Result<PipelineMetrics> {
        let pipeline_id = new_pipeline_id();
        tracing::Span::current().record("pipeline_id", pipeline_id.as_str());

        let mut metrics = PipelineMetrics::new(&pipeline_id, source.describe());
        let mut tracker = RunTracker::start(&mut metrics);
        info!(strategy = %self.options.strategy, "pipeline_started");

        match self.execute(source, &pipeline_id, &mut tracker, &mut metrics).await {
            Ok(()) => {
                tracker.advance(RunState::Succeeded, &mut metrics)?;
                metrics.finalize(RunStatus::Success, None);
                info!(
                    input_rows = metrics.input_rows,
                    rows_loaded = metrics.rows_loaded,
                    rows_updated = metrics.rows_updated,
                    seconds = metrics.processing_time_seconds,
                    "pipeline_completed"
                );
            }
            Err(e) => {
                let failed_in = tracker.state;
                tracker.advance(RunState::Failed, &mut metrics)?;
                metrics.finalize(RunStatus::Failed, Some(e.to_string()));
                error!(stage = %failed_in, error = %e, "pipeline_failed");
            }
        }

        self.metrics_store.save(&metrics).await?;
        Ok(metrics)
    }

    async fn execute(
        &self,
        source: &dyn RecordSource,
        pipeline_id: &str,
        tracker: &mut RunTracker,
        metrics: &mut PipelineMetrics,
    ) -> Result<()> {
        tracker.advance(RunState::Extracting, metrics)?;
        let batch = source.extract().await?;
        metrics.input_rows = batch.len();
        info!(rows = batch.len(), "extraction_completed");

        tracker.advance(RunState::Validating, metrics)?;
        let (valid, report) = self.validator.validate(&batch, &self.options.validation)?;
        metrics.record_validation(&report);
        for warning in &report.warnings {
            warn!(message = %warning, "validation_warning");
        }
        info!(
            valid = report.valid_rows,
            invalid = report.invalid_rows,
            "validation_completed"
        );

        tracker.advance(RunState::Deduplicating, metrics)?;
        let (deduped, dedup_stats) = deduplicate(valid, &self.options.strategy)?;
        metrics.record_dedup(&dedup_stats);
        info!(
            strategy = %self.options.strategy,
            removed = dedup_stats.duplicates_removed,
            remaining = dedup_stats.final_count,
            "deduplication_completed"
        );

        if let Some(dir) = &self.options.processed_dir {
            let path = dir.join(format!("deduped_{pipeline_id}.csv"));
            write_records_csv(&path, &deduped)?;
            info!(path = %path.display(), "deduplicated_set_written");
        }

        tracker.advance(RunState::Loading, metrics)?;
        let mut loader = UpsertLoader::new(self.store.clone());
        if let Some(key) = self.options.conflict_key {
            loader = loader.with_conflict_key(key);
        }
        match loader.load(&deduped).await {
            Ok(stats) => {
                metrics.record_load(&stats);
                Ok(())
            }
            Err(e) => {
                let rows_failed = match &e {
                    EtlError::Load { rows_failed, .. } if *rows_failed > 0 => *rows_failed,
                    _ => deduped.len(),
                };
                metrics.record_load(&LoadStats::failed(rows_failed));
                Err(e)
            }
        }
    }
}

/// Runs several sources through one pipeline, at most `max_concurrent` at a time
pub struct BatchRunner {
    pipeline: Arc<Pipeline>,
    max_concurrent: usize,
}

impl BatchRunner {
    pub fn new(pipeline: Arc<Pipeline>, max_concurrent: usize) -> Self {
        Self {
            pipeline,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// One result per source, in input order
    pub async fn run_all(
        &self,
        sources: Vec<Arc<dyn RecordSource>>,
    ) -> Vec<Result<PipelineMetrics>> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));

        let handles: Vec<_> = sources
            .into_iter()
            .map(|source| {
                let pipeline = self.pipeline.clone();
                let semaphore = semaphore.clone();
                tokio::spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|e| EtlError::config(format!("run slots closed: {e}")))?;
                    pipeline.run(source.as_ref()).await
                })
            })
            .collect();

        futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|joined| {
                joined.unwrap_or_else(|e| Err(EtlError::metrics(format!("run task aborted: {e}"))))
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::test_support::record;
    use crate::source::RawBatch;
    use crate::store::SqliteStore;

    async fn pipeline(dir: &std::path::Path, strategy: DedupStrategy) -> (Arc<SqliteStore>, Pipeline) {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        store.migrate().await.unwrap();
        let options = PipelineOptions {
            strategy,
            processed_dir: Some(dir.join("processed")),
            ..Default::default()
        };
        let pipeline = Pipeline::new(store.clone(), MetricsStore::new(dir.join("metrics")), options).unwrap();
        (store, pipeline)
    }

    #[test]
    fn test_pipeline_id_format() {
        let id = new_pipeline_id();
        let parts: Vec<_> = id.split('_').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "etl");
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 6);
        assert_eq!(parts[3].len(), 8);
        assert_ne!(new_pipeline_id(), new_pipeline_id());
    }

    #[test]
    fn test_run_state_transitions() {
        assert!(RunState::Created.can_transition_to(RunState::Extracting));
        assert!(RunState::Loading.can_transition_to(RunState::Failed));
        assert!(!RunState::Created.can_transition_to(RunState::Loading));
        assert!(!RunState::Succeeded.can_transition_to(RunState::Failed));
    }

    #[tokio::test]
    async fn test_successful_run_records_every_stage() {
        let dir = tempfile::tempdir().unwrap();
        let (store, pipeline) = pipeline(dir.path(), DedupStrategy::Hash).await;

        let mut records: Vec<_> = (1..=5).map(|i| record(i, "10.00")).collect();
        records.push(records[0].clone());
        let metrics = pipeline.run(&RawBatch::from_records(&records)).await.unwrap();

        assert_eq!(metrics.status, RunStatus::Success);
        assert_eq!(metrics.input_rows, 6);
        assert_eq!(metrics.duplicates_removed, 1);
        assert_eq!(metrics.rows_loaded, 5);
        assert_eq!(store.count().await.unwrap(), 5);

        let states: Vec<_> = metrics.transitions.iter().map(|t| t.state).collect();
        assert_eq!(
            states,
            vec![
                RunState::Created,
                RunState::Extracting,
                RunState::Validating,
                RunState::Deduplicating,
                RunState::Loading,
                RunState::Succeeded,
            ]
        );

        let saved = pipeline
            .metrics_store()
            .load(&metrics.pipeline_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saved.status, RunStatus::Success);
        assert_eq!(saved.rows_loaded, 5);
        assert_eq!(saved.transitions.len(), 6);
        let csv = dir
            .path()
            .join("processed")
            .join(format!("deduped_{}.csv", metrics.pipeline_id));
        assert!(csv.exists());
    }

    #[tokio::test]
    async fn test_structural_error_fails_run() {
        let dir = tempfile::tempdir().unwrap();
        let (_, pipeline) = pipeline(dir.path(), DedupStrategy::Hash).await;

        let mut batch = RawBatch::new(vec!["numero_operacion".into()]);
        batch.push_row(["OP-00000001"]);
        let metrics = pipeline.run(&batch).await.unwrap();

        assert_eq!(metrics.status, RunStatus::Failed);
        assert!(metrics
            .error_message
            .as_deref()
            .unwrap()
            .contains("fecha_operacion"));
        assert_eq!(metrics.input_rows, 1);
        assert_eq!(metrics.transitions.last().unwrap().state, RunState::Failed);
    }

    #[tokio::test]
    async fn test_batch_runner_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let (store, pipeline) = pipeline(dir.path(), DedupStrategy::Hash).await;
        let runner = BatchRunner::new(Arc::new(pipeline), 2);

        let sources: Vec<Arc<dyn RecordSource>> = (0..4u32)
            .map(|n| {
                let records: Vec<_> = (1..=n + 1).map(|i| record(n * 10 + i, "5")).collect();
                Arc::new(RawBatch::from_records(&records)) as Arc<dyn RecordSource>
            })
            .collect();

        let results = runner.run_all(sources).await;
        let rows: Vec<_> = results
            .into_iter()
            .map(|r| r.unwrap().input_rows)
            .collect();
        assert_eq!(rows, vec![1, 2, 3, 4]);
        assert_eq!(store.count().await.unwrap(), 10);
    }
}
