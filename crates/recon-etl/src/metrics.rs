//! Run metrics and their JSON persistence
//!
//! Each pipeline run owns one [`PipelineMetrics`], filled in stage by stage and
//! finalized when the run ends. [`MetricsStore`] keeps one
//! `metrics_<pipeline_id>.json` document per run in a directory.

use crate::dedup::DedupStats;
use crate::error::{EtlError, Result};
use crate::load::LoadStats;
use crate::pipeline::RunState;
use crate::validation::{ValidationError, ValidationReport, MAX_REPORTED_ERRORS};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const FILE_PREFIX: &str = "metrics_";
const FILE_SUFFIX: &str = ".json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub state: RunState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineMetrics {
    pub pipeline_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub input_source: String,
    pub input_rows: usize,

    pub validation_passed: usize,
    pub validation_failed: usize,
    /// First errors of the validation report
    pub validation_errors: Vec<ValidationError>,
    #[serde(default)]
    pub validation_warnings: Vec<String>,

    pub duplicates_found: usize,
    pub duplicates_removed: usize,

    /// Rows inserted
    pub rows_loaded: usize,
    pub rows_updated: usize,
    pub load_failed: usize,

    pub processing_time_seconds: f64,
    pub status: RunStatus,
    pub error_message: Option<String>,
    #[serde(default)]
    pub transitions: Vec<StateTransition>,
}

impl PipelineMetrics {
    pub fn new(pipeline_id: impl Into<String>, input_source: impl Into<String>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            start_time: Utc::now(),
            end_time: None,
            input_source: input_source.into(),
            input_rows: 0,
            validation_passed: 0,
            validation_failed: 0,
            validation_errors: Vec::new(),
            validation_warnings: Vec::new(),
            duplicates_found: 0,
            duplicates_removed: 0,
            rows_loaded: 0,
            rows_updated: 0,
            load_failed: 0,
            processing_time_seconds: 0.0,
            status: RunStatus::Running,
            error_message: None,
            transitions: Vec::new(),
        }
    }

    pub fn record_transition(&mut self, state: RunState) {
        self.transitions.push(StateTransition {
            state,
            at: Utc::now(),
        });
    }

    pub fn record_validation(&mut self, report: &ValidationReport) {
        self.input_rows = report.total_rows;
        self.validation_passed = report.valid_rows;
        self.validation_failed = report.invalid_rows;
        self.validation_errors = report
            .errors
            .iter()
            .take(MAX_REPORTED_ERRORS)
            .cloned()
            .collect();
        self.validation_warnings = report.warnings.clone();
    }

    pub fn record_dedup(&mut self, stats: &DedupStats) {
        self.duplicates_found = stats.duplicates_found;
        self.duplicates_removed = stats.duplicates_removed;
    }

    pub fn record_load(&mut self, stats: &LoadStats) {
        self.rows_loaded = stats.rows_inserted;
        self.rows_updated = stats.rows_updated;
        self.load_failed = stats.rows_failed;
    }

    /// Close the run: set the outcome, end time and duration
    pub fn finalize(&mut self, status: RunStatus, error_message: Option<String>) {
        let end = Utc::now();
        self.status = status;
        self.error_message = error_message;
        self.end_time = Some(end);
        self.processing_time_seconds =
            (end - self.start_time).num_microseconds().unwrap_or(0) as f64 / 1_000_000.0;
    }

    /// Share of input rows that ended up written (inserted or updated)
    pub fn success_rate(&self) -> f64 {
        if self.input_rows == 0 {
            0.0
        } else {
            (self.rows_loaded + self.rows_updated) as f64 / self.input_rows as f64
        }
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            pipeline_id: self.pipeline_id.clone(),
            status: self.status,
            total_input: self.input_rows,
            total_loaded: self.rows_loaded + self.rows_updated,
            success_rate: self.success_rate(),
            duplicates_removed: self.duplicates_removed,
            validation_errors: self.validation_errors.len(),
            processing_time_seconds: self.processing_time_seconds,
        }
    }
}

/// Condensed view of one run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub pipeline_id: String,
    pub status: RunStatus,
    pub total_input: usize,
    pub total_loaded: usize,
    pub success_rate: f64,
    pub duplicates_removed: usize,
    pub validation_errors: usize,
    pub processing_time_seconds: f64,
}

/// Figures across every stored run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateStats {
    pub total_runs: usize,
    pub successful_runs: usize,
    pub success_rate: f64,
    pub total_rows_processed: usize,
    pub total_rows_loaded: usize,
    pub avg_processing_time_seconds: f64,
    pub last_run: Option<DateTime<Utc>>,
}

/// Directory of `metrics_<pipeline_id>.json` files
#[derive(Debug, Clone)]
pub struct MetricsStore {
    dir: PathBuf,
}

impl MetricsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File for `pipeline_id`; ids that could name a path outside `dir` are rejected
    fn path_for(&self, pipeline_id: &str) -> Result<PathBuf> {
        if pipeline_id.is_empty()
            || pipeline_id.contains("..")
            || pipeline_id.contains(['/', '\\', '\0'])
        {
            return Err(EtlError::metrics(format!(
                "invalid pipeline id '{pipeline_id}'"
            )));
        }
        Ok(self.dir.join(format!("{FILE_PREFIX}{pipeline_id}{FILE_SUFFIX}")))
    }

    /// Write atomically: a temp file in the same directory, then rename
    pub async fn save(&self, metrics: &PipelineMetrics) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            EtlError::metrics(format!("cannot create {}: {e}", self.dir.display()))
        })?;

        let path = self.path_for(&metrics.pipeline_id)?;
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(metrics)
            .map_err(|e| EtlError::metrics(format!("cannot serialize metrics: {e}")))?;

        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| EtlError::metrics(format!("cannot write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| EtlError::metrics(format!("cannot rename {}: {e}", tmp.display())))?;

        debug!(pipeline_id = %metrics.pipeline_id, path = %path.display(), "metrics_saved");
        Ok(path)
    }

    pub async fn load(&self, pipeline_id: &str) -> Result<Option<PipelineMetrics>> {
        let path = self.path_for(pipeline_id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Self::parse(&path, &bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EtlError::metrics(format!(
                "cannot read {}: {e}",
                path.display()
            ))),
        }
    }

    /// Every stored run, newest first. Unreadable files are skipped.
    pub async fn list(&self) -> Result<Vec<PipelineMetrics>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(EtlError::metrics(format!(
                    "cannot list {}: {e}",
                    self.dir.display()
                )))
            }
        };

        let mut runs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| EtlError::metrics(e.to_string()))?
        {
            let path = entry.path();
            let is_metrics = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(FILE_PREFIX) && n.ends_with(FILE_SUFFIX));
            if !is_metrics {
                continue;
            }

            let parsed = match tokio::fs::read(&path).await {
                Ok(bytes) => Self::parse(&path, &bytes),
                Err(e) => Err(EtlError::metrics(e.to_string())),
            };
            match parsed {
                Ok(metrics) => runs.push(metrics),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping_metrics_file"),
            }
        }

        runs.sort_by(|a, b| {
            b.start_time
                .cmp(&a.start_time)
                .then_with(|| b.pipeline_id.cmp(&a.pipeline_id))
        });
        Ok(runs)
    }

    pub async fn aggregate(&self) -> Result<AggregateStats> {
        let runs = self.list().await?;
        Ok(aggregate(&runs))
    }

    fn parse(path: &Path, bytes: &[u8]) -> Result<PipelineMetrics> {
        serde_json::from_slice(bytes)
            .map_err(|e| EtlError::metrics(format!("corrupt {}: {e}", path.display())))
    }
}

/// Aggregate runs ordered newest first
pub fn aggregate(runs: &[PipelineMetrics]) -> AggregateStats {
    if runs.is_empty() {
        return AggregateStats::default();
    }

    let total_runs = runs.len();
    let successful_runs = runs
        .iter()
        .filter(|m| m.status == RunStatus::Success)
        .count();

    AggregateStats {
        total_runs,
        successful_runs,
        success_rate: successful_runs as f64 / total_runs as f64,
        total_rows_processed: runs.iter().map(|m| m.input_rows).sum(),
        total_rows_loaded: runs.iter().map(|m| m.rows_loaded).sum(),
        avg_processing_time_seconds: runs.iter().map(|m| m.processing_time_seconds).sum::<f64>()
            / total_runs as f64,
        last_run: runs.iter().map(|m| m.start_time).max(),
    }
}
