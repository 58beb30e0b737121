//! Idempotent, atomic upsert of validated records
//!
//! One call is one batch and one transaction. Records whose key is already known
//! are updated in place; the rest are inserted with `ON CONFLICT DO NOTHING`, and
//! an insert that loses a race against a concurrent writer is retried as an update
//! in the same transaction. Any failure rolls the whole batch back.
//!
//! Batch lifecycle:
//!
//! ```text
//! PENDING -> PARTITIONED -> INSERTING -> UPDATING -> COMMITTED
//!    \____________\_____________\___________\______> FAILED
//! ```

use crate::error::{EtlError, Result};
use crate::model::{Column, OperationRecord};
use crate::store::{BatchWriter, InsertOutcome, OperationStore};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadState {
    Pending,
    Partitioned,
    Inserting,
    Updating,
    Committed,
    Failed,
}

impl LoadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadState::Pending => "PENDING",
            LoadState::Partitioned => "PARTITIONED",
            LoadState::Inserting => "INSERTING",
            LoadState::Updating => "UPDATING",
            LoadState::Committed => "COMMITTED",
            LoadState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LoadState::Committed | LoadState::Failed)
    }

    pub fn can_transition_to(&self, next: LoadState) -> bool {
        use LoadState::*;
        match (self, next) {
            (Pending, Partitioned)
            | (Partitioned, Inserting)
            | (Inserting, Updating)
            | (Updating, Committed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadStats {
    pub total_processed: usize,
    pub rows_inserted: usize,
    pub rows_updated: usize,
    pub rows_failed: usize,
}

impl LoadStats {
    /// Stats of a batch that was rolled back
    pub fn failed(total: usize) -> Self {
        Self {
            total_processed: total,
            rows_failed: total,
            ..Default::default()
        }
    }
}

/// Guards the batch lifecycle; an illegal step is a bug in the loader
struct BatchTracker {
    state: LoadState,
}

impl BatchTracker {
    fn new() -> Self {
        Self {
            state: LoadState::Pending,
        }
    }

    fn advance(&mut self, next: LoadState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(EtlError::load(
                format!("illegal load transition {} -> {}", self.state, next),
                0,
            ));
        }
        debug!(from = %self.state, to = %next, "load_state");
        self.state = next;
        Ok(())
    }
}

pub struct UpsertLoader {
    store: Arc<dyn OperationStore>,
    conflict_key: Column,
    loaded_at: Option<NaiveDateTime>,
}

impl UpsertLoader {
    pub fn new(store: Arc<dyn OperationStore>) -> Self {
        Self {
            store,
            conflict_key: Column::OperationId,
            loaded_at: None,
        }
    }

    pub fn with_conflict_key(mut self, conflict_key: Column) -> Self {
        self.conflict_key = conflict_key;
        self
    }

    /// Fix the `fecha_carga` written for new rows
    pub fn with_loaded_at(mut self, loaded_at: NaiveDateTime) -> Self {
        self.loaded_at = Some(loaded_at);
        self
    }

    pub fn conflict_key(&self) -> Column {
        self.conflict_key
    }

    /// Look up the keys already stored, then [`upsert`](Self::upsert)
    pub async fn load(&self, records: &[OperationRecord]) -> Result<LoadStats> {
        self.check_conflict_key(self.conflict_key)?;
        let existing = self
            .store
            .existing_keys(self.conflict_key)
            .await
            .map_err(|e| e.into_batch_failure(records.len()))?;
        self.upsert(records, &existing, self.conflict_key).await
    }

    /// Insert records whose key is not in `existing_keys`, update the others.
    ///
    /// On error nothing is persisted and the error carries `rows_failed`.
    pub async fn upsert(
        &self,
        records: &[OperationRecord],
        existing_keys: &HashSet<String>,
        conflict_key: Column,
    ) -> Result<LoadStats> {
        self.check_conflict_key(conflict_key)?;

        let total = records.len();
        let mut tracker = BatchTracker::new();

        let (mut new, mut existing): (Vec<&OperationRecord>, Vec<&OperationRecord>) = records
            .iter()
            .partition(|r| !existing_keys.contains(&r.value(conflict_key).to_string()));
        // Concurrent batches must take row locks in the same order
        new.sort_by_cached_key(|r| r.value(conflict_key));
        existing.sort_by_cached_key(|r| r.value(conflict_key));
        tracker.advance(LoadState::Partitioned)?;

        debug!(
            backend = self.store.backend(),
            total,
            new = new.len(),
            existing = existing.len(),
            "load_partitioned"
        );

        let mut writer = match self.store.begin_batch().await {
            Ok(writer) => writer,
            Err(e) => {
                tracker.advance(LoadState::Failed)?;
                warn!(error = %e, rows_failed = total, "load_failed");
                return Err(e.into_batch_failure(total));
            }
        };

        let loaded_at = self
            .loaded_at
            .unwrap_or_else(|| chrono::Local::now().naive_local());

        let outcome = self
            .write(
                writer.as_mut(),
                &mut tracker,
                &new,
                &existing,
                conflict_key,
                loaded_at,
            )
            .await;

        let (inserted, updated) = match outcome {
            Ok(counts) => match writer.commit().await {
                Ok(()) => counts,
                Err(e) => return Err(self.fail(&mut tracker, e, total)),
            },
            Err(e) => {
                if let Err(rollback_err) = writer.rollback().await {
                    warn!(error = %rollback_err, "rollback_failed");
                }
                return Err(self.fail(&mut tracker, e, total));
            }
        };
        tracker.advance(LoadState::Committed)?;

        let stats = LoadStats {
            total_processed: total,
            rows_inserted: inserted,
            rows_updated: updated,
            rows_failed: 0,
        };
        info!(
            backend = self.store.backend(),
            inserted = stats.rows_inserted,
            updated = stats.rows_updated,
            "load_committed"
        );
        Ok(stats)
    }

    fn check_conflict_key(&self, conflict_key: Column) -> Result<()> {
        if self.store.unique_columns().contains(&conflict_key) {
            Ok(())
        } else {
            Err(EtlError::config(format!(
                "conflict key '{conflict_key}' has no unique constraint in the {} store",
                self.store.backend()
            )))
        }
    }

    fn fail(&self, tracker: &mut BatchTracker, error: EtlError, total: usize) -> EtlError {
        if let Err(e) = tracker.advance(LoadState::Failed) {
            warn!(error = %e, "load_state");
        }
        warn!(error = %error, rows_failed = total, "load_failed");
        error.into_batch_failure(total)
    }

    async fn write(
        &self,
        writer: &mut dyn BatchWriter,
        tracker: &mut BatchTracker,
        new: &[&OperationRecord],
        existing: &[&OperationRecord],
        conflict_key: Column,
        loaded_at: NaiveDateTime,
    ) -> Result<(usize, usize)> {
        tracker.advance(LoadState::Inserting)?;
        let mut inserted = 0;
        let mut raced = Vec::new();
        for record in new {
            match writer.insert(record, conflict_key, loaded_at).await? {
                InsertOutcome::Inserted => inserted += 1,
                InsertOutcome::KeyConflict => raced.push(*record),
            }
        }
        if !raced.is_empty() {
            debug!(count = raced.len(), "insert_conflicts_retried_as_update");
        }

        tracker.advance(LoadState::Updating)?;
        let mut updates: Vec<&OperationRecord> = existing.iter().copied().chain(raced).collect();
        updates.sort_by_cached_key(|r| r.value(conflict_key));
        let mut updated = 0;
        for record in updates {
            if writer.update(record, conflict_key).await? > 0 {
                updated += 1;
                continue;
            }
            // Key vanished since the lookup
            match writer.insert(record, conflict_key, loaded_at).await? {
                InsertOutcome::Inserted => inserted += 1,
                InsertOutcome::KeyConflict => {
                    return Err(EtlError::load(
                        format!(
                            "row {} could be neither updated nor inserted",
                            record.value(conflict_key)
                        ),
                        0,
                    ))
                }
            }
        }

        Ok((inserted, updated))
    }
}
