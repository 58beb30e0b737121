//! Shared fixtures for recon-etl integration tests
//!
//! - Record and batch builders
//! - In-memory SQLite stores with migrations applied
//! - Stores that fail on purpose, for the failure paths of the loader

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use recon_etl::model::{Channel, Column, Currency, OperationStatus, OperationType};
use recon_etl::store::{
    BatchWriter, InsertOutcome, OperationFilter, StoredOperation, TableStats,
};
use recon_etl::{EtlError, OperationRecord, OperationStore, RawBatch, Result, SqliteStore};
use std::collections::HashSet;
use std::sync::Arc;

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,recon_etl=debug,sqlx=warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn at(day: u32, hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 1, day)
        .unwrap()
        .and_hms_opt(hour, 0, 0)
        .unwrap()
}

/// Valid transfer `OP-<id>` for `amount` soles on 2025-01-15 10:00
pub fn operation(id: u32, amount: &str) -> OperationRecord {
    let mut record = OperationRecord {
        timestamp: at(15, 10),
        operation_id: format!("OP-{id:08}"),
        operation_type: OperationType::Transfer,
        amount: amount.parse().unwrap(),
        currency: Currency::Pen,
        source_account: "191-1234567-0-12".to_string(),
        dest_account: Some("193-7654321-1-45".to_string()),
        source_bank: "BCP".to_string(),
        dest_bank: Some("INTERBANK".to_string()),
        description: "Transferencia interbancaria".to_string(),
        status: OperationStatus::Completed,
        channel: Channel::Mobile,
        content_hash: String::new(),
    };
    record.refresh_content_hash();
    record
}

pub fn operations(range: std::ops::RangeInclusive<u32>, amount: &str) -> Vec<OperationRecord> {
    range.map(|i| operation(i, amount)).collect()
}

pub fn set_cell(batch: &mut RawBatch, row: usize, column: Column, value: &str) {
    let idx = batch.column_index(column.name()).unwrap();
    batch.rows[row][idx] = Some(value.to_string());
}

pub async fn sqlite_store() -> Arc<SqliteStore> {
    let store = SqliteStore::in_memory().await.expect("in-memory SQLite");
    store.migrate().await.expect("migrations");
    Arc::new(store)
}

// ============================================================================
// Failing stores
// ============================================================================

/// Every call fails as if the database were down
pub struct UnreachableStore;

fn refused() -> EtlError {
    EtlError::connection("connection refused (os error 111)")
}

#[async_trait]
impl OperationStore for UnreachableStore {
    fn backend(&self) -> &'static str {
        "unreachable"
    }

    async fn migrate(&self) -> Result<()> {
        Err(refused())
    }

    async fn existing_keys(&self, _column: Column) -> Result<HashSet<String>> {
        Err(refused())
    }

    async fn begin_batch(&self) -> Result<Box<dyn BatchWriter>> {
        Err(refused())
    }

    async fn count(&self) -> Result<u64> {
        Err(refused())
    }

    async fn get(&self, _operation_id: &str) -> Result<Option<StoredOperation>> {
        Err(refused())
    }

    async fn query(&self, _filter: &OperationFilter) -> Result<Vec<StoredOperation>> {
        Err(refused())
    }

    async fn table_stats(&self) -> Result<TableStats> {
        Err(refused())
    }
}

/// SQLite store whose batches fail on the first update
pub struct FailingUpdateStore {
    pub inner: Arc<SqliteStore>,
}

#[async_trait]
impl OperationStore for FailingUpdateStore {
    fn backend(&self) -> &'static str {
        "sqlite-failing-update"
    }

    async fn migrate(&self) -> Result<()> {
        self.inner.migrate().await
    }

    async fn existing_keys(&self, column: Column) -> Result<HashSet<String>> {
        self.inner.existing_keys(column).await
    }

    async fn begin_batch(&self) -> Result<Box<dyn BatchWriter>> {
        let inner = self.inner.begin_batch().await?;
        Ok(Box::new(FailingUpdateWriter { inner }))
    }

    async fn count(&self) -> Result<u64> {
        self.inner.count().await
    }

    async fn get(&self, operation_id: &str) -> Result<Option<StoredOperation>> {
        self.inner.get(operation_id).await
    }

    async fn query(&self, filter: &OperationFilter) -> Result<Vec<StoredOperation>> {
        self.inner.query(filter).await
    }

    async fn table_stats(&self) -> Result<TableStats> {
        self.inner.table_stats().await
    }
}

struct FailingUpdateWriter {
    inner: Box<dyn BatchWriter>,
}

#[async_trait]
impl BatchWriter for FailingUpdateWriter {
    async fn insert(
        &mut self,
        record: &OperationRecord,
        conflict_key: Column,
        loaded_at: NaiveDateTime,
    ) -> Result<InsertOutcome> {
        self.inner.insert(record, conflict_key, loaded_at).await
    }

    async fn update(&mut self, record: &OperationRecord, _conflict_key: Column) -> Result<u64> {
        Err(EtlError::load(
            format!("update of {} rejected", record.operation_id),
            0,
        ))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.inner.rollback().await
    }
}
