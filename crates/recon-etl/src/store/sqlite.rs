//! SQLite operations store
//!
//! Timestamps are kept as `YYYY-MM-DD HH:MM:SS[.f]` text and amounts as decimal
//! text, so both sort and round-trip without loss.

use super::{
    decode_record, select_list, BatchWriter, FilterParam, InsertOutcome, OperationFilter,
    OperationStore, StoredOperation, TableStats, OPERATIONS_TABLE,
};
use crate::error::{EtlError, Result};
use crate::model::{Column, FieldValue, OperationRecord, TIMESTAMP_FORMAT};
use crate::validation::{parse_amount, parse_timestamp};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, Sqlite, Transaction};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database at `url`
    pub async fn connect(url: &str, max_connections: u32, connect_timeout: Duration) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| EtlError::config(format!("invalid SQLite URL '{url}': {e}")))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(connect_timeout)
            .connect_with(options)
            .await?;

        tracing::info!(url, max_connections, "SQLite pool created");
        Ok(Self::new(pool))
    }

    /// Private in-memory database on a single connection
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn bind_columns<'q>(mut query: SqliteQuery<'q>, record: &OperationRecord) -> SqliteQuery<'q> {
    for column in Column::ALL {
        query = match record.value(column) {
            FieldValue::Null => query.bind(None::<String>),
            FieldValue::Timestamp(ts) => query.bind(ts.format(TIMESTAMP_FORMAT).to_string()),
            other => query.bind(other.to_string()),
        };
    }
    query
}

fn decode_timestamp(raw: &str, column: &str) -> Result<NaiveDateTime> {
    parse_timestamp(raw)
        .ok_or_else(|| EtlError::load(format!("stored {column} '{raw}' is not a timestamp"), 0))
}

fn decode_row(row: &SqliteRow) -> Result<StoredOperation> {
    let timestamp: String = row.try_get(Column::Timestamp.name())?;
    let amount: String = row.try_get(Column::Amount.name())?;
    let loaded_at: String = row.try_get("fecha_carga")?;

    let amount = parse_amount(&amount)
        .ok_or_else(|| EtlError::load(format!("stored monto '{amount}' is not a decimal"), 0))?;
    let record = decode_record(
        decode_timestamp(&timestamp, Column::Timestamp.name())?,
        amount,
        |column| Ok(row.try_get::<Option<String>, _>(column.name())?),
    )?;

    Ok(StoredOperation {
        id: row.try_get("id")?,
        record,
        loaded_at: decode_timestamp(&loaded_at, "fecha_carga")?,
    })
}

#[async_trait]
impl OperationStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations/sqlite").run(&self.pool).await?;
        Ok(())
    }

    async fn existing_keys(&self, column: Column) -> Result<HashSet<String>> {
        let sql = format!("SELECT {} FROM {OPERATIONS_TABLE}", column.name());
        let keys: Vec<String> = sqlx::query_scalar(&sql).fetch_all(&self.pool).await?;
        Ok(keys.into_iter().collect())
    }

    async fn begin_batch(&self) -> Result<Box<dyn BatchWriter>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteBatch { tx }))
    }

    async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {OPERATIONS_TABLE}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn get(&self, operation_id: &str) -> Result<Option<StoredOperation>> {
        let sql = format!(
            "SELECT {} FROM {OPERATIONS_TABLE} WHERE numero_operacion = ?1",
            select_list()
        );
        let row = sqlx::query(&sql)
            .bind(operation_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn query(&self, filter: &OperationFilter) -> Result<Vec<StoredOperation>> {
        let (tail, params) = filter.to_sql(|n| format!("?{n}"));
        let sql = format!("SELECT {} FROM {OPERATIONS_TABLE}{tail}", select_list());

        let mut query = sqlx::query(&sql);
        for param in params {
            query = match param {
                FilterParam::Text(value) => query.bind(value),
                FilterParam::Timestamp(ts) => query.bind(ts.format(TIMESTAMP_FORMAT).to_string()),
                FilterParam::Limit(limit) => query.bind(limit),
            };
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(decode_row).collect()
    }

    async fn table_stats(&self) -> Result<TableStats> {
        let sql = format!(
            r#"
            SELECT
                COUNT(*) AS total_rows,
                MIN(fecha_operacion) AS earliest,
                MAX(fecha_operacion) AS latest,
                COALESCE(SUM(CAST(monto AS REAL)), 0.0) AS total_amount,
                COALESCE(AVG(CAST(monto AS REAL)), 0.0) AS average_amount
            FROM {OPERATIONS_TABLE}
            "#
        );
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;

        let earliest: Option<String> = row.try_get("earliest")?;
        let latest: Option<String> = row.try_get("latest")?;
        let total_rows: i64 = row.try_get("total_rows")?;

        Ok(TableStats {
            total_rows: total_rows as u64,
            earliest_operation: earliest.as_deref().and_then(parse_timestamp),
            latest_operation: latest.as_deref().and_then(parse_timestamp),
            total_amount: row.try_get("total_amount")?,
            average_amount: row.try_get("average_amount")?,
        })
    }
}

struct SqliteBatch {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl BatchWriter for SqliteBatch {
    async fn insert(
        &mut self,
        record: &OperationRecord,
        conflict_key: Column,
        loaded_at: NaiveDateTime,
    ) -> Result<InsertOutcome> {
        let columns: Vec<&str> = Column::ALL.iter().map(|c| c.name()).collect();
        let placeholders: Vec<String> = (1..=columns.len() + 1).map(|n| format!("?{n}")).collect();
        let sql = format!(
            "INSERT INTO {OPERATIONS_TABLE} ({}, fecha_carga) VALUES ({}) \
             ON CONFLICT({}) DO NOTHING",
            columns.join(", "),
            placeholders.join(", "),
            conflict_key.name()
        );

        let result = bind_columns(sqlx::query(&sql), record)
            .bind(loaded_at.format(TIMESTAMP_FORMAT).to_string())
            .execute(&mut *self.tx)
            .await?;

        Ok(if result.rows_affected() == 0 {
            InsertOutcome::KeyConflict
        } else {
            InsertOutcome::Inserted
        })
    }

    async fn update(&mut self, record: &OperationRecord, conflict_key: Column) -> Result<u64> {
        let assignments: Vec<String> = Column::ALL
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = ?{}", c.name(), i + 1))
            .collect();
        let sql = format!(
            "UPDATE {OPERATIONS_TABLE} SET {} WHERE {} = ?{}",
            assignments.join(", "),
            conflict_key.name(),
            Column::ALL.len() + 1
        );

        let result = bind_columns(sqlx::query(&sql), record)
            .bind(record.value(conflict_key).to_string())
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::test_support::record;
    use crate::model::OperationStatus;
    use chrono::NaiveDate;

    async fn store() -> SqliteStore {
        let store = SqliteStore::in_memory().await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    fn loaded_at() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 2, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap()
    }

    #[tokio::test]
    async fn test_insert_get_round_trip() {
        let store = store().await;
        let mut original = record(1, "1234.50");
        original.dest_account = None;

        let mut batch = store.begin_batch().await.unwrap();
        let outcome = batch
            .insert(&original, Column::OperationId, loaded_at())
            .await
            .unwrap();
        batch.commit().await.unwrap();

        assert_eq!(outcome, InsertOutcome::Inserted);
        let stored = store.get("OP-00000001").await.unwrap().unwrap();
        assert_eq!(stored.record, original);
        assert_eq!(stored.loaded_at, loaded_at());
        assert!(store.get("OP-99999999").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_conflict_writes_nothing() {
        let store = store().await;
        let mut batch = store.begin_batch().await.unwrap();
        batch
            .insert(&record(1, "10"), Column::OperationId, loaded_at())
            .await
            .unwrap();
        let second = batch
            .insert(&record(1, "99"), Column::OperationId, loaded_at())
            .await
            .unwrap();
        batch.commit().await.unwrap();

        assert_eq!(second, InsertOutcome::KeyConflict);
        assert_eq!(store.count().await.unwrap(), 1);
        let stored = store.get("OP-00000001").await.unwrap().unwrap();
        assert_eq!(stored.record.amount.to_string(), "10");
    }

    #[tokio::test]
    async fn test_update_keeps_load_time() {
        let store = store().await;
        let mut batch = store.begin_batch().await.unwrap();
        batch
            .insert(&record(1, "10"), Column::OperationId, loaded_at())
            .await
            .unwrap();
        batch.commit().await.unwrap();

        let mut changed = record(1, "15.75");
        changed.status = OperationStatus::Failed;
        let mut batch = store.begin_batch().await.unwrap();
        let touched = batch.update(&changed, Column::OperationId).await.unwrap();
        batch.commit().await.unwrap();

        assert_eq!(touched, 1);
        let stored = store.get("OP-00000001").await.unwrap().unwrap();
        assert_eq!(stored.record, changed);
        assert_eq!(stored.loaded_at, loaded_at());
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let store = store().await;
        let mut batch = store.begin_batch().await.unwrap();
        batch
            .insert(&record(1, "10"), Column::OperationId, loaded_at())
            .await
            .unwrap();
        batch.rollback().await.unwrap();

        assert_eq!(store.count().await.unwrap(), 0);
        assert!(store.existing_keys(Column::OperationId).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_query_and_stats() {
        let store = store().await;
        let mut batch = store.begin_batch().await.unwrap();
        for i in 1..=4 {
            let mut r = record(i, &format!("{}.00", i * 10));
            r.timestamp += chrono::Duration::days(i as i64);
            if i % 2 == 0 {
                r.status = OperationStatus::Pending;
            }
            batch.insert(&r, Column::OperationId, loaded_at()).await.unwrap();
        }
        batch.commit().await.unwrap();

        let pending = store
            .query(&OperationFilter::default().with_status(OperationStatus::Pending))
            .await
            .unwrap();
        let ids: Vec<_> = pending.iter().map(|s| s.record.operation_id.as_str()).collect();
        assert_eq!(ids, vec!["OP-00000002", "OP-00000004"]);

        let limited = store
            .query(&OperationFilter::default().with_limit(3))
            .await
            .unwrap();
        assert_eq!(limited.len(), 3);

        let stats = store.table_stats().await.unwrap();
        assert_eq!(stats.total_rows, 4);
        assert!((stats.total_amount - 100.0).abs() < 1e-9);
        assert!((stats.average_amount - 25.0).abs() < 1e-9);
        assert!(stats.earliest_operation < stats.latest_operation);

        let keys = store.existing_keys(Column::OperationId).await.unwrap();
        assert_eq!(keys.len(), 4);
        assert!(keys.contains("OP-00000003"));
    }

    #[tokio::test]
    async fn test_empty_table_stats() {
        let stats = store().await.table_stats().await.unwrap();
        assert_eq!(stats, TableStats::default());
    }
}
