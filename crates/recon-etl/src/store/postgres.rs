//! PostgreSQL operations store

use super::{
    decode_record, select_list, BatchWriter, FilterParam, InsertOutcome, OperationFilter,
    OperationStore, StoredOperation, TableStats, OPERATIONS_TABLE,
};
use crate::error::Result;
use crate::model::{Column, FieldValue, OperationRecord};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Postgres, Row, Transaction};
use std::collections::HashSet;
use std::time::Duration;

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

#[derive(Debug, Clone)]
pub struct PgPoolSettings {
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub max_lifetime: Option<Duration>,
}

impl Default for PgPoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(600)),
            max_lifetime: Some(Duration::from_secs(1800)),
        }
    }
}

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, settings: &PgPoolSettings) -> Result<Self> {
        let mut options = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(settings.connect_timeout);

        if let Some(idle_timeout) = settings.idle_timeout {
            options = options.idle_timeout(idle_timeout);
        }

        if let Some(max_lifetime) = settings.max_lifetime {
            options = options.max_lifetime(max_lifetime);
        }

        let pool = options.connect(url).await?;

        tracing::info!(
            max_connections = settings.max_connections,
            min_connections = settings.min_connections,
            "PostgreSQL pool created"
        );

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn bind_columns<'q>(mut query: PgQuery<'q>, record: &OperationRecord) -> PgQuery<'q> {
    for column in Column::ALL {
        query = match record.value(column) {
            FieldValue::Null => query.bind(None::<String>),
            FieldValue::Text(value) => query.bind(value),
            FieldValue::Amount(amount) => query.bind(amount),
            FieldValue::Timestamp(ts) => query.bind(ts),
        };
    }
    query
}

fn decode_row(row: &PgRow) -> Result<StoredOperation> {
    let record = decode_record(
        row.try_get(Column::Timestamp.name())?,
        row.try_get(Column::Amount.name())?,
        |column| Ok(row.try_get::<Option<String>, _>(column.name())?),
    )?;

    Ok(StoredOperation {
        id: row.try_get("id")?,
        record,
        loaded_at: row.try_get("fecha_carga")?,
    })
}

#[async_trait]
impl OperationStore for PostgresStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations/postgres").run(&self.pool).await?;
        Ok(())
    }

    async fn existing_keys(&self, column: Column) -> Result<HashSet<String>> {
        let sql = format!("SELECT {} FROM {OPERATIONS_TABLE}", column.name());
        let keys: Vec<String> = sqlx::query_scalar(&sql).fetch_all(&self.pool).await?;
        Ok(keys.into_iter().collect())
    }

    async fn begin_batch(&self) -> Result<Box<dyn BatchWriter>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgBatch { tx }))
    }

    async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {OPERATIONS_TABLE}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn get(&self, operation_id: &str) -> Result<Option<StoredOperation>> {
        let sql = format!(
            "SELECT {} FROM {OPERATIONS_TABLE} WHERE numero_operacion = $1",
            select_list()
        );
        let row = sqlx::query(&sql)
            .bind(operation_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn query(&self, filter: &OperationFilter) -> Result<Vec<StoredOperation>> {
        let (tail, params) = filter.to_sql(|n| format!("${n}"));
        let sql = format!("SELECT {} FROM {OPERATIONS_TABLE}{tail}", select_list());

        let mut query = sqlx::query(&sql);
        for param in params {
            query = match param {
                FilterParam::Text(value) => query.bind(value),
                FilterParam::Timestamp(ts) => query.bind(ts),
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
                COALESCE(SUM(monto), 0)::FLOAT8 AS total_amount,
                COALESCE(AVG(monto), 0)::FLOAT8 AS average_amount
            FROM {OPERATIONS_TABLE}
            "#
        );
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        let total_rows: i64 = row.try_get("total_rows")?;

        Ok(TableStats {
            total_rows: total_rows as u64,
            earliest_operation: row.try_get("earliest")?,
            latest_operation: row.try_get("latest")?,
            total_amount: row.try_get("total_amount")?,
            average_amount: row.try_get("average_amount")?,
        })
    }
}

struct PgBatch {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl BatchWriter for PgBatch {
    async fn insert(
        &mut self,
        record: &OperationRecord,
        conflict_key: Column,
        loaded_at: NaiveDateTime,
    ) -> Result<InsertOutcome> {
        let columns: Vec<&str> = Column::ALL.iter().map(|c| c.name()).collect();
        let placeholders: Vec<String> = (1..=columns.len() + 1).map(|n| format!("${n}")).collect();
        let sql = format!(
            "INSERT INTO {OPERATIONS_TABLE} ({}, fecha_carga) VALUES ({}) \
             ON CONFLICT ({}) DO NOTHING",
            columns.join(", "),
            placeholders.join(", "),
            conflict_key.name()
        );

        let result = bind_columns(sqlx::query(&sql), record)
            .bind(loaded_at)
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
            .map(|(i, c)| format!("{} = ${}", c.name(), i + 1))
            .collect();
        let sql = format!(
            "UPDATE {OPERATIONS_TABLE} SET {} WHERE {} = ${}",
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
