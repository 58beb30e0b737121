//! Persistence of reconciled operations
//!
//! [`OperationStore`] is the seam between the loader and a concrete database. Each
//! backend owns its migrations and SQL; everything is bound as parameters, column
//! names are only ever taken from [`Column`].
//!
//! Writes go through a [`BatchWriter`], which wraps one database transaction. A
//! writer that is dropped without `commit` rolls back.

pub mod postgres;
pub mod sqlite;

use crate::error::{EtlError, Result};
use crate::model::{Channel, Column, Currency, OperationRecord, OperationStatus, OperationType};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

/// Name of the operations table in every backend
pub const OPERATIONS_TABLE: &str = "operaciones";

/// Result of a conflict-guarded insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The unique constraint already held this key; nothing was written
    KeyConflict,
}

/// Writes of one batch, inside a single transaction
#[async_trait]
pub trait BatchWriter: Send {
    /// `INSERT ... ON CONFLICT (conflict_key) DO NOTHING`
    async fn insert(
        &mut self,
        record: &OperationRecord,
        conflict_key: Column,
        loaded_at: NaiveDateTime,
    ) -> Result<InsertOutcome>;

    /// Overwrite every mutable field of the row matching `conflict_key`.
    ///
    /// `fecha_carga` is left alone. Returns the number of rows touched.
    async fn update(&mut self, record: &OperationRecord, conflict_key: Column) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait OperationStore: Send + Sync {
    /// Short backend name for logs ("sqlite", "postgres")
    fn backend(&self) -> &'static str;

    /// Columns backed by a unique constraint, usable as a conflict key
    fn unique_columns(&self) -> &[Column] {
        &[Column::OperationId]
    }

    /// Create the operations table and its indexes if missing
    async fn migrate(&self) -> Result<()>;

    /// Every stored value of a unique column
    async fn existing_keys(&self, column: Column) -> Result<HashSet<String>>;

    async fn begin_batch(&self) -> Result<Box<dyn BatchWriter>>;

    async fn count(&self) -> Result<u64>;

    async fn get(&self, operation_id: &str) -> Result<Option<StoredOperation>>;

    async fn query(&self, filter: &OperationFilter) -> Result<Vec<StoredOperation>>;

    async fn table_stats(&self) -> Result<TableStats>;
}

/// A persisted row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredOperation {
    pub id: i64,
    #[serde(flatten)]
    pub record: OperationRecord,
    /// `fecha_carga`: when the row was first inserted
    pub loaded_at: NaiveDateTime,
}

/// Aggregate view of the operations table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableStats {
    pub total_rows: u64,
    pub earliest_operation: Option<NaiveDateTime>,
    pub latest_operation: Option<NaiveDateTime>,
    pub total_amount: f64,
    pub average_amount: f64,
}

/// Row filter for [`OperationStore::query`]; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct OperationFilter {
    pub status: Option<OperationStatus>,
    pub channel: Option<Channel>,
    pub operation_type: Option<OperationType>,
    pub currency: Option<Currency>,
    pub from: Option<NaiveDateTime>,
    pub to: Option<NaiveDateTime>,
    pub limit: Option<i64>,
}

/// Value bound to a filter placeholder
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FilterParam {
    Text(&'static str),
    Timestamp(NaiveDateTime),
    Limit(i64),
}

impl OperationFilter {
    pub fn with_status(mut self, status: OperationStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_operation_type(mut self, operation_type: OperationType) -> Self {
        self.operation_type = Some(operation_type);
        self
    }

    pub fn with_currency(mut self, currency: Currency) -> Self {
        self.currency = Some(currency);
        self
    }

    /// Operations at or after `from`
    pub fn since(mut self, from: NaiveDateTime) -> Self {
        self.from = Some(from);
        self
    }

    /// Operations at or before `to`
    pub fn until(mut self, to: NaiveDateTime) -> Self {
        self.to = Some(to);
        self
    }

    pub fn between(self, from: NaiveDateTime, to: NaiveDateTime) -> Self {
        self.since(from).until(to)
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// `WHERE`/`LIMIT` tail and its parameters, using `placeholder(n)` for the
    /// n-th (1-based) bind position
    pub(crate) fn to_sql(&self, placeholder: impl Fn(usize) -> String) -> (String, Vec<FilterParam>) {
        let mut conditions = Vec::new();
        let mut params = Vec::new();

        let mut push = |condition: &str, param: FilterParam| {
            params.push(param);
            conditions.push(format!("{condition} {}", placeholder(params.len())));
        };

        if let Some(status) = self.status {
            push("estado =", FilterParam::Text(status.as_str()));
        }
        if let Some(channel) = self.channel {
            push("canal =", FilterParam::Text(channel.as_str()));
        }
        if let Some(kind) = self.operation_type {
            push("tipo_operacion =", FilterParam::Text(kind.as_str()));
        }
        if let Some(currency) = self.currency {
            push("moneda =", FilterParam::Text(currency.as_str()));
        }
        if let Some(from) = self.from {
            push("fecha_operacion >=", FilterParam::Timestamp(from));
        }
        if let Some(to) = self.to {
            push("fecha_operacion <=", FilterParam::Timestamp(to));
        }

        let mut sql = String::new();
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY id");
        if let Some(limit) = self.limit {
            params.push(FilterParam::Limit(limit));
            sql.push_str(&format!(" LIMIT {}", placeholder(params.len())));
        }

        (sql, params)
    }
}

/// Columns listed by every `SELECT`
pub(crate) fn select_list() -> String {
    let mut columns: Vec<&str> = vec!["id"];
    columns.extend(Column::ALL.iter().map(|c| c.name()));
    columns.push("fecha_carga");
    columns.join(", ")
}

/// Rebuild a record from a row; `text` reads a column as an optional string
pub(crate) fn decode_record<F>(
    timestamp: NaiveDateTime,
    amount: Decimal,
    text: F,
) -> Result<OperationRecord>
where
    F: Fn(Column) -> Result<Option<String>>,
{
    let required = |column: Column| -> Result<String> {
        text(column)?.ok_or_else(|| {
            EtlError::load(format!("stored row has NULL {}", column.name()), 0)
        })
    };
    let corrupt =
        |column: Column, e: String| EtlError::load(format!("stored {} is invalid: {e}", column.name()), 0);

    Ok(OperationRecord {
        timestamp,
        operation_id: required(Column::OperationId)?,
        operation_type: required(Column::OperationType)?
            .parse()
            .map_err(|e| corrupt(Column::OperationType, e))?,
        amount,
        currency: required(Column::Currency)?
            .parse()
            .map_err(|e| corrupt(Column::Currency, e))?,
        source_account: required(Column::SourceAccount)?,
        dest_account: text(Column::DestAccount)?,
        source_bank: required(Column::SourceBank)?,
        dest_bank: text(Column::DestBank)?,
        description: text(Column::Description)?.unwrap_or_default(),
        status: required(Column::Status)?
            .parse()
            .map_err(|e| corrupt(Column::Status, e))?,
        channel: required(Column::Channel)?
            .parse()
            .map_err(|e| corrupt(Column::Channel, e))?,
        content_hash: required(Column::ContentHash)?,
    })
}
