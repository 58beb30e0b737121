//! Canonical transaction record and its column catalogue
//!
//! Column names are the ones used by the upstream banking exports (`fecha_operacion`,
//! `numero_operacion`, ...). They appear unchanged in CSV headers and in the
//! `operaciones` table.

use crate::error::{EtlError, Result};
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Timestamp layout used for hashing, CSV output and SQLite storage
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    #[serde(rename = "DEPOSITO")]
    Deposit,
    #[serde(rename = "RETIRO")]
    Withdrawal,
    #[serde(rename = "TRANSFERENCIA")]
    Transfer,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Deposit => "DEPOSITO",
            OperationType::Withdrawal => "RETIRO",
            OperationType::Transfer => "TRANSFERENCIA",
        }
    }
}

impl FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "DEPOSITO" => Ok(OperationType::Deposit),
            "RETIRO" => Ok(OperationType::Withdrawal),
            "TRANSFERENCIA" => Ok(OperationType::Transfer),
            other => Err(format!(
                "invalid operation type '{other}', expected DEPOSITO, RETIRO or TRANSFERENCIA"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Pen,
    Usd,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Pen => "PEN",
            Currency::Usd => "USD",
        }
    }
}

impl FromStr for Currency {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PEN" => Ok(Currency::Pen),
            "USD" => Ok(Currency::Usd),
            other => Err(format!("invalid currency '{other}', expected PEN or USD")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationStatus {
    #[serde(rename = "COMPLETADA")]
    Completed,
    #[serde(rename = "PENDIENTE")]
    Pending,
    #[serde(rename = "FALLIDA")]
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Completed => "COMPLETADA",
            OperationStatus::Pending => "PENDIENTE",
            OperationStatus::Failed => "FALLIDA",
        }
    }
}

impl FromStr for OperationStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "COMPLETADA" => Ok(OperationStatus::Completed),
            "PENDIENTE" => Ok(OperationStatus::Pending),
            "FALLIDA" => Ok(OperationStatus::Failed),
            other => Err(format!(
                "invalid status '{other}', expected COMPLETADA, PENDIENTE or FALLIDA"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    #[serde(rename = "WEB")]
    Web,
    #[serde(rename = "MOBILE")]
    Mobile,
    #[serde(rename = "ATM")]
    Atm,
    #[serde(rename = "SUCURSAL")]
    Branch,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Web => "WEB",
            Channel::Mobile => "MOBILE",
            Channel::Atm => "ATM",
            Channel::Branch => "SUCURSAL",
        }
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "WEB" => Ok(Channel::Web),
            "MOBILE" => Ok(Channel::Mobile),
            "ATM" => Ok(Channel::Atm),
            "SUCURSAL" => Ok(Channel::Branch),
            other => Err(format!(
                "invalid channel '{other}', expected WEB, MOBILE, ATM or SUCURSAL"
            )),
        }
    }
}

/// Every column a record exposes, in output order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Column {
    Timestamp,
    OperationId,
    OperationType,
    Amount,
    Currency,
    SourceAccount,
    DestAccount,
    SourceBank,
    DestBank,
    Description,
    Status,
    Channel,
    ContentHash,
}

impl Column {
    pub const ALL: [Column; 13] = [
        Column::Timestamp,
        Column::OperationId,
        Column::OperationType,
        Column::Amount,
        Column::Currency,
        Column::SourceAccount,
        Column::DestAccount,
        Column::SourceBank,
        Column::DestBank,
        Column::Description,
        Column::Status,
        Column::Channel,
        Column::ContentHash,
    ];

    /// Columns that must be present in an input header
    pub const REQUIRED: [Column; 10] = [
        Column::Timestamp,
        Column::OperationId,
        Column::OperationType,
        Column::Amount,
        Column::Currency,
        Column::SourceAccount,
        Column::SourceBank,
        Column::Description,
        Column::Status,
        Column::Channel,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Column::Timestamp => "fecha_operacion",
            Column::OperationId => "numero_operacion",
            Column::OperationType => "tipo_operacion",
            Column::Amount => "monto",
            Column::Currency => "moneda",
            Column::SourceAccount => "cuenta_origen",
            Column::DestAccount => "cuenta_destino",
            Column::SourceBank => "banco_origen",
            Column::DestBank => "banco_destino",
            Column::Description => "descripcion",
            Column::Status => "estado",
            Column::Channel => "canal",
            Column::ContentHash => "content_hash",
        }
    }

    /// Parse a list of column names, rejecting unknown ones
    pub fn parse_list<S: AsRef<str>>(names: &[S]) -> Result<Vec<Column>> {
        names.iter().map(|n| n.as_ref().parse()).collect()
    }
}

impl FromStr for Column {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self> {
        Column::ALL
            .iter()
            .copied()
            .find(|c| c.name() == s.trim())
            .ok_or_else(|| EtlError::UnknownColumn(s.to_string()))
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single column value, comparable across records of the same column
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldValue {
    Null,
    Text(String),
    Amount(Decimal),
    Timestamp(NaiveDateTime),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => Ok(()),
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Amount(d) => write!(f, "{d}"),
            FieldValue::Timestamp(ts) => write!(f, "{}", ts.format(TIMESTAMP_FORMAT)),
        }
    }
}

/// One financial transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    #[serde(rename = "fecha_operacion")]
    pub timestamp: NaiveDateTime,
    /// Business key, `OP-` followed by eight digits
    #[serde(rename = "numero_operacion")]
    pub operation_id: String,
    #[serde(rename = "tipo_operacion")]
    pub operation_type: OperationType,
    #[serde(rename = "monto")]
    pub amount: Decimal,
    #[serde(rename = "moneda")]
    pub currency: Currency,
    #[serde(rename = "cuenta_origen")]
    pub source_account: String,
    #[serde(rename = "cuenta_destino")]
    pub dest_account: Option<String>,
    #[serde(rename = "banco_origen")]
    pub source_bank: String,
    #[serde(rename = "banco_destino")]
    pub dest_bank: Option<String>,
    #[serde(rename = "descripcion")]
    pub description: String,
    #[serde(rename = "estado")]
    pub status: OperationStatus,
    #[serde(rename = "canal")]
    pub channel: Channel,
    pub content_hash: String,
}

impl OperationRecord {
    /// Content fingerprint over operation id, amount, timestamp and source account.
    ///
    /// Amount uses its normalized form, so `100.50` and `100.5` hash the same.
    pub fn compute_content_hash(&self) -> String {
        let amount = self.amount.normalize().to_string();
        let timestamp = self.timestamp.format(TIMESTAMP_FORMAT).to_string();
        recon_common::fingerprint::fingerprint(&[
            self.operation_id.as_str(),
            amount.as_str(),
            timestamp.as_str(),
            self.source_account.as_str(),
        ])
    }

    pub fn refresh_content_hash(&mut self) {
        self.content_hash = self.compute_content_hash();
    }

    pub fn value(&self, column: Column) -> FieldValue {
        fn text(s: &str) -> FieldValue {
            FieldValue::Text(s.to_string())
        }
        fn optional(s: &Option<String>) -> FieldValue {
            s.as_deref().map_or(FieldValue::Null, text)
        }

        match column {
            Column::Timestamp => FieldValue::Timestamp(self.timestamp),
            Column::OperationId => text(&self.operation_id),
            Column::OperationType => text(self.operation_type.as_str()),
            Column::Amount => FieldValue::Amount(self.amount),
            Column::Currency => text(self.currency.as_str()),
            Column::SourceAccount => text(&self.source_account),
            Column::DestAccount => optional(&self.dest_account),
            Column::SourceBank => text(&self.source_bank),
            Column::DestBank => optional(&self.dest_bank),
            Column::Description => text(&self.description),
            Column::Status => text(self.status.as_str()),
            Column::Channel => text(self.channel.as_str()),
            Column::ContentHash => text(&self.content_hash),
        }
    }

    /// Overwrite one column with a value taken from the same column of another record
    pub fn set_value(&mut self, column: Column, value: FieldValue) -> Result<()> {
        let mismatch = |value: &FieldValue| {
            EtlError::invalid_reducer(column.name(), format!("incompatible value '{value}'"))
        };

        match (column, value) {
            (Column::Timestamp, FieldValue::Timestamp(ts)) => self.timestamp = ts,
            (Column::Amount, FieldValue::Amount(d)) => self.amount = d,
            (Column::DestAccount, FieldValue::Null) => self.dest_account = None,
            (Column::DestBank, FieldValue::Null) => self.dest_bank = None,
            (column, FieldValue::Text(s)) => match column {
                Column::OperationId => self.operation_id = s,
                Column::SourceAccount => self.source_account = s,
                Column::DestAccount => self.dest_account = Some(s),
                Column::SourceBank => self.source_bank = s,
                Column::DestBank => self.dest_bank = Some(s),
                Column::Description => self.description = s,
                Column::ContentHash => self.content_hash = s,
                Column::OperationType => {
                    self.operation_type = s.parse().map_err(|_| mismatch(&FieldValue::Text(s)))?
                }
                Column::Currency => {
                    self.currency = s.parse().map_err(|_| mismatch(&FieldValue::Text(s)))?
                }
                Column::Status => {
                    self.status = s.parse().map_err(|_| mismatch(&FieldValue::Text(s)))?
                }
                Column::Channel => {
                    self.channel = s.parse().map_err(|_| mismatch(&FieldValue::Text(s)))?
                }
                Column::Timestamp | Column::Amount => return Err(mismatch(&FieldValue::Text(s))),
            },
            (_, other) => return Err(mismatch(&other)),
        }
        Ok(())
    }

    /// Values of `columns`, used as a grouping key
    pub fn key(&self, columns: &[Column]) -> Vec<FieldValue> {
        columns.iter().map(|c| self.value(*c)).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod test_support {
    use super::*;
    use chrono::NaiveDate;

    /// Valid record with a fixed timestamp on 2025-01-15
    pub fn record(id: u32, amount: &str) -> OperationRecord {
        let mut record = OperationRecord {
            timestamp: NaiveDate::from_ymd_opt(2025, 1, 15)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap(),
            operation_id: format!("OP-{id:08}"),
            operation_type: OperationType::Transfer,
            amount: amount.parse().unwrap(),
            currency: Currency::Pen,
            source_account: "191-1234567-0-12".to_string(),
            dest_account: Some("193-7654321-1-45".to_string()),
            source_bank: "BCP".to_string(),
            dest_bank: Some("INTERBANK".to_string()),
            description: "Pago de servicios".to_string(),
            status: OperationStatus::Completed,
            channel: Channel::Web,
            content_hash: String::new(),
        };
        record.refresh_content_hash();
        record
    }
}
