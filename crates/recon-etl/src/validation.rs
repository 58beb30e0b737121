//! Structural and business-rule validation of raw batches
//!
//! Every row is checked against every rule in [`RULES`]; a row is valid only when
//! no rule reports a violation. Violations are data, not errors: they end up in
//! the [`ValidationReport`] and the row is dropped. The only error this module
//! returns is [`EtlError::SchemaStructure`], raised before any row is looked at.

use crate::error::{EtlError, Result};
use crate::model::{Column, OperationRecord};
use crate::source::RawBatch;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Errors kept in a report; rows past this still count as invalid
pub const MAX_REPORTED_ERRORS: usize = 100;

const OPERATION_ID_PATTERN: &str = r"^OP-\d{8}$";
const ACCOUNT_PATTERN: &str = r"^\d{3}-\d{7}-\d-\d{2}$";
const MAX_AMOUNT: i64 = 1_000_000;
const MAX_AMOUNT_SCALE: u32 = 2;
const MAX_BANK_LEN: usize = 50;
const MAX_DESCRIPTION_LEN: usize = 500;

/// Allowed gap between the expected and actual batch total (0.01)
fn checksum_tolerance() -> Decimal {
    Decimal::new(1, 2)
}

/// One rule violation on one row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    /// 1-based position of the record in the batch
    pub row_index: usize,
    pub column: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub total_rows: usize,
    pub valid_rows: usize,
    pub invalid_rows: usize,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn success_rate(&self) -> f64 {
        if self.total_rows == 0 {
            0.0
        } else {
            self.valid_rows as f64 / self.total_rows as f64
        }
    }

    fn push_error(&mut self, row_index: usize, column: Column, message: String) {
        if self.errors.len() < MAX_REPORTED_ERRORS {
            self.errors.push(ValidationError {
                row_index,
                column: column.name().to_string(),
                message,
            });
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationOptions {
    /// Reference for the future-date rule; current local time when unset
    pub now: Option<NaiveDateTime>,
    /// Expected `sum(monto)` of the valid rows
    pub expected_total: Option<Decimal>,
}

impl ValidationOptions {
    pub fn with_now(mut self, now: NaiveDateTime) -> Self {
        self.now = Some(now);
        self
    }

    pub fn with_expected_total(mut self, total: Decimal) -> Self {
        self.expected_total = Some(total);
        self
    }
}

struct RuleContext<'a> {
    now: NaiveDateTime,
    operation_id: &'a Regex,
    account: &'a Regex,
}

type Check = fn(Option<&str>, &RuleContext<'_>) -> std::result::Result<(), String>;

struct Rule {
    column: Column,
    check: Check,
}

/// Evaluated in this order for every row
const RULES: &[Rule] = &[
    Rule {
        column: Column::Timestamp,
        check: check_timestamp,
    },
    Rule {
        column: Column::OperationId,
        check: check_operation_id,
    },
    Rule {
        column: Column::OperationType,
        check: |v, _| required(v)?.parse::<crate::model::OperationType>().map(drop),
    },
    Rule {
        column: Column::Amount,
        check: check_amount,
    },
    Rule {
        column: Column::Currency,
        check: |v, _| required(v)?.parse::<crate::model::Currency>().map(drop),
    },
    Rule {
        column: Column::SourceAccount,
        check: |v, ctx| check_account(required(v)?, ctx),
    },
    Rule {
        column: Column::DestAccount,
        check: |v, ctx| v.map_or(Ok(()), |v| check_account(v, ctx)),
    },
    Rule {
        column: Column::SourceBank,
        check: |v, _| check_length(required(v)?, MAX_BANK_LEN),
    },
    Rule {
        column: Column::DestBank,
        check: |v, _| v.map_or(Ok(()), |v| check_length(v, MAX_BANK_LEN)),
    },
    Rule {
        column: Column::Description,
        check: |v, _| check_length(required(v)?, MAX_DESCRIPTION_LEN),
    },
    Rule {
        column: Column::Status,
        check: |v, _| required(v)?.parse::<crate::model::OperationStatus>().map(drop),
    },
    Rule {
        column: Column::Channel,
        check: |v, _| required(v)?.parse::<crate::model::Channel>().map(drop),
    },
];

fn required(value: Option<&str>) -> std::result::Result<&str, String> {
    value.ok_or_else(|| "value is required".to_string())
}

fn check_timestamp(value: Option<&str>, ctx: &RuleContext<'_>) -> std::result::Result<(), String> {
    let raw = required(value)?;
    let ts = parse_timestamp(raw).ok_or_else(|| format!("invalid date '{raw}'"))?;
    if ts > ctx.now {
        return Err(format!("date {ts} is in the future"));
    }
    Ok(())
}

fn check_operation_id(
    value: Option<&str>,
    ctx: &RuleContext<'_>,
) -> std::result::Result<(), String> {
    let raw = required(value)?;
    if ctx.operation_id.is_match(raw) {
        Ok(())
    } else {
        Err(format!("'{raw}' does not match {OPERATION_ID_PATTERN}"))
    }
}

fn check_amount(value: Option<&str>, _: &RuleContext<'_>) -> std::result::Result<(), String> {
    let raw = required(value)?;
    let amount = parse_amount(raw).ok_or_else(|| format!("invalid amount '{raw}'"))?;
    if amount <= Decimal::ZERO {
        return Err(format!("amount {amount} must be greater than 0"));
    }
    if amount > Decimal::from(MAX_AMOUNT) {
        return Err(format!("amount {amount} exceeds {MAX_AMOUNT}"));
    }
    // Trailing zeros do not count: "10.500" is a two-decimal amount
    if amount.normalize().scale() > MAX_AMOUNT_SCALE {
        return Err(format!(
            "amount {amount} has more than {MAX_AMOUNT_SCALE} decimal places"
        ));
    }
    Ok(())
}

/// Widths match the VARCHAR columns of the PostgreSQL table
fn check_length(raw: &str, max: usize) -> std::result::Result<(), String> {
    let len = raw.chars().count();
    if len > max {
        Err(format!("value is {len} characters long, at most {max} allowed"))
    } else {
        Ok(())
    }
}

fn check_account(raw: &str, ctx: &RuleContext<'_>) -> std::result::Result<(), String> {
    if ctx.account.is_match(raw) {
        Ok(())
    } else {
        Err(format!("'{raw}' does not match {ACCOUNT_PATTERN}"))
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.f]`, `YYYY-MM-DDTHH:MM:SS[.f]` and `YYYY-MM-DD`.
///
/// RFC 3339 values keep their wall-clock time; the offset is dropped.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local());
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(ts);
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

pub fn parse_amount(raw: &str) -> Option<Decimal> {
    raw.parse::<Decimal>().ok()
}

/// Compiled rule set
pub struct Validator {
    operation_id: Regex,
    account: Regex,
}

impl Validator {
    pub fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| EtlError::config(format!("bad pattern {pattern}: {e}")))
        };
        Ok(Self {
            operation_id: compile(OPERATION_ID_PATTERN)?,
            account: compile(ACCOUNT_PATTERN)?,
        })
    }

    /// Split a batch into typed valid records and a report on the rest
    pub fn validate(
        &self,
        batch: &RawBatch,
        options: &ValidationOptions,
    ) -> Result<(Vec<OperationRecord>, ValidationReport)> {
        let missing: Vec<String> = Column::REQUIRED
            .iter()
            .filter(|c| batch.column_index(c.name()).is_none())
            .map(|c| c.name().to_string())
            .collect();
        if !missing.is_empty() {
            return Err(EtlError::schema_structure(missing));
        }

        let positions: Vec<(Column, Option<usize>)> = Column::ALL
            .iter()
            .map(|c| (*c, batch.column_index(c.name())))
            .collect();

        let ctx = RuleContext {
            now: options
                .now
                .unwrap_or_else(|| chrono::Local::now().naive_local()),
            operation_id: &self.operation_id,
            account: &self.account,
        };

        let mut report = ValidationReport {
            total_rows: batch.len(),
            ..Default::default()
        };
        let mut valid = Vec::with_capacity(batch.len());

        for (i, row) in batch.rows.iter().enumerate() {
            let row_index = i + 1;
            let cell = |column: Column| {
                positions
                    .iter()
                    .find(|(c, _)| *c == column)
                    .and_then(|(_, idx)| *idx)
                    .and_then(|idx| row.get(idx))
                    .and_then(|v| v.as_deref())
            };

            let violations: Vec<(Column, String)> = RULES
                .iter()
                .filter_map(|rule| {
                    (rule.check)(cell(rule.column), &ctx)
                        .err()
                        .map(|message| (rule.column, message))
                })
                .collect();

            let outcome = if violations.is_empty() {
                build_record(cell).map_err(|v| vec![v])
            } else {
                Err(violations)
            };

            match outcome {
                Ok(record) => valid.push(record),
                Err(violations) => {
                    report.invalid_rows += 1;
                    for (column, message) in violations {
                        report.push_error(row_index, column, message);
                    }
                }
            }
        }

        report.valid_rows = valid.len();

        if let Some(expected) = options.expected_total {
            let actual: Decimal = valid.iter().map(|r| r.amount).sum();
            if (actual - expected).abs() >= checksum_tolerance() {
                report
                    .warnings
                    .push(format!("Checksum mismatch: expected {expected}, got {actual}"));
            }
        }

        let mut seen = HashSet::new();
        let duplicate_ids = valid
            .iter()
            .filter(|r| !seen.insert(r.operation_id.as_str()))
            .count();
        if duplicate_ids > 0 {
            report
                .warnings
                .push(format!("Found {duplicate_ids} duplicate operation IDs"));
        }

        Ok((valid, report))
    }
}

/// Convenience wrapper compiling a fresh [`Validator`]
pub fn validate(
    batch: &RawBatch,
    options: &ValidationOptions,
) -> Result<(Vec<OperationRecord>, ValidationReport)> {
    Validator::new()?.validate(batch, options)
}

fn build_record<'a>(
    cell: impl Fn(Column) -> Option<&'a str>,
) -> std::result::Result<OperationRecord, (Column, String)> {
    fn field<T>(
        column: Column,
        value: Option<T>,
    ) -> std::result::Result<T, (Column, String)> {
        value.ok_or_else(|| (column, "value could not be converted".to_string()))
    }
    let text = |column: Column| cell(column).map(str::to_string);
    let parsed = |column: Column| -> std::result::Result<&'a str, (Column, String)> {
        field(column, cell(column))
    };

    let mut record = OperationRecord {
        timestamp: field(
            Column::Timestamp,
            cell(Column::Timestamp).and_then(parse_timestamp),
        )?,
        operation_id: parsed(Column::OperationId)?.to_string(),
        operation_type: parsed(Column::OperationType)?
            .parse()
            .map_err(|e| (Column::OperationType, e))?,
        amount: field(Column::Amount, cell(Column::Amount).and_then(parse_amount))?,
        currency: parsed(Column::Currency)?
            .parse()
            .map_err(|e| (Column::Currency, e))?,
        source_account: parsed(Column::SourceAccount)?.to_string(),
        dest_account: text(Column::DestAccount),
        source_bank: parsed(Column::SourceBank)?.to_string(),
        dest_bank: text(Column::DestBank),
        description: parsed(Column::Description)?.to_string(),
        status: parsed(Column::Status)?
            .parse()
            .map_err(|e| (Column::Status, e))?,
        channel: parsed(Column::Channel)?
            .parse()
            .map_err(|e| (Column::Channel, e))?,
        content_hash: String::new(),
    };
    record.refresh_content_hash();
    Ok(record)
}
