//! Duplicate detection and resolution
//!
//! Four strategies, all deterministic: grouping uses hash maps only for lookup,
//! while output order always follows input order.
//!
//! - `hash`: same `content_hash` is a duplicate, first occurrence wins
//! - `key`: same values in the key columns, first occurrence wins
//! - `priority`: per key group keep the record ranking first on a priority column
//! - `merge`: collapse each key group into one record using per-column reducers

use crate::error::{EtlError, Result};
use crate::model::{Column, FieldValue, OperationRecord};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl FromStr for SortOrder {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(EtlError::config(format!(
                "invalid priority order '{other}', expected asc or desc"
            ))),
        }
    }
}

/// How a merge combines one column across a duplicate group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reducer {
    First,
    Last,
    Max,
    Min,
    /// Only defined for `monto`
    Sum,
}

impl Reducer {
    fn parse_for(column: Column, name: &str) -> Result<Self> {
        let reducer = match name.to_lowercase().as_str() {
            "first" => Reducer::First,
            "last" => Reducer::Last,
            "max" => Reducer::Max,
            "min" => Reducer::Min,
            "sum" => Reducer::Sum,
            _ => return Err(EtlError::invalid_reducer(column.name(), name)),
        };
        reducer.check(column)?;
        Ok(reducer)
    }

    fn check(self, column: Column) -> Result<()> {
        match (self, column) {
            (_, Column::ContentHash) => Err(EtlError::invalid_reducer(
                column.name(),
                "content_hash is always recomputed",
            )),
            (Reducer::Sum, c) if c != Column::Amount => {
                Err(EtlError::invalid_reducer(c.name(), "sum"))
            }
            _ => Ok(()),
        }
    }

    fn apply(self, column: Column, group: &[&OperationRecord]) -> FieldValue {
        let mut values = group.iter().map(|r| r.value(column));
        match self {
            Reducer::First => values.next().unwrap_or(FieldValue::Null),
            Reducer::Last => values.last().unwrap_or(FieldValue::Null),
            Reducer::Max => values.max().unwrap_or(FieldValue::Null),
            Reducer::Min => values.min().unwrap_or(FieldValue::Null),
            Reducer::Sum => FieldValue::Amount(group.iter().map(|r| r.amount).sum::<Decimal>()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DedupStrategy {
    #[default]
    Hash,
    Key {
        columns: Vec<Column>,
    },
    Priority {
        columns: Vec<Column>,
        priority: Column,
        order: SortOrder,
    },
    Merge {
        columns: Vec<Column>,
        reducers: BTreeMap<Column, Reducer>,
    },
}

impl DedupStrategy {
    pub fn key<S: AsRef<str>>(columns: &[S]) -> Result<Self> {
        Ok(Self::Key {
            columns: Column::parse_list(columns)?,
        })
    }

    pub fn priority<S: AsRef<str>>(columns: &[S], priority: &str, order: SortOrder) -> Result<Self> {
        Ok(Self::Priority {
            columns: Column::parse_list(columns)?,
            priority: priority.parse()?,
            order,
        })
    }

    /// Build a merge strategy from `(column, reducer)` name pairs
    pub fn merge<S: AsRef<str>>(columns: &[S], reducers: &[(&str, &str)]) -> Result<Self> {
        let columns = Column::parse_list(columns)?;
        let mut parsed = BTreeMap::new();
        for (column, reducer) in reducers {
            let column: Column = column.parse()?;
            parsed.insert(column, Reducer::parse_for(column, reducer)?);
        }
        Ok(Self::Merge {
            columns,
            reducers: parsed,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            DedupStrategy::Hash => "hash",
            DedupStrategy::Key { .. } => "key",
            DedupStrategy::Priority { .. } => "priority",
            DedupStrategy::Merge { .. } => "merge",
        }
    }

    /// Reject configurations that cannot run, before touching any record
    pub fn check(&self) -> Result<()> {
        let key_columns = match self {
            DedupStrategy::Hash => return Ok(()),
            DedupStrategy::Key { columns }
            | DedupStrategy::Priority { columns, .. }
            | DedupStrategy::Merge { columns, .. } => columns,
        };
        if key_columns.is_empty() {
            return Err(EtlError::config(format!(
                "{} deduplication needs at least one key column",
                self.name()
            )));
        }
        if let DedupStrategy::Merge { reducers, .. } = self {
            for (column, reducer) in reducers {
                reducer.check(*column)?;
            }
        }
        Ok(())
    }
}

/// Strategy by name with its default parameters
impl FromStr for DedupStrategy {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "hash" => Ok(DedupStrategy::Hash),
            "key" => Ok(DedupStrategy::Key {
                columns: vec![Column::OperationId],
            }),
            "priority" => Ok(DedupStrategy::Priority {
                columns: vec![Column::OperationId],
                priority: Column::Timestamp,
                order: SortOrder::Desc,
            }),
            "merge" => Ok(DedupStrategy::Merge {
                columns: vec![Column::OperationId],
                reducers: BTreeMap::new(),
            }),
            _ => Err(EtlError::UnknownStrategy(s.to_string())),
        }
    }
}

impl fmt::Display for DedupStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupStats {
    pub total_input: usize,
    pub duplicates_found: usize,
    pub duplicates_removed: usize,
    pub final_count: usize,
}

impl DedupStats {
    pub fn duplicate_rate(&self) -> f64 {
        if self.total_input == 0 {
            0.0
        } else {
            self.duplicates_removed as f64 / self.total_input as f64
        }
    }

    pub fn retention_rate(&self) -> f64 {
        1.0 - self.duplicate_rate()
    }
}

/// Remove duplicates from `records` according to `strategy`
pub fn deduplicate(
    records: Vec<OperationRecord>,
    strategy: &DedupStrategy,
) -> Result<(Vec<OperationRecord>, DedupStats)> {
    strategy.check()?;
    let total_input = records.len();

    let output = match strategy {
        DedupStrategy::Hash => keep_first(records, |r| {
            if r.content_hash.is_empty() {
                r.compute_content_hash()
            } else {
                r.content_hash.clone()
            }
        }),
        DedupStrategy::Key { columns } => keep_first(records, |r| r.key(columns)),
        DedupStrategy::Priority {
            columns,
            priority,
            order,
        } => keep_by_priority(records, columns, *priority, *order),
        DedupStrategy::Merge { columns, reducers } => merge_groups(records, columns, reducers)?,
    };

    let removed = total_input - output.len();
    let stats = DedupStats {
        total_input,
        duplicates_found: removed,
        duplicates_removed: removed,
        final_count: output.len(),
    };

    debug!(
        strategy = strategy.name(),
        total_input,
        duplicates_removed = removed,
        final_count = stats.final_count,
        "deduplication_completed"
    );

    Ok((output, stats))
}

/// Every member of every group sharing `columns`, sorted by key then input order.
///
/// Defaults to `numero_operacion` when `columns` is empty.
pub fn find_duplicates(records: &[OperationRecord], columns: &[Column]) -> Vec<OperationRecord> {
    let columns = if columns.is_empty() {
        &[Column::OperationId][..]
    } else {
        columns
    };

    let mut counts: HashMap<Vec<FieldValue>, usize> = HashMap::new();
    for record in records {
        *counts.entry(record.key(columns)).or_default() += 1;
    }

    let mut duplicates: Vec<(Vec<FieldValue>, &OperationRecord)> = records
        .iter()
        .map(|r| (r.key(columns), r))
        .filter(|(key, _)| counts.get(key).copied().unwrap_or(0) > 1)
        .collect();
    duplicates.sort_by(|a, b| a.0.cmp(&b.0));

    duplicates.into_iter().map(|(_, r)| r.clone()).collect()
}

fn keep_first<K, F>(records: Vec<OperationRecord>, key: F) -> Vec<OperationRecord>
where
    K: std::hash::Hash + Eq,
    F: Fn(&OperationRecord) -> K,
{
    let mut seen = HashSet::new();
    records.into_iter().filter(|r| seen.insert(key(r))).collect()
}

/// Group indices by key, groups in order of first appearance
fn group_indices(records: &[OperationRecord], columns: &[Column]) -> Vec<Vec<usize>> {
    let mut slots: HashMap<Vec<FieldValue>, usize> = HashMap::new();
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for (i, record) in records.iter().enumerate() {
        let slot = *slots.entry(record.key(columns)).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(i);
    }
    groups
}

fn keep_by_priority(
    records: Vec<OperationRecord>,
    columns: &[Column],
    priority: Column,
    order: SortOrder,
) -> Vec<OperationRecord> {
    let winners: Vec<usize> = group_indices(&records, columns)
        .into_iter()
        .filter_map(|members| {
            members.into_iter().reduce(|best, candidate| {
                let best_value = records[best].value(priority);
                let value = records[candidate].value(priority);
                let better = match order {
                    SortOrder::Asc => value < best_value,
                    SortOrder::Desc => value > best_value,
                };
                if better {
                    candidate
                } else {
                    best
                }
            })
        })
        .collect();

    let mut slots: Vec<Option<OperationRecord>> = records.into_iter().map(Some).collect();
    winners
        .into_iter()
        .filter_map(|i| slots.get_mut(i).and_then(Option::take))
        .collect()
}

fn merge_groups(
    records: Vec<OperationRecord>,
    columns: &[Column],
    reducers: &BTreeMap<Column, Reducer>,
) -> Result<Vec<OperationRecord>> {
    let mut merged = Vec::new();

    for members in group_indices(&records, columns) {
        let group: Vec<&OperationRecord> = members.iter().map(|i| &records[*i]).collect();
        let Some(first) = group.first() else {
            continue;
        };
        let mut record = (*first).clone();

        if group.len() > 1 {
            for column in Column::ALL {
                if column == Column::ContentHash || columns.contains(&column) {
                    continue;
                }
                let reducer = reducers.get(&column).copied().unwrap_or(Reducer::First);
                record.set_value(column, reducer.apply(column, &group))?;
            }
        }

        record.refresh_content_hash();
        merged.push(record);
    }

    Ok(merged)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::test_support::record;
    use chrono::Duration;
    use proptest::prelude::*;

    fn ids(records: &[OperationRecord]) -> Vec<String> {
        records.iter().map(|r| r.operation_id.clone()).collect()
    }

    #[test]
    fn test_hash_keeps_first_identical() {
        let mut records: Vec<_> = (1..=10).map(|i| record(i, "100.00")).collect();
        records[6] = records[2].clone();
        records[6].description = "reenviado".into();

        let (out, stats) = deduplicate(records, &DedupStrategy::Hash).unwrap();
        assert_eq!(out.len(), 9);
        assert_eq!(stats.duplicates_removed, 1);
        assert_eq!(stats.duplicates_found, 1);
        assert_eq!(out[2].description, "Pago de servicios");
    }

    #[test]
    fn test_key_uses_caller_columns() {
        let records = vec![record(1, "10"), record(1, "20"), record(2, "10")];

        let (out, _) = deduplicate(records.clone(), &DedupStrategy::key(&["numero_operacion"]).unwrap())
            .unwrap();
        assert_eq!(ids(&out), vec!["OP-00000001", "OP-00000002"]);
        assert_eq!(out[0].amount, Decimal::from(10));

        let (out, stats) = deduplicate(records, &DedupStrategy::key(&["monto"]).unwrap()).unwrap();
        assert_eq!(ids(&out), vec!["OP-00000001", "OP-00000001"]);
        assert_eq!(stats.final_count, 2);
    }

    #[test]
    fn test_priority_desc_keeps_latest() {
        let base = record(7, "50");
        let mut t1 = base.clone();
        let mut t2 = base.clone();
        let mut t3 = base.clone();
        t2.timestamp += Duration::hours(1);
        t3.timestamp += Duration::hours(2);
        t1.description = "t1".into();
        t2.description = "t2".into();
        t3.description = "t3".into();

        let strategy =
            DedupStrategy::priority(&["numero_operacion"], "fecha_operacion", SortOrder::Desc)
                .unwrap();
        let (out, stats) = deduplicate(vec![t2.clone(), t3, t1.clone()], &strategy).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].description, "t3");
        assert_eq!(stats.duplicates_removed, 2);

        let strategy =
            DedupStrategy::priority(&["numero_operacion"], "fecha_operacion", SortOrder::Asc)
                .unwrap();
        let (out, _) = deduplicate(vec![t2, t1], &strategy).unwrap();
        assert_eq!(out[0].description, "t1");
    }

    #[test]
    fn test_priority_ties_keep_earliest_and_group_order() {
        let mut a1 = record(2, "10");
        a1.description = "a1".into();
        let mut a2 = record(2, "10");
        a2.description = "a2".into();
        let b = record(1, "10");

        let strategy = DedupStrategy::priority(&["numero_operacion"], "monto", SortOrder::Desc).unwrap();
        let (out, _) = deduplicate(vec![a1, b, a2], &strategy).unwrap();
        assert_eq!(ids(&out), vec!["OP-00000002", "OP-00000001"]);
        assert_eq!(out[0].description, "a1");
    }

    #[test]
    fn test_merge_reducers() {
        let mut first = record(3, "10.00");
        first.description = "primera".into();
        let mut second = record(3, "25.50");
        second.description = "segunda".into();
        second.timestamp += Duration::minutes(5);

        let strategy = DedupStrategy::merge(
            &["numero_operacion"],
            &[("monto", "sum"), ("descripcion", "last"), ("fecha_operacion", "max")],
        )
        .unwrap();
        let (out, stats) = deduplicate(vec![first.clone(), second.clone(), record(4, "1")], &strategy).unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(stats.duplicates_removed, 1);
        assert_eq!(stats.duplicates_found, 1);
        let merged = &out[0];
        assert_eq!(merged.amount, Decimal::new(3550, 2));
        assert_eq!(merged.description, "segunda");
        assert_eq!(merged.timestamp, second.timestamp);
        assert_eq!(merged.content_hash, merged.compute_content_hash());
        assert_ne!(merged.content_hash, first.content_hash);
    }

    #[test]
    fn test_merge_rejects_sum_outside_amount() {
        let err = DedupStrategy::merge(&["numero_operacion"], &[("descripcion", "sum")]).unwrap_err();
        assert!(matches!(err, EtlError::InvalidReducer { .. }));

        let err = DedupStrategy::merge(&["numero_operacion"], &[("monto", "avg")]).unwrap_err();
        assert!(matches!(err, EtlError::InvalidReducer { .. }));

        let mut reducers = BTreeMap::new();
        reducers.insert(Column::Channel, Reducer::Sum);
        let strategy = DedupStrategy::Merge {
            columns: vec![Column::OperationId],
            reducers,
        };
        assert!(deduplicate(vec![record(1, "1")], &strategy).is_err());
    }

    #[test]
    fn test_unknown_strategy_and_column() {
        assert!(matches!(
            "fuzzy".parse::<DedupStrategy>(),
            Err(EtlError::UnknownStrategy(_))
        ));
        assert!(matches!(
            DedupStrategy::key(&["importe"]),
            Err(EtlError::UnknownColumn(_))
        ));
        assert_eq!("priority".parse::<DedupStrategy>().unwrap().name(), "priority");
    }

    #[test]
    fn test_find_duplicates_keep_none() {
        let records = vec![record(2, "1"), record(1, "2"), record(3, "3"), record(2, "4"), record(1, "5")];
        let dups = find_duplicates(&records, &[]);
        let amounts: Vec<_> = dups.iter().map(|r| r.amount.to_string()).collect();
        assert_eq!(amounts, vec!["2", "5", "1", "4"]);
    }

    #[test]
    fn test_stats_rates() {
        let stats = DedupStats {
            total_input: 10,
            duplicates_found: 2,
            duplicates_removed: 2,
            final_count: 8,
        };
        assert!((stats.duplicate_rate() - 0.2).abs() < f64::EPSILON);
        assert!((stats.retention_rate() - 0.8).abs() < f64::EPSILON);
        assert_eq!(DedupStats::default().duplicate_rate(), 0.0);
    }

    fn arb_records() -> impl Strategy<Value = Vec<OperationRecord>> {
        proptest::collection::vec((1u32..6, 1i64..4), 0..40).prop_map(|pairs| {
            pairs
                .into_iter()
                .map(|(id, cents)| record(id, &Decimal::new(cents * 100, 2).to_string()))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_count_law_holds(records in arb_records()) {
            let strategies = vec![
                DedupStrategy::Hash,
                "key".parse().unwrap(),
                "priority".parse().unwrap(),
                DedupStrategy::merge(&["numero_operacion"], &[("monto", "sum")]).unwrap(),
            ];
            for strategy in &strategies {
                let (out, stats) = deduplicate(records.clone(), strategy).unwrap();
                prop_assert_eq!(stats.total_input, records.len());
                prop_assert_eq!(stats.final_count, out.len());
                prop_assert_eq!(stats.final_count, stats.total_input - stats.duplicates_removed);
                prop_assert_eq!(stats.duplicates_found, stats.duplicates_removed);
            }
        }

        #[test]
        fn prop_dedup_is_deterministic(records in arb_records()) {
            let strategy: DedupStrategy = "priority".parse().unwrap();
            let (a, _) = deduplicate(records.clone(), &strategy).unwrap();
            let (b, _) = deduplicate(records, &strategy).unwrap();
            prop_assert_eq!(a, b);
        }
    }
}
