//! Recon ETL Library
//!
//! Reconciles batches of banking operations into a relational store.
//!
//! # Overview
//!
//! A [`Pipeline`] run goes through four stages:
//!
//! - **Extract**: read a [`RawBatch`] from a [`RecordSource`] (CSV file or memory)
//! - **Validate**: apply per-column rules, keep valid rows, report the rest
//! - **Deduplicate**: collapse duplicates with a [`DedupStrategy`]
//! - **Load**: upsert into an [`OperationStore`] in one transaction
//!
//! Every run produces [`PipelineMetrics`], persisted as JSON by a [`MetricsStore`].
//!
//! # Example
//!
//! ```no_run
//! use recon_etl::{CsvSource, MetricsStore, Pipeline, PipelineOptions, SqliteStore};
//! use recon_etl::store::OperationStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqliteStore::in_memory().await?);
//!     store.migrate().await?;
//!
//!     let pipeline = Pipeline::new(store, MetricsStore::new("./data/metrics"), PipelineOptions::default())?;
//!     let metrics = pipeline.run(&CsvSource::new("operaciones.csv")).await?;
//!     println!("{} rows loaded", metrics.rows_loaded);
//!     Ok(())
//! }
//! ```
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod cli;
pub mod config;
pub mod db;
pub mod dedup;
pub mod error;
pub mod load;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod source;
pub mod store;
pub mod validation;

// Re-export commonly used types
pub use config::Config;
pub use dedup::{deduplicate, find_duplicates, DedupStats, DedupStrategy, Reducer, SortOrder};
pub use error::{EtlError, Result};
pub use load::{LoadStats, UpsertLoader};
pub use metrics::{AggregateStats, MetricsStore, PipelineMetrics, RunStatus};
pub use model::{Column, OperationRecord};
pub use pipeline::{BatchRunner, Pipeline, PipelineOptions, RunState};
pub use source::{CsvSource, RawBatch, RecordSource};
pub use store::{OperationStore, PostgresStore, SqliteStore};
pub use validation::{validate, ValidationOptions, ValidationReport, Validator};
