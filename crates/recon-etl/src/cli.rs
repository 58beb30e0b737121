//! Command-line interface definition for the `recon-etl` binary

use crate::dedup::DedupStrategy;
use crate::error::{EtlError, Result};
use crate::model::{Channel, Column, Currency, OperationStatus, OperationType};
use crate::store::OperationFilter;
use crate::validation::parse_timestamp;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Reconciliation ETL for banking operations
#[derive(Parser, Debug)]
#[command(name = "recon-etl")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Database URL (sqlite://... or postgresql://...)
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    /// Directory holding run metrics
    #[arg(long, env = "RECON_METRICS_DIR", global = true)]
    pub metrics_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the pipeline over one or more CSV files, one run per file
    Run(RunArgs),

    /// Inspect persisted run metrics
    Metrics {
        #[command(subcommand)]
        command: MetricsCommand,
    },

    /// Show aggregate statistics of the operations table
    Stats,

    /// List stored operations
    Query(QueryArgs),

    /// Report duplicate rows of a CSV file without loading it
    Duplicates {
        /// CSV file to inspect
        input: PathBuf,

        /// Key columns (defaults to numero_operacion)
        #[arg(short, long, value_delimiter = ',')]
        key: Vec<String>,
    },
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// CSV files to process
    #[arg(short, long, required = true, num_args = 1..)]
    pub input: Vec<PathBuf>,

    /// Deduplication strategy: hash, key, priority or merge
    #[arg(short, long)]
    pub strategy: Option<String>,

    /// Key columns for key, priority and merge strategies
    #[arg(short, long, value_delimiter = ',')]
    pub key: Vec<String>,

    /// Column ranking duplicates for the priority strategy
    #[arg(long)]
    pub priority_column: Option<String>,

    /// Sort order of the priority column
    #[arg(long, default_value = "desc")]
    pub order: String,

    /// Merge rules as column=reducer (first, last, max, min, sum)
    #[arg(long, value_delimiter = ',')]
    pub merge: Vec<String>,

    /// Control total the batch amounts should add up to
    #[arg(long)]
    pub expected_total: Option<String>,

    /// Maximum number of files processed at once
    #[arg(long, env = "RECON_MAX_CONCURRENT_RUNS")]
    pub max_concurrent: Option<usize>,

    /// Write each deduplicated set as CSV into this directory
    #[arg(long, env = "RECON_PROCESSED_DIR")]
    pub processed_dir: Option<PathBuf>,
}

impl RunArgs {
    /// Resolve the flags into a strategy, falling back to `default` for the name
    pub fn dedup_strategy(&self, default: &str) -> Result<DedupStrategy> {
        let name = self.strategy.as_deref().unwrap_or(default);
        let keys: Vec<&str> = if self.key.is_empty() {
            vec![Column::OperationId.name()]
        } else {
            self.key.iter().map(String::as_str).collect()
        };

        let strategy = match name.parse::<DedupStrategy>()? {
            DedupStrategy::Hash => DedupStrategy::Hash,
            DedupStrategy::Key { .. } => DedupStrategy::key(&keys)?,
            DedupStrategy::Priority { .. } => DedupStrategy::priority(
                &keys,
                self.priority_column
                    .as_deref()
                    .unwrap_or(Column::Timestamp.name()),
                self.order.parse()?,
            )?,
            DedupStrategy::Merge { .. } => {
                let rules = self
                    .merge
                    .iter()
                    .map(|rule| {
                        rule.split_once('=').ok_or_else(|| {
                            EtlError::config(format!(
                                "merge rule '{rule}' must look like column=reducer"
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                DedupStrategy::merge(&keys, &rules)?
            }
        };

        strategy.check()?;
        Ok(strategy)
    }
}

#[derive(Subcommand, Debug)]
pub enum MetricsCommand {
    /// Show the metrics of one run
    Show {
        /// Pipeline id, e.g. etl_20250115_100000_0a1b2c3d
        pipeline_id: String,
    },

    /// Aggregate statistics over all runs
    Summary,

    /// List recent runs, newest first
    List {
        /// Limit number of runs to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Args, Debug)]
pub struct QueryArgs {
    /// Operation status (COMPLETADA, PENDIENTE, FALLIDA)
    #[arg(long)]
    pub status: Option<OperationStatus>,

    /// Channel (WEB, MOBILE, ATM, SUCURSAL)
    #[arg(long)]
    pub channel: Option<Channel>,

    /// Operation type (DEPOSITO, RETIRO, TRANSFERENCIA)
    #[arg(long = "type")]
    pub operation_type: Option<OperationType>,

    /// Currency (PEN, USD)
    #[arg(long)]
    pub currency: Option<Currency>,

    /// Earliest operation timestamp
    #[arg(long)]
    pub from: Option<String>,

    /// Latest operation timestamp
    #[arg(long)]
    pub to: Option<String>,

    /// Limit number of rows to show
    #[arg(short, long, default_value = "50")]
    pub limit: i64,
}

impl QueryArgs {
    pub fn filter(&self) -> Result<OperationFilter> {
        let timestamp = |raw: &str| {
            parse_timestamp(raw).ok_or_else(|| EtlError::config(format!("invalid timestamp '{raw}'")))
        };

        let mut filter = OperationFilter::default().with_limit(self.limit);
        if let Some(status) = self.status {
            filter = filter.with_status(status);
        }
        if let Some(channel) = self.channel {
            filter = filter.with_channel(channel);
        }
        if let Some(kind) = self.operation_type {
            filter = filter.with_operation_type(kind);
        }
        if let Some(currency) = self.currency {
            filter = filter.with_currency(currency);
        }
        if let Some(from) = &self.from {
            filter = filter.since(timestamp(from)?);
        }
        if let Some(to) = &self.to {
            filter = filter.until(timestamp(to)?);
        }
        Ok(filter)
    }
}
