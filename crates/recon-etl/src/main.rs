//! Recon ETL - Main entry point

use anyhow::{bail, Context};
use clap::Parser;
use recon_common::logging::{init_logging, LogConfig, LogLevel};
use recon_etl::cli::{Cli, Commands, MetricsCommand, QueryArgs, RunArgs};
use recon_etl::db::{connect_store, health_check, DbConfig};
use recon_etl::model::Column;
use recon_etl::source::RecordSource;
use recon_etl::validation::{parse_amount, ValidationOptions};
use recon_etl::{
    find_duplicates, BatchRunner, Config, CsvSource, MetricsStore, OperationStore, Pipeline,
    PipelineMetrics, PipelineOptions, RunStatus, Validator,
};
use std::process;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let base = LogConfig::builder()
        .level(if cli.verbose {
            LogLevel::Debug
        } else {
            LogLevel::Info
        })
        .log_file_prefix("recon-etl")
        .filter_directives("sqlx=warn")
        .build();

    // Environment variables take precedence
    let log_config = match base.clone().merge_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: ignoring invalid logging environment: {e:#}");
            base
        }
    };

    let _guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {e:#}");
            None
        }
    };

    if let Err(e) = execute_command(cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn execute_command(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(url) = cli.database_url {
        config.database.url = url;
    }
    if let Some(dir) = cli.metrics_dir {
        config.pipeline.metrics_dir = dir;
    }
    let metrics_store = MetricsStore::new(&config.pipeline.metrics_dir);

    match cli.command {
        Commands::Run(args) => run(&config, metrics_store, args).await,
        Commands::Metrics { command } => show_metrics(&metrics_store, command).await,
        Commands::Stats => stats(&config).await,
        Commands::Query(args) => query(&config, args).await,
        Commands::Duplicates { input, key } => {
            let columns = if key.is_empty() {
                vec![Column::OperationId]
            } else {
                Column::parse_list(&key)?
            };
            let batch = CsvSource::new(&input).extract().await?;
            let (records, report) = Validator::new()?.validate(&batch, &ValidationOptions::default())?;
            let duplicates = find_duplicates(&records, &columns);

            println!(
                "{}: {} rows, {} valid, {} rows share a key",
                input.display(),
                report.total_rows,
                report.valid_rows,
                duplicates.len()
            );
            for record in &duplicates {
                let key: Vec<String> = columns.iter().map(|c| record.value(*c).to_string()).collect();
                println!("  {}  {}  {}", key.join(" | "), record.amount, record.content_hash);
            }
            Ok(())
        }
    }
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn OperationStore>> {
    let store = connect_store(&DbConfig::from(&config.database))
        .await
        .context("Failed to connect to database")?;
    store.migrate().await.context("Failed to run migrations")?;
    health_check(store.as_ref())
        .await
        .context("Database health check failed")?;
    Ok(store)
}

async fn run(config: &Config, metrics_store: MetricsStore, args: RunArgs) -> anyhow::Result<()> {
    let strategy = args.dedup_strategy(&config.pipeline.dedup_strategy)?;

    let mut validation = ValidationOptions::default();
    if let Some(raw) = &args.expected_total {
        let total = parse_amount(raw).with_context(|| format!("Invalid expected total '{raw}'"))?;
        validation = validation.with_expected_total(total);
    }

    let options = PipelineOptions {
        strategy,
        validation,
        processed_dir: args
            .processed_dir
            .or_else(|| config.pipeline.processed_dir.clone()),
        conflict_key: None,
    };

    let store = open_store(config).await?;
    let pipeline = Arc::new(Pipeline::new(store, metrics_store, options)?);
    let runner = BatchRunner::new(
        pipeline,
        args.max_concurrent
            .unwrap_or(config.pipeline.max_concurrent_runs),
    );

    let sources: Vec<Arc<dyn RecordSource>> = args
        .input
        .iter()
        .map(|path| Arc::new(CsvSource::new(path)) as Arc<dyn RecordSource>)
        .collect();
    info!(files = sources.len(), "batch_started");

    let mut failed = 0;
    for (path, result) in args.input.iter().zip(runner.run_all(sources).await) {
        match result {
            Ok(metrics) => {
                print_run(&metrics);
                if metrics.status != RunStatus::Success {
                    failed += 1;
                }
            }
            Err(e) => {
                println!("{}: could not record run: {e}", path.display());
                failed += 1;
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} runs failed", args.input.len());
    }
    Ok(())
}

fn print_run(metrics: &PipelineMetrics) {
    println!(
        "{} [{}] {}",
        metrics.pipeline_id,
        metrics.status.as_str(),
        metrics.input_source
    );
    println!(
        "  input {}  valid {}  invalid {}  duplicates removed {}",
        metrics.input_rows,
        metrics.validation_passed,
        metrics.validation_failed,
        metrics.duplicates_removed
    );
    println!(
        "  inserted {}  updated {}  failed {}  ({:.2}s)",
        metrics.rows_loaded, metrics.rows_updated, metrics.load_failed, metrics.processing_time_seconds
    );
    for warning in &metrics.validation_warnings {
        println!("  warning: {warning}");
    }
    if let Some(message) = &metrics.error_message {
        println!("  error: {message}");
    }
}

async fn show_metrics(metrics_store: &MetricsStore, command: MetricsCommand) -> anyhow::Result<()> {
    match command {
        MetricsCommand::Show { pipeline_id } => {
            let Some(metrics) = metrics_store.load(&pipeline_id).await? else {
                bail!("No metrics found for '{pipeline_id}'");
            };
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        }
        MetricsCommand::Summary => {
            let stats = metrics_store.aggregate().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        MetricsCommand::List { limit } => {
            let runs = metrics_store.list().await?;
            if runs.is_empty() {
                println!("No runs recorded in {}", metrics_store.dir().display());
            }
            for run in runs.iter().take(limit) {
                let summary = run.summary();
                println!(
                    "{}  {:<7}  {:>6} in  {:>6} loaded  {:>5.1}%  {}",
                    summary.pipeline_id,
                    summary.status.as_str(),
                    summary.total_input,
                    summary.total_loaded,
                    summary.success_rate * 100.0,
                    run.start_time.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
    }
    Ok(())
}

async fn stats(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let stats = store.table_stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn query(config: &Config, args: QueryArgs) -> anyhow::Result<()> {
    let filter = args.filter()?;

    let store = open_store(config).await?;
    for row in store.query(&filter).await? {
        let record = &row.record;
        println!(
            "{}  {}  {:<13}  {:>12} {}  {:<10}  {}",
            record.timestamp,
            record.operation_id,
            record.operation_type.as_str(),
            record.amount,
            record.currency.as_str(),
            record.status.as_str(),
            record.channel.as_str()
        );
    }
    Ok(())
}
