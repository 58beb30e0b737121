//! PostgreSQL store tests
//!
//! Require Docker: `cargo test -p recon-etl --test postgres_store_test -- --ignored`

mod common;

use anyhow::Result;
use common::{init_tracing, operation, operations};
use recon_etl::model::OperationStatus;
use recon_etl::store::postgres::PgPoolSettings;
use recon_etl::store::OperationFilter;
use recon_etl::{
    MetricsStore, OperationStore, Pipeline, PipelineOptions, PostgresStore, RawBatch, RunStatus,
    UpsertLoader,
};
use std::sync::Arc;
use testcontainers::{runners::AsyncRunner, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tracing::info;

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_postgres_round_trip() -> Result<()> {
    init_tracing();

    let container = Postgres::default().with_tag("16-alpine").start().await?;
    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let url = format!("postgresql://postgres:postgres@{host}:{port}/postgres");
    info!(%url, "postgres container started");

    let store = Arc::new(PostgresStore::connect(&url, &PgPoolSettings::default()).await?);
    store.migrate().await?;
    // Migrations are idempotent
    store.migrate().await?;

    let dir = tempfile::tempdir()?;
    let pipeline = Pipeline::new(
        store.clone(),
        MetricsStore::new(dir.path()),
        PipelineOptions::default(),
    )?;

    let batch = RawBatch::from_records(&operations(1..=20, "1234.56"));
    let first = pipeline.run(&batch).await?;
    assert_eq!(first.status, RunStatus::Success);
    assert_eq!(first.rows_loaded, 20);

    let second = pipeline.run(&batch).await?;
    assert_eq!((second.rows_loaded, second.rows_updated), (0, 20));
    assert_eq!(store.count().await?, 20);

    let stored = store.get("OP-00000007").await?.expect("row stored");
    assert_eq!(stored.record, operation(7, "1234.56"));

    let mut pending = operation(21, "10.00");
    pending.status = OperationStatus::Pending;
    UpsertLoader::new(store.clone()).load(&[pending]).await?;

    let rows = store
        .query(&OperationFilter::default().with_status(OperationStatus::Pending))
        .await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].record.operation_id, "OP-00000021");

    let stats = store.table_stats().await?;
    assert_eq!(stats.total_rows, 21);
    assert!((stats.total_amount - (20.0 * 1234.56 + 10.0)).abs() < 0.001);
    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_postgres_concurrent_reversed_batches() -> Result<()> {
    init_tracing();

    let container = Postgres::default().with_tag("16-alpine").start().await?;
    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let url = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

    let store = Arc::new(PostgresStore::connect(&url, &PgPoolSettings::default()).await?);
    store.migrate().await?;

    // Same keys in opposite orders; rows are locked in key order, so neither
    // transaction waits on the other in a cycle
    let forward = operations(1..=2000, "10.00");
    let mut backward = operations(1..=2000, "20.00");
    backward.reverse();

    let a = UpsertLoader::new(store.clone());
    let b = UpsertLoader::new(store.clone());
    let (first, second) = tokio::join!(a.load(&forward), b.load(&backward));
    let (first, second) = (first?, second?);

    assert_eq!(first.rows_inserted + second.rows_inserted, 2000);
    assert_eq!(first.rows_updated + second.rows_updated, 2000);
    assert_eq!(store.count().await?, 2000);
    Ok(())
}
