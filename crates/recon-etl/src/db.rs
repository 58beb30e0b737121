//! Store selection and connection setup
//!
//! The backend is picked from the `DATABASE_URL` scheme: `sqlite:` opens (or creates)
//! a local file, `postgres://` / `postgresql://` a server pool.

use crate::config::DatabaseConfig;
use crate::error::{EtlError, Result};
use crate::store::postgres::PgPoolSettings;
use crate::store::{OperationStore, PostgresStore, SqliteStore};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Sqlite,
    Postgres,
}

impl Backend {
    pub fn from_url(url: &str) -> Result<Self> {
        let scheme = url.split(':').next().unwrap_or_default().to_lowercase();
        match scheme.as_str() {
            "sqlite" => Ok(Backend::Sqlite),
            "postgres" | "postgresql" => Ok(Backend::Postgres),
            _ => Err(EtlError::config(format!(
                "unsupported database URL scheme '{scheme}' (expected sqlite or postgresql)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
}

impl From<&DatabaseConfig> for DbConfig {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            url: config.url.clone(),
            max_connections: config.max_connections,
            min_connections: config.min_connections,
            connect_timeout_secs: config.connect_timeout_secs,
        }
    }
}

impl DbConfig {
    pub fn backend(&self) -> Result<Backend> {
        Backend::from_url(&self.url)
    }
}

/// Open the configured store. Migrations are not run here.
pub async fn connect_store(config: &DbConfig) -> Result<Arc<dyn OperationStore>> {
    let connect_timeout = Duration::from_secs(config.connect_timeout_secs);

    let store: Arc<dyn OperationStore> = match config.backend()? {
        Backend::Sqlite => Arc::new(
            SqliteStore::connect(&config.url, config.max_connections, connect_timeout).await?,
        ),
        Backend::Postgres => {
            let settings = PgPoolSettings {
                max_connections: config.max_connections,
                min_connections: config.min_connections,
                connect_timeout,
                ..Default::default()
            };
            Arc::new(PostgresStore::connect(&config.url, &settings).await?)
        }
    };

    Ok(store)
}

/// Round trip to the store; fails with `Connection` when it is unreachable
pub async fn health_check(store: &dyn OperationStore) -> Result<()> {
    store.count().await.map(|_| ())
}
