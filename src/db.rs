//! Store connection and schema management.
//!
//! The pool is a runtime-selected [`AnyPool`]; `database.driver` picks
//! `sqlite` or `postgres`.

use crate::config::DatabaseConfig;
use crate::error::StoreError;
use sqlx::any::{AnyPoolOptions, install_default_drivers};
use sqlx::migrate::Migrator;
use std::time::Duration;

pub use sqlx::AnyPool;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Smallest usable pool. The mailbox cursor holds one connection for the whole
/// run, so user fetches need at least one more.
pub const MIN_CONNECTIONS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Driver {
    Sqlite,
    Postgres,
}

impl Driver {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" => Some(Driver::Sqlite),
            "postgres" | "postgresql" | "pg" => Some(Driver::Postgres),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Driver::Sqlite => "sqlite",
            Driver::Postgres => "postgres",
        }
    }

    /// Turn a configured source into a connection URL for this driver.
    pub fn connection_url(self, source: &str) -> Result<String, StoreError> {
        let source = source.trim();
        match self {
            Driver::Sqlite if source.starts_with("sqlite:") => Ok(source.to_string()),
            Driver::Sqlite => Ok(format!("sqlite://{}?mode=rwc", source)),
            Driver::Postgres
                if source.starts_with("postgres://") || source.starts_with("postgresql://") =>
            {
                Ok(source.to_string())
            }
            Driver::Postgres => Err(StoreError::Connection {
                driver: self.name().to_string(),
                source: sqlx::Error::Configuration(
                    format!("expected a postgres:// URL, got '{}'", source).into(),
                ),
            }),
        }
    }
}

/// Open a pool for `driver` against `source`.
pub async fn connect(
    driver: &str,
    source: &str,
    max_connections: u32,
) -> Result<AnyPool, StoreError> {
    let kind =
        Driver::parse(driver).ok_or_else(|| StoreError::UnsupportedDriver(driver.to_string()))?;
    if max_connections < MIN_CONNECTIONS {
        return Err(StoreError::Connection {
            driver: kind.name().to_string(),
            source: sqlx::Error::Configuration(
                format!(
                    "max_connections must be at least {}, got {}",
                    MIN_CONNECTIONS, max_connections
                )
                .into(),
            ),
        });
    }
    let url = kind.connection_url(source)?;

    install_default_drivers();

    log::debug!(
        "opening {} pool with {} connections",
        kind.name(),
        max_connections
    );

    AnyPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&url)
        .await
        .map_err(|source| StoreError::Connection {
            driver: kind.name().to_string(),
            source,
        })
}

pub async fn connect_with_config(config: &DatabaseConfig) -> Result<AnyPool, StoreError> {
    connect(&config.driver, &config.path, config.max_connections).await
}

/// Apply pending schema migrations. Already-applied migrations are skipped.
pub async fn run_migrations(pool: &AnyPool) -> Result<(), StoreError> {
    log::info!("checking database migration state");
    MIGRATOR.run(pool).await?;
    log::info!("database migrations up to date");
    Ok(())
}

pub fn migrator() -> &'static Migrator {
    &MIGRATOR
}
