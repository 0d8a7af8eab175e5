//! Connection pool adapter.
//!
//! The engine does not pool connections itself; it sizes and hands out a
//! `deadpool-postgres` pool over `tokio-postgres`. Pool construction is lazy:
//! no connection is opened until the first checkout.

use crate::config::DatabaseConfig;
use crate::error::EngineError;
use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, PoolConfig, RecyclingMethod, Runtime};
use std::collections::HashSet;
use std::time::Duration;
use tokio_postgres::NoTls;
use tracing::{debug, info};

/// Pool handle shared by every worker of a run.
pub type DbPool = deadpool_postgres::Pool;

/// Pooled connection checked out from a [`DbPool`].
pub type PooledClient = deadpool_postgres::Object;

/// Build a pool holding at most `max_size` connections.
///
/// `wait_timeout` bounds how long a checkout may wait for a free connection.
pub fn build_pool(
    database: &DatabaseConfig,
    max_size: usize,
    wait_timeout: Duration,
) -> Result<DbPool, EngineError> {
    if max_size == 0 {
        return Err(EngineError::Config(
            "pool size must be greater than 0".to_string(),
        ));
    }

    let mut cfg = Config::new();
    match &database.url {
        Some(url) => cfg.url = Some(url.clone()),
        None => {
            cfg.host = Some(database.host.clone());
            cfg.port = Some(database.port);
            cfg.user = Some(database.user.clone());
            cfg.password = database.password.clone();
            cfg.dbname = Some(database.dbname.clone());
        }
    }
    cfg.application_name = Some(database.application_name.clone());
    cfg.connect_timeout = Some(database.connect_timeout);
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });

    let mut pool_config = PoolConfig::new(max_size);
    pool_config.timeouts.wait = Some(wait_timeout);
    pool_config.timeouts.create = Some(database.connect_timeout);
    pool_config.timeouts.recycle = Some(wait_timeout);
    cfg.pool = Some(pool_config);

    let pool = cfg.create_pool(Some(Runtime::Tokio1), NoTls)?;
    debug!(
        "Created connection pool for {} (max_size={})",
        database.display_target(),
        max_size
    );
    Ok(pool)
}

/// Check out one connection and run a trivial query.
pub async fn probe(pool: &DbPool) -> Result<(), EngineError> {
    let client = pool
        .get()
        .await
        .map_err(|e| EngineError::Pool(format!("database unreachable: {e}")))?;
    client.simple_query("SELECT 1").await?;
    info!("Database reachable (pool max_size={})", pool.status().max_size);
    Ok(())
}

/// Catalog facts about the target database needed to admit a plugin.
#[async_trait]
pub trait DatabaseCatalog: Send + Sync {
    /// Extensions already created in the target database.
    async fn installed_extensions(&self) -> Result<HashSet<String>, EngineError>;

    /// Extensions the server could create with `CREATE EXTENSION`.
    async fn available_extensions(&self) -> Result<HashSet<String>, EngineError>;

    /// `server_version_num`, e.g. 160002 for PostgreSQL 16.2.
    async fn server_version_num(&self) -> Result<u32, EngineError>;
}

#[async_trait]
impl DatabaseCatalog for DbPool {
    async fn installed_extensions(&self) -> Result<HashSet<String>, EngineError> {
        let client = self.get().await?;
        let rows = client.query("SELECT extname FROM pg_extension", &[]).await?;
        Ok(rows.iter().map(|row| row.get::<_, String>(0)).collect())
    }

    async fn available_extensions(&self) -> Result<HashSet<String>, EngineError> {
        let client = self.get().await?;
        let rows = client
            .query("SELECT name FROM pg_available_extensions", &[])
            .await?;
        Ok(rows.iter().map(|row| row.get::<_, String>(0)).collect())
    }

    async fn server_version_num(&self) -> Result<u32, EngineError> {
        let client = self.get().await?;
        let row = client.query_one("SHOW server_version_num", &[]).await?;
        let raw: String = row.get(0);
        raw.trim()
            .parse()
            .map_err(|_| EngineError::Pool(format!("unexpected server_version_num '{raw}'")))
    }
}

/// Major version from a `server_version_num` value (160002 -> 16, 90624 -> 9).
pub fn major_version(version_num: u32) -> u32 {
    version_num / 10_000
}
