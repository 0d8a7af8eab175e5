//! Host side of the plugin boundary: database access lent to plugins, and
//! the adapter that runs a plugin workload under the engine's control.

use super::loader::LoadedPlugin;
use super::{PluginDatabase, PluginWorkload};
use crate::config::RunConfig;
use crate::error::WorkloadError;
use crate::metrics::Metrics;
use crate::op::{OpError, OperationLoop};
use crate::pool::DbPool;
use crate::workload::{RunContext, Workload};
use async_trait::async_trait;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;
use tracing::debug;

// Host code runs inside plugin futures; a host panic must not unwind into
// plugin frames.
async fn contained<T, F>(fut: F) -> Result<T, WorkloadError>
where
    F: Future<Output = Result<T, WorkloadError>>,
{
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(WorkloadError::from_panic(panic)))
}

/// [`PluginDatabase`] over the run's connection pool.
#[derive(Clone)]
pub struct PoolDatabase {
    pool: DbPool,
}

impl PoolDatabase {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PluginDatabase for PoolDatabase {
    async fn batch_execute(&self, sql: &str) -> Result<(), WorkloadError> {
        contained(async {
            let client = self.pool.get().await?;
            client.batch_execute(sql).await?;
            Ok(())
        })
        .await
    }

    async fn execute(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64, WorkloadError> {
        contained(async {
            let client = self.pool.get().await?;
            let stmt = client.prepare_cached(sql).await?;
            Ok(client.execute(&stmt, params).await?)
        })
        .await
    }

    async fn query(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, WorkloadError> {
        contained(async {
            let client = self.pool.get().await?;
            let stmt = client.prepare_cached(sql).await?;
            Ok(client.query(&stmt, params).await?)
        })
        .await
    }

    async fn query_opt(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<Row>, WorkloadError> {
        contained(async {
            let client = self.pool.get().await?;
            let stmt = client.prepare_cached(sql).await?;
            Ok(client.query_opt(&stmt, params).await?)
        })
        .await
    }
}

/// Runs a plugin workload as an engine [`Workload`].
///
/// Holds the plugin so its library outlives the workload; field order drops
/// the workload first.
pub(crate) struct PluginWorkloadAdapter {
    inner: Box<dyn PluginWorkload>,
    _plugin: Arc<LoadedPlugin>,
}

impl PluginWorkloadAdapter {
    pub(crate) fn new(inner: Box<dyn PluginWorkload>, plugin: Arc<LoadedPlugin>) -> Self {
        Self {
            inner,
            _plugin: plugin,
        }
    }
}

async fn until_cancelled<F>(ctx: &RunContext, what: &str, fut: F) -> Result<(), WorkloadError>
where
    F: Future<Output = Result<(), WorkloadError>>,
{
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(WorkloadError::Other(format!("{what} interrupted"))),
        res = fut => res,
    }
}

#[async_trait]
impl Workload for PluginWorkloadAdapter {
    async fn setup(
        &self,
        ctx: &RunContext,
        pool: &DbPool,
        config: &RunConfig,
    ) -> Result<(), WorkloadError> {
        let db = PoolDatabase::new(pool.clone());
        until_cancelled(ctx, "setup", self.inner.setup(&db, config)).await
    }

    async fn cleanup(
        &self,
        ctx: &RunContext,
        pool: &DbPool,
        config: &RunConfig,
    ) -> Result<(), WorkloadError> {
        let db = PoolDatabase::new(pool.clone());
        until_cancelled(ctx, "cleanup", self.inner.cleanup(&db, config)).await
    }

    async fn run(
        &self,
        ctx: &RunContext,
        pool: &DbPool,
        config: &RunConfig,
        metrics: &Metrics,
    ) -> Result<(), WorkloadError> {
        let db = PoolDatabase::new(pool.clone());
        let mut worker = self.inner.worker(ctx.worker_id(), config)?;
        let mut ops = OperationLoop::new(ctx, metrics, config);

        loop {
            let more = ops
                .step(async { worker.operation(&db).await.map_err(OpError::from) })
                .await?;
            if !more {
                break;
            }
        }

        debug!(
            "Worker {} finished {} operations",
            ctx.worker_id(),
            ops.succeeded()
        );
        Ok(())
    }
}
