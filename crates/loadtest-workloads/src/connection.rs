//! `connection` workload: check out a connection and run `SELECT 1`.
//!
//! Measures pool checkout plus round-trip cost and needs no schema.

use loadtest_engine::{OpError, OperationLoop};
use async_trait::async_trait;
use loadtest_engine::{DbPool, Metrics, RunConfig, RunContext, Workload, WorkloadError};
use tracing::debug;

pub const NAME: &str = "connection";

#[derive(Debug, Default)]
pub struct ConnectionWorkload;

impl ConnectionWorkload {
    pub fn create() -> Box<dyn Workload> {
        Box::new(Self)
    }
}

#[async_trait]
impl Workload for ConnectionWorkload {
    async fn setup(&self, _: &RunContext, _: &DbPool, _: &RunConfig) -> Result<(), WorkloadError> {
        Ok(())
    }

    async fn cleanup(&self, _: &RunContext, _: &DbPool, _: &RunConfig) -> Result<(), WorkloadError> {
        Ok(())
    }

    async fn run(
        &self,
        ctx: &RunContext,
        pool: &DbPool,
        config: &RunConfig,
        metrics: &Metrics,
    ) -> Result<(), WorkloadError> {
        let mut ops = OperationLoop::new(ctx, metrics, config);
        while ops
            .step(async {
                let client = pool.get().await?;
                client.simple_query("SELECT 1").await?;
                Ok::<_, OpError>(())
            })
            .await?
        {}
        debug!(
            "Worker {} finished {} connection round-trips",
            ctx.worker_id(),
            ops.succeeded()
        );
        Ok(())
    }
}
