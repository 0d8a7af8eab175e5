//! `simple` workload: a read-heavy CRUD mix over one table.
//!
//! The table holds `scale * rows_per_scale` seeded rows. Each operation picks
//! a random key in twice that range, so some reads and deletes miss and some
//! inserts land on fresh keys.

use loadtest_engine::{OpError, OperationLoop};
use async_trait::async_trait;
use loadtest_engine::{DbPool, Metrics, RunConfig, RunContext, Workload, WorkloadError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

pub const NAME: &str = "simple";

pub const TABLE: &str = "pgstress_simple";

/// Default number of seeded rows per unit of scale.
pub const DEFAULT_ROWS_PER_SCALE: u64 = 1000;

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS pgstress_simple (\
    id BIGINT PRIMARY KEY, \
    name TEXT NOT NULL, \
    value BIGINT NOT NULL, \
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now())";

const DROP_TABLE: &str = "DROP TABLE IF EXISTS pgstress_simple";

const SEED_ROWS: &str = "INSERT INTO pgstress_simple (id, name, value) \
    SELECT g, 'row-' || g, g FROM generate_series(1, $1::BIGINT) AS g \
    ON CONFLICT (id) DO NOTHING";

const SELECT_ROW: &str = "SELECT name, value FROM pgstress_simple WHERE id = $1";

const UPDATE_ROW: &str =
    "UPDATE pgstress_simple SET value = value + 1, updated_at = now() WHERE id = $1";

const INSERT_ROW: &str = "INSERT INTO pgstress_simple (id, name, value) VALUES ($1, $2, $3) \
    ON CONFLICT (id) DO NOTHING";

const DELETE_ROW: &str = "DELETE FROM pgstress_simple WHERE id = $1";

/// One kind of operation in the mix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Select,
    Update,
    Insert,
    Delete,
}

impl Operation {
    /// Map a roll in `0..100` onto the mix: 50% select, 30% update,
    /// 10% insert, 10% delete.
    pub fn from_roll(roll: u32) -> Self {
        match roll {
            0..=49 => Operation::Select,
            50..=79 => Operation::Update,
            80..=89 => Operation::Insert,
            _ => Operation::Delete,
        }
    }
}

/// Number of rows seeded for `config`.
pub fn seeded_rows(config: &RunConfig) -> i64 {
    let per_scale = config.option_u64("rows_per_scale", DEFAULT_ROWS_PER_SCALE);
    let rows = config.scale.max(1).saturating_mul(per_scale);
    i64::try_from(rows).unwrap_or(i64::MAX).max(1)
}

#[derive(Debug, Default)]
pub struct SimpleWorkload;

impl SimpleWorkload {
    pub fn create() -> Box<dyn Workload> {
        Box::new(Self)
    }

    async fn seed(&self, pool: &DbPool, config: &RunConfig) -> Result<(), WorkloadError> {
        let client = pool.get().await?;
        client.batch_execute(CREATE_TABLE).await?;
        let rows = seeded_rows(config);
        let inserted = client.execute(SEED_ROWS, &[&rows]).await?;
        info!("Table {} ready: {} of {} rows inserted", TABLE, inserted, rows);
        Ok(())
    }
}

#[async_trait]
impl Workload for SimpleWorkload {
    async fn setup(
        &self,
        _: &RunContext,
        pool: &DbPool,
        config: &RunConfig,
    ) -> Result<(), WorkloadError> {
        self.seed(pool, config).await
    }

    async fn cleanup(
        &self,
        _: &RunContext,
        pool: &DbPool,
        config: &RunConfig,
    ) -> Result<(), WorkloadError> {
        {
            let client = pool.get().await?;
            client.batch_execute(DROP_TABLE).await?;
            info!("Dropped table {}", TABLE);
        }
        self.seed(pool, config).await
    }

    async fn run(
        &self,
        ctx: &RunContext,
        pool: &DbPool,
        config: &RunConfig,
        metrics: &Metrics,
    ) -> Result<(), WorkloadError> {
        let key_space = seeded_rows(config).saturating_mul(2);
        let mut rng = StdRng::from_entropy();
        let mut ops = OperationLoop::new(ctx, metrics, config);

        loop {
            let op = Operation::from_roll(rng.gen_range(0..100));
            let id: i64 = rng.gen_range(1..=key_space);
            let value: i64 = rng.gen();
            let more = ops
                .step(async move {
                    let client = pool.get().await?;
                    match op {
                        Operation::Select => {
                            let stmt = client.prepare_cached(SELECT_ROW).await?;
                            client.query_opt(&stmt, &[&id]).await?;
                        }
                        Operation::Update => {
                            let stmt = client.prepare_cached(UPDATE_ROW).await?;
                            client.execute(&stmt, &[&id]).await?;
                        }
                        Operation::Insert => {
                            let stmt = client.prepare_cached(INSERT_ROW).await?;
                            let name = format!("row-{id}");
                            client.execute(&stmt, &[&id, &name, &value]).await?;
                        }
                        Operation::Delete => {
                            let stmt = client.prepare_cached(DELETE_ROW).await?;
                            client.execute(&stmt, &[&id]).await?;
                        }
                    }
                    Ok::<_, OpError>(())
                })
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
