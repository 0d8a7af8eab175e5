//! Per-operation bookkeeping shared by builtin workloads and the host side
//! of plugin workloads.

use crate::config::RunConfig;
use crate::error::WorkloadError;
use crate::metrics::{ErrorCategory, Metrics};
use crate::workload::{Interrupted, RunContext};
use std::future::Future;
use tokio::time::Instant;

/// Consecutive failed checkouts tolerated before a worker that never
/// completed an operation gives up.
pub const DEFAULT_MAX_POOL_FAILURES: u64 = 100;

/// Failure of one database operation.
#[derive(Debug)]
pub enum OpError {
    Pool(deadpool_postgres::PoolError),
    Query(tokio_postgres::Error),
    /// Anything else the workload reported.
    Workload(WorkloadError),
}

impl From<deadpool_postgres::PoolError> for OpError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        OpError::Pool(err)
    }
}

impl From<tokio_postgres::Error> for OpError {
    fn from(err: tokio_postgres::Error) -> Self {
        OpError::Query(err)
    }
}

impl From<WorkloadError> for OpError {
    fn from(err: WorkloadError) -> Self {
        match err {
            WorkloadError::PostgreSQL(e) => OpError::Query(e),
            WorkloadError::Pool(e) => OpError::Pool(e),
            other => OpError::Workload(other),
        }
    }
}

/// Drives one worker's operations: bounds each by the run context, records
/// the outcome, and decides when the worker should stop.
pub struct OperationLoop<'a> {
    ctx: &'a RunContext,
    metrics: &'a Metrics,
    succeeded: u64,
    pool_failures: u64,
    max_pool_failures: u64,
}

impl<'a> OperationLoop<'a> {
    pub fn new(ctx: &'a RunContext, metrics: &'a Metrics, config: &RunConfig) -> Self {
        Self {
            ctx,
            metrics,
            succeeded: 0,
            pool_failures: 0,
            max_pool_failures: config.option_u64("max_pool_failures", DEFAULT_MAX_POOL_FAILURES),
        }
    }

    /// Operations this worker completed.
    pub fn succeeded(&self) -> u64 {
        self.succeeded
    }

    /// Run one operation and record its outcome.
    ///
    /// Returns `Ok(false)` once the run is draining; the interrupted operation
    /// is not recorded. Returns an error when this worker has never obtained
    /// a connection and the pool keeps failing, and for workload errors that
    /// no further operation can fix (a panic or a configuration error).
    pub async fn step<F, T>(&mut self, op: F) -> Result<bool, WorkloadError>
    where
        F: Future<Output = Result<T, OpError>>,
    {
        if self.ctx.is_cancelled() {
            return Ok(false);
        }

        let started = Instant::now();
        match self.ctx.guard(op).await {
            Err(Interrupted::Cancelled) => return Ok(false),
            Err(Interrupted::TimedOut) => {
                self.metrics.record_error_category(ErrorCategory::Timeout);
            }
            Ok(Ok(_)) => {
                self.metrics.record_success_with_latency(started.elapsed());
                self.succeeded += 1;
                self.pool_failures = 0;
            }
            Ok(Err(OpError::Query(e))) => self.metrics.record_pg_error(&e),
            Ok(Err(OpError::Pool(e))) => {
                self.metrics.record_pool_error(&e);
                self.pool_failures += 1;
                if self.succeeded == 0 && self.pool_failures >= self.max_pool_failures {
                    return Err(WorkloadError::Pool(e));
                }
            }
            Ok(Err(OpError::Workload(e))) => match e {
                WorkloadError::Panicked(_) | WorkloadError::Config(_) => return Err(e),
                _ => self.metrics.record_error_category(ErrorCategory::Other),
            },
        }
        Ok(true)
    }
}
