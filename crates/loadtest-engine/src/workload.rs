//! The workload contract the driver runs.
//!
//! Builtins implement [`Workload`] directly. Plugin workloads implement the
//! narrower [`crate::plugin::PluginWorkload`] and are adapted to this trait
//! on the host side.

use crate::config::RunConfig;
use crate::error::WorkloadError;
use crate::metrics::Metrics;
use crate::pool::DbPool;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A pluggable strategy that prepares, resets and drives load against a database.
///
/// A fresh instance is created for every run. During the run the driver shares
/// one instance between all workers and calls [`Workload::run`] once per
/// worker, so implementations must be `Send + Sync` and keep any per-worker
/// state local to `run`.
#[async_trait]
pub trait Workload: Send + Sync {
    /// Create the schema objects the workload needs.
    ///
    /// Must be idempotent: objects that already exist are detected and kept.
    async fn setup(
        &self,
        ctx: &RunContext,
        pool: &DbPool,
        config: &RunConfig,
    ) -> Result<(), WorkloadError>;

    /// Drop and recreate whatever `setup` creates.
    ///
    /// Must tolerate being called before `setup` ever ran.
    async fn cleanup(
        &self,
        ctx: &RunContext,
        pool: &DbPool,
        config: &RunConfig,
    ) -> Result<(), WorkloadError>;

    /// Execute the operation loop of one worker until `ctx` is cancelled or
    /// the workload's own iteration bound is reached.
    ///
    /// Per-operation failures go into `metrics` as they happen. Only
    /// conditions that invalidate the whole run are returned as errors.
    async fn run(
        &self,
        ctx: &RunContext,
        pool: &DbPool,
        config: &RunConfig,
        metrics: &Metrics,
    ) -> Result<(), WorkloadError>;
}

/// Why a guarded operation did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    /// The run is draining; the operation was abandoned and must not be counted.
    Cancelled,
    /// The operation exceeded the configured per-operation timeout.
    TimedOut,
}

/// Execution context handed to a workload: worker identity plus the run's
/// single cancellation signal and deadline.
#[derive(Debug, Clone)]
pub struct RunContext {
    worker_id: usize,
    workers: usize,
    cancel: CancellationToken,
    deadline: Instant,
    operation_timeout: Duration,
}

impl RunContext {
    /// Context for worker `worker_id` out of `workers`.
    pub fn new(
        worker_id: usize,
        workers: usize,
        cancel: CancellationToken,
        deadline: Instant,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            worker_id,
            workers,
            cancel,
            deadline,
            operation_timeout,
        }
    }

    /// Context used for setup and cleanup, outside the timed run.
    pub fn control(cancel: CancellationToken, operation_timeout: Duration) -> Self {
        Self::new(0, 1, cancel, Instant::now() + operation_timeout, operation_timeout)
    }

    /// Zero-based index of this worker.
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Total number of workers in the run.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Wall-clock instant at which the run's duration ends.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left until the deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Whether the run has started draining.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the run starts draining.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// The cancellation token, for workloads that spawn their own tasks.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run one database operation bounded by cancellation and the
    /// per-operation timeout.
    ///
    /// A cancelled operation is dropped mid-flight; callers must not record it.
    pub async fn guard<F: Future>(&self, op: F) -> Result<F::Output, Interrupted> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interrupted::Cancelled),
            res = tokio::time::timeout(self.operation_timeout, op) => {
                res.map_err(|_| Interrupted::TimedOut)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(timeout: Duration) -> RunContext {
        RunContext::new(
            1,
            4,
            CancellationToken::new(),
            Instant::now() + Duration::from_secs(60),
            timeout,
        )
    }

    #[tokio::test]
    async fn test_guard_completes() {
        let ctx = context(Duration::from_secs(1));
        assert_eq!(ctx.guard(async { 7 }).await, Ok(7));
        assert_eq!(ctx.worker_id(), 1);
        assert_eq!(ctx.workers(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_times_out() {
        let ctx = context(Duration::from_millis(50));
        let res = ctx
            .guard(tokio::time::sleep(Duration::from_secs(5)))
            .await;
        assert_eq!(res, Err(Interrupted::TimedOut));
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_observes_cancellation() {
        let ctx = context(Duration::from_secs(30));
        let token = ctx.token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });
        let res = ctx
            .guard(tokio::time::sleep(Duration::from_secs(10)))
            .await;
        assert_eq!(res, Err(Interrupted::Cancelled));
        assert!(ctx.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_saturates() {
        let ctx = RunContext::control(CancellationToken::new(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ctx.remaining(), Duration::ZERO);
    }
}
