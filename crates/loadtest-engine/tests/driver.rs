//! Driver lifecycle tests.
//!
//! Workloads here are in-process fakes and the pool is built lazily against
//! an unroutable address, so no database is needed. Time is paused, so
//! multi-second runs finish instantly.

use async_trait::async_trait;
use loadtest_engine::{
    DatabaseConfig, DbPool, Driver, EngineError, ErrorCategory, Metrics, RunConfig, RunContext,
    RunState, SetupMode, Workload, WorkloadError,
};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn lazy_pool(max_size: usize) -> DbPool {
    loadtest_engine::pool::build_pool(
        &DatabaseConfig::from_url("postgresql://pgstress@127.0.0.1:1/pgstress"),
        max_size,
        Duration::from_millis(100),
    )
    .unwrap()
}

/// Records a fixed quota per worker, then waits for the run to drain.
struct QuotaWorkload {
    successes_per_worker: u64,
    timeouts: u64,
}

#[async_trait]
impl Workload for QuotaWorkload {
    async fn setup(&self, _: &RunContext, _: &DbPool, _: &RunConfig) -> Result<(), WorkloadError> {
        Ok(())
    }

    async fn cleanup(&self, _: &RunContext, _: &DbPool, _: &RunConfig) -> Result<(), WorkloadError> {
        Ok(())
    }

    async fn run(
        &self,
        ctx: &RunContext,
        _: &DbPool,
        _: &RunConfig,
        metrics: &Metrics,
    ) -> Result<(), WorkloadError> {
        for i in 0..self.successes_per_worker {
            metrics.record_success_with_latency(Duration::from_micros(100 + i));
        }
        // Spread timeouts round-robin across workers.
        let mut n = ctx.worker_id() as u64;
        while n < self.timeouts {
            metrics.record_error_category(ErrorCategory::Timeout);
            n += ctx.workers() as u64;
        }
        ctx.cancelled().await;
        Ok(())
    }
}

/// Completes one operation every 10ms until cancelled.
struct TickingWorkload {
    done: Arc<AtomicU64>,
}

#[async_trait]
impl Workload for TickingWorkload {
    async fn setup(&self, _: &RunContext, _: &DbPool, _: &RunConfig) -> Result<(), WorkloadError> {
        Ok(())
    }

    async fn cleanup(&self, _: &RunContext, _: &DbPool, _: &RunConfig) -> Result<(), WorkloadError> {
        Ok(())
    }

    async fn run(
        &self,
        ctx: &RunContext,
        _: &DbPool,
        _: &RunConfig,
        metrics: &Metrics,
    ) -> Result<(), WorkloadError> {
        while ctx
            .guard(tokio::time::sleep(Duration::from_millis(10)))
            .await
            .is_ok()
        {
            metrics.record_success();
            self.done.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Misbehaviour {
    FailSetup,
    FailRun,
    Panic,
    IgnoreCancel,
}

/// Worker 0 (or 2 for panics) misbehaves; the others drain politely.
struct FaultyWorkload {
    mode: Misbehaviour,
    runs: Arc<AtomicUsize>,
    returned: Arc<AtomicUsize>,
}

impl FaultyWorkload {
    fn new(mode: Misbehaviour) -> Self {
        Self {
            mode,
            runs: Arc::new(AtomicUsize::new(0)),
            returned: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Workload for FaultyWorkload {
    async fn setup(&self, _: &RunContext, _: &DbPool, _: &RunConfig) -> Result<(), WorkloadError> {
        match self.mode {
            Misbehaviour::FailSetup => Err(WorkloadError::Other("relation already broken".into())),
            _ => Ok(()),
        }
    }

    async fn cleanup(&self, _: &RunContext, _: &DbPool, _: &RunConfig) -> Result<(), WorkloadError> {
        Ok(())
    }

    async fn run(
        &self,
        ctx: &RunContext,
        _: &DbPool,
        _: &RunConfig,
        metrics: &Metrics,
    ) -> Result<(), WorkloadError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        match (self.mode, ctx.worker_id()) {
            (Misbehaviour::FailRun, 0) => {
                return Err(WorkloadError::Other("cannot acquire any connection".into()))
            }
            (Misbehaviour::Panic, 2) => panic!("boom"),
            (Misbehaviour::IgnoreCancel, 0) => std::future::pending::<()>().await,
            _ => {}
        }
        metrics.record_success();
        ctx.cancelled().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.returned.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_scenario_four_workers_eight_connections() {
    let config = RunConfig::new("quota", 4, 8).with_duration(Duration::from_secs(2));
    let driver = Driver::new(config).unwrap();
    let pool = lazy_pool(8);

    let report = driver
        .run_with_pool(
            Box::new(QuotaWorkload {
                successes_per_worker: 250,
                timeouts: 5,
            }),
            &pool,
            SetupMode::Skip,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.metrics.completed, 1000);
    assert_eq!(report.metrics.errors, 5);
    assert_eq!(report.metrics.error_types.len(), 1);
    assert_eq!(report.metrics.error_count("timeout"), 5);
    assert!(report.metrics.elapsed >= Duration::from_secs(2));
    assert!(!report.cancelled_externally);
    assert_eq!(report.aborted_workers, 0);
    assert_eq!(report.metrics.late_writes, 0);
    assert_eq!(driver.state(), RunState::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_clean_run_has_no_errors() {
    let driver = Driver::new(RunConfig::new("quota", 1, 1).with_duration(Duration::from_millis(50)))
        .unwrap();
    let report = driver
        .run_with_pool(
            Box::new(QuotaWorkload {
                successes_per_worker: 3,
                timeouts: 0,
            }),
            &lazy_pool(1),
            SetupMode::Setup,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.metrics.errors, 0);
    assert!(report.metrics.completed > 0);
    assert!(report.metrics.throughput() > 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_external_cancellation_counts_exactly() {
    let config = RunConfig::new("ticking", 3, 3).with_duration(Duration::from_secs(60));
    let driver = Driver::new(config).unwrap();
    let done = Arc::new(AtomicU64::new(0));
    let cancel = CancellationToken::new();

    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(505)).await;
        stopper.cancel();
    });

    let report = driver
        .run_with_pool(
            Box::new(TickingWorkload { done: done.clone() }),
            &lazy_pool(3),
            SetupMode::Skip,
            cancel,
        )
        .await
        .unwrap();

    assert!(report.cancelled_externally);
    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.aborted_workers, 0);
    assert!(report.metrics.completed > 0);
    assert_eq!(report.metrics.completed, done.load(Ordering::SeqCst));
    assert!(report.metrics.elapsed < Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn test_run_failure_waits_for_all_workers() {
    let driver = Driver::new(RunConfig::new("faulty", 4, 4).with_duration(Duration::from_secs(30)))
        .unwrap();
    let workload = FaultyWorkload::new(Misbehaviour::FailRun);
    let returned = workload.returned.clone();

    let err = driver
        .run_with_pool(
            Box::new(workload),
            &lazy_pool(4),
            SetupMode::Skip,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::RunFailed { worker: 0, .. }), "{err}");
    assert_eq!(returned.load(Ordering::SeqCst), 3);
    assert_eq!(driver.state(), RunState::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_setup_failure_spawns_no_workers() {
    let driver = Driver::new(RunConfig::new("faulty", 2, 2)).unwrap();
    let workload = FaultyWorkload::new(Misbehaviour::FailSetup);
    let runs = workload.runs.clone();

    let err = driver
        .run_with_pool(
            Box::new(workload),
            &lazy_pool(2),
            SetupMode::Setup,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Setup { .. }));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(driver.state(), RunState::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_stuck_worker_is_aborted_after_grace() {
    let config = RunConfig::new("faulty", 3, 3)
        .with_duration(Duration::from_secs(1))
        .with_shutdown_grace(Duration::from_secs(2));
    let driver = Driver::new(config).unwrap();
    let workload = FaultyWorkload::new(Misbehaviour::IgnoreCancel);
    let returned = workload.returned.clone();

    let report = driver
        .run_with_pool(
            Box::new(workload),
            &lazy_pool(3),
            SetupMode::Skip,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.aborted_workers, 1);
    assert_eq!(returned.load(Ordering::SeqCst), 2);
    assert_eq!(report.metrics.completed, 2);
    assert!(report.metrics.elapsed >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_worker_panic_is_reported() {
    let driver = Driver::new(RunConfig::new("faulty", 4, 4)).unwrap();
    let workload = FaultyWorkload::new(Misbehaviour::Panic);
    let returned = workload.returned.clone();

    let err = driver
        .run_with_pool(
            Box::new(workload),
            &lazy_pool(4),
            SetupMode::Skip,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    match err {
        EngineError::WorkerPanicked { worker, message } => {
            assert_eq!(worker, 2);
            assert!(message.contains("boom"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(returned.load(Ordering::SeqCst), 3);
}

#[test]
fn test_more_workers_than_connections_rejected() {
    let err = Driver::new(RunConfig::new("simple", 10, 5)).err().unwrap();
    assert!(matches!(err, EngineError::Config(_)));
    assert!(err.to_string().contains("connections (5) must be >= workers (10)"));
}

#[tokio::test]
async fn test_pool_larger_than_connections_rejected() {
    let driver = Driver::new(RunConfig::new("quota", 2, 4)).unwrap();
    let err = driver
        .run_with_pool(
            Box::new(QuotaWorkload {
                successes_per_worker: 1,
                timeouts: 0,
            }),
            &lazy_pool(16),
            SetupMode::Skip,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("exceeds connections"));
    assert_eq!(driver.state(), RunState::Created);
}

#[tokio::test]
async fn test_driver_pool_matches_connections() {
    let driver = Driver::new(RunConfig::new("quota", 2, 6)).unwrap();
    let pool = driver.build_pool().unwrap();
    assert_eq!(pool.status().max_size, 6);
    assert_eq!(pool.status().size, 0);
}

#[tokio::test(start_paused = true)]
async fn test_driver_runs_once_and_publishes_state() {
    let driver = Driver::new(RunConfig::new("quota", 1, 1).with_duration(Duration::from_millis(10)))
        .unwrap();
    let states = driver.subscribe();
    let pool = lazy_pool(1);
    let quota = || {
        Box::new(QuotaWorkload {
            successes_per_worker: 1,
            timeouts: 0,
        })
    };

    driver
        .run_with_pool(quota(), &pool, SetupMode::Skip, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(*states.borrow(), RunState::Completed);

    let err = driver
        .run_with_pool(quota(), &pool, SetupMode::Skip, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Config(_)));
}
