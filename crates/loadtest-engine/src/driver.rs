//! Concurrency driver: runs one workload instance for a fixed duration.
//!
//! The driver owns the run lifecycle
//!
//! ```text
//! Created -> SetupRequested? -> Running -> Draining -> Completed | Failed
//! ```
//!
//! It spawns `workers` tasks that each call [`Workload::run`] on the same
//! instance with their own [`RunContext`]. All contexts share one
//! cancellation token, a child of the caller's token, which fires when the
//! duration elapses, when the caller cancels, or when a worker fails. Workers
//! that ignore cancellation are aborted once `shutdown_grace` has passed.

use crate::config::RunConfig;
use crate::error::{panic_message, EngineError, WorkloadError};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::pool::{self, DbPool};
use crate::workload::{RunContext, Workload};
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    SetupRequested,
    Running,
    Draining,
    Completed,
    Failed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Created => "created",
            RunState::SetupRequested => "setup_requested",
            RunState::Running => "running",
            RunState::Draining => "draining",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What to do with the workload's schema before the timed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetupMode {
    /// Use the schema as it is.
    #[default]
    Skip,
    /// Run `setup` (idempotent).
    Setup,
    /// Run `cleanup`, then `setup`.
    Rebuild,
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub workload: String,
    pub workers: usize,
    pub connections: usize,
    pub state: RunState,
    pub metrics: MetricsSnapshot,
    /// The caller's token cancelled the run before its duration elapsed.
    pub cancelled_externally: bool,
    /// Workers still running when the grace period expired.
    pub aborted_workers: usize,
}

/// Prepare the workload's schema according to `mode`.
pub async fn prepare(
    workload: &dyn Workload,
    pool: &DbPool,
    config: &RunConfig,
    mode: SetupMode,
    cancel: &CancellationToken,
) -> Result<(), EngineError> {
    let ctx = RunContext::control(cancel.child_token(), config.operation_timeout);
    if mode == SetupMode::Rebuild {
        info!("Rebuilding schema for workload '{}'", config.workload);
        workload
            .cleanup(&ctx, pool, config)
            .await
            .map_err(|source| EngineError::Cleanup {
                workload: config.workload.clone(),
                source,
            })?;
    }
    if mode != SetupMode::Skip {
        info!("Setting up workload '{}'", config.workload);
        workload
            .setup(&ctx, pool, config)
            .await
            .map_err(|source| EngineError::Setup {
                workload: config.workload.clone(),
                source,
            })?;
    }
    Ok(())
}

/// Executes exactly one run of one workload instance.
pub struct Driver {
    config: Arc<RunConfig>,
    state: watch::Sender<RunState>,
    used: AtomicBool,
}

type WorkerOutcome = (usize, Result<Result<(), WorkloadError>, Box<dyn Any + Send>>);

impl Driver {
    /// Create a driver after re-checking the configuration.
    pub fn new(config: RunConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let (state, _) = watch::channel(RunState::Created);
        Ok(Self {
            config: Arc::new(config),
            state,
            used: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Observe lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// Build a pool sized to `connections`.
    pub fn build_pool(&self) -> Result<DbPool, EngineError> {
        pool::build_pool(
            &self.config.database,
            self.config.connections,
            self.config.operation_timeout,
        )
    }

    /// Build the pool, check the database is reachable, run, and close the pool.
    pub async fn execute(
        &self,
        workload: Box<dyn Workload>,
        mode: SetupMode,
        cancel: CancellationToken,
    ) -> Result<RunReport, EngineError> {
        let pool = self.build_pool()?;
        let result = match pool::probe(&pool).await {
            Ok(()) => self.run_with_pool(workload, &pool, mode, cancel).await,
            Err(e) => {
                self.transition(RunState::Failed);
                Err(e)
            }
        };
        pool.close();
        result
    }

    /// Run against an existing pool. The pool must not be larger than
    /// `connections`.
    pub async fn run_with_pool(
        &self,
        workload: Box<dyn Workload>,
        pool: &DbPool,
        mode: SetupMode,
        cancel: CancellationToken,
    ) -> Result<RunReport, EngineError> {
        if self.used.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Config(
                "a driver executes a single run".to_string(),
            ));
        }
        let max_size = pool.status().max_size;
        if max_size > self.config.connections {
            return Err(EngineError::Config(format!(
                "pool max_size ({max_size}) exceeds connections ({})",
                self.config.connections
            )));
        }

        let workload: Arc<dyn Workload> = Arc::from(workload);
        if mode != SetupMode::Skip {
            self.transition(RunState::SetupRequested);
            if let Err(e) = prepare(workload.as_ref(), pool, &self.config, mode, &cancel).await {
                error!("{}", e);
                self.transition(RunState::Failed);
                return Err(e);
            }
        }

        self.run_workers(workload, pool, cancel).await
    }

    async fn run_workers(
        &self,
        workload: Arc<dyn Workload>,
        pool: &DbPool,
        cancel: CancellationToken,
    ) -> Result<RunReport, EngineError> {
        let config = &self.config;
        let run_token = cancel.child_token();
        let metrics = Arc::new(Metrics::new());
        let started = Instant::now();
        let deadline = started + config.duration;

        self.transition(RunState::Running);
        info!(
            "Running workload '{}' for {:?} with {} worker(s) over {} connection(s)",
            config.workload, config.duration, config.workers, config.connections
        );

        let mut tasks: JoinSet<WorkerOutcome> = JoinSet::new();
        let mut worker_ids = HashMap::new();
        for worker_id in 0..config.workers {
            let ctx = RunContext::new(
                worker_id,
                config.workers,
                run_token.clone(),
                deadline,
                config.operation_timeout,
            );
            let workload = workload.clone();
            let pool = pool.clone();
            let config = config.clone();
            let metrics = metrics.clone();
            let handle = tasks.spawn(async move {
                let outcome = AssertUnwindSafe(workload.run(&ctx, &pool, &config, &metrics))
                    .catch_unwind()
                    .await;
                (worker_id, outcome)
            });
            worker_ids.insert(handle.id(), worker_id);
        }

        let mut failure: Option<EngineError> = None;
        let mut cancelled_externally = false;
        let mut aborted_workers = 0;
        let mut grace_deadline: Option<Instant> = None;
        let mut aborting = false;

        loop {
            let grace_at = grace_deadline.unwrap_or(deadline);
            tokio::select! {
                joined = tasks.join_next_with_id() => {
                    let Some(joined) = joined else { break };
                    let fatal = match joined {
                        Ok((_, (worker_id, Ok(Ok(()))))) => {
                            debug!("Worker {} returned", worker_id);
                            None
                        }
                        Ok((_, (worker_id, Ok(Err(source))))) => Some(EngineError::RunFailed {
                            workload: config.workload.clone(),
                            worker: worker_id,
                            source,
                        }),
                        Ok((_, (worker, Err(panic)))) => Some(EngineError::WorkerPanicked {
                            worker,
                            message: panic_message(panic.as_ref()),
                        }),
                        Err(e) if e.is_cancelled() => {
                            aborted_workers += 1;
                            None
                        }
                        Err(e) => Some(EngineError::WorkerPanicked {
                            worker: worker_ids.get(&e.id()).copied().unwrap_or_default(),
                            message: e.to_string(),
                        }),
                    };
                    if let Some(e) = fatal {
                        error!("{}", e);
                        failure.get_or_insert(e);
                        self.drain(&run_token, &mut grace_deadline);
                    }
                }
                _ = sleep_until(deadline), if grace_deadline.is_none() => {
                    info!("Run duration elapsed, draining");
                    self.drain(&run_token, &mut grace_deadline);
                }
                _ = cancel.cancelled(), if grace_deadline.is_none() => {
                    info!("Run cancelled, draining");
                    cancelled_externally = true;
                    self.drain(&run_token, &mut grace_deadline);
                }
                _ = sleep_until(grace_at), if grace_deadline.is_some() && !aborting => {
                    warn!(
                        "{} worker(s) still running after {:?} grace period, aborting",
                        tasks.len(),
                        config.shutdown_grace
                    );
                    aborting = true;
                    tasks.abort_all();
                }
            }
        }

        let snapshot = metrics.finish(started.elapsed());
        if snapshot.late_writes > 0 {
            warn!("{} metrics write(s) arrived after the run was sealed", snapshot.late_writes);
        }

        if let Some(e) = failure {
            self.transition(RunState::Failed);
            return Err(e);
        }

        self.transition(RunState::Completed);
        Ok(RunReport {
            workload: config.workload.clone(),
            workers: config.workers,
            connections: config.connections,
            state: RunState::Completed,
            metrics: snapshot,
            cancelled_externally,
            aborted_workers,
        })
    }

    fn drain(&self, token: &CancellationToken, grace_deadline: &mut Option<Instant>) {
        if grace_deadline.is_some() {
            return;
        }
        self.transition(RunState::Draining);
        token.cancel();
        *grace_deadline = Some(Instant::now() + self.config.shutdown_grace);
    }

    fn transition(&self, next: RunState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!("Run state: {} -> {}", previous, next);
        }
    }
}
