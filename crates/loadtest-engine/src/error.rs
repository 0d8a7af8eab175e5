//! Error types for the workload execution engine.

use std::any::Any;
use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by workload implementations through the workload contract.
///
/// Only conditions that invalidate the whole run belong here. Per-operation
/// failures are recorded into [`crate::Metrics`] instead of being returned.
#[derive(Error, Debug)]
pub enum WorkloadError {
    /// PostgreSQL query or protocol error.
    #[error("PostgreSQL error: {0}")]
    PostgreSQL(#[from] tokio_postgres::Error),

    /// Could not check a connection out of the shared pool.
    #[error("Connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// The workload type requested is not provided by this implementation.
    #[error("Unsupported workload type '{0}'")]
    Unsupported(String),

    /// Invalid workload options.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A panic inside workload code, caught before it crossed a library
    /// boundary.
    #[error("Workload panicked: {0}")]
    Panicked(String),

    /// Any other workload condition. Fatal from `setup`, `cleanup` and
    /// `run`; counted as an `other` error when a single plugin operation
    /// returns it.
    #[error("{0}")]
    Other(String),
}

impl WorkloadError {
    /// Build a [`WorkloadError::Panicked`] from a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        WorkloadError::Panicked(panic_message(payload.as_ref()))
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Errors raised while loading, validating, registering or tearing down a plugin.
///
/// These are isolated: one failing plugin never prevents the others from
/// loading.
#[derive(Error, Debug)]
pub enum PluginError {
    /// The dynamic library could not be opened.
    #[error("Failed to open plugin {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    /// The library does not export the plugin declaration.
    #[error("Plugin {path:?} does not export symbol '{symbol}'")]
    MissingSymbol { path: PathBuf, symbol: String },

    /// The plugin was built against an incompatible engine.
    #[error("Plugin {path:?} is incompatible: {reason}")]
    AbiMismatch { path: PathBuf, reason: String },

    /// Plugin metadata failed validation.
    #[error("Plugin '{plugin}' has invalid metadata: {reason}")]
    InvalidMetadata { plugin: String, reason: String },

    /// A workload name is already registered by another source.
    #[error("Workload '{name}' from {incoming} is already registered by {existing}")]
    NameCollision {
        name: String,
        existing: String,
        incoming: String,
    },

    /// The plugin's `initialize` hook failed.
    #[error("Plugin '{plugin}' failed to initialize: {source}")]
    Initialize {
        plugin: String,
        #[source]
        source: WorkloadError,
    },

    /// The plugin's `cleanup` hook failed.
    #[error("Plugin '{plugin}' failed to clean up: {source}")]
    Cleanup {
        plugin: String,
        #[source]
        source: WorkloadError,
    },

    /// Filesystem error while discovering plugins.
    #[error("Failed to scan plugin directory {path:?}: {source}")]
    Discovery {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced by the engine to its caller.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Invalid run configuration (detected before anything starts).
    #[error("Configuration error: {0}")]
    Config(String),

    /// The requested workload name is not registered.
    #[error("Unknown workload '{name}' (available: {available})")]
    UnknownWorkload { name: String, available: String },

    /// Name collision or other hard registration failure.
    #[error("Registration error: {0}")]
    Registration(#[source] PluginError),

    /// The owning plugin refused to create an instance.
    #[error("Failed to create workload '{workload}': {source}")]
    CreateWorkload {
        workload: String,
        #[source]
        source: WorkloadError,
    },

    /// Isolated plugin failure surfaced to the caller.
    #[error(transparent)]
    Plugin(#[from] PluginError),

    /// The connection pool could not be built or reached.
    #[error("Connection pool error: {0}")]
    Pool(String),

    /// Workload setup failed; no worker was spawned.
    #[error("Setup of workload '{workload}' failed: {source}")]
    Setup {
        workload: String,
        #[source]
        source: WorkloadError,
    },

    /// Workload cleanup failed.
    #[error("Cleanup of workload '{workload}' failed: {source}")]
    Cleanup {
        workload: String,
        #[source]
        source: WorkloadError,
    },

    /// A worker returned a run-fatal error. Reported after every worker joined.
    #[error("Run of workload '{workload}' failed in worker {worker}: {source}")]
    RunFailed {
        workload: String,
        worker: usize,
        #[source]
        source: WorkloadError,
    },

    /// A worker task panicked.
    #[error("Worker {worker} panicked: {message}")]
    WorkerPanicked { worker: usize, message: String },

    /// A plugin requires database extensions that are not available.
    #[error("Plugin '{plugin}' requires unavailable extension(s): {missing}")]
    ExtensionUnavailable { plugin: String, missing: String },

    /// The target database is older than a plugin supports.
    #[error("Plugin '{plugin}' requires PostgreSQL {required} or newer, server is {actual}")]
    DatabaseVersion {
        plugin: String,
        required: u32,
        actual: u32,
    },

    /// Query against the database catalog failed.
    #[error("PostgreSQL error: {0}")]
    PostgreSQL(#[from] tokio_postgres::Error),
}

impl From<deadpool_postgres::PoolError> for EngineError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        EngineError::Pool(err.to_string())
    }
}

impl From<deadpool_postgres::CreatePoolError> for EngineError {
    fn from(err: deadpool_postgres::CreatePoolError) -> Self {
        EngineError::Pool(err.to_string())
    }
}
