//! Workload execution engine for PostgreSQL load tests.
//!
//! This crate resolves a workload name to an executable strategy, runs it
//! across a bounded set of workers and connections for a fixed duration, and
//! aggregates what the workers report into a consistent summary:
//!
//! - [`Workload`] - the contract the driver runs; builtins implement it
//!   directly, plugin workloads are adapted to it on the host side
//! - [`plugin`] - plugin ABI, dynamic loader and the explicit registry
//! - [`op`] - per-operation timeout, cancellation and recording
//! - [`WorkloadFactory`] - merged namespace of builtins and plugins
//! - [`Driver`] - run lifecycle, cancellation and draining
//! - [`Metrics`] - lock-free counters shared by every worker
//!
//! # Architecture
//!
//! ```text
//! caller (CLI / config)
//!    │
//!    ├─── WorkloadFactory ── PluginRegistry ── PluginLoader (libloading)
//!    │          │                  │
//!    │          │                  └── PluginWorkload ── PluginDatabase (host)
//!    │          └─── Box<dyn Workload>
//!    │
//!    └─── Driver ── DbPool (deadpool-postgres)
//!               ├── worker 0..N ── Workload::run ──┐
//!               └── Metrics <──────────────────────┘
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod factory;
pub mod metrics;
pub mod op;
pub mod plugin;
pub mod pool;
pub mod shutdown;
pub mod workload;

pub use config::{DatabaseConfig, RunConfig};
pub use driver::{prepare, Driver, RunReport, RunState, SetupMode};
pub use error::{EngineError, PluginError, WorkloadError};
pub use factory::WorkloadFactory;
pub use metrics::{ErrorCategory, LatencySummary, Metrics, MetricsSnapshot};
pub use op::{OpError, OperationLoop};
pub use plugin::loader::{DylibLoader, LoadedPlugin, PluginLoader};
pub use plugin::registry::{BuiltinWorkload, PluginRegistry, WorkloadSource};
pub use plugin::{
    PluginDatabase, PluginHost, PluginMetadata, PluginWorker, PluginWorkload, WorkloadPlugin,
};
pub use pool::{DatabaseCatalog, DbPool, PooledClient};
pub use shutdown::setup_shutdown_handler;
pub use workload::{Interrupted, RunContext, Workload};
