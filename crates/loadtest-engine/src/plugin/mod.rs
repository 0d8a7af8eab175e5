//! Plugin contract: how independently built libraries contribute workloads.
//!
//! A plugin is a `cdylib` that exports one [`PluginDeclaration`] under the
//! symbol [`DECLARATION_SYMBOL`]. The [`declare_plugin!`](crate::declare_plugin)
//! macro generates that export:
//!
//! ```ignore
//! use loadtest_engine::plugin::{PluginMetadata, PluginWorkload, WorkloadPlugin};
//!
//! #[derive(Default)]
//! struct MyPlugin;
//!
//! impl WorkloadPlugin for MyPlugin {
//!     fn metadata(&self) -> PluginMetadata { /* ... */ }
//!     fn create_workload(&self, name: &str) -> Result<Box<dyn PluginWorkload>, WorkloadError> { /* ... */ }
//! }
//!
//! loadtest_engine::declare_plugin!(MyPlugin::default);
//! ```
//!
//! A plugin library links its own copy of every crate it uses, runtime
//! included. Its statics and thread-locals are not the host's: it has no
//! Tokio reactor, no timer and no log subscriber of its own. The contract is
//! shaped around that:
//!
//! - plugin workloads compute and issue queries through [`PluginDatabase`],
//!   a host object, and never touch the pool, timers or metrics;
//! - the host drives each [`PluginWorker`] one operation at a time and
//!   applies timeouts, cancellation and recording itself;
//! - the host hands its log dispatcher over in [`PluginHost`];
//! - panics are caught on the side they happen and come back as
//!   [`WorkloadError::Panicked`].
//!
//! Trait objects still cross the boundary, so a plugin must be built with
//! the same compiler and the same engine minor version as the host. The
//! loader enforces both and [`PLUGIN_ABI_VERSION`].

pub mod guard;
pub mod host;
pub mod loader;
pub mod registry;

use crate::config::RunConfig;
use crate::error::{PluginError, WorkloadError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;

/// Version of the declaration layout. Bumped on any incompatible change.
pub const PLUGIN_ABI_VERSION: u32 = 2;

/// Version of the engine crate a plugin is compiled against.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// `rustc --version` of the compiler that built the engine.
pub const RUSTC_VERSION: &str = env!("PGSTRESS_RUSTC_VERSION");

/// Name of the exported declaration symbol.
pub const DECLARATION_SYMBOL: &str = "PGSTRESS_PLUGIN_DECLARATION";

/// Descriptive metadata a plugin reports about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// Plugin name.
    pub name: String,
    /// Semantic version of the plugin.
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    /// Workload names this plugin provides. Must not be empty.
    pub workload_types: Vec<String>,
    /// PostgreSQL extensions the workloads require.
    #[serde(default)]
    pub required_extensions: Vec<String>,
    /// Minimum PostgreSQL major version.
    #[serde(default)]
    pub min_db_version: Option<u32>,
    #[serde(default)]
    pub homepage: Option<String>,
}

impl PluginMetadata {
    /// Check the metadata schema.
    pub fn validate(&self) -> Result<(), PluginError> {
        let invalid = |reason: String| PluginError::InvalidMetadata {
            plugin: self.name.clone(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty".to_string()));
        }
        semver::Version::parse(&self.version)
            .map_err(|e| invalid(format!("version '{}' is not semver: {e}", self.version)))?;
        if self.workload_types.is_empty() {
            return Err(invalid("workload_types must not be empty".to_string()));
        }

        let mut seen = HashSet::new();
        for name in &self.workload_types {
            if name.trim().is_empty() {
                return Err(invalid("workload type names must not be empty".to_string()));
            }
            if !seen.insert(name.as_str()) {
                return Err(invalid(format!("workload type '{name}' is declared twice")));
            }
        }
        Ok(())
    }
}

/// Database access the host lends to plugin code.
///
/// Every call checks a connection out of the run's pool, uses it once and
/// returns it. Statements are prepared through the connection's statement
/// cache, so repeating the same SQL text is cheap.
#[async_trait]
pub trait PluginDatabase: Send + Sync {
    /// Run one or more statements without parameters.
    async fn batch_execute(&self, sql: &str) -> Result<(), WorkloadError>;

    /// Run a statement and return the number of rows it affected.
    async fn execute(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64, WorkloadError>;

    async fn query(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, WorkloadError>;

    async fn query_opt(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<Row>, WorkloadError>;
}

/// A workload provided by a plugin.
#[async_trait]
pub trait PluginWorkload: Send + Sync {
    /// Create schema and seed data. Must be idempotent.
    async fn setup(&self, db: &dyn PluginDatabase, config: &RunConfig)
        -> Result<(), WorkloadError>;

    /// Drop everything `setup` created.
    async fn cleanup(
        &self,
        db: &dyn PluginDatabase,
        config: &RunConfig,
    ) -> Result<(), WorkloadError>;

    /// Per-worker state for worker `worker_id`. Errors here are fatal for
    /// the run; bad options should be reported as [`WorkloadError::Config`].
    fn worker(
        &self,
        worker_id: usize,
        config: &RunConfig,
    ) -> Result<Box<dyn PluginWorker>, WorkloadError>;
}

/// One worker's operation generator.
#[async_trait]
pub trait PluginWorker: Send {
    /// Perform a single operation.
    ///
    /// Database errors are counted and the worker keeps going. Returning
    /// [`WorkloadError::Config`] or [`WorkloadError::Panicked`] stops the run.
    async fn operation(&mut self, db: &dyn PluginDatabase) -> Result<(), WorkloadError>;
}

/// What the host hands a plugin when it initializes.
#[derive(Clone)]
pub struct PluginHost {
    /// The host's log dispatcher. Installed as the plugin library's global
    /// default so plugin events reach the host's subscriber.
    pub dispatch: tracing::Dispatch,
}

impl PluginHost {
    /// Capture the dispatcher active on the calling thread.
    pub fn current() -> Self {
        Self {
            dispatch: tracing::dispatcher::get_default(|dispatch| dispatch.clone()),
        }
    }
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost").finish_non_exhaustive()
    }
}

/// The capability object every plugin exposes.
pub trait WorkloadPlugin: Send + Sync {
    /// Describe the plugin and the workloads it provides.
    fn metadata(&self) -> PluginMetadata;

    /// Create a fresh workload instance for one of `metadata().workload_types`.
    fn create_workload(
        &self,
        workload_type: &str,
    ) -> Result<Box<dyn PluginWorkload>, WorkloadError>;

    /// Called exactly once after loading, before any `create_workload`.
    fn initialize(&self, _host: &PluginHost) -> Result<(), WorkloadError> {
        Ok(())
    }

    /// Called once at teardown. Failures are logged, never fatal.
    fn cleanup(&self) -> Result<(), WorkloadError> {
        Ok(())
    }
}

/// The static a plugin library exports. `abi_version` stays the first field.
#[repr(C)]
pub struct PluginDeclaration {
    pub abi_version: u32,
    pub engine_version: &'static str,
    pub rustc_version: &'static str,
    pub create: fn() -> Box<dyn WorkloadPlugin>,
}

/// Export a [`PluginDeclaration`] for a plugin constructor.
///
/// The argument is any path callable as `fn() -> impl WorkloadPlugin`. The
/// plugin is wrapped in [`guard::Guarded`] so its panics never unwind into
/// the host.
#[macro_export]
macro_rules! declare_plugin {
    ($constructor:path) => {
        #[no_mangle]
        pub static PGSTRESS_PLUGIN_DECLARATION: $crate::plugin::PluginDeclaration =
            $crate::plugin::PluginDeclaration {
                abi_version: $crate::plugin::PLUGIN_ABI_VERSION,
                engine_version: $crate::plugin::ENGINE_VERSION,
                rustc_version: $crate::plugin::RUSTC_VERSION,
                create: {
                    fn __pgstress_create_plugin() -> ::std::boxed::Box<dyn $crate::plugin::WorkloadPlugin> {
                        ::std::boxed::Box::new($crate::plugin::guard::Guarded::new($constructor()))
                    }
                    __pgstress_create_plugin
                },
            };
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> PluginMetadata {
        PluginMetadata {
            name: "vector".to_string(),
            version: "1.2.0".to_string(),
            description: "pgvector index benchmark".to_string(),
            author: "bench team".to_string(),
            workload_types: vec!["vector_ivfflat".to_string(), "vector_hnsw".to_string()],
            required_extensions: vec!["vector".to_string()],
            min_db_version: Some(13),
            homepage: None,
        }
    }

    #[test]
    fn test_valid_metadata() {
        assert!(metadata().validate().is_ok());
    }

    #[test]
    fn test_metadata_requires_workload_types() {
        let mut meta = metadata();
        meta.workload_types.clear();
        let err = meta.validate().unwrap_err();
        assert!(err.to_string().contains("workload_types must not be empty"));
    }

    #[test]
    fn test_metadata_rejects_bad_version_and_duplicates() {
        let mut meta = metadata();
        meta.version = "one".to_string();
        assert!(meta.validate().is_err());

        let mut meta = metadata();
        meta.workload_types.push("vector_hnsw".to_string());
        let err = meta.validate().unwrap_err();
        assert!(err.to_string().contains("declared twice"));

        let mut meta = metadata();
        meta.name = String::new();
        assert!(meta.validate().is_err());
    }

    #[test]
    fn test_metadata_from_yaml_defaults() {
        let meta: PluginMetadata = serde_yaml::from_str(
            "name: kv\nversion: 0.1.0\nworkload_types: [kv_mix]\n",
        )
        .unwrap();
        assert!(meta.required_extensions.is_empty());
        assert_eq!(meta.min_db_version, None);
        assert!(meta.validate().is_ok());
    }
}
