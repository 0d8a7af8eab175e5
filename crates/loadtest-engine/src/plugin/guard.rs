//! Plugin-side wrappers that keep panics inside the plugin library.
//!
//! [`declare_plugin!`](crate::declare_plugin) builds these wrappers inside the
//! plugin library, so their vtables point at the plugin's copy of this code
//! and they run on the plugin's copy of the standard library. A panic caught
//! there never unwinds into host frames.

use super::{PluginDatabase, PluginHost, PluginMetadata, PluginWorker, PluginWorkload, WorkloadPlugin};
use crate::config::RunConfig;
use crate::error::WorkloadError;
use async_trait::async_trait;
use futures::FutureExt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};

fn call<T>(f: impl FnOnce() -> Result<T, WorkloadError>) -> Result<T, WorkloadError> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|panic| Err(WorkloadError::from_panic(panic)))
}

async fn poll<T, F>(fut: F) -> Result<T, WorkloadError>
where
    F: Future<Output = Result<T, WorkloadError>>,
{
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(WorkloadError::from_panic(panic)))
}

/// A [`WorkloadPlugin`] whose every entry point catches panics.
pub struct Guarded<P> {
    inner: P,
}

impl<P: WorkloadPlugin> Guarded<P> {
    pub fn new(inner: P) -> Self {
        Self { inner }
    }
}

impl<P: WorkloadPlugin> WorkloadPlugin for Guarded<P> {
    fn metadata(&self) -> PluginMetadata {
        // A panic yields metadata that fails validation, so the plugin is
        // rejected at registration with the panic message in the report.
        catch_unwind(AssertUnwindSafe(|| self.inner.metadata())).unwrap_or_else(|panic| {
            PluginMetadata {
                name: "unknown".to_string(),
                version: "0.0.0".to_string(),
                description: WorkloadError::from_panic(panic).to_string(),
                author: String::new(),
                workload_types: Vec::new(),
                required_extensions: Vec::new(),
                min_db_version: None,
                homepage: None,
            }
        })
    }

    fn create_workload(
        &self,
        workload_type: &str,
    ) -> Result<Box<dyn PluginWorkload>, WorkloadError> {
        let inner = call(|| self.inner.create_workload(workload_type))?;
        Ok(Box::new(GuardedWorkload { inner }))
    }

    fn initialize(&self, host: &PluginHost) -> Result<(), WorkloadError> {
        // Fails when this library shares the host's tracing (in-process
        // plugins); the host subscriber is already in place then.
        let _ = tracing::dispatcher::set_global_default(host.dispatch.clone());
        call(|| self.inner.initialize(host))
    }

    fn cleanup(&self) -> Result<(), WorkloadError> {
        call(|| self.inner.cleanup())
    }
}

struct GuardedWorkload {
    inner: Box<dyn PluginWorkload>,
}

#[async_trait]
impl PluginWorkload for GuardedWorkload {
    async fn setup(
        &self,
        db: &dyn PluginDatabase,
        config: &RunConfig,
    ) -> Result<(), WorkloadError> {
        poll(self.inner.setup(db, config)).await
    }

    async fn cleanup(
        &self,
        db: &dyn PluginDatabase,
        config: &RunConfig,
    ) -> Result<(), WorkloadError> {
        poll(self.inner.cleanup(db, config)).await
    }

    fn worker(
        &self,
        worker_id: usize,
        config: &RunConfig,
    ) -> Result<Box<dyn PluginWorker>, WorkloadError> {
        let inner = call(|| self.inner.worker(worker_id, config))?;
        Ok(Box::new(GuardedWorker { inner }))
    }
}

struct GuardedWorker {
    inner: Box<dyn PluginWorker>,
}

#[async_trait]
impl PluginWorker for GuardedWorker {
    async fn operation(&mut self, db: &dyn PluginDatabase) -> Result<(), WorkloadError> {
        poll(self.inner.operation(db)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_postgres::types::ToSql;
    use tokio_postgres::Row;

    struct NoDatabase;

    #[async_trait]
    impl PluginDatabase for NoDatabase {
        async fn batch_execute(&self, _: &str) -> Result<(), WorkloadError> {
            Ok(())
        }
        async fn execute(&self, _: &str, _: &[&(dyn ToSql + Sync)]) -> Result<u64, WorkloadError> {
            Ok(0)
        }
        async fn query(&self, _: &str, _: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>, WorkloadError> {
            Ok(Vec::new())
        }
        async fn query_opt(
            &self,
            _: &str,
            _: &[&(dyn ToSql + Sync)],
        ) -> Result<Option<Row>, WorkloadError> {
            Ok(None)
        }
    }

    struct Faulty;

    #[async_trait]
    impl PluginWorkload for Faulty {
        async fn setup(&self, _: &dyn PluginDatabase, _: &RunConfig) -> Result<(), WorkloadError> {
            panic!("setup exploded");
        }
        async fn cleanup(&self, _: &dyn PluginDatabase, _: &RunConfig) -> Result<(), WorkloadError> {
            Ok(())
        }
        fn worker(&self, worker_id: usize, _: &RunConfig) -> Result<Box<dyn PluginWorker>, WorkloadError> {
            if worker_id > 0 {
                panic!("no worker {worker_id}");
            }
            Ok(Box::new(FaultyWorker))
        }
    }

    struct FaultyWorker;

    #[async_trait]
    impl PluginWorker for FaultyWorker {
        async fn operation(&mut self, db: &dyn PluginDatabase) -> Result<(), WorkloadError> {
            db.batch_execute("SELECT 1").await?;
            let message = String::from("operation exploded");
            std::panic::panic_any(message);
        }
    }

    struct FaultyPlugin;

    impl WorkloadPlugin for FaultyPlugin {
        fn metadata(&self) -> PluginMetadata {
            panic!("metadata exploded");
        }
        fn create_workload(&self, _: &str) -> Result<Box<dyn PluginWorkload>, WorkloadError> {
            Ok(Box::new(Faulty))
        }
        fn cleanup(&self) -> Result<(), WorkloadError> {
            panic!("cleanup exploded");
        }
    }

    fn panicked(err: WorkloadError, expected: &str) {
        match err {
            WorkloadError::Panicked(message) => assert_eq!(message, expected),
            other => panic!("expected a caught panic, got {other:?}"),
        }
    }

    #[test]
    fn test_metadata_panic_fails_validation() {
        let plugin = Guarded::new(FaultyPlugin);
        let meta = plugin.metadata();
        assert!(meta.description.contains("metadata exploded"));
        assert!(meta.validate().is_err());
        panicked(plugin.cleanup().unwrap_err(), "cleanup exploded");
    }

    #[tokio::test]
    async fn test_workload_panics_become_errors() {
        let plugin = Guarded::new(FaultyPlugin);
        let config = RunConfig::new("faulty", 2, 2);
        let workload = plugin.create_workload("faulty").unwrap();

        panicked(workload.setup(&NoDatabase, &config).await.unwrap_err(), "setup exploded");
        panicked(workload.worker(1, &config).err().unwrap(), "no worker 1");

        let mut worker = workload.worker(0, &config).unwrap();
        panicked(worker.operation(&NoDatabase).await.unwrap_err(), "operation exploded");
        assert!(workload.cleanup(&NoDatabase, &config).await.is_ok());
    }
}
