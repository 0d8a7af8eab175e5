//! Workload factory: the single entry point from a workload name to an instance.

use crate::config::RunConfig;
use crate::error::{EngineError, PluginError};
use crate::plugin::loader::{discover, DylibLoader, PluginLoader};
use crate::plugin::registry::{BuiltinWorkload, PluginRegistry, WorkloadSource};
use crate::plugin::PluginMetadata;
use crate::pool::{major_version, DatabaseCatalog};
use crate::workload::Workload;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Merged namespace of builtin and plugin workloads for one process.
pub struct WorkloadFactory {
    workload: String,
    registry: PluginRegistry,
    load_failures: Vec<PluginError>,
    cleaned_up: AtomicBool,
}

impl WorkloadFactory {
    /// Register `builtins`, then load every plugin named by `config`.
    pub fn new(config: &RunConfig, builtins: &[BuiltinWorkload]) -> Result<Self, EngineError> {
        Self::with_loader(config, builtins, &DylibLoader)
    }

    /// Like [`WorkloadFactory::new`] with a custom plugin loader.
    ///
    /// A name collision is fatal. Every other plugin failure only removes
    /// that plugin and is kept in [`WorkloadFactory::load_failures`].
    pub fn with_loader(
        config: &RunConfig,
        builtins: &[BuiltinWorkload],
        loader: &dyn PluginLoader,
    ) -> Result<Self, EngineError> {
        let mut registry = PluginRegistry::new();
        for builtin in builtins {
            registry
                .register_builtin(*builtin)
                .map_err(EngineError::Registration)?;
        }

        let (mut paths, mut load_failures) = discover(&config.plugin_dirs);
        paths.extend(config.plugins.iter().cloned());
        for e in &load_failures {
            warn!("{}", e);
        }

        for failure in registry.load_all(loader, &paths) {
            if matches!(failure, PluginError::NameCollision { .. }) {
                // Plugins registered so far still get their cleanup hook.
                for e in registry.cleanup_all() {
                    warn!("{}", e);
                }
                return Err(EngineError::Registration(failure));
            }
            load_failures.push(failure);
        }

        info!(
            "Workload factory ready: {} workload(s), {} plugin(s), {} plugin failure(s)",
            registry.names().len(),
            registry.plugins().len(),
            load_failures.len()
        );

        Ok(Self {
            workload: config.workload.clone(),
            registry,
            load_failures,
            cleaned_up: AtomicBool::new(false),
        })
    }

    /// Check the loaded plugins against the target database.
    ///
    /// Plugin `initialize` hooks already ran during registration. What is
    /// left is each plugin's minimum server version and required extensions.
    /// Only the plugin that owns the configured workload is admitted or
    /// refused: its failures are returned. The other plugins are checked too,
    /// but a mismatch there is logged and does not stop a run that never
    /// uses them.
    pub async fn initialize(&self, catalog: &dyn DatabaseCatalog) -> Result<(), EngineError> {
        let owner = self.resolve(&self.workload)?.plugin();

        for plugin in self.registry.plugins() {
            let owns_workload = owner.is_some_and(|owner| Arc::ptr_eq(owner, plugin));
            match admit(plugin.metadata(), catalog).await {
                Ok(()) if owns_workload => info!(
                    "Plugin '{}' admitted for workload '{}'",
                    plugin.metadata().name,
                    self.workload
                ),
                Ok(()) => {}
                Err(e) if owns_workload => return Err(e),
                Err(e) => warn!("{}; its workloads cannot run against this database", e),
            }
        }
        Ok(())
    }

    /// A fresh, independent instance of workload `name`.
    pub fn get(&self, name: &str) -> Result<Box<dyn Workload>, EngineError> {
        self.registry.create(name)
    }

    /// Tear down every loaded plugin. All plugins are attempted; the first
    /// failure is returned.
    pub fn cleanup(&self) -> Result<(), EngineError> {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match self.registry.cleanup_all().into_iter().next() {
            Some(first) => Err(EngineError::Plugin(first)),
            None => Ok(()),
        }
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Plugins that failed to load, in discovery order.
    pub fn load_failures(&self) -> &[PluginError] {
        &self.load_failures
    }

    /// Where `name` comes from, without creating an instance.
    pub fn resolve(&self, name: &str) -> Result<&WorkloadSource, EngineError> {
        self.registry
            .get(name)
            .ok_or_else(|| EngineError::UnknownWorkload {
                name: name.to_string(),
                available: self.registry.names().join(", "),
            })
    }
}

async fn admit(metadata: &PluginMetadata, catalog: &dyn DatabaseCatalog) -> Result<(), EngineError> {
    if let Some(required) = metadata.min_db_version {
        let actual = major_version(catalog.server_version_num().await?);
        if actual < required {
            return Err(EngineError::DatabaseVersion {
                plugin: metadata.name.clone(),
                required,
                actual,
            });
        }
    }

    if !metadata.required_extensions.is_empty() {
        let mut known = catalog.installed_extensions().await?;
        known.extend(catalog.available_extensions().await?);
        let missing: BTreeSet<&str> = metadata
            .required_extensions
            .iter()
            .map(String::as_str)
            .filter(|ext| !known.contains(*ext))
            .collect();
        if !missing.is_empty() {
            return Err(EngineError::ExtensionUnavailable {
                plugin: metadata.name.clone(),
                missing: missing.into_iter().collect::<Vec<_>>().join(", "),
            });
        }
    }
    Ok(())
}

impl Drop for WorkloadFactory {
    fn drop(&mut self) {
        if !self.cleaned_up.load(Ordering::SeqCst) {
            if let Err(e) = self.cleanup() {
                warn!("Plugin cleanup during drop failed: {}", e);
            }
        }
    }
}
