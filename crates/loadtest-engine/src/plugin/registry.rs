//! Explicit workload namespace: builtins plus loaded plugins.
//!
//! There is no process-wide registry. Each [`PluginRegistry`] is an ordinary
//! value owned by a factory, so tests can build as many as they like.

use super::host::PluginWorkloadAdapter;
use super::loader::{LoadedPlugin, PluginLoader};
use crate::error::{EngineError, PluginError};
use crate::workload::Workload;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A workload compiled into the binary.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinWorkload {
    pub name: &'static str,
    pub description: &'static str,
    pub create: fn() -> Box<dyn Workload>,
}

/// Where a registered workload name comes from.
#[derive(Debug, Clone)]
pub enum WorkloadSource {
    Builtin(BuiltinWorkload),
    Plugin(Arc<LoadedPlugin>),
}

impl WorkloadSource {
    /// Description used in collision errors and listings.
    pub fn describe(&self) -> String {
        match self {
            WorkloadSource::Builtin(_) => "builtin".to_string(),
            WorkloadSource::Plugin(plugin) => plugin.describe(),
        }
    }

    pub fn description(&self) -> &str {
        match self {
            WorkloadSource::Builtin(builtin) => builtin.description,
            WorkloadSource::Plugin(plugin) => &plugin.metadata().description,
        }
    }

    /// The owning plugin, if any.
    pub fn plugin(&self) -> Option<&Arc<LoadedPlugin>> {
        match self {
            WorkloadSource::Builtin(_) => None,
            WorkloadSource::Plugin(plugin) => Some(plugin),
        }
    }
}

/// Maps workload names to the builtin or plugin that provides them.
#[derive(Default)]
pub struct PluginRegistry {
    entries: BTreeMap<String, WorkloadSource>,
    plugins: Vec<Arc<LoadedPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a builtin workload.
    pub fn register_builtin(&mut self, builtin: BuiltinWorkload) -> Result<(), PluginError> {
        let incoming = WorkloadSource::Builtin(builtin);
        self.check_name(builtin.name, &incoming)?;
        debug!("Registered builtin workload '{}'", builtin.name);
        self.entries.insert(builtin.name.to_string(), incoming);
        Ok(())
    }

    /// Validate, initialize and register every workload type of `plugin`.
    ///
    /// Registration is all-or-nothing: names are checked before the plugin's
    /// `initialize` hook runs, and nothing is inserted unless every step
    /// succeeds.
    pub fn register_plugin(&mut self, plugin: LoadedPlugin) -> Result<(), PluginError> {
        plugin.metadata().validate()?;

        let plugin = Arc::new(plugin);
        let incoming = WorkloadSource::Plugin(plugin.clone());
        for name in &plugin.metadata().workload_types {
            self.check_name(name, &incoming)?;
        }

        plugin.initialize()?;

        for name in &plugin.metadata().workload_types {
            self.entries.insert(name.clone(), incoming.clone());
        }
        info!(
            "Registered {} providing [{}]",
            plugin.describe(),
            plugin.metadata().workload_types.join(", ")
        );
        self.plugins.push(plugin);
        Ok(())
    }

    /// Load and register each path in order.
    ///
    /// Failures are isolated per plugin and returned; the remaining plugins
    /// still load.
    pub fn load_all(&mut self, loader: &dyn PluginLoader, paths: &[PathBuf]) -> Vec<PluginError> {
        let mut failures = Vec::new();
        for path in paths {
            let result = loader
                .load(path)
                .and_then(|plugin| self.register_plugin(plugin));
            if let Err(e) = result {
                warn!("Skipping plugin {:?}: {}", path, e);
                failures.push(e);
            }
        }
        failures
    }

    fn check_name(&self, name: &str, incoming: &WorkloadSource) -> Result<(), PluginError> {
        match self.entries.get(name) {
            Some(existing) => Err(PluginError::NameCollision {
                name: name.to_string(),
                existing: existing.describe(),
                incoming: incoming.describe(),
            }),
            None => Ok(()),
        }
    }

    pub fn get(&self, name: &str) -> Option<&WorkloadSource> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// `(name, source)` pairs in sorted order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &WorkloadSource)> {
        self.entries.iter().map(|(name, source)| (name.as_str(), source))
    }

    /// Plugins that registered successfully, in load order.
    pub fn plugins(&self) -> &[Arc<LoadedPlugin>] {
        &self.plugins
    }

    /// Create a new workload instance for `name`. Plugin workloads come back
    /// wrapped so the engine drives them and their library stays loaded.
    pub fn create(&self, name: &str) -> Result<Box<dyn Workload>, EngineError> {
        let source = self.get(name).ok_or_else(|| EngineError::UnknownWorkload {
            name: name.to_string(),
            available: self.names().join(", "),
        })?;

        let workload: Box<dyn Workload> = match source {
            WorkloadSource::Builtin(builtin) => (builtin.create)(),
            WorkloadSource::Plugin(plugin) => {
                let inner = plugin.create_workload(name).map_err(|source| {
                    EngineError::CreateWorkload {
                        workload: name.to_string(),
                        source,
                    }
                })?;
                Box::new(PluginWorkloadAdapter::new(inner, plugin.clone()))
            }
        };
        debug!("Created workload '{}' from {}", name, source.describe());
        Ok(workload)
    }

    /// Run every plugin's cleanup hook, collecting failures.
    pub fn cleanup_all(&self) -> Vec<PluginError> {
        let mut failures = Vec::new();
        for plugin in &self.plugins {
            if let Err(e) = plugin.cleanup() {
                warn!("{}", e);
                failures.push(e);
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::error::WorkloadError;
    use crate::metrics::Metrics;
    use crate::plugin::{
        PluginDatabase, PluginHost, PluginMetadata, PluginWorker, PluginWorkload, WorkloadPlugin,
    };
    use crate::pool::DbPool;
    use crate::workload::RunContext;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Noop;

    #[async_trait]
    impl Workload for Noop {
        async fn setup(&self, _: &RunContext, _: &DbPool, _: &RunConfig) -> Result<(), WorkloadError> {
            Ok(())
        }
        async fn cleanup(&self, _: &RunContext, _: &DbPool, _: &RunConfig) -> Result<(), WorkloadError> {
            Ok(())
        }
        async fn run(
            &self,
            _: &RunContext,
            _: &DbPool,
            _: &RunConfig,
            _: &Metrics,
        ) -> Result<(), WorkloadError> {
            Ok(())
        }
    }

    fn noop() -> Box<dyn Workload> {
        Box::new(Noop)
    }

    struct NoopPlugin;

    #[async_trait]
    impl PluginWorkload for NoopPlugin {
        async fn setup(&self, _: &dyn PluginDatabase, _: &RunConfig) -> Result<(), WorkloadError> {
            Ok(())
        }
        async fn cleanup(&self, _: &dyn PluginDatabase, _: &RunConfig) -> Result<(), WorkloadError> {
            Ok(())
        }
        fn worker(&self, _: usize, _: &RunConfig) -> Result<Box<dyn PluginWorker>, WorkloadError> {
            Err(WorkloadError::Unsupported("noop".to_string()))
        }
    }

    struct FakePlugin {
        name: &'static str,
        types: Vec<&'static str>,
        fail_init: bool,
        inits: Arc<AtomicUsize>,
    }

    impl FakePlugin {
        fn new(name: &'static str, types: Vec<&'static str>) -> Self {
            Self {
                name,
                types,
                fail_init: false,
                inits: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl WorkloadPlugin for FakePlugin {
        fn metadata(&self) -> PluginMetadata {
            PluginMetadata {
                name: self.name.to_string(),
                version: "0.1.0".to_string(),
                description: String::new(),
                author: String::new(),
                workload_types: self.types.iter().map(|t| t.to_string()).collect(),
                required_extensions: Vec::new(),
                min_db_version: None,
                homepage: None,
            }
        }

        fn create_workload(
            &self,
            workload_type: &str,
        ) -> Result<Box<dyn PluginWorkload>, WorkloadError> {
            if self.types.contains(&workload_type) {
                Ok(Box::new(NoopPlugin))
            } else {
                Err(WorkloadError::Unsupported(workload_type.to_string()))
            }
        }

        fn initialize(&self, _: &PluginHost) -> Result<(), WorkloadError> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            if self.fail_init {
                Err(WorkloadError::Other("no license".to_string()))
            } else {
                Ok(())
            }
        }
    }

    /// Loader that resolves file stems against a fixed table.
    struct TableLoader;

    impl PluginLoader for TableLoader {
        fn load(&self, path: &Path) -> Result<LoadedPlugin, PluginError> {
            match path.file_stem().and_then(|s| s.to_str()) {
                Some("good") => Ok(LoadedPlugin::in_process(Box::new(FakePlugin::new(
                    "good",
                    vec!["good_mix"],
                )))),
                _ => Err(PluginError::MissingSymbol {
                    path: path.to_path_buf(),
                    symbol: crate::plugin::DECLARATION_SYMBOL.to_string(),
                }),
            }
        }
    }

    fn builtin(name: &'static str) -> BuiltinWorkload {
        BuiltinWorkload {
            name,
            description: "test",
            create: noop,
        }
    }

    #[test]
    fn test_collision_names_both_sources() {
        let mut registry = PluginRegistry::new();
        registry.register_builtin(builtin("simple")).unwrap();
        registry.register_builtin(builtin("connection")).unwrap();

        let plugin = FakePlugin::new("dup", vec!["extra", "simple"]);
        let inits = plugin.inits.clone();
        let err = registry
            .register_plugin(LoadedPlugin::in_process(Box::new(plugin)))
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("'simple'"), "{message}");
        assert!(message.contains("builtin"), "{message}");
        assert!(message.contains("plugin 'dup'"), "{message}");

        // Nothing from the colliding plugin was registered or initialized.
        assert_eq!(inits.load(Ordering::SeqCst), 0);
        assert!(!registry.contains("extra"));
        assert!(registry.create("connection").is_ok());
        assert!(registry.create("simple").is_ok());
        assert_eq!(registry.names(), vec!["connection", "simple"]);
    }

    #[test]
    fn test_collision_between_plugins() {
        let mut registry = PluginRegistry::new();
        registry
            .register_plugin(LoadedPlugin::in_process(Box::new(FakePlugin::new(
                "first",
                vec!["mix"],
            ))))
            .unwrap();
        let err = registry
            .register_plugin(LoadedPlugin::in_process(Box::new(FakePlugin::new(
                "second",
                vec!["mix"],
            ))))
            .unwrap_err();
        assert!(matches!(err, PluginError::NameCollision { .. }));
        let message = err.to_string();
        assert!(message.contains("plugin 'first'") && message.contains("plugin 'second'"));
        assert_eq!(registry.plugins().len(), 1);
    }

    #[test]
    fn test_bad_plugin_does_not_block_good_one() {
        let mut registry = PluginRegistry::new();
        let failures = registry.load_all(
            &TableLoader,
            &[PathBuf::from("/plugins/broken.so"), PathBuf::from("/plugins/good.so")],
        );
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0], PluginError::MissingSymbol { .. }));
        assert!(registry.contains("good_mix"));
        assert!(registry.create("good_mix").is_ok());
    }

    #[test]
    fn test_initialize_failure_is_isolated() {
        let mut registry = PluginRegistry::new();
        let mut bad = FakePlugin::new("bad", vec!["bad_mix"]);
        bad.fail_init = true;
        let err = registry
            .register_plugin(LoadedPlugin::in_process(Box::new(bad)))
            .unwrap_err();
        assert!(matches!(err, PluginError::Initialize { .. }));
        assert!(!registry.contains("bad_mix"));

        registry
            .register_plugin(LoadedPlugin::in_process(Box::new(FakePlugin::new(
                "fine",
                vec!["fine_mix"],
            ))))
            .unwrap();
        assert_eq!(registry.names(), vec!["fine_mix"]);
    }

    #[test]
    fn test_initialize_and_cleanup_once() {
        let mut registry = PluginRegistry::new();
        let plugin = FakePlugin::new("once", vec!["a", "b"]);
        let inits = plugin.inits.clone();
        registry
            .register_plugin(LoadedPlugin::in_process(Box::new(plugin)))
            .unwrap();
        registry.create("a").unwrap();
        registry.create("b").unwrap();
        assert_eq!(inits.load(Ordering::SeqCst), 1);

        assert!(registry.cleanup_all().is_empty());
        assert!(registry.cleanup_all().is_empty());
    }

    #[test]
    fn test_invalid_metadata_rejected() {
        let mut registry = PluginRegistry::new();
        let err = registry
            .register_plugin(LoadedPlugin::in_process(Box::new(FakePlugin::new(
                "empty",
                vec![],
            ))))
            .unwrap_err();
        assert!(matches!(err, PluginError::InvalidMetadata { .. }));
        assert!(registry.plugins().is_empty());
    }

    #[test]
    fn test_unknown_workload() {
        let mut registry = PluginRegistry::new();
        registry.register_builtin(builtin("simple")).unwrap();
        let err = registry.create("unknown_workload").err().unwrap();
        assert!(matches!(err, EngineError::UnknownWorkload { .. }));
        assert!(err.to_string().contains("available: simple"));
    }
}
