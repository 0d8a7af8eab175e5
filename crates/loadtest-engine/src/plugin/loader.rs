//! Loading plugins from dynamic libraries.
//!
//! This is the only module that knows how plugin code gets into the process.
//! Everything above it works with [`LoadedPlugin`] values, so the mechanism
//! can be swapped (e.g. for statically linked plugins in tests) through the
//! [`PluginLoader`] trait.

use super::{
    PluginDeclaration, PluginHost, PluginMetadata, PluginWorkload, WorkloadPlugin,
    DECLARATION_SYMBOL, ENGINE_VERSION, PLUGIN_ABI_VERSION, RUSTC_VERSION,
};
use crate::error::{PluginError, WorkloadError};
use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// A plugin whose code is loaded and whose metadata has been read.
///
/// Field order matters: the plugin object is dropped before the library
/// handle that holds its code.
pub struct LoadedPlugin {
    plugin: Box<dyn WorkloadPlugin>,
    metadata: PluginMetadata,
    path: Option<PathBuf>,
    initialized: AtomicBool,
    cleaned_up: AtomicBool,
    _library: Option<Arc<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("metadata", &self.metadata)
            .field("path", &self.path)
            .finish()
    }
}

impl LoadedPlugin {
    /// Wrap a plugin object that lives in this process (no library to keep alive).
    pub fn in_process(plugin: Box<dyn WorkloadPlugin>) -> Self {
        Self::new(plugin, None, None)
    }

    fn new(
        plugin: Box<dyn WorkloadPlugin>,
        path: Option<PathBuf>,
        library: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Self {
        let metadata = plugin.metadata();
        Self {
            plugin,
            metadata,
            path,
            initialized: AtomicBool::new(false),
            cleaned_up: AtomicBool::new(false),
            _library: library,
        }
    }

    /// Metadata captured at load time.
    pub fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    /// Library path, if loaded from disk.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Human-readable origin used in error messages.
    pub fn describe(&self) -> String {
        match &self.path {
            Some(path) => format!(
                "plugin '{}' {} ({})",
                self.metadata.name,
                self.metadata.version,
                path.display()
            ),
            None => format!("plugin '{}' {}", self.metadata.name, self.metadata.version),
        }
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Run the plugin's `initialize` hook with the calling thread's log
    /// dispatcher. A second call is a no-op.
    pub(crate) fn initialize(&self) -> Result<(), PluginError> {
        if self.is_initialized() {
            return Ok(());
        }
        self.plugin
            .initialize(&PluginHost::current())
            .map_err(|source| PluginError::Initialize {
                plugin: self.metadata.name.clone(),
                source,
            })?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Run the plugin's `cleanup` hook at most once, and only if it initialized.
    pub(crate) fn cleanup(&self) -> Result<(), PluginError> {
        if !self.is_initialized() || self.cleaned_up.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.plugin.cleanup().map_err(|source| PluginError::Cleanup {
            plugin: self.metadata.name.clone(),
            source,
        })
    }

    pub(crate) fn create_workload(
        &self,
        workload_type: &str,
    ) -> Result<Box<dyn PluginWorkload>, WorkloadError> {
        self.plugin.create_workload(workload_type)
    }
}

/// Strategy for turning a path into a [`LoadedPlugin`].
pub trait PluginLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<LoadedPlugin, PluginError>;
}

/// Loads `cdylib` plugins with `libloading`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DylibLoader;

impl PluginLoader for DylibLoader {
    fn load(&self, path: &Path) -> Result<LoadedPlugin, PluginError> {
        debug!("Opening plugin library {:?}", path);

        // SAFETY: loading a library runs its initializers. Plugin paths come
        // from operator configuration and are trusted to that extent.
        let library = unsafe { libloading::Library::new(path) }.map_err(|source| {
            PluginError::Open {
                path: path.to_path_buf(),
                source,
            }
        })?;

        let symbol = format!("{DECLARATION_SYMBOL}\0");
        // SAFETY: the symbol is a `static PluginDeclaration` emitted by
        // `declare_plugin!`; its layout is guarded by the ABI check below.
        let declaration: *const PluginDeclaration = unsafe {
            *library
                .get::<*const PluginDeclaration>(symbol.as_bytes())
                .map_err(|_| PluginError::MissingSymbol {
                    path: path.to_path_buf(),
                    symbol: DECLARATION_SYMBOL.to_string(),
                })?
        };
        if declaration.is_null() {
            return Err(PluginError::MissingSymbol {
                path: path.to_path_buf(),
                symbol: DECLARATION_SYMBOL.to_string(),
            });
        }

        // SAFETY: non-null pointer into the library, which is alive here.
        // `abi_version` sits at offset 0 in every layout, so it is read
        // alone before the rest of the declaration is trusted.
        let abi_version = unsafe { (*declaration).abi_version };
        if abi_version != PLUGIN_ABI_VERSION {
            return Err(PluginError::AbiMismatch {
                path: path.to_path_buf(),
                reason: format!("plugin ABI version {abi_version}, host expects {PLUGIN_ABI_VERSION}"),
            });
        }
        let (engine_version, rustc_version, create) = unsafe {
            let decl = &*declaration;
            (
                decl.engine_version.to_string(),
                decl.rustc_version.to_string(),
                decl.create,
            )
        };
        check_compatibility(abi_version, &engine_version, &rustc_version).map_err(|reason| {
            PluginError::AbiMismatch {
                path: path.to_path_buf(),
                reason,
            }
        })?;

        let plugin = create();
        let loaded = LoadedPlugin::new(
            plugin,
            Some(path.to_path_buf()),
            Some(Arc::new(library) as Arc<dyn Any + Send + Sync>),
        );
        info!("Loaded {}", loaded.describe());
        Ok(loaded)
    }
}

/// Accept a plugin only if it uses our declaration layout, the same engine
/// major.minor (pre-1.0 minors are breaking) and the same compiler.
pub fn check_compatibility(
    abi_version: u32,
    engine_version: &str,
    rustc_version: &str,
) -> Result<(), String> {
    if abi_version != PLUGIN_ABI_VERSION {
        return Err(format!(
            "plugin ABI version {abi_version}, host expects {PLUGIN_ABI_VERSION}"
        ));
    }
    if rustc_version != RUSTC_VERSION {
        return Err(format!(
            "plugin built with '{rustc_version}', host built with '{RUSTC_VERSION}'"
        ));
    }
    let host = semver::Version::parse(ENGINE_VERSION)
        .map_err(|e| format!("host engine version is not semver: {e}"))?;
    let theirs = semver::Version::parse(engine_version)
        .map_err(|e| format!("plugin engine version '{engine_version}' is not semver: {e}"))?;
    if host.major != theirs.major || host.minor != theirs.minor {
        return Err(format!(
            "plugin built against engine {theirs}, host engine is {host}"
        ));
    }
    Ok(())
}

/// Whether `path` has this platform's dynamic library extension.
pub fn is_plugin_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map(|ext| ext == std::env::consts::DLL_EXTENSION)
            .unwrap_or(false)
}

/// Collect plugin library paths from `dirs`, sorted for deterministic
/// registration order. Unreadable directories are reported, not fatal.
pub fn discover(dirs: &[PathBuf]) -> (Vec<PathBuf>, Vec<PluginError>) {
    let mut found = Vec::new();
    let mut errors = Vec::new();

    for dir in dirs {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(source) => {
                errors.push(PluginError::Discovery {
                    path: dir.clone(),
                    source,
                });
                continue;
            }
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_plugin_file(path))
            .collect();
        paths.sort();
        debug!("Found {} plugin(s) in {:?}", paths.len(), dir);
        found.extend(paths);
    }

    (found, errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_compatibility() {
        let ok = |abi, engine, rustc| check_compatibility(abi, engine, rustc).is_ok();
        assert!(ok(PLUGIN_ABI_VERSION, ENGINE_VERSION, RUSTC_VERSION));
        assert!(!ok(PLUGIN_ABI_VERSION + 1, ENGINE_VERSION, RUSTC_VERSION));
        assert!(!ok(PLUGIN_ABI_VERSION, "99.0.0", RUSTC_VERSION));
        assert!(!ok(PLUGIN_ABI_VERSION, "garbage", RUSTC_VERSION));

        let err = check_compatibility(PLUGIN_ABI_VERSION, ENGINE_VERSION, "rustc 1.0.0").unwrap_err();
        assert!(err.contains("rustc 1.0.0"));
    }

    #[test]
    fn test_discover_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let ext = std::env::consts::DLL_EXTENSION;
        for name in [format!("b.{ext}"), format!("a.{ext}"), "notes.txt".to_string()] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        std::fs::create_dir(dir.path().join(format!("nested.{ext}"))).unwrap();

        let (paths, errors) = discover(&[dir.path().to_path_buf()]);
        assert!(errors.is_empty());
        let names: Vec<_> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec![format!("a.{ext}"), format!("b.{ext}")]);
    }

    #[test]
    fn test_discover_reports_missing_dir() {
        let (paths, errors) = discover(&[PathBuf::from("/definitely/not/here")]);
        assert!(paths.is_empty());
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], PluginError::Discovery { .. }));
    }

    #[test]
    fn test_dylib_loader_rejects_non_library() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir
            .path()
            .join(format!("fake.{}", std::env::consts::DLL_EXTENSION));
        std::fs::write(&path, b"not a shared object").unwrap();

        let err = DylibLoader.load(&path).unwrap_err();
        assert!(matches!(err, PluginError::Open { .. }));
    }
}
