//! Real host module implementations
//!
//! [`HostModules`] is what the intercepting loader resolves keys against. It
//! hands out one instance per module so that every unit sees the same object
//! for the same key, which keeps proxy identity stable. Embedders can add
//! their own modules with [`HostModules::register`].

mod child_process;
mod file;
mod fs;
mod os;
mod path;
mod process;
mod wasm;

pub use file::FileState;
pub use path::normalize_lexically;
pub(crate) use os::{arch, platform};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crate::classifier::is_path_key;
use crate::value::{HostError, HostResult, Value};

/// What module factories get to see
#[derive(Debug, Clone)]
pub struct ModuleContext {
    /// Base directory for relative paths
    pub resources_dir: PathBuf,
}

/// Builds the real implementation of a module
pub type ModuleFactory = Arc<dyn Fn(&ModuleContext) -> HostResult + Send + Sync>;

/// Registry of module factories plus their singleton instances
pub struct HostModules {
    context: ModuleContext,
    factories: RwLock<HashMap<String, ModuleFactory>>,
    instances: Mutex<HashMap<String, Value>>,
}

impl HostModules {
    /// Registry with no modules
    pub fn new(resources_dir: impl Into<PathBuf>) -> Self {
        Self {
            context: ModuleContext {
                resources_dir: resources_dir.into(),
            },
            factories: RwLock::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Registry with the stock modules
    pub fn builtin(resources_dir: impl Into<PathBuf>) -> Self {
        let modules = Self::new(resources_dir);
        modules.register("fs", |ctx| Ok(fs::module("Fs", ctx)));
        modules.register("fs/promises", |ctx| Ok(fs::module("FsPromises", ctx)));
        modules.register("os", |_| Ok(os::module()));
        modules.register("child_process", |ctx| Ok(child_process::module(ctx)));
        modules.register("process", |_| Ok(process::module()));
        modules.register("path", |_| Ok(path::module()));
        modules.register("WebAssembly", |_| Ok(wasm::module()));
        modules
    }

    pub fn context(&self) -> &ModuleContext {
        &self.context
    }

    /// Register (or replace) a module
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ModuleContext) -> HostResult + Send + Sync + 'static,
    {
        let name = name.into();
        self.instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&name);
        self.factories
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name, Arc::new(factory));
    }

    /// Whether `key` names a module or a path
    pub fn contains(&self, key: &str) -> bool {
        is_path_key(key)
            || self
                .factories
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .contains_key(key)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Real implementation for a normalized key
    ///
    /// Path-shaped keys resolve to a file object; anything else must have
    /// been registered.
    pub fn resolve(&self, key: &str) -> HostResult {
        if let Some(instance) = self.cached(key) {
            return Ok(instance);
        }

        let instance = if is_path_key(key) {
            file::open(self.resolve_path(key))
        } else {
            let factory = self
                .factories
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .get(key)
                .cloned()
                .ok_or_else(|| HostError::ModuleNotFound(key.to_string()))?;
            factory(&self.context)?
        };

        tracing::debug!(module = %key, "Instantiated host module");
        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        Ok(instances.entry(key.to_string()).or_insert(instance).clone())
    }

    /// Filesystem location a path-shaped key points at
    pub fn resolve_path(&self, key: &str) -> PathBuf {
        let raw = key.strip_prefix("file://").unwrap_or(key);
        let path = Path::new(raw);
        if path.is_absolute() || !raw.starts_with('.') {
            normalize_lexically(path)
        } else {
            normalize_lexically(&self.context.resources_dir.join(path))
        }
    }

    fn cached(&self, key: &str) -> Option<Value> {
        self.instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }
}

impl std::fmt::Debug for HostModules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostModules")
            .field("resources_dir", &self.context.resources_dir)
            .field("modules", &self.names())
            .finish()
    }
}
