//! Unit registry
//!
//! [`NativeHost`] is the remote-facing surface: register source text, get a
//! channel handle back, invoke exports through it. Loading and invocation
//! run on tokio's blocking pool since both may sit in a consent prompt.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value as Json;
use tokio::sync::RwLock;
use warden_api::{CodeHash, ErrorKind, InvokeResult, StructuredError, CHANNEL_PREFIX};

use crate::audit::{self, AuditEvent};
use crate::config::HostConfig;
use crate::invoker::ExportInvoker;
use crate::sandbox::{CodeUnit, SandboxError, SandboxExecutionContext};
use crate::trust::{TrustBroker, TrustConfig};

/// Errors that can occur during registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Failed to read unit {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unit '{id}' failed to load: {error}")]
    Load {
        id: String,
        #[source]
        error: SandboxError,
    },

    #[error("Sandbox setup failed: {0}")]
    Setup(#[from] SandboxError),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl RegistryError {
    /// Form reported to the remote caller
    pub fn to_structured(&self) -> StructuredError {
        match self {
            Self::Load { error, .. } => error.to_structured(),
            other => StructuredError::new(ErrorKind::LoadFailed, other.to_string()),
        }
    }
}

/// Channel handle for a unit id
pub fn channel_handle(id: &str) -> String {
    format!("{}{}", CHANNEL_PREFIX, id)
}

struct UnitEntry {
    invoker: Arc<ExportInvoker>,
    source_path: Option<PathBuf>,
}

#[derive(Default)]
struct RegistryInner {
    units: HashMap<String, UnitEntry>,
    path_to_unit: HashMap<PathBuf, String>,
}

/// Registry of loaded code units
#[derive(Clone)]
pub struct NativeHost {
    inner: Arc<RwLock<RegistryInner>>,
    context: Arc<SandboxExecutionContext>,
}

impl NativeHost {
    /// Build the broker from `trust` and a fresh execution context
    pub fn new(trust: TrustConfig, config: &HostConfig) -> Result<Self, RegistryError> {
        let broker = Arc::new(trust.into_broker());
        broker.init();
        let context = SandboxExecutionContext::new(broker, config)?;
        Ok(Self::with_context(context))
    }

    pub fn with_context(context: SandboxExecutionContext) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner::default())),
            context: Arc::new(context),
        }
    }

    pub fn context(&self) -> &Arc<SandboxExecutionContext> {
        &self.context
    }

    pub fn broker(&self) -> &Arc<TrustBroker> {
        self.context.broker()
    }

    /// Load `source` as unit `id`; returns its channel handle
    ///
    /// A unit already registered under `id` is torn down first. If the new
    /// source fails to load nothing is registered.
    pub async fn register(&self, id: &str, source: &str) -> Result<String, RegistryError> {
        self.load(CodeUnit::new(id, source)).await
    }

    /// Load a unit from a file; the unit id is the file stem
    pub async fn register_file(&self, path: impl AsRef<Path>) -> Result<String, RegistryError> {
        let path = path.as_ref();
        let source = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| RegistryError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let id = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        self.load(CodeUnit::new(id, source).with_origin(path)).await
    }

    async fn load(&self, unit: CodeUnit) -> Result<String, RegistryError> {
        self.unregister(&unit.id).await;

        let context = self.context.clone();
        let job = unit.clone();
        let loaded = tokio::task::spawn_blocking(move || context.run(&job))
            .await
            .map_err(|e| RegistryError::Task(e.to_string()))?;

        let loaded = match loaded {
            Ok(loaded) => loaded,
            Err(error) => {
                self.record(audit::load_failed(&unit.id, unit.code_hash.as_str(), &error.to_string()));
                return Err(RegistryError::Load { id: unit.id, error });
            }
        };

        let channel = channel_handle(&unit.id);
        let entry = UnitEntry {
            invoker: Arc::new(ExportInvoker::new(loaded)),
            source_path: unit.origin.clone(),
        };

        let mut stale = Vec::new();
        let mut inner = self.inner.write().await;
        if let Some(path) = &unit.origin {
            if let Some(previous) = inner.path_to_unit.insert(path.clone(), unit.id.clone()) {
                if previous != unit.id {
                    stale.extend(inner.units.remove(&previous));
                }
            }
        }
        stale.extend(inner.units.insert(unit.id.clone(), entry));
        drop(inner);

        // A concurrent registration of the same id or path lost the race
        for entry in stale {
            entry.invoker.shutdown();
        }

        self.record(audit::unit_loaded(
            &unit.id,
            unit.code_hash.as_str(),
            &channel,
            unit.origin.as_deref(),
        ));
        tracing::info!(unit = %unit.id, channel = %channel, hash = %unit.code_hash, "Unit registered");
        Ok(channel)
    }

    /// Call `export` on the unit behind `channel`
    pub async fn invoke(&self, channel: &str, export: &str, args: Vec<Json>) -> InvokeResult {
        let invoker = self.invoker(channel).await.ok_or_else(|| {
            StructuredError::new(
                ErrorKind::UnknownChannel,
                format!("No unit registered on channel '{}'", channel),
            )
        })?;

        let export = export.to_string();
        tokio::task::spawn_blocking(move || invoker.invoke(&export, &args).map_err(|e| e.to_structured()))
            .await
            .map_err(|e| StructuredError::new(ErrorKind::ExportFailed, e.to_string()))?
    }

    /// Tear down unit `id`; returns whether it was registered
    pub async fn unregister(&self, id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.units.remove(id) else {
            return false;
        };
        if let Some(path) = &entry.source_path {
            inner.path_to_unit.remove(path);
        }
        let hash = entry.invoker.code_hash().clone();
        let shared = inner.units.values().any(|other| other.invoker.code_hash() == &hash);
        drop(inner);

        entry.invoker.shutdown();
        if !shared {
            self.broker().forget(&hash);
        }
        self.record(audit::unit_unloaded(id, hash.as_str()));
        tracing::info!(unit = %id, "Unit unregistered");
        true
    }

    /// Tear down the unit loaded from `path`
    pub async fn unload_by_path(&self, path: impl AsRef<Path>) -> Option<String> {
        let id = self.inner.read().await.path_to_unit.get(path.as_ref()).cloned()?;
        self.unregister(&id).await.then_some(id)
    }

    /// Registered channel handles, sorted
    pub async fn channels(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut channels: Vec<String> = inner.units.keys().map(|id| channel_handle(id)).collect();
        channels.sort();
        channels
    }

    /// Invocable exports of the unit behind `channel`
    pub async fn exports(&self, channel: &str) -> Option<Vec<String>> {
        self.invoker(channel).await.map(|invoker| invoker.exports().to_vec())
    }

    pub async fn code_hash(&self, id: &str) -> Option<CodeHash> {
        let inner = self.inner.read().await;
        inner.units.get(id).map(|entry| entry.invoker.code_hash().clone())
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.read().await.units.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.units.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.units.is_empty()
    }

    /// Persist trust decisions and audit events
    pub fn flush(&self) {
        self.broker().flush();
    }

    async fn invoker(&self, channel: &str) -> Option<Arc<ExportInvoker>> {
        let id = channel.strip_prefix(CHANNEL_PREFIX)?;
        let inner = self.inner.read().await;
        inner.units.get(id).map(|entry| entry.invoker.clone())
    }

    fn record(&self, event: AuditEvent) {
        if let Err(e) = self.broker().audit().record(event) {
            tracing::warn!(error = %e, "Failed to record audit event");
        }
    }
}

impl std::fmt::Debug for NativeHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeHost")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}
