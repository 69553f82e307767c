//! Pre-configured trust setups for common use cases

use std::path::PathBuf;
use std::sync::Arc;

use super::broker::{DenialPolicy, TrustBroker};
use super::encrypted::EncryptedFileTrustStore;
use super::prompt::{AutoPrompt, ConsentPrompt, TerminalPrompt, UnavailablePrompt};
use super::store::{MemoryTrustStore, TrustStore};
use crate::audit::{AuditSink, FileAuditSink, MemoryAuditSink, NullAuditSink};

/// Everything the broker is built from
pub struct TrustConfig {
    pub store: Arc<dyn TrustStore>,
    pub prompt: Arc<dyn ConsentPrompt>,
    pub audit: Arc<dyn AuditSink>,
    pub policy: DenialPolicy,
}

impl std::fmt::Debug for TrustConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustConfig")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl TrustConfig {
    pub fn new(
        store: impl TrustStore + 'static,
        prompt: impl ConsentPrompt + 'static,
        audit: impl AuditSink + 'static,
    ) -> Self {
        Self {
            store: Arc::new(store),
            prompt: Arc::new(prompt),
            audit: Arc::new(audit),
            policy: DenialPolicy::default(),
        }
    }

    pub fn into_broker(self) -> TrustBroker {
        TrustBroker::new(self.store, self.prompt, self.audit).with_policy(self.policy)
    }
}

/// Builder for trust configurations
pub struct TrustConfigBuilder {
    store: Option<Arc<dyn TrustStore>>,
    prompt: Option<Arc<dyn ConsentPrompt>>,
    audit: Option<Arc<dyn AuditSink>>,
    policy: DenialPolicy,
    app_name: Option<String>,
}

impl TrustConfigBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            prompt: None,
            audit: None,
            policy: DenialPolicy::default(),
            app_name: None,
        }
    }

    /// Application name, used for the default store location
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = Some(name.into());
        self
    }

    pub fn store(mut self, store: impl TrustStore + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    pub fn shared_store(mut self, store: Arc<dyn TrustStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn prompt(mut self, prompt: impl ConsentPrompt + 'static) -> Self {
        self.prompt = Some(Arc::new(prompt));
        self
    }

    pub fn shared_prompt(mut self, prompt: Arc<dyn ConsentPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn audit(mut self, audit: impl AuditSink + 'static) -> Self {
        self.audit = Some(Arc::new(audit));
        self
    }

    pub fn shared_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn policy(mut self, policy: DenialPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Build the configuration
    ///
    /// Without an explicit store, the encrypted store in the application's
    /// data directory is used.
    pub fn build(self) -> Result<TrustConfig, PresetError> {
        let app_name = self.app_name.as_deref().unwrap_or("warden");

        let store: Arc<dyn TrustStore> = match self.store {
            Some(s) => s,
            None => Arc::new(
                EncryptedFileTrustStore::default_for_app(app_name)
                    .map_err(|e| PresetError::StoreInit(e.to_string()))?,
            ),
        };

        Ok(TrustConfig {
            store,
            prompt: self
                .prompt
                .unwrap_or_else(|| Arc::new(TerminalPrompt::new())),
            audit: self.audit.unwrap_or_else(|| Arc::new(NullAuditSink)),
            policy: self.policy,
        })
    }
}

impl Default for TrustConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Error type for preset initialization
#[derive(Debug, thiserror::Error)]
pub enum PresetError {
    #[error("Failed to initialize store: {0}")]
    StoreInit(String),

    #[error("Failed to initialize audit: {0}")]
    AuditInit(String),
}

// ============================================================================
// Preset Configurations
// ============================================================================

pub struct TrustPresets;

impl TrustPresets {
    fn data_dir(app_name: &str) -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(app_name)
    }

    /// Desktop/terminal use
    ///
    /// - Encrypted store in the data directory
    /// - Terminal prompts
    /// - JSONL audit log next to the store
    pub fn interactive(app_name: &str) -> Result<TrustConfig, PresetError> {
        let dir = Self::data_dir(app_name);

        let store = EncryptedFileTrustStore::open(dir.join("trust.bin"), dir.join("trust.key"))
            .map_err(|e| PresetError::StoreInit(e.to_string()))?;
        let audit = FileAuditSink::new(dir.join("audit.jsonl"))
            .map_err(|e| PresetError::AuditInit(e.to_string()))?;

        Ok(TrustConfig::new(store, TerminalPrompt::new(), audit))
    }

    /// No consent surface: stored approvals apply, everything else is denied
    ///
    /// Denials are sticky so a headless service does not retry prompts it
    /// can never show.
    pub fn headless(app_name: &str) -> Result<TrustConfig, PresetError> {
        let dir = Self::data_dir(app_name);

        let store = EncryptedFileTrustStore::open(dir.join("trust.bin"), dir.join("trust.key"))
            .map_err(|e| PresetError::StoreInit(e.to_string()))?;
        let audit = FileAuditSink::new(dir.join("audit.jsonl"))
            .map_err(|e| PresetError::AuditInit(e.to_string()))?;

        let mut config = TrustConfig::new(store, UnavailablePrompt, audit);
        config.policy = DenialPolicy::Sticky;
        Ok(config)
    }

    /// In-memory store, auto-approve, memory audit
    pub fn testing() -> TrustConfig {
        TrustConfig::new(
            MemoryTrustStore::new(),
            AutoPrompt::always_allow(),
            MemoryAuditSink::new(),
        )
    }
}
