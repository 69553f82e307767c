//! Host configuration
//!
//! [`HostConfig`] collects everything the runtime needs that is not a trust
//! collaborator: where data lives, how long code may run, and which
//! environment variables sandboxed code is allowed to see.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::classifier::DangerTable;
use crate::trust::{EncryptedFileTrustStore, StoreError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid environment pattern: {0}")]
    InvalidEnvPattern(String),

    #[error("Execution limit out of range: {0}")]
    InvalidLimit(String),
}

/// Time and CPU bounds applied to sandboxed code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    /// Wall-clock budget for a unit's top-level code
    pub load_timeout: Duration,

    /// Wall-clock budget for one export invocation; `None` means unbounded
    pub invoke_timeout: Option<Duration>,

    /// Granularity of the epoch ticker that enforces the budgets
    pub epoch_tick: Duration,

    /// Fuel per run, as a secondary CPU bound
    pub fuel: Option<u64>,

    /// Maximum wasm stack size in bytes
    pub max_wasm_stack: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_secs(5),
            invoke_timeout: Some(Duration::from_secs(30)),
            epoch_tick: Duration::from_millis(10),
            fuel: None,
            max_wasm_stack: 512 * 1024,
        }
    }
}

impl ExecutionLimits {
    /// Number of epoch ticks that make up `budget`, at least one
    pub fn ticks_for(&self, budget: Duration) -> u64 {
        let tick = self.epoch_tick.as_nanos().max(1);
        (budget.as_nanos().div_ceil(tick)).max(1) as u64
    }
}

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub app_name: String,

    /// Directory holding the trust store, key file and audit log
    pub data_dir: PathBuf,

    pub store_file: String,
    pub key_file: String,
    pub audit_file: String,

    /// Base directory that path-shaped resource keys resolve against
    pub resources_dir: PathBuf,

    pub limits: ExecutionLimits,

    /// Environment variables visible through the sandbox `process.env`
    ///
    /// Exact names or suffix wildcards such as `MYAPP_*`.
    pub env_allowlist: Vec<String>,

    pub danger_table: DangerTable,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::new("warden")
    }
}

impl HostConfig {
    pub fn new(app_name: impl Into<String>) -> Self {
        let app_name = app_name.into();
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(&app_name);

        Self {
            app_name,
            data_dir,
            store_file: "trust.bin".to_string(),
            key_file: "trust.key".to_string(),
            audit_file: "audit.jsonl".to_string(),
            resources_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            limits: ExecutionLimits::default(),
            env_allowlist: vec!["LANG".to_string(), "TZ".to_string()],
            danger_table: DangerTable::builtin(),
        }
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_store_file(mut self, name: impl Into<String>) -> Self {
        self.store_file = name.into();
        self
    }

    pub fn with_key_file(mut self, name: impl Into<String>) -> Self {
        self.key_file = name.into();
        self
    }

    pub fn with_resources_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.resources_dir = dir.into();
        self
    }

    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.limits.load_timeout = timeout;
        self
    }

    pub fn with_invoke_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.limits.invoke_timeout = timeout;
        self
    }

    pub fn with_epoch_tick(mut self, tick: Duration) -> Self {
        self.limits.epoch_tick = tick;
        self
    }

    pub fn with_fuel(mut self, fuel: Option<u64>) -> Self {
        self.limits.fuel = fuel;
        self
    }

    pub fn with_max_wasm_stack(mut self, bytes: usize) -> Self {
        self.limits.max_wasm_stack = bytes;
        self
    }

    /// Expose an environment variable (or `PREFIX_*` family) to sandboxed code
    pub fn with_env(mut self, pattern: impl Into<String>) -> Self {
        self.env_allowlist.push(pattern.into());
        self
    }

    pub fn with_danger_table(mut self, table: DangerTable) -> Self {
        self.danger_table = table;
        self
    }

    /// Add a runtime namespace prefix stripped before classification
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.danger_table = self.danger_table.with_prefix(prefix);
        self
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(&self.store_file)
    }

    pub fn key_path(&self) -> PathBuf {
        self.data_dir.join(&self.key_file)
    }

    pub fn audit_path(&self) -> PathBuf {
        self.data_dir.join(&self.audit_file)
    }

    /// Open the encrypted trust store at the configured location
    pub fn open_trust_store(&self) -> Result<EncryptedFileTrustStore, StoreError> {
        EncryptedFileTrustStore::open(self.store_path(), self.key_path())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for pattern in &self.env_allowlist {
            validate_env_pattern(pattern)?;
        }
        if self.limits.epoch_tick.is_zero() {
            return Err(ConfigError::InvalidLimit("epoch tick must be non-zero".into()));
        }
        if self.limits.load_timeout.is_zero() {
            return Err(ConfigError::InvalidLimit("load timeout must be non-zero".into()));
        }
        Ok(())
    }

    /// Resolve the allow-list against the current process environment
    pub fn allowed_env(&self) -> Result<Vec<(String, String)>, ConfigError> {
        let mut vars = Vec::new();
        for pattern in &self.env_allowlist {
            for (key, value) in expand_env_pattern(pattern)? {
                if !vars.iter().any(|(k, _)| k == &key) {
                    vars.push((key, value));
                }
            }
        }
        vars.sort();
        Ok(vars)
    }
}

/// Validate an environment allow-list pattern
///
/// Exact names (`HOME`) or a single trailing wildcard (`MY_*`). Leading or
/// inner wildcards and the bare `*` are rejected.
pub fn validate_env_pattern(pattern: &str) -> Result<(), ConfigError> {
    if pattern.is_empty() {
        return Err(ConfigError::InvalidEnvPattern("empty pattern".to_string()));
    }

    let wildcard_count = pattern.matches('*').count();
    if wildcard_count > 1 {
        return Err(ConfigError::InvalidEnvPattern(format!(
            "multiple wildcards not supported: {}",
            pattern
        )));
    }
    if wildcard_count == 1 && !pattern.ends_with('*') {
        return Err(ConfigError::InvalidEnvPattern(format!(
            "wildcard must be at end of pattern: {}",
            pattern
        )));
    }
    if !pattern
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '*')
    {
        return Err(ConfigError::InvalidEnvPattern(format!(
            "invalid characters in pattern: {}",
            pattern
        )));
    }
    if pattern == "*" {
        return Err(ConfigError::InvalidEnvPattern(
            "bare wildcard '*' not allowed".to_string(),
        ));
    }

    Ok(())
}

/// Expand one pattern to the matching `(name, value)` pairs
pub fn expand_env_pattern(pattern: &str) -> Result<Vec<(String, String)>, ConfigError> {
    validate_env_pattern(pattern)?;

    if let Some(prefix) = pattern.strip_suffix('*') {
        Ok(std::env::vars()
            .filter(|(key, _)| key.starts_with(prefix))
            .collect())
    } else {
        match std::env::var(pattern) {
            Ok(value) => Ok(vec![(pattern.to_string(), value)]),
            Err(std::env::VarError::NotPresent) => Ok(vec![]),
            Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidEnvPattern(format!(
                "environment variable '{}' contains invalid unicode",
                pattern
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HostConfig::new("myapp");
        assert!(config.data_dir.ends_with("myapp"));
        assert!(config.store_path().ends_with("myapp/trust.bin"));
        assert_eq!(config.limits.load_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let config = HostConfig::new("myapp")
            .with_data_dir("/tmp/warden-test")
            .with_load_timeout(Duration::from_millis(200))
            .with_fuel(Some(1_000))
            .with_prefix("bun:");

        assert_eq!(config.key_path(), PathBuf::from("/tmp/warden-test/trust.key"));
        assert_eq!(config.limits.fuel, Some(1_000));
        assert!(config.danger_table.prefixes.iter().any(|p| p == "bun:"));
    }

    #[test]
    fn test_ticks_for_budget() {
        let limits = ExecutionLimits {
            epoch_tick: Duration::from_millis(10),
            ..Default::default()
        };
        assert_eq!(limits.ticks_for(Duration::from_millis(100)), 10);
        assert_eq!(limits.ticks_for(Duration::from_millis(15)), 2);
        assert_eq!(limits.ticks_for(Duration::ZERO), 1);
    }

    #[test]
    fn test_validate_env_pattern() {
        assert!(validate_env_pattern("HOME").is_ok());
        assert!(validate_env_pattern("MYAPP_CONFIG_*").is_ok());

        assert!(validate_env_pattern("").is_err());
        assert!(validate_env_pattern("*").is_err());
        assert!(validate_env_pattern("*_SECRET").is_err());
        assert!(validate_env_pattern("MY_*_*").is_err());
        assert!(validate_env_pattern("MY-VAR").is_err());
    }

    #[test]
    fn test_invalid_allowlist_fails_validation() {
        let config = HostConfig::new("myapp").with_env("*");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidEnvPattern(_))
        ));
    }

    #[test]
    fn test_missing_variable_expands_to_nothing() {
        let vars = expand_env_pattern("WARDEN_TEST_SURELY_UNSET_VARIABLE").unwrap();
        assert!(vars.is_empty());
    }
}
