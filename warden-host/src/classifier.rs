//! Capability classification
//!
//! Maps a requested resource identifier to a danger category, or to nothing
//! at all (unrestricted). The mapping is data: a [`DangerTable`] that ships
//! with a builtin set of rules and can be extended from JSON without touching
//! the broker.
//!
//! Anything the table does not know about is unrestricted. Only keys known
//! to be dangerous are gated.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Current danger table format version
pub const TABLE_VERSION: u32 = 1;

/// Errors that can occur while loading a danger table
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("Failed to read danger table: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse danger table: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Unsupported danger table version {0} (expected {TABLE_VERSION})")]
    UnsupportedVersion(u32),
}

/// Kind of harm a capability can cause
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DangerCategory {
    Execution,
    Filesystem,
    Internals,
    Environment,
    Network,
}

impl DangerCategory {
    pub const ALL: [DangerCategory; 5] = [
        Self::Execution,
        Self::Filesystem,
        Self::Internals,
        Self::Environment,
        Self::Network,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Execution => "Execution",
            Self::Filesystem => "Filesystem",
            Self::Internals => "Internals",
            Self::Environment => "Environment",
            Self::Network => "Network",
        }
    }

    /// Human-readable description shown in consent prompts
    pub fn description(&self) -> &'static str {
        match self {
            Self::Execution => {
                "Execute external system commands & run background processes unrestricted with full system level access"
            }
            Self::Filesystem => "Full read/write/delete access to your filesystem for all files",
            Self::Internals => {
                "Modify the engine, access internal debugging tools, or dynamically execute unverified code"
            }
            Self::Environment => {
                "Access sensitive system info (OS users, ENV variables), control the current process, or manage application windows"
            }
            Self::Network => "Open network connections and listen for incoming traffic",
        }
    }
}

impl fmt::Display for DangerCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One entry of the danger table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DangerRule {
    pub category: DangerCategory,

    /// Overrides the category description in prompts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Short phrase naming what is being accessed, e.g. "your FILESYSTEM"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    /// Authorize when the module is first resolved instead of at first call
    #[serde(default)]
    pub authorize_on_load: bool,
}

impl DangerRule {
    pub fn new(category: DangerCategory) -> Self {
        Self {
            category,
            description: None,
            alias: None,
            authorize_on_load: false,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn on_load(mut self) -> Self {
        self.authorize_on_load = true;
        self
    }
}

/// A classified access to a dangerous resource
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRequest {
    /// Normalized resource key
    pub resource_key: String,
    pub category: DangerCategory,
    pub description: String,
    pub alias: String,
    pub authorize_on_load: bool,
}

impl ResourceRequest {
    pub fn new(resource_key: impl Into<String>, category: DangerCategory) -> Self {
        let resource_key = resource_key.into();
        Self {
            alias: resource_key.clone(),
            resource_key,
            category,
            description: category.description().to_string(),
            authorize_on_load: false,
        }
    }
}

fn default_version() -> u32 {
    TABLE_VERSION
}

fn default_prefixes() -> Vec<String> {
    vec!["node:".to_string()]
}

/// Versionable mapping of resource identifiers to danger rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DangerTable {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub rules: BTreeMap<String, DangerRule>,

    /// Keys that are never classified, even if they look like paths
    #[serde(default)]
    pub exempt: BTreeSet<String>,

    /// Runtime namespace prefixes stripped before lookup
    #[serde(default = "default_prefixes")]
    pub prefixes: Vec<String>,
}

impl Default for DangerTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl DangerTable {
    /// Table with no rules at all
    pub fn empty() -> Self {
        Self {
            version: TABLE_VERSION,
            rules: BTreeMap::new(),
            exempt: BTreeSet::new(),
            prefixes: default_prefixes(),
        }
    }

    /// Builtin rules for the stock host modules and well-known runtime internals
    pub fn builtin() -> Self {
        use DangerCategory::*;

        const EXECUTE: &str = "EXECUTE code on your system";
        const SYSTEM: &str = "your SYSTEM";
        const NETWORK: &str = "your NETWORK";

        // Everything but the filesystem is authorized when it is loaded
        let mut table = Self::empty();
        for key in ["child_process", "worker_threads", "cluster"] {
            table
                .rules
                .insert(key.into(), DangerRule::new(Execution).alias(EXECUTE).on_load());
        }
        table
            .rules
            .insert("process".into(), DangerRule::new(Execution).alias(SYSTEM).on_load());
        for key in ["wasi", "WebAssembly", "repl", "ffi", "ffi-napi", "ref-napi"] {
            table.rules.insert(
                key.into(),
                DangerRule::new(Execution)
                    .describe(
                        "Dynamically load & execute unverified code, Execute external system commands & run background processes with full system level access",
                    )
                    .alias(EXECUTE)
                    .on_load(),
            );
        }
        for key in ["vm", "v8", "module"] {
            table.rules.insert(
                key.into(),
                DangerRule::new(Internals).alias(SYSTEM).on_load(),
            );
        }
        table
            .rules
            .insert("inspector".into(), DangerRule::new(Internals).alias(NETWORK).on_load());
        for key in ["diagnostics_channel", "trace_events", "async_hooks", "domain"] {
            table.rules.insert(key.into(), DangerRule::new(Internals).on_load());
        }
        table.rules.insert(
            "DebugProcess".into(),
            DangerRule::new(Internals)
                .describe("Debug the main process, gives full system access!")
                .alias("DEBUG the main process"),
        );
        for key in ["fs", "fs/promises"] {
            table
                .rules
                .insert(key.into(), DangerRule::new(Filesystem).alias("your FILESYSTEM"));
        }
        for key in ["os", "electron"] {
            table
                .rules
                .insert(key.into(), DangerRule::new(Environment).alias(SYSTEM).on_load());
        }
        table.rules.insert(
            "clipboard".into(),
            DangerRule::new(Environment).alias("your CLIPBOARD").on_load(),
        );
        for key in ["net", "http", "https", "dgram", "tls", "http2"] {
            table
                .rules
                .insert(key.into(), DangerRule::new(Network).alias(NETWORK).on_load());
        }
        table.exempt.insert("./app/package.json".into());
        table
    }

    /// Parse a table from JSON
    pub fn from_json(json: &str) -> Result<Self, ClassifierError> {
        let table: Self = serde_json::from_str(json)?;
        if table.version != TABLE_VERSION {
            return Err(ClassifierError::UnsupportedVersion(table.version));
        }
        Ok(table)
    }

    /// Load a table from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ClassifierError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn with_rule(mut self, key: impl Into<String>, rule: DangerRule) -> Self {
        self.rules.insert(key.into(), rule);
        self
    }

    pub fn with_exempt(mut self, key: impl Into<String>) -> Self {
        self.exempt.insert(key.into());
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        if !self.prefixes.contains(&prefix) {
            self.prefixes.push(prefix);
        }
        self
    }

    /// Merge another table into this one; its rules win on conflict
    pub fn merge(&mut self, other: DangerTable) {
        self.rules.extend(other.rules);
        self.exempt.extend(other.exempt);
        for prefix in other.prefixes {
            if !self.prefixes.contains(&prefix) {
                self.prefixes.push(prefix);
            }
        }
    }

    pub fn rule(&self, key: &str) -> Option<&DangerRule> {
        self.rules.get(key)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Maps resource keys to danger categories
#[derive(Debug, Clone, Default)]
pub struct CapabilityClassifier {
    table: DangerTable,
}

impl CapabilityClassifier {
    pub fn new(table: DangerTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &DangerTable {
        &self.table
    }

    /// Strip the first matching runtime namespace prefix
    pub fn normalize<'a>(&self, key: &'a str) -> &'a str {
        self.table
            .prefixes
            .iter()
            .find_map(|prefix| key.strip_prefix(prefix.as_str()))
            .unwrap_or(key)
    }

    /// Classify a resource key
    ///
    /// Returns `None` for unrestricted keys.
    pub fn classify(&self, key: &str) -> Option<ResourceRequest> {
        let key = self.normalize(key);
        if self.table.exempt.contains(key) {
            return None;
        }

        if let Some(rule) = self.table.rule(key) {
            return Some(ResourceRequest {
                resource_key: key.to_string(),
                category: rule.category,
                description: rule
                    .description
                    .clone()
                    .unwrap_or_else(|| rule.category.description().to_string()),
                alias: rule.alias.clone().unwrap_or_else(|| key.to_string()),
                authorize_on_load: rule.authorize_on_load,
            });
        }

        if is_path_key(key) {
            let mut request = ResourceRequest::new(key, DangerCategory::Filesystem);
            request.alias = "your FILESYSTEM".to_string();
            return Some(request);
        }

        None
    }
}

/// Relative path, file URL, drive letter or absolute path
pub fn is_path_key(key: &str) -> bool {
    if key.starts_with('.') || key.starts_with("file://") {
        return true;
    }
    let mut chars = key.chars();
    match (chars.next(), chars.next()) {
        (Some('/' | '\\'), _) => true,
        (Some(c), Some(':')) => c.is_ascii_alphabetic(),
        _ => false,
    }
}
