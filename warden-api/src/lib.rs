//! warden-api: Shared types for the warden sandbox host
//!
//! This crate defines the contract between the host, the sandboxed guest
//! modules, and remote callers that invoke guest exports. Serialized calls use
//! MessagePack; code identity uses BLAKE3.

use serde::{Deserialize, Serialize};
use std::fmt;

/// API version for compatibility checking
pub const API_VERSION: u32 = 1;

/// Import namespace under which every host capability is exposed to guests
pub const HOST_MODULE: &str = "host";

/// Handle that always refers to `undefined`
pub const HANDLE_UNDEFINED: i32 = 0;

/// Status returned by `try_*` imports when authorization was refused
pub const STATUS_DENIED: i32 = -1;

/// Status returned by `try_*` imports for any other host error
pub const STATUS_ERROR: i32 = -2;

/// Separator between code hash and resource key in trust decision keys
pub const DECISION_KEY_SEPARATOR: &str = "::";

/// Linear memory export used for strings and serialized calls
pub const EXPORT_MEMORY: &str = "memory";

/// `(len: i32) -> ptr: i32`; its presence selects the serialized convention
pub const EXPORT_ALLOC: &str = "alloc";

/// `(ptr: i32, len: i32)`; optional, called after a serialized call
pub const EXPORT_DEALLOC: &str = "dealloc";

/// Top-level code run once after instantiation
pub const EXPORT_INITIALIZE: &str = "_initialize";

/// Exports that remote callers can never invoke
pub const RESERVED_EXPORTS: &[&str] = &[EXPORT_MEMORY, EXPORT_ALLOC, EXPORT_DEALLOC, EXPORT_INITIALIZE];

/// Prefix of channel handles returned by registration
pub const CHANNEL_PREFIX: &str = "native:";

/// Type tags reported by the `host.kind` import
pub mod kind {
    pub const UNDEFINED: i32 = 0;
    pub const NULL: i32 = 1;
    pub const BOOL: i32 = 2;
    pub const NUMBER: i32 = 3;
    pub const STRING: i32 = 4;
    pub const BYTES: i32 = 5;
    pub const ARRAY: i32 = 6;
    pub const OBJECT: i32 = 7;
    pub const FUNCTION: i32 = 8;
}

/// Error classes reported by the `host.error_kind` import
pub mod error_kind {
    pub const NONE: i32 = 0;
    pub const ACCESS_DENIED: i32 = 1;
    pub const OTHER: i32 = 2;
}

/// Content hash identifying one exact version of a code unit's source text
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodeHash(String);

impl CodeHash {
    /// Hash the given source text
    pub fn of(source: &str) -> Self {
        Self(blake3::hash(source.as_bytes()).to_hex().to_string())
    }

    /// Hex digest
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key under which a trust decision for `resource_key` is persisted
    pub fn decision_key(&self, resource_key: &str) -> String {
        format!("{}{}{}", self.0, DECISION_KEY_SEPARATOR, resource_key)
    }
}

impl fmt::Display for CodeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pack a guest pointer and length into one i64: `(ptr << 32) | len`
#[inline]
pub fn pack_ptr_len(ptr: i32, len: i32) -> i64 {
    ((ptr as i64) << 32) | (len as i64 & 0xFFFF_FFFF)
}

/// Unpack ptr and len from a packed i64
#[inline]
pub fn unpack_ptr_len(packed: i64) -> (i32, i32) {
    let ptr = (packed >> 32) as i32;
    let len = (packed & 0xFFFF_FFFF) as i32;
    (ptr, len)
}

/// Error class surfaced to remote callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The user (or the fail-closed default) refused a capability
    AccessDenied,
    /// The requested export does not exist on the unit
    ExportNotFound,
    /// The export itself threw
    ExportFailed,
    /// The unit ran past its time budget
    ExecutionTimeout,
    /// No unit is registered under the channel
    UnknownChannel,
    /// Arguments could not be converted for the export's signature
    InvalidArguments,
    /// The unit failed to load
    LoadFailed,
}

/// Error returned to a remote invoker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredError {
    /// Error class
    pub kind: ErrorKind,

    /// Original error message
    pub message: String,

    /// Attribution tag, e.g. `[native] (my-plugin).readConfig`
    #[serde(default)]
    pub cause: Option<String>,

    /// Guest stack at the point of failure, if one was captured
    #[serde(default)]
    pub stack: Option<String>,
}

impl StructuredError {
    /// Create an error without attribution
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
            stack: None,
        }
    }

    /// Attach the attribution tag for a unit export
    pub fn attributed(mut self, unit: &str, export: &str) -> Self {
        self.cause = Some(attribution(unit, export));
        self
    }

    /// Attach a captured stack
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl fmt::Display for StructuredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{} (cause: {})", self.message, cause),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for StructuredError {}

/// Attribution tag attached to errors thrown from a unit's export
pub fn attribution(unit: &str, export: &str) -> String {
    format!("[native] ({}).{}", unit, export)
}

/// Result of a remote invocation
pub type InvokeResult = Result<serde_json::Value, StructuredError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_hash_is_content_addressed() {
        let a = CodeHash::of("(module)");
        let b = CodeHash::of("(module)");
        let c = CodeHash::of("(module )");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_decision_key() {
        let hash = CodeHash::of("x");
        let key = hash.decision_key("fs");
        assert!(key.starts_with(hash.as_str()));
        assert!(key.ends_with("::fs"));
    }

    #[test]
    fn test_pack_unpack() {
        let packed = pack_ptr_len(0x1234_5678, 0x100);
        assert_eq!(unpack_ptr_len(packed), (0x1234_5678, 0x100));
    }

    #[test]
    fn test_structured_error_serialization() {
        let err = StructuredError::new(ErrorKind::AccessDenied, "Access denied")
            .attributed("reader", "load");

        let bytes = rmp_serde::to_vec(&err).unwrap();
        let decoded: StructuredError = rmp_serde::from_slice(&bytes).unwrap();

        assert_eq!(decoded.kind, ErrorKind::AccessDenied);
        assert_eq!(decoded.cause.as_deref(), Some("[native] (reader).load"));
        assert!(decoded.to_string().contains("[native] (reader).load"));
    }
}
