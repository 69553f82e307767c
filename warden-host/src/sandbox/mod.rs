//! Wasm execution of code units
//!
//! A code unit is WebAssembly (binary or text format) that talks to the
//! host only through the `host` imports in [`abi`]. There is no WASI: a unit
//! importing anything else fails to instantiate.

mod abi;
mod context;
mod error;
mod globals;
mod handles;

pub use context::{BudgetExceeded, LoadedUnit, SandboxExecutionContext, UnitState};
pub use error::SandboxError;
pub use globals::{display_value, GlobalScope, GuestLevel};
pub use handles::HandleTable;

use std::path::{Path, PathBuf};
use warden_api::CodeHash;

/// Source of one unit plus its identity
#[derive(Debug, Clone)]
pub struct CodeUnit {
    /// Caller-chosen identifier, used for logs, prompts and attribution
    pub id: String,

    pub source: String,

    /// BLAKE3 of `source`; trust decisions are keyed on it
    pub code_hash: CodeHash,

    /// File the source was read from, if any
    pub origin: Option<PathBuf>,
}

impl CodeUnit {
    pub fn new(id: impl Into<String>, source: impl Into<String>) -> Self {
        let source = source.into();
        Self {
            id: id.into(),
            code_hash: CodeHash::of(&source),
            source,
            origin: None,
        }
    }

    /// Read a unit from disk; the id is the file stem
    pub fn from_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        let id = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self::new(id, source).with_origin(path))
    }

    pub fn with_origin(mut self, path: impl Into<PathBuf>) -> Self {
        self.origin = Some(path.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_unit_hash_follows_source() {
        let a = CodeUnit::new("a", "(module)");
        let b = CodeUnit::new("b", "(module)");
        assert_eq!(a.code_hash, b.code_hash);
        assert_ne!(a.code_hash, CodeUnit::new("a", "(module )").code_hash);
    }

    #[test]
    fn test_code_unit_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reader.wat");
        std::fs::write(&path, "(module)").unwrap();

        let unit = CodeUnit::from_file(&path).unwrap();
        assert_eq!(unit.id, "reader");
        assert_eq!(unit.origin.as_deref(), Some(path.as_path()));
        assert_eq!(unit.code_hash, CodeHash::of("(module)"));
    }
}
