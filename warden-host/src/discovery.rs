//! Code unit discovery
//!
//! Finds unit source files in directories. Scanning only reads files;
//! loading them is the registry's job.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::sandbox::CodeUnit;

/// Errors that can occur during unit discovery
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Directory not found: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("Failed to read directory: {0}")]
    ReadDirectory(#[source] std::io::Error),

    #[error("Failed to read unit {path}: {source}")]
    ReadUnit {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result of a scan
#[derive(Debug, Default)]
pub struct DiscoveryResult {
    /// Units read successfully, ordered by path
    pub units: Vec<CodeUnit>,

    /// Files or directories that could not be read
    pub failures: Vec<(PathBuf, DiscoveryError)>,
}

impl DiscoveryResult {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn total_found(&self) -> usize {
        self.units.len() + self.failures.len()
    }
}

/// Unit directory scanner
#[derive(Debug, Clone)]
pub struct UnitScanner {
    extensions: Vec<String>,
}

impl Default for UnitScanner {
    fn default() -> Self {
        Self {
            extensions: vec!["wat".to_string()],
        }
    }
}

impl UnitScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also pick up files with `extension`
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extensions.push(extension.into());
        self
    }

    pub fn is_unit_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(OsStr::to_str)
            .map(|ext| self.extensions.iter().any(|e| e == ext))
            .unwrap_or(false)
    }

    /// Scan one directory (not recursively)
    pub fn scan_directory(&self, dir: impl AsRef<Path>) -> Result<DiscoveryResult, DiscoveryError> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(DiscoveryError::DirectoryNotFound(dir.to_path_buf()));
        }

        let entries = std::fs::read_dir(dir).map_err(DiscoveryError::ReadDirectory)?;
        let mut result = DiscoveryResult::default();
        let mut paths = Vec::new();

        for entry in entries {
            match entry {
                Ok(entry) => {
                    let path = entry.path();
                    if path.is_file() && self.is_unit_file(&path) {
                        paths.push(path);
                    }
                }
                Err(e) => result
                    .failures
                    .push((dir.to_path_buf(), DiscoveryError::ReadDirectory(e))),
            }
        }
        paths.sort();

        for path in paths {
            match CodeUnit::from_file(&path) {
                Ok(unit) => result.units.push(unit),
                Err(source) => {
                    let error = DiscoveryError::ReadUnit {
                        path: path.clone(),
                        source,
                    };
                    result.failures.push((path, error));
                }
            }
        }

        tracing::debug!(dir = %dir.display(), units = result.units.len(), "Scanned unit directory");
        Ok(result)
    }

    /// Scan several directories; missing ones are reported as failures
    pub fn scan_directories(&self, dirs: impl IntoIterator<Item = impl AsRef<Path>>) -> DiscoveryResult {
        let mut all = DiscoveryResult::default();
        for dir in dirs {
            let dir = dir.as_ref();
            match self.scan_directory(dir) {
                Ok(result) => {
                    all.units.extend(result.units);
                    all.failures.extend(result.failures);
                }
                Err(e) => all.failures.push((dir.to_path_buf(), e)),
            }
        }
        all
    }
}

/// Default unit directories for the current platform
pub fn default_unit_dirs(app_name: &str) -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    if let Some(data_dir) = dirs::data_local_dir() {
        dirs.push(data_dir.join(app_name).join("units"));
    }
    dirs.push(PathBuf::from("units"));

    dirs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_scan_empty_directory() {
        let temp = TempDir::new().unwrap();
        let result = UnitScanner::new().scan_directory(temp.path()).unwrap();
        assert!(result.units.is_empty());
        assert!(result.is_success());
    }

    #[test]
    fn test_scan_nonexistent_directory() {
        let result = UnitScanner::new().scan_directory("/nonexistent/path/to/units");
        assert!(matches!(result, Err(DiscoveryError::DirectoryNotFound(_))));
    }

    #[test]
    fn test_scan_reads_units_in_order() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("b.wat"), "(module)").unwrap();
        fs::write(temp.path().join("a.wat"), "(module )").unwrap();
        fs::write(temp.path().join("readme.txt"), "hello").unwrap();

        let result = UnitScanner::new().scan_directory(temp.path()).unwrap();
        let ids: Vec<_> = result.units.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(result.units[0].origin.as_deref(), Some(temp.path().join("a.wat").as_path()));
    }

    #[test]
    fn test_extra_extensions() {
        let scanner = UnitScanner::new().with_extension("unit");
        assert!(scanner.is_unit_file(Path::new("x.unit")));
        assert!(scanner.is_unit_file(Path::new("x.wat")));
        assert!(!scanner.is_unit_file(Path::new("x.wasm")));
    }

    #[test]
    fn test_scan_directories_reports_missing() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.wat"), "(module)").unwrap();

        let result = UnitScanner::new().scan_directories([temp.path(), Path::new("/nonexistent/units")]);
        assert_eq!(result.units.len(), 1);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.total_found(), 2);
    }

    #[test]
    fn test_default_unit_dirs() {
        let dirs = default_unit_dirs("myapp");
        assert!(dirs.iter().any(|d| d.ends_with("units")));
    }
}
