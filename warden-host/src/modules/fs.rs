//! `fs` and `fs/promises`
//!
//! Both are synchronous underneath; sandboxed code has no event loop to
//! await on. Relative paths resolve against the resources directory.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use super::{normalize_lexically, ModuleContext};
use crate::value::{bytes_arg, string_arg, HostError, HostResult, NativeObject, Value};

struct FsState {
    base: PathBuf,
}

impl FsState {
    fn resolve(&self, raw: &str) -> PathBuf {
        let raw = raw.strip_prefix("file://").unwrap_or(raw);
        let path = Path::new(raw);
        if path.is_absolute() {
            normalize_lexically(path)
        } else {
            normalize_lexically(&self.base.join(path))
        }
    }
}

fn path_arg(fs: &NativeObject, args: &[Value], function: &str) -> HostResult<PathBuf> {
    let state = fs
        .state::<FsState>()
        .ok_or_else(|| HostError::type_error("fs object without native state"))?;
    Ok(state.resolve(string_arg(args, 0, function)?))
}

/// Options argument as a bare flag or `{ recursive: true }`
fn recursive_flag(args: &[Value]) -> bool {
    match args.get(1) {
        Some(Value::Object(options)) => options.get("recursive").truthy(),
        Some(other) => other.truthy(),
        None => false,
    }
}

fn stats(path: &Path) -> HostResult {
    let metadata = std::fs::metadata(path)?;
    let mtime_ms = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as f64)
        .unwrap_or(0.0);

    Ok(NativeObject::new("Stats")
        .value("size", metadata.len() as f64)
        .value("isFile", metadata.is_file())
        .value("isDirectory", metadata.is_dir())
        .value("isSymbolicLink", metadata.file_type().is_symlink())
        .value("readonly", metadata.permissions().readonly())
        .value("mtimeMs", mtime_ms)
        .build()
        .into())
}

fn constants() -> Value {
    NativeObject::new("Object")
        .frozen("F_OK", 0.0)
        .frozen("R_OK", 4.0)
        .frozen("W_OK", 2.0)
        .frozen("X_OK", 1.0)
        .build()
        .into()
}

pub(super) fn module(brand: &'static str, ctx: &ModuleContext) -> Value {
    let state = FsState {
        base: ctx.resources_dir.clone(),
    };

    NativeObject::with_state(brand, state)
        .method("readFile", |fs, args| {
            let path = path_arg(fs, args, "readFile")?;
            Ok(Value::String(std::fs::read_to_string(path)?))
        })
        .method("readFileBytes", |fs, args| {
            let path = path_arg(fs, args, "readFileBytes")?;
            Ok(Value::Bytes(std::fs::read(path)?))
        })
        .method("writeFile", |fs, args| {
            let path = path_arg(fs, args, "writeFile")?;
            std::fs::write(path, bytes_arg(args, 1, "writeFile")?)?;
            Ok(Value::Undefined)
        })
        .method("appendFile", |fs, args| {
            use std::io::Write;
            let path = path_arg(fs, args, "appendFile")?;
            let data = bytes_arg(args, 1, "appendFile")?;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            file.write_all(&data)?;
            Ok(Value::Undefined)
        })
        .method("exists", |fs, args| {
            Ok(Value::Bool(path_arg(fs, args, "exists")?.exists()))
        })
        .method("readdir", |fs, args| {
            let path = path_arg(fs, args, "readdir")?;
            let mut names = Vec::new();
            for entry in std::fs::read_dir(path)? {
                names.push(entry?.file_name().to_string_lossy().into_owned());
            }
            names.sort();
            Ok(Value::Array(names.into_iter().map(Value::String).collect()))
        })
        .method("mkdir", |fs, args| {
            let path = path_arg(fs, args, "mkdir")?;
            if recursive_flag(args) {
                std::fs::create_dir_all(path)?;
            } else {
                std::fs::create_dir(path)?;
            }
            Ok(Value::Undefined)
        })
        .method("rm", |fs, args| {
            let path = path_arg(fs, args, "rm")?;
            if path.is_dir() {
                if recursive_flag(args) {
                    std::fs::remove_dir_all(path)?;
                } else {
                    std::fs::remove_dir(path)?;
                }
            } else {
                std::fs::remove_file(path)?;
            }
            Ok(Value::Undefined)
        })
        .method("stat", |fs, args| stats(&path_arg(fs, args, "stat")?))
        .frozen("constants", constants())
        .sealed()
        .build()
        .into()
}
