//! File objects for path-shaped resource keys

use std::path::PathBuf;

use crate::value::{HostError, HostResult, NativeObject, Value};

/// Native state of a `File` object
#[derive(Debug, Clone)]
pub struct FileState {
    pub path: PathBuf,
}

pub(super) fn open(path: PathBuf) -> Value {
    let display = path.to_string_lossy().into_owned();
    NativeObject::with_state("File", FileState { path })
        .frozen("path", display)
        .method("read", |file, _args| {
            Ok(Value::String(std::fs::read_to_string(&state(file)?.path)?))
        })
        .method("readBytes", |file, _args| {
            Ok(Value::Bytes(std::fs::read(&state(file)?.path)?))
        })
        .method("exists", |file, _args| {
            Ok(Value::Bool(state(file)?.path.exists()))
        })
        .sealed()
        .build()
        .into()
}

fn state(file: &NativeObject) -> HostResult<&FileState> {
    file.state::<FileState>()
        .ok_or_else(|| HostError::type_error("File object without native state"))
}
