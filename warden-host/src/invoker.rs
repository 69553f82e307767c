//! Export invocation for remote callers
//!
//! Two calling conventions are supported, picked per export:
//!
//! - **serialized**: the unit exports `alloc` and the export has the shape
//!   `(ptr: i32, len: i32) -> i64`. Arguments are written into guest memory
//!   as a MessagePack array; the export returns a packed ptr/len pointing at a
//!   MessagePack result. `dealloc`, when exported, is called on both buffers.
//! - **numeric**: everything else. JSON numbers and booleans map onto the
//!   export's parameter types; zero results give `null`, one gives the value
//!   and several give an array.
//!
//! Anything the export throws comes back attributed to `(unit, export)`.

use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value as Json;
use thiserror::Error;
use warden_api::{
    unpack_ptr_len, CodeHash, ErrorKind, StructuredError, EXPORT_ALLOC, EXPORT_DEALLOC,
    EXPORT_MEMORY, RESERVED_EXPORTS,
};
use wasmtime::{FuncType, Val, ValType};

use crate::sandbox::{LoadedUnit, SandboxError};

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("Export '{export}' not found on '{unit}'")]
    ExportNotFound { unit: String, export: String },

    #[error("Invalid arguments for '{export}': {message}")]
    InvalidArguments {
        unit: String,
        export: String,
        message: String,
    },

    /// The export broke the calling convention (bad pointers, bad payload)
    #[error("Export '{export}' returned an unusable result: {message}")]
    Protocol {
        unit: String,
        export: String,
        message: String,
    },

    #[error("{error}")]
    Thrown {
        unit: String,
        export: String,
        #[source]
        error: SandboxError,
    },
}

impl InvokeError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Thrown { error, .. } if error.is_timeout())
    }

    pub fn is_access_denied(&self) -> bool {
        matches!(self, Self::Thrown { error, .. } if error.is_access_denied())
    }

    /// Attributed form returned to the remote caller
    pub fn to_structured(&self) -> StructuredError {
        match self {
            Self::ExportNotFound { unit, export } => {
                StructuredError::new(ErrorKind::ExportNotFound, self.to_string()).attributed(unit, export)
            }
            Self::InvalidArguments { unit, export, .. } => {
                StructuredError::new(ErrorKind::InvalidArguments, self.to_string()).attributed(unit, export)
            }
            Self::Protocol { unit, export, .. } => {
                StructuredError::new(ErrorKind::ExportFailed, self.to_string()).attributed(unit, export)
            }
            Self::Thrown { unit, export, error } => {
                let mut structured = error.to_structured();
                if structured.kind == ErrorKind::LoadFailed {
                    structured.kind = ErrorKind::ExportFailed;
                }
                structured.attributed(unit, export)
            }
        }
    }
}

/// Invokes the captured exports of one loaded unit
pub struct ExportInvoker {
    unit_id: String,
    code_hash: CodeHash,
    exports: Vec<String>,
    unit: Mutex<LoadedUnit>,
}

impl ExportInvoker {
    pub fn new(unit: LoadedUnit) -> Self {
        Self {
            unit_id: unit.id().to_string(),
            code_hash: unit.code_hash().clone(),
            exports: unit.exports(),
            unit: Mutex::new(unit),
        }
    }

    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    pub fn code_hash(&self) -> &CodeHash {
        &self.code_hash
    }

    pub fn exports(&self) -> &[String] {
        &self.exports
    }

    /// Call `export` with JSON arguments
    ///
    /// Calls into the same unit are serialized; the invoke time budget starts
    /// once the unit is free.
    pub fn invoke(&self, export: &str, args: &[Json]) -> Result<Json, InvokeError> {
        let mut unit = self.unit.lock().unwrap_or_else(|e| e.into_inner());

        let ty = match unit.export_type(export) {
            Some(ty) if !RESERVED_EXPORTS.contains(&export) => ty.clone(),
            _ => {
                return Err(InvokeError::ExportNotFound {
                    unit: self.unit_id.clone(),
                    export: export.to_string(),
                })
            }
        };

        let budget = unit.limits().invoke_timeout;
        tracing::debug!(unit = %self.unit_id, export = %export, args = args.len(), "Invoking export");

        unit.arm(budget).map_err(|error| self.thrown(export, error))?;
        let result = if is_serialized(&mut unit, &ty) {
            self.call_serialized(&mut unit, export, args, budget)
        } else {
            self.call_numeric(&mut unit, export, &ty, args, budget)
        };
        unit.disarm();

        if let Err(error) = &result {
            tracing::warn!(unit = %self.unit_id, export = %export, error = %error, "Export failed");
        }
        result
    }

    /// Abort the unit's signal and drop its handles
    pub fn shutdown(&self) {
        self.unit.lock().unwrap_or_else(|e| e.into_inner()).shutdown();
    }

    fn call_numeric(
        &self,
        unit: &mut LoadedUnit,
        export: &str,
        ty: &FuncType,
        args: &[Json],
        budget: Option<Duration>,
    ) -> Result<Json, InvokeError> {
        if args.len() != ty.params().len() {
            return Err(self.invalid(
                export,
                format!("expected {} arguments, got {}", ty.params().len(), args.len()),
            ));
        }
        let params = ty
            .params()
            .zip(args)
            .enumerate()
            .map(|(i, (param, arg))| {
                to_val(&param, arg)
                    .ok_or_else(|| self.invalid(export, format!("argument {} is not a valid {:?}", i, param)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let instance = unit.instance();
        let store = unit.store_mut();
        let func = instance
            .get_func(&mut *store, export)
            .ok_or_else(|| InvokeError::ExportNotFound {
                unit: self.unit_id.clone(),
                export: export.to_string(),
            })?;

        let mut results = vec![Val::I32(0); ty.results().len()];
        func.call(&mut *store, &params, &mut results)
            .map_err(|e| self.thrown(export, SandboxError::from_call(e, budget.unwrap_or_default())))?;

        Ok(match results.as_slice() {
            [] => Json::Null,
            [single] => from_val(single),
            many => Json::Array(many.iter().map(from_val).collect()),
        })
    }

    fn call_serialized(
        &self,
        unit: &mut LoadedUnit,
        export: &str,
        args: &[Json],
        budget: Option<Duration>,
    ) -> Result<Json, InvokeError> {
        let payload = rmp_serde::to_vec(args).map_err(|e| self.invalid(export, e.to_string()))?;
        let len = i32::try_from(payload.len()).map_err(|_| self.invalid(export, "arguments too large".into()))?;

        let instance = unit.instance();
        let store = unit.store_mut();
        let call_failed = |e: anyhow::Error| self.thrown(export, SandboxError::from_call(e, budget.unwrap_or_default()));

        let memory = instance
            .get_memory(&mut *store, EXPORT_MEMORY)
            .ok_or_else(|| self.protocol(export, "unit does not export its memory".into()))?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut *store, EXPORT_ALLOC)
            .map_err(|e| self.protocol(export, e.to_string()))?;
        let func = instance
            .get_typed_func::<(i32, i32), i64>(&mut *store, export)
            .map_err(|e| self.protocol(export, e.to_string()))?;

        let ptr = alloc.call(&mut *store, len).map_err(call_failed)?;
        if ptr < 0 {
            return Err(self.protocol(export, format!("alloc returned {}", ptr)));
        }
        memory
            .write(&mut *store, ptr as usize, &payload)
            .map_err(|e| self.protocol(export, format!("failed to write arguments: {}", e)))?;

        let packed = func.call(&mut *store, (ptr, len)).map_err(call_failed)?;
        let (result_ptr, result_len) = unpack_ptr_len(packed);
        if result_ptr < 0 || result_len < 0 {
            return Err(self.protocol(export, format!("invalid result ptr={}, len={}", result_ptr, result_len)));
        }

        let mut bytes = vec![0u8; result_len as usize];
        memory
            .read(&*store, result_ptr as usize, &mut bytes)
            .map_err(|_| {
                self.protocol(
                    export,
                    format!("result out of bounds: ptr={}, len={}", result_ptr, result_len),
                )
            })?;

        if let Ok(dealloc) = instance.get_typed_func::<(i32, i32), ()>(&mut *store, EXPORT_DEALLOC) {
            let _ = dealloc.call(&mut *store, (ptr, len));
            if result_len > 0 {
                let _ = dealloc.call(&mut *store, (result_ptr, result_len));
            }
        }

        if bytes.is_empty() {
            return Ok(Json::Null);
        }
        rmp_serde::from_slice(&bytes).map_err(|e| self.protocol(export, e.to_string()))
    }

    fn thrown(&self, export: &str, error: SandboxError) -> InvokeError {
        InvokeError::Thrown {
            unit: self.unit_id.clone(),
            export: export.to_string(),
            error,
        }
    }

    fn invalid(&self, export: &str, message: String) -> InvokeError {
        InvokeError::InvalidArguments {
            unit: self.unit_id.clone(),
            export: export.to_string(),
            message,
        }
    }

    fn protocol(&self, export: &str, message: String) -> InvokeError {
        InvokeError::Protocol {
            unit: self.unit_id.clone(),
            export: export.to_string(),
            message,
        }
    }
}

impl std::fmt::Debug for ExportInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportInvoker")
            .field("unit_id", &self.unit_id)
            .field("code_hash", &self.code_hash)
            .field("exports", &self.exports)
            .finish()
    }
}

fn is_serialized(unit: &mut LoadedUnit, ty: &FuncType) -> bool {
    let shape = ty.params().len() == 2
        && ty.params().all(|p| matches!(p, ValType::I32))
        && ty.results().len() == 1
        && ty.results().all(|r| matches!(r, ValType::I64));
    if !shape {
        return false;
    }
    let instance = unit.instance();
    instance.get_func(unit.store_mut(), EXPORT_ALLOC).is_some()
}

fn to_val(ty: &ValType, arg: &Json) -> Option<Val> {
    let integer = || arg.as_i64().or_else(|| arg.as_bool().map(i64::from));
    let float = || arg.as_f64().or_else(|| arg.as_bool().map(|b| if b { 1.0 } else { 0.0 }));
    match ty {
        ValType::I32 => integer().and_then(|n| i32::try_from(n).ok()).map(Val::I32),
        ValType::I64 => integer().map(Val::I64),
        ValType::F32 => float().map(|x| Val::F32((x as f32).to_bits())),
        ValType::F64 => float().map(|x| Val::F64(x.to_bits())),
        _ => None,
    }
}

fn from_val(val: &Val) -> Json {
    let number = |x: f64| serde_json::Number::from_f64(x).map_or(Json::Null, Json::Number);
    match val {
        Val::I32(n) => Json::from(*n),
        Val::I64(n) => Json::from(*n),
        Val::F32(bits) => number(f32::from_bits(*bits) as f64),
        Val::F64(bits) => number(f64::from_bits(*bits)),
        _ => Json::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::NullAuditSink;
    use crate::config::HostConfig;
    use crate::sandbox::{CodeUnit, SandboxExecutionContext};
    use crate::trust::{ConsentResponse, MemoryTrustStore, RecordingPrompt, TrustBroker};
    use serde_json::json;
    use std::sync::Arc;

    fn load(id: &str, source: &str) -> ExportInvoker {
        let broker = Arc::new(TrustBroker::new(
            Arc::new(MemoryTrustStore::new()),
            Arc::new(RecordingPrompt::new(ConsentResponse::Deny)),
            Arc::new(NullAuditSink),
        ));
        let config = HostConfig::default().with_data_dir(std::env::temp_dir());
        let ctx = SandboxExecutionContext::new(broker, &config).unwrap();
        ExportInvoker::new(ctx.run(&CodeUnit::new(id, source)).unwrap())
    }

    const MATH: &str = r#"(module
        (func (export "add") (param i32 i32) (result i32) local.get 0 local.get 1 i32.add)
        (func (export "half") (param f64) (result f64) local.get 0 f64.const 2 f64.div)
        (func (export "pair") (result i32 i64) i32.const 1 i64.const 2)
        (func (export "nothing")))"#;

    #[test]
    fn test_numeric_convention() {
        let invoker = load("math", MATH);
        assert_eq!(invoker.invoke("add", &[json!(2), json!(3)]).unwrap(), json!(5));
        assert_eq!(invoker.invoke("half", &[json!(5)]).unwrap(), json!(2.5));
        assert_eq!(invoker.invoke("pair", &[]).unwrap(), json!([1, 2]));
        assert_eq!(invoker.invoke("nothing", &[]).unwrap(), Json::Null);
    }

    #[test]
    fn test_invalid_arguments() {
        let invoker = load("math", MATH);
        let err = invoker.invoke("add", &[json!(1)]).unwrap_err();
        assert!(matches!(err, InvokeError::InvalidArguments { .. }));
        let err = invoker.invoke("add", &[json!("x"), json!(1)]).unwrap_err();
        assert_eq!(err.to_structured().kind, ErrorKind::InvalidArguments);
    }

    #[test]
    fn test_missing_and_reserved_exports() {
        let invoker = load(
            "math",
            r#"(module (memory (export "memory") 1) (func (export "_initialize")) (func (export "f")))"#,
        );
        assert_eq!(invoker.exports(), &["f".to_string()]);

        for name in ["nope", "memory", "_initialize"] {
            let err = invoker.invoke(name, &[]).unwrap_err();
            let structured = err.to_structured();
            assert_eq!(structured.kind, ErrorKind::ExportNotFound, "{}", name);
            assert_eq!(structured.cause, Some(format!("[native] (math).{}", name)));
        }
    }

    #[test]
    fn test_serialized_convention() {
        let invoker = load(
            "echo",
            r#"(module
                (memory (export "memory") 1)
                (func (export "alloc") (param i32) (result i32) i32.const 1024)
                (func (export "echo") (param i32 i32) (result i64)
                    (i64.or
                        (i64.shl (i64.extend_i32_u (local.get 0)) (i64.const 32))
                        (i64.extend_i32_u (local.get 1)))))"#,
        );
        let result = invoker.invoke("echo", &[json!("hi"), json!(3), json!({"a": true})]).unwrap();
        assert_eq!(result, json!(["hi", 3, {"a": true}]));
    }

    #[test]
    fn test_thrown_error_is_attributed() {
        let invoker = load(
            "thrower",
            r#"(module
                (import "host" "string" (func $string (param i32 i32) (result i32)))
                (import "host" "throw" (func $throw (param i32)))
                (memory (export "memory") 1)
                (data (i32.const 0) "oops")
                (func (export "boom")
                    (call $throw (call $string (i32.const 0) (i32.const 4)))))"#,
        );
        let err = invoker.invoke("boom", &[]).unwrap_err();
        let structured = err.to_structured();
        assert_eq!(structured.kind, ErrorKind::ExportFailed);
        assert_eq!(structured.message, "oops");
        assert_eq!(structured.cause.as_deref(), Some("[native] (thrower).boom"));
    }
}
