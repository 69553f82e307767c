//! Host imports available to sandboxed code
//!
//! Everything lives in the `host` namespace. Values cross the boundary as
//! handles (see [`HandleTable`](super::handles::HandleTable)); strings and
//! byte buffers are passed as `(ptr, len)` into the unit's exported memory.
//!
//! ```text
//! require(ptr, len) -> h              try_require(ptr, len) -> h | -1 | -2
//! global(ptr, len) -> h
//! get(obj, kptr, klen) -> h           set(obj, kptr, klen, value)
//! call(f, this, argv, argc) -> h      try_call(f, this, argv, argc) -> h | -1 | -2
//! construct(ctor, argv, argc) -> h
//! string(ptr, len) -> h   bytes(ptr, len) -> h   array(argv, argc) -> h
//! number(f64) -> h        bool(i32) -> h         null() -> h
//! as_number(h) -> f64     as_bool(h) -> i32      len(h) -> i32
//! read(h, ptr, cap) -> i32                       kind(h) -> i32
//! same(a, b) -> i32       drop(h)
//! last_error() -> h       error_kind() -> i32    throw(h)
//! log(level, ptr, len)
//! ```
//!
//! `argv` points at `argc` little-endian i32 handles. Trapping imports turn a
//! host error into an uncaught throw; `try_*` imports record it for
//! `last_error` / `error_kind` and return a negative status instead.

use warden_api::{error_kind, EXPORT_MEMORY, HOST_MODULE, STATUS_DENIED, STATUS_ERROR};
use wasmtime::{Caller, Extern, Linker, Memory};

use super::context::UnitState;
use super::globals::{display_value, guest_log, GuestLevel, LOADER_GLOBALS};
use crate::trust::take_consent_wait;
use crate::value::{HostError, HostResult, PropertyKey, Value};

type Ctx<'a> = Caller<'a, UnitState>;

/// Most arguments a single host call accepts
pub(crate) const MAX_ARGS: i32 = 1024;

fn memory(caller: &mut Ctx<'_>) -> HostResult<Memory> {
    match caller.get_export(EXPORT_MEMORY) {
        Some(Extern::Memory(memory)) => Ok(memory),
        _ => Err(HostError::type_error("unit does not export its memory")),
    }
}

fn read_bytes(caller: &mut Ctx<'_>, ptr: i32, len: i32) -> HostResult<Vec<u8>> {
    if ptr < 0 || len < 0 {
        return Err(HostError::type_error(format!(
            "invalid guest buffer: ptr={}, len={}",
            ptr, len
        )));
    }
    let memory = memory(caller)?;
    let start = ptr as usize;
    let end = start + len as usize;
    memory
        .data(&*caller)
        .get(start..end)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| HostError::type_error(format!("guest buffer out of bounds: ptr={}, len={}", ptr, len)))
}

fn read_str(caller: &mut Ctx<'_>, ptr: i32, len: i32) -> HostResult<String> {
    String::from_utf8(read_bytes(caller, ptr, len)?)
        .map_err(|_| HostError::type_error("guest string is not valid UTF-8"))
}

fn read_args(caller: &mut Ctx<'_>, argv: i32, argc: i32) -> HostResult<Vec<Value>> {
    if argc == 0 {
        return Ok(Vec::new());
    }
    if argc < 0 || argc > MAX_ARGS {
        return Err(HostError::type_error(format!("invalid argument count: {}", argc)));
    }
    let raw = read_bytes(caller, argv, argc * 4)?;
    raw.chunks_exact(4)
        .map(|chunk| {
            let handle = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            caller.data().handles.get(handle)
        })
        .collect()
}

fn value(caller: &Ctx<'_>, handle: i32) -> HostResult {
    caller.data().handles.get(handle)
}

fn insert(caller: &mut Ctx<'_>, value: Value) -> i32 {
    caller.data_mut().handles.insert(value)
}

/// Give back budget spent waiting for a consent answer
fn settle(caller: &mut Ctx<'_>) {
    let waited = take_consent_wait();
    if waited.is_zero() {
        return;
    }
    if let Some(deadline) = caller.data_mut().deadline.as_mut() {
        *deadline += waited;
    }
}

/// Result of a trapping import
fn throwing<R>(caller: &mut Ctx<'_>, result: HostResult<R>) -> anyhow::Result<R> {
    settle(caller);
    result.map_err(anyhow::Error::new)
}

/// Result of a `try_*` import
fn status(caller: &mut Ctx<'_>, result: HostResult<i32>) -> i32 {
    settle(caller);
    match result {
        Ok(handle) => handle,
        Err(error) => {
            let code = if error.is_access_denied() {
                STATUS_DENIED
            } else {
                STATUS_ERROR
            };
            tracing::debug!(unit = %caller.data().unit_id, error = %error, "Host error caught by unit");
            caller.data_mut().last_error = Some(error);
            code
        }
    }
}

fn require(caller: &mut Ctx<'_>, ptr: i32, len: i32) -> HostResult<i32> {
    let key = read_str(caller, ptr, len)?;
    let loader = caller.data().loader.clone();
    let module = loader.resolve(&key)?;
    Ok(insert(caller, module))
}

fn call(caller: &mut Ctx<'_>, function: i32, this: i32, argv: i32, argc: i32) -> HostResult<i32> {
    let function = value(caller, function)?;
    let this = value(caller, this)?;
    let args = read_args(caller, argv, argc)?;
    let result = match &function {
        Value::Object(f) if f.is_callable() => f.call(&this, &args)?,
        other => {
            return Err(HostError::type_error(format!(
                "{} is not a function",
                other.describe()
            )))
        }
    };
    Ok(insert(caller, result))
}

/// Property read with the primitive conveniences guests rely on
pub(crate) fn get_property(target: &Value, key: &str) -> HostResult {
    let index = key.parse::<usize>().ok();
    Ok(match target {
        Value::Object(object) => object.get(PropertyKey::parse(key)),
        Value::Array(items) => match (key, index) {
            ("length", _) => Value::Number(items.len() as f64),
            (_, Some(i)) => items.get(i).cloned().unwrap_or_default(),
            _ => Value::Undefined,
        },
        Value::Bytes(bytes) => match (key, index) {
            ("length", _) => Value::Number(bytes.len() as f64),
            (_, Some(i)) => bytes.get(i).map(|b| Value::Number(*b as f64)).unwrap_or_default(),
            _ => Value::Undefined,
        },
        Value::String(s) if key == "length" => Value::Number(s.chars().count() as f64),
        Value::Undefined | Value::Null => {
            return Err(HostError::type_error(format!(
                "Cannot read properties of {} (reading '{}')",
                target.describe(),
                key
            )))
        }
        _ => Value::Undefined,
    })
}

/// Register every `host.*` import
pub fn link(linker: &mut Linker<UnitState>) -> anyhow::Result<()> {
    linker.func_wrap(HOST_MODULE, "require", |mut caller: Ctx<'_>, ptr: i32, len: i32| {
        let result = require(&mut caller, ptr, len);
        throwing(&mut caller, result)
    })?;

    linker.func_wrap(HOST_MODULE, "try_require", |mut caller: Ctx<'_>, ptr: i32, len: i32| {
        let result = require(&mut caller, ptr, len);
        status(&mut caller, result)
    })?;

    linker.func_wrap(HOST_MODULE, "global", |mut caller: Ctx<'_>, ptr: i32, len: i32| {
        let result = read_str(&mut caller, ptr, len).and_then(|name| {
            if LOADER_GLOBALS.contains(&name.as_str()) {
                let loader = caller.data().loader.clone();
                loader.resolve(&name)
            } else {
                Ok(caller.data().globals.get(&name).unwrap_or_default())
            }
        });
        let result = result.map(|global| insert(&mut caller, global));
        throwing(&mut caller, result)
    })?;

    linker.func_wrap(
        HOST_MODULE,
        "get",
        |mut caller: Ctx<'_>, object: i32, ptr: i32, len: i32| {
            let result: HostResult<i32> = (|| {
                let target = value(&caller, object)?;
                let key = read_str(&mut caller, ptr, len)?;
                let property = get_property(&target, &key)?;
                Ok(insert(&mut caller, property))
            })();
            throwing(&mut caller, result)
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "set",
        |mut caller: Ctx<'_>, object: i32, ptr: i32, len: i32, new_value: i32| {
            let result: HostResult<()> = (|| {
                let target = value(&caller, object)?;
                let key = read_str(&mut caller, ptr, len)?;
                let new_value = value(&caller, new_value)?;
                match target {
                    Value::Object(target) => target.set(&PropertyKey::parse(&key), new_value),
                    other => Err(HostError::type_error(format!(
                        "Cannot set property '{}' on {}",
                        key,
                        other.describe()
                    ))),
                }
            })();
            throwing(&mut caller, result)
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "call",
        |mut caller: Ctx<'_>, function: i32, this: i32, argv: i32, argc: i32| {
            let result = call(&mut caller, function, this, argv, argc);
            throwing(&mut caller, result)
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "try_call",
        |mut caller: Ctx<'_>, function: i32, this: i32, argv: i32, argc: i32| {
            let result = call(&mut caller, function, this, argv, argc);
            status(&mut caller, result)
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "construct",
        |mut caller: Ctx<'_>, ctor: i32, argv: i32, argc: i32| {
            let result: HostResult<i32> = (|| {
                let ctor = value(&caller, ctor)?;
                let args = read_args(&mut caller, argv, argc)?;
                let instance = match &ctor {
                    Value::Object(c) => c.construct(&args)?,
                    other => {
                        return Err(HostError::type_error(format!(
                            "{} is not a constructor",
                            other.describe()
                        )))
                    }
                };
                Ok(insert(&mut caller, instance))
            })();
            throwing(&mut caller, result)
        },
    )?;

    linker.func_wrap(HOST_MODULE, "string", |mut caller: Ctx<'_>, ptr: i32, len: i32| {
        let result = read_str(&mut caller, ptr, len).map(|s| insert(&mut caller, Value::String(s)));
        throwing(&mut caller, result)
    })?;

    linker.func_wrap(HOST_MODULE, "bytes", |mut caller: Ctx<'_>, ptr: i32, len: i32| {
        let result = read_bytes(&mut caller, ptr, len).map(|b| insert(&mut caller, Value::Bytes(b)));
        throwing(&mut caller, result)
    })?;

    linker.func_wrap(HOST_MODULE, "array", |mut caller: Ctx<'_>, argv: i32, argc: i32| {
        let result = read_args(&mut caller, argv, argc).map(|items| insert(&mut caller, Value::Array(items)));
        throwing(&mut caller, result)
    })?;

    linker.func_wrap(HOST_MODULE, "number", |mut caller: Ctx<'_>, n: f64| {
        insert(&mut caller, Value::Number(n))
    })?;

    linker.func_wrap(HOST_MODULE, "bool", |mut caller: Ctx<'_>, b: i32| {
        insert(&mut caller, Value::Bool(b != 0))
    })?;

    linker.func_wrap(HOST_MODULE, "null", |mut caller: Ctx<'_>| insert(&mut caller, Value::Null))?;

    linker.func_wrap(HOST_MODULE, "as_number", |caller: Ctx<'_>, handle: i32| {
        let n = match value(&caller, handle).map_err(anyhow::Error::new)? {
            Value::Number(n) => n,
            Value::Bool(b) => b as i32 as f64,
            Value::Null => 0.0,
            Value::String(s) => s.trim().parse().unwrap_or(f64::NAN),
            _ => f64::NAN,
        };
        anyhow::Ok(n)
    })?;

    linker.func_wrap(HOST_MODULE, "as_bool", |caller: Ctx<'_>, handle: i32| {
        let v = value(&caller, handle).map_err(anyhow::Error::new)?;
        anyhow::Ok(v.truthy() as i32)
    })?;

    linker.func_wrap(HOST_MODULE, "len", |caller: Ctx<'_>, handle: i32| {
        let len = match value(&caller, handle).map_err(anyhow::Error::new)? {
            Value::String(s) => s.len() as i32,
            Value::Bytes(b) => b.len() as i32,
            Value::Array(items) => items.len() as i32,
            _ => -1,
        };
        anyhow::Ok(len)
    })?;

    linker.func_wrap(
        HOST_MODULE,
        "read",
        |mut caller: Ctx<'_>, handle: i32, ptr: i32, cap: i32| {
            let result: HostResult<i32> = (|| {
                let data = match value(&caller, handle)? {
                    Value::String(s) => s.into_bytes(),
                    Value::Bytes(b) => b,
                    other => {
                        return Err(HostError::type_error(format!(
                            "cannot read {} into guest memory",
                            other.describe()
                        )))
                    }
                };
                if ptr < 0 || cap < 0 {
                    return Err(HostError::type_error("invalid guest buffer"));
                }
                let n = data.len().min(cap as usize);
                let memory = memory(&mut caller)?;
                memory
                    .write(&mut caller, ptr as usize, &data[..n])
                    .map_err(|_| HostError::type_error("guest buffer out of bounds"))?;
                Ok(n as i32)
            })();
            throwing(&mut caller, result)
        },
    )?;

    linker.func_wrap(HOST_MODULE, "same", |caller: Ctx<'_>, a: i32, b: i32| {
        let a = value(&caller, a).map_err(anyhow::Error::new)?;
        let b = value(&caller, b).map_err(anyhow::Error::new)?;
        anyhow::Ok(a.same(&b) as i32)
    })?;

    linker.func_wrap(HOST_MODULE, "kind", |caller: Ctx<'_>, handle: i32| {
        let v = value(&caller, handle).map_err(anyhow::Error::new)?;
        anyhow::Ok(v.kind())
    })?;

    linker.func_wrap(HOST_MODULE, "drop", |mut caller: Ctx<'_>, handle: i32| {
        caller.data_mut().handles.release(handle);
    })?;

    linker.func_wrap(HOST_MODULE, "last_error", |mut caller: Ctx<'_>| {
        match caller.data().last_error.as_ref().map(|e| e.to_string()) {
            Some(message) => insert(&mut caller, Value::String(message)),
            None => warden_api::HANDLE_UNDEFINED,
        }
    })?;

    linker.func_wrap(HOST_MODULE, "error_kind", |caller: Ctx<'_>| {
        match &caller.data().last_error {
            None => error_kind::NONE,
            Some(e) if e.is_access_denied() => error_kind::ACCESS_DENIED,
            Some(_) => error_kind::OTHER,
        }
    })?;

    linker.func_wrap(HOST_MODULE, "throw", |mut caller: Ctx<'_>, handle: i32| {
        let error = if handle == warden_api::HANDLE_UNDEFINED {
            caller
                .data_mut()
                .last_error
                .take()
                .unwrap_or_else(|| HostError::failed("undefined"))
        } else {
            match value(&caller, handle) {
                Ok(thrown) => HostError::failed(display_value(&thrown)),
                Err(e) => e,
            }
        };
        Err::<(), _>(anyhow::Error::new(error))
    })?;

    linker.func_wrap(
        HOST_MODULE,
        "log",
        |mut caller: Ctx<'_>, level: i32, ptr: i32, len: i32| {
            let message = read_str(&mut caller, ptr, len).map_err(anyhow::Error::new)?;
            guest_log(&caller.data().unit_id, GuestLevel::from_i32(level), &message);
            anyhow::Ok(())
        },
    )?;

    Ok(())
}
