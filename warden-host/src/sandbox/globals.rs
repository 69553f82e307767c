//! Curated global scope of a sandboxed unit
//!
//! Only what is listed here exists for sandboxed code besides the loader:
//!
//! | Global      | Contents                                                   |
//! |-------------|------------------------------------------------------------|
//! | `console`   | log shim tagging every line with the unit id               |
//! | `process`   | platform metadata, allow-listed env, write-only streams    |
//! | `timers`    | `now`, bounded `sleep`                                     |
//! | `text`      | UTF-8 `encode` / `decode` / `byteLength`                   |
//! | `abort`     | the unit's own signal plus a `controller()` factory        |
//! | `crypto`    | random bytes, UUIDs, blake3 / sha256 digests               |
//! | `require`   | `resolve` only; loading goes through the loader            |
//!
//! `WebAssembly` is a global too, but it is resolved through the loader so it
//! gets classified like any other module.

use std::collections::BTreeMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::classifier::{DangerCategory, ResourceRequest};
use crate::loader::{resolve_name, InterceptingLoader};
use crate::modules::{arch, platform};
use crate::value::{
    bytes_arg, number_arg, string_arg, HostError, HostResult, NativeFunction, NativeObject,
    ObjectRef, PropertyKey, Value,
};

/// Globals that are resolved through the loader on every lookup
pub const LOADER_GLOBALS: &[&str] = &["WebAssembly"];

/// Longest single `timers.sleep`
pub const MAX_SLEEP: Duration = Duration::from_secs(1);

/// Largest `crypto.randomBytes` request
pub const MAX_RANDOM_BYTES: usize = 64 * 1024;

/// Log severity used by the console shim and the `log` import
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl GuestLevel {
    pub fn from_i32(level: i32) -> Self {
        match level {
            i32::MIN..=0 => Self::Debug,
            1 => Self::Info,
            2 => Self::Warn,
            _ => Self::Error,
        }
    }
}

/// Forward one guest log line to the host log
pub fn guest_log(unit: &str, level: GuestLevel, message: &str) {
    match level {
        GuestLevel::Debug => tracing::debug!(target: "warden::guest", unit = %unit, "{}", message),
        GuestLevel::Info => tracing::info!(target: "warden::guest", unit = %unit, "{}", message),
        GuestLevel::Warn => tracing::warn!(target: "warden::guest", unit = %unit, "{}", message),
        GuestLevel::Error => tracing::error!(target: "warden::guest", unit = %unit, "{}", message),
    }
}

/// Console rendering of a value
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
        Value::Object(o) if o.is_callable() => format!("[Function: {}]", o.get("name").as_str().unwrap_or("anonymous")),
        Value::Object(_) | Value::Array(_) => value.to_json().to_string(),
        other => other.describe(),
    }
}

fn join_args(args: &[Value]) -> String {
    args.iter().map(display_value).collect::<Vec<_>>().join(" ")
}

/// The unit's global scope
pub struct GlobalScope {
    values: BTreeMap<&'static str, Value>,
    signal: ObjectRef,
}

impl GlobalScope {
    /// Build the scope for the unit behind `loader`
    ///
    /// `env` is the already-expanded allow-list.
    pub fn build(loader: &InterceptingLoader, env: &[(String, String)]) -> Self {
        let unit = loader.proxy().unit_id().to_string();
        let signal = abort_signal();

        let mut values = BTreeMap::new();
        values.insert("console", console(&unit));
        values.insert("process", process(loader, env));
        values.insert("timers", timers());
        values.insert("text", text());
        values.insert("abort", abort(signal.clone()));
        values.insert("crypto", crypto());
        values.insert("require", require(loader));

        Self { values, signal }
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.values.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.values.keys().copied().chain(LOADER_GLOBALS.iter().copied())
    }

    /// Signal the unit's abort signal
    pub fn abort(&self) {
        let _ = self.signal.set(&PropertyKey::from("aborted"), Value::Bool(true));
    }

    pub fn is_aborted(&self) -> bool {
        self.signal.get("aborted").truthy()
    }
}

impl std::fmt::Debug for GlobalScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

fn console(unit: &str) -> Value {
    let mut console = NativeObject::new("Console");
    for (name, level) in [
        ("log", GuestLevel::Info),
        ("info", GuestLevel::Info),
        ("debug", GuestLevel::Debug),
        ("warn", GuestLevel::Warn),
        ("error", GuestLevel::Error),
    ] {
        let unit = unit.to_string();
        console = console.function(name, move |args| {
            guest_log(&unit, level, &join_args(args));
            Ok(Value::Undefined)
        });
    }
    console.build().into()
}

fn inert(object: NativeObject) -> NativeObject {
    // no event delivery: sandboxed code must not observe host I/O
    ["on", "once", "emit", "removeListener", "setMaxListeners"]
        .into_iter()
        .fold(object, |object, name| object.function(name, |_| Ok(Value::Undefined)))
}

fn output_stream(unit: &str, name: &'static str, fd: f64) -> Value {
    let unit = unit.to_string();
    let stream = NativeObject::new("WriteStream")
        .frozen("fd", fd)
        .frozen("isTTY", false)
        .function("write", move |args| {
            let chunk = match args.first() {
                Some(Value::Bytes(bytes)) => String::from_utf8_lossy(bytes).into_owned(),
                Some(other) => display_value(other),
                None => String::new(),
            };
            let level = if name == "stderr" {
                GuestLevel::Warn
            } else {
                GuestLevel::Info
            };
            guest_log(&unit, level, chunk.trim_end_matches('\n'));
            Ok(Value::Bool(true))
        });
    inert(stream).build().into()
}

fn input_stream() -> Value {
    inert(
        NativeObject::new("ReadStream")
            .frozen("fd", 0.0)
            .frozen("isTTY", false),
    )
    .build()
    .into()
}

fn process(loader: &InterceptingLoader, env: &[(String, String)]) -> Value {
    let unit = loader.proxy().unit_id().to_string();

    let mut env_object = NativeObject::new("Object");
    for (key, value) in env {
        env_object = env_object.value(key.as_str(), value.as_str());
    }

    let versions = NativeObject::new("Object")
        .frozen("warden", env!("CARGO_PKG_VERSION"))
        .build();

    // Debugging the host gives full access, so the hook is gated like a module
    let request = loader
        .classifier()
        .classify("DebugProcess")
        .unwrap_or_else(|| ResourceRequest::new("DebugProcess", DangerCategory::Internals));
    let debug_unit = unit.clone();
    let debug_process = NativeFunction::new("debugProcess", move |_this, _args| {
        tracing::warn!(unit = %debug_unit, "Debugger attach requested");
        Ok(Value::Undefined)
    })
    .into_ref();
    let debug_process = loader
        .proxy()
        .wrap(debug_process.into(), &request, "process.debugProcess");

    let started = Instant::now();
    NativeObject::new("Process")
        .frozen("platform", platform())
        .frozen("arch", arch())
        .frozen("version", format!("v{}", env!("CARGO_PKG_VERSION")))
        .frozen("versions", versions)
        .value("env", env_object.build())
        .value("stdout", output_stream(&unit, "stdout", 1.0))
        .value("stderr", output_stream(&unit, "stderr", 2.0))
        .value("stdin", input_stream())
        .value("debugProcess", debug_process)
        .function("hrtime", move |_| {
            let elapsed = started.elapsed();
            Ok(Value::Array(vec![
                Value::Number(elapsed.as_secs() as f64),
                Value::Number(elapsed.subsec_nanos() as f64),
            ]))
        })
        .build()
        .into()
}

fn timers() -> Value {
    NativeObject::new("Timers")
        .function("now", |_| {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as f64)
                .unwrap_or(0.0);
            Ok(Value::Number(now))
        })
        .function("sleep", |args| {
            let ms = number_arg(args, 0, 0.0).max(0.0);
            let duration = Duration::from_secs_f64(ms / 1000.0).min(MAX_SLEEP);
            std::thread::sleep(duration);
            Ok(Value::Undefined)
        })
        .build()
        .into()
}

fn text() -> Value {
    NativeObject::new("Text")
        .function("encode", |args| {
            Ok(Value::Bytes(string_arg(args, 0, "text.encode")?.as_bytes().to_vec()))
        })
        .function("decode", |args| {
            let bytes = bytes_arg(args, 0, "text.decode")?;
            Ok(Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        })
        .function("byteLength", |args| {
            Ok(Value::Number(string_arg(args, 0, "text.byteLength")?.len() as f64))
        })
        .build()
        .into()
}

fn abort_signal() -> ObjectRef {
    NativeObject::new("AbortSignal").value("aborted", false).build()
}

fn abort(signal: ObjectRef) -> Value {
    NativeObject::new("Abort")
        .value("signal", signal)
        .function("controller", |_| {
            let signal = abort_signal();
            let target = signal.clone();
            Ok(NativeObject::new("AbortController")
                .value("signal", signal)
                .function("abort", move |_| {
                    target.set(&PropertyKey::from("aborted"), Value::Bool(true))?;
                    Ok(Value::Undefined)
                })
                .build()
                .into())
        })
        .build()
        .into()
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn crypto() -> Value {
    NativeObject::new("Crypto")
        .function("randomBytes", |args| {
            let len = number_arg(args, 0, 0.0);
            if !(0.0..=MAX_RANDOM_BYTES as f64).contains(&len) {
                return Err(HostError::type_error(format!(
                    "crypto.randomBytes: size must be between 0 and {}",
                    MAX_RANDOM_BYTES
                )));
            }
            let mut bytes = vec![0u8; len as usize];
            rand::thread_rng().fill_bytes(&mut bytes);
            Ok(Value::Bytes(bytes))
        })
        .function("randomUUID", |_| Ok(Value::String(uuid::Uuid::new_v4().to_string())))
        .function("digest", |args| {
            let algorithm = string_arg(args, 0, "crypto.digest")?;
            let data = bytes_arg(args, 1, "crypto.digest")?;
            let digest = match algorithm {
                "blake3" => blake3::hash(&data).to_hex().to_string(),
                "sha256" => hex(&Sha256::digest(&data)),
                other => {
                    return Err(HostError::type_error(format!(
                        "crypto.digest: unsupported algorithm '{}'",
                        other
                    )))
                }
            };
            Ok(Value::String(digest))
        })
        .build()
        .into()
}

fn require(loader: &InterceptingLoader) -> Value {
    let classifier = loader.classifier().clone();
    let modules = loader.modules().clone();
    NativeObject::new("Require")
        .function("resolve", move |args| {
            let key = string_arg(args, 0, "require.resolve")?;
            Ok(Value::String(resolve_name(&classifier, &modules, key)?))
        })
        .build()
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::NullAuditSink;
    use crate::classifier::CapabilityClassifier;
    use crate::modules::HostModules;
    use crate::proxy::CapabilityProxy;
    use crate::trust::{ConsentResponse, MemoryTrustStore, RecordingPrompt, TrustBroker};
    use std::sync::Arc;
    use warden_api::CodeHash;

    fn scope_with(response: ConsentResponse) -> (GlobalScope, Arc<RecordingPrompt>, InterceptingLoader) {
        let prompt = Arc::new(RecordingPrompt::new(response));
        let broker = Arc::new(TrustBroker::new(
            Arc::new(MemoryTrustStore::new()),
            prompt.clone(),
            Arc::new(NullAuditSink),
        ));
        let loader = InterceptingLoader::new(
            Arc::new(CapabilityClassifier::default()),
            Arc::new(HostModules::builtin(std::env::temp_dir())),
            CapabilityProxy::new("unit", CodeHash::of("src"), broker),
        );
        let env = vec![("MYAPP_MODE".to_string(), "test".to_string())];
        (GlobalScope::build(&loader, &env), prompt, loader)
    }

    fn call(object: &Value, name: &str, args: &[Value]) -> HostResult {
        let f = object.as_object().unwrap().get(name);
        f.as_object().unwrap().call(object, args)
    }

    #[test]
    fn test_process_exposes_only_allowed_env() {
        let (scope, _, _) = scope_with(ConsentResponse::Allow);
        let process = scope.get("process").unwrap();
        let env = process.as_object().unwrap().get("env");
        let env = env.as_object().unwrap();
        assert_eq!(env.get("MYAPP_MODE").as_str(), Some("test"));
        assert_eq!(env.own_keys().len(), 1);
    }

    #[test]
    fn test_streams_are_write_only() {
        let (scope, _, _) = scope_with(ConsentResponse::Allow);
        let process = scope.get("process").unwrap();
        let stdout = process.as_object().unwrap().get("stdout");

        assert!(call(&stdout, "write", &["hello\n".into()]).unwrap().truthy());
        assert!(matches!(call(&stdout, "on", &["data".into()]).unwrap(), Value::Undefined));
        assert_eq!(stdout.as_object().unwrap().get("fd").as_f64(), Some(1.0));

        let stdin = process.as_object().unwrap().get("stdin");
        assert!(stdin.as_object().unwrap().get("write").is_nullish());
    }

    #[test]
    fn test_debug_process_is_gated() {
        let (scope, prompt, loader) = scope_with(ConsentResponse::Deny);
        let process = scope.get("process").unwrap();
        let debug = process.as_object().unwrap().get("debugProcess");
        assert!(loader.proxy().is_gated(debug.as_object().unwrap()));

        let err = debug
            .as_object()
            .unwrap()
            .call(&Value::Undefined, &[])
            .unwrap_err();
        assert!(err.is_access_denied());
        assert_eq!(prompt.prompts()[0].resource_key, "DebugProcess");
    }

    #[test]
    fn test_crypto_digest() {
        let (scope, _, _) = scope_with(ConsentResponse::Allow);
        let crypto = scope.get("crypto").unwrap();
        let sha = call(&crypto, "digest", &["sha256".into(), "abc".into()]).unwrap();
        assert_eq!(
            sha.as_str(),
            Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
        let b3 = call(&crypto, "digest", &["blake3".into(), "abc".into()]).unwrap();
        assert_eq!(b3.as_str().map(str::len), Some(64));
        assert!(call(&crypto, "digest", &["md5".into(), "abc".into()]).is_err());

        let uuid = call(&crypto, "randomUUID", &[]).unwrap();
        assert_eq!(uuid.as_str().map(str::len), Some(36));
        assert!(call(&crypto, "randomBytes", &[Value::Number(1e9)]).is_err());
    }

    #[test]
    fn test_abort_controller_and_unit_signal() {
        let (scope, _, _) = scope_with(ConsentResponse::Allow);
        let abort = scope.get("abort").unwrap();
        let controller = call(&abort, "controller", &[]).unwrap();
        let signal = controller.as_object().unwrap().get("signal");
        assert!(!signal.as_object().unwrap().get("aborted").truthy());
        call(&controller, "abort", &[]).unwrap();
        assert!(signal.as_object().unwrap().get("aborted").truthy());

        assert!(!scope.is_aborted());
        scope.abort();
        assert!(scope.is_aborted());
    }

    #[test]
    fn test_require_only_resolves() {
        let (scope, prompt, _) = scope_with(ConsentResponse::Deny);
        let require = scope.get("require").unwrap();
        assert_eq!(require.as_object().unwrap().own_keys().len(), 1);
        let name = call(&require, "resolve", &["node:fs".into()]).unwrap();
        assert_eq!(name.as_str(), Some("fs"));
        assert_eq!(prompt.prompt_count(), 0);
    }

    #[test]
    fn test_display_value() {
        assert_eq!(display_value(&Value::Number(3.0)), "3");
        assert_eq!(display_value(&Value::Number(1.5)), "1.5");
        assert_eq!(display_value(&"x".into()), "x");
    }

    #[test]
    fn test_text_roundtrip_lengths() {
        let (scope, _, _) = scope_with(ConsentResponse::Allow);
        let text = scope.get("text").unwrap();
        let len = call(&text, "byteLength", &["héllo".into()]).unwrap();
        assert_eq!(len.as_f64(), Some(6.0));
    }
}
