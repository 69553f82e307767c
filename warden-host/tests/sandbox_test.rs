//! End-to-end tests: register units, invoke exports, observe trust decisions

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use warden_host::audit::{AuditEventType, MemoryAuditSink};
use warden_api::kind;
use warden_host::trust::{
    ConsentPrompt, ConsentResponse, DenialPolicy, EncryptedFileTrustStore, MemoryTrustStore,
    RecordingPrompt, TrustCipher, TrustStore, UnavailablePrompt,
};
use warden_host::{
    ErrorKind, ExecutionLimits, HostConfig, HostModules, NativeHost, NativeObject, SandboxExecutionContext,
    TrustBroker, Value,
};

/// Loads the clipboard on first use and reads it
const READER: &str = r#"(module
    (import "host" "require" (func $require (param i32 i32) (result i32)))
    (import "host" "try_require" (func $try_require (param i32 i32) (result i32)))
    (import "host" "get" (func $get (param i32 i32 i32) (result i32)))
    (import "host" "call" (func $call (param i32 i32 i32 i32) (result i32)))
    (import "host" "len" (func $len (param i32) (result i32)))
    (import "host" "same" (func $same (param i32 i32) (result i32)))
    (memory (export "memory") 1)
    (data (i32.const 0) "clipboard")
    (data (i32.const 16) "readText")
    (global $clip (mut i32) (i32.const 0))

    (func $clipboard (result i32)
        (if (i32.eqz (global.get $clip))
            (then (global.set $clip (call $require (i32.const 0) (i32.const 9)))))
        (global.get $clip))

    (func $read_text (param $clip i32) (result i32)
        (call $len
            (call $call
                (call $get (local.get $clip) (i32.const 16) (i32.const 8))
                (local.get $clip)
                (i32.const 0)
                (i32.const 0))))

    (func (export "read") (result i32)
        (call $read_text (call $clipboard)))

    (func (export "tryRead") (result i32)
        (local $h i32)
        (if (i32.eqz (global.get $clip))
            (then
                (local.set $h (call $try_require (i32.const 0) (i32.const 9)))
                (if (i32.lt_s (local.get $h) (i32.const 0))
                    (then (return (local.get $h))))
                (global.set $clip (local.get $h))))
        (call $read_text (global.get $clip)))

    (func (export "identity") (result i32)
        (call $same (call $require (i32.const 0) (i32.const 9)) (call $clipboard)))

    (func (export "ping") (result i32) i32.const 1))"#;

/// Checks whether a path exists through the real `fs` module
const FS_CHECK: &str = r#"(module
    (import "host" "require" (func $require (param i32 i32) (result i32)))
    (import "host" "get" (func $get (param i32 i32 i32) (result i32)))
    (import "host" "call" (func $call (param i32 i32 i32 i32) (result i32)))
    (import "host" "string" (func $string (param i32 i32) (result i32)))
    (import "host" "as_bool" (func $as_bool (param i32) (result i32)))
    (memory (export "memory") 1)
    (data (i32.const 0) "fs")
    (data (i32.const 16) "exists")
    (data (i32.const 32) "/")

    (func (export "rootExists") (result i32)
        (local $fs i32)
        (local.set $fs (call $require (i32.const 0) (i32.const 2)))
        (i32.store (i32.const 64) (call $string (i32.const 32) (i32.const 1)))
        (call $as_bool
            (call $call
                (call $get (local.get $fs) (i32.const 16) (i32.const 6))
                (local.get $fs)
                (i32.const 64)
                (i32.const 1)))))"#;

/// Touches WebAssembly, which is authorized as soon as it is loaded
const WASM_USER: &str = r#"(module
    (import "host" "global" (func $global (param i32 i32) (result i32)))
    (memory (export "memory") 1)
    (data (i32.const 0) "WebAssembly")
    (func (export "_initialize")
        (drop (call $global (i32.const 0) (i32.const 11))))
    (func (export "ok") (result i32) i32.const 1))"#;

/// Reads one variable from the real `process` module
const ENV_READER: &str = r#"(module
    (import "host" "require" (func $require (param i32 i32) (result i32)))
    (import "host" "get" (func $get (param i32 i32 i32) (result i32)))
    (import "host" "kind" (func $kind (param i32) (result i32)))
    (memory (export "memory") 1)
    (data (i32.const 0) "process")
    (data (i32.const 16) "env")
    (data (i32.const 32) "WARDEN_TEST_SECRET")

    (func (export "secretKind") (result i32)
        (call $kind
            (call $get
                (call $get (call $require (i32.const 0) (i32.const 7)) (i32.const 16) (i32.const 3))
                (i32.const 32)
                (i32.const 18)))))"#;

/// Tries to hang `child_process` off the shared `fs` module
const PLANTER: &str = r#"(module
    (import "host" "require" (func $require (param i32 i32) (result i32)))
    (import "host" "get" (func $get (param i32 i32 i32) (result i32)))
    (import "host" "set" (func $set (param i32 i32 i32 i32)))
    (import "host" "kind" (func $kind (param i32) (result i32)))
    (memory (export "memory") 1)
    (data (i32.const 0) "fs")
    (data (i32.const 16) "x")
    (data (i32.const 32) "child_process")

    (func (export "plant")
        (call $set
            (call $require (i32.const 0) (i32.const 2))
            (i32.const 16)
            (i32.const 1)
            (call $require (i32.const 32) (i32.const 13))))

    (func (export "planted") (result i32)
        (call $kind (call $get (call $require (i32.const 0) (i32.const 2)) (i32.const 16) (i32.const 1)))))"#;

struct Harness {
    host: NativeHost,
    reads: Arc<AtomicUsize>,
    audit: Arc<MemoryAuditSink>,
}

fn harness_with(
    prompt: Arc<dyn ConsentPrompt>,
    store: Arc<dyn TrustStore>,
    policy: DenialPolicy,
    limits: ExecutionLimits,
) -> Harness {
    let audit = Arc::new(MemoryAuditSink::new());
    let broker = Arc::new(TrustBroker::new(store, prompt, audit.clone()).with_policy(policy));
    broker.init();

    let config = HostConfig::new("warden-test")
        .with_data_dir(std::env::temp_dir())
        .with_limits(limits);

    let reads = Arc::new(AtomicUsize::new(0));
    let modules = HostModules::builtin(std::env::temp_dir());
    let counter = reads.clone();
    modules.register("clipboard", move |_| {
        let counter = counter.clone();
        Ok(Value::Object(
            NativeObject::new("Clipboard")
                .method("readText", move |_clipboard, _args| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::from("secret"))
                })
                .build(),
        ))
    });

    let context = SandboxExecutionContext::new(broker, &config)
        .unwrap()
        .with_modules(Arc::new(modules));
    Harness {
        host: NativeHost::with_context(context),
        reads,
        audit,
    }
}

fn harness(prompt: Arc<RecordingPrompt>) -> Harness {
    harness_with(
        prompt,
        Arc::new(MemoryTrustStore::new()),
        DenialPolicy::Reprompt,
        ExecutionLimits::default(),
    )
}

#[tokio::test]
async fn test_denied_filesystem_access_is_attributed() {
    let prompt = Arc::new(RecordingPrompt::new(ConsentResponse::Deny));
    let h = harness(prompt.clone());

    let channel = h.host.register("checker", FS_CHECK).await.unwrap();
    let err = h.host.invoke(&channel, "rootExists", vec![]).await.unwrap_err();

    assert_eq!(err.kind, ErrorKind::AccessDenied);
    assert!(err.message.contains("Filesystem"), "{}", err.message);
    assert_eq!(err.cause.as_deref(), Some("[native] (checker).rootExists"));
    assert_eq!(prompt.prompt_count(), 1);
    assert_eq!(prompt.prompts()[0].resource_key, "fs");
    assert_eq!(h.audit.find_by_type(AuditEventType::AccessDenied).len(), 1);
}

#[tokio::test]
async fn test_allowed_call_reaches_real_receiver() {
    let prompt = Arc::new(RecordingPrompt::new(ConsentResponse::Allow));
    let h = harness(prompt.clone());

    let channel = h.host.register("checker", FS_CHECK).await.unwrap();
    let result = h.host.invoke(&channel, "rootExists", vec![]).await.unwrap();
    assert_eq!(result, json!(1));

    h.host.invoke(&channel, "rootExists", vec![]).await.unwrap();
    assert_eq!(prompt.prompt_count(), 1);
}

#[tokio::test]
async fn test_denied_resource_is_never_invoked() {
    let prompt = Arc::new(RecordingPrompt::new(ConsentResponse::Deny));
    let h = harness(prompt.clone());

    let channel = h.host.register("reader", READER).await.unwrap();
    assert_eq!(prompt.prompt_count(), 0, "nothing is loaded before first use");

    let err = h.host.invoke(&channel, "read", vec![]).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::AccessDenied);
    assert_eq!(h.reads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_denial_is_recoverable_by_the_unit() {
    let prompt = Arc::new(RecordingPrompt::new(ConsentResponse::Deny));
    let h = harness(prompt.clone());

    let channel = h.host.register("reader", READER).await.unwrap();
    let status = h.host.invoke(&channel, "tryRead", vec![]).await.unwrap();
    assert_eq!(status, json!(-1));

    // The unit is still usable afterwards
    assert_eq!(h.host.invoke(&channel, "ping", vec![]).await.unwrap(), json!(1));
}

#[tokio::test]
async fn test_proxy_identity_is_stable() {
    let prompt = Arc::new(RecordingPrompt::new(ConsentResponse::Allow));
    let h = harness(prompt);

    let channel = h.host.register("reader", READER).await.unwrap();
    assert_eq!(h.host.invoke(&channel, "identity", vec![]).await.unwrap(), json!(1));
}

#[tokio::test]
async fn test_same_source_is_not_reprompted_but_changed_source_is() {
    let prompt = Arc::new(RecordingPrompt::new(ConsentResponse::Allow));
    let h = harness(prompt.clone());

    let a = h.host.register("a", READER).await.unwrap();
    assert_eq!(h.host.invoke(&a, "read", vec![]).await.unwrap(), json!(6));
    assert_eq!(prompt.prompt_count(), 1);

    let b = h.host.register("b", READER).await.unwrap();
    assert_eq!(h.host.code_hash("a").await, h.host.code_hash("b").await);
    h.host.invoke(&b, "read", vec![]).await.unwrap();
    assert_eq!(prompt.prompt_count(), 1);

    let changed = format!("{}\n;; v2", READER);
    let c = h.host.register("c", &changed).await.unwrap();
    h.host.invoke(&c, "read", vec![]).await.unwrap();
    assert_eq!(prompt.prompt_count(), 2);
    assert_eq!(h.reads.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_concurrent_first_use_prompts_once() {
    let prompt = Arc::new(RecordingPrompt::new(ConsentResponse::Allow).with_delay(Duration::from_millis(200)));
    let h = harness(prompt.clone());

    let a = h.host.register("a", READER).await.unwrap();
    let b = h.host.register("b", READER).await.unwrap();

    let (ra, rb) = tokio::join!(
        h.host.invoke(&a, "read", vec![]),
        h.host.invoke(&b, "read", vec![])
    );
    assert_eq!(ra.unwrap(), json!(6));
    assert_eq!(rb.unwrap(), json!(6));
    assert_eq!(prompt.prompt_count(), 1);
}

#[tokio::test]
async fn test_reprompt_after_denial_by_default() {
    let prompt = Arc::new(RecordingPrompt::new(ConsentResponse::Deny));
    let h = harness(prompt.clone());

    let channel = h.host.register("reader", READER).await.unwrap();
    assert!(h.host.invoke(&channel, "read", vec![]).await.is_err());
    assert!(h.host.invoke(&channel, "read", vec![]).await.is_err());
    assert_eq!(prompt.prompt_count(), 2);
}

#[tokio::test]
async fn test_sticky_denial() {
    let prompt = Arc::new(RecordingPrompt::new(ConsentResponse::Deny));
    let h = harness_with(
        prompt.clone(),
        Arc::new(MemoryTrustStore::new()),
        DenialPolicy::Sticky,
        ExecutionLimits::default(),
    );

    let channel = h.host.register("reader", READER).await.unwrap();
    assert!(h.host.invoke(&channel, "read", vec![]).await.is_err());
    assert!(h.host.invoke(&channel, "read", vec![]).await.is_err());
    assert_eq!(prompt.prompt_count(), 1);
}

#[tokio::test]
async fn test_fails_closed_without_consent_surface() {
    let h = harness_with(
        Arc::new(UnavailablePrompt),
        Arc::new(MemoryTrustStore::new()),
        DenialPolicy::Reprompt,
        ExecutionLimits::default(),
    );

    let channel = h.host.register("reader", READER).await.unwrap();
    let err = h.host.invoke(&channel, "read", vec![]).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::AccessDenied);
    assert_eq!(h.reads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_decisions_survive_restart_and_corruption() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("trust.bin");
    let key = [7u8; 32];

    {
        let store = Arc::new(EncryptedFileTrustStore::new(&path, TrustCipher::new(key)).unwrap());
        let prompt = Arc::new(RecordingPrompt::new(ConsentResponse::Allow));
        let h = harness_with(prompt, store, DenialPolicy::Reprompt, ExecutionLimits::default());
        let channel = h.host.register("reader", READER).await.unwrap();
        h.host.invoke(&channel, "read", vec![]).await.unwrap();
        h.host.flush();
    }
    assert!(path.exists());

    {
        let store = Arc::new(EncryptedFileTrustStore::new(&path, TrustCipher::new(key)).unwrap());
        let prompt = Arc::new(RecordingPrompt::new(ConsentResponse::Deny));
        let h = harness_with(prompt.clone(), store, DenialPolicy::Reprompt, ExecutionLimits::default());
        let channel = h.host.register("reader", READER).await.unwrap();
        assert_eq!(h.host.invoke(&channel, "read", vec![]).await.unwrap(), json!(6));
        assert_eq!(prompt.prompt_count(), 0);
    }

    std::fs::write(&path, b"not a trust store").unwrap();
    let store = Arc::new(EncryptedFileTrustStore::new(&path, TrustCipher::new(key)).unwrap());
    let corrupt = store.corrupt_path();
    let prompt = Arc::new(RecordingPrompt::new(ConsentResponse::Deny));
    let h = harness_with(prompt.clone(), store, DenialPolicy::Reprompt, ExecutionLimits::default());
    let channel = h.host.register("reader", READER).await.unwrap();
    assert!(h.host.invoke(&channel, "read", vec![]).await.is_err());
    assert_eq!(prompt.prompt_count(), 1);
    assert!(corrupt.exists());
}

#[tokio::test]
async fn test_infinite_loop_never_produces_a_channel() {
    let prompt = Arc::new(RecordingPrompt::new(ConsentResponse::Allow));
    let h = harness_with(
        prompt,
        Arc::new(MemoryTrustStore::new()),
        DenialPolicy::Reprompt,
        ExecutionLimits {
            load_timeout: Duration::from_millis(200),
            ..ExecutionLimits::default()
        },
    );

    let err = h
        .host
        .register("spin", r#"(module (func (export "_initialize") (loop $l (br $l))) (func (export "f")))"#)
        .await
        .unwrap_err();
    assert_eq!(err.to_structured().kind, ErrorKind::ExecutionTimeout);
    assert!(h.host.channels().await.is_empty());
    assert_eq!(h.audit.find_by_type(AuditEventType::LoadFailed).len(), 1);
}

#[tokio::test]
async fn test_invoke_timeout() {
    let prompt = Arc::new(RecordingPrompt::new(ConsentResponse::Allow));
    let h = harness_with(
        prompt,
        Arc::new(MemoryTrustStore::new()),
        DenialPolicy::Reprompt,
        ExecutionLimits {
            invoke_timeout: Some(Duration::from_millis(200)),
            ..ExecutionLimits::default()
        },
    );

    let channel = h
        .host
        .register("spin", r#"(module (func (export "spin") (loop $l (br $l))))"#)
        .await
        .unwrap();
    let err = h.host.invoke(&channel, "spin", vec![]).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ExecutionTimeout);
    assert_eq!(err.cause.as_deref(), Some("[native] (spin).spin"));
}

#[tokio::test]
async fn test_prompt_time_does_not_count_against_load_budget() {
    let prompt = Arc::new(RecordingPrompt::new(ConsentResponse::Allow).with_delay(Duration::from_millis(400)));
    let h = harness_with(
        prompt.clone(),
        Arc::new(MemoryTrustStore::new()),
        DenialPolicy::Reprompt,
        ExecutionLimits {
            load_timeout: Duration::from_millis(150),
            ..ExecutionLimits::default()
        },
    );

    let channel = h.host.register("wasm", WASM_USER).await.unwrap();
    assert_eq!(prompt.prompt_count(), 1);
    assert_eq!(h.host.invoke(&channel, "ok", vec![]).await.unwrap(), json!(1));
}

#[tokio::test]
async fn test_on_load_denial_fails_registration() {
    let prompt = Arc::new(RecordingPrompt::new(ConsentResponse::Deny));
    let h = harness(prompt.clone());

    let err = h.host.register("wasm", WASM_USER).await.unwrap_err();
    assert_eq!(err.to_structured().kind, ErrorKind::AccessDenied);
    assert!(!h.host.contains("wasm").await);
}

#[tokio::test]
async fn test_missing_export() {
    let prompt = Arc::new(RecordingPrompt::new(ConsentResponse::Allow));
    let h = harness(prompt);

    let channel = h.host.register("reader", READER).await.unwrap();
    let err = h.host.invoke(&channel, "nope", vec![]).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ExportNotFound);
    assert_eq!(err.cause.as_deref(), Some("[native] (reader).nope"));

    let mut exports = h.host.exports(&channel).await.unwrap();
    exports.sort();
    assert_eq!(exports, vec!["identity", "ping", "read", "tryRead"]);
}

#[tokio::test]
async fn test_unregister_forgets_cached_approvals() {
    let prompt = Arc::new(RecordingPrompt::new(ConsentResponse::Allow));
    let h = harness(prompt.clone());

    let channel = h.host.register("reader", READER).await.unwrap();
    h.host.invoke(&channel, "read", vec![]).await.unwrap();
    assert!(h.host.broker().cached_identities() > 0);

    assert!(h.host.unregister("reader").await);
    assert_eq!(h.host.broker().cached_identities(), 0);
    let err = h.host.invoke(&channel, "read", vec![]).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnknownChannel);
}

#[tokio::test]
async fn test_process_environment_needs_consent() {
    std::env::set_var("WARDEN_TEST_SECRET", "hunter2");

    let prompt = Arc::new(RecordingPrompt::new(ConsentResponse::Deny));
    let h = harness(prompt.clone());
    let channel = h.host.register("env", ENV_READER).await.unwrap();
    let err = h.host.invoke(&channel, "secretKind", vec![]).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::AccessDenied);
    assert_eq!(prompt.prompt_count(), 1);
    assert_eq!(prompt.prompts()[0].resource_key, "process");

    let prompt = Arc::new(RecordingPrompt::new(ConsentResponse::Allow));
    let h = harness(prompt);
    let channel = h.host.register("env", ENV_READER).await.unwrap();
    let secret = h.host.invoke(&channel, "secretKind", vec![]).await.unwrap();
    assert_eq!(secret, json!(kind::STRING));
}

#[tokio::test]
async fn test_capability_cannot_be_stored_under_another_gate() {
    let prompt = Arc::new(RecordingPrompt::new(ConsentResponse::Allow));
    let h = harness(prompt);

    let a = h.host.register("a", PLANTER).await.unwrap();
    let err = h.host.invoke(&a, "plant", vec![]).await.unwrap_err();
    assert!(err.message.contains("another capability"), "{}", err.message);
    assert_eq!(err.cause.as_deref(), Some("[native] (a).plant"));

    // A fresh unit running the same code finds nothing planted
    let b = h.host.register("b", PLANTER).await.unwrap();
    assert_eq!(h.host.invoke(&b, "planted", vec![]).await.unwrap(), json!(kind::UNDEFINED));
}
