//! warden-host: Capability-gated sandbox host
//!
//! Runs untrusted extension code (WebAssembly units) so that every touch of a
//! dangerous host capability goes through a trust decision:
//!
//! ```text
//! register(id, source)
//!   └─ SandboxExecutionContext ── host imports ── InterceptingLoader
//!                                                   │
//!          CapabilityClassifier ── TrustBroker ── CapabilityProxy ── real module
//! ```
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use warden_host::{HostConfig, NativeHost};
//! use warden_host::trust::TrustPresets;
//!
//! let config = HostConfig::new("myapp");
//! let host = NativeHost::new(TrustPresets::interactive("myapp")?, &config)?;
//!
//! let channel = host.register("reader", &source).await?;
//! let result = host.invoke(&channel, "readConfig", vec![]).await;
//! ```

pub mod audit;
pub mod classifier;
pub mod config;
pub mod discovery;
pub mod invoker;
pub mod loader;
pub mod modules;
pub mod proxy;
pub mod registry;
pub mod sandbox;
pub mod trust;
pub mod value;
pub mod watcher;

pub use classifier::{CapabilityClassifier, DangerCategory, DangerRule, DangerTable, ResourceRequest};
pub use config::{ConfigError, ExecutionLimits, HostConfig};
pub use discovery::{default_unit_dirs, DiscoveryError, DiscoveryResult, UnitScanner};
pub use invoker::{ExportInvoker, InvokeError};
pub use loader::InterceptingLoader;
pub use modules::HostModules;
pub use proxy::CapabilityProxy;
pub use registry::{channel_handle, NativeHost, RegistryError};
pub use sandbox::{CodeUnit, LoadedUnit, SandboxError, SandboxExecutionContext};
pub use trust::{AccessDenied, TrustBroker};
pub use value::{HostError, HostObject, NativeFunction, NativeObject, ObjectRef, Value};
pub use watcher::{HotReloadWatcher, WatcherConfig, WatcherError};
pub use warden_api::{CodeHash, ErrorKind, InvokeResult, StructuredError};
