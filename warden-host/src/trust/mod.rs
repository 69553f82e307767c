//! Trust decisions for dangerous capabilities
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                           TrustBroker                             │
//! │  identity cache ── single-flight prompts ── denial policy         │
//! │  ┌───────────────────┐ ┌───────────────────┐ ┌─────────────────┐  │
//! │  │    TrustStore     │ │   ConsentPrompt   │ │    AuditSink    │  │
//! │  │                   │ │                   │ │                 │  │
//! │  │ - EncryptedFile   │ │ - Terminal        │ │ - File (JSONL)  │  │
//! │  │ - Memory          │ │ - Auto            │ │ - Memory        │  │
//! │  │ - ReadOnly        │ │ - Callback        │ │ - Null          │  │
//! │  │                   │ │ - Recording       │ │ - Composite     │  │
//! │  │                   │ │ - Unavailable     │ │                 │  │
//! │  └───────────────────┘ └───────────────────┘ └─────────────────┘  │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Decisions are keyed by `codeHash::resourceKey`, so changing a single byte
//! of a unit's source invalidates everything approved for the old version.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use warden_host::trust::{TrustPresets, TrustConfigBuilder, MemoryTrustStore, AutoPrompt};
//!
//! // Desktop use
//! let broker = TrustPresets::interactive("myapp")?.into_broker();
//!
//! // Custom
//! let broker = TrustConfigBuilder::new()
//!     .store(MemoryTrustStore::new())
//!     .prompt(AutoPrompt::always_deny())
//!     .build()?
//!     .into_broker();
//! ```

pub mod broker;
pub mod encrypted;
pub mod presets;
pub mod prompt;
pub mod store;

pub use broker::{take_consent_wait, AccessDenied, DenialPolicy, TrustBroker};
pub use encrypted::{EncryptedFileTrustStore, TrustCipher, MASTER_KEY_ENV};
pub use presets::{PresetError, TrustConfig, TrustConfigBuilder, TrustPresets};
pub use prompt::{AutoPrompt, CallbackPrompt, RecordingPrompt, TerminalPrompt, UnavailablePrompt};
pub use prompt::{ConsentPrompt, ConsentRequest, ConsentResponse, PromptError};
pub use store::{MemoryTrustStore, ReadOnlyTrustStore, StoreError, TrustStore};
