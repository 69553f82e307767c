//! Sandbox error types

use std::time::Duration;
use thiserror::Error;
use warden_api::{ErrorKind, StructuredError};
use wasmtime::{Trap, WasmBacktrace};

use super::context::BudgetExceeded;
use crate::config::ConfigError;
use crate::value::HostError;

/// Errors raised while creating a context or running a unit's top-level code
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Engine creation failed: {0}")]
    Engine(#[source] anyhow::Error),

    #[error("Compilation failed: {0}")]
    Compile(#[source] anyhow::Error),

    #[error("Instantiation failed: {0}")]
    Instantiate(#[source] anyhow::Error),

    #[error("Execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("Fuel exhausted (CPU limit exceeded)")]
    FuelExhausted,

    /// A host error escaped the unit's code uncaught
    #[error("Uncaught {error}")]
    Thrown {
        error: HostError,
        stack: Option<String>,
    },

    #[error("Trap: {message}")]
    Trap {
        message: String,
        stack: Option<String>,
    },
}

impl SandboxError {
    /// Classify a failed wasm call
    ///
    /// `budget` is the time budget that was in force; it is only used for
    /// the timeout message.
    pub fn from_call(error: anyhow::Error, budget: Duration) -> Self {
        let stack = error
            .downcast_ref::<WasmBacktrace>()
            .map(|bt| bt.to_string())
            .filter(|s| !s.trim().is_empty());

        if let Some(host) = error.downcast_ref::<HostError>() {
            return Self::Thrown {
                error: host.clone(),
                stack,
            };
        }

        if error.is::<BudgetExceeded>() {
            return Self::Timeout(budget);
        }

        match error.downcast_ref::<Trap>() {
            Some(Trap::Interrupt) => Self::Timeout(budget),
            Some(Trap::OutOfFuel) => Self::FuelExhausted,
            _ => Self::Trap {
                message: error.root_cause().to_string(),
                stack,
            },
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::FuelExhausted)
    }

    pub fn is_access_denied(&self) -> bool {
        matches!(self, Self::Thrown { error, .. } if error.is_access_denied())
    }

    pub fn stack(&self) -> Option<&str> {
        match self {
            Self::Thrown { stack, .. } | Self::Trap { stack, .. } => stack.as_deref(),
            _ => None,
        }
    }

    /// Form reported to the registration caller
    pub fn to_structured(&self) -> StructuredError {
        let kind = if self.is_timeout() {
            ErrorKind::ExecutionTimeout
        } else if self.is_access_denied() {
            ErrorKind::AccessDenied
        } else {
            ErrorKind::LoadFailed
        };
        let message = match self {
            Self::Thrown { error, .. } => error.to_string(),
            other => other.to_string(),
        };
        let structured = StructuredError::new(kind, message);
        match self.stack() {
            Some(stack) => structured.with_stack(stack),
            None => structured,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifies_interrupt_as_timeout() {
        let err = SandboxError::from_call(anyhow::Error::new(Trap::Interrupt), Duration::from_secs(5));
        assert!(err.is_timeout());
        assert_eq!(err.to_structured().kind, ErrorKind::ExecutionTimeout);
    }

    #[test]
    fn test_classifies_host_error() {
        let err = SandboxError::from_call(
            anyhow::Error::new(HostError::ModuleNotFound("vm".into())),
            Duration::from_secs(5),
        );
        let structured = err.to_structured();
        assert_eq!(structured.kind, ErrorKind::LoadFailed);
        assert_eq!(structured.message, "Cannot find module 'vm'");
    }

    #[test]
    fn test_classifies_budget_exceeded_as_timeout() {
        let err = SandboxError::from_call(anyhow::Error::new(BudgetExceeded), Duration::from_millis(50));
        assert!(matches!(err, SandboxError::Timeout(d) if d == Duration::from_millis(50)));
    }

    #[test]
    fn test_other_traps() {
        let err = SandboxError::from_call(
            anyhow::Error::new(Trap::UnreachableCodeReached),
            Duration::from_secs(5),
        );
        assert!(matches!(err, SandboxError::Trap { .. }));
    }
}
