//! Audit trail for trust decisions and unit lifecycle
//!
//! Every prompt, grant, denial and load is recorded through an [`AuditSink`].
//! Embedders pick where the events go: a JSONL file, memory, or nowhere.

use serde::Serialize;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use thiserror::Error;

use crate::classifier::{DangerCategory, ResourceRequest};

/// RFC 3339 timestamp
pub type Timestamp = String;

fn now_rfc3339() -> Timestamp {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Audit event
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub timestamp: Timestamp,
    pub event_type: AuditEventType,
    /// Code unit id
    pub unit: String,
    pub details: AuditDetails,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, unit: impl Into<String>, details: AuditDetails) -> Self {
        Self {
            timestamp: now_rfc3339(),
            event_type,
            unit: unit.into(),
            details,
        }
    }
}

/// Type of audit event
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// The consent collaborator was asked
    ConsentRequested,
    /// Access to a dangerous resource was allowed
    AccessGranted,
    /// Access to a dangerous resource was refused
    AccessDenied,
    /// A gated member was invoked after authorization
    CapabilityUsed,
    UnitLoaded,
    UnitUnloaded,
    /// A unit failed to load; nothing was published
    LoadFailed,
}

/// Where a trust decision came from
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// Persisted decision for the same code hash
    Store,
    /// Fresh answer from the consent collaborator
    Prompt,
    /// Decision shared by a concurrent prompt for the same key
    Coalesced,
    /// No answer could be obtained
    FailClosed,
}

/// Details about the audit event
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum AuditDetails {
    Decision {
        resource: String,
        category: DangerCategory,
        code_hash: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<DecisionSource>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Capability {
        resource: String,
        category: DangerCategory,
        path: String,
    },
    Lifecycle {
        code_hash: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
    },
    Failure {
        code_hash: String,
        reason: String,
    },
}

/// Error type for audit operations
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Failed to write audit log: {0}")]
    WriteError(#[from] std::io::Error),

    #[error("Failed to serialize audit event: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Destination for audit events
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError>;

    fn flush(&self) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Appends one JSON object per line
pub struct FileAuditSink {
    writer: Mutex<BufWriter<File>>,
}

impl FileAuditSink {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl AuditSink for FileAuditSink {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        let line = serde_json::to_string(&event)?;
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writeln!(writer, "{}", line)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), AuditError> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner()).flush()?;
        Ok(())
    }
}

/// Most recent events kept by [`MemoryAuditSink`]
const MEMORY_RETENTION: usize = 1000;

/// Keeps the latest events in memory
#[derive(Default)]
pub struct MemoryAuditSink {
    events: RwLock<VecDeque<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.read().unwrap_or_else(|e| e.into_inner()).iter().cloned().collect()
    }

    pub fn find_by_type(&self, event_type: AuditEventType) -> Vec<AuditEvent> {
        self.events
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        let mut events = self.events.write().unwrap_or_else(|e| e.into_inner());
        if events.len() == MEMORY_RETENTION {
            events.pop_front();
        }
        events.push_back(event);
        Ok(())
    }
}

/// Discards all events
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _event: AuditEvent) -> Result<(), AuditError> {
        Ok(())
    }
}

pub fn consent_requested(unit: &str, code_hash: &str, request: &ResourceRequest) -> AuditEvent {
    AuditEvent::new(
        AuditEventType::ConsentRequested,
        unit,
        AuditDetails::Decision {
            resource: request.resource_key.clone(),
            category: request.category,
            code_hash: code_hash.to_string(),
            source: None,
            reason: None,
        },
    )
}

pub fn access_granted(
    unit: &str,
    code_hash: &str,
    request: &ResourceRequest,
    source: DecisionSource,
) -> AuditEvent {
    AuditEvent::new(
        AuditEventType::AccessGranted,
        unit,
        AuditDetails::Decision {
            resource: request.resource_key.clone(),
            category: request.category,
            code_hash: code_hash.to_string(),
            source: Some(source),
            reason: None,
        },
    )
}

pub fn access_denied(
    unit: &str,
    code_hash: &str,
    request: &ResourceRequest,
    source: DecisionSource,
    reason: &str,
) -> AuditEvent {
    AuditEvent::new(
        AuditEventType::AccessDenied,
        unit,
        AuditDetails::Decision {
            resource: request.resource_key.clone(),
            category: request.category,
            code_hash: code_hash.to_string(),
            source: Some(source),
            reason: Some(reason.to_string()),
        },
    )
}

pub fn capability_used(unit: &str, request: &ResourceRequest, path: &str) -> AuditEvent {
    AuditEvent::new(
        AuditEventType::CapabilityUsed,
        unit,
        AuditDetails::Capability {
            resource: request.resource_key.clone(),
            category: request.category,
            path: path.to_string(),
        },
    )
}

pub fn unit_loaded(unit: &str, code_hash: &str, channel: &str, path: Option<&Path>) -> AuditEvent {
    AuditEvent::new(
        AuditEventType::UnitLoaded,
        unit,
        AuditDetails::Lifecycle {
            code_hash: code_hash.to_string(),
            channel: Some(channel.to_string()),
            path: path.map(Path::to_path_buf),
        },
    )
}

pub fn unit_unloaded(unit: &str, code_hash: &str) -> AuditEvent {
    AuditEvent::new(
        AuditEventType::UnitUnloaded,
        unit,
        AuditDetails::Lifecycle {
            code_hash: code_hash.to_string(),
            channel: None,
            path: None,
        },
    )
}

pub fn load_failed(unit: &str, code_hash: &str, reason: &str) -> AuditEvent {
    AuditEvent::new(
        AuditEventType::LoadFailed,
        unit,
        AuditDetails::Failure {
            code_hash: code_hash.to_string(),
            reason: reason.to_string(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs_request() -> ResourceRequest {
        ResourceRequest::new("fs", DangerCategory::Filesystem)
    }

    #[test]
    fn test_memory_sink_keeps_latest_events() {
        let sink = MemoryAuditSink::new();
        sink.record(consent_requested("reader", "abc", &fs_request())).unwrap();
        for i in 0..MEMORY_RETENTION {
            sink.record(unit_unloaded(&format!("unit-{}", i), "abc")).unwrap();
        }

        let events = sink.events();
        assert_eq!(events.len(), MEMORY_RETENTION);
        assert_eq!(events[0].unit, "unit-0");
        assert!(sink.find_by_type(AuditEventType::ConsentRequested).is_empty());
        assert_eq!(sink.find_by_type(AuditEventType::UnitUnloaded).len(), MEMORY_RETENTION);
    }

    #[test]
    fn test_event_serialization() {
        let event = access_denied(
            "reader",
            "abc",
            &fs_request(),
            DecisionSource::FailClosed,
            "prompt unavailable",
        );

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("access_denied"));
        assert!(json.contains("fail_closed"));
        assert!(json.contains("Filesystem"));
        assert!(event.timestamp.ends_with('Z'));
    }

    #[test]
    fn test_file_sink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let sink = FileAuditSink::new(&path).unwrap();
        sink.record(load_failed("spin", "abc", "ExecutionTimeout"))
            .unwrap();
        sink.flush().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("load_failed"));
    }
}
