//! Trust broker
//!
//! Decides whether a code unit may use a dangerous resource:
//!
//! ```text
//! authorize(unit, hash, request, target)
//!     │
//!     ├─ identity cache hit for (hash, target) ───────────────► allow
//!     │
//!     ├─ store["hash::resource"] == allow ──► cache target ───► allow
//!     ├─ store["hash::resource"] == deny  ──► Sticky ─────────► deny
//!     │                                       Reprompt ─┐
//!     │                                                 ▼
//!     └─ single flight per "hash::resource" ──► prompt ──► record ──► answer
//!              (followers wait for the leader's answer)
//! ```
//!
//! A prompt that cannot be shown denies. A decision that cannot be persisted
//! still applies to the current process.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use warden_api::CodeHash;

use super::prompt::{ConsentPrompt, ConsentRequest, ConsentResponse};
use super::store::TrustStore;
use crate::audit::{self, AuditSink, DecisionSource};
use crate::classifier::{DangerCategory, ResourceRequest};
use crate::value::{ObjectId, ObjectRef, WeakObjectRef};

/// Identity cache size at which dead entries are pruned
const MAX_CACHED_IDENTITIES: usize = 4096;

/// What happens after a persisted denial
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DenialPolicy {
    /// Ask again on the next use
    #[default]
    Reprompt,
    /// A recorded denial stands until revoked
    Sticky,
}

/// Authorization refusal surfaced to the requesting code
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Access denied! User blocked \"{resource_key}\" ({category}) in \"{unit_id}\"")]
pub struct AccessDenied {
    pub unit_id: String,
    pub resource_key: String,
    pub category: DangerCategory,
}

impl AccessDenied {
    pub fn new(unit_id: &str, request: &ResourceRequest) -> Self {
        Self {
            unit_id: unit_id.to_string(),
            resource_key: request.resource_key.clone(),
            category: request.category,
        }
    }
}

thread_local! {
    static CONSENT_WAIT: Cell<Duration> = const { Cell::new(Duration::ZERO) };
}

/// Time this thread spent blocked on consent since the last call
///
/// Execution budgets subtract it so a slow answer does not time a unit out.
pub fn take_consent_wait() -> Duration {
    CONSENT_WAIT.with(|wait| wait.replace(Duration::ZERO))
}

struct Flight {
    decision: Mutex<Option<bool>>,
    ready: Condvar,
}

impl Flight {
    fn new() -> Self {
        Self {
            decision: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn wait(&self) -> bool {
        let mut decision = self.decision.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(allowed) = *decision {
                return allowed;
            }
            decision = self
                .ready
                .wait(decision)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// Completes a flight even if the leader unwinds; an unfinished flight denies
struct FlightGuard<'a> {
    flights: &'a Mutex<HashMap<String, Arc<Flight>>>,
    key: &'a str,
    flight: Arc<Flight>,
    done: bool,
}

impl FlightGuard<'_> {
    fn complete(&mut self, allowed: bool) {
        *self
            .flight
            .decision
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(allowed);
        self.flights
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(self.key);
        self.flight.ready.notify_all();
        self.done = true;
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.complete(false);
        }
    }
}

/// Authorization service shared by every sandbox in the process
pub struct TrustBroker {
    store: Arc<dyn TrustStore>,
    prompt: Arc<dyn ConsentPrompt>,
    audit: Arc<dyn AuditSink>,
    policy: DenialPolicy,
    /// Approved objects per code hash, checked against the live object
    identity_cache: RwLock<HashMap<(CodeHash, ObjectId), WeakObjectRef>>,
    /// Decisions whose persistence failed, kept for this process
    unpersisted: RwLock<HashMap<String, bool>>,
    flights: Mutex<HashMap<String, Arc<Flight>>>,
}

impl TrustBroker {
    pub fn new(
        store: Arc<dyn TrustStore>,
        prompt: Arc<dyn ConsentPrompt>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            store,
            prompt,
            audit,
            policy: DenialPolicy::default(),
            identity_cache: RwLock::new(HashMap::new()),
            unpersisted: RwLock::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_policy(mut self, policy: DenialPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> DenialPolicy {
        self.policy
    }

    pub fn store(&self) -> &Arc<dyn TrustStore> {
        &self.store
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    /// Load the store; failures are logged and leave it empty
    pub fn init(&self) {
        if let Err(e) = self.store.init() {
            tracing::warn!(error = %e, "Failed to initialize trust store");
        }
    }

    /// Persist pending decisions
    pub fn flush(&self) {
        if let Err(e) = self.store.flush() {
            tracing::warn!(error = %e, "Failed to flush trust store");
        }
        if let Err(e) = self.audit.flush() {
            tracing::warn!(error = %e, "Failed to flush audit sink");
        }
    }

    /// Decide whether `unit_id` (running `code_hash`) may use `request`
    ///
    /// `target` is the real object being touched, if any; approval is
    /// remembered for that exact object.
    pub fn authorize(
        &self,
        unit_id: &str,
        code_hash: &CodeHash,
        request: &ResourceRequest,
        target: Option<&ObjectRef>,
    ) -> bool {
        if let Some(target) = target {
            if self.is_cached(code_hash, target) {
                return true;
            }
        }

        let key = code_hash.decision_key(&request.resource_key);
        match self.recorded(&key) {
            Some(true) => {
                tracing::debug!(
                    unit = %unit_id,
                    resource = %request.resource_key,
                    "Using stored approval"
                );
                self.record_audit(audit::access_granted(
                    unit_id,
                    code_hash.as_str(),
                    request,
                    DecisionSource::Store,
                ));
                self.remember(code_hash, target);
                return true;
            }
            Some(false) if self.policy == DenialPolicy::Sticky => {
                tracing::warn!(
                    unit = %unit_id,
                    resource = %request.resource_key,
                    category = %request.category,
                    "Access denied by stored decision"
                );
                self.record_audit(audit::access_denied(
                    unit_id,
                    code_hash.as_str(),
                    request,
                    DecisionSource::Store,
                    "previously denied",
                ));
                return false;
            }
            _ => {}
        }

        let started = Instant::now();
        let allowed = self.single_flight(unit_id, code_hash, request, &key);
        CONSENT_WAIT.with(|wait| wait.set(wait.get() + started.elapsed()));
        if allowed {
            self.remember(code_hash, target);
        }
        allowed
    }

    /// [`authorize`](Self::authorize) as a `Result`
    pub fn require(
        &self,
        unit_id: &str,
        code_hash: &CodeHash,
        request: &ResourceRequest,
        target: Option<&ObjectRef>,
    ) -> Result<(), AccessDenied> {
        if self.authorize(unit_id, code_hash, request, target) {
            Ok(())
        } else {
            Err(AccessDenied::new(unit_id, request))
        }
    }

    /// Drop a persisted decision for one resource
    pub fn revoke(&self, code_hash: &CodeHash, resource_key: &str) {
        let key = code_hash.decision_key(resource_key);
        if let Err(e) = self.store.remove(&key) {
            tracing::warn!(key = %key, error = %e, "Failed to revoke trust decision");
        }
        self.unpersisted
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);
        self.forget(code_hash);
    }

    /// Release cached approvals for a code hash
    pub fn forget(&self, code_hash: &CodeHash) {
        self.identity_cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(hash, _), _| hash != code_hash);
    }

    /// Number of live objects in the identity cache
    pub fn cached_identities(&self) -> usize {
        self.identity_cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|target| target.is_live())
            .count()
    }

    fn is_cached(&self, code_hash: &CodeHash, target: &ObjectRef) -> bool {
        self.identity_cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(code_hash.clone(), target.id()))
            .and_then(WeakObjectRef::upgrade)
            .is_some_and(|cached| cached.ptr_eq(target))
    }

    fn remember(&self, code_hash: &CodeHash, target: Option<&ObjectRef>) {
        let Some(target) = target else {
            return;
        };
        let mut cache = self.identity_cache.write().unwrap_or_else(|e| e.into_inner());
        if cache.len() >= MAX_CACHED_IDENTITIES {
            cache.retain(|_, cached| cached.is_live());
            if cache.len() >= MAX_CACHED_IDENTITIES {
                tracing::debug!(entries = cache.len(), "Identity cache full, clearing");
                cache.clear();
            }
        }
        cache.insert((code_hash.clone(), target.id()), target.downgrade());
    }

    fn recorded(&self, key: &str) -> Option<bool> {
        match self.store.get(key) {
            Ok(Some(allowed)) => return Some(allowed),
            Ok(None) => {}
            Err(e) => tracing::warn!(key = %key, error = %e, "Failed to read trust store"),
        }
        self.unpersisted
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .copied()
    }

    fn persist(&self, key: &str, allowed: bool) {
        if let Err(e) = self.store.set(key, allowed) {
            tracing::warn!(
                key = %key,
                error = %e,
                "Failed to persist trust decision, keeping it for this session"
            );
            self.unpersisted
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(key.to_string(), allowed);
        }
    }

    fn single_flight(
        &self,
        unit_id: &str,
        code_hash: &CodeHash,
        request: &ResourceRequest,
        key: &str,
    ) -> bool {
        let (flight, leader) = {
            let mut flights = self.flights.lock().unwrap_or_else(|e| e.into_inner());
            match flights.get(key) {
                Some(flight) => (Arc::clone(flight), false),
                None => {
                    let flight = Arc::new(Flight::new());
                    flights.insert(key.to_string(), Arc::clone(&flight));
                    (flight, true)
                }
            }
        };

        if !leader {
            tracing::debug!(
                unit = %unit_id,
                resource = %request.resource_key,
                "Waiting for pending consent"
            );
            let allowed = flight.wait();
            let event = if allowed {
                audit::access_granted(unit_id, code_hash.as_str(), request, DecisionSource::Coalesced)
            } else {
                audit::access_denied(
                    unit_id,
                    code_hash.as_str(),
                    request,
                    DecisionSource::Coalesced,
                    "denied by concurrent prompt",
                )
            };
            self.record_audit(event);
            return allowed;
        }

        let mut guard = FlightGuard {
            flights: &self.flights,
            key,
            flight,
            done: false,
        };

        // A flight that finished just before ours may already have an answer
        let allowed = match self.recorded(key) {
            Some(true) => true,
            Some(false) if self.policy == DenialPolicy::Sticky => false,
            _ => self.ask(unit_id, code_hash, request, key),
        };
        guard.complete(allowed);
        allowed
    }

    fn ask(&self, unit_id: &str, code_hash: &CodeHash, request: &ResourceRequest, key: &str) -> bool {
        tracing::warn!(
            unit = %unit_id,
            resource = %request.resource_key,
            category = %request.category,
            "Requesting consent"
        );
        self.record_audit(audit::consent_requested(unit_id, code_hash.as_str(), request));

        let consent = ConsentRequest::new(unit_id, request);
        match self.prompt.prompt(&consent) {
            Ok(ConsentResponse::Allow) => {
                tracing::info!(
                    unit = %unit_id,
                    resource = %request.resource_key,
                    "Access granted"
                );
                self.persist(key, true);
                self.record_audit(audit::access_granted(
                    unit_id,
                    code_hash.as_str(),
                    request,
                    DecisionSource::Prompt,
                ));
                true
            }
            Ok(response) => {
                let reason = match response {
                    ConsentResponse::Dismissed => "prompt dismissed",
                    _ => "denied by user",
                };
                tracing::warn!(
                    unit = %unit_id,
                    resource = %request.resource_key,
                    category = %request.category,
                    reason,
                    "Access denied"
                );
                if response == ConsentResponse::Deny {
                    self.persist(key, false);
                }
                self.record_audit(audit::access_denied(
                    unit_id,
                    code_hash.as_str(),
                    request,
                    DecisionSource::Prompt,
                    reason,
                ));
                false
            }
            Err(e) => {
                tracing::warn!(
                    unit = %unit_id,
                    resource = %request.resource_key,
                    error = %e,
                    "Consent unavailable, failing closed"
                );
                self.record_audit(audit::access_denied(
                    unit_id,
                    code_hash.as_str(),
                    request,
                    DecisionSource::FailClosed,
                    &e.to_string(),
                ));
                false
            }
        }
    }

    fn record_audit(&self, event: audit::AuditEvent) {
        if let Err(e) = self.audit.record(event) {
            tracing::warn!(error = %e, "Failed to record audit event");
        }
    }
}

impl std::fmt::Debug for TrustBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustBroker")
            .field("policy", &self.policy)
            .field("cached_identities", &self.cached_identities())
            .finish_non_exhaustive()
    }
}
