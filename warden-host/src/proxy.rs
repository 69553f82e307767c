//! Identity-preserving capability proxies
//!
//! A [`CapabilityProxy`] belongs to one sandboxed unit and gates every host
//! object that unit obtains from a dangerous resource. It keeps an arena of
//! gated nodes:
//!
//! ```text
//!   forward:  target id ──► gated node     (wrap is idempotent)
//!   reverse:  node id   ──► target         (calls reach the real receiver)
//! ```
//!
//! Reading a property through a node wraps the result, so the whole object
//! graph reachable from a gated module is gated lazily. Symbol-keyed members
//! and frozen (non-writable, non-configurable) members are returned as-is.
//!
//! Calls and constructs are authorized against the real target's identity,
//! then delegated with the receiver and arguments unwrapped; native methods
//! reject a node as receiver. A write may only store nodes of the same
//! resource, so one capability cannot be smuggled in under another's gate.
//!
//! The arena holds nodes weakly: a node lives as long as the unit holds it,
//! and dead entries are pruned as the arena grows.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use warden_api::CodeHash;

use crate::audit;
use crate::classifier::ResourceRequest;
use crate::trust::{AccessDenied, TrustBroker};
use crate::value::{
    HostError, HostObject, HostResult, ObjectId, ObjectRef, Property, PropertyKey, Value, WeakObjectRef,
};

/// Arena size below which dead entries are left alone
const PRUNE_THRESHOLD: usize = 256;

struct Arena {
    /// target id -> node
    forward: HashMap<ObjectId, WeakObjectRef>,
    /// node id -> node
    reverse: HashMap<ObjectId, WeakObjectRef>,
    prune_at: usize,
}

impl Default for Arena {
    fn default() -> Self {
        Self {
            forward: HashMap::new(),
            reverse: HashMap::new(),
            prune_at: PRUNE_THRESHOLD,
        }
    }
}

impl Arena {
    /// Live node for `id` in `map`; ids of dead entries may have been reused
    fn live(map: &HashMap<ObjectId, WeakObjectRef>, id: ObjectId) -> Option<ObjectRef> {
        map.get(&id).and_then(WeakObjectRef::upgrade)
    }

    fn insert(&mut self, target: &ObjectRef, node: &ObjectRef) {
        self.forward.insert(target.id(), node.downgrade());
        self.reverse.insert(node.id(), node.downgrade());
        if self.forward.len() >= self.prune_at {
            self.forward.retain(|_, node| node.is_live());
            self.reverse.retain(|_, node| node.is_live());
            self.prune_at = (self.forward.len() * 2).max(PRUNE_THRESHOLD);
        }
    }
}

/// Per-unit gate and proxy arena
pub struct CapabilityProxy {
    unit_id: String,
    code_hash: CodeHash,
    broker: Arc<TrustBroker>,
    arena: Mutex<Arena>,
    me: Weak<CapabilityProxy>,
}

impl CapabilityProxy {
    pub fn new(unit_id: impl Into<String>, code_hash: CodeHash, broker: Arc<TrustBroker>) -> Arc<Self> {
        let unit_id = unit_id.into();
        Arc::new_cyclic(|me| Self {
            unit_id,
            code_hash,
            broker,
            arena: Mutex::new(Arena::default()),
            me: me.clone(),
        })
    }

    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    pub fn code_hash(&self) -> &CodeHash {
        &self.code_hash
    }

    pub fn broker(&self) -> &Arc<TrustBroker> {
        &self.broker
    }

    /// Gate `value` under `request`
    ///
    /// Primitives pass through; wrapping the same target twice yields the
    /// same node, and wrapping a node returns it unchanged.
    pub fn wrap(&self, value: Value, request: &ResourceRequest, path: &str) -> Value {
        match value {
            Value::Object(target) => Value::Object(self.wrap_object(target, request, path)),
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, item)| self.wrap(item, request, &format!("{}[{}]", path, i)))
                    .collect(),
            ),
            other => other,
        }
    }

    fn wrap_object(&self, target: ObjectRef, request: &ResourceRequest, path: &str) -> ObjectRef {
        let mut arena = self.arena.lock().unwrap_or_else(|e| e.into_inner());
        if Arena::live(&arena.reverse, target.id()).is_some_and(|node| node.ptr_eq(&target)) {
            return target;
        }
        if let Some(node) = Arena::live(&arena.forward, target.id()) {
            return node;
        }

        let node = ObjectRef::new(GatedObject {
            target: target.clone(),
            request: request.clone(),
            path: path.to_string(),
            gate: self.me.clone(),
        });
        arena.insert(&target, &node);
        node
    }

    /// Replace gated nodes by their real targets
    pub fn unwrap(&self, value: &Value) -> Value {
        match value {
            Value::Object(object) => Value::Object(self.target_of(object).unwrap_or_else(|| object.clone())),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.unwrap(v)).collect()),
            other => other.clone(),
        }
    }

    /// Real target behind a gated node
    pub fn target_of(&self, node: &ObjectRef) -> Option<ObjectRef> {
        if !self.is_gated(node) {
            return None;
        }
        node.downcast_ref::<GatedObject>().map(|n| n.target.clone())
    }

    pub fn is_gated(&self, object: &ObjectRef) -> bool {
        let arena = self.arena.lock().unwrap_or_else(|e| e.into_inner());
        Arena::live(&arena.reverse, object.id()).is_some_and(|node| node.ptr_eq(object))
    }

    /// Number of live gated nodes
    pub fn len(&self) -> usize {
        self.arena
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .forward
            .values()
            .filter(|node| node.is_live())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse to store nodes that belong to another resource or unit
    fn check_storable(&self, value: &Value, request: &ResourceRequest, path: &str) -> HostResult<()> {
        match value {
            Value::Object(object) => match object.downcast_ref::<GatedObject>() {
                Some(node)
                    if !Weak::ptr_eq(&node.gate, &self.me)
                        || node.request.resource_key != request.resource_key =>
                {
                    Err(HostError::type_error(format!(
                        "Cannot store '{}' on '{}': it belongs to another capability",
                        node.path, path
                    )))
                }
                _ => Ok(()),
            },
            Value::Array(items) => items
                .iter()
                .try_for_each(|item| self.check_storable(item, request, path)),
            _ => Ok(()),
        }
    }

    /// Authorize this unit's use of `request` on `target`
    pub fn authorize(&self, request: &ResourceRequest, target: Option<&ObjectRef>) -> Result<(), AccessDenied> {
        self.broker
            .require(&self.unit_id, &self.code_hash, request, target)
    }

    fn gated_call<F>(&self, node: &GatedObject, action: &str, f: F) -> HostResult
    where
        F: FnOnce(&ObjectRef) -> HostResult,
    {
        self.authorize(&node.request, Some(&node.target))?;

        tracing::info!(
            unit = %self.unit_id,
            resource = %node.request.resource_key,
            path = %node.path,
            action,
            "Executing gated capability"
        );
        if let Err(e) = self.broker.audit().record(audit::capability_used(
            &self.unit_id,
            &node.request,
            &node.path,
        )) {
            tracing::warn!(error = %e, "Failed to record audit event");
        }

        let result = f(&node.target)?;
        Ok(self.wrap(result, &node.request, &format!("{}()", node.path)))
    }
}

impl std::fmt::Debug for CapabilityProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityProxy")
            .field("unit_id", &self.unit_id)
            .field("code_hash", &self.code_hash)
            .field("nodes", &self.len())
            .finish()
    }
}

/// Gated stand-in for one host object
struct GatedObject {
    target: ObjectRef,
    request: ResourceRequest,
    path: String,
    gate: Weak<CapabilityProxy>,
}

impl GatedObject {
    fn gate(&self) -> HostResult<Arc<CapabilityProxy>> {
        self.gate
            .upgrade()
            .ok_or_else(|| HostError::Unloaded(self.path.clone()))
    }
}

impl HostObject for GatedObject {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn class_name(&self) -> &str {
        self.target.class_name()
    }

    fn get_own_property(&self, key: &PropertyKey) -> Option<Property> {
        let property = self.target.get_own_property(key)?;
        if key.is_symbol() || property.is_frozen() {
            return Some(property);
        }

        let gate = self.gate().ok()?;
        let path = format!("{}.{}", self.path, key);
        Some(Property {
            value: gate.wrap(property.value, &self.request, &path),
            writable: property.writable,
            configurable: property.configurable,
        })
    }

    fn own_keys(&self) -> Vec<PropertyKey> {
        self.target.own_keys()
    }

    fn set(&self, key: &PropertyKey, value: Value) -> HostResult<()> {
        let gate = self.gate()?;
        gate.authorize(&self.request, Some(&self.target))?;
        gate.check_storable(&value, &self.request, &format!("{}.{}", self.path, key))?;
        self.target.set(key, gate.unwrap(&value))
    }

    fn is_callable(&self) -> bool {
        self.target.is_callable()
    }

    fn call(&self, this: &Value, args: &[Value]) -> HostResult {
        let gate = self.gate()?;
        let this = gate.unwrap(this);
        let args: Vec<Value> = args.iter().map(|a| gate.unwrap(a)).collect();
        gate.gated_call(self, "call", |target| target.call(&this, &args))
    }

    fn is_constructor(&self) -> bool {
        self.target.is_constructor()
    }

    fn construct(&self, args: &[Value]) -> HostResult {
        let gate = self.gate()?;
        let args: Vec<Value> = args.iter().map(|a| gate.unwrap(a)).collect();
        gate.gated_call(self, "construct", |target| target.construct(&args))
    }
}
