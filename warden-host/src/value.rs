//! Host object model
//!
//! Everything a sandboxed unit can touch on the host side is a [`Value`].
//! Objects are reference types behind [`ObjectRef`]; two references are the
//! same object exactly when they point at the same allocation, which is what
//! the capability proxy and the guest handle table key on.
//!
//! Objects expose JavaScript-like property descriptors (`writable`,
//! `configurable`) because the proxy must return frozen members untouched.

use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, RwLock, Weak};
use thiserror::Error;

use crate::trust::AccessDenied;

/// Result of any host-side operation reachable from a guest
pub type HostResult<T = Value> = Result<T, HostError>;

/// Errors thrown into sandboxed code by host objects
#[derive(Debug, Clone, Error)]
pub enum HostError {
    #[error(transparent)]
    AccessDenied(#[from] AccessDenied),

    #[error("TypeError: {0}")]
    Type(String),

    #[error("Cannot find module '{0}'")]
    ModuleNotFound(String),

    #[error("{code}: {message}")]
    Io { code: &'static str, message: String },

    #[error("'{0}' is no longer available: its code unit was unloaded")]
    Unloaded(String),

    #[error("{0}")]
    Failed(String),
}

impl HostError {
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::Type(message.into())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Native method invoked on something other than its own branded object
    pub fn incompatible_receiver(method: &str, brand: &str, this: &Value) -> Self {
        Self::Type(format!(
            "Method {}.{} called on incompatible receiver {}",
            brand,
            method,
            this.describe()
        ))
    }

    /// Whether this error is an authorization refusal
    pub fn is_access_denied(&self) -> bool {
        matches!(self, Self::AccessDenied(_))
    }
}

impl From<std::io::Error> for HostError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let code = match err.kind() {
            ErrorKind::NotFound => "ENOENT",
            ErrorKind::PermissionDenied => "EACCES",
            ErrorKind::AlreadyExists => "EEXIST",
            ErrorKind::InvalidInput => "EINVAL",
            _ => "EIO",
        };
        Self::Io {
            code,
            message: err.to_string(),
        }
    }
}

/// Well-known symbols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Symbol {
    ToStringTag,
    Iterator,
    Inspect,
}

impl Symbol {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ToStringTag => "@@toStringTag",
            Self::Iterator => "@@iterator",
            Self::Inspect => "@@inspect",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "@@toStringTag" => Some(Self::ToStringTag),
            "@@iterator" => Some(Self::Iterator),
            "@@inspect" => Some(Self::Inspect),
            _ => None,
        }
    }
}

/// Property key: a plain name or a well-known symbol
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PropertyKey {
    Name(String),
    Symbol(Symbol),
}

impl PropertyKey {
    /// Parse a guest-supplied key; `@@name` spells a well-known symbol
    pub fn parse(raw: &str) -> Self {
        match Symbol::parse(raw) {
            Some(symbol) => Self::Symbol(symbol),
            None => Self::Name(raw.to_string()),
        }
    }

    pub fn is_symbol(&self) -> bool {
        matches!(self, Self::Symbol(_))
    }

    pub fn as_name(&self) -> Option<&str> {
        match self {
            Self::Name(name) => Some(name),
            Self::Symbol(_) => None,
        }
    }
}

impl From<&str> for PropertyKey {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl From<Symbol> for PropertyKey {
    fn from(symbol: Symbol) -> Self {
        Self::Symbol(symbol)
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => f.write_str(name),
            Self::Symbol(symbol) => f.write_str(symbol.name()),
        }
    }
}

/// Own data property with its descriptor flags
#[derive(Debug, Clone)]
pub struct Property {
    pub value: Value,
    pub writable: bool,
    pub configurable: bool,
}

impl Property {
    /// Ordinary writable, configurable property
    pub fn data(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            writable: true,
            configurable: true,
        }
    }

    /// Non-writable, non-configurable property
    pub fn frozen(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            writable: false,
            configurable: false,
        }
    }

    pub fn is_frozen(&self) -> bool {
        !self.writable && !self.configurable
    }
}

/// Identity of an object allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(usize);

/// Any host object reachable from sandboxed code
pub trait HostObject: Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn class_name(&self) -> &str;

    fn get_own_property(&self, key: &PropertyKey) -> Option<Property>;

    fn own_keys(&self) -> Vec<PropertyKey>;

    fn set(&self, key: &PropertyKey, value: Value) -> HostResult<()> {
        let _ = value;
        Err(HostError::type_error(format!(
            "Cannot assign to property '{}' of {}",
            key,
            self.class_name()
        )))
    }

    fn is_callable(&self) -> bool {
        false
    }

    fn call(&self, this: &Value, args: &[Value]) -> HostResult {
        let _ = (this, args);
        Err(HostError::type_error(format!(
            "{} is not a function",
            self.class_name()
        )))
    }

    fn is_constructor(&self) -> bool {
        false
    }

    fn construct(&self, args: &[Value]) -> HostResult {
        let _ = args;
        Err(HostError::type_error(format!(
            "{} is not a constructor",
            self.class_name()
        )))
    }
}

/// Shared reference to a host object
#[derive(Clone)]
pub struct ObjectRef(Arc<dyn HostObject>);

impl ObjectRef {
    pub fn new(object: impl HostObject + 'static) -> Self {
        Self(Arc::new(object))
    }

    pub fn from_arc(object: Arc<dyn HostObject>) -> Self {
        Self(object)
    }

    pub fn id(&self) -> ObjectId {
        ObjectId(Arc::as_ptr(&self.0) as *const () as usize)
    }

    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        self.id() == other.id()
    }

    /// Reference that does not keep the object alive
    pub fn downgrade(&self) -> WeakObjectRef {
        WeakObjectRef(Arc::downgrade(&self.0))
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }

    /// Own property value, or `undefined`
    pub fn get(&self, key: impl Into<PropertyKey>) -> Value {
        self.0
            .get_own_property(&key.into())
            .map(|p| p.value)
            .unwrap_or_default()
    }
}

impl Deref for ObjectRef {
    type Target = dyn HostObject;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

/// Non-owning [`ObjectRef`]
#[derive(Clone)]
pub struct WeakObjectRef(Weak<dyn HostObject>);

impl WeakObjectRef {
    pub fn upgrade(&self) -> Option<ObjectRef> {
        self.0.upgrade().map(ObjectRef)
    }

    pub fn is_live(&self) -> bool {
        self.0.strong_count() > 0
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[object {}]", self.0.class_name())
    }
}

/// Any value crossing the host/guest boundary
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Object(ObjectRef),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Self::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Self::Undefined | Self::Null)
    }

    /// JavaScript-style truthiness
    pub fn truthy(&self) -> bool {
        match self {
            Self::Undefined | Self::Null => false,
            Self::Bool(b) => *b,
            Self::Number(n) => *n != 0.0 && !n.is_nan(),
            Self::String(s) => !s.is_empty(),
            Self::Bytes(_) | Self::Array(_) | Self::Object(_) => true,
        }
    }

    /// Type tag as reported to guests
    pub fn kind(&self) -> i32 {
        use warden_api::kind;
        match self {
            Self::Undefined => kind::UNDEFINED,
            Self::Null => kind::NULL,
            Self::Bool(_) => kind::BOOL,
            Self::Number(_) => kind::NUMBER,
            Self::String(_) => kind::STRING,
            Self::Bytes(_) => kind::BYTES,
            Self::Array(_) => kind::ARRAY,
            Self::Object(o) if o.is_callable() => kind::FUNCTION,
            Self::Object(_) => kind::OBJECT,
        }
    }

    /// Short description used in error messages
    pub fn describe(&self) -> String {
        match self {
            Self::Undefined => "undefined".into(),
            Self::Null => "null".into(),
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => n.to_string(),
            Self::String(_) => "string".into(),
            Self::Bytes(_) => "bytes".into(),
            Self::Array(_) => "array".into(),
            Self::Object(o) => format!("#<{}>", o.class_name()),
        }
    }

    /// Reference equality for objects, value equality otherwise
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Object(a), Self::Object(b)) => a.ptr_eq(b),
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            _ => false,
        }
    }

    /// Convert to JSON for remote callers
    ///
    /// Objects contribute their named own properties; functions and cycles
    /// beyond a small depth become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        self.to_json_depth(8)
    }

    fn to_json_depth(&self, depth: usize) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Self::Undefined | Self::Null => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Self::String(s) => Json::String(s.clone()),
            Self::Bytes(b) => Json::Array(b.iter().map(|x| Json::from(*x)).collect()),
            Self::Array(items) if depth > 0 => Json::Array(
                items
                    .iter()
                    .map(|v| v.to_json_depth(depth - 1))
                    .collect(),
            ),
            Self::Object(o) if depth > 0 && !o.is_callable() => {
                let mut map = serde_json::Map::new();
                for key in o.own_keys() {
                    if let PropertyKey::Name(name) = &key {
                        if let Some(prop) = o.get_own_property(&key) {
                            map.insert(name.clone(), prop.value.to_json_depth(depth - 1));
                        }
                    }
                }
                Json::Object(map)
            }
            _ => Json::Null,
        }
    }

    /// Build a value from JSON; objects become plain host objects
    pub fn from_json(json: &serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Null => Self::Null,
            Json::Bool(b) => Self::Bool(*b),
            Json::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            Json::String(s) => Self::String(s.clone()),
            Json::Array(items) => Self::Array(items.iter().map(Self::from_json).collect()),
            Json::Object(map) => {
                let mut object = NativeObject::new("Object");
                for (key, value) in map {
                    object = object.value(key.as_str(), Self::from_json(value));
                }
                Self::Object(object.build())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<ObjectRef> for Value {
    fn from(object: ObjectRef) -> Self {
        Self::Object(object)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::Array(items)
    }
}

// ============================================================================
// Native objects and functions
// ============================================================================

/// Plain host object with a brand and optional native state
///
/// The brand is what native methods check their receiver against.
pub struct NativeObject {
    brand: &'static str,
    props: RwLock<Vec<(PropertyKey, Property)>>,
    extensible: bool,
    state: Box<dyn Any + Send + Sync>,
}

impl NativeObject {
    pub fn new(brand: &'static str) -> Self {
        Self::with_state(brand, ())
    }

    pub fn with_state<T: Any + Send + Sync>(brand: &'static str, state: T) -> Self {
        Self {
            brand,
            props: RwLock::new(Vec::new()),
            extensible: true,
            state: Box::new(state),
        }
    }

    pub fn brand(&self) -> &'static str {
        self.brand
    }

    pub fn state<T: 'static>(&self) -> Option<&T> {
        self.state.downcast_ref::<T>()
    }

    fn insert(self, key: PropertyKey, property: Property) -> Self {
        {
            let mut props = self.props.write().unwrap_or_else(|e| e.into_inner());
            props.retain(|(k, _)| k != &key);
            props.push((key, property));
        }
        self
    }

    /// Add a writable, configurable property
    pub fn value(self, key: impl Into<PropertyKey>, value: impl Into<Value>) -> Self {
        self.insert(key.into(), Property::data(value))
    }

    /// Add a non-writable, non-configurable property
    pub fn frozen(self, key: impl Into<PropertyKey>, value: impl Into<Value>) -> Self {
        self.insert(key.into(), Property::frozen(value))
    }

    /// Add a native method that only accepts this object's brand as receiver
    pub fn method<F>(self, name: &str, f: F) -> Self
    where
        F: Fn(&NativeObject, &[Value]) -> HostResult + Send + Sync + 'static,
    {
        let function = NativeFunction::method(name, self.brand, f);
        self.value(name, function.into_ref())
    }

    /// Add a function that ignores its receiver
    pub fn function<F>(self, name: &str, f: F) -> Self
    where
        F: Fn(&[Value]) -> HostResult + Send + Sync + 'static,
    {
        let function = NativeFunction::new(name, move |_this, args| f(args));
        self.value(name, function.into_ref())
    }

    /// Make every property read-only and refuse new ones
    ///
    /// Properties stay configurable, so a gate still wraps them.
    pub fn sealed(mut self) -> Self {
        {
            let mut props = self.props.write().unwrap_or_else(|e| e.into_inner());
            for (_, prop) in props.iter_mut() {
                prop.writable = false;
            }
        }
        self.extensible = false;
        self
    }

    pub fn build(self) -> ObjectRef {
        ObjectRef::new(self)
    }
}

impl HostObject for NativeObject {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn class_name(&self) -> &str {
        self.brand
    }

    fn get_own_property(&self, key: &PropertyKey) -> Option<Property> {
        let props = self.props.read().unwrap_or_else(|e| e.into_inner());
        props.iter().find(|(k, _)| k == key).map(|(_, p)| p.clone())
    }

    fn own_keys(&self) -> Vec<PropertyKey> {
        let props = self.props.read().unwrap_or_else(|e| e.into_inner());
        props.iter().map(|(k, _)| k.clone()).collect()
    }

    fn set(&self, key: &PropertyKey, value: Value) -> HostResult<()> {
        let mut props = self.props.write().unwrap_or_else(|e| e.into_inner());
        match props.iter_mut().find(|(k, _)| k == key) {
            Some((_, prop)) if !prop.writable => Err(HostError::type_error(format!(
                "Cannot assign to read only property '{}' of {}",
                key, self.brand
            ))),
            Some((_, prop)) => {
                prop.value = value;
                Ok(())
            }
            None if !self.extensible => Err(HostError::type_error(format!(
                "Cannot add property {}, {} is not extensible",
                key, self.brand
            ))),
            None => {
                props.push((key.clone(), Property::data(value)));
                Ok(())
            }
        }
    }
}

type CallFn = dyn Fn(&Value, &[Value]) -> HostResult + Send + Sync;
type ConstructFn = dyn Fn(&[Value]) -> HostResult + Send + Sync;

/// Native function object
pub struct NativeFunction {
    name: String,
    call: Option<Box<CallFn>>,
    construct: Option<Box<ConstructFn>>,
}

impl NativeFunction {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value, &[Value]) -> HostResult + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            call: Some(Box::new(f)),
            construct: None,
        }
    }

    /// Native method with a receiver brand check
    ///
    /// Fails with "incompatible receiver" unless `this` is the real branded
    /// object, exactly as engine-native methods reject foreign receivers.
    pub fn method<F>(name: impl Into<String>, brand: &'static str, f: F) -> Self
    where
        F: Fn(&NativeObject, &[Value]) -> HostResult + Send + Sync + 'static,
    {
        let name = name.into();
        let method_name = name.clone();
        Self::new(name, move |this, args| {
            let receiver = this
                .as_object()
                .and_then(|o| o.downcast_ref::<NativeObject>())
                .filter(|o| o.brand() == brand)
                .ok_or_else(|| HostError::incompatible_receiver(&method_name, brand, this))?;
            f(receiver, args)
        })
    }

    /// Constructor-only function
    pub fn constructor<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[Value]) -> HostResult + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            call: None,
            construct: Some(Box::new(f)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn into_ref(self) -> ObjectRef {
        ObjectRef::new(self)
    }
}

impl HostObject for NativeFunction {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn class_name(&self) -> &str {
        "Function"
    }

    fn get_own_property(&self, key: &PropertyKey) -> Option<Property> {
        match key.as_name() {
            Some("name") => Some(Property {
                value: Value::String(self.name.clone()),
                writable: false,
                configurable: true,
            }),
            _ => None,
        }
    }

    fn own_keys(&self) -> Vec<PropertyKey> {
        vec![PropertyKey::Name("name".into())]
    }

    fn is_callable(&self) -> bool {
        self.call.is_some()
    }

    fn call(&self, this: &Value, args: &[Value]) -> HostResult {
        match &self.call {
            Some(f) => f(this, args),
            None => Err(HostError::type_error(format!(
                "Class constructor {} cannot be invoked without 'new'",
                self.name
            ))),
        }
    }

    fn is_constructor(&self) -> bool {
        self.construct.is_some()
    }

    fn construct(&self, args: &[Value]) -> HostResult {
        match &self.construct {
            Some(f) => f(args),
            None => Err(HostError::type_error(format!(
                "{} is not a constructor",
                self.name
            ))),
        }
    }
}

// ============================================================================
// Argument helpers
// ============================================================================

/// String argument at `index`
pub fn string_arg<'a>(args: &'a [Value], index: usize, function: &str) -> HostResult<&'a str> {
    args.get(index).and_then(Value::as_str).ok_or_else(|| {
        HostError::type_error(format!(
            "{}: argument {} must be a string",
            function,
            index + 1
        ))
    })
}

/// Numeric argument at `index`, or `default` when absent
pub fn number_arg(args: &[Value], index: usize, default: f64) -> f64 {
    args.get(index).and_then(Value::as_f64).unwrap_or(default)
}

/// Binary payload argument; strings are taken as UTF-8
pub fn bytes_arg(args: &[Value], index: usize, function: &str) -> HostResult<Vec<u8>> {
    match args.get(index) {
        Some(Value::Bytes(b)) => Ok(b.clone()),
        Some(Value::String(s)) => Ok(s.as_bytes().to_vec()),
        _ => Err(HostError::type_error(format!(
            "{}: argument {} must be a string or bytes",
            function,
            index + 1
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_identity() {
        let a = NativeObject::new("Thing").build();
        let b = a.clone();
        let c = NativeObject::new("Thing").build();

        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
        assert!(Value::Object(a).same(&Value::Object(b)));
    }

    #[test]
    fn test_frozen_property_rejects_writes() {
        let obj = NativeObject::new("Consts").frozen("F_OK", 0.0).build();

        let prop = obj.get_own_property(&"F_OK".into()).unwrap();
        assert!(prop.is_frozen());
        assert!(obj.set(&"F_OK".into(), Value::Number(1.0)).is_err());
    }

    #[test]
    fn test_sealed_object_rejects_writes_and_additions() {
        let obj = NativeObject::new("Fs")
            .function("read", |_args| Ok(Value::Undefined))
            .sealed()
            .build();

        let prop = obj.get_own_property(&"read".into()).unwrap();
        assert!(!prop.writable);
        assert!(!prop.is_frozen());
        assert!(obj.set(&"read".into(), Value::Null).is_err());
        assert!(obj.set(&"extra".into(), Value::Null).is_err());
        assert!(matches!(obj.get("extra"), Value::Undefined));
    }

    #[test]
    fn test_weak_reference_does_not_keep_object_alive() {
        let obj = NativeObject::new("Thing").build();
        let weak = obj.downgrade();
        assert!(weak.upgrade().unwrap().ptr_eq(&obj));

        drop(obj);
        assert!(!weak.is_live());
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_method_checks_receiver_brand() {
        let obj = NativeObject::new("Counter")
            .method("answer", |_recv, _args| Ok(Value::Number(42.0)))
            .build();
        let method = obj.get("answer");
        let method = method.as_object().unwrap();

        let ok = method.call(&Value::Object(obj.clone()), &[]).unwrap();
        assert_eq!(ok.as_f64(), Some(42.0));

        let other = NativeObject::new("Other").build();
        let err = method.call(&Value::Object(other), &[]).unwrap_err();
        assert!(err.to_string().contains("incompatible receiver"));
    }

    #[test]
    fn test_symbol_keys_parse() {
        assert!(PropertyKey::parse("@@toStringTag").is_symbol());
        assert!(!PropertyKey::parse("toString").is_symbol());
    }

    #[test]
    fn test_json_conversion() {
        let json = serde_json::json!({"name": "x", "size": 3, "tags": ["a"]});
        let value = Value::from_json(&json);
        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn test_io_error_codes() {
        let err: HostError = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert!(err.to_string().starts_with("ENOENT"));
    }
}
