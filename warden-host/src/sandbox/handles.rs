//! Guest-visible handle table
//!
//! Handles are small positive integers; `0` is always `undefined`. Objects
//! are interned by identity so the same host object (or proxy) always maps to
//! the same handle while it is live in the table.

use std::collections::HashMap;
use warden_api::HANDLE_UNDEFINED;

use crate::value::{HostError, HostResult, ObjectId, Value};

#[derive(Default)]
pub struct HandleTable {
    slots: Vec<Option<Value>>,
    free: Vec<usize>,
    interned: HashMap<ObjectId, i32>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, value: Value) -> i32 {
        if matches!(value, Value::Undefined) {
            return HANDLE_UNDEFINED;
        }
        if let Value::Object(object) = &value {
            if let Some(handle) = self.interned.get(&object.id()) {
                return *handle;
            }
        }

        let object_id = value.as_object().map(|o| o.id());
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(value);
                index
            }
            None => {
                self.slots.push(Some(value));
                self.slots.len() - 1
            }
        };
        let handle = index as i32 + 1;
        if let Some(id) = object_id {
            self.interned.insert(id, handle);
        }
        handle
    }

    pub fn get(&self, handle: i32) -> HostResult {
        if handle == HANDLE_UNDEFINED {
            return Ok(Value::Undefined);
        }
        self.slot(handle)
            .and_then(|slot| self.slots[slot].clone())
            .ok_or_else(|| HostError::type_error(format!("invalid handle {}", handle)))
    }

    /// Release a handle; releasing `0` or a dead handle is a no-op
    pub fn release(&mut self, handle: i32) {
        let Some(slot) = self.slot(handle) else {
            return;
        };
        if let Some(value) = self.slots[slot].take() {
            if let Value::Object(object) = value {
                self.interned.remove(&object.id());
            }
            self.free.push(slot);
        }
    }

    /// Number of live handles
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, handle: i32) -> Option<usize> {
        if handle <= 0 {
            return None;
        }
        let slot = (handle - 1) as usize;
        (slot < self.slots.len()).then_some(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::NativeObject;

    #[test]
    fn test_undefined_is_zero() {
        let mut table = HandleTable::new();
        assert_eq!(table.insert(Value::Undefined), HANDLE_UNDEFINED);
        assert!(matches!(table.get(0).unwrap(), Value::Undefined));
        assert!(table.is_empty());
    }

    #[test]
    fn test_objects_are_interned() {
        let mut table = HandleTable::new();
        let object = NativeObject::new("Thing").build();

        let a = table.insert(Value::Object(object.clone()));
        let b = table.insert(Value::Object(object.clone()));
        assert_eq!(a, b);

        let other = table.insert(Value::Object(NativeObject::new("Thing").build()));
        assert_ne!(a, other);
    }

    #[test]
    fn test_primitives_get_fresh_handles() {
        let mut table = HandleTable::new();
        let a = table.insert(Value::Number(1.0));
        let b = table.insert(Value::Number(1.0));
        assert_ne!(a, b);
        assert_eq!(table.get(a).unwrap().as_f64(), Some(1.0));
    }

    #[test]
    fn test_release_recycles_slots() {
        let mut table = HandleTable::new();
        let object = NativeObject::new("Thing").build();
        let a = table.insert(Value::Object(object.clone()));
        table.release(a);
        assert!(table.get(a).is_err());

        let b = table.insert(Value::from("x"));
        assert_eq!(a, b);
        let c = table.insert(Value::Object(object));
        assert_ne!(b, c);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_invalid_handles() {
        let mut table = HandleTable::new();
        assert!(table.get(-1).is_err());
        assert!(table.get(42).is_err());
        table.release(42);
    }
}
