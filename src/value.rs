//! The dynamic value model: raw containers, slots, and keys.
//!
//! Records, arrays, sets and maps are dynamically typed, so the raw value
//! is modeled as a small tagged enum (`Value`), the same trick `serde_json`
//! uses for "any JSON value", rather than forcing every container through
//! a generic `View<T>`. Nested containers are represented as a back-reference
//! (`Value::Child`) to another registered state, resolved lazily on first
//! read (see `traps.rs`).

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};

use crate::registry::StateId;

/// A key into an object, array, map, or set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    /// Array index.
    Index(usize),
    /// Object property name.
    Name(Arc<str>),
    /// Map key or set member, addressed by value rather than position.
    Entry(Value),
    /// No specific slot — the state as a whole, used by events that
    /// precede any mutation (a subscriber's initial call) rather than any
    /// real index, name, or entry.
    Root,
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Name(Arc::from(s))
    }
}

impl From<usize> for Key {
    fn from(i: usize) -> Self {
        Key::Index(i)
    }
}

/// A dynamically-typed leaf or child-reference value.
///
/// Numbers are unified into a single `f64`-backed variant, mirroring the
/// single numeric type of the dynamic language this runtime's data model is
/// drawn from; equality and hashing compare bit patterns so `Value` can sit
/// inside `IndexSet`/`IndexMap` keys (needed for `Set`/`Map` containers).
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Num(f64),
    Str(Arc<str>),
    /// A nested container that has been wrapped into its own reactive state.
    Child(StateId),
    /// A nested container that has not yet been lazily wrapped.
    Unwrapped(Arc<RawValue>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Num(a), Value::Num(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Child(a), Value::Child(b)) => a == b,
            (Value::Unwrapped(a), Value::Unwrapped(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}
impl Eq for Value {}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Num(n) => n.to_bits().hash(state),
            Value::Str(s) => s.hash(state),
            Value::Child(id) => id.hash(state),
            Value::Unwrapped(arc) => (Arc::as_ptr(arc) as usize).hash(state),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}
impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Num(n)
    }
}
impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Num(n as f64)
    }
}
impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(Arc::from(s))
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Arc::from(s.as_str()))
    }
}

/// Which container kind a given state wraps.
///
/// Fixed at construction time; a state never changes kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    Object,
    Array,
    Map,
    Set,
}

/// The underlying plain container a reactive state wraps.
///
/// Never exposed directly outside the crate except via `snapshot`/`stringify`,
/// which walk it with the raw accessors below instead of going through the
/// tracked trap path.
#[derive(Debug, Clone)]
pub enum RawValue {
    Object(IndexMap<Arc<str>, Value>),
    Array(Vec<Value>),
    Map(IndexMap<Value, Value>),
    Set(IndexSet<Value>),
}

impl RawValue {
    pub fn kind(&self) -> ViewKind {
        match self {
            RawValue::Object(_) => ViewKind::Object,
            RawValue::Array(_) => ViewKind::Array,
            RawValue::Map(_) => ViewKind::Map,
            RawValue::Set(_) => ViewKind::Set,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RawValue::Object(m) => m.len(),
            RawValue::Array(a) => a.len(),
            RawValue::Map(m) => m.len(),
            RawValue::Set(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<IndexMap<Arc<str>, Value>> for RawValue {
    fn from(m: IndexMap<Arc<str>, Value>) -> Self {
        RawValue::Object(m)
    }
}
impl From<Vec<Value>> for RawValue {
    fn from(v: Vec<Value>) -> Self {
        RawValue::Array(v)
    }
}
impl From<IndexMap<Value, Value>> for RawValue {
    fn from(m: IndexMap<Value, Value>) -> Self {
        RawValue::Map(m)
    }
}
impl From<IndexSet<Value>> for RawValue {
    fn from(s: IndexSet<Value>) -> Self {
        RawValue::Set(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_equality_is_by_bit_pattern_for_numbers() {
        assert_eq!(Value::Num(1.0), Value::Num(1.0));
        assert_ne!(Value::Num(1.0), Value::Num(2.0));
    }

    #[test]
    fn key_from_str_and_usize() {
        assert_eq!(Key::from("a"), Key::Name(Arc::from("a")));
        assert_eq!(Key::from(3usize), Key::Index(3));
    }

    #[test]
    fn raw_value_kind() {
        let obj = RawValue::Object(IndexMap::new());
        assert_eq!(obj.kind(), ViewKind::Object);
    }
}
