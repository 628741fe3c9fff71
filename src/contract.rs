//! A writable facade over an otherwise-immutable view, gated by an
//! allow-list of property names and/or mutation methods.
//!
//! Calling a disallowed method on [`Writable`] directly returns
//! `Err(Violation::Contract)` in strict mode, or logs and swallows the
//! rejection otherwise, leaving the underlying state unchanged either way.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{Result, Violation};
use crate::registry;
use crate::state::View;
use crate::traps;
use crate::value::{Key, Value};

/// A mutation method name, for allow-listing container-level operations
/// that aren't addressed by a single key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Push,
    Pop,
    Shift,
    Unshift,
    Splice,
    Sort,
    Reverse,
    Fill,
    CopyWithin,
    Add,
    Clear,
    Assign,
}

impl std::str::FromStr for Method {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        Ok(match s {
            "push" => Method::Push,
            "pop" => Method::Pop,
            "shift" => Method::Shift,
            "unshift" => Method::Unshift,
            "splice" => Method::Splice,
            "sort" => Method::Sort,
            "reverse" => Method::Reverse,
            "fill" => Method::Fill,
            "copyWithin" | "copy_within" => Method::CopyWithin,
            "add" => Method::Add,
            "clear" => Method::Clear,
            "assign" => Method::Assign,
            _ => return Err(()),
        })
    }
}

/// The set of keys and/or mutation methods a [`Writable`] facade permits.
/// `None` (the absence of an allow-list entirely, distinct from an empty
/// one) unlocks every write, equivalent to unlocking the immutable base
/// view entirely.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    keys: HashSet<Key>,
    methods: HashSet<Method>,
}

impl AllowList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(mut self, key: impl Into<Key>) -> Self {
        self.keys.insert(key.into());
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.methods.insert(method);
        self
    }

    fn allows_key(&self, key: &Key) -> bool {
        self.keys.contains(key)
    }

    fn allows_method(&self, method: Method) -> bool {
        self.methods.contains(&method)
    }
}

/// A write-facade over an immutable [`View`]. Reads pass straight through
/// to the underlying state; writes are checked against `allow` before
/// being authorized past the base view's immutable flag.
#[derive(Clone)]
pub struct Writable {
    base: View,
    allow: Option<Arc<AllowList>>,
}

impl std::fmt::Debug for Writable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writable")
            .field("base", &self.base)
            .field("gated", &self.allow.is_some())
            .finish()
    }
}

/// Build a write-facade over `view`. With `allow_list: None`, every write
/// that would otherwise be rejected only by the base view's immutable flag
/// now passes; the contract unlocks the immutable. With `Some(list)`, only
/// the keys/methods it names pass; everything else is rejected with
/// `Violation::Contract` (escalated to `Err` in strict mode, logged and
/// swallowed otherwise).
pub fn writable(view: View, allow_list: Option<AllowList>) -> Writable {
    Writable {
        base: view,
        allow: allow_list.map(Arc::new),
    }
}

impl Writable {
    pub fn view(&self) -> View {
        self.base
    }

    fn strict(&self) -> bool {
        registry::meta(self.base.id()).options.strict
    }

    /// Check a key-gated write. `Ok(true)` means proceed; `Ok(false)` means
    /// the violation was logged and swallowed (non-strict); `Err` escalates
    /// (strict). Never lets a rejected write reach the trap layer, so a
    /// rejected write always leaves state unchanged regardless of mode.
    fn authorize_key(&self, key: &Key) -> Result<bool> {
        match &self.allow {
            None => Ok(true),
            Some(list) if list.allows_key(key) => Ok(true),
            Some(_) => {
                let violation = Violation::Contract { key: key.clone() };
                tracing::warn!(error = %violation, "write-contract violation");
                if self.strict() {
                    Err(violation)
                } else {
                    Ok(false)
                }
            }
        }
    }

    fn authorize_method(&self, method: Method) -> Result<bool> {
        match &self.allow {
            None => Ok(true),
            Some(list) if list.allows_method(method) => Ok(true),
            Some(_) => {
                let violation = Violation::Contract { key: Key::Index(0) };
                tracing::warn!(error = %violation, "write-contract violation");
                if self.strict() {
                    Err(violation)
                } else {
                    Ok(false)
                }
            }
        }
    }

    pub fn get(&self, key: impl Into<Key>) -> Option<Value> {
        self.base.get(key)
    }

    pub fn set(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        let key = key.into();
        if !self.authorize_key(&key)? {
            return Ok(());
        }
        traps::set(self.base.id(), key, value.into(), true)
    }

    pub fn delete(&self, key: impl Into<Key>) -> Result<()> {
        let key = key.into();
        if !self.authorize_key(&key)? {
            return Ok(());
        }
        traps::delete(self.base.id(), key, true)
    }

    pub fn push(&self, items: Vec<Value>) -> Result<()> {
        if !self.authorize_method(Method::Push)? {
            return Ok(());
        }
        traps::push(self.base.id(), items, true)
    }

    pub fn pop(&self) -> Result<Option<Value>> {
        if !self.authorize_method(Method::Pop)? {
            return Ok(None);
        }
        traps::pop(self.base.id(), true)
    }

    pub fn shift(&self) -> Result<Option<Value>> {
        if !self.authorize_method(Method::Shift)? {
            return Ok(None);
        }
        traps::shift(self.base.id(), true)
    }

    pub fn unshift(&self, items: Vec<Value>) -> Result<()> {
        if !self.authorize_method(Method::Unshift)? {
            return Ok(());
        }
        traps::unshift(self.base.id(), items, true)
    }

    pub fn splice(&self, start: usize, delete_count: usize, inserted: Vec<Value>) -> Result<Vec<Value>> {
        if !self.authorize_method(Method::Splice)? {
            return Ok(Vec::new());
        }
        traps::splice(self.base.id(), start, delete_count, inserted, true)
    }

    pub fn sort_by(&self, compare: impl Fn(&Value, &Value) -> std::cmp::Ordering) -> Result<()> {
        if !self.authorize_method(Method::Sort)? {
            return Ok(());
        }
        traps::sort_by(self.base.id(), compare, true)
    }

    pub fn reverse(&self) -> Result<()> {
        if !self.authorize_method(Method::Reverse)? {
            return Ok(());
        }
        traps::reverse(self.base.id(), true)
    }

    pub fn fill(&self, value: Value, start: usize, end: usize) -> Result<()> {
        if !self.authorize_method(Method::Fill)? {
            return Ok(());
        }
        traps::fill(self.base.id(), value, start, end, true)
    }

    pub fn copy_within(&self, target: usize, start: usize, end: usize) -> Result<()> {
        if !self.authorize_method(Method::CopyWithin)? {
            return Ok(());
        }
        traps::copy_within(self.base.id(), target, start, end, true)
    }

    pub fn add(&self, value: Value) -> Result<()> {
        if !self.authorize_method(Method::Add)? {
            return Ok(());
        }
        traps::set_add(self.base.id(), value, true)
    }

    pub fn clear(&self) -> Result<()> {
        if !self.authorize_method(Method::Clear)? {
            return Ok(());
        }
        traps::clear(self.base.id(), true)
    }

    pub fn assign(&self, entries: indexmap::IndexMap<Key, Value>) -> Result<()> {
        if !self.authorize_method(Method::Assign)? {
            return Ok(());
        }
        traps::assign(self.base.id(), entries, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::WrapOptions;
    use crate::state::immutable;
    use crate::value::RawValue;
    use indexmap::IndexMap;

    fn base_object() -> View {
        immutable(
            RawValue::Object(IndexMap::from([
                (Arc::<str>::from("a"), Value::Num(1.0)),
                (Arc::<str>::from("b"), Value::Num(2.0)),
            ])),
            WrapOptions::default(),
        )
    }

    #[test]
    fn no_allow_list_unlocks_every_write() {
        let imm = base_object();
        let w = writable(imm, None);
        w.set("a", 10.0).unwrap();
        assert_eq!(imm.get("a"), Some(Value::Num(10.0)));
    }

    #[test]
    fn allow_listed_key_passes_others_rejected() {
        let imm = base_object();
        let w = writable(imm, Some(AllowList::new().key("a")));

        w.set("a", 10.0).unwrap();
        assert_eq!(imm.get("a"), Some(Value::Num(10.0)));

        w.set("b", 20.0).unwrap();
        assert_eq!(imm.get("b"), Some(Value::Num(2.0)));
    }

    #[test]
    fn strict_contract_violation_escalates() {
        let imm = immutable(
            RawValue::Object(IndexMap::from([(Arc::<str>::from("a"), Value::Num(1.0))])),
            WrapOptions::default().strict(true),
        );
        let w = writable(imm, Some(AllowList::new().key("a")));
        assert!(matches!(w.set("b", 1.0), Err(Violation::Contract { .. })));
    }

    #[test]
    fn disallowed_method_is_rejected_and_state_unchanged() {
        let imm = immutable(RawValue::Array(vec![Value::Num(1.0)]), WrapOptions::default());
        let w = writable(imm, Some(AllowList::new().method(Method::Push)));

        w.pop().unwrap();
        assert_eq!(imm.len(), 1);

        w.push(vec![Value::Num(2.0)]).unwrap();
        assert_eq!(imm.len(), 2);
    }
}
