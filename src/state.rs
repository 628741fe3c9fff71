//! State constructors: the public entry points that wrap a raw value and
//! the `View` handle returned to callers.
//!
//! `View` is a `Copy` ID-handle over the global registry, with `.get()`/
//! `.set()` dispatching through `registry`/`traps` rather than holding data
//! directly — the registry is type-erased at the `RawValue` boundary
//! instead of per-state, since a reactive container holds heterogeneous
//! slots rather than one value.

use std::cmp::Ordering;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};

use crate::error::{Result, ResultExt, Violation};
use crate::link;
use crate::options::WrapOptions;
use crate::registry::{self, StateId};
use crate::traps;
use crate::value::{Key, RawValue, Value, ViewKind};

/// A reactive handle over a registered state.
///
/// `Copy`: cloning a `View` never clones the underlying container, only the
/// opaque identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct View {
    id: StateId,
    kind: ViewKind,
}

impl View {
    pub(crate) fn from_id(id: StateId) -> Self {
        let kind = registry::meta(id).kind;
        Self { id, kind }
    }

    pub fn id(&self) -> StateId {
        self.id
    }

    /// The reactive view of the child container at `key`, if that slot
    /// holds one. Wraps a not-yet-reactive child lazily, the same as
    /// `get` does, so a freshly-read nested record, array, set or map is
    /// immediately subscribable and mutable through the returned `View`.
    /// Returns `None` for a missing slot, a leaf value, or (on a `flat`
    /// view) a child that was deliberately left unwrapped.
    pub fn child(&self, key: impl Into<Key>) -> Option<View> {
        match self.get(key)? {
            Value::Child(id) => Some(View::from_id(id)),
            _ => None,
        }
    }

    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    pub fn is_immutable(&self) -> bool {
        registry::meta(self.id)
            .immutable
            .load(std::sync::atomic::Ordering::Acquire)
    }

    /// Read the value at `key`, recording the read against the ambient
    /// observer if the state is observable.
    pub fn get(&self, key: impl Into<Key>) -> Option<Value> {
        traps::get(self.id, &key.into())
    }

    /// Write `value` at `key`. Rejected with `Violation::ReadOnly` on an
    /// immutable view in strict mode; otherwise the rejection is logged and
    /// swallowed.
    pub fn set(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        let meta = registry::meta(self.id);
        let strict = meta.options.strict;
        traps::set(self.id, key.into(), value.into(), false)
            .recover(strict)
            .map(|_| ())
    }

    /// Delete the value at `key`. A no-op if the key is absent.
    pub fn delete(&self, key: impl Into<Key>) -> Result<()> {
        let meta = registry::meta(self.id);
        let strict = meta.options.strict;
        traps::delete(self.id, key.into(), false)
            .recover(strict)
            .map(|_| ())
    }

    pub fn len(&self) -> usize {
        registry::meta(self.id).raw.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has(&self, key: &Value) -> bool {
        traps::has(self.id, key)
    }

    pub fn push(&self, items: Vec<Value>) -> Result<()> {
        traps::push(self.id, items, false)
    }

    pub fn pop(&self) -> Result<Option<Value>> {
        traps::pop(self.id, false)
    }

    pub fn shift(&self) -> Result<Option<Value>> {
        traps::shift(self.id, false)
    }

    pub fn unshift(&self, items: Vec<Value>) -> Result<()> {
        traps::unshift(self.id, items, false)
    }

    pub fn splice(&self, start: usize, delete_count: usize, inserted: Vec<Value>) -> Result<Vec<Value>> {
        traps::splice(self.id, start, delete_count, inserted, false)
    }

    pub fn sort_by(&self, compare: impl Fn(&Value, &Value) -> Ordering) -> Result<()> {
        traps::sort_by(self.id, compare, false)
    }

    pub fn reverse(&self) -> Result<()> {
        traps::reverse(self.id, false)
    }

    pub fn fill(&self, value: Value, start: usize, end: usize) -> Result<()> {
        traps::fill(self.id, value, start, end, false)
    }

    pub fn copy_within(&self, target: usize, start: usize, end: usize) -> Result<()> {
        traps::copy_within(self.id, target, start, end, false)
    }

    pub fn add(&self, value: Value) -> Result<()> {
        traps::set_add(self.id, value, false)
    }

    pub fn clear(&self) -> Result<()> {
        traps::clear(self.id, false)
    }

    pub fn assign(&self, entries: IndexMap<Key, Value>) -> Result<()> {
        traps::assign(self.id, entries, false)
    }

    /// Detach every subscriber and parent/child back-edge, then drop this
    /// state's metadata entirely. Does not cascade: a child left with no
    /// other parent is not destroyed in turn, only made a candidate for it.
    pub fn destroy(&self) {
        link::unlink_all(self.id);
        registry::remove(self.id);
    }
}

impl TryFrom<StateId> for View {
    type Error = Violation;

    /// Reconstitute a `View` from an id obtained elsewhere, e.g. a
    /// `ChangeEvent::origin` kept past the event it arrived on. Fails if
    /// the state has since been destroyed.
    fn try_from(id: StateId) -> Result<Self> {
        registry::try_meta(id)
            .map(|meta| Self { id, kind: meta.kind })
            .ok_or(Violation::TrapMisuse(id))
    }
}

/// Wrap a raw container as a reactive view.
///
/// Wrapping a non-container is impossible in this crate's type system
/// (`Into<RawValue>` is only implemented for the four container kinds), so
/// attempting to wrap a bare primitive is a compile error rather than a
/// runtime `Violation::Init`.
pub fn wrap(raw: impl Into<RawValue>, options: WrapOptions) -> View {
    let raw = raw.into();
    let id = registry::insert(raw, options);
    View::from_id(id)
}

/// `wrap` with `options.immutable = true`.
pub fn immutable(raw: impl Into<RawValue>, mut options: WrapOptions) -> View {
    options.immutable = true;
    wrap(raw, options)
}

/// `wrap` with `options.recursive = false`: children remain raw values.
pub fn flat(raw: impl Into<RawValue>, mut options: WrapOptions) -> View {
    options.recursive = false;
    wrap(raw, options)
}

/// Wrap a raw container without installing any reactive instrumentation
/// beyond registry bookkeeping — equivalent to `wrap` with every reactive
/// behavior unobservable.
pub fn raw(raw: impl Into<RawValue>) -> View {
    wrap(raw, WrapOptions::default().observable(false))
}

/// An array view that keeps itself sorted by `compare`, inserting via
/// binary search below a small-batch heuristic and falling back to a bulk
/// insert + full sort above it.
pub struct Ordered {
    view: View,
    compare: Arc<dyn Fn(&Value, &Value) -> Ordering + Send + Sync>,
}

impl Ordered {
    pub fn view(&self) -> View {
        self.view
    }

    pub fn push(&self, items: Vec<Value>) -> Result<()> {
        let compare = Arc::clone(&self.compare);
        traps::ordered_insert(self.view.id, items, move |a, b| compare(a, b), false)
    }
}

/// Build an ordered array view over `items`, sorted once up front by
/// `compare`.
pub fn ordered(
    mut items: Vec<Value>,
    compare: impl Fn(&Value, &Value) -> Ordering + Send + Sync + 'static,
    options: WrapOptions,
) -> Ordered {
    items.sort_by(&compare);
    let view = wrap(RawValue::Array(items), options);
    Ordered {
        view,
        compare: Arc::new(compare),
    }
}

#[allow(dead_code)]
pub(crate) type SetBacking = IndexSet<Value>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_object_then_get_and_set() {
        let view = wrap(RawValue::Object(IndexMap::new()), WrapOptions::default());
        view.set("a", 1.0).unwrap();
        assert_eq!(view.get("a"), Some(Value::Num(1.0)));
    }

    #[test]
    fn child_returns_a_reactive_view_of_a_nested_object() {
        let inner = RawValue::Object(IndexMap::from([(Arc::<str>::from("n"), Value::from("A"))]));
        let outer = wrap(
            RawValue::Object(IndexMap::from([(
                Arc::<str>::from("p"),
                Value::Unwrapped(Arc::new(inner)),
            )])),
            WrapOptions::default(),
        );

        let child = outer.child("p").expect("nested object should be a child view");
        child.set("n", "C").unwrap();
        assert_eq!(child.get("n"), Some(Value::from("C")));
    }

    #[test]
    fn child_is_none_for_a_leaf_value() {
        let view = wrap(RawValue::Object(IndexMap::new()), WrapOptions::default());
        view.set("a", 1.0).unwrap();
        assert!(view.child("a").is_none());
    }

    #[test]
    fn destroy_clears_parent_child_back_edges() {
        let inner = RawValue::Object(IndexMap::from([(Arc::<str>::from("n"), Value::from("A"))]));
        let outer = wrap(
            RawValue::Object(IndexMap::from([(
                Arc::<str>::from("p"),
                Value::Unwrapped(Arc::new(inner)),
            )])),
            WrapOptions::default(),
        );
        let child = outer.child("p").unwrap();

        outer.destroy();
        assert!(View::try_from(child.id()).is_ok());
        assert!(View::try_from(outer.id()).is_err());
    }

    #[test]
    fn immutable_view_rejects_write_non_strict() {
        let view = immutable(RawValue::Object(IndexMap::new()), WrapOptions::default());
        view.set("a", 1.0).unwrap();
        assert_eq!(view.get("a"), None);
    }

    #[test]
    fn immutable_view_errors_in_strict_mode() {
        let view = immutable(
            RawValue::Object(IndexMap::new()),
            WrapOptions::default().strict(true),
        );
        assert!(matches!(view.set("a", 1.0), Err(Violation::ReadOnly { .. })));
    }

    #[test]
    fn ordered_keeps_small_batch_sorted() {
        let ord = ordered(
            vec![Value::Num(1.0), Value::Num(3.0), Value::Num(5.0)],
            |a, b| {
                let (Value::Num(a), Value::Num(b)) = (a, b) else {
                    unreachable!()
                };
                a.partial_cmp(b).unwrap()
            },
            WrapOptions::default(),
        );
        ord.push(vec![Value::Num(4.0)]).unwrap();
        let raw = registry::meta(ord.view().id()).raw.lock();
        match &*raw {
            RawValue::Array(a) => assert_eq!(
                a,
                &vec![
                    Value::Num(1.0),
                    Value::Num(3.0),
                    Value::Num(4.0),
                    Value::Num(5.0)
                ]
            ),
            _ => panic!("expected array"),
        }
    }
}
