//! A global map from state identity to its metadata (subscribers, observers,
//! children, parents, schema, options).
//!
//! Identity is established once at `wrap()` time via a generated `StateId`,
//! and metadata lives in a global `DashMap` behind a process-global `Lazy`
//! singleton. There is no manual GC: a state with zero parents and zero
//! subscribers is a candidate for collection but is only actually dropped
//! when `View::destroy()` (or the fallback in `remove()`) is called on it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::context::ObserverId;
use crate::observer::Observer;
use crate::schema::Schema;
use crate::value::{Key, RawValue, ViewKind};
use crate::WrapOptions;

/// Opaque identity for a wrapped raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateId(u64);

impl StateId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn for_test(n: u64) -> Self {
        Self(n)
    }
}

/// A subscriber registered directly via `subscribe()`.
pub(crate) type DirectSubscriber = Arc<dyn Fn(crate::state::View, &crate::event::ChangeEvent) + Send + Sync>;

/// A back-edge: `child`'s slot in `parent` at `key`.
#[derive(Debug, Clone)]
pub(crate) struct ParentLink {
    pub parent: StateId,
    pub key: Key,
}

/// Per-state metadata: subscribers, children, parent back-edges, schema,
/// options, and the raw value itself.
pub(crate) struct StateMeta {
    pub raw: Mutex<RawValue>,
    pub kind: ViewKind,
    pub options: WrapOptions,
    pub schema: Option<Arc<dyn Schema>>,
    pub subscribers: Mutex<Vec<(u64, DirectSubscriber)>>,
    pub observers: Mutex<std::collections::HashMap<ObserverId, Arc<Observer>>>,
    /// key -> child state id, for children reachable through this state.
    pub children: Mutex<std::collections::HashMap<Key, StateId>>,
    pub parents: Mutex<Vec<ParentLink>>,
    pub busy: AtomicBool,
    pub immutable: AtomicBool,
}

impl StateMeta {
    fn new(raw: RawValue, options: WrapOptions) -> Self {
        let kind = raw.kind();
        let immutable = options.immutable;
        Self {
            raw: Mutex::new(raw),
            kind,
            schema: options.schema.clone(),
            options,
            subscribers: Mutex::new(Vec::new()),
            observers: Mutex::new(std::collections::HashMap::new()),
            children: Mutex::new(std::collections::HashMap::new()),
            parents: Mutex::new(Vec::new()),
            busy: AtomicBool::new(false),
            immutable: AtomicBool::new(immutable),
        }
    }
}

static REGISTRY: Lazy<DashMap<StateId, Arc<StateMeta>>> = Lazy::new(DashMap::new);
static SUBSCRIPTION_COUNTER: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_subscription_id() -> u64 {
    SUBSCRIPTION_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Register a freshly-wrapped raw value and return its new identity.
pub(crate) fn insert(raw: RawValue, options: WrapOptions) -> StateId {
    let id = StateId::new();
    let meta = Arc::new(StateMeta::new(raw, options));
    tracing::trace!(state = ?id, kind = ?meta.kind, "registered state");
    REGISTRY.insert(id, meta);
    id
}

/// Look up metadata for `id`. Panics only if called on an id this registry
/// never issued, which the public API cannot produce.
pub(crate) fn meta(id: StateId) -> Arc<StateMeta> {
    REGISTRY
        .get(&id)
        .map(|e| Arc::clone(e.value()))
        .unwrap_or_else(|| panic!("{}", crate::error::Violation::TrapMisuse(id)))
}

pub(crate) fn try_meta(id: StateId) -> Option<Arc<StateMeta>> {
    REGISTRY.get(&id).map(|e| Arc::clone(e.value()))
}

pub(crate) fn register_observer(state: StateId, observer: Arc<Observer>) {
    if let Some(m) = try_meta(state) {
        m.observers.lock().insert(observer.id(), observer);
    }
}

pub(crate) fn unregister_observer(state: StateId, observer: ObserverId) {
    if let Some(m) = try_meta(state) {
        m.observers.lock().remove(&observer);
    }
}

/// Remove a state's metadata entirely. Does not cascade to children or
/// parents; callers that want that should walk `children`/`parents` first.
pub(crate) fn remove(id: StateId) {
    REGISTRY.remove(&id);
}

/// Candidate-for-GC check: zero parents and zero direct subscribers.
/// Informational only — nothing in this crate acts on it automatically.
pub(crate) fn is_gc_candidate(id: StateId) -> bool {
    try_meta(id)
        .map(|m| m.parents.lock().is_empty() && m.subscribers.lock().is_empty())
        .unwrap_or(true)
}

#[allow(dead_code)]
pub(crate) fn known_children(id: StateId) -> HashSet<StateId> {
    try_meta(id)
        .map(|m| m.children.lock().values().copied().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    #[test]
    fn insert_and_lookup_roundtrip() {
        let raw = RawValue::Object(IndexMap::new());
        let id = insert(raw, WrapOptions::default());
        let m = meta(id);
        assert_eq!(m.kind, ViewKind::Object);
        remove(id);
        assert!(try_meta(id).is_none());
    }

    #[test]
    fn gc_candidate_when_isolated() {
        let raw = RawValue::Array(Vec::new());
        let id = insert(raw, WrapOptions::default());
        assert!(is_gc_candidate(id));
    }
}
