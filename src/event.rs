//! Change notification: direct subscribers, tracked observers, and upward
//! bubbling through parent links.
//!
//! Dispatch here is synchronous rather than queued through a microtask
//! tick: a mutation calls `dispatch` once it has released the state's
//! internal lock, and every subscriber for that state runs before bubbling
//! to the parent.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use indexmap::IndexMap;

use crate::link;
use crate::registry::{self, StateId};
use crate::state::View;
use crate::value::{Key, Value};

/// What happened to a state at a given key.
///
/// Every array-mutation variant carries the payload `history.rs` needs to
/// compute the exact inverse operation, rather than collapsing every bulk
/// operation into one generic "structural" marker.
#[derive(Debug, Clone)]
pub enum ChangeKind {
    /// Emitted synchronously to a subscriber the moment it attaches; never
    /// appears in a history buffer.
    Init,
    /// A record/map key or array index was given a new value.
    Set { old: Option<Value>, new: Value },
    /// A key/index/entry was removed.
    Delete { old: Value },
    /// A `Set` gained a member.
    Add { value: Value },
    /// A `Map`/`Set`/`Object`/`Array` was emptied; carries every entry so
    /// history can re-insert them.
    Clear { entries: Vec<(Key, Value)> },
    /// Every entry of `new_entries` was assigned wholesale, replacing
    /// `old_entries`. A key absent beforehand records `None` so undo can
    /// remove it again instead of leaving it behind.
    Assign {
        old_entries: IndexMap<Key, Option<Value>>,
        new_entries: IndexMap<Key, Value>,
    },
    /// `push(items)`.
    Push { items: Vec<Value> },
    /// `pop()`; `item` is `None` when the array was already empty (in which
    /// case no event is dispatched at all, per the no-op guard).
    Pop { item: Value },
    /// `shift()`.
    Shift { item: Value },
    /// `unshift(items)`.
    Unshift { items: Vec<Value> },
    /// `splice(start, delete_count, inserted)`.
    Splice {
        start: usize,
        removed: Vec<Value>,
        inserted: Vec<Value>,
    },
    /// `sort(compare)`; `prev_order` is the full array before sorting and
    /// `new_order` the array right after, so both undo and redo can restore
    /// the exact array without re-invoking the (non-`Clone`) comparator.
    Sort {
        prev_order: Vec<Value>,
        new_order: Vec<Value>,
    },
    /// `reverse()`; self-inverse, no payload needed.
    Reverse,
    /// `fill(value, start, end)`; `prev` is the overwritten slice.
    Fill {
        value: Value,
        start: usize,
        end: usize,
        prev: Vec<Value>,
    },
    /// `copyWithin(target, start, end)`; `prev` is the slice at
    /// `target..target+len` before the move, `new` the slice written there.
    CopyWithin {
        target: usize,
        prev: Vec<Value>,
        new: Vec<Value>,
    },
}

/// A single notification delivered to subscribers and observers.
///
/// `key_path` is empty at the state where the mutation happened and gains a
/// leading segment per hop as it bubbles to each parent.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub origin: StateId,
    pub key: Key,
    pub kind: ChangeKind,
    pub key_path: Vec<Key>,
}

impl ChangeEvent {
    fn bubbled(&self, hop_key: Key) -> Self {
        let mut key_path = Vec::with_capacity(self.key_path.len() + 1);
        key_path.push(hop_key);
        key_path.extend(self.key_path.iter().cloned());
        Self {
            origin: self.origin,
            key: self.key.clone(),
            kind: self.kind.clone(),
            key_path,
        }
    }

    /// The path from the subscribing root down to the mutated slot,
    /// `key_path` with this event's own `key` appended. Used by `history.rs`
    /// to identify the slot an aggregate belongs to and to re-resolve it on
    /// replay.
    pub fn full_path(&self) -> Vec<Key> {
        let mut path = self.key_path.clone();
        path.push(self.key.clone());
        path
    }
}

/// Dispatch `event` (which happened at `state`) to `state`'s own observers
/// and direct subscribers, then bubble it to every parent.
///
/// Local-first ordering: a state's own direct subscribers and observers
/// always run before the event reaches a parent's subscribers, even though
/// the parent's registration happened first in wall-clock terms.
pub(crate) fn dispatch(state: StateId, event: ChangeEvent) {
    dispatch_local(state, &event);

    for link in link::parents_of(state) {
        let bubbled = event.bubbled(link.key);
        dispatch(link.parent, bubbled);
    }
}

fn dispatch_local(state: StateId, event: &ChangeEvent) {
    let Some(meta) = registry::try_meta(state) else {
        return;
    };

    let observers: Vec<_> = meta.observers.lock().values().cloned().collect();
    for observer in observers {
        if observer.has_tracked(state, &event.key) {
            run_guarded(|| observer.notify_change(state, &event.key));
        }
    }

    let subscribers: Vec<_> = meta.subscribers.lock().iter().map(|(_, f)| f.clone()).collect();
    if subscribers.is_empty() {
        return;
    }
    let view = View::from_id(state);
    for subscriber in subscribers {
        run_guarded(|| subscriber(view, event));
    }
}

/// Run a subscriber/observer callback, converting a panic into a logged
/// violation instead of unwinding through the mutation that triggered it.
fn run_guarded(f: impl FnOnce()) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        tracing::warn!(
            violation = %crate::error::Violation::ExternalHandler(message),
            "subscriber or observer callback panicked"
        );
    }
}

/// A handle returned by [`subscribe`]/[`pipe`]/[`log`]; calling
/// [`Unsubscribe::unsubscribe`] detaches the callback. It does not
/// auto-detach on drop, so cleanup stays an explicit, caller-driven action.
#[derive(Debug, Clone, Copy)]
pub struct Unsubscribe {
    state: StateId,
    id: u64,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        if let Some(meta) = registry::try_meta(self.state) {
            meta.subscribers.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

/// Subscribe directly to `view`. `handler` runs synchronously once with
/// `ChangeKind::Init` before this function returns, then once per
/// subsequent mutation of `view` itself (not its descendants — bubbling
/// delivers those to whichever ancestor the caller subscribed on).
pub fn subscribe(
    view: View,
    handler: impl Fn(View, &ChangeEvent) + Send + Sync + 'static,
) -> Unsubscribe {
    let id = registry::next_subscription_id();
    let handler: Arc<dyn Fn(View, &ChangeEvent) + Send + Sync> = Arc::new(handler);
    registry::meta(view.id())
        .subscribers
        .lock()
        .push((id, Arc::clone(&handler)));

    handler(
        view,
        &ChangeEvent {
            origin: view.id(),
            key: Key::Root,
            kind: ChangeKind::Init,
            key_path: Vec::new(),
        },
    );

    Unsubscribe { state: view.id(), id }
}

/// Subscribe with a `tracing`-backed logging handler.
pub fn log(view: View) -> Unsubscribe {
    subscribe(view, |view, event| {
        tracing::info!(state = ?view.id(), key = ?event.key, kind = ?event.kind, "reactive change");
    })
}

/// Subscribe to `source` and write a transformed snapshot into `target`
/// every time `source` changes. Errors if either operand is not a container
/// view.
pub fn pipe(
    source: View,
    target: View,
    transform: Option<impl Fn(crate::snapshot::Snapshot) -> crate::snapshot::Snapshot + Send + Sync + 'static>,
) -> Unsubscribe {
    let transform = transform.map(|f| {
        let boxed: Arc<dyn Fn(crate::snapshot::Snapshot) -> crate::snapshot::Snapshot + Send + Sync> =
            Arc::new(f);
        boxed
    });
    subscribe(source, move |source_view, _event| {
        let snap = crate::snapshot::snapshot(source_view);
        let snap = match &transform {
            Some(f) => f(snap),
            None => snap,
        };
        if let Err(err) = crate::snapshot::assign_snapshot(target, snap) {
            tracing::warn!(error = %err, "pipe: failed to assign transformed snapshot into target");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::RawValue;
    use crate::WrapOptions;
    use indexmap::IndexMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn new_state() -> StateId {
        registry::insert(RawValue::Object(IndexMap::new()), WrapOptions::default())
    }

    #[test]
    fn local_subscriber_sees_direct_mutation() {
        let state = new_state();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        registry::meta(state).subscribers.lock().push((
            registry::next_subscription_id(),
            Arc::new(move |_view, _event| {
                seen2.fetch_add(1, Ordering::SeqCst);
            }),
        ));

        dispatch(
            state,
            ChangeEvent {
                origin: state,
                key: Key::from("a"),
                kind: ChangeKind::Set {
                    old: None,
                    new: Value::Num(1.0),
                },
                key_path: Vec::new(),
            },
        );

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bubbles_to_parent_with_prefixed_key_path() {
        let parent = new_state();
        let child = new_state();
        link::link(parent, Key::from("child"), child);

        let seen_path = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_path2 = Arc::clone(&seen_path);
        registry::meta(parent).subscribers.lock().push((
            registry::next_subscription_id(),
            Arc::new(move |_view, event: &ChangeEvent| {
                *seen_path2.lock() = event.key_path.clone();
            }),
        ));

        dispatch(
            child,
            ChangeEvent {
                origin: child,
                key: Key::from("a"),
                kind: ChangeKind::Set {
                    old: None,
                    new: Value::Num(1.0),
                },
                key_path: Vec::new(),
            },
        );

        assert_eq!(*seen_path.lock(), vec![Key::from("child")]);
    }

    #[test]
    fn panicking_subscriber_does_not_abort_dispatch() {
        let state = new_state();
        let seen = Arc::new(AtomicUsize::new(0));
        registry::meta(state).subscribers.lock().push((
            registry::next_subscription_id(),
            Arc::new(|_view, _event| panic!("boom")),
        ));
        let seen2 = Arc::clone(&seen);
        registry::meta(state).subscribers.lock().push((
            registry::next_subscription_id(),
            Arc::new(move |_view, _event| {
                seen2.fetch_add(1, Ordering::SeqCst);
            }),
        ));

        dispatch(
            state,
            ChangeEvent {
                origin: state,
                key: Key::from("a"),
                kind: ChangeKind::Clear { entries: Vec::new() },
                key_path: Vec::new(),
            },
        );

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscribe_invokes_handler_synchronously_with_init() {
        let view = crate::state::wrap(RawValue::Object(IndexMap::new()), WrapOptions::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let kinds: Arc<parking_lot::Mutex<Vec<bool>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let kinds2 = Arc::clone(&kinds);
        let unsub = subscribe(view, move |_v, event| {
            calls2.fetch_add(1, Ordering::SeqCst);
            kinds2.lock().push(matches!(event.kind, ChangeKind::Init));
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(kinds.lock()[0], true);

        view.set("a", 1.0).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        unsub.unsubscribe();
        view.set("b", 2.0).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
