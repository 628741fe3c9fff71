//! Ambient scoped-value store for the current observer and the current tracker.
//!
//! Both live in a thread-local stack rather than a true task-local: a caller
//! that needs to carry an observer across an await point should use
//! `run_in_observer` explicitly rather than relying on ambient propagation.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::observer::Observer;
use crate::registry::StateId;
use crate::value::Key;

/// Unique identifier for an [`Observer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

impl ObserverId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Hook notified of every `(state, key)` read, independent of any observer.
///
/// Used by integrations that want visibility into reads without registering
/// a full observer (the glossary's "Tracker").
pub type TrackerFn = Arc<dyn Fn(StateId, &Key) + Send + Sync>;

thread_local! {
    static OBSERVER_STACK: RefCell<Vec<Arc<Observer>>> = const { RefCell::new(Vec::new()) };
    static TRACKER: RefCell<Option<TrackerFn>> = const { RefCell::new(None) };
}

/// The observer currently executing on this thread, if any.
pub fn current_observer() -> Option<Arc<Observer>> {
    OBSERVER_STACK.with(|stack| stack.borrow().last().cloned())
}

/// Push `observer` onto the ambient stack for the duration of `f`.
///
/// This is the primitive `Observer::run` builds on; it is also the escape
/// hatch a caller uses to carry an observer across a boundary where the
/// ambient thread-local would not otherwise be visible (e.g. into a
/// callback dispatched from another thread-local context).
pub fn run_in_observer<R>(observer: &Arc<Observer>, f: impl FnOnce() -> R) -> R {
    OBSERVER_STACK.with(|stack| stack.borrow_mut().push(Arc::clone(observer)));
    let result = f();
    OBSERVER_STACK.with(|stack| {
        stack.borrow_mut().pop();
    });
    result
}

/// Run `f` with no ambient observer, suppressing dependency tracking.
///
/// Used by `read()`/`snapshot()` so deep walks never register as
/// dependencies, and internally during mutation so a write never observes
/// its own read-back.
pub fn untrack<R>(f: impl FnOnce() -> R) -> R {
    OBSERVER_STACK.with(|stack| stack.borrow_mut().push(Arc::clone(&SUPPRESSED)));
    let result = f();
    OBSERVER_STACK.with(|stack| {
        stack.borrow_mut().pop();
    });
    result
}

/// Record a `(state, key)` read against the ambient observer, if any, and
/// invoke the ambient tracker hook, if any.
///
/// No-op inside `untrack()`: the suppressed sentinel observer's `track`
/// implementation discards everything it's handed.
pub fn record_read(state: StateId, key: &Key) {
    TRACKER.with(|t| {
        if let Some(f) = t.borrow().as_ref() {
            f(state, key);
        }
    });
    if let Some(observer) = current_observer() {
        observer.track(state, key.clone());
    }
}

/// Set the ambient tracker hook for the duration of `f`.
pub fn run_with_tracker<R>(tracker: TrackerFn, f: impl FnOnce() -> R) -> R {
    let prev = TRACKER.with(|t| t.borrow_mut().replace(tracker));
    let result = f();
    TRACKER.with(|t| *t.borrow_mut() = prev);
    result
}

use once_cell::sync::Lazy;
static SUPPRESSED: Lazy<Arc<Observer>> = Lazy::new(|| Arc::new(Observer::sentinel()));

/// True if the sentinel (suppressed) observer is the current ambient one.
pub(crate) fn is_suppressed(observer: &Observer) -> bool {
    std::ptr::eq(observer, Arc::as_ptr(&SUPPRESSED))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_observer_by_default() {
        assert!(current_observer().is_none());
    }

    #[test]
    fn untrack_installs_suppressed_sentinel() {
        untrack(|| {
            let obs = current_observer().expect("sentinel installed");
            assert!(is_suppressed(&obs));
        });
        assert!(current_observer().is_none());
    }

    #[test]
    fn run_in_observer_is_visible_inside_closure_only() {
        let observer = Arc::new(Observer::new());
        run_in_observer(&observer, || {
            assert!(current_observer().is_some());
        });
        assert!(current_observer().is_none());
    }
}
