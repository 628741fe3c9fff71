//! Per-computation dependency collector.
//!
//! An `Observer` is a raw dependency collector with no cached value of its
//! own; `effect()` below layers re-run behavior on top of it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::{self, ObserverId};
use crate::error::{Result, Violation};
use crate::registry::{self, StateId};
use crate::value::Key;

/// Callback invoked when a tracked dependency changes.
pub type OnChange = Box<dyn Fn(StateId, &Key) + Send + Sync>;

/// A computation's dependency collector.
///
/// Reads performed inside [`Observer::run`] populate `tracked`; a
/// subsequent mutation to any tracked `(state, key)` invokes `on_change`
/// (dispatched by `event.rs`, not by the observer itself).
pub struct Observer {
    id: ObserverId,
    tracked: Mutex<std::collections::HashMap<StateId, HashSet<Key>>>,
    on_change: Mutex<Option<OnChange>>,
    destroyed: AtomicBool,
    safe_observation: AtomicBool,
    safe_observation_threshold: AtomicUsize,
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer")
            .field("id", &self.id)
            .field("tracked_states", &self.tracked.lock().len())
            .field("destroyed", &self.destroyed.load(Ordering::Acquire))
            .finish()
    }
}

impl Observer {
    /// Create a new, unregistered observer.
    pub fn new() -> Self {
        Self {
            id: ObserverId::new(),
            tracked: Mutex::new(std::collections::HashMap::new()),
            on_change: Mutex::new(None),
            destroyed: AtomicBool::new(false),
            safe_observation: AtomicBool::new(false),
            safe_observation_threshold: AtomicUsize::new(usize::MAX),
        }
    }

    /// The sentinel observer installed by `context::untrack` — its `track`
    /// is a no-op so reads inside `untrack`/`snapshot` never register.
    pub(crate) fn sentinel() -> Self {
        let o = Self::new();
        o.destroyed.store(true, Ordering::Release);
        o
    }

    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Configure the observation budget: a warning threshold on how many
    /// distinct states this observer may track in one pass.
    pub fn with_safe_observation(self, threshold: usize) -> Self {
        self.safe_observation.store(true, Ordering::Release);
        self.safe_observation_threshold
            .store(threshold, Ordering::Release);
        self
    }

    /// Set the callback invoked when a tracked dependency changes.
    pub fn on_change(&self, f: impl Fn(StateId, &Key) + Send + Sync + 'static) {
        *self.on_change.lock() = Some(Box::new(f));
    }

    pub(crate) fn notify_change(&self, state: StateId, key: &Key) {
        if let Some(f) = self.on_change.lock().as_ref() {
            f(state, key);
        }
    }

    /// Record a `(state, key)` read. A no-op for the sentinel/destroyed observer.
    ///
    /// The observation budget can be configured two ways: an explicit
    /// [`Observer::with_safe_observation`] call, or inherited from any
    /// tracked state's own `WrapOptions::safe_observation`. Wrapping a state
    /// with that option set caps every observer that ever reads it, since
    /// the option is attached to the state rather than to a particular
    /// computation. The tighter of the two thresholds applies.
    pub(crate) fn track(self: &Arc<Self>, state: StateId, key: Key) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        registry::register_observer(state, Arc::clone(self));
        let tracked_state_count = {
            let mut tracked = self.tracked.lock();
            tracked.entry(state).or_default().insert(key);
            tracked.len()
        };

        let observer_threshold = self
            .safe_observation
            .load(Ordering::Acquire)
            .then(|| self.safe_observation_threshold.load(Ordering::Acquire));
        let state_threshold = registry::try_meta(state).and_then(|m| {
            m.options
                .safe_observation
                .then_some(m.options.safe_observation_threshold)
        });

        if let Some(threshold) = observer_threshold.into_iter().chain(state_threshold).min() {
            if tracked_state_count > threshold {
                let violation = Violation::UnsafeObservation {
                    observer: self.id,
                    tracked: tracked_state_count,
                    threshold,
                };
                tracing::warn!(error = %violation, "observer exceeded observation budget; wrap bulk reads in read()");
            }
        }
    }

    /// True if this observer has, in its current tracked set, read `state`
    /// at `key` — used by the trap layer's circular-mutation check.
    pub(crate) fn has_tracked(&self, state: StateId, key: &Key) -> bool {
        self.tracked
            .lock()
            .get(&state)
            .is_some_and(|keys| keys.contains(key))
    }

    pub(crate) fn has_tracked_state(&self, state: StateId) -> bool {
        self.tracked.lock().contains_key(&state)
    }

    /// Run `fn` with this observer installed as the ambient observer.
    ///
    /// Reads performed inside `f` populate `tracked`. Panics if `f` performs
    /// a mutation on a state this observer is concurrently reading in the
    /// same pass (circular-mutation violation is raised by the trap layer
    /// as an `Err`, not a panic; this doc note only describes *when* that
    /// check is active).
    pub fn run<R>(self: &Arc<Self>, f: impl FnOnce() -> R) -> R {
        context::run_in_observer(self, f)
    }

    /// Clear tracked keys ahead of a re-run, without deregistering from
    /// the states themselves (full deregistration only happens on `destroy`).
    pub fn reset(&self) {
        for (state, _) in self.tracked.lock().drain() {
            registry::unregister_observer(state, self.id);
        }
    }

    /// Detach from every tracked state and mark this observer inert.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        for (state, _) in self.tracked.lock().drain() {
            registry::unregister_observer(state, self.id);
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

impl Default for Observer {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a fresh, unregistered observer.
pub fn create_observer() -> Arc<Observer> {
    Arc::new(Observer::new())
}

/// A cleanup callback returned by an [`effect`] closure, run before the
/// next re-run and on [`EffectHandle::destroy`].
pub type CleanupFn = Box<dyn FnOnce() + Send>;

/// A running [`effect`]; dropping this handle does not stop the effect.
/// Call [`EffectHandle::destroy`] explicitly.
pub struct EffectHandle {
    observer: Arc<Observer>,
    cleanup: Arc<Mutex<Option<CleanupFn>>>,
}

impl std::fmt::Debug for EffectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectHandle").field("observer", &self.observer).finish()
    }
}

impl EffectHandle {
    pub fn observer(&self) -> &Arc<Observer> {
        &self.observer
    }

    /// Run the pending cleanup (if any) and detach from every tracked
    /// state, stopping further re-runs.
    pub fn destroy(self) {
        if let Some(cleanup) = self.cleanup.lock().take() {
            cleanup();
        }
        self.observer.destroy();
    }
}

/// Create an observer, run `f` once, and re-run it whenever any `(state,
/// key)` pair it read during its last run changes. `f` may return a cleanup
/// closure, invoked right before the next re-run and on `destroy()`.
pub fn effect(f: impl FnMut() -> Option<CleanupFn> + Send + 'static) -> EffectHandle {
    let observer = create_observer();
    let f: Arc<Mutex<dyn FnMut() -> Option<CleanupFn> + Send>> = Arc::new(Mutex::new(f));
    let cleanup: Arc<Mutex<Option<CleanupFn>>> = Arc::new(Mutex::new(None));

    fn run_once(
        observer: &Arc<Observer>,
        f: &Arc<Mutex<dyn FnMut() -> Option<CleanupFn> + Send>>,
        cleanup: &Arc<Mutex<Option<CleanupFn>>>,
    ) {
        if let Some(prev) = cleanup.lock().take() {
            prev();
        }
        observer.reset();
        let next_cleanup = observer.run(|| (f.lock())());
        *cleanup.lock() = next_cleanup;
    }

    run_once(&observer, &f, &cleanup);

    let observer_for_change = Arc::clone(&observer);
    let f_for_change = Arc::clone(&f);
    let cleanup_for_change = Arc::clone(&cleanup);
    observer.on_change(move |_state, _key| {
        run_once(&observer_for_change, &f_for_change, &cleanup_for_change);
    });

    EffectHandle { observer, cleanup }
}

/// Raise a circular-mutation violation if `observer` already tracked
/// `(state, key)` during its currently-running pass.
///
/// Called by the trap layer immediately before performing a write.
pub(crate) fn check_circular(observer: &Observer, state: StateId, key: &Key) -> Result<()> {
    if !context::is_suppressed(observer) && observer.has_tracked(state, key) {
        return Err(Violation::Circular {
            observer: observer.id(),
            state,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_observation_threshold_inherited_from_state_options() {
        use crate::options::WrapOptions;
        use crate::value::RawValue;
        use indexmap::IndexMap;

        let observer = Arc::new(Observer::new());
        let guarded = registry::insert(
            RawValue::Object(IndexMap::new()),
            WrapOptions::default().safe_observation(1),
        );
        let plain = registry::insert(RawValue::Object(IndexMap::new()), WrapOptions::default());

        observer.track(plain, Key::from("a"));
        assert!(!observer.safe_observation.load(Ordering::Acquire));
        observer.track(guarded, Key::from("b"));
        // Exceeding the inherited threshold (1) only warns via tracing; the
        // tracked set itself is unaffected either way.
        assert!(observer.has_tracked(guarded, &Key::from("b")));
        assert!(observer.has_tracked(plain, &Key::from("a")));
    }

    #[test]
    fn track_and_query() {
        let observer = Arc::new(Observer::new());
        let state = StateId::for_test(1);
        observer.track(state, Key::from("a"));
        assert!(observer.has_tracked(state, &Key::from("a")));
        assert!(!observer.has_tracked(state, &Key::from("b")));
    }

    #[test]
    fn reset_clears_tracked_but_not_identity() {
        let observer = Arc::new(Observer::new());
        let state = StateId::for_test(2);
        observer.track(state, Key::from("a"));
        observer.reset();
        assert!(!observer.has_tracked(state, &Key::from("a")));
        assert!(!observer.is_destroyed());
    }

    #[test]
    fn destroy_marks_inert() {
        let observer = Arc::new(Observer::new());
        observer.destroy();
        assert!(observer.is_destroyed());
        observer.track(StateId::for_test(3), Key::from("a"));
        assert!(!observer.has_tracked(StateId::for_test(3), &Key::from("a")));
    }

    #[test]
    fn effect_runs_immediately_and_reruns_on_change() {
        use crate::options::WrapOptions;
        use crate::state::wrap;
        use crate::value::RawValue;

        let view = wrap(RawValue::Object(Default::default()), WrapOptions::default());
        view.set("count", 0.0).unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        let runs_for_effect = Arc::clone(&runs);
        let handle = effect(move || {
            runs_for_effect.fetch_add(1, Ordering::SeqCst);
            let _ = view.get("count");
            None
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        view.set("count", 1.0).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        handle.destroy();
    }

    #[test]
    fn effect_runs_cleanup_before_rerun() {
        use crate::options::WrapOptions;
        use crate::state::wrap;
        use crate::value::RawValue;

        let view = wrap(RawValue::Object(Default::default()), WrapOptions::default());
        view.set("count", 0.0).unwrap();

        let cleanups = Arc::new(AtomicUsize::new(0));
        let cleanups_for_effect = Arc::clone(&cleanups);
        let handle = effect(move || {
            let _ = view.get("count");
            let cleanups = Arc::clone(&cleanups_for_effect);
            Some(Box::new(move || {
                cleanups.fetch_add(1, Ordering::SeqCst);
            }) as CleanupFn)
        });
        assert_eq!(cleanups.load(Ordering::SeqCst), 0);

        view.set("count", 1.0).unwrap();
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);

        handle.destroy();
        assert_eq!(cleanups.load(Ordering::SeqCst), 2);
    }
}
