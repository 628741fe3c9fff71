//! A debounced, bounded undo/redo log built on top of the change stream.
//!
//! There is no host event loop to hook a microtask tick into, so the
//! debounce window is driven by an explicit [`History::tick`] the caller
//! invokes with its own clock, with [`HistoryClock`] as an optional
//! background-thread driver for hosts that have a thread to spare.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::event::{self, ChangeEvent, ChangeKind, Unsubscribe};
use crate::registry::{self, StateId};
use crate::snapshot::{self, Snapshot};
use crate::state::View;
use crate::value::{Key, Value};

/// Construction options for [`history`].
#[derive(Debug, Clone, Copy)]
pub struct HistoryOptions {
    pub max_history: usize,
    pub debounce_ms: u64,
    pub resettable: bool,
}

impl Default for HistoryOptions {
    fn default() -> Self {
        Self {
            max_history: 100,
            debounce_ms: 100,
            resettable: false,
        }
    }
}

impl HistoryOptions {
    pub fn max_history(mut self, n: usize) -> Self {
        self.max_history = n;
        self
    }

    pub fn debounce_ms(mut self, ms: u64) -> Self {
        self.debounce_ms = ms;
        self
    }

    pub fn resettable(mut self, yes: bool) -> Self {
        self.resettable = yes;
        self
    }
}

/// One buffered change at a given `(origin, key)` slot within the current
/// debounce window: `first` keeps the earliest `prev` value, `latest` keeps
/// the most recent `value`.
struct Buffered {
    first: ChangeEvent,
    latest: ChangeEvent,
}

struct Inner {
    root: View,
    options: HistoryOptions,
    initial: Mutex<Snapshot>,
    buffer: Mutex<IndexMap<(StateId, Key), Buffered>>,
    window_start_ms: Mutex<Option<u64>>,
    current_ms: AtomicU64,
    backward: Mutex<VecDeque<Vec<ChangeEvent>>>,
    forward: Mutex<VecDeque<Vec<ChangeEvent>>>,
    busy: AtomicBool,
    destroyed: AtomicBool,
    unsubscribe: Mutex<Option<Unsubscribe>>,
}

/// A debounced undo/redo control object over `view`'s change stream.
#[derive(Clone)]
pub struct History {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for History {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("History")
            .field("backward_len", &self.inner.backward.lock().len())
            .field("forward_len", &self.inner.forward.lock().len())
            .finish()
    }
}

/// Build a history control object over `view`.
///
/// Subscribes at `view` immediately and buffers every subsequent change.
/// Nothing is recorded before this call — mutations that already happened
/// are not retroactively captured, matching "at construction, take an
/// initial snapshot (for `reset()`)" as the only thing construction reads.
pub fn history(view: View, options: HistoryOptions) -> History {
    let inner = Arc::new(Inner {
        root: view,
        options,
        initial: Mutex::new(snapshot::snapshot(view)),
        buffer: Mutex::new(IndexMap::new()),
        window_start_ms: Mutex::new(None),
        current_ms: AtomicU64::new(0),
        backward: Mutex::new(VecDeque::new()),
        forward: Mutex::new(VecDeque::new()),
        busy: AtomicBool::new(false),
        destroyed: AtomicBool::new(false),
        unsubscribe: Mutex::new(None),
    });

    let inner_for_handler = Arc::clone(&inner);
    let unsub = event::subscribe(view, move |_view, event| {
        record_event(&inner_for_handler, event);
    });
    *inner.unsubscribe.lock() = Some(unsub);

    History { inner }
}

fn record_event(inner: &Arc<Inner>, event: &ChangeEvent) {
    if inner.destroyed.load(Ordering::Acquire) || inner.busy.load(Ordering::Acquire) {
        return;
    }
    if matches!(event.kind, ChangeKind::Init) {
        return;
    }

    let mut buffer = inner.buffer.lock();
    let was_empty = buffer.is_empty();
    let key = (event.origin, event.key.clone());
    buffer
        .entry(key)
        .and_modify(|b| b.latest = event.clone())
        .or_insert_with(|| Buffered {
            first: event.clone(),
            latest: event.clone(),
        });
    drop(buffer);

    if was_empty {
        let now = inner.current_ms.load(Ordering::Acquire);
        *inner.window_start_ms.lock() = Some(now);
    }
}

impl History {
    pub fn view(&self) -> View {
        self.inner.root
    }

    /// Advance the history's notion of "now" and flush the debounce window
    /// if it has elapsed. Callers drive this from their own event loop, or
    /// via [`HistoryClock`].
    pub fn tick(&self, now_ms: u64) {
        self.inner.current_ms.store(now_ms, Ordering::Release);

        let should_flush = {
            let window_start = self.inner.window_start_ms.lock();
            match *window_start {
                Some(start) => now_ms.saturating_sub(start) >= self.inner.options.debounce_ms,
                None => false,
            }
        };
        if should_flush {
            self.flush();
        }
    }

    /// Force-flush the current debounce window immediately, regardless of
    /// elapsed time. Useful for tests and for a `destroy()` that wants to
    /// preserve pending changes as one final undo step.
    pub fn flush(&self) {
        let mut buffer = self.inner.buffer.lock();
        if buffer.is_empty() {
            *self.inner.window_start_ms.lock() = None;
            return;
        }
        let aggregate: Vec<ChangeEvent> = buffer
            .drain(..)
            .map(|(_, b)| coalesce(b))
            .collect();
        drop(buffer);
        *self.inner.window_start_ms.lock() = None;

        let mut backward = self.inner.backward.lock();
        backward.push_back(aggregate);
        while backward.len() > self.inner.options.max_history {
            backward.pop_front();
        }
        drop(backward);

        self.inner.forward.lock().clear();
    }

    pub fn can_backward(&self) -> bool {
        !self.inner.backward.lock().is_empty()
    }

    pub fn can_forward(&self) -> bool {
        !self.inner.forward.lock().is_empty()
    }

    pub fn can_reset(&self) -> bool {
        self.inner.options.resettable
    }

    pub fn backward_list(&self) -> Vec<Vec<ChangeEvent>> {
        self.inner.backward.lock().iter().cloned().collect()
    }

    pub fn forward_list(&self) -> Vec<Vec<ChangeEvent>> {
        self.inner.forward.lock().iter().cloned().collect()
    }

    /// Undo the most recent aggregate entry. Returns `false` if there was
    /// nothing to undo.
    pub fn backward(&self) -> bool {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return false;
        }
        let Some(events) = self.inner.backward.lock().pop_back() else {
            return false;
        };

        self.inner.busy.store(true, Ordering::Release);
        for event in events.iter().rev() {
            apply_inverse(event);
        }
        self.inner.busy.store(false, Ordering::Release);

        let mut forward = self.inner.forward.lock();
        forward.push_back(events);
        while forward.len() > self.inner.options.max_history {
            forward.pop_front();
        }
        true
    }

    /// Redo the most recently undone aggregate entry. Returns `false` if
    /// there was nothing to redo.
    pub fn forward(&self) -> bool {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return false;
        }
        let Some(events) = self.inner.forward.lock().pop_back() else {
            return false;
        };

        self.inner.busy.store(true, Ordering::Release);
        for event in events.iter() {
            apply_forward(event);
        }
        self.inner.busy.store(false, Ordering::Release);

        let mut backward = self.inner.backward.lock();
        backward.push_back(events);
        while backward.len() > self.inner.options.max_history {
            backward.pop_front();
        }
        true
    }

    /// Deep-assign the initial snapshot back into the root view and clear
    /// both lists. A no-op unless `resettable` was set.
    pub fn reset(&self) {
        if !self.inner.options.resettable {
            return;
        }
        let snap = self.inner.initial.lock().clone();
        self.inner.busy.store(true, Ordering::Release);
        if let Err(err) = snapshot::assign_snapshot(self.inner.root, snap) {
            tracing::warn!(error = %err, "history reset: failed to assign initial snapshot");
        }
        self.inner.busy.store(false, Ordering::Release);
        self.inner.backward.lock().clear();
        self.inner.forward.lock().clear();
    }

    /// Discard both lists and the pending buffer without touching the root
    /// view's content.
    pub fn clear(&self) {
        self.inner.buffer.lock().clear();
        *self.inner.window_start_ms.lock() = None;
        self.inner.backward.lock().clear();
        self.inner.forward.lock().clear();
    }

    /// Unsubscribe from the root view and stop recording. A destroyed
    /// history's `backward`/`forward` lists are left intact (still
    /// queryable) but no further changes are captured.
    pub fn destroy(&self) {
        self.inner.destroyed.store(true, Ordering::Release);
        if let Some(unsub) = self.inner.unsubscribe.lock().take() {
            unsub.unsubscribe();
        }
    }
}

fn coalesce(b: Buffered) -> ChangeEvent {
    match (&b.first.kind, &b.latest.kind) {
        (ChangeKind::Set { old, .. }, ChangeKind::Set { new, .. }) => ChangeEvent {
            kind: ChangeKind::Set {
                old: old.clone(),
                new: new.clone(),
            },
            ..b.latest
        },
        _ => b.latest,
    }
}

/// Resolve the view a buffered event's `origin` still refers to, or `None`
/// with a logged warning if the state no longer exists, e.g. because the
/// key path it bubbled through has since been restructured.
fn resolve(event: &ChangeEvent) -> Option<View> {
    if registry::try_meta(event.origin).is_none() {
        tracing::warn!(
            state = ?event.origin,
            key = ?event.key,
            "history: origin state no longer exists; skipping this entry"
        );
        return None;
    }
    Some(View::from_id(event.origin))
}

fn warn_on_err<T>(result: crate::error::Result<T>) {
    if let Err(err) = result {
        tracing::warn!(error = %err, "history: replay mutation failed");
    }
}

fn apply_inverse(event: &ChangeEvent) {
    let Some(target) = resolve(event) else { return };
    let key = event.key.clone();

    match &event.kind {
        ChangeKind::Init => {}
        ChangeKind::Set { old, .. } => match old {
            Some(v) => warn_on_err(target.set(key, v.clone())),
            None => warn_on_err(target.delete(key)),
        },
        ChangeKind::Delete { old } => warn_on_err(target.set(key, old.clone())),
        ChangeKind::Add { value } => warn_on_err(target.delete(Key::Entry(value.clone()))),
        ChangeKind::Clear { entries } => restore_cleared(&target, entries),
        ChangeKind::Assign { old_entries, .. } => restore_assigned(&target, old_entries),
        ChangeKind::Push { items } => {
            let n = items.len();
            let len = target.len();
            let start = len.saturating_sub(n);
            warn_on_err(target.splice(start, n, Vec::new()).map(|_| ()));
        }
        ChangeKind::Pop { item } => warn_on_err(target.push(vec![item.clone()])),
        ChangeKind::Shift { item } => warn_on_err(target.unshift(vec![item.clone()])),
        ChangeKind::Unshift { items } => {
            warn_on_err(target.splice(0, items.len(), Vec::new()).map(|_| ()));
        }
        ChangeKind::Splice {
            start,
            removed,
            inserted,
        } => {
            warn_on_err(target.splice(*start, inserted.len(), removed.clone()).map(|_| ()));
        }
        ChangeKind::Sort { prev_order, .. } => {
            let len = target.len();
            warn_on_err(target.splice(0, len, prev_order.clone()).map(|_| ()));
        }
        ChangeKind::Reverse => warn_on_err(target.reverse()),
        ChangeKind::Fill { start, end, prev, .. } => {
            warn_on_err(target.splice(*start, end - start, prev.clone()).map(|_| ()));
        }
        ChangeKind::CopyWithin { target: at, prev, .. } => {
            warn_on_err(target.splice(*at, prev.len(), prev.clone()).map(|_| ()));
        }
    }
}

fn apply_forward(event: &ChangeEvent) {
    let Some(target) = resolve(event) else { return };
    let key = event.key.clone();

    match &event.kind {
        ChangeKind::Init => {}
        ChangeKind::Set { new, .. } => warn_on_err(target.set(key, new.clone())),
        ChangeKind::Delete { .. } => warn_on_err(target.delete(key)),
        ChangeKind::Add { value } => warn_on_err(target.add(value.clone())),
        ChangeKind::Clear { .. } => warn_on_err(target.clear()),
        ChangeKind::Assign { new_entries, .. } => warn_on_err(target.assign(new_entries.clone())),
        ChangeKind::Push { items } => warn_on_err(target.push(items.clone())),
        ChangeKind::Pop { .. } => {
            warn_on_err(target.pop().map(|_| ()));
        }
        ChangeKind::Shift { .. } => {
            warn_on_err(target.shift().map(|_| ()));
        }
        ChangeKind::Unshift { items } => warn_on_err(target.unshift(items.clone())),
        ChangeKind::Splice {
            start,
            removed,
            inserted,
        } => {
            warn_on_err(
                target
                    .splice(*start, removed.len(), inserted.clone())
                    .map(|_| ()),
            );
        }
        ChangeKind::Sort { new_order, .. } => {
            let len = target.len();
            warn_on_err(target.splice(0, len, new_order.clone()).map(|_| ()));
        }
        ChangeKind::Reverse => warn_on_err(target.reverse()),
        ChangeKind::Fill { value, start, end, .. } => warn_on_err(target.fill(value.clone(), *start, *end)),
        ChangeKind::CopyWithin { target: at, new, .. } => {
            warn_on_err(target.splice(*at, new.len(), new.clone()).map(|_| ()));
        }
    }
}

/// Undo an `assign`: keys that held a value beforehand get that value back;
/// keys that did not exist before the assign are deleted, so the target's
/// key set ends up exactly as it was, not just its previously-present keys.
fn restore_assigned(target: &View, old_entries: &IndexMap<Key, Option<Value>>) {
    let mut to_restore = IndexMap::new();
    let mut to_delete = Vec::new();
    for (key, old) in old_entries {
        match old {
            Some(value) => {
                to_restore.insert(key.clone(), value.clone());
            }
            None => to_delete.push(key.clone()),
        }
    }
    if !to_restore.is_empty() {
        warn_on_err(target.assign(to_restore));
    }
    for key in to_delete {
        warn_on_err(target.delete(key));
    }
}

fn restore_cleared(target: &View, entries: &[(Key, Value)]) {
    match target.kind() {
        crate::value::ViewKind::Object | crate::value::ViewKind::Map => {
            let map: IndexMap<Key, Value> = entries.iter().cloned().collect();
            warn_on_err(target.assign(map));
        }
        crate::value::ViewKind::Array => {
            let items: Vec<Value> = entries.iter().map(|(_, v)| v.clone()).collect();
            warn_on_err(target.splice(0, 0, items).map(|_| ()));
        }
        crate::value::ViewKind::Set => {
            for (_, v) in entries {
                warn_on_err(target.add(v.clone()));
            }
        }
    }
}

/// An optional background-thread driver for [`History::tick`], for hosts
/// without their own event loop. Spawns one `std::thread` per `History`
/// instance and sleeps in a loop. Dropping the handle stops the thread.
pub struct HistoryClock {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl HistoryClock {
    /// Spawn a thread that calls `history.tick` every `resolution_ms`,
    /// advancing its clock by wall-clock elapsed time.
    pub fn spawn(history: History, resolution_ms: u64) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = Arc::clone(&stop);
        let start = std::time::Instant::now();
        let handle = std::thread::spawn(move || {
            while !stop_for_thread.load(Ordering::Acquire) {
                std::thread::sleep(std::time::Duration::from_millis(resolution_ms));
                let elapsed_ms = start.elapsed().as_millis() as u64;
                history.tick(elapsed_ms);
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HistoryClock {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::WrapOptions;
    use crate::state::wrap;
    use crate::value::RawValue;

    fn object_view() -> View {
        wrap(RawValue::Object(IndexMap::new()), WrapOptions::default())
    }

    #[test]
    fn backward_then_forward_restores_content() {
        let view = object_view();
        view.set("v", 0.0).unwrap();
        let h = history(view, HistoryOptions::default().debounce_ms(10));

        view.set("v", 1.0).unwrap();
        h.tick(10);
        view.set("v", 2.0).unwrap();
        h.tick(20);

        assert_eq!(view.get("v"), Some(Value::Num(2.0)));

        assert!(h.backward());
        assert_eq!(view.get("v"), Some(Value::Num(1.0)));

        assert!(h.backward());
        assert_eq!(view.get("v"), Some(Value::Num(0.0)));
        assert!(!h.backward());

        assert!(h.forward());
        assert_eq!(view.get("v"), Some(Value::Num(1.0)));

        assert!(h.forward());
        assert_eq!(view.get("v"), Some(Value::Num(2.0)));
        assert!(!h.forward());
    }

    #[test]
    fn debounce_window_coalesces_rapid_sets() {
        let view = object_view();
        let h = history(view, HistoryOptions::default().debounce_ms(50));

        view.set("v", 1.0).unwrap();
        view.set("v", 2.0).unwrap();
        view.set("v", 3.0).unwrap();
        h.tick(50);

        assert_eq!(h.backward_list().len(), 1);
        assert!(h.backward());
        assert_eq!(view.get("v"), None);
    }

    #[test]
    fn reset_restores_initial_snapshot_when_resettable() {
        let view = object_view();
        view.set("v", 0.0).unwrap();
        let h = history(view, HistoryOptions::default().resettable(true));

        view.set("v", 1.0).unwrap();
        h.flush();
        view.set("v", 2.0).unwrap();
        h.flush();

        h.reset();
        assert_eq!(view.get("v"), Some(Value::Num(0.0)));
        assert!(!h.can_backward());
        assert!(!h.can_forward());
    }

    #[test]
    fn destroy_stops_recording_further_changes() {
        let view = object_view();
        let h = history(view, HistoryOptions::default());

        view.set("v", 1.0).unwrap();
        h.flush();
        h.destroy();

        view.set("v", 2.0).unwrap();
        h.flush();

        assert_eq!(h.backward_list().len(), 1);
    }

    #[test]
    fn max_history_discards_oldest() {
        let view = object_view();
        let h = history(view, HistoryOptions::default().max_history(2));

        for i in 1..=3 {
            view.set("v", i as f64).unwrap();
            h.flush();
        }

        assert_eq!(h.backward_list().len(), 2);
    }

    #[test]
    fn undo_assign_removes_keys_it_introduced() {
        use crate::value::Key;

        let view = object_view();
        view.set("a", 1.0).unwrap();
        let h = history(view, HistoryOptions::default());

        let mut entries = IndexMap::new();
        entries.insert(Key::from("a"), Value::Num(2.0));
        entries.insert(Key::from("b"), Value::Num(3.0));
        view.assign(entries).unwrap();
        h.flush();

        assert_eq!(view.get("a"), Some(Value::Num(2.0)));
        assert_eq!(view.get("b"), Some(Value::Num(3.0)));

        assert!(h.backward());
        assert_eq!(view.get("a"), Some(Value::Num(1.0)));
        assert_eq!(view.get("b"), None);
    }

    #[test]
    fn undo_redo_round_trips_an_array_push() {
        let view = wrap(RawValue::Array(Vec::new()), WrapOptions::default());
        let h = history(view, HistoryOptions::default());

        view.push(vec![Value::Num(1.0), Value::Num(2.0)]).unwrap();
        h.flush();
        assert_eq!(view.len(), 2);

        h.backward();
        assert_eq!(view.len(), 0);

        h.forward();
        assert_eq!(view.len(), 2);
    }

    #[test]
    fn history_clock_drives_tick_in_background() {
        let view = object_view();
        let h = history(view, HistoryOptions::default().debounce_ms(20));
        let clock = HistoryClock::spawn(h.clone(), 5);

        view.set("v", 1.0).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(80));

        assert!(h.can_backward());
        clock.stop();
    }
}
