//! The read/write/delete implementations every container kind routes
//! through.
//!
//! Rust has no `Proxy`, so these are plain functions dispatched by `View`'s
//! methods (`state.rs`) rather than trap objects installed per-property.
//!
//! Every mutating function here takes `authorized: bool`. `false` means
//! "check this state's own immutable flag" (a plain `View`'s call site).
//! `true` means a write-contract already cleared this write (a `Writable`
//! facade's call site), so the immutable flag on the underlying state is
//! deliberately bypassed. That's the whole point of a contract over an
//! immutable base.

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};

use crate::context;
use crate::error::{Result, ResultExt, Violation};
use crate::event::{self, ChangeEvent, ChangeKind};
use crate::link;
use crate::observer;
use crate::registry::{self, StateId};
use crate::value::{Key, RawValue, Value};

/// Read the current value at `key`, lazily wrapping a not-yet-reactive
/// child container and recording the read against the ambient observer.
pub(crate) fn get(state: StateId, key: &Key) -> Option<Value> {
    let meta = registry::meta(state);

    if meta.options.observable {
        context::record_read(state, key);
    }

    let existing = read_slot(&meta.raw.lock(), key)?;

    let resolved = match existing {
        Value::Unwrapped(raw) if meta.options.recursive => {
            let child_raw = Arc::try_unwrap(raw).unwrap_or_else(|arc| (*arc).clone());
            let child_options = meta.options.clone();
            let child_id = registry::insert(child_raw, child_options);
            link::link(state, key.clone(), child_id);
            let resolved = Value::Child(child_id);
            write_slot(&mut meta.raw.lock(), key, resolved.clone());
            tracing::trace!(state = ?state, key = ?key, child = ?child_id, "lazily wrapped child");
            resolved
        }
        other => other,
    };

    Some(resolved)
}

/// Write `new_value` at `key`. No-op if the existing value is equal to
/// `new_value`.
pub(crate) fn set(state: StateId, key: Key, new_value: Value, authorized: bool) -> Result<()> {
    let meta = registry::meta(state);

    if !authorized && meta.immutable.load(std::sync::atomic::Ordering::Acquire) {
        return Err(Violation::ReadOnly { key });
    }

    if let Some(observer) = context::current_observer() {
        observer::check_circular(&observer, state, &key)?;
    }

    let old = read_slot(&meta.raw.lock(), &key);
    if old.as_ref() == Some(&new_value) {
        return Ok(());
    }

    if let Some(schema) = &meta.schema {
        if let crate::schema::Validation::Err(message) = schema.validate(&new_value) {
            return Err(Violation::Schema { key, message });
        }
    }

    if let Some(Value::Child(old_id)) = &old {
        link::unlink(state, &key, *old_id);
    }

    let committed = match new_value {
        Value::Unwrapped(raw) if meta.options.recursive => {
            let child_raw = Arc::try_unwrap(raw).unwrap_or_else(|arc| (*arc).clone());
            let child_id = registry::insert(child_raw, meta.options.clone());
            link::link(state, key.clone(), child_id);
            Value::Child(child_id)
        }
        other => other,
    };

    write_slot(&mut meta.raw.lock(), &key, committed.clone());

    event::dispatch(
        state,
        ChangeEvent {
            origin: state,
            key,
            kind: ChangeKind::Set {
                old,
                new: committed,
            },
            key_path: Vec::new(),
        },
    );
    Ok(())
}

/// Remove the value at `key`, detaching its back-edge if it was a child.
pub(crate) fn delete(state: StateId, key: Key, authorized: bool) -> Result<()> {
    let meta = registry::meta(state);

    if !authorized && meta.immutable.load(std::sync::atomic::Ordering::Acquire) {
        return Err(Violation::ReadOnly { key });
    }
    if let Some(observer) = context::current_observer() {
        observer::check_circular(&observer, state, &key)?;
    }

    let old = remove_slot(&mut meta.raw.lock(), &key);
    let Some(old) = old else {
        return Ok(());
    };

    if let Value::Child(old_id) = &old {
        link::unlink(state, &key, *old_id);
    }

    event::dispatch(
        state,
        ChangeEvent {
            origin: state,
            key,
            kind: ChangeKind::Delete { old },
            key_path: Vec::new(),
        },
    );
    Ok(())
}

fn read_slot(raw: &RawValue, key: &Key) -> Option<Value> {
    match (raw, key) {
        (RawValue::Object(m), Key::Name(name)) => m.get(name).cloned(),
        (RawValue::Array(a), Key::Index(i)) => a.get(*i).cloned(),
        (RawValue::Map(m), Key::Entry(k)) => m.get(k).cloned(),
        (RawValue::Set(s), Key::Entry(k)) => s.get(k).cloned(),
        _ => None,
    }
}

fn write_slot(raw: &mut RawValue, key: &Key, value: Value) {
    match (raw, key) {
        (RawValue::Object(m), Key::Name(name)) => {
            m.insert(Arc::clone(name), value);
        }
        (RawValue::Array(a), Key::Index(i)) => {
            if *i < a.len() {
                a[*i] = value;
            } else if *i == a.len() {
                a.push(value);
            }
        }
        (RawValue::Map(m), Key::Entry(k)) => {
            m.insert(k.clone(), value);
        }
        (RawValue::Set(s), Key::Entry(_)) => {
            s.insert(value);
        }
        _ => {}
    }
}

fn remove_slot(raw: &mut RawValue, key: &Key) -> Option<Value> {
    match (raw, key) {
        (RawValue::Object(m), Key::Name(name)) => m.shift_remove(name),
        (RawValue::Array(a), Key::Index(i)) => {
            if *i < a.len() {
                Some(a.remove(*i))
            } else {
                None
            }
        }
        (RawValue::Map(m), Key::Entry(k)) => m.shift_remove(k),
        (RawValue::Set(s), Key::Entry(k)) => {
            if s.shift_remove(k) {
                Some(k.clone())
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Dispatch `kind` as having happened at `state`'s index-0 slot. Every
/// array-level mutation is keyed at index 0 since it can touch the whole
/// array rather than one slot, and an observer tracking any index of this
/// array should see it. Array reads track per-index, so a bulk op has no
/// "whole array" observer to reach directly through `View::get`; the
/// affected indices still get their back-edges fixed up by
/// `relink_array_indices`.
fn emit_array_event(state: StateId, key: Key, kind: ChangeKind) {
    event::dispatch(
        state,
        ChangeEvent {
            origin: state,
            key,
            kind,
            key_path: Vec::new(),
        },
    );
}

/// `push`: append items, no-op on an empty call.
pub(crate) fn push(state: StateId, items: Vec<Value>, authorized: bool) -> Result<()> {
    if items.is_empty() {
        return Ok(());
    }
    guard_array(state, authorized)?;
    let meta = registry::meta(state);
    {
        let mut raw = meta.raw.lock();
        if let RawValue::Array(a) = &mut *raw {
            a.extend(items.iter().cloned());
        }
    }
    emit_array_event(state, Key::Index(0), ChangeKind::Push { items });
    Ok(())
}

/// `pop`: remove and return the last element; no-op on an empty array.
pub(crate) fn pop(state: StateId, authorized: bool) -> Result<Option<Value>> {
    guard_array(state, authorized)?;
    let meta = registry::meta(state);
    let popped = {
        let mut raw = meta.raw.lock();
        match &mut *raw {
            RawValue::Array(a) => a.pop(),
            _ => None,
        }
    };
    if let Some(value) = popped.clone() {
        if let Value::Child(id) = &value {
            link::unlink(state, &Key::Index(0), *id);
        }
        emit_array_event(state, Key::Index(0), ChangeKind::Pop { item: value });
    }
    Ok(popped)
}

/// `shift`: remove and return the first element; no-op on an empty array.
pub(crate) fn shift(state: StateId, authorized: bool) -> Result<Option<Value>> {
    guard_array(state, authorized)?;
    let meta = registry::meta(state);
    let removed = {
        let mut raw = meta.raw.lock();
        match &mut *raw {
            RawValue::Array(a) if !a.is_empty() => Some(a.remove(0)),
            _ => None,
        }
    };
    if let Some(value) = removed.clone() {
        if let Value::Child(id) = &value {
            link::unlink(state, &Key::Index(0), *id);
        }
        relink_array_indices(state);
        emit_array_event(state, Key::Index(0), ChangeKind::Shift { item: value });
    }
    Ok(removed)
}

/// `unshift`: prepend items; no-op on an empty call.
pub(crate) fn unshift(state: StateId, items: Vec<Value>, authorized: bool) -> Result<()> {
    if items.is_empty() {
        return Ok(());
    }
    guard_array(state, authorized)?;
    let meta = registry::meta(state);
    {
        let mut raw = meta.raw.lock();
        if let RawValue::Array(a) = &mut *raw {
            for (offset, item) in items.iter().cloned().enumerate() {
                a.insert(offset, item);
            }
        }
    }
    relink_array_indices(state);
    emit_array_event(state, Key::Index(0), ChangeKind::Unshift { items });
    Ok(())
}

/// `splice(start, delete_count, inserted)`: no-op when `delete_count == 0`
/// and `inserted` is empty.
pub(crate) fn splice(
    state: StateId,
    start: usize,
    delete_count: usize,
    inserted: Vec<Value>,
    authorized: bool,
) -> Result<Vec<Value>> {
    if delete_count == 0 && inserted.is_empty() {
        return Ok(Vec::new());
    }
    guard_array(state, authorized)?;
    let meta = registry::meta(state);
    let removed = {
        let mut raw = meta.raw.lock();
        match &mut *raw {
            RawValue::Array(a) => {
                let end = (start + delete_count).min(a.len());
                let start = start.min(a.len());
                let removed: Vec<Value> = a.splice(start..end, inserted.iter().cloned()).collect();
                removed
            }
            _ => Vec::new(),
        }
    };
    for value in &removed {
        if let Value::Child(id) = value {
            link::unlink(state, &Key::Index(0), *id);
        }
    }
    relink_array_indices(state);
    emit_array_event(
        state,
        Key::Index(start),
        ChangeKind::Splice {
            start,
            removed: removed.clone(),
            inserted,
        },
    );
    Ok(removed)
}

/// `sort`: no-op on length ≤ 1.
pub(crate) fn sort_by(
    state: StateId,
    compare: impl Fn(&Value, &Value) -> std::cmp::Ordering,
    authorized: bool,
) -> Result<()> {
    guard_array(state, authorized)?;
    let meta = registry::meta(state);
    let orders = {
        let mut raw = meta.raw.lock();
        match &mut *raw {
            RawValue::Array(a) if a.len() > 1 => {
                let prev = a.clone();
                a.sort_by(compare);
                Some((prev, a.clone()))
            }
            _ => None,
        }
    };
    if let Some((prev_order, new_order)) = orders {
        relink_array_indices(state);
        emit_array_event(state, Key::Index(0), ChangeKind::Sort { prev_order, new_order });
    }
    Ok(())
}

/// `reverse`: no-op on length ≤ 1.
pub(crate) fn reverse(state: StateId, authorized: bool) -> Result<()> {
    guard_array(state, authorized)?;
    let meta = registry::meta(state);
    let changed = {
        let mut raw = meta.raw.lock();
        match &mut *raw {
            RawValue::Array(a) if a.len() > 1 => {
                a.reverse();
                true
            }
            _ => false,
        }
    };
    if changed {
        relink_array_indices(state);
        emit_array_event(state, Key::Index(0), ChangeKind::Reverse);
    }
    Ok(())
}

/// `fill(value, start, end)`: no-op on an empty range.
pub(crate) fn fill(
    state: StateId,
    value: Value,
    start: usize,
    end: usize,
    authorized: bool,
) -> Result<()> {
    if start >= end {
        return Ok(());
    }
    guard_array(state, authorized)?;
    let meta = registry::meta(state);
    let prev = {
        let mut raw = meta.raw.lock();
        if let RawValue::Array(a) = &mut *raw {
            let end = end.min(a.len());
            let start = start.min(end);
            let prev: Vec<Value> = a[start..end].to_vec();
            for slot in &mut a[start..end] {
                *slot = value.clone();
            }
            prev
        } else {
            Vec::new()
        }
    };
    relink_array_indices(state);
    emit_array_event(
        state,
        Key::Index(start),
        ChangeKind::Fill { value, start, end, prev },
    );
    Ok(())
}

/// `copyWithin(target, start, end)`: no-op when the effective move range is
/// empty.
pub(crate) fn copy_within(
    state: StateId,
    target: usize,
    start: usize,
    end: usize,
    authorized: bool,
) -> Result<()> {
    if start >= end || target == start {
        return Ok(());
    }
    guard_array(state, authorized)?;
    let meta = registry::meta(state);
    let (prev, new) = {
        let mut raw = meta.raw.lock();
        if let RawValue::Array(a) = &mut *raw {
            let len = a.len();
            let end = end.min(len);
            let start = start.min(end);
            let slice: Vec<Value> = a[start..end].to_vec();
            let copy_len = slice.len().min(len.saturating_sub(target));
            let prev: Vec<Value> = a[target..target + copy_len].to_vec();
            let new: Vec<Value> = slice.into_iter().take(copy_len).collect();
            for (offset, value) in new.iter().cloned().enumerate() {
                a[target + offset] = value;
            }
            (prev, new)
        } else {
            (Vec::new(), Vec::new())
        }
    };
    relink_array_indices(state);
    emit_array_event(
        state,
        Key::Index(target),
        ChangeKind::CopyWithin { target, prev, new },
    );
    Ok(())
}

fn guard_array(state: StateId, authorized: bool) -> Result<()> {
    let meta = registry::meta(state);
    if !authorized && meta.immutable.load(std::sync::atomic::Ordering::Acquire) {
        return Err(Violation::ReadOnly {
            key: Key::Index(0),
        });
    }
    Ok(())
}

/// After an index-shifting array mutation, re-point every remaining child's
/// `ParentLink` at its new index.
fn relink_array_indices(state: StateId) {
    let meta = registry::meta(state);
    let raw = meta.raw.lock();
    let RawValue::Array(items) = &*raw else {
        return;
    };
    let mut children = meta.children.lock();
    children.clear();
    for (index, item) in items.iter().enumerate() {
        if let Value::Child(child_id) = item {
            children.insert(Key::Index(index), *child_id);
            if let Some(child_meta) = registry::try_meta(*child_id) {
                let mut parents = child_meta.parents.lock();
                parents.retain(|l| l.parent != state);
                parents.push(crate::registry::ParentLink {
                    parent: state,
                    key: Key::Index(index),
                });
            }
        }
    }
}

/// Map `set(key, value)`.
pub(crate) fn map_set(state: StateId, key: Value, value: Value, authorized: bool) -> Result<()> {
    set(state, Key::Entry(key), value, authorized)
}

/// Map/set `delete(key)`.
pub(crate) fn entry_delete(state: StateId, key: Value, authorized: bool) -> Result<bool> {
    let meta = registry::meta(state);
    let existed = read_slot(&meta.raw.lock(), &Key::Entry(key.clone())).is_some();
    delete(state, Key::Entry(key), authorized)?;
    Ok(existed)
}

/// `Set::add(value)`.
pub(crate) fn set_add(state: StateId, value: Value, authorized: bool) -> Result<()> {
    let meta = registry::meta(state);
    if !authorized && meta.immutable.load(std::sync::atomic::Ordering::Acquire) {
        return Err(Violation::ReadOnly {
            key: Key::Entry(value),
        });
    }
    let already_present = {
        let raw = meta.raw.lock();
        matches!(&*raw, RawValue::Set(s) if s.contains(&value))
    };
    if already_present {
        return Ok(());
    }
    {
        let mut raw = meta.raw.lock();
        if let RawValue::Set(s) = &mut *raw {
            s.insert(value.clone());
        }
    }
    event::dispatch(
        state,
        ChangeEvent {
            origin: state,
            key: Key::Entry(value.clone()),
            kind: ChangeKind::Add { value },
            key_path: Vec::new(),
        },
    );
    Ok(())
}

/// `Set::has(value)` / `Map::has(key)`: a plain read, tracked like `get`.
pub(crate) fn has(state: StateId, key: &Value) -> bool {
    let meta = registry::meta(state);
    if meta.options.observable {
        context::record_read(state, &Key::Entry(key.clone()));
    }
    let raw = meta.raw.lock();
    match &*raw {
        RawValue::Set(s) => s.contains(key),
        RawValue::Map(m) => m.contains_key(key),
        _ => false,
    }
}

/// `clear()` on a `Map`/`Set`/`Object`/`Array`; no-op when already empty.
pub(crate) fn clear(state: StateId, authorized: bool) -> Result<()> {
    let meta = registry::meta(state);
    if !authorized && meta.immutable.load(std::sync::atomic::Ordering::Acquire) {
        return Err(Violation::ReadOnly {
            key: Key::Index(0),
        });
    }

    let was_empty = meta.raw.lock().is_empty();
    if was_empty {
        return Ok(());
    }

    let entries: Vec<(Key, Value)> = {
        let raw = meta.raw.lock();
        match &*raw {
            RawValue::Object(m) => m
                .iter()
                .map(|(k, v)| (Key::Name(Arc::clone(k)), v.clone()))
                .collect(),
            RawValue::Array(a) => a
                .iter()
                .cloned()
                .enumerate()
                .map(|(i, v)| (Key::Index(i), v))
                .collect(),
            RawValue::Map(m) => m.iter().map(|(k, v)| (Key::Entry(k.clone()), v.clone())).collect(),
            RawValue::Set(s) => s.iter().map(|v| (Key::Entry(v.clone()), v.clone())).collect(),
        }
    };
    for (key, value) in &entries {
        if let Value::Child(id) = value {
            link::unlink(state, key, *id);
        }
    }

    {
        let mut raw = meta.raw.lock();
        match &mut *raw {
            RawValue::Object(m) => m.clear(),
            RawValue::Array(a) => a.clear(),
            RawValue::Map(m) => m.clear(),
            RawValue::Set(s) => s.clear(),
        }
    }
    meta.children.lock().clear();

    emit_array_event(state, Key::Index(0), ChangeKind::Clear { entries });
    Ok(())
}

/// Assign every entry of `new_entries` into an `Object`/`Map`/`Array`,
/// merging by key rather than replacing the whole container and emitting
/// exactly one `Assign` event carrying both the previous and new values.
/// Used by `History::backward` to restore an `assign`-kind event, by
/// `pipe()` to write a transformed snapshot into a target view, and by
/// loader-style adapters restoring persisted state.
pub(crate) fn assign(state: StateId, new_entries: IndexMap<Key, Value>, authorized: bool) -> Result<()> {
    let meta = registry::meta(state);
    if !authorized && meta.immutable.load(std::sync::atomic::Ordering::Acquire) {
        return Err(Violation::ReadOnly {
            key: Key::Index(0),
        });
    }
    if new_entries.is_empty() {
        return Ok(());
    }

    let mut old_entries = IndexMap::new();
    for (key, value) in &new_entries {
        let old = read_slot(&meta.raw.lock(), key);
        old_entries.insert(key.clone(), old.clone());
        if let Some(Value::Child(old_id)) = &old {
            link::unlink(state, key, *old_id);
        }

        let committed = match value.clone() {
            Value::Unwrapped(raw) if meta.options.recursive => {
                let child_raw = Arc::try_unwrap(raw).unwrap_or_else(|arc| (*arc).clone());
                let child_id = registry::insert(child_raw, meta.options.clone());
                link::link(state, key.clone(), child_id);
                Value::Child(child_id)
            }
            other => other,
        };
        write_slot(&mut meta.raw.lock(), key, committed);
    }

    event::dispatch(
        state,
        ChangeEvent {
            origin: state,
            key: Key::Index(0),
            kind: ChangeKind::Assign { old_entries, new_entries },
            key_path: Vec::new(),
        },
    );
    Ok(())
}

/// Helper for `ordered()` views: binary-search insertion below a heuristic
/// item-count threshold, else bulk insert + full sort.
pub(crate) fn ordered_insert(
    state: StateId,
    items: Vec<Value>,
    compare: impl Fn(&Value, &Value) -> std::cmp::Ordering,
    authorized: bool,
) -> Result<()> {
    const BINARY_SEARCH_THRESHOLD: usize = 5;
    guard_array(state, authorized)?;
    let meta = registry::meta(state);
    let items_for_event = items.clone();
    {
        let mut raw = meta.raw.lock();
        if let RawValue::Array(a) = &mut *raw {
            if items.len() < BINARY_SEARCH_THRESHOLD {
                for item in items {
                    let pos = a
                        .binary_search_by(|probe| compare(probe, &item))
                        .unwrap_or_else(|e| e);
                    a.insert(pos, item);
                }
            } else {
                a.extend(items);
                a.sort_by(compare);
            }
        }
    }
    relink_array_indices(state);
    emit_array_event(state, Key::Index(0), ChangeKind::Push { items: items_for_event });
    Ok(())
}

#[allow(dead_code)]
pub(crate) type ObjectEntries = IndexMap<Arc<str>, Value>;
#[allow(dead_code)]
pub(crate) type SetEntries = IndexSet<Value>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WrapOptions;

    fn new_object() -> StateId {
        registry::insert(RawValue::Object(IndexMap::new()), WrapOptions::default())
    }

    fn new_array(items: Vec<Value>) -> StateId {
        registry::insert(RawValue::Array(items), WrapOptions::default())
    }

    #[test]
    fn set_then_get_roundtrips() {
        let state = new_object();
        set(state, Key::from("a"), Value::Num(1.0), false).unwrap();
        assert_eq!(get(state, &Key::from("a")), Some(Value::Num(1.0)));
    }

    #[test]
    fn same_value_set_is_a_no_op() {
        let state = new_object();
        set(state, Key::from("a"), Value::Num(1.0), false).unwrap();
        let before = registry::meta(state).raw.lock().len();
        set(state, Key::from("a"), Value::Num(1.0), false).unwrap();
        assert_eq!(registry::meta(state).raw.lock().len(), before);
    }

    #[test]
    fn immutable_state_rejects_unauthorized_write() {
        let state = registry::insert(
            RawValue::Object(IndexMap::new()),
            WrapOptions::default().immutable(true),
        );
        let err = set(state, Key::from("a"), Value::Num(1.0), false).unwrap_err();
        assert!(matches!(err, Violation::ReadOnly { .. }));
    }

    #[test]
    fn authorized_write_bypasses_immutable_flag() {
        let state = registry::insert(
            RawValue::Object(IndexMap::new()),
            WrapOptions::default().immutable(true),
        );
        set(state, Key::from("a"), Value::Num(1.0), true).unwrap();
        assert_eq!(get(state, &Key::from("a")), Some(Value::Num(1.0)));
    }

    #[test]
    fn push_with_no_items_is_a_no_op() {
        let state = new_array(vec![Value::Num(1.0)]);
        push(state, Vec::new(), false).unwrap();
        assert_eq!(registry::meta(state).raw.lock().len(), 1);
    }

    #[test]
    fn pop_on_empty_array_is_a_no_op() {
        let state = new_array(Vec::new());
        assert_eq!(pop(state, false).unwrap(), None);
    }

    #[test]
    fn splice_replaces_range_and_returns_removed() {
        let state = new_array(vec![Value::Num(1.0), Value::Num(2.0), Value::Num(3.0)]);
        let removed = splice(state, 1, 1, vec![Value::Num(9.0)], false).unwrap();
        assert_eq!(removed, vec![Value::Num(2.0)]);
        let raw = registry::meta(state).raw.lock();
        match &*raw {
            RawValue::Array(a) => {
                assert_eq!(a, &vec![Value::Num(1.0), Value::Num(9.0), Value::Num(3.0)])
            }
            _ => panic!("expected array"),
        }
    }

    #[test]
    fn sort_on_single_element_is_a_no_op() {
        let state = new_array(vec![Value::Num(1.0)]);
        sort_by(state, |a, b| {
            let (Value::Num(a), Value::Num(b)) = (a, b) else {
                unreachable!()
            };
            a.partial_cmp(b).unwrap()
        }, false)
        .unwrap();
        assert_eq!(registry::meta(state).raw.lock().len(), 1);
    }

    #[test]
    fn clear_on_empty_object_is_a_no_op() {
        let state = new_object();
        clear(state, false).unwrap();
    }

    #[test]
    fn set_add_dedupes() {
        let state = registry::insert(RawValue::Set(IndexSet::new()), WrapOptions::default());
        set_add(state, Value::Num(1.0), false).unwrap();
        set_add(state, Value::Num(1.0), false).unwrap();
        assert_eq!(registry::meta(state).raw.lock().len(), 1);
    }
}
