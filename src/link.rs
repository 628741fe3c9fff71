//! Parent/child back-edge bookkeeping.
//!
//! `link`/`unlink` only maintain the bookkeeping the event propagator walks
//! to bubble a change upward. Nothing in this module cascades a `destroy()`:
//! a child left with no other parent is not destroyed in turn, only made a
//! candidate for it.

use crate::registry::{self, ParentLink, StateId};
use crate::value::Key;

/// Record that `child` is reachable from `parent` at `key`.
///
/// Idempotent: re-linking the same `(parent, key)` to the same child is a
/// no-op. Re-linking a *different* child to an already-occupied `(parent,
/// key)` slot first unlinks the previous occupant, so the last assignment
/// through a slot owns the back-edge.
pub(crate) fn link(parent: StateId, key: Key, child: StateId) {
    if parent == child {
        tracing::warn!(state = ?parent, "refusing to link a state as its own child");
        return;
    }

    let parent_meta = registry::meta(parent);
    let previous = parent_meta
        .children
        .lock()
        .insert(key.clone(), child);

    if let Some(previous) = previous {
        if previous == child {
            return;
        }
        unlink(parent, &key, previous);
    }

    if let Some(child_meta) = registry::try_meta(child) {
        let mut parents = child_meta.parents.lock();
        if !parents
            .iter()
            .any(|l| l.parent == parent && l.key == key)
        {
            parents.push(ParentLink {
                parent,
                key: key.clone(),
            });
        }
    }
}

/// Remove the `(parent, key)` -> `child` back-edge in both directions.
pub(crate) fn unlink(parent: StateId, key: &Key, child: StateId) {
    if let Some(parent_meta) = registry::try_meta(parent) {
        let mut children = parent_meta.children.lock();
        if children.get(key) == Some(&child) {
            children.remove(key);
        }
    }
    if let Some(child_meta) = registry::try_meta(child) {
        child_meta
            .parents
            .lock()
            .retain(|l| !(l.parent == parent && l.key == *key));
    }
}

/// Remove every back-edge into or out of `state`, without touching its
/// children's or parents' own metadata entries (callers walk `parents`/
/// `children` first if they need to cascade).
pub(crate) fn unlink_all(state: StateId) {
    let Some(meta) = registry::try_meta(state) else {
        return;
    };

    let parents: Vec<ParentLink> = meta.parents.lock().drain(..).collect();
    for link in &parents {
        if let Some(parent_meta) = registry::try_meta(link.parent) {
            let mut children = parent_meta.children.lock();
            if children.get(&link.key) == Some(&state) {
                children.remove(&link.key);
            }
        }
    }

    let children: Vec<(Key, StateId)> = meta.children.lock().drain().collect();
    for (key, child) in &children {
        if let Some(child_meta) = registry::try_meta(*child) {
            child_meta
                .parents
                .lock()
                .retain(|l| !(l.parent == state && l.key == *key));
        }
    }
}

/// Every `(parent, key)` pair through which `state` is currently reachable.
pub(crate) fn parents_of(state: StateId) -> Vec<ParentLink> {
    registry::try_meta(state)
        .map(|m| m.parents.lock().clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::RawValue;
    use crate::WrapOptions;
    use indexmap::IndexMap;

    fn new_state() -> StateId {
        registry::insert(RawValue::Object(IndexMap::new()), WrapOptions::default())
    }

    #[test]
    fn link_records_both_directions() {
        let parent = new_state();
        let child = new_state();
        link(parent, Key::from("a"), child);

        let links = parents_of(child);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].parent, parent);
        assert_eq!(links[0].key, Key::from("a"));
    }

    #[test]
    fn relinking_same_slot_replaces_previous_child() {
        let parent = new_state();
        let first = new_state();
        let second = new_state();

        link(parent, Key::from("a"), first);
        link(parent, Key::from("a"), second);

        assert!(parents_of(first).is_empty());
        assert_eq!(parents_of(second)[0].parent, parent);
    }

    #[test]
    fn unlink_all_clears_every_edge() {
        let parent = new_state();
        let child = new_state();
        link(parent, Key::from("a"), child);
        unlink_all(child);
        assert!(parents_of(child).is_empty());
    }
}
