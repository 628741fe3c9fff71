//! Deep, observation-free reads.
//!
//! A [`Snapshot`] is the plain, non-reactive analogue of
//! [`crate::value::RawValue`]: nested containers are inlined rather than
//! held by `StateId` back-reference, so it can be handed to a caller,
//! serialized, or compared with `==` without touching the registry again.

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};

use crate::context;
use crate::error::Result;
use crate::registry;
use crate::state::View;
use crate::value::{Key, RawValue, Value};

/// A deep, plain copy of a reactive view's contents. Unlike [`RawValue`],
/// nested containers are inlined rather than held by `StateId` reference —
/// a `Snapshot` carries no registry identity and reading it never tracks.
#[derive(Debug, Clone)]
pub enum Snapshot {
    Null,
    Bool(bool),
    Num(f64),
    Str(Arc<str>),
    Object(IndexMap<Arc<str>, Snapshot>),
    Array(Vec<Snapshot>),
    Map(IndexMap<Snapshot, Snapshot>),
    Set(IndexSet<Snapshot>),
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Snapshot::Null, Snapshot::Null) => true,
            (Snapshot::Bool(a), Snapshot::Bool(b)) => a == b,
            (Snapshot::Num(a), Snapshot::Num(b)) => a.to_bits() == b.to_bits(),
            (Snapshot::Str(a), Snapshot::Str(b)) => a == b,
            (Snapshot::Object(a), Snapshot::Object(b)) => a == b,
            (Snapshot::Array(a), Snapshot::Array(b)) => a == b,
            (Snapshot::Map(a), Snapshot::Map(b)) => a == b,
            (Snapshot::Set(a), Snapshot::Set(b)) => a == b,
            _ => false,
        }
    }
}
impl Eq for Snapshot {}

impl std::hash::Hash for Snapshot {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Snapshot::Null => {}
            Snapshot::Bool(b) => b.hash(state),
            Snapshot::Num(n) => n.to_bits().hash(state),
            Snapshot::Str(s) => s.hash(state),
            Snapshot::Object(m) => {
                for (k, v) in m {
                    k.hash(state);
                    v.hash(state);
                }
            }
            Snapshot::Array(a) => a.hash(state),
            Snapshot::Map(m) => {
                for (k, v) in m {
                    k.hash(state);
                    v.hash(state);
                }
            }
            Snapshot::Set(s) => {
                for v in s {
                    v.hash(state);
                }
            }
        }
    }
}

fn value_to_snapshot(value: &Value) -> Snapshot {
    match value {
        Value::Null => Snapshot::Null,
        Value::Bool(b) => Snapshot::Bool(*b),
        Value::Num(n) => Snapshot::Num(*n),
        Value::Str(s) => Snapshot::Str(Arc::clone(s)),
        Value::Child(id) => raw_to_snapshot(&registry::meta(*id).raw.lock()),
        Value::Unwrapped(raw) => raw_to_snapshot(raw),
    }
}

fn raw_to_snapshot(raw: &RawValue) -> Snapshot {
    match raw {
        RawValue::Object(m) => Snapshot::Object(
            m.iter()
                .map(|(k, v)| (Arc::clone(k), value_to_snapshot(v)))
                .collect(),
        ),
        RawValue::Array(a) => Snapshot::Array(a.iter().map(value_to_snapshot).collect()),
        RawValue::Map(m) => Snapshot::Map(
            m.iter()
                .map(|(k, v)| (value_to_snapshot(k), value_to_snapshot(v)))
                .collect(),
        ),
        RawValue::Set(s) => Snapshot::Set(s.iter().map(value_to_snapshot).collect()),
    }
}

/// Deep-copy `view`'s contents without registering any dependency. A
/// snapshot read never tracks, regardless of whether a mutation is in
/// progress.
pub fn snapshot(view: View) -> Snapshot {
    context::untrack(|| raw_to_snapshot(&registry::meta(view.id()).raw.lock()))
}

/// Run `f` with dependency tracking suppressed.
pub fn read<R>(f: impl FnOnce() -> R) -> R {
    context::untrack(f)
}

fn escape_json(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
}

fn write_json(snap: &Snapshot, out: &mut String) {
    match snap {
        Snapshot::Null => out.push_str("null"),
        Snapshot::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Snapshot::Num(n) => {
            if n.is_finite() {
                out.push_str(&format!("{n}"));
            } else {
                out.push_str("null");
            }
        }
        Snapshot::Str(s) => escape_json(s, out),
        Snapshot::Object(m) => {
            out.push('{');
            for (i, (k, v)) in m.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                escape_json(k, out);
                out.push(':');
                write_json(v, out);
            }
            out.push('}');
        }
        Snapshot::Array(a) => {
            out.push('[');
            for (i, v) in a.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json(v, out);
            }
            out.push(']');
        }
        // Neither kind has a native JSON representation; both encode as an
        // array of `[key, value]` pairs / `[member]`s, mirroring
        // `JSON.stringify` on a `Map`/`Set` run through `Array.from`.
        Snapshot::Map(m) => {
            out.push('[');
            for (i, (k, v)) in m.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push('[');
                write_json(k, out);
                out.push(',');
                write_json(v, out);
                out.push(']');
            }
            out.push(']');
        }
        Snapshot::Set(s) => {
            out.push('[');
            for (i, v) in s.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json(v, out);
            }
            out.push(']');
        }
    }
}

/// `snapshot(view)` followed by a JSON encoding of the result.
pub fn stringify(view: View) -> String {
    let snap = snapshot(view);
    let mut out = String::new();
    write_json(&snap, &mut out);
    out
}

fn snapshot_to_value(snap: Snapshot) -> Value {
    match snap {
        Snapshot::Null => Value::Null,
        Snapshot::Bool(b) => Value::Bool(b),
        Snapshot::Num(n) => Value::Num(n),
        Snapshot::Str(s) => Value::Str(s),
        other => Value::Unwrapped(Arc::new(snapshot_to_raw(other))),
    }
}

fn snapshot_to_raw(snap: Snapshot) -> RawValue {
    match snap {
        Snapshot::Object(m) => {
            RawValue::Object(m.into_iter().map(|(k, v)| (k, snapshot_to_value(v))).collect())
        }
        Snapshot::Array(a) => RawValue::Array(a.into_iter().map(snapshot_to_value).collect()),
        Snapshot::Map(m) => RawValue::Map(
            m.into_iter()
                .map(|(k, v)| (snapshot_to_value(k), snapshot_to_value(v)))
                .collect(),
        ),
        Snapshot::Set(s) => RawValue::Set(s.into_iter().map(snapshot_to_value).collect()),
        _ => RawValue::Object(IndexMap::new()),
    }
}

/// Assign a whole snapshot into `target`, used by `pipe`'s write side and
/// by persistence adapters restoring loaded state. Errors if `target`'s
/// kind cannot accept `snap`'s entries.
pub fn assign_snapshot(target: View, snap: Snapshot) -> Result<()> {
    use crate::value::ViewKind;

    match (target.kind(), snap) {
        (ViewKind::Object, Snapshot::Object(m)) => {
            let entries: IndexMap<Key, Value> = m
                .into_iter()
                .map(|(k, v)| (Key::Name(k), snapshot_to_value(v)))
                .collect();
            crate::traps::assign(target.id(), entries, false)
        }
        (ViewKind::Map, Snapshot::Map(m)) => {
            let entries: IndexMap<Key, Value> = m
                .into_iter()
                .map(|(k, v)| (Key::Entry(snapshot_to_value(k)), snapshot_to_value(v)))
                .collect();
            crate::traps::assign(target.id(), entries, false)
        }
        (ViewKind::Array, Snapshot::Array(items)) => {
            let items: Vec<Value> = items.into_iter().map(snapshot_to_value).collect();
            let len = target.len();
            crate::traps::splice(target.id(), 0, len, items, false).map(|_| ())
        }
        (ViewKind::Set, Snapshot::Set(members)) => {
            crate::traps::clear(target.id(), false)?;
            for member in members {
                crate::traps::set_add(target.id(), snapshot_to_value(member), false)?;
            }
            Ok(())
        }
        _ => Err(crate::error::Violation::Init),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::WrapOptions;
    use crate::state::wrap;

    #[test]
    fn snapshot_is_deep_and_plain() {
        let inner = RawValue::Object(IndexMap::from([(Arc::from("n"), Value::from("A"))]));
        let outer = wrap(
            RawValue::Object(IndexMap::from([(
                Arc::from("p"),
                Value::Unwrapped(Arc::new(inner)),
            )])),
            WrapOptions::default(),
        );

        let snap = snapshot(outer);
        match snap {
            Snapshot::Object(m) => match m.get("p") {
                Some(Snapshot::Object(inner)) => {
                    assert_eq!(inner.get("n"), Some(&Snapshot::Str(Arc::from("A"))));
                }
                other => panic!("expected nested object snapshot, got {other:?}"),
            },
            other => panic!("expected object snapshot, got {other:?}"),
        }
    }

    #[test]
    fn snapshot_does_not_register_a_dependency() {
        let view = wrap(RawValue::Object(IndexMap::new()), WrapOptions::default());
        view.set("a", 1.0).unwrap();

        let observer = crate::observer::create_observer();
        observer.run(|| {
            let _ = snapshot(view);
        });
        assert!(!observer.has_tracked(view.id(), &Key::from("a")));
    }

    #[test]
    fn stringify_produces_json() {
        let view = wrap(RawValue::Object(IndexMap::new()), WrapOptions::default());
        view.set("a", 1.0).unwrap();
        assert_eq!(stringify(view), r#"{"a":1}"#);
    }

    #[test]
    fn assign_snapshot_writes_into_object_target() {
        let target = wrap(RawValue::Object(IndexMap::new()), WrapOptions::default());
        let snap = Snapshot::Object(IndexMap::from([(Arc::from("x"), Snapshot::Num(5.0))]));
        assign_snapshot(target, snap).unwrap();
        assert_eq!(target.get("x"), Some(Value::Num(5.0)));
    }
}
