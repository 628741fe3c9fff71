//! Typed violations for the reactive runtime.
//!
//! Every violation is recovered locally by default: the offending mutation
//! or read returns without side effects and a diagnostic is logged through
//! `tracing`. Strict mode (opt in per state or per schema) escalates
//! `SchemaViolation` and some `ContractViolation`s into a returned `Err`
//! instead of a silent no-op.

use thiserror::Error;

use crate::context::ObserverId;
use crate::registry::StateId;
use crate::value::Key;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Violation>;

/// One entry in the violation taxonomy.
#[derive(Error, Debug, Clone)]
pub enum Violation {
    /// Attempt to wrap a value that isn't a record/array/set/map.
    #[error("cannot wrap a non-container value as reactive state")]
    Init,

    /// Write attempted on an immutable view.
    #[error("write to {key:?} rejected: view is immutable")]
    ReadOnly { key: Key },

    /// Write attempted outside a write-contract's allow-list.
    #[error("write to {key:?} rejected: not present in write-contract allow-list")]
    Contract { key: Key },

    /// Value failed schema validation.
    #[error("value at {key:?} failed schema validation: {message}")]
    Schema { key: Key, message: String },

    /// Mutation attempted on a state being read by the currently running observer.
    #[error("observer {observer:?} attempted to mutate state it is currently reading")]
    Circular { observer: ObserverId, state: StateId },

    /// An observer tracked more distinct states than its configured budget.
    #[error("observer {observer:?} exceeded its observation budget ({tracked} > {threshold}); wrap bulk reads in `read()`")]
    UnsafeObservation {
        observer: ObserverId,
        tracked: usize,
        threshold: usize,
    },

    /// A trap was invoked on a state with no registered metadata.
    ///
    /// Should be unreachable from the public API; indicates an internal bug.
    #[error("trap invoked on unregistered state {0:?}")]
    TrapMisuse(StateId),

    /// `history()` was called on a view that is not backed by reactive state.
    #[error("history() requires a reactive view")]
    HistoryMisuse,

    /// A subscriber or effect handler panicked.
    #[error("subscriber handler panicked: {0}")]
    ExternalHandler(String),
}

/// Extension trait adding contextual logging to `Result<T, Violation>`.
pub trait ResultExt<T> {
    /// Log the violation (if any) at `warn` level and convert to `Option`,
    /// matching the crate's default "recover locally" propagation policy.
    fn recover(self, strict: bool) -> Result<Option<T>>;
}

impl<T> ResultExt<T> for Result<T> {
    fn recover(self, strict: bool) -> Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(violation) => {
                tracing::warn!(error = %violation, strict, "reactive violation recovered");
                if strict
                    && matches!(
                        violation,
                        Violation::Schema { .. } | Violation::Contract { .. } | Violation::ReadOnly { .. }
                    )
                {
                    Err(violation)
                } else {
                    Ok(None)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_mentions_key() {
        let v = Violation::ReadOnly {
            key: Key::Name("a".into()),
        };
        assert!(v.to_string().contains("immutable"));
    }

    #[test]
    fn recover_swallows_non_strict() {
        let err: Result<()> = Err(Violation::Contract {
            key: Key::Name("b".into()),
        });
        let recovered = err.recover(false).unwrap();
        assert!(recovered.is_none());
    }

    #[test]
    fn recover_escalates_strict_schema() {
        let err: Result<()> = Err(Violation::Schema {
            key: Key::Name("b".into()),
            message: "bad".into(),
        });
        assert!(err.recover(true).is_err());
    }
}
