//! A fine-grained reactive state runtime for nested object graphs.
//!
//! Ordinary records, arrays, sets and maps become *tracked* values once
//! wrapped: mutations are captured, validated and propagated to subscribers
//! at property-level granularity, while the original mutable programming
//! style is preserved. Four subsystems do the work:
//!
//! - the trap layer (`traps`) and state graph (`state`, `registry`, `link`)
//!   intercept reads/writes on nested containers and keep parent↔child
//!   back-edges in sync as the graph mutates;
//! - the observer core (`context`, `observer`) records which `(state, key)`
//!   pairs a computation depends on;
//! - the write contract (`contract`) layers a gated, writable facade over an
//!   otherwise-immutable view;
//! - the history engine (`history`) is a debounced, bounded undo/redo log
//!   built on top of the change stream.
//!
//! Identity is a `Copy` handle (`View`) over a `DashMap`-backed global
//! registry, dependency tracking rides a thread-local ambient stack, and
//! notification dispatch is synchronous and panic-safe.

pub mod context;
pub mod contract;
pub mod error;
pub mod event;
pub mod history;
mod link;
pub mod observer;
pub mod options;
pub mod registry;
pub mod schema;
pub mod state;
mod traps;
pub mod value;
pub mod snapshot;

pub use context::{current_observer, run_in_observer, run_with_tracker, untrack, ObserverId, TrackerFn};
pub use contract::{writable, AllowList, Method, Writable};
pub use error::{Result, ResultExt, Violation};
pub use event::{log, pipe, subscribe, ChangeEvent, ChangeKind, Unsubscribe};
pub use history::{history, History, HistoryClock, HistoryOptions};
pub use observer::{create_observer, effect, CleanupFn, EffectHandle, Observer};
pub use options::WrapOptions;
pub use registry::StateId;
pub use schema::{Schema, Validation};
pub use snapshot::{read, snapshot, stringify, Snapshot};
pub use state::{flat, immutable, ordered, raw, wrap, Ordered, View};
pub use value::{Key, RawValue, Value, ViewKind};
