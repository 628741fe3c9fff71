//! Options accepted by the state constructors.
//!
//! A typed builder rather than a stringly-keyed options bag, so there is no
//! way to pass an option this type doesn't have. Any option this crate later
//! deprecates keeps a `#[deprecated]` builder method rather than silently
//! vanishing.

use std::sync::Arc;

use crate::schema::Schema;

/// Options controlling how [`crate::wrap`] instruments a raw value.
#[derive(Clone)]
pub struct WrapOptions {
    /// Wrap nested containers recursively so children are views too.
    /// Default `true`.
    pub recursive: bool,
    /// Every write is rejected.
    pub immutable: bool,
    /// Reads register against the ambient observer. Default `true`.
    pub observable: bool,
    /// Escalate schema/contract violations to a returned `Err` instead of a
    /// silent no-op.
    pub strict: bool,
    /// Opaque validator consulted on every mutation.
    pub schema: Option<Arc<dyn Schema>>,
    /// Deep-clone the raw value at wrap time rather than taking ownership
    /// of the caller's value in place.
    ///
    /// `wrap()` always takes its `RawValue` by value, so there is no
    /// lingering caller-side reference a clone would protect. This flag is
    /// accepted and stored but has no effect here.
    pub cloned: bool,
    /// Enable the observation-budget guard.
    pub safe_observation: bool,
    /// Threshold for the observation-budget guard. Default `64`.
    pub safe_observation_threshold: usize,
}

impl Default for WrapOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            immutable: false,
            observable: true,
            strict: false,
            schema: None,
            cloned: false,
            safe_observation: false,
            safe_observation_threshold: 64,
        }
    }
}

impl WrapOptions {
    pub fn recursive(mut self, v: bool) -> Self {
        self.recursive = v;
        self
    }
    pub fn immutable(mut self, v: bool) -> Self {
        self.immutable = v;
        self
    }
    pub fn observable(mut self, v: bool) -> Self {
        self.observable = v;
        self
    }
    pub fn strict(mut self, v: bool) -> Self {
        self.strict = v;
        self
    }
    pub fn schema(mut self, schema: Arc<dyn Schema>) -> Self {
        self.schema = Some(schema);
        self
    }
    pub fn cloned(mut self, v: bool) -> Self {
        self.cloned = v;
        self
    }
    pub fn safe_observation(mut self, threshold: usize) -> Self {
        self.safe_observation = true;
        self.safe_observation_threshold = threshold;
        self
    }
}
