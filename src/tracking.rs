//! Invocation tracking
//!
//! `Tracked` is a decorator over any `Function`: it appends the function's
//! slug to one sample's record, then forwards the call unchanged. A fresh
//! decorator is built per prepared sample, since it closes over that
//! sample's index.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tracing::trace;

use crate::function::{Function, FunctionError, FunctionSet, RunContext};

/// Append-only map from sample index to the slugs that sample invoked.
#[derive(Debug, Clone, Default)]
pub struct InvocationLog(Arc<Mutex<HashMap<usize, Vec<String>>>>);

impl InvocationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a record for `sample`. An existing record is reset to empty.
    pub fn open(&self, sample: usize) {
        self.lock().insert(sample, Vec::new());
    }

    pub fn record(&self, sample: usize, slug: &str) {
        self.lock().entry(sample).or_default().push(slug.to_string());
    }

    /// Slugs invoked by `sample`, in call order.
    pub fn get(&self, sample: usize) -> Option<Vec<String>> {
        self.lock().get(&sample).cloned()
    }

    pub fn has(&self, sample: usize) -> bool {
        self.lock().contains_key(&sample)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<usize, Vec<String>>> {
        // A poisoned log still holds valid records; keep using it.
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Function decorator recording each call under one sample's index.
pub struct Tracked {
    inner: Arc<dyn Function>,
    sample: usize,
    log: InvocationLog,
}

impl Tracked {
    pub fn new(inner: Arc<dyn Function>, sample: usize, log: InvocationLog) -> Self {
        Self { inner, sample, log }
    }
}

#[async_trait]
impl Function for Tracked {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn slug(&self) -> String {
        self.inner.slug()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn input_schema(&self) -> Value {
        self.inner.input_schema()
    }

    fn output_schema(&self) -> Value {
        self.inner.output_schema()
    }

    async fn call(&self, input: Value, cx: &mut RunContext) -> Result<Value, FunctionError> {
        let slug = self.inner.slug();
        trace!(sample = self.sample, slug = %slug, "recording invocation");
        self.log.record(self.sample, &slug);
        self.inner.call(input, cx).await
    }
}

/// Wrap every function in `functions` with a tracker bound to `sample`.
pub fn track_all(functions: &FunctionSet, sample: usize, log: &InvocationLog) -> FunctionSet {
    FunctionSet::new(
        functions
            .iter()
            .map(|f| Arc::new(Tracked::new(f.clone(), sample, log.clone())) as Arc<dyn Function>)
            .collect(),
    )
}
