//! A native interpreter whose callbacks are Rust closures.
//!
//! Useful for embedding Weave without a script language and for exercising
//! the runtime in tests and benchmarks. Bindings are plain [`Value`]s.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use weave_channel::Value;

use crate::context::{ExecutionContext, Interpreter};

type NativeFn = Arc<dyn Fn(&mut NativeContext) -> Result<(), String> + Send + Sync>;

/// A callback run inside a [`NativeContext`].
#[derive(Clone)]
pub struct NativeCallback(NativeFn);

impl NativeCallback {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut NativeContext) -> Result<(), String> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for NativeCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NativeCallback")
    }
}

/// Global scope of one native execution.
#[derive(Debug, Default)]
pub struct NativeContext {
    globals: HashMap<String, Value>,
}

impl NativeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.globals.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    pub fn globals(&self) -> &HashMap<String, Value> {
        &self.globals
    }
}

impl ExecutionContext for NativeContext {
    type Binding = Value;
    type Callback = NativeCallback;
    type Error = String;

    fn binding(&self, name: &str) -> Option<Value> {
        self.globals.get(name).cloned()
    }

    fn bind(&mut self, name: &str, binding: Value) {
        self.globals.insert(name.to_string(), binding);
    }

    fn call(&mut self, callback: &NativeCallback) -> Result<(), String> {
        (callback.0)(self)
    }

    fn reset(&mut self) -> bool {
        self.globals.clear();
        true
    }
}

/// Builds [`NativeContext`]s and counts their lifecycle.
#[derive(Debug, Default)]
pub struct NativeInterpreter {
    created: AtomicUsize,
    discarded: AtomicUsize,
}

impl NativeInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contexts built so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Contexts destroyed so far.
    pub fn discarded(&self) -> usize {
        self.discarded.load(Ordering::Relaxed)
    }
}

impl Interpreter for NativeInterpreter {
    type Context = NativeContext;

    fn new_context(&self) -> NativeContext {
        self.created.fetch_add(1, Ordering::Relaxed);
        NativeContext::new()
    }

    fn discard(&self, context: NativeContext) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
        drop(context);
    }
}
