//! Execution contexts and the pool that hands them out.
//!
//! The script interpreter is an external collaborator. The runtime only
//! needs three things from it:
//!
//! - a way to build a fresh, isolated context ([`Interpreter`])
//! - named bindings it can read from one context and install in another
//! - a way to run a compiled callback inside a context
//!
//! A context is moved into the task that uses it, so no two running tasks
//! can ever observe the same one. When the task ends the context is reset
//! and parked in the [`ContextPool`], or destroyed if it cannot be reused.
//!
//! # Binding allow-list
//!
//! Tasks do not inherit the caller's whole global scope. Only the names in a
//! [`BindingAllowlist`] are copied, at spawn time, on the caller's thread.
//! The list is versioned so the isolation boundary can be audited.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// The interpreter collaborator: an opaque context constructor/destructor.
pub trait Interpreter: Send + Sync + 'static {
    type Context: ExecutionContext;

    /// Build a fresh context with the interpreter's builtins loaded.
    fn new_context(&self) -> Self::Context;

    /// Release a context that will not be reused.
    fn discard(&self, context: Self::Context) {
        drop(context);
    }
}

/// One isolated interpreter instance.
pub trait ExecutionContext: Send + 'static {
    /// A builtin capability (print, send, import, ...).
    type Binding: Clone + Send + 'static;

    /// A compiled script callback.
    type Callback: Send + Sync + 'static;

    /// Error raised by a callback.
    type Error: fmt::Display;

    /// Look up a global binding.
    fn binding(&self, name: &str) -> Option<Self::Binding>;

    /// Install a global binding.
    fn bind(&mut self, name: &str, binding: Self::Binding);

    /// Run `callback` with no arguments.
    fn call(&mut self, callback: &Self::Callback) -> Result<(), Self::Error>;

    /// Clear per-task state before the context goes back to the pool.
    ///
    /// Returning `false` asks the pool to destroy the context instead.
    fn reset(&mut self) -> bool;
}

pub type ContextOf<I> = <I as Interpreter>::Context;
pub type BindingOf<I> = <ContextOf<I> as ExecutionContext>::Binding;
pub type CallbackOf<I> = <ContextOf<I> as ExecutionContext>::Callback;

// ============================================================================
// Binding allow-list
// ============================================================================

/// Versioned list of the binding names copied into task contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingAllowlist {
    version: u32,
    names: &'static [&'static str],
}

impl BindingAllowlist {
    /// Output, sleep, codecs, channel primitives, import, error
    /// registration and introspection.
    pub const V1: BindingAllowlist = BindingAllowlist {
        version: 1,
        names: &[
            "print",
            "sleep",
            "json_encode",
            "json_decode",
            "chan",
            "send",
            "receive",
            "select",
            "close_channel",
            "wait",
            "import",
            "on_error",
            "check_memory",
            "get_goroutines",
            "uuid",
            "random",
            "toml",
            "yaml",
            "jsonc",
            "text",
            "crypto",
            "dotenv",
            "datetime",
            "csv",
            "ft",
            "ini",
            "tar",
        ],
    };

    pub const fn new(version: u32, names: &'static [&'static str]) -> Self {
        Self { version, names }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn names(&self) -> &'static [&'static str] {
        self.names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|allowed| *allowed == name)
    }

    /// Snapshot the allowed bindings present in `context`.
    ///
    /// Names the caller has not defined are skipped.
    pub fn capture<C: ExecutionContext>(&self, context: &C) -> Bindings<C::Binding> {
        let entries = self
            .names
            .iter()
            .filter_map(|name| context.binding(name).map(|binding| (*name, binding)))
            .collect();
        Bindings { entries }
    }
}

impl Default for BindingAllowlist {
    fn default() -> Self {
        Self::V1
    }
}

/// Bindings captured from a caller context, ready to install in a task
/// context.
#[derive(Clone)]
pub struct Bindings<B> {
    entries: Vec<(&'static str, B)>,
}

impl<B: Clone> Bindings<B> {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Install every captured binding into `context`.
    pub fn apply<C: ExecutionContext<Binding = B>>(&self, context: &mut C) {
        for (name, binding) in &self.entries {
            context.bind(name, binding.clone());
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|(name, _)| *name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<B> fmt::Debug for Bindings<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(name, _)| name))
            .finish()
    }
}

// ============================================================================
// Context pool
// ============================================================================

/// Default number of idle contexts kept for reuse.
pub const DEFAULT_MAX_IDLE_CONTEXTS: usize = 16;

/// Pool of idle execution contexts.
///
/// `acquire` hands out an idle context or builds a new one; `release` resets
/// it and parks it for the next task. A context that panicked mid-call is
/// never parked, see [`discard`](Self::discard).
pub struct ContextPool<I: Interpreter> {
    interpreter: Arc<I>,
    idle: Mutex<Vec<ContextOf<I>>>,
    max_idle: usize,
    created: AtomicUsize,
}

impl<I: Interpreter> ContextPool<I> {
    pub fn new(interpreter: Arc<I>, max_idle: usize) -> Self {
        Self {
            interpreter,
            idle: Mutex::new(Vec::with_capacity(max_idle)),
            max_idle,
            created: AtomicUsize::new(0),
        }
    }

    pub fn interpreter(&self) -> &Arc<I> {
        &self.interpreter
    }

    /// Take exclusive ownership of a context.
    pub fn acquire(&self) -> ContextOf<I> {
        if let Some(context) = self.idle.lock().pop() {
            return context;
        }
        self.created.fetch_add(1, Ordering::Relaxed);
        self.interpreter.new_context()
    }

    /// Return a context after a task finished with it.
    pub fn release(&self, mut context: ContextOf<I>) {
        if !context.reset() {
            self.interpreter.discard(context);
            return;
        }

        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(context);
            return;
        }
        drop(idle);
        self.interpreter.discard(context);
    }

    /// Destroy a context whose state can no longer be trusted.
    pub fn discard(&self, context: ContextOf<I>) {
        self.interpreter.discard(context);
    }

    /// Number of contexts parked for reuse.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Number of contexts built by this pool so far.
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Destroy every idle context.
    pub fn clear(&self) {
        let drained: Vec<_> = self.idle.lock().drain(..).collect();
        for context in drained {
            self.interpreter.discard(context);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{NativeCallback, NativeContext, NativeInterpreter};
    use pretty_assertions::assert_eq;
    use weave_channel::Value;

    #[test]
    fn test_allowlist_v1() {
        let allowlist = BindingAllowlist::default();
        assert_eq!(allowlist.version(), 1);
        assert!(allowlist.contains("send"));
        assert!(allowlist.contains("on_error"));
        assert!(!allowlist.contains("go"));
    }

    #[test]
    fn test_capture_copies_only_allowed_names() {
        let mut caller = NativeContext::new();
        caller.set("print", Value::from("builtin:print"));
        caller.set("secret", Value::Int(42));

        let bindings = BindingAllowlist::V1.capture(&caller);
        assert_eq!(bindings.names().collect::<Vec<_>>(), vec!["print"]);

        let mut task = NativeContext::new();
        bindings.apply(&mut task);
        assert_eq!(task.get("print"), Some(&Value::from("builtin:print")));
        assert_eq!(task.get("secret"), None);
    }

    #[test]
    fn test_custom_allowlist() {
        static NAMES: &[&str] = &["send"];
        let allowlist = BindingAllowlist::new(7, NAMES);

        let mut caller = NativeContext::new();
        caller.set("print", Value::Nil);
        caller.set("send", Value::Bool(true));

        let bindings = allowlist.capture(&caller);
        assert_eq!(bindings.len(), 1);
        assert_eq!(format!("{:?}", bindings), r#"["send"]"#);
    }

    #[test]
    fn test_pool_reuses_released_contexts() {
        let pool = ContextPool::new(Arc::new(NativeInterpreter::new()), 2);

        let mut context = pool.acquire();
        context.set("scratch", Value::Int(1));
        pool.release(context);
        assert_eq!(pool.idle_count(), 1);

        let context = pool.acquire();
        // Reset cleared the task's globals
        assert_eq!(context.get("scratch"), None);
        assert_eq!(pool.created_count(), 1);
        pool.release(context);
    }

    #[test]
    fn test_pool_caps_idle_contexts() {
        let interpreter = Arc::new(NativeInterpreter::new());
        let pool = ContextPool::new(Arc::clone(&interpreter), 1);

        let a = pool.acquire();
        let b = pool.acquire();
        pool.release(a);
        pool.release(b);

        assert_eq!(pool.idle_count(), 1);
        assert_eq!(interpreter.discarded(), 1);
    }

    #[test]
    fn test_pool_discard_and_clear() {
        let interpreter = Arc::new(NativeInterpreter::new());
        let pool = ContextPool::new(Arc::clone(&interpreter), 4);

        let mut context = pool.acquire();
        let noop = NativeCallback::new(|_| Ok(()));
        context.call(&noop).unwrap();
        pool.discard(context);
        assert_eq!(pool.idle_count(), 0);

        let context = pool.acquire();
        pool.release(context);
        pool.clear();
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(interpreter.discarded(), 2);
    }
}
