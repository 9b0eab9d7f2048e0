#![forbid(unsafe_code)]
//! The onion-style middleware pipeline wrapping every scope resolution,
//! flow/fn execution, parallel combinator, and context-lifecycle
//! transition.
//!
//! An [`Extension`] is registered once per [`Scope`](crate::scope::Scope)
//! (`Scope::register_extension`) and its `wrap` hook is consulted on every
//! [`Operation`] dispatched through that scope, first-registered
//! outermost, holding an ordered `Vec<Rc<dyn Trait>>` and walking it in
//! registration order on every notification.

use crate::{error::CoreError, eventual::Eventual, scope::Scope};
use std::rc::Rc;

/// What an extension is being asked to wrap.
#[derive(Clone, Debug)]
pub enum Operation {
    /// Resolving an executor's cached value.
    Resolve { executor_name: Option<String> },
    /// A flow, bare function, or parallel-combinator invocation.
    Execution { target: ExecutionTarget, context_id: Option<crate::exec_context::ContextId> },
    /// A transition in an execution context's lifecycle.
    ContextLifecycle { phase: LifecyclePhase, context_id: crate::exec_context::ContextId },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecyclePhase {
    Create,
    Closing,
    Closed,
}

#[derive(Clone, Debug)]
pub enum ExecutionTarget {
    Flow { name: Option<String> },
    Fn { name: Option<String> },
    Parallel { count: usize },
}

/// The unit every `wrap` hook is allowed to intercept: produces the same
/// kind of result the wrapped operation itself would (a boxed, type-erased
/// value, downcast by the caller on the way out).
pub type NextFn = Rc<dyn Fn() -> Eventual<Result<Rc<dyn std::any::Any>, CoreError>>>;

/// Cross-cutting middleware installed on a scope.
///
/// `wrap` must call `next()` exactly once unless it intentionally
/// short-circuits the operation (e.g. a cache-bypassing extension, or one
/// that rejects an operation outright). Extensions that don't need to
/// intercept a given operation kind should simply call `next()` and return
/// its result untouched — the default behavior if `wrap` is not
/// overridden.
pub trait Extension {
    fn name(&self) -> &str;

    /// Runs once, lazily, after the owning scope is constructed.
    fn init(&self, _scope: &Scope) {}

    /// Runs during the owning scope's disposal finalisation, in
    /// registration order.
    fn dispose(&self, _scope: &Scope) {}

    /// Wraps one dispatch of `operation`. Default implementation is a
    /// pass-through (`next()`).
    fn wrap(&self, _scope: &Scope, next: NextFn, _operation: &Operation) -> Eventual<Result<Rc<dyn std::any::Any>, CoreError>> {
        next()
    }

    /// Observes any error thrown by a resolve or execution operation.
    /// Panics inside this hook are caught and logged, never propagated.
    fn on_error(&self, _error: &CoreError, _executor_name: Option<&str>, _scope: &Scope) {}
}

/// The ordered list of extensions registered on one scope, plus the
/// machinery to compose them around a base operation.
pub(crate) struct ExtensionChain {
    next_id: std::cell::Cell<u64>,
    extensions: std::cell::RefCell<Vec<(u64, Rc<dyn Extension>)>>,
}

impl ExtensionChain {
    pub fn new() -> Self {
        Self { next_id: std::cell::Cell::new(0), extensions: std::cell::RefCell::new(Vec::new()) }
    }

    /// Registers `extension`, first-registered outermost, and returns an
    /// id `remove` can later pass to unregister it.
    pub fn push(&self, extension: Rc<dyn Extension>) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.extensions.borrow_mut().push((id, extension));
        id
    }

    /// Unregisters the extension previously returned by `push`. A no-op if
    /// it has already been removed.
    pub fn remove(&self, id: u64) {
        self.extensions.borrow_mut().retain(|(existing, _)| *existing != id);
    }

    pub fn snapshot(&self) -> Vec<Rc<dyn Extension>> {
        self.extensions.borrow().iter().map(|(_, ext)| ext.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.extensions.borrow().len()
    }

    /// Composes `base` (the actual operation) inside every registered
    /// extension's `wrap`, first-registered outermost.
    pub fn dispatch(
        &self,
        scope: &Scope,
        operation: Operation,
        base: impl Fn() -> Eventual<Result<Rc<dyn std::any::Any>, CoreError>> + 'static,
    ) -> Eventual<Result<Rc<dyn std::any::Any>, CoreError>> {
        let extensions = self.snapshot();
        let base: NextFn = Rc::new(base);
        let chain = extensions.into_iter().rev().fold(base, |next, ext| {
            let scope = scope.clone();
            let operation = operation.clone();
            Rc::new(move || ext.wrap(&scope, next.clone(), &operation)) as NextFn
        });
        chain()
    }

    pub fn on_error(&self, scope: &Scope, error: &CoreError, executor_name: Option<&str>) {
        for ext in self.snapshot() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                ext.on_error(error, executor_name, scope);
            }));
            if result.is_err() {
                crate::debug_warn!("extension {:?} panicked in on_error", ext.name());
            }
        }
    }

    pub fn on_context_lifecycle(&self, scope: &Scope, phase: LifecyclePhase, context_id: crate::exec_context::ContextId) {
        let operation = Operation::ContextLifecycle { phase, context_id };
        for ext in self.snapshot() {
            let scope2 = scope.clone();
            let operation2 = operation.clone();
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let _ = ext.wrap(&scope2, Rc::new(|| Eventual::ready(Ok(Rc::new(()) as Rc<dyn std::any::Any>))), &operation2);
            }));
            if result.is_err() {
                crate::debug_warn!("extension {:?} panicked during context-lifecycle wrap", ext.name());
            }
        }
    }

    pub fn dispose_all(&self, scope: &Scope) {
        for ext in self.snapshot() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                ext.dispose(scope);
            }));
            if result.is_err() {
                crate::debug_warn!("extension {:?} panicked during dispose", ext.name());
            }
        }
    }
}
