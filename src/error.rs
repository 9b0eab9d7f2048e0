#![forbid(unsafe_code)]
//! The error taxonomy used across the public API, plus the error-hook
//! mechanism that lets a [`Scope`](crate::Scope) or extension observe
//! errors thrown by factories, handlers, and listeners without that error
//! necessarily unwinding the caller.

use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
    sync::Arc,
};

/// The single error type returned across the public API.
///
/// Each variant carries whatever context `DEPENDENCY RESOLUTION` / `FLOW
/// EXECUTION` needs to diagnose a failure: the executor or flow name, the
/// dependency chain walked to reach it, and the underlying cause when one
/// exists.
#[derive(Debug, thiserror::Error, Clone)]
pub enum CoreError {
    /// Resolution or execution was attempted while the scope is in its
    /// `disposing` phase.
    #[error("scope is disposing, no new resolutions or executions are accepted")]
    ScopeDisposing,

    /// Resolution or execution was attempted on a scope that already
    /// finished disposal.
    #[error("scope has been disposed")]
    ScopeDisposed,

    /// An execution context operation was attempted after the context
    /// completed (its `closed` state was reached).
    #[error("execution context {0:?} is closed")]
    ContextClosed(String),

    /// An executor factory panicked or returned an error.
    #[error("factory for executor {executor_name:?} failed: {cause}")]
    FactoryExecutionError {
        executor_name: String,
        cause: Arc<dyn std::error::Error + Send + Sync>,
    },

    /// A dependency could not be resolved, with the chain walked to reach it.
    #[error("could not resolve dependency chain {dependency_chain:?}: {cause}")]
    DependencyResolutionError {
        dependency_chain: Vec<String>,
        cause: Arc<dyn std::error::Error + Send + Sync>,
    },

    /// An executor referenced by key/name does not exist in the scope.
    #[error("no executor registered for {0:?}")]
    ExecutorResolutionError(String),

    /// A [`Tag`](crate::Tag) was required but absent from every container
    /// consulted.
    #[error("tag {0:?} is missing")]
    TagMissing(String),

    /// A validator rejected a value; `issues` mirrors whatever the
    /// validator reported.
    #[error("schema validation failed for {subject:?}: {issues:?}")]
    SchemaValidation { subject: String, issues: Vec<String> },

    /// A timeout elapsed before an operation completed.
    #[error("operation {0:?} timed out")]
    OperationTimeout(String),

    /// An operation was aborted, either by an explicit signal or because
    /// its owning context was disposed.
    #[error("operation {0:?} was aborted")]
    OperationAborted(String),

    /// A scope's disposal grace period elapsed before in-flight
    /// executions finished.
    #[error("grace period exceeded while disposing scope, {0} execution(s) still active")]
    GracePeriodExceeded(usize),

    /// Multiple independent failures occurred together (e.g. from
    /// `parallel_settled` or from multiple cleanup callbacks failing).
    #[error("{0} error(s) occurred: {1:?}")]
    AggregateError(usize, Vec<CoreError>),
}

impl CoreError {
    pub fn aggregate(errors: Vec<CoreError>) -> CoreError {
        CoreError::AggregateError(errors.len(), errors)
    }

    /// True for errors that represent a validator contract violation
    /// (synchronous-only validators returning an async result).
    pub fn async_validation_unsupported(subject: impl Into<String>) -> CoreError {
        CoreError::SchemaValidation {
            subject: subject.into(),
            issues: vec!["validator returned an async result, only synchronous validators are supported".into()],
        }
    }
}

/// An error captured by the error hook, wrapping whatever
/// `std::error::Error` produced it.
#[derive(Clone)]
pub struct ThrownError(pub Arc<dyn std::error::Error + Send + Sync>);

impl ThrownError {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self(Arc::new(err))
    }

    pub fn from_core(err: CoreError) -> Self {
        Self(Arc::new(err))
    }
}

impl fmt::Debug for ThrownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for ThrownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A listener registered with a scope's `onError` hook. Listener panics
/// are caught and downgraded to a `tracing::warn!` (see [`debug_warn!`](crate::debug_warn))
/// rather than unwinding the thrower, matching "errors inside listeners are
/// isolated".
pub(crate) trait ErrorHook {
    fn on_error(&self, error: &ThrownError);
}

pub(crate) struct ErrorHooks {
    next_id: Cell<u64>,
    hooks: RefCell<Vec<(u64, Rc<dyn ErrorHook>)>>,
}

impl Default for ErrorHooks {
    fn default() -> Self {
        Self { next_id: Cell::new(0), hooks: RefCell::new(Vec::new()) }
    }
}

impl ErrorHooks {
    /// Registers `hook`, returning an id `remove` can later pass to
    /// unregister it.
    pub fn register(&self, hook: Rc<dyn ErrorHook>) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.hooks.borrow_mut().push((id, hook));
        id
    }

    /// Unregisters the hook previously returned by `register`. A no-op if
    /// it has already been removed.
    pub fn remove(&self, id: u64) {
        self.hooks.borrow_mut().retain(|(existing, _)| *existing != id);
    }

    /// Dispatches `error` to every registered hook. A panicking hook is
    /// caught and logged; it never prevents the remaining hooks from
    /// running and never propagates to the caller.
    pub fn dispatch(&self, error: &ThrownError) {
        let hooks: Vec<_> = self.hooks.borrow().iter().map(|(_, hook)| hook.clone()).collect();
        for hook in hooks {
            let error = error.clone();
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                hook.on_error(&error);
            }));
            if result.is_err() {
                crate::debug_warn!("error listener panicked while handling {error}");
            }
        }
    }
}

impl fmt::Debug for ErrorHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorHooks")
            .field("count", &self.hooks.borrow().len())
            .finish()
    }
}
