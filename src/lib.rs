#![forbid(unsafe_code)]
//! A structured dependency-and-effect runtime: declare units of work
//! (value-producing [`Executor`]s and composable [`Flow`]s) together with
//! their dependencies, then run them inside bounded-lifetime [`Scope`]s
//! under a uniform model for caching, reactivity, cancellation,
//! cross-cutting instrumentation via [`Extension`]s, and journaled replay.
//!
//! ## Core pieces
//!
//! - [`Scope`] — the dependency-graph resolver, value cache, reactivity
//!   engine, and two-phase graceful disposal coordinator.
//! - [`ExecutionContext`] — per-invocation state spanning one flow call and
//!   its descendants: tag store, journal, abort signal, depth, children.
//! - [`Extension`] — onion-style middleware wrapping every resolution,
//!   execution, parallel combinator, and context-lifecycle transition.
//! - [`Tag`] — typed, symbol-keyed context values readable from maps,
//!   ordered sequences, scopes, or an executor's own definition tags.
//!
//! ## Example
//!
//! ```
//! use flowgraph::{Channel, DependencySpec, Executor, Eventual, Scope, ScopeOptions};
//!
//! let scope = Scope::root(ScopeOptions::default());
//! let counter = Executor::new(Some("counter"), Channel::Main, DependencySpec::None, |_cx| {
//!     Eventual::ready(Ok(0))
//! });
//! // The factory above is synchronous, so resolution settles without an
//! // executor: `Eventual::Ready` rather than `Eventual::Pending`.
//! match scope.resolve(&counter) {
//!     Eventual::Ready(Ok(value)) => assert_eq!(value, 0),
//!     _ => unreachable!(),
//! }
//! ```

mod error;
mod eventual;
mod exec_context;
mod executor;
mod extension;
mod flow;
mod flow_executor;
mod meta;
mod node;
mod scope;
mod tag;

pub use error::{CoreError, ThrownError};
pub use eventual::{partition, Eventual};
pub use exec_context::{
    AbortSignal, CloseMode, ContextId, ContextState, ExecSpec, ExecutionContext, ExecutionDetails,
    FnExecSpec, ParallelOutcome, Settled, SettledOutcome, Stats,
};
pub use executor::{
    list_dependencies, named_dependencies, single_dependency, Channel, DependencySpec, Executor,
    ExecutorId, ResolveCx,
};
pub use extension::{Extension, ExecutionTarget, LifecyclePhase, NextFn, Operation};
pub use flow::Flow;
pub use flow_executor::{execute, ExecOptions, Execution, ExecutionStatus};
pub use meta::{depth_tag, flow_name_tag};
pub use scope::{
    Accessor, DisposeOptions, ExecutionId, Scope, ScopeId, ScopeOptions,
};
pub use tag::{Tag, TagId, TagMap, TagReader, TagSequence, Tagged};

/// Downgrades a would-be panic/log to a `tracing::warn!` in debug builds and
/// is a complete no-op in release builds. Errors inside listeners/hooks are
/// isolated — caught and discarded, never masking the triggering error —
/// while still surfacing the anomaly somewhere during development.
#[doc(hidden)]
#[macro_export]
macro_rules! debug_warn {
    ($($x:tt)*) => {
        {
            #[cfg(debug_assertions)]
            {
                tracing::warn!($($x)*)
            }
            #[cfg(not(debug_assertions))]
            { }
        }
    }
}
