#![forbid(unsafe_code)]
//! `Scope::exec` / the free [`execute`] function: top-level flow
//! invocation. Materialises a root [`ExecutionContext`], dispatches the
//! handler through the scope's extension pipeline, tracks the scope's
//! `active_executions` registry for the duration (so disposal's grace
//! period waits on it), and returns an [`Execution`] handle exposing
//! status transitions, an abort controller, and the result.
//!
//! This is the thinnest layer in the crate — almost everything it needs
//! (journaling, tags, timeout, the extension pipeline) already lives on
//! [`ExecutionContext`] and [`Scope`]; this module is just the glue that
//! turns a bare `(flow, input)` pair into a trackable, externally
//! observable unit the way a subflow's `ctx.exec` already is internally.

use crate::{
    error::CoreError,
    eventual::Eventual,
    exec_context::{AbortSignal, CloseMode, ExecutionContext},
    flow::Flow,
    scope::{ExecutionId, Scope},
    tag::TagMap,
};
use futures::FutureExt;
use std::{cell::Cell, fmt, rc::Rc, time::Duration};

/// `{flow, input, tags?, timeout?}` — the argument to `Scope::exec` /
/// [`execute`], mirroring `ctx.exec`'s full form but for a top-level
/// invocation that is not nested inside another execution context.
pub struct ExecOptions<In, Out> {
    pub flow: Flow<In, Out>,
    pub input: In,
    pub tags: TagMap,
    pub timeout: Option<Duration>,
}

impl<In, Out> ExecOptions<In, Out> {
    pub fn new(flow: Flow<In, Out>, input: In) -> Self {
        Self { flow, input, tags: TagMap::default(), timeout: None }
    }

    pub fn with_tags(mut self, tags: TagMap) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Where an [`Execution`] stands: `pending -> running ->
/// completed|failed|cancelled`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Status cell and listener list, shared (via `Rc`) between the
/// `Execution` handle returned to the caller and the background future
/// that drives the handler to completion — the future needs to reach back
/// into this same bookkeeping to record status transitions as it runs,
/// before the `Execution` wrapping it has even been constructed.
struct Tracking {
    status: Cell<ExecutionStatus>,
    listeners: std::cell::RefCell<Vec<Box<dyn Fn(ExecutionStatus)>>>,
}

impl Tracking {
    fn set_status(&self, status: ExecutionStatus) {
        self.status.set(status);
        for listener in self.listeners.borrow().iter() {
            listener(status);
        }
    }
}

struct ExecutionInner<Out> {
    id: ExecutionId,
    flow_name: Option<String>,
    tracking: Rc<Tracking>,
    abort: AbortSignal,
    result: futures::future::Shared<futures::future::LocalBoxFuture<'static, Result<Out, CoreError>>>,
}

/// A handle to one top-level flow invocation: id, name, a status stream
/// consumers can subscribe to, an abort controller, and the eventual
/// result.
#[derive(Clone)]
pub struct Execution<Out> {
    inner: Rc<ExecutionInner<Out>>,
}

impl<Out: Clone + 'static> Execution<Out> {
    pub fn id(&self) -> ExecutionId {
        self.inner.id
    }

    pub fn flow_name(&self) -> Option<&str> {
        self.inner.flow_name.as_deref()
    }

    pub fn status(&self) -> ExecutionStatus {
        self.inner.tracking.status.get()
    }

    /// Subscribes to every status transition from here on; does not replay
    /// transitions that already happened.
    pub fn on_status_change(&self, listener: impl Fn(ExecutionStatus) + 'static) {
        self.inner.tracking.listeners.borrow_mut().push(Box::new(listener));
    }

    /// Requests cancellation. The running handler observes this
    /// cooperatively via `ctx.signal()`; it is never force-killed.
    pub fn abort(&self, reason: Option<String>) {
        self.inner.abort.abort(reason);
    }

    /// The eventual output. Safe to call more than once — every call
    /// observes the same underlying settle.
    pub fn result(&self) -> Eventual<Result<Out, CoreError>> {
        Eventual::pending(self.inner.result.clone())
    }
}

impl<Out> fmt::Debug for Execution<Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Execution")
            .field("id", &self.inner.id)
            .field("flow_name", &self.inner.flow_name)
            .field("status", &self.inner.tracking.status.get())
            .finish()
    }
}

/// `Scope::exec`'s implementation, kept in this module (rather than
/// inlined on `Scope`) so the `Execution`/`ExecutionStatus` types stay
/// co-located with the tracking logic that produces them.
pub(crate) fn exec_on_scope<In: Clone + 'static, Out: Clone + 'static>(
    scope: &Scope,
    spec: ExecOptions<In, Out>,
) -> Execution<Out> {
    let flow_name = spec.flow.name().map(|s| s.to_string());

    if let Err(e) = scope.check_accepts_exec() {
        let tracking = Rc::new(Tracking {
            status: Cell::new(ExecutionStatus::Failed),
            listeners: std::cell::RefCell::new(Vec::new()),
        });
        return Execution {
            inner: Rc::new(ExecutionInner {
                id: scope.track_execution_start(),
                flow_name,
                tracking,
                abort: AbortSignal::new(),
                result: futures::future::ready(Err(e)).boxed_local().shared(),
            }),
        };
    }

    let ctx = ExecutionContext::root(scope, flow_name.clone(), spec.tags, Some(spec.flow.definition_tags()));
    let abort = ctx.signal().clone();
    let id = scope.track_execution_start();

    let tracking = Rc::new(Tracking {
        status: Cell::new(ExecutionStatus::Running),
        listeners: std::cell::RefCell::new(Vec::new()),
    });

    let flow = spec.flow;
    let input = spec.input;
    let timeout = spec.timeout;
    let scope_for_finish = scope.clone();
    let tracking_for_finish = tracking.clone();
    let abort_for_timeout = abort.clone();

    let validated = flow.validate_input(&input);
    let body: Eventual<Result<Out, CoreError>> = match validated {
        Err(e) => Eventual::ready(Err(e)),
        Ok(()) => {
            let invoked = flow.invoke(ctx.clone(), input);
            let timed = match timeout {
                Some(d) => with_timeout(abort_for_timeout, d, invoked),
                None => invoked,
            };
            timed.then(move |outcome| Eventual::ready(outcome.and_then(|out| flow.validate_output(&out).map(|_| out))))
        }
    };

    let fut: futures::future::LocalBoxFuture<'static, Result<Out, CoreError>> = Box::pin(async move {
        let outcome = body.into_future().await;
        ctx.close(if outcome.is_err() { CloseMode::Abort } else { CloseMode::Graceful }).await.ok();
        scope_for_finish.track_execution_end(id);
        let status = match &outcome {
            Ok(_) => ExecutionStatus::Completed,
            Err(CoreError::OperationAborted(_)) => ExecutionStatus::Cancelled,
            Err(_) => ExecutionStatus::Failed,
        };
        tracking_for_finish.set_status(status);
        outcome
    });

    Execution {
        inner: Rc::new(ExecutionInner {
            id,
            flow_name,
            tracking,
            abort,
            result: fut.shared(),
        }),
    }
}

/// Auto-creating entry point mirroring `flow.execute(flow, input,
/// options?)`: builds a fresh root scope for this one invocation, runs the
/// flow through it, and disposes the scope once the handler settles.
pub fn execute<In: Clone + 'static, Out: Clone + 'static>(
    flow: &Flow<In, Out>,
    input: In,
    options: ExecOptions<In, Out>,
) -> Execution<Out> {
    let scope = Scope::root(crate::scope::ScopeOptions::default());
    let spec = ExecOptions { flow: flow.clone(), input, tags: options.tags, timeout: options.timeout };
    let execution = exec_on_scope(&scope, spec);
    let scope_to_dispose = scope.clone();
    let result_for_dispose = execution.result();
    tokio::task::spawn_local(async move {
        result_for_dispose.into_future().await.ok();
        scope_to_dispose.dispose(crate::scope::DisposeOptions::default()).await.ok();
    });
    execution
}

fn with_timeout<T: 'static>(
    signal: AbortSignal,
    duration: Duration,
    inner: Eventual<Result<T, CoreError>>,
) -> Eventual<Result<T, CoreError>> {
    match inner {
        Eventual::Ready(v) => Eventual::Ready(v),
        Eventual::Pending(fut) => Eventual::pending(async move {
            let sleep = tokio::time::sleep(duration);
            futures::pin_mut!(sleep);
            futures::select! {
                result = fut.fuse() => result,
                _ = sleep.fuse() => {
                    signal.abort(Some("timeout".into()));
                    Err(CoreError::OperationTimeout(format!("{}ms", duration.as_millis())))
                }
            }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::ScopeOptions;

    #[tokio::test(flavor = "current_thread")]
    async fn exec_reaches_completed_status() {
        let scope = Scope::root(ScopeOptions::default());
        let flow = Flow::<i32, i32>::new(Some("double"), |_ctx, input| Eventual::ready(Ok(input * 2)));
        let execution = scope.exec(ExecOptions::new(flow, 21));
        assert_eq!(execution.result().into_future().await.unwrap(), 42);
        assert_eq!(execution.status(), ExecutionStatus::Completed);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn exec_reports_failed_status() {
        let scope = Scope::root(ScopeOptions::default());
        let flow = Flow::<i32, i32>::new(Some("boom"), |_ctx, _input| {
            Eventual::ready(Err(CoreError::TagMissing("x".into())))
        });
        let execution = scope.exec(ExecOptions::new(flow, 1));
        assert!(execution.result().into_future().await.is_err());
        assert_eq!(execution.status(), ExecutionStatus::Failed);
    }
}
