#![forbid(unsafe_code)]
//! [`ExecutionContext`]: per-invocation state spanning one flow call and
//! its descendants — tag store, journal, abort signal, depth, child
//! tracking, and a `{active, closing, closed}` lifecycle.
//!
//! This is the thing a handler actually touches on every call (`ctx.exec`,
//! `ctx.parallel`, `ctx.get`/`ctx.set`), so its ergonomics matter as much as
//! its bookkeeping.

use crate::{
    error::CoreError,
    eventual::Eventual,
    extension::{ExecutionTarget, LifecyclePhase, Operation},
    flow::Flow,
    meta,
    scope::Scope,
    tag::{Tag, TagMap, TagReader, Tagged},
};
use futures::FutureExt;
use rustc_hash::FxHashMap;
use std::{
    any::Any,
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl fmt::Debug for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextId({})", self.0)
    }
}

fn next_context_id() -> ContextId {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    ContextId(NEXT.fetch_add(1, Ordering::Relaxed))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextState {
    Active,
    Closing,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseMode {
    Graceful,
    Abort,
}

/// An entry in a context's journal: either a replayable value or a
/// replayable error (`ctx.exec` with the same key always produces the same
/// outcome without re-invoking the target).
#[derive(Clone)]
enum JournalEntry {
    Value(Rc<dyn Any>),
    Error(CoreError),
}

/// A chainable cancellation flag. Aborting a parent signal aborts every
/// signal built from it via [`AbortSignal::linked_child`]; listeners fire
/// at most once, in registration order.
#[derive(Clone)]
pub struct AbortSignal(Rc<AbortInner>);

struct AbortInner {
    aborted: Cell<bool>,
    reason: RefCell<Option<String>>,
    listeners: RefCell<Vec<Box<dyn FnOnce()>>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self(Rc::new(AbortInner {
            aborted: Cell::new(false),
            reason: RefCell::new(None),
            listeners: RefCell::new(Vec::new()),
        }))
    }

    /// A signal that aborts whenever `self` does (and may also be aborted
    /// independently, e.g. by a timeout that only targets the subtree it
    /// was attached to).
    pub fn linked_child(&self) -> Self {
        let child = Self::new();
        let weak_child = child.clone();
        self.on_abort(move || weak_child.abort(None));
        child
    }

    pub fn aborted(&self) -> bool {
        self.0.aborted.get()
    }

    pub fn reason(&self) -> Option<String> {
        self.0.reason.borrow().clone()
    }

    pub fn abort(&self, reason: Option<String>) {
        if self.0.aborted.replace(true) {
            return;
        }
        *self.0.reason.borrow_mut() = reason;
        let listeners = std::mem::take(&mut *self.0.listeners.borrow_mut());
        for listener in listeners {
            listener();
        }
    }

    pub fn on_abort(&self, f: impl FnOnce() + 'static) {
        if self.aborted() {
            f();
        } else {
            self.0.listeners.borrow_mut().push(Box::new(f));
        }
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// A lazily-computed, cached snapshot of a context's bookkeeping, read
/// after the context has settled (name, timing, terminal error).
#[derive(Clone, Debug)]
pub struct ExecutionDetails {
    pub name: Option<String>,
    pub depth: u32,
    pub elapsed: Option<Duration>,
    pub error: Option<CoreError>,
}

struct ContextInner {
    id: ContextId,
    parent: Option<ExecutionContext>,
    scope: Scope,
    tags: RefCell<TagMap>,
    journal: RefCell<FxHashMap<String, JournalEntry>>,
    signal: AbortSignal,
    depth: u32,
    state: Cell<ContextState>,
    children: RefCell<Vec<ExecutionContext>>,
    name: Option<String>,
    started_at: Instant,
    completed_at: Cell<Option<Instant>>,
    error: RefCell<Option<CoreError>>,
    details_cache: RefCell<Option<Rc<ExecutionDetails>>>,
}

/// Per-invocation state spanning a flow call and its descendants.
#[derive(Clone)]
pub struct ExecutionContext(Rc<ContextInner>);

impl ExecutionContext {
    /// Creates a root context (depth 0, no parent) directly on `scope`,
    /// e.g. for `Scope::create_execution` or the context spawned by
    /// `Scope::exec` for a top-level flow invocation.
    ///
    /// Tag store = scope's own tag store, overlaid with `execution_tags`,
    /// overlaid with `definition_tags` when this root is a top-level flow
    /// invocation (`None` for framework-integration contexts created
    /// without a flow) — the same last-writer-wins order `child` uses.
    pub fn root(
        scope: &Scope,
        name: Option<String>,
        execution_tags: TagMap,
        definition_tags: Option<&TagMap>,
    ) -> Self {
        let mut tags = scope.tags_snapshot().merged_with(&execution_tags);
        if let Some(def) = definition_tags {
            tags = tags.merged_with(def);
        }
        tags.insert_raw(&meta::flow_name_tag(), name.clone().unwrap_or_default());
        tags.insert_raw(&meta::depth_tag(), 0);
        let ctx = Self(Rc::new(ContextInner {
            id: next_context_id(),
            parent: None,
            scope: scope.clone(),
            tags: RefCell::new(tags),
            journal: RefCell::new(FxHashMap::default()),
            signal: AbortSignal::new(),
            depth: 0,
            state: Cell::new(ContextState::Active),
            children: RefCell::new(Vec::new()),
            name,
            started_at: Instant::now(),
            completed_at: Cell::new(None),
            error: RefCell::new(None),
            details_cache: RefCell::new(None),
        }));
        scope.extensions().on_context_lifecycle(scope, LifecyclePhase::Create, ctx.id());
        ctx
    }

    /// Spawns a child context. `execution_tags` are this call's per-child
    /// overrides; `definition_tags`, when `Some`, are the target flow's own
    /// tags — applied *after* `execution_tags` (last-writer-wins; see
    /// `DESIGN.md` for why definition tags win on a top-level call but are
    /// skipped on nested re-entry through `ctx.exec`).
    fn child(&self, name: Option<String>, execution_tags: TagMap, definition_tags: Option<&TagMap>) -> Self {
        let mut tags = TagMap::default();
        // snapshot of parent's store
        let parent_tags = self.0.tags.borrow();
        tags = tags.merged_with(&parent_tags);
        drop(parent_tags);
        tags = tags.merged_with(&execution_tags);
        if let Some(def) = definition_tags {
            tags = tags.merged_with(def);
        }
        let depth = self.0.depth + 1;
        tags.insert_raw(&meta::flow_name_tag(), name.clone().unwrap_or_default());
        tags.insert_raw(&meta::depth_tag(), depth);
        let child = Self(Rc::new(ContextInner {
            id: next_context_id(),
            parent: Some(self.clone()),
            scope: self.0.scope.clone(),
            tags: RefCell::new(tags),
            journal: RefCell::new(FxHashMap::default()),
            signal: self.0.signal.linked_child(),
            depth,
            state: Cell::new(ContextState::Active),
            children: RefCell::new(Vec::new()),
            name,
            started_at: Instant::now(),
            completed_at: Cell::new(None),
            error: RefCell::new(None),
            details_cache: RefCell::new(None),
        }));
        self.0.children.borrow_mut().push(child.clone());
        self.0.scope.extensions().on_context_lifecycle(&self.0.scope, LifecyclePhase::Create, child.id());
        child
    }

    pub fn id(&self) -> ContextId {
        self.0.id
    }

    pub fn parent(&self) -> Option<ExecutionContext> {
        self.0.parent.clone()
    }

    pub fn scope(&self) -> &Scope {
        &self.0.scope
    }

    pub fn depth(&self) -> u32 {
        self.0.depth
    }

    pub fn signal(&self) -> &AbortSignal {
        &self.0.signal
    }

    pub fn state(&self) -> ContextState {
        self.0.state.get()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ContextState::Closed
    }

    fn check_open(&self) -> Result<(), CoreError> {
        match self.state() {
            ContextState::Active => Ok(()),
            _ => Err(CoreError::ContextClosed(format!("{:?}", self.0.id))),
        }
    }

    // ---- tags --------------------------------------------------------

    /// Required read: tag value, or its default, or `TagMissing`.
    pub fn get<T: Clone + 'static>(&self, tag: &Tag<T>) -> Result<T, CoreError> {
        self.0.tags.borrow().extract(tag)
    }

    /// Optional read: tag value, its default, or `None`.
    pub fn find<T: Clone + 'static>(&self, tag: &Tag<T>) -> Option<T> {
        self.0.tags.borrow().read(tag)
    }

    /// Writes into this context's own tag store only; descendants created
    /// afterwards observe it, ancestors never do.
    pub fn set<T: 'static>(&self, tagged: Tagged<T>) {
        self.0.tags.borrow_mut().insert(tagged);
    }

    pub fn flow_name(&self) -> Option<String> {
        self.find(&meta::flow_name_tag()).filter(|s: &String| !s.is_empty())
    }

    // ---- journal -------------------------------------------------------

    fn journal_key(&self, flow_name: Option<&str>, user_key: &str) -> String {
        format!("{}:{}:{}", flow_name.unwrap_or(""), self.0.depth, user_key)
    }

    pub fn reset_journal(&self, substring: Option<&str>) {
        match substring {
            None => self.0.journal.borrow_mut().clear(),
            Some(needle) => self.0.journal.borrow_mut().retain(|k, _| !k.contains(needle)),
        }
    }

    // ---- exec ------------------------------------------------------------

    /// Runs `flow` as a (non-journaled) subflow: a fresh child context,
    /// execution tags empty, definition tags not reapplied (only the
    /// top-level execution applies a flow's own tags).
    pub fn exec<In: Clone + 'static, Out: Clone + 'static>(
        &self,
        flow: &Flow<In, Out>,
        input: In,
    ) -> Eventual<Result<Out, CoreError>> {
        self.exec_with(ExecSpec { flow: flow.clone(), input, key: None, tags: TagMap::default(), timeout: None })
    }

    /// The full `{flow, input, key?, tags?, timeout?}` form: journaled iff
    /// `key` is present.
    #[cfg_attr(any(debug_assertions, test), tracing::instrument(level = "trace", skip_all, fields(flow = spec.flow.name(), key = spec.key.as_deref())))]
    pub fn exec_with<In: Clone + 'static, Out: Clone + 'static>(
        &self,
        spec: ExecSpec<In, Out>,
    ) -> Eventual<Result<Out, CoreError>> {
        if let Err(e) = self.check_open() {
            return Eventual::ready(Err(e));
        }
        let flow_name = spec.flow.name().map(|s| s.to_string());
        if let Some(key) = &spec.key {
            let jkey = self.journal_key(flow_name.as_deref(), key);
            if let Some(entry) = self.0.journal.borrow().get(&jkey).cloned() {
                return match entry {
                    JournalEntry::Value(v) => {
                        let v = v.downcast::<Out>().expect("journal type mismatch for key");
                        Eventual::ready(Ok((*v).clone()))
                    }
                    JournalEntry::Error(e) => Eventual::ready(Err(e)),
                };
            }
        }

        // Definition tags apply only on the top-level execution (see
        // `flow_executor::exec_on_scope`); a nested `ctx.exec`/`exec_with`
        // must not let the subflow's own definition tags clobber whatever
        // tag override the caller already set for this invocation.
        let child = self.child(flow_name.clone(), spec.tags.clone(), None);
        let flow = spec.flow.clone();
        let key = spec.key.clone();
        let parent = self.clone();
        let timeout = spec.timeout;

        if let Err(e) = flow.validate_input(&spec.input) {
            return Eventual::ready(Err(parent.finish_child_and_record(&child, key, Err(e))));
        }

        let operation = Operation::Execution {
            target: ExecutionTarget::Flow { name: flow_name.clone() },
            context_id: Some(child.id()),
        };
        let scope = self.0.scope.clone();
        let child_for_base = child.clone();
        let flow_for_base = flow.clone();
        let input = spec.input;
        let result = scope.extensions().dispatch(&scope, operation, move || {
            flow_for_base.invoke(child_for_base.clone(), input.clone()).map(|r| r.map(|v| Rc::new(v) as Rc<dyn Any>))
        });
        let result: Eventual<Result<Out, CoreError>> = result.map(|r| {
            r.and_then(|v| Ok((*v.downcast::<Out>().expect("flow output type mismatch")).clone()))
        });
        let result = match timeout {
            Some(d) => with_timeout(&child.0.signal, d, result),
            None => result,
        };
        result.then(move |outcome| {
            let validated = outcome.and_then(|out| flow.validate_output(&out).map(|_| out));
            let recorded = parent.finish_child_and_record(&child, key, validated);
            Eventual::ready(recorded)
        })
    }

    fn finish_child_and_record<T: Clone + 'static>(
        &self,
        child: &ExecutionContext,
        key: Option<String>,
        outcome: Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        child.settle(outcome.as_ref().err().cloned());
        child.close_sync(CloseMode::Graceful);
        if let Some(key) = key {
            let flow_name = child.flow_name();
            let jkey = self.journal_key(flow_name.as_deref(), &key);
            let entry = match &outcome {
                Ok(v) => JournalEntry::Value(Rc::new(v.clone())),
                Err(e) => JournalEntry::Error(e.clone()),
            };
            self.0.journal.borrow_mut().insert(jkey, entry);
        }
        outcome
    }

    /// Runs an arbitrary function under the same journaling/timeout rules
    /// `exec_with` gives a flow.
    #[cfg_attr(any(debug_assertions, test), tracing::instrument(level = "trace", skip_all, fields(fn_name = spec.name.as_deref(), key = spec.key.as_deref())))]
    pub fn exec_fn<Out: Clone + 'static>(&self, spec: FnExecSpec<Out>) -> Eventual<Result<Out, CoreError>> {
        if let Err(e) = self.check_open() {
            return Eventual::ready(Err(e));
        }
        let user_key = spec.key.clone();
        if let Some(key) = &user_key {
            let jkey = self.journal_key(None, key);
            if let Some(entry) = self.0.journal.borrow().get(&jkey).cloned() {
                return match entry {
                    JournalEntry::Value(v) => {
                        let v = v.downcast::<Out>().expect("journal type mismatch for key");
                        Eventual::ready(Ok((*v).clone()))
                    }
                    JournalEntry::Error(e) => Eventual::ready(Err(e)),
                };
            }
        }
        let scope = self.0.scope.clone();
        let operation = Operation::Execution {
            target: ExecutionTarget::Fn { name: spec.name.clone() },
            context_id: None,
        };
        // `dispatch`'s base must be `Fn` so every wrapping extension can
        // call it via a shared reference, but the user's function is
        // `FnOnce` and must run exactly once — stash it behind a `RefCell`
        // so the closure can take it out on its one expected call.
        let func = RefCell::new(Some(spec.func));
        let result = scope.extensions().dispatch(&scope, operation, move || match func.borrow_mut().take() {
            Some(f) => f().map(|r| r.map(|v| Rc::new(v) as Rc<dyn Any>)),
            None => Eventual::ready(Err(CoreError::ExecutorResolutionError(
                "extension called the exec_fn base more than once".into(),
            ))),
        });
        let result: Eventual<Result<Out, CoreError>> =
            result.map(|r| r.and_then(|v| Ok((*v.downcast::<Out>().expect("fn output type mismatch")).clone())));
        let result = match spec.timeout {
            Some(d) => with_timeout(&self.0.signal, d, result),
            None => result,
        };
        let parent = self.clone();
        result.then(move |outcome| {
            if let Some(key) = user_key {
                let jkey = parent.journal_key(None, &key);
                let entry = match &outcome {
                    Ok(v) => JournalEntry::Value(Rc::new(v.clone())),
                    Err(e) => JournalEntry::Error(e.clone()),
                };
                parent.0.journal.borrow_mut().insert(jkey, entry);
            }
            Eventual::ready(outcome)
        })
    }

    // ---- parallel combinators -------------------------------------------

    /// Awaits every item; fails fast on the first error. Preserves result
    /// order matching input order; execution order is unspecified.
    ///
    /// Dispatched through the scope's extension pipeline as an
    /// `Operation::Execution { target: ExecutionTarget::Parallel, .. }`, the
    /// same as a flow or fn invocation, so middleware can observe/instrument
    /// fan-out the same way it observes any other execution.
    #[cfg_attr(any(debug_assertions, test), tracing::instrument(level = "trace", skip_all, fields(count = items.len())))]
    pub fn parallel<T: Clone + 'static>(
        &self,
        items: Vec<Eventual<Result<T, CoreError>>>,
    ) -> Eventual<Result<ParallelOutcome<T>, CoreError>> {
        let total = items.len();
        let scope = self.0.scope.clone();
        let operation = Operation::Execution {
            target: ExecutionTarget::Parallel { count: total },
            context_id: Some(self.id()),
        };
        let items = RefCell::new(Some(items));
        let dispatched = scope.extensions().dispatch(&scope, operation, move || match items.borrow_mut().take() {
            Some(items) => Eventual::all(items).map(|results| {
                let mut values = Vec::with_capacity(total);
                for r in results {
                    match r {
                        Ok(v) => values.push(v),
                        Err(e) => return Err(e),
                    }
                }
                Ok(ParallelOutcome { stats: Stats { total, succeeded: total, failed: 0 }, results: values })
            })
            .map(|r| r.map(|v| Rc::new(v) as Rc<dyn Any>)),
            None => Eventual::ready(Err(CoreError::ExecutorResolutionError(
                "extension called the parallel base more than once".into(),
            ))),
        });
        dispatched.map(|r| r.map(|v| *v.downcast::<ParallelOutcome<T>>().expect("parallel outcome type mismatch")))
    }

    /// Awaits every item, never rejects; each item's outcome is preserved
    /// in a [`Settled`] alongside aggregate stats.
    ///
    /// Also dispatched through the extension pipeline (see [`Self::parallel`]);
    /// since this combinator itself never rejects, the dispatched operation
    /// never surfaces an error from the fan-out itself, only from a `wrap`
    /// hook that chooses to short-circuit.
    #[cfg_attr(any(debug_assertions, test), tracing::instrument(level = "trace", skip_all, fields(count = items.len())))]
    pub fn parallel_settled<T: Clone + 'static>(
        &self,
        items: Vec<Eventual<Result<T, CoreError>>>,
    ) -> Eventual<SettledOutcome<T>> {
        let total = items.len();
        let scope = self.0.scope.clone();
        let operation = Operation::Execution {
            target: ExecutionTarget::Parallel { count: total },
            context_id: Some(self.id()),
        };
        let items = RefCell::new(Some(items));
        let dispatched = scope.extensions().dispatch(&scope, operation, move || match items.borrow_mut().take() {
            Some(items) => Eventual::all_settled(items)
                .map(|results| {
                    let succeeded = results.iter().filter(|r| r.is_ok()).count();
                    let failed = total - succeeded;
                    let results = results
                        .into_iter()
                        .map(|r| match r {
                            Ok(v) => Settled::Fulfilled(v),
                            Err(e) => Settled::Rejected(e),
                        })
                        .collect();
                    Ok(SettledOutcome { results, stats: Stats { total, succeeded, failed } })
                })
                .map(|r: Result<SettledOutcome<T>, CoreError>| r.map(|v| Rc::new(v) as Rc<dyn Any>)),
            None => Eventual::ready(Err(CoreError::ExecutorResolutionError(
                "extension called the parallel_settled base more than once".into(),
            ))),
        });
        dispatched.map(|r| match r {
            Ok(v) => *v.downcast::<SettledOutcome<T>>().expect("settled outcome type mismatch"),
            // `parallel_settled` itself never rejects; only a `wrap` hook
            // that short-circuits the whole operation could produce this.
            // There's no per-item outcome to report in that case, so the
            // hook's rejection is folded in as the sole settled entry
            // rather than panicking or silently losing it.
            Err(e) => SettledOutcome { results: vec![Settled::Rejected(e)], stats: Stats { total: 1, succeeded: 0, failed: 1 } },
        })
    }

    // ---- lifecycle -------------------------------------------------------

    fn settle(&self, error: Option<CoreError>) {
        if self.0.completed_at.get().is_none() {
            self.0.completed_at.set(Some(Instant::now()));
            *self.0.error.borrow_mut() = error;
        }
    }

    /// Synchronous half of `close`: cascades the same mode to every child
    /// first (children never outlive a closed parent), then marks this
    /// context closed. `close` (async) additionally awaits in-flight
    /// descendants before calling this for the abort-aggregation case;
    /// callers that already know every descendant has settled (e.g. after
    /// a handler's `Eventual` resolved) can call this directly.
    fn close_sync(&self, mode: CloseMode) {
        if self.state() == ContextState::Closed {
            return;
        }
        self.0.state.set(ContextState::Closing);
        if mode == CloseMode::Abort {
            self.0.signal.abort(Some("context closed in abort mode".into()));
        }
        for child in self.0.children.borrow().iter() {
            child.close_sync(mode);
        }
        self.0.state.set(ContextState::Closed);
        self.0.scope.extensions().on_context_lifecycle(&self.0.scope, LifecyclePhase::Closed, self.id());
    }

    /// Transitions `active -> closing -> closed`. Graceful mode lets
    /// in-flight children run to completion before returning; abort mode
    /// signals abort immediately and aggregates every child's resulting
    /// error. Idempotent: a context already closing/closed returns the
    /// same terminal state without re-running cascade logic twice.
    pub async fn close(&self, mode: CloseMode) -> Result<(), CoreError> {
        if self.state() != ContextState::Active {
            return self.0.error.borrow().clone().map_or(Ok(()), Err);
        }
        self.0.state.set(ContextState::Closing);
        self.0.scope.extensions().on_context_lifecycle(&self.0.scope, LifecyclePhase::Closing, self.id());
        if mode == CloseMode::Abort {
            self.0.signal.abort(Some("context closed in abort mode".into()));
        }
        let children: Vec<_> = self.0.children.borrow().clone();
        let mut errors = Vec::new();
        for child in &children {
            if let Err(e) = Box::pin(child.close(mode)).await {
                errors.push(e);
            }
        }
        self.0.state.set(ContextState::Closed);
        self.0.scope.extensions().on_context_lifecycle(&self.0.scope, LifecyclePhase::Closed, self.id());
        if mode == CloseMode::Abort && !errors.is_empty() {
            let agg = CoreError::aggregate(errors);
            *self.0.error.borrow_mut() = Some(agg.clone());
            Err(agg)
        } else {
            Ok(())
        }
    }

    /// A lazily-computed snapshot, cached after first read following
    /// completion.
    pub fn details(&self) -> Rc<ExecutionDetails> {
        if self.0.completed_at.get().is_none() {
            return Rc::new(ExecutionDetails {
                name: self.0.name.clone(),
                depth: self.0.depth,
                elapsed: None,
                error: None,
            });
        }
        if let Some(cached) = self.0.details_cache.borrow().clone() {
            return cached;
        }
        let details = Rc::new(ExecutionDetails {
            name: self.0.name.clone(),
            depth: self.0.depth,
            elapsed: self.0.completed_at.get().map(|end| end.duration_since(self.0.started_at)),
            error: self.0.error.borrow().clone(),
        });
        *self.0.details_cache.borrow_mut() = Some(details.clone());
        details
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.0.id)
            .field("depth", &self.0.depth)
            .field("state", &self.state())
            .finish()
    }
}

/// The `{flow, input, key?, tags?, timeout?}` argument to `ctx.exec`.
pub struct ExecSpec<In, Out> {
    pub flow: Flow<In, Out>,
    pub input: In,
    pub key: Option<String>,
    pub tags: TagMap,
    pub timeout: Option<Duration>,
}

/// The `{fn, key?, timeout?}` argument to `ctx.exec` for a bare function.
pub struct FnExecSpec<Out> {
    pub name: Option<String>,
    pub func: Box<dyn FnOnce() -> Eventual<Result<Out, CoreError>>>,
    pub key: Option<String>,
    pub timeout: Option<Duration>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub struct ParallelOutcome<T> {
    pub results: Vec<T>,
    pub stats: Stats,
}

#[derive(Clone, Debug)]
pub enum Settled<T> {
    Fulfilled(T),
    Rejected(CoreError),
}

pub struct SettledOutcome<T> {
    pub results: Vec<Settled<T>>,
    pub stats: Stats,
}

impl<T: Clone> SettledOutcome<T> {
    pub fn partition(&self) -> (Vec<T>, Vec<CoreError>) {
        let mut fulfilled = Vec::new();
        let mut rejected = Vec::new();
        for r in &self.results {
            match r {
                Settled::Fulfilled(v) => fulfilled.push(v.clone()),
                Settled::Rejected(e) => rejected.push(e.clone()),
            }
        }
        (fulfilled, rejected)
    }

    pub fn fulfilled(&self) -> Vec<T> {
        self.partition().0
    }

    pub fn rejected(&self) -> Vec<CoreError> {
        self.partition().1
    }

    pub fn first_fulfilled(&self) -> Option<T> {
        self.results.iter().find_map(|r| match r {
            Settled::Fulfilled(v) => Some(v.clone()),
            Settled::Rejected(_) => None,
        })
    }

    pub fn first_rejected(&self) -> Option<CoreError> {
        self.results.iter().find_map(|r| match r {
            Settled::Rejected(e) => Some(e.clone()),
            Settled::Fulfilled(_) => None,
        })
    }

    pub fn find_fulfilled(&self, pred: impl Fn(&T) -> bool) -> Option<T> {
        self.fulfilled().into_iter().find(pred)
    }

    pub fn map_fulfilled<U>(&self, f: impl Fn(&T) -> U) -> Vec<U> {
        self.fulfilled().iter().map(f).collect()
    }

    /// Fails with an aggregate error (or `custom_err`, if given) unless
    /// every item fulfilled.
    pub fn assert_all_fulfilled(&self, custom_err: Option<CoreError>) -> Result<Vec<T>, CoreError> {
        let (fulfilled, rejected) = self.partition();
        if rejected.is_empty() {
            Ok(fulfilled)
        } else {
            Err(custom_err.unwrap_or_else(|| CoreError::aggregate(rejected)))
        }
    }
}

/// Wraps `inner` so it resolves to `OperationTimeout` if `duration` elapses
/// first; `signal` is aborted on timeout so a cooperating handler observes
/// it. A `Ready` eventual never races a timer (there's nothing to wait
/// for), matching "timeout only applies to in-flight work".
fn with_timeout<T: 'static>(
    signal: &AbortSignal,
    duration: Duration,
    inner: Eventual<Result<T, CoreError>>,
) -> Eventual<Result<T, CoreError>> {
    match inner {
        Eventual::Ready(v) => Eventual::Ready(v),
        Eventual::Pending(fut) => {
            let signal = signal.clone();
            Eventual::pending(async move {
                let sleep = tokio::time::sleep(duration);
                futures::pin_mut!(sleep);
                futures::select! {
                    result = fut.fuse() => result,
                    _ = sleep.fuse() => {
                        signal.abort(Some("timeout".into()));
                        Err(CoreError::OperationTimeout(format!("{}ms", duration.as_millis())))
                    }
                }
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::{Scope, ScopeOptions};

    fn root_ctx() -> (Scope, ExecutionContext) {
        let scope = Scope::root(ScopeOptions::default());
        let ctx = ExecutionContext::root(&scope, Some("root".into()), TagMap::default(), None);
        (scope, ctx)
    }

    #[test]
    fn flow_name_and_depth_seeded() {
        let (_scope, ctx) = root_ctx();
        assert_eq!(ctx.find(&meta::flow_name_tag()), Some("root".to_string()));
        assert_eq!(ctx.find(&meta::depth_tag()), Some(0));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn journal_replays_without_reinvoking() {
        let (_scope, ctx) = root_ctx();
        let counter = Rc::new(Cell::new(0));
        let flow = Flow::<i32, i32>::new(Some("calc"), {
            let counter = counter.clone();
            move |_ctx, input| {
                counter.set(counter.get() + 1);
                Eventual::ready(Ok(input * 2))
            }
        });
        let spec = |flow: &Flow<i32, i32>| ExecSpec {
            flow: flow.clone(),
            input: 5,
            key: Some("calc".into()),
            tags: TagMap::default(),
            timeout: None,
        };
        let r1 = ctx.exec_with(spec(&flow)).into_future().await.unwrap();
        let r2 = ctx.exec_with(spec(&flow)).into_future().await.unwrap();
        assert_eq!(r1, 10);
        assert_eq!(r2, 10);
        assert_eq!(counter.get(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn reset_journal_allows_rerun() {
        let (_scope, ctx) = root_ctx();
        let counter = Rc::new(Cell::new(0));
        let flow = Flow::<i32, i32>::new(Some("calc"), {
            let counter = counter.clone();
            move |_ctx, input| {
                counter.set(counter.get() + 1);
                Eventual::ready(Ok(input))
            }
        });
        let spec = ExecSpec {
            flow: flow.clone(),
            input: 1,
            key: Some("k".into()),
            tags: TagMap::default(),
            timeout: None,
        };
        ctx.exec_with(spec).into_future().await.unwrap();
        ctx.reset_journal(None);
        let spec2 = ExecSpec { flow, input: 1, key: Some("k".into()), tags: TagMap::default(), timeout: None };
        ctx.exec_with(spec2).into_future().await.unwrap();
        assert_eq!(counter.get(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn parallel_settled_partitions_in_order() {
        let (_scope, ctx) = root_ctx();
        let items: Vec<Eventual<Result<i32, CoreError>>> = vec![
            Eventual::ready(Ok(10)),
            Eventual::ready(Err(CoreError::OperationAborted("fail".into()))),
            Eventual::ready(Ok(6)),
        ];
        let outcome = ctx.parallel_settled(items).into_future().await;
        let (fulfilled, rejected) = outcome.partition();
        assert_eq!(fulfilled, vec![10, 6]);
        assert_eq!(rejected.len(), 1);
        assert_eq!(outcome.stats, Stats { total: 3, succeeded: 2, failed: 1 });
    }

    #[tokio::test(flavor = "current_thread")]
    async fn parallel_fails_fast_on_first_error() {
        let (_scope, ctx) = root_ctx();
        let items: Vec<Eventual<Result<i32, CoreError>>> =
            vec![Eventual::ready(Ok(1)), Eventual::ready(Err(CoreError::OperationAborted("x".into())))];
        let outcome = ctx.parallel(items).into_future().await;
        assert!(outcome.is_err());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn exec_after_close_is_context_closed() {
        let (_scope, ctx) = root_ctx();
        ctx.close(CloseMode::Graceful).await.unwrap();
        let flow = Flow::<i32, i32>::new(Some("f"), |_c, i| Eventual::ready(Ok(i)));
        let result = ctx.exec(&flow, 1).into_future().await;
        assert!(matches!(result, Err(CoreError::ContextClosed(_))));
    }
}
