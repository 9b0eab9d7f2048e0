#![forbid(unsafe_code)]
//! Cache-node bookkeeping for the scope's dependency graph.
//!
//! Every registered [`Executor`](crate::executor::Executor) owns exactly
//! one `NodeId` for its whole lifetime in a scope. The node tracks the
//! cached value (if any) and the dirty-marking state used to decide
//! whether a `reactive`-channel node needs to be recomputed before it is
//! read again — a `Clean`/`Check`/`Dirty` lattice borrowed from signal
//! graphs, pared down to what a DI-style cache needs.

use crate::{error::CoreError, executor::{AnyExecutor, Executor}};
use futures::future::{LocalBoxFuture, Shared};
use std::{any::Any, cell::RefCell, rc::Rc};

slotmap::new_key_type! {
    /// Identifies one executor's cache slot within a scope's node arena.
    pub struct NodeId;
}

/// Where a node stands relative to its dependencies.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum NodeState {
    /// Cached value is current; dependencies haven't changed.
    Clean,
    /// A transitive (not direct) dependency changed; must check whether
    /// the direct dependencies actually produced new values before
    /// deciding to recompute.
    Check,
    /// A direct dependency produced a new value, or this node has never
    /// resolved; must recompute on next read.
    Dirty,
    /// Dirty and already visited during the current mark-dirty pass —
    /// prevents revisiting the same node twice in one propagation.
    DirtyMarked,
    /// A factory call for this node is currently in flight; further
    /// `resolve` calls join [`CacheNode::pending`] instead of starting a
    /// second factory invocation. Re-entering `resolve` for this node
    /// while it is `Resolving` (same synchronous call stack) is a cycle.
    Resolving,
}

/// A factory invocation shared by every `resolve` call that observes the
/// node while it is still in flight, so duplicate resolve calls during
/// in-flight resolution share the pending `Eventual` rather than starting
/// a second factory invocation.
pub(crate) type PendingResolution = Shared<LocalBoxFuture<'static, Result<Rc<dyn Any>, CoreError>>>;

pub(crate) struct CacheNode {
    pub(crate) value: Option<Rc<dyn Any>>,
    pub(crate) state: NodeState,
    pub(crate) executor: Rc<dyn AnyExecutor>,
    /// Direct dependents, for propagating `Dirty`/`Check` when this node's
    /// value changes. Only populated for `reactive`-channel nodes; `lazy`
    /// and `static` nodes never propagate.
    pub(crate) dependents: Vec<NodeId>,
    /// Direct dependencies, recorded the first time this node resolves so
    /// a later `release`/dispose pass can walk the graph without
    /// re-invoking factories.
    pub(crate) dependencies: Vec<NodeId>,
    /// Set while `state == Resolving`; cleared once the factory settles.
    pub(crate) pending: Option<PendingResolution>,
    /// Cleanups registered by the factory's `controller.cleanup(fn)` calls,
    /// in push order; run LIFO on `release`, `reload`, and scope disposal.
    pub(crate) cleanups: RefCell<Vec<Box<dyn FnOnce()>>>,
}

impl CacheNode {
    pub(crate) fn new<T: 'static>(executor: &Executor<T>) -> Self {
        Self {
            value: None,
            state: NodeState::Dirty,
            executor: executor.as_any_executor(),
            dependents: Vec::new(),
            dependencies: Vec::new(),
            pending: None,
            cleanups: RefCell::new(Vec::new()),
        }
    }

    /// Drains and runs every registered cleanup for this entry, in LIFO
    /// order (most-recently-registered first).
    pub(crate) fn run_cleanups(&self) {
        let cleanups = std::mem::take(&mut *self.cleanups.borrow_mut());
        for cleanup in cleanups.into_iter().rev() {
            cleanup();
        }
    }

    pub(crate) fn value(&self) -> Option<Rc<dyn Any>> {
        self.value.clone()
    }
}
