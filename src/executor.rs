#![forbid(unsafe_code)]
//! Executors: the immutable descriptions a [`Scope`](crate::scope::Scope)
//! resolves into cached values.
//!
//! An `Executor<T>` pairs a factory with a declared dependency shape, a
//! channel that decides how its cache slot behaves under reactive
//! propagation, and a set of definition tags. Two `Executor<T>` handles
//! that share the same [`ExecutorId`] (obtained by cloning) resolve to the
//! same cache slot in every scope that sees either of them — the same
//! identity-not-structure equality a `NodeId` gives signals.

use crate::{
    error::CoreError,
    eventual::Eventual,
    tag::{TagMap, Tagged},
};
use std::{
    any::Any,
    cell::RefCell,
    fmt,
    hash::{Hash, Hasher},
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
};

/// Identifies an executor's *definition*, independent of which scope (if
/// any) has resolved it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutorId(u64);

impl fmt::Debug for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExecutorId({})", self.0)
    }
}

fn next_executor_id() -> ExecutorId {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    ExecutorId(NEXT.fetch_add(1, Ordering::Relaxed))
}

/// How a resolved value behaves as its dependencies change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    /// Resolved once per scope; supports `Scope::update` like a plain
    /// mutable cell, and propagates that update to its dependents.
    Main,
    /// Derived from other executors; recomputed automatically once a
    /// direct dependency produces a new value.
    Reactive,
    /// Resolved on first read and cached forever after, without
    /// re-tracking dependency changes; also supports `Scope::update`.
    Lazy,
    /// Resolved lazily on first read, like `Lazy`, but never recomputed or
    /// evicted afterwards for the lifetime of the scope — a dependent of a
    /// `static` executor got a handle, not a value, so it is never marked
    /// dirty when the executor it depends on changes upstream.
    Static,
}

impl Channel {
    pub(crate) fn supports_update(self) -> bool {
        matches!(self, Channel::Main | Channel::Lazy)
    }

    pub(crate) fn is_reactive(self) -> bool {
        matches!(self, Channel::Reactive)
    }
}

/// How an executor declared its dependencies, for introspection and for
/// building readable dependency-chain error messages. The actual values
/// are pulled through [`ResolveCx::resolve`] inside the factory body,
/// which is how a `Named`/`List` declaration is threaded through without
/// needing variadic generics.
#[derive(Clone, Debug, Default)]
pub enum DependencySpec {
    #[default]
    None,
    Single(ExecutorId),
    Named(Vec<(String, ExecutorId)>),
    List(Vec<ExecutorId>),
}

impl DependencySpec {
    pub(crate) fn ids(&self) -> Vec<ExecutorId> {
        match self {
            DependencySpec::None => Vec::new(),
            DependencySpec::Single(id) => vec![*id],
            DependencySpec::Named(pairs) => pairs.iter().map(|(_, id)| *id).collect(),
            DependencySpec::List(ids) => ids.clone(),
        }
    }
}

/// The controller passed into a factory (`(deps, controller)` in spec
/// terms): lets the factory resolve its own declared dependencies, read
/// tags visible at the point of resolution, and register a `cleanup` run
/// LIFO when this entry is released/reloaded/disposed, or trigger its own
/// `release`/`reload`.
pub struct ResolveCx {
    pub(crate) scope: crate::scope::Scope,
    pub(crate) node_id: crate::node::NodeId,
}

impl ResolveCx {
    pub fn resolve<T: Clone + 'static>(&self, dep: &Executor<T>) -> Eventual<Result<T, CoreError>> {
        self.scope.resolve(dep)
    }

    pub fn scope(&self) -> &crate::scope::Scope {
        &self.scope
    }

    /// Registers a cleanup run in LIFO order alongside this entry's
    /// siblings when the entry is released, reloaded, or the owning scope
    /// is disposed.
    pub fn cleanup(&self, f: impl FnOnce() + 'static) {
        self.scope.push_node_cleanup(self.node_id, Box::new(f));
    }

    /// Evicts this entry now: runs its cleanups LIFO and invalidates
    /// dependents, the same as `Scope::release` targeting this executor.
    pub fn release(&self) {
        self.scope.release_node(self.node_id);
    }

    /// Evicts this entry and immediately re-invokes its factory, rather
    /// than waiting for the next `resolve` to recompute it lazily.
    pub fn reload(&self) {
        self.scope.reload_node(self.node_id);
    }
}

type Factory<T> = Box<dyn Fn(&ResolveCx) -> Eventual<Result<T, CoreError>>>;

pub(crate) struct ExecutorInner<T> {
    id: ExecutorId,
    name: Option<&'static str>,
    channel: Channel,
    dependencies: DependencySpec,
    tags: TagMap,
    factory: Factory<T>,
    #[allow(clippy::type_complexity)]
    selector_eq: Option<Box<dyn Fn(&T, &T) -> bool>>,
    /// Memoises `Executor::select` by a hash of its key, so repeated
    /// `select(same_key)` calls return the same child `ExecutorId` (see
    /// the "Selectors" design note: identity, not structure, is what makes
    /// two calls resolve to the same cache slot).
    selectors: RefCell<rustc_hash::FxHashMap<u64, Rc<dyn Any>>>,
}

/// Type-erased view of an executor, used by the scope's node arena so the
/// cache doesn't need to be generic over every `T` it ever stores.
pub(crate) trait AnyExecutor {
    fn id(&self) -> ExecutorId;
    fn name(&self) -> Option<&'static str>;
    fn channel(&self) -> Channel;
    fn dependencies(&self) -> &DependencySpec;
    fn tags(&self) -> &TagMap;
    fn call_factory(&self, cx: &ResolveCx) -> Eventual<Result<Rc<dyn Any>, CoreError>>;
    fn values_equal(&self, a: &Rc<dyn Any>, b: &Rc<dyn Any>) -> bool;
}

impl<T: 'static> AnyExecutor for ExecutorInner<T> {
    fn id(&self) -> ExecutorId {
        self.id
    }

    fn name(&self) -> Option<&'static str> {
        self.name
    }

    fn channel(&self) -> Channel {
        self.channel
    }

    fn dependencies(&self) -> &DependencySpec {
        &self.dependencies
    }

    fn tags(&self) -> &TagMap {
        &self.tags
    }

    fn call_factory(&self, cx: &ResolveCx) -> Eventual<Result<Rc<dyn Any>, CoreError>> {
        (self.factory)(cx).map(|r| r.map(|v| Rc::new(v) as Rc<dyn Any>))
    }

    fn values_equal(&self, a: &Rc<dyn Any>, b: &Rc<dyn Any>) -> bool {
        match (&self.selector_eq, a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
            (Some(eq), Some(a), Some(b)) => eq(a, b),
            _ => false,
        }
    }
}

/// A handle to an executor definition. Cheap to clone (an `Rc` bump);
/// every clone shares the same [`ExecutorId`] and therefore the same
/// cache slot in any scope that resolves it.
pub struct Executor<T> {
    pub(crate) inner: Rc<ExecutorInner<T>>,
}

impl<T> Clone for Executor<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: 'static> Executor<T> {
    #[track_caller]
    pub fn new(
        name: Option<&'static str>,
        channel: Channel,
        dependencies: DependencySpec,
        factory: impl Fn(&ResolveCx) -> Eventual<Result<T, CoreError>> + 'static,
    ) -> Self {
        Self {
            inner: Rc::new(ExecutorInner {
                id: next_executor_id(),
                name,
                channel,
                dependencies,
                tags: TagMap::new(),
                factory: Box::new(factory),
                selector_eq: None,
                selectors: RefCell::new(rustc_hash::FxHashMap::default()),
            }),
        }
    }

    /// A `Static`-channel executor that never depends on anything and is
    /// already resolved.
    pub fn value(name: Option<&'static str>, value: T) -> Self
    where
        T: Clone,
    {
        Self::new(name, Channel::Static, DependencySpec::None, move |_| {
            Eventual::ready(Ok(value.clone()))
        })
    }

    pub fn id(&self) -> ExecutorId {
        self.inner.id
    }

    pub fn name(&self) -> Option<&'static str> {
        self.inner.name
    }

    pub fn channel(&self) -> Channel {
        self.inner.channel
    }

    /// Attaches a definition tag. Definition tags are applied before any
    /// tags supplied by the call site that triggers resolution.
    pub fn with_tag<U: 'static>(mut self, tagged: Tagged<U>) -> Self {
        let inner = Rc::get_mut(&mut self.inner)
            .expect("Executor::with_tag must run before the executor is cloned/shared");
        inner.tags.insert(tagged);
        self
    }

    /// Registers an equality function used by `Scope::select`, so callers
    /// can subscribe to "did this change" rather than every recomputation.
    pub fn with_selector(mut self, eq: impl Fn(&T, &T) -> bool + 'static) -> Self {
        let inner = Rc::get_mut(&mut self.inner)
            .expect("Executor::with_selector must run before the executor is cloned/shared");
        inner.selector_eq = Some(Box::new(eq));
        self
    }

    pub(crate) fn as_any_executor(&self) -> Rc<dyn AnyExecutor> {
        self.inner.clone()
    }

    /// Derives a child executor whose value is `extract(parent_value,
    /// &key)`, reactive over `self` and suppressing propagation when the
    /// extracted slice compares equal to the previous one (`V: PartialEq`).
    /// Repeated `select` calls with an equal `key` return a child sharing
    /// the same [`ExecutorId`] — so two consumers selecting the same slice
    /// share one cache entry instead of each re-deriving it.
    pub fn select<K, V>(&self, key: K, extract: impl Fn(&T, &K) -> V + 'static) -> Executor<V>
    where
        T: Clone,
        K: Clone + Hash + 'static,
        V: Clone + PartialEq + 'static,
    {
        let mut hasher = rustc_hash::FxHasher::default();
        std::any::TypeId::of::<K>().hash(&mut hasher);
        key.hash(&mut hasher);
        let cache_key = hasher.finish();

        if let Some(existing) = self.inner.selectors.borrow().get(&cache_key) {
            if let Ok(typed) = existing.clone().downcast::<Executor<V>>() {
                return (*typed).clone();
            }
        }

        let parent = self.clone();
        let extract = Rc::new(extract);
        let child = Executor::new(self.name(), Channel::Reactive, single_dependency(self), move |cx| {
            let key = key.clone();
            let parent = parent.clone();
            let extract = extract.clone();
            cx.resolve(&parent).map(move |r| r.map(move |v| extract(&v, &key)))
        })
        .with_selector(|a: &V, b: &V| a == b);

        self.inner.selectors.borrow_mut().insert(cache_key, Rc::new(child.clone()) as Rc<dyn Any>);
        child
    }

    pub(crate) fn dependency_ids(&self) -> Vec<ExecutorId> {
        self.inner.dependencies.ids()
    }

    pub fn definition_tags(&self) -> &TagMap {
        &self.inner.tags
    }

    /// Invokes the typed factory directly, without going through the
    /// type-erased [`AnyExecutor`] vtable. Used by [`crate::scope::Scope`]
    /// on the fast path where `T` is already known statically (e.g.
    /// `Scope::update`'s current-value recompute).
    pub(crate) fn inner_call(&self, cx: &ResolveCx) -> Eventual<Result<T, CoreError>> {
        (self.inner.factory)(cx)
    }
}

/// Builds a [`DependencySpec::Single`] from a dependency handle.
pub fn single_dependency<T>(dep: &Executor<T>) -> DependencySpec {
    DependencySpec::Single(dep.id())
}

/// Builds a [`DependencySpec::Named`] from `(name, dependency)` pairs.
pub fn named_dependencies<T>(deps: &[(&str, &Executor<T>)]) -> DependencySpec {
    DependencySpec::Named(deps.iter().map(|(name, dep)| (name.to_string(), dep.id())).collect())
}

/// Builds a [`DependencySpec::List`] from a homogeneous dependency list.
pub fn list_dependencies<T>(deps: &[Executor<T>]) -> DependencySpec {
    DependencySpec::List(deps.iter().map(Executor::id).collect())
}

pub(crate) fn not_updatable(executor_name: Option<&str>) -> CoreError {
    CoreError::ExecutorResolutionError(format!(
        "executor {:?} is not updatable: only Main/Lazy channel executors support Scope::update",
        executor_name.unwrap_or("<anonymous>")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_executor_is_static_and_named() {
        let e = Executor::value(Some("answer"), 42);
        assert_eq!(e.name(), Some("answer"));
        assert_eq!(e.channel(), Channel::Static);
    }

    #[test]
    fn clones_share_identity() {
        let e = Executor::value(Some("answer"), 42);
        let cloned = e.clone();
        assert_eq!(e.id(), cloned.id());
    }
}
