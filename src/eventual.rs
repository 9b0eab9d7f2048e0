#![forbid(unsafe_code)]
//! [`Eventual<T>`] bridges synchronously-available values and values that
//! are only available after awaiting a future, so factories, validators,
//! and flow handlers can return either without the caller caring which.
//!
//! This is deliberately a thin, single-threaded (`!Send`) monad: scopes and
//! execution contexts are `Rc`-based (see [`crate::scope`]), so an
//! `Eventual` never needs to cross a thread boundary.

use futures::future::LocalBoxFuture;
use std::future::Future;

/// Either an already-computed `T`, or a future that will produce one.
pub enum Eventual<T> {
    Ready(T),
    Pending(LocalBoxFuture<'static, T>),
}

impl<T: 'static> Eventual<T> {
    pub fn ready(value: T) -> Self {
        Eventual::Ready(value)
    }

    pub fn pending(fut: impl Future<Output = T> + 'static) -> Self {
        Eventual::Pending(Box::pin(fut))
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Eventual::Ready(_))
    }

    /// Synchronous attempt to construct a value, preserved as-is (never
    /// wrapped in a future). Mirrors a `try { ... }` block whose body does
    /// not itself await anything.
    pub fn try_sync(f: impl FnOnce() -> T) -> Self {
        Eventual::Ready(f())
    }

    pub fn map<U: 'static>(self, f: impl FnOnce(T) -> U + 'static) -> Eventual<U> {
        match self {
            Eventual::Ready(v) => Eventual::Ready(f(v)),
            Eventual::Pending(fut) => Eventual::Pending(Box::pin(async move { f(fut.await) })),
        }
    }

    /// Chains another `Eventual`-producing step; flattens `Pending(Pending)`
    /// into a single future the same way `Future::then` would.
    pub fn then<U: 'static>(self, f: impl FnOnce(T) -> Eventual<U> + 'static) -> Eventual<U> {
        match self {
            Eventual::Ready(v) => f(v),
            Eventual::Pending(fut) => Eventual::Pending(Box::pin(async move {
                match f(fut.await) {
                    Eventual::Ready(v) => v,
                    Eventual::Pending(fut2) => fut2.await,
                }
            })),
        }
    }

    /// Bridges to a plain future (the `toPromise` equivalent): a `Ready`
    /// value resolves immediately on first poll, a `Pending` one awaits
    /// its underlying future.
    pub async fn into_future(self) -> T {
        match self {
            Eventual::Ready(v) => v,
            Eventual::Pending(fut) => fut.await,
        }
    }

    fn into_local_future(self) -> LocalBoxFuture<'static, T> {
        match self {
            Eventual::Ready(v) => Box::pin(async move { v }),
            Eventual::Pending(fut) => fut,
        }
    }

    /// Waits for every item, preserving order, resolving only once all
    /// have resolved (eager, non-short-circuiting — pair with
    /// `Result`-typed items and [`Eventual::all_settled`]/`?` for
    /// fail-fast semantics over fallible work).
    pub fn all(items: Vec<Eventual<T>>) -> Eventual<Vec<T>> {
        if items.iter().all(Eventual::is_ready) {
            return Eventual::Ready(
                items
                    .into_iter()
                    .map(|e| match e {
                        Eventual::Ready(v) => v,
                        Eventual::Pending(_) => unreachable!(),
                    })
                    .collect(),
            );
        }
        let futures = items.into_iter().map(Eventual::into_local_future);
        Eventual::Pending(Box::pin(futures::future::join_all(futures)))
    }

    /// Resolves as soon as the first item resolves; the rest are dropped.
    pub fn race(items: Vec<Eventual<T>>) -> Eventual<T> {
        if let Some(pos) = items.iter().position(Eventual::is_ready) {
            let mut items = items;
            return match items.remove(pos) {
                Eventual::Ready(v) => Eventual::Ready(v),
                Eventual::Pending(_) => unreachable!(),
            };
        }
        let futures = items.into_iter().map(Eventual::into_local_future);
        Eventual::Pending(Box::pin(async move {
            let (value, _idx, _rest) = futures::future::select_all(futures).await;
            value
        }))
    }
}

impl<T: 'static, E: 'static> Eventual<Result<T, E>> {
    /// Waits for every item regardless of success/failure, collecting
    /// each outcome in order — the `allSettled` combinator.
    pub fn all_settled(items: Vec<Eventual<Result<T, E>>>) -> Eventual<Vec<Result<T, E>>> {
        Eventual::all(items)
    }

    /// Wraps a fallible synchronous computation — the `try` combinator.
    pub fn try_fn(f: impl FnOnce() -> Result<T, E>) -> Self {
        Eventual::Ready(f())
    }
}

/// Splits a batch of settled outcomes into successes and failures,
/// preserving relative order within each half.
pub fn partition<T, E>(settled: Vec<Result<T, E>>) -> (Vec<T>, Vec<E>) {
    let mut oks = Vec::new();
    let mut errs = Vec::new();
    for item in settled {
        match item {
            Ok(v) => oks.push(v),
            Err(e) => errs.push(e),
        }
    }
    (oks, errs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_map_stays_sync() {
        let e = Eventual::ready(2).map(|v| v * 3);
        assert!(e.is_ready());
        match e {
            Eventual::Ready(v) => assert_eq!(v, 6),
            _ => panic!("expected ready"),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn pending_resolves_through_future() {
        let e = Eventual::pending(async { 5 }).map(|v| v + 1);
        assert_eq!(e.into_future().await, 6);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn all_preserves_order() {
        let items = vec![Eventual::ready(1), Eventual::pending(async { 2 }), Eventual::ready(3)];
        let result = Eventual::all(items).into_future().await;
        assert_eq!(result, vec![1, 2, 3]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn all_settled_keeps_failures_alongside_successes() {
        let items: Vec<Eventual<Result<i32, String>>> = vec![
            Eventual::ready(Ok(1)),
            Eventual::pending(async { Err("boom".to_string()) }),
        ];
        let settled = Eventual::all_settled(items).into_future().await;
        let (oks, errs) = partition(settled);
        assert_eq!(oks, vec![1]);
        assert_eq!(errs, vec!["boom".to_string()]);
    }
}
