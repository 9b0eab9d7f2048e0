//! `ctx.parallel_settled` across real async delays: a mix of fast/slow,
//! succeeding/failing work settles as a single outcome that never itself
//! rejects, preserving input order and per-item stats.

use flowgraph::{CoreError, ExecOptions, Eventual, Flow, Scope, ScopeOptions, Settled};
use std::time::Duration;

#[tokio::test(flavor = "current_thread")]
async fn mixed_outcomes_are_all_collected_in_order() {
    let scope = Scope::root(ScopeOptions::default());

    let flow: Flow<(), Vec<i32>> = Flow::new(Some("fan_out"), |ctx, _input| {
        let items = vec![
            Eventual::pending(async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(1)
            }),
            Eventual::ready(Err(CoreError::OperationAborted("bad item".into()))),
            Eventual::pending(async {
                tokio::time::sleep(Duration::from_millis(1)).await;
                Ok(3)
            }),
        ];
        ctx.parallel_settled(items).map(|outcome| {
            let (fulfilled, _rejected) = outcome.partition();
            Ok(fulfilled)
        })
    });

    let fulfilled = scope.exec(ExecOptions::new(flow, ())).result().into_future().await.unwrap();
    assert_eq!(fulfilled, vec![1, 3]);
}

#[tokio::test(flavor = "current_thread")]
async fn stats_and_settled_variants_reflect_every_item() {
    let scope = Scope::root(ScopeOptions::default());

    let flow: Flow<(), (usize, usize, usize)> = Flow::new(Some("stats"), |ctx, _input| {
        let items = vec![
            Eventual::ready(Ok(1)),
            Eventual::ready(Err(CoreError::TagMissing("x".into()))),
            Eventual::ready(Ok(2)),
        ];
        ctx.parallel_settled(items).map(|outcome| {
            let rejected_count =
                outcome.results.iter().filter(|r| matches!(r, Settled::Rejected(_))).count();
            Ok((outcome.stats.total, outcome.stats.succeeded, rejected_count))
        })
    });

    let (total, succeeded, rejected) =
        scope.exec(ExecOptions::new(flow, ())).result().into_future().await.unwrap();
    assert_eq!((total, succeeded, rejected), (3, 2, 1));
}

#[tokio::test(flavor = "current_thread")]
async fn parallel_fails_fast_but_settled_never_rejects() {
    let scope = Scope::root(ScopeOptions::default());

    let flow: Flow<(), ()> = Flow::new(Some("fail_fast"), |ctx, _input| {
        let items: Vec<Eventual<Result<i32, CoreError>>> =
            vec![Eventual::ready(Ok(1)), Eventual::ready(Err(CoreError::TagMissing("y".into())))];
        ctx.parallel(items).map(|r| match r {
            Ok(_) => Ok(()),
            Err(_) => Ok(()),
        })
    });

    // the flow handler itself treats the failure as expected and still
    // completes the top-level execution successfully.
    let result = scope.exec(ExecOptions::new(flow, ())).result().into_future().await;
    assert!(result.is_ok());
}
