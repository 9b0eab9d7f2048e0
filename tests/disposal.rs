//! Two-phase graceful disposal at the scope level: `Scope::dispose` waits
//! up to its grace period for in-flight top-level executions to settle
//! before finalising, and a newly created execution is rejected once
//! disposal has begun.

use flowgraph::{
    Channel, CoreError, DependencySpec, DisposeOptions, ExecOptions, Eventual, Executor, Flow, Scope, ScopeOptions,
};
use std::{cell::Cell, rc::Rc, time::Duration};

#[tokio::test(flavor = "current_thread")]
async fn dispose_waits_for_an_in_flight_flow_to_finish() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let scope = Scope::root(ScopeOptions::default());

            let slow: Flow<(), &'static str> = Flow::new(Some("slow"), |_ctx, _input| {
                Eventual::pending(async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok("done")
                })
            });

            let execution = scope.exec(ExecOptions::new(slow, ()));
            let result_fut = execution.result();

            let scope_for_dispose = scope.clone();
            let dispose_task = tokio::task::spawn_local(async move {
                scope_for_dispose.dispose(DisposeOptions { grace_period: Some(Duration::from_millis(200)) }).await
            });

            assert_eq!(result_fut.into_future().await.unwrap(), "done");
            dispose_task.await.unwrap().unwrap();
            assert!(scope.is_disposed());
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn a_disposing_scope_rejects_new_work() {
    let scope = Scope::root(ScopeOptions::default());
    scope.dispose(DisposeOptions { grace_period: Some(Duration::ZERO) }).await.unwrap();
    assert!(scope.is_disposed());

    let flow: Flow<(), ()> = Flow::new(Some("noop"), |_ctx, _input| Eventual::ready(Ok(())));
    let outcome = scope.exec(ExecOptions::new(flow, ())).result().into_future().await;
    assert!(matches!(outcome, Err(CoreError::ScopeDisposed)));
}

#[tokio::test(flavor = "current_thread")]
async fn a_resolved_entrys_cleanup_runs_during_disposal_finalisation() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let scope = Scope::root(ScopeOptions::default());
            let cleaned_up = Rc::new(Cell::new(false));
            let flag = cleaned_up.clone();

            let resource = Executor::new(Some("resource"), Channel::Main, DependencySpec::None, move |cx| {
                let flag = flag.clone();
                cx.cleanup(move || flag.set(true));
                Eventual::pending(async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(())
                })
            });

            scope.resolve(&resource).into_future().await.unwrap();
            assert!(!cleaned_up.get());

            scope.dispose(DisposeOptions { grace_period: Some(Duration::from_millis(200)) }).await.unwrap();
            assert!(cleaned_up.get());
            assert!(scope.is_disposed());
        })
        .await;
}
