//! `ExecOptions::with_timeout`: a handler that outruns its budget is
//! aborted and the top-level execution settles as `OperationTimeout`
//! rather than hanging on the slow future forever.

use flowgraph::{CoreError, ExecOptions, Eventual, ExecutionStatus, Flow, Scope, ScopeOptions};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn a_flow_slower_than_its_budget_times_out() {
    let scope = Scope::root(ScopeOptions::default());

    let slow: Flow<(), &'static str> = Flow::new(Some("slow"), |_ctx, _input| {
        Eventual::pending(async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok("too late")
        })
    });

    let execution = scope.exec(
        ExecOptions::new(slow, ()).with_timeout(Duration::from_millis(50)),
    );

    tokio::time::advance(Duration::from_millis(51)).await;

    let outcome = execution.result().into_future().await;
    assert!(matches!(outcome, Err(CoreError::OperationTimeout(_))));
    assert_eq!(execution.status(), ExecutionStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn a_flow_faster_than_its_budget_still_completes() {
    let scope = Scope::root(ScopeOptions::default());

    let fast: Flow<(), u32> = Flow::new(Some("fast"), |_ctx, input: ()| {
        let _ = input;
        Eventual::pending(async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(7)
        })
    });

    let execution = scope.exec(
        ExecOptions::new(fast, ()).with_timeout(Duration::from_secs(1)),
    );

    tokio::time::advance(Duration::from_millis(6)).await;

    let outcome = execution.result().into_future().await;
    assert_eq!(outcome.unwrap(), 7);
    assert_eq!(execution.status(), ExecutionStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn aborting_on_timeout_signals_the_handler() {
    use std::{cell::Cell, rc::Rc};

    let scope = Scope::root(ScopeOptions::default());
    let observed_abort = Rc::new(Cell::new(false));
    let observed_abort_in_flow = observed_abort.clone();

    let watcher: Flow<(), ()> = Flow::new(Some("watcher"), move |ctx, _input| {
        let observed = observed_abort_in_flow.clone();
        let signal = ctx.signal().clone();
        signal.on_abort(move || observed.set(true));
        Eventual::pending(async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
    });

    let execution = scope.exec(
        ExecOptions::new(watcher, ()).with_timeout(Duration::from_millis(20)),
    );

    tokio::time::advance(Duration::from_millis(21)).await;
    execution.result().into_future().await.ok();

    assert!(observed_abort.get(), "the handler's abort signal must fire on timeout");
}
