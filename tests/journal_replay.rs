//! Journal replay: a keyed `ctx.exec` call inside a top-level flow
//! invocation only runs its target once no matter how many times the
//! handler re-issues the same key during that invocation.

use flowgraph::{ExecOptions, ExecSpec, Eventual, Flow, Scope, ScopeOptions};
use std::{cell::Cell, rc::Rc};

#[tokio::test(flavor = "current_thread")]
async fn repeated_keyed_subflow_calls_replay_without_reinvoking() {
    let scope = Scope::root(ScopeOptions::default());

    let calls = Rc::new(Cell::new(0));
    let calls_for_charge = calls.clone();
    let charge_card: Flow<u32, u32> = Flow::new(Some("charge_card"), move |_ctx, amount| {
        calls_for_charge.set(calls_for_charge.get() + 1);
        Eventual::ready(Ok(amount))
    });

    let outer: Flow<u32, u32> = Flow::new(Some("checkout"), move |ctx, amount| {
        let charge = charge_card.clone();
        let ctx1 = ctx.clone();
        let ctx2 = ctx.clone();
        let charge2 = charge.clone();
        ctx1.exec_with(ExecSpec {
            flow: charge,
            input: amount,
            key: Some("charge".into()),
            tags: Default::default(),
            timeout: None,
        })
        .then(move |first| {
            let first = first.unwrap();
            ctx2.exec_with(ExecSpec {
                flow: charge2,
                input: amount,
                key: Some("charge".into()),
                tags: Default::default(),
                timeout: None,
            })
            .map(move |second| second.map(|second| first + second))
        })
    });

    let total = scope.exec(ExecOptions::new(outer, 20)).result().into_future().await.unwrap();

    assert_eq!(total, 40, "both reads must observe the journaled value");
    assert_eq!(calls.get(), 1, "charge_card must be invoked exactly once despite two ctx.exec calls");
}

#[tokio::test(flavor = "current_thread")]
async fn resetting_the_journal_allows_a_fresh_invocation() {
    let scope = Scope::root(ScopeOptions::default());
    let calls = Rc::new(Cell::new(0));
    let calls_for_flow = calls.clone();
    let target: Flow<(), u32> = Flow::new(Some("target"), move |_ctx, _input| {
        let v = calls_for_flow.get();
        calls_for_flow.set(v + 1);
        Eventual::ready(Ok(v))
    });

    let outer: Flow<(), (u32, u32)> = Flow::new(Some("outer"), move |ctx, _input| {
        let target1 = target.clone();
        let ctx1 = ctx.clone();
        let ctx2 = ctx.clone();
        let target2 = target.clone();
        ctx1.exec_with(ExecSpec { flow: target1, input: (), key: Some("k".into()), tags: Default::default(), timeout: None })
            .then(move |first| {
                let first = first.unwrap();
                ctx2.reset_journal(None);
                ctx2.exec_with(ExecSpec {
                    flow: target2,
                    input: (),
                    key: Some("k".into()),
                    tags: Default::default(),
                    timeout: None,
                })
                .map(move |second| second.map(|second| (first, second)))
            })
    });

    let (first, second) = scope.exec(ExecOptions::new(outer, ())).result().into_future().await.unwrap();
    assert_eq!((first, second), (0, 1));
    assert_eq!(calls.get(), 2);
}
