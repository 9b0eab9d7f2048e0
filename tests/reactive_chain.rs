//! Reactive propagation: updating a `Main`-channel executor recomputes
//! every `Reactive`-channel executor derived from it, and a `select`ed
//! slice only notifies listeners when the extracted value actually
//! changes.

use flowgraph::{Channel, Executor, Eventual, Scope, ScopeOptions};
use std::{cell::RefCell, rc::Rc};

#[derive(Clone, Debug, PartialEq)]
struct Profile {
    name: String,
    age: u32,
}

#[tokio::test(flavor = "current_thread")]
async fn updating_a_dependency_propagates_through_a_derived_chain() {
    let scope = Scope::root(ScopeOptions::default());

    let base = Executor::new(
        Some("base"),
        Channel::Main,
        flowgraph::DependencySpec::None,
        |_cx| Eventual::ready(Ok(1)),
    );
    let base_for_doubled = base.clone();
    let doubled = Executor::new(
        Some("doubled"),
        Channel::Reactive,
        flowgraph::single_dependency(&base),
        move |cx| cx.resolve(&base_for_doubled).map(|r| r.map(|v| v * 2)),
    );

    assert_eq!(scope.resolve(&doubled).into_future().await.unwrap(), 2);

    scope.update(&base, |_| 5).unwrap();
    let accessor = scope.accessor(&doubled);
    assert_eq!(accessor.get(), Some(10));
}

#[tokio::test(flavor = "current_thread")]
async fn selecting_an_unchanged_slice_does_not_notify() {
    let scope = Scope::root(ScopeOptions::default());

    let profile = Executor::new(
        Some("profile"),
        Channel::Main,
        flowgraph::DependencySpec::None,
        |_cx| Eventual::ready(Ok(Profile { name: "ada".into(), age: 30 })),
    );
    let name_only = profile.select((), |p: &Profile, _key| p.name.clone());

    scope.resolve(&name_only).into_future().await.unwrap();

    let notifications: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let notifications_for_listener = notifications.clone();
    let _unsub = scope.on_update(&name_only, move |v: &String| {
        notifications_for_listener.borrow_mut().push(v.clone());
    });

    // Changing only `age` must not re-fire the name selector's listener.
    scope.update(&profile, |p| Profile { age: p.age + 1, ..p.clone() }).unwrap();
    scope.resolve(&name_only).into_future().await.unwrap();
    assert!(notifications.borrow().is_empty());

    // Changing `name` must.
    scope.update(&profile, |p| Profile { name: "grace".into(), ..p.clone() }).unwrap();
    scope.resolve(&name_only).into_future().await.unwrap();
    assert_eq!(notifications.borrow().as_slice(), ["grace".to_string()]);
}
