#![forbid(unsafe_code)]
//! Well-known tags seeded into every execution context before its handler
//! runs: `flow_name` (the enclosing flow, if any) and `depth` (nesting
//! depth from the root execution, 0 at the root).
//!
//! These have to be *the same* [`Tag`] identity everywhere they're read or
//! written, which rules out `Tag::new` at each call site (every call
//! allocates a fresh, distinct id). A `thread_local!` singleton is the
//! idiomatic fix here — the crate is single-threaded-cooperative by design
//! (see the scope module docs), so there's never a second thread's copy to
//! keep in sync.

use crate::tag::Tag;

thread_local! {
    static FLOW_NAME: Tag<String> = Tag::new("flowName");
    static DEPTH: Tag<u32> = Tag::new("depth").with_default(|| 0);
}

pub fn flow_name_tag() -> Tag<String> {
    FLOW_NAME.with(|t| t.clone())
}

pub fn depth_tag() -> Tag<u32> {
    DEPTH.with(|t| t.clone())
}
