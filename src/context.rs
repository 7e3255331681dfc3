//! Ambient call-context propagation.
//!
//! Three independent scalars ride along a logical call chain without being
//! passed explicitly: the current run id (used as the default parent for
//! anything traced inside the chain), the current user identity, and the
//! current evaluation binding. Each lives in a `tokio::task_local!` slot and
//! is installed for the duration of a future via the `scope_*` functions;
//! nested scopes shadow the outer value and restore it when the inner future
//! completes or is dropped, so two independently traced call trees can
//! interleave on the same runtime without crosstalk.
//!
//! Task-locals do not cross `tokio::spawn` boundaries. Code that spawns work
//! and wants it parented must re-scope inside the task or use
//! `set_parent` on the traced call.

use std::future::Future;

tokio::task_local! {
    static RUN_ID: Option<String>;
    static USER_ID: Option<String>;
    static EVALUATION_ID: Option<String>;
}

/// Run `f` with `run_id` as the ambient current run id.
pub async fn scope_run_id<F: Future>(run_id: String, f: F) -> F::Output {
    RUN_ID.scope(Some(run_id), f).await
}

/// Run `f` with `user_id` as the ambient user identity.
pub async fn scope_user_id<F: Future>(user_id: String, f: F) -> F::Output {
    USER_ID.scope(Some(user_id), f).await
}

/// Run `f` with `evaluation_id` as the ambient evaluation binding.
pub async fn scope_evaluation_id<F: Future>(evaluation_id: String, f: F) -> F::Output {
    EVALUATION_ID.scope(Some(evaluation_id), f).await
}

/// The run id of the innermost enclosing traced call, if any.
pub fn current_run_id() -> Option<String> {
    RUN_ID.try_with(Clone::clone).unwrap_or_default()
}

/// The ambient user identity, if any.
pub fn current_user_id() -> Option<String> {
    USER_ID.try_with(Clone::clone).unwrap_or_default()
}

/// The ambient evaluation binding, if any.
pub fn current_evaluation_id() -> Option<String> {
    EVALUATION_ID.try_with(Clone::clone).unwrap_or_default()
}
