//! Correlation ids thread a causal chain of messages.
//!
//! The bus runs every handler inside [`scope`] with the correlation id of the
//! message being handled, so anything the handler publishes inherits it.
//! Work a handler hands to `tokio::spawn` loses task-locals; wrap it in
//! [`scope`] again with [`current_or_new`] captured before spawning.

use std::future::Future;
use uuid::Uuid;

tokio::task_local! {
    static CORRELATION_ID: Uuid;
}

/// Correlation id of the message currently being handled, if any.
pub fn current() -> Option<Uuid> {
    CORRELATION_ID.try_with(|id| *id).ok()
}

/// The inherited correlation id, or a fresh one outside any handler.
pub fn current_or_new() -> Uuid {
    current().unwrap_or_else(Uuid::new_v4)
}

/// Run `fut` with `id` as the inherited correlation id.
pub async fn scope<F: Future>(id: Uuid, fut: F) -> F::Output {
    CORRELATION_ID.scope(id, fut).await
}
