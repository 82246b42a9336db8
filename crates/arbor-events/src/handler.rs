//! Subscriber seam.

use crate::event::Event;
use arbor_core::ArborResult;
use async_trait::async_trait;
use std::future::Future;
use uuid::Uuid;

/// One delivery of a decoded event to one subscriber.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Topic the event was published on.
    pub topic: String,
    /// Transport message id; stable across retries of the same message.
    pub message_id: Uuid,
    /// Correlation id threaded from the originating publish.
    pub correlation_id: Uuid,
    /// 1 for the first attempt, incremented on each retry.
    pub attempt: u32,
    /// The decoded event.
    pub event: Event,
}

/// Receives events from a subscription.
///
/// Returning an error asks the bus to retry the delivery. Handlers run
/// concurrently with publishers and with other subscriptions, so shared state
/// needs its own synchronization. Redeliveries are possible; handlers should
/// be idempotent on `event.event_id`.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one delivery.
    async fn handle(&self, delivery: Delivery) -> ArborResult<()>;
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

/// Wrap `f` as an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = ArborResult<()>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = ArborResult<()>> + Send,
{
    async fn handle(&self, delivery: Delivery) -> ArborResult<()> {
        (self.0)(delivery).await
    }
}
