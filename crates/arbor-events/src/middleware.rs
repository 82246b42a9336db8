//! Delivery middleware: panic recovery, bounded retry, correlation scope.

use crate::correlation;
use crate::handler::{Delivery, EventHandler};
use arbor_core::{ArborError, ArborResult};
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Fixed-backoff retry for handler errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay between attempts.
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            interval: Duration::from_secs(1),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Invoke the handler once, converting a panic into [`ArborError::HandlerPanic`].
pub(crate) async fn recover(handler: &dyn EventHandler, delivery: Delivery) -> ArborResult<()> {
    match AssertUnwindSafe(handler.handle(delivery)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(ArborError::HandlerPanic(panic_message(panic.as_ref()))),
    }
}

/// Deliver with recovery and retry, inside the message's correlation scope.
///
/// Non-retryable errors (validation failures, caught panics) are returned
/// after the first attempt. Cancelling `shutdown` abandons pending retries.
pub(crate) async fn deliver(
    policy: RetryPolicy,
    handler: &dyn EventHandler,
    mut delivery: Delivery,
    shutdown: &CancellationToken,
) -> ArborResult<()> {
    let correlation_id = delivery.correlation_id;
    let mut retries = 0;
    loop {
        delivery.attempt = retries + 1;
        let result = correlation::scope(correlation_id, recover(handler, delivery.clone())).await;
        match result {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && retries < policy.max_retries => {
                warn!(
                    event_type = %delivery.event.event_type(),
                    event_id = %delivery.event.event_id,
                    attempt = delivery.attempt,
                    error = %e,
                    "Handler failed, retrying"
                );
                retries += 1;
                tokio::select! {
                    _ = shutdown.cancelled() => return Err(e),
                    _ = tokio::time::sleep(policy.interval) => {}
                }
            }
            Err(e) => {
                error!(
                    event_type = %delivery.event.event_type(),
                    event_id = %delivery.event.event_id,
                    correlation_id = %correlation_id,
                    attempts = delivery.attempt,
                    error = %e,
                    "Handler gave up"
                );
                return Err(e);
            }
        }
    }
}
