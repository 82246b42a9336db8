//! Topic-based in-process event bus with one delivery worker per subscription.

use crate::config::BusConfig;
use crate::correlation;
use crate::event::{Event, EventType, WireEvent};
use crate::handler::{Delivery, EventHandler};
use crate::middleware::{self, RetryPolicy};
use crate::payload::EventPayload;
use arbor_core::{ArborError, ArborResult, RunId};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Well-known topic for task lifecycle events.
pub const TASK_TOPIC: &str = "tasks";

/// Identifier returned by a subscribe call.
pub type SubscriptionId = u64;

tokio::task_local! {
    static DELIVERING: SubscriptionId;
}

/// A transport message: an encoded event plus metadata.
#[derive(Debug, Clone)]
pub struct Message {
    /// Unique transport id.
    pub message_id: Uuid,
    /// Causal chain id, inherited from the handler that published it.
    pub correlation_id: Uuid,
    /// JSON wire form of the event.
    pub payload: Arc<str>,
}

impl Message {
    /// Wrap an encoded payload, inheriting the current correlation id.
    pub fn new(payload: impl Into<Arc<str>>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            correlation_id: correlation::current_or_new(),
            payload: payload.into(),
        }
    }
}

/// Which event types a subscription receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    /// Every event on the topic.
    All,
    /// Only events of one type.
    Only(EventType),
}

impl EventFilter {
    /// Whether events of `event_type` pass the filter.
    pub fn accepts(&self, event_type: EventType) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Only(t) => *t == event_type,
        }
    }
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    /// Messages accepted by `publish`.
    pub published: u64,
    /// Deliveries a handler accepted.
    pub delivered: u64,
    /// Deliveries that failed after recovery and retry.
    pub failed: u64,
    /// Messages dropped because they could not be decoded.
    pub rejected: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

struct Subscriber {
    id: SubscriptionId,
    sender: mpsc::Sender<Message>,
}

struct BusInner {
    config: BusConfig,
    topics: RwLock<HashMap<String, Vec<Subscriber>>>,
    workers: TaskTracker,
    aborts: Mutex<Vec<AbortHandle>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    next_id: AtomicU64,
    counters: Arc<Counters>,
}

/// In-process publish/subscribe bus.
///
/// Each subscription owns a bounded queue and a worker task, so a handler
/// sees the events of its topic in publish order, and a slow or failing
/// handler never stalls other subscriptions. Handler errors are retried with
/// a fixed backoff; panics are caught and reported.
///
/// The bus is cheap to clone and can be closed from any task.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus. Fails on invalid configuration.
    pub fn new(config: BusConfig) -> ArborResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(BusInner {
                config,
                topics: RwLock::new(HashMap::new()),
                workers: TaskTracker::new(),
                aborts: Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                counters: Arc::new(Counters::default()),
            }),
        })
    }

    /// Configuration the bus runs with.
    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.topics.read().get(topic).map_or(0, Vec::len)
    }

    /// Snapshot of the delivery counters.
    pub fn stats(&self) -> BusStats {
        let c = &self.inner.counters;
        BusStats {
            published: c.published.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
        }
    }

    /// Publish an event to every current subscriber of `topic`.
    ///
    /// Handing off to a subscriber is non-blocking unless that subscriber's
    /// queue is full, in which case this waits for space. Messages are never
    /// dropped to relieve pressure. A publish waiting on a full queue fails
    /// with [`ArborError::BusClosed`] once the bus is cancelled on close.
    pub async fn publish(&self, topic: &str, event: &Event) -> ArborResult<()> {
        if self.is_closed() {
            return Err(ArborError::BusClosed);
        }
        let message = Message::new(event.to_json()?);
        debug!(
            topic,
            event_type = %event.event_type(),
            event_id = %event.event_id,
            correlation_id = %message.correlation_id,
            "Publishing event"
        );
        self.publish_message(topic, message).await
    }

    /// Build an event from `payload` and publish it.
    pub async fn emit(
        &self,
        topic: &str,
        source_service: &str,
        run_id: RunId,
        payload: impl Into<EventPayload>,
    ) -> ArborResult<Event> {
        let event = Event::new(source_service, run_id, payload);
        self.publish(topic, &event).await?;
        Ok(event)
    }

    /// Publish an already-encoded message.
    ///
    /// The payload is decoded by each subscriber; one that fails to decode is
    /// logged and skipped there.
    pub async fn publish_message(&self, topic: &str, message: Message) -> ArborResult<()> {
        if self.is_closed() {
            return Err(ArborError::BusClosed);
        }
        let senders: Vec<mpsc::Sender<Message>> = self
            .inner
            .topics
            .read()
            .get(topic)
            .map(|subs| subs.iter().map(|s| s.sender.clone()).collect())
            .unwrap_or_default();
        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);

        for sender in senders {
            tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => return Err(ArborError::BusClosed),
                sent = sender.send(message.clone()) => {
                    if sent.is_err() {
                        debug!(topic, "Subscriber gone, message not queued");
                    }
                }
            }
        }
        Ok(())
    }

    /// Subscribe `handler` to events of `event_type` on `topic`.
    ///
    /// Events of other types on the same topic are skipped without invoking
    /// the handler. Must be called from within a Tokio runtime.
    pub fn subscribe<H>(
        &self,
        topic: &str,
        event_type: EventType,
        handler: H,
    ) -> ArborResult<SubscriptionId>
    where
        H: EventHandler + 'static,
    {
        self.subscribe_with(topic, EventFilter::Only(event_type), Arc::new(handler))
    }

    /// Subscribe `handler` to every event on `topic`.
    pub fn subscribe_all<H>(&self, topic: &str, handler: H) -> ArborResult<SubscriptionId>
    where
        H: EventHandler + 'static,
    {
        self.subscribe_with(topic, EventFilter::All, Arc::new(handler))
    }

    /// Subscribe a shared handler with an explicit filter.
    pub fn subscribe_with(
        &self,
        topic: &str,
        filter: EventFilter,
        handler: Arc<dyn EventHandler>,
    ) -> ArborResult<SubscriptionId> {
        if topic.is_empty() {
            return Err(ArborError::Validation("topic must not be empty".to_string()));
        }
        let runtime = Handle::try_current()
            .map_err(|_| ArborError::Bus("subscribe requires a Tokio runtime".to_string()))?;

        let (sender, receiver) = mpsc::channel(self.inner.config.buffer_capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut topics = self.inner.topics.write();
            if self.is_closed() {
                return Err(ArborError::BusClosed);
            }
            topics
                .entry(topic.to_string())
                .or_default()
                .push(Subscriber { id, sender });
        }

        let worker = SubscriberWorker {
            id,
            topic: topic.to_string(),
            filter,
            handler,
            policy: RetryPolicy {
                max_retries: self.inner.config.max_retries,
                interval: self.inner.config.retry_interval(),
            },
            shutdown: self.inner.shutdown.clone(),
            counters: self.inner.counters.clone(),
        };
        let handle = self.inner.workers.spawn_on(worker.run(receiver), &runtime);
        self.inner.aborts.lock().push(handle.abort_handle());

        info!(topic, subscription = id, filter = ?filter, "Subscribed");
        Ok(id)
    }

    /// Remove a subscription. Messages already queued for it are still handled.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut topics = self.inner.topics.write();
        let mut removed = false;
        for subs in topics.values_mut() {
            let before = subs.len();
            subs.retain(|s| s.id != id);
            removed |= subs.len() != before;
        }
        removed
    }

    /// Stop accepting publishes and subscriptions, drain queues, join workers.
    ///
    /// Queued messages get `close_timeout` to drain; after that pending
    /// retries and blocked publishes are cancelled and workers aborted.
    /// Calling again is a no-op. When called from inside a handler the drain
    /// continues in the background and this returns immediately.
    pub async fn close(&self) -> ArborResult<()> {
        {
            let mut topics = self.inner.topics.write();
            if self.inner.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            topics.clear();
        }
        self.inner.workers.close();
        info!("Closing event bus");

        let inner = self.inner.clone();
        if DELIVERING.try_with(|_| ()).is_ok() {
            tokio::spawn(async move { inner.drain().await });
            return Ok(());
        }
        inner.drain().await;
        Ok(())
    }
}

impl BusInner {
    async fn drain(&self) {
        let timeout = self.config.close_timeout();
        if tokio::time::timeout(timeout, self.workers.wait()).await.is_err() {
            warn!(
                timeout_ms = self.config.close_timeout_ms,
                "Event bus drain timed out, cancelling in-flight deliveries"
            );
            self.shutdown.cancel();
            let handles = std::mem::take(&mut *self.aborts.lock());
            for handle in handles {
                handle.abort();
            }
            self.workers.wait().await;
        }
        self.shutdown.cancel();
        info!("Event bus closed");
    }
}

struct SubscriberWorker {
    id: SubscriptionId,
    topic: String,
    filter: EventFilter,
    handler: Arc<dyn EventHandler>,
    policy: RetryPolicy,
    shutdown: CancellationToken,
    counters: Arc<Counters>,
}

impl SubscriberWorker {
    async fn run(self, mut receiver: mpsc::Receiver<Message>) {
        while let Some(message) = receiver.recv().await {
            DELIVERING.scope(self.id, self.process(message)).await;
        }
        debug!(topic = %self.topic, subscription = self.id, "Subscriber drained");
    }

    async fn process(&self, message: Message) {
        let wire: WireEvent = match serde_json::from_str(&message.payload) {
            Ok(wire) => wire,
            Err(e) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                error!(
                    topic = %self.topic,
                    message_id = %message.message_id,
                    error = %e,
                    "Dropping undecodable message"
                );
                return;
            }
        };
        if !self.filter.accepts(wire.event_type) {
            return;
        }
        let event = match Event::try_from(wire) {
            Ok(event) => event,
            Err(e) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                error!(
                    topic = %self.topic,
                    message_id = %message.message_id,
                    error = %e,
                    "Rejected event with invalid payload"
                );
                return;
            }
        };

        let delivery = Delivery {
            topic: self.topic.clone(),
            message_id: message.message_id,
            correlation_id: message.correlation_id,
            attempt: 0,
            event,
        };
        let outcome =
            middleware::deliver(self.policy, self.handler.as_ref(), delivery, &self.shutdown).await;
        let counter = match outcome {
            Ok(()) => &self.counters.delivered,
            Err(_) => &self.counters.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
