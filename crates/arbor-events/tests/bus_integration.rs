#![allow(clippy::unwrap_used, clippy::expect_used)]

use arbor_core::{ArborError, ArborResult};
use arbor_events::payload::{TaskCompleted, TaskReady, TaskStarted};
use arbor_events::{
    correlation, handler_fn, BusConfig, Delivery, Event, EventBus, EventHandler, EventType,
    TASK_TOPIC,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn fast_bus() -> EventBus {
    EventBus::new(BusConfig {
        retry_interval_ms: 1,
        close_timeout_ms: 500,
        ..BusConfig::default()
    })
    .unwrap()
}

fn ready(node_id: Uuid) -> Event {
    Event::new(
        "test",
        Uuid::nil(),
        TaskReady {
            node_id,
            root_node_id: node_id,
        },
    )
}

fn started(node_id: Uuid) -> Event {
    Event::new(
        "test",
        Uuid::nil(),
        TaskStarted {
            node_id,
            root_node_id: node_id,
            worker_id: None,
        },
    )
}

/// Forwards every delivery to a channel.
struct Collector {
    tx: mpsc::UnboundedSender<Delivery>,
}

#[async_trait]
impl EventHandler for Collector {
    async fn handle(&self, delivery: Delivery) -> ArborResult<()> {
        self.tx
            .send(delivery)
            .map_err(|e| ArborError::Handler(e.to_string()))
    }
}

fn collector() -> (Collector, mpsc::UnboundedReceiver<Delivery>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Collector { tx }, rx)
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Delivery {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("channel closed")
}

// ---------------------------------------------------------------------------
// 1. Filtering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn typed_subscription_sees_only_its_type() {
    let bus = fast_bus();
    let (handler, mut rx) = collector();
    bus.subscribe(TASK_TOPIC, EventType::TaskReady, handler)
        .unwrap();

    let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
    for id in &ids {
        bus.publish(TASK_TOPIC, &started(*id)).await.unwrap();
        bus.publish(TASK_TOPIC, &ready(*id)).await.unwrap();
    }
    bus.close().await.unwrap();

    let mut seen = Vec::new();
    while let Ok(d) = rx.try_recv() {
        assert_eq!(d.event.event_type(), EventType::TaskReady);
        seen.push(d.event.payload.node_id().unwrap());
    }
    assert_eq!(seen, ids);
}

#[tokio::test]
async fn topics_are_isolated() {
    let bus = fast_bus();
    let (handler, mut rx) = collector();
    bus.subscribe_all("audit", handler).unwrap();

    bus.publish(TASK_TOPIC, &ready(Uuid::new_v4())).await.unwrap();
    let audited = ready(Uuid::new_v4());
    bus.publish("audit", &audited).await.unwrap();

    let d = recv(&mut rx).await;
    assert_eq!(d.event.event_id, audited.event_id);
    assert_eq!(d.topic, "audit");
    bus.close().await.unwrap();
    assert!(rx.try_recv().is_err());
}

// ---------------------------------------------------------------------------
// 2. Ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delivery_preserves_publish_order_per_subscriber() {
    let bus = fast_bus();
    let (first, mut rx1) = collector();
    let (second, mut rx2) = collector();
    bus.subscribe_all(TASK_TOPIC, first).unwrap();
    bus.subscribe_all(TASK_TOPIC, second).unwrap();

    let events: Vec<Event> = (0..50).map(|_| ready(Uuid::new_v4())).collect();
    for e in &events {
        bus.publish(TASK_TOPIC, e).await.unwrap();
    }
    for e in &events {
        assert_eq!(recv(&mut rx1).await.event.event_id, e.event_id);
        assert_eq!(recv(&mut rx2).await.event.event_id, e.event_id);
    }
    bus.close().await.unwrap();
}

// ---------------------------------------------------------------------------
// 3. Retry and crash isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transient_errors_are_retried_then_delivered() {
    let bus = fast_bus();
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe(
        TASK_TOPIC,
        EventType::TaskReady,
        handler_fn(move |d: Delivery| {
            let counter = counter.clone();
            let tx = tx.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if d.attempt < 2 {
                    return Err(ArborError::Handler("flaky".into()));
                }
                tx.send(d.attempt).ok();
                Ok(())
            }
        }),
    )
    .unwrap();

    bus.publish(TASK_TOPIC, &ready(Uuid::new_v4())).await.unwrap();
    let attempt = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(attempt, 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    bus.close().await.unwrap();
}

#[tokio::test]
async fn exhausted_retries_do_not_block_other_subscribers_or_later_events() {
    let bus = fast_bus();
    let failing_calls = Arc::new(AtomicU32::new(0));
    let counter = failing_calls.clone();
    bus.subscribe_all(
        TASK_TOPIC,
        handler_fn(move |_d: Delivery| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ArborError::Handler("always down".into()))
            }
        }),
    )
    .unwrap();
    let (healthy, mut rx) = collector();
    bus.subscribe_all(TASK_TOPIC, healthy).unwrap();

    let a = ready(Uuid::new_v4());
    let b = ready(Uuid::new_v4());
    bus.publish(TASK_TOPIC, &a).await.unwrap();
    bus.publish(TASK_TOPIC, &b).await.unwrap();
    assert_eq!(recv(&mut rx).await.event.event_id, a.event_id);
    assert_eq!(recv(&mut rx).await.event.event_id, b.event_id);

    bus.close().await.unwrap();
    // 1 attempt + 3 retries per event.
    assert_eq!(failing_calls.load(Ordering::SeqCst), 8);
    assert_eq!(bus.stats().failed, 2);
}

#[tokio::test]
async fn panicking_handler_is_isolated() {
    let bus = fast_bus();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    bus.subscribe(
        TASK_TOPIC,
        EventType::TaskReady,
        handler_fn(move |_d: Delivery| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if true {
                    panic!("handler bug");
                }
                Ok::<(), ArborError>(())
            }
        }),
    )
    .unwrap();
    let (healthy, mut rx) = collector();
    bus.subscribe(TASK_TOPIC, EventType::TaskReady, healthy)
        .unwrap();

    for _ in 0..3 {
        bus.publish(TASK_TOPIC, &ready(Uuid::new_v4())).await.unwrap();
    }
    for _ in 0..3 {
        recv(&mut rx).await;
    }
    bus.close().await.unwrap();

    // The panicking subscription kept running and was invoked once per event.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(bus.stats().failed, 3);
}

// ---------------------------------------------------------------------------
// 4. Correlation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn correlation_id_follows_chained_publishes() {
    let bus = fast_bus();
    let relay_bus = bus.clone();
    bus.subscribe(
        TASK_TOPIC,
        EventType::TaskReady,
        handler_fn(move |d: Delivery| {
            let bus = relay_bus.clone();
            async move {
                let node_id = d.event.payload.node_id().unwrap_or_default();
                let next = Event::new(
                    "relay",
                    d.event.run_id,
                    TaskCompleted {
                        node_id,
                        root_node_id: node_id,
                        result: Default::default(),
                    },
                );
                bus.publish(TASK_TOPIC, &next).await
            }
        }),
    )
    .unwrap();
    let (handler, mut rx) = collector();
    bus.subscribe(TASK_TOPIC, EventType::TaskCompleted, handler)
        .unwrap();

    let origin = Uuid::new_v4();
    correlation::scope(origin, async {
        bus.publish(TASK_TOPIC, &ready(Uuid::new_v4())).await.unwrap();
    })
    .await;
    let chained = recv(&mut rx).await;
    assert_eq!(chained.correlation_id, origin);

    // A fresh publish outside any scope starts a new chain.
    bus.publish(TASK_TOPIC, &ready(Uuid::new_v4())).await.unwrap();
    let fresh = recv(&mut rx).await;
    assert_ne!(fresh.correlation_id, origin);
    bus.close().await.unwrap();
}

// ---------------------------------------------------------------------------
// 5. Shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn close_drains_queued_messages() {
    let bus = fast_bus();
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe_all(
        TASK_TOPIC,
        handler_fn(move |d: Delivery| {
            let tx = tx.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                tx.send(d.event.event_id).ok();
                Ok::<_, ArborError>(())
            }
        }),
    )
    .unwrap();
    for _ in 0..10 {
        bus.publish(TASK_TOPIC, &ready(Uuid::new_v4())).await.unwrap();
    }
    bus.close().await.unwrap();
    let mut drained = 0;
    while rx.try_recv().is_ok() {
        drained += 1;
    }
    assert_eq!(drained, 10);
}

#[tokio::test]
async fn close_cancels_stuck_handlers_after_timeout() {
    let bus = EventBus::new(BusConfig {
        close_timeout_ms: 50,
        ..BusConfig::default()
    })
    .unwrap();
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    bus.subscribe_all(
        TASK_TOPIC,
        handler_fn(move |_d: Delivery| {
            let started_tx = started_tx.clone();
            async move {
                started_tx.send(()).ok();
                std::future::pending::<()>().await;
                Ok::<_, ArborError>(())
            }
        }),
    )
    .unwrap();
    bus.publish(TASK_TOPIC, &ready(Uuid::new_v4())).await.unwrap();
    started_rx.recv().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), bus.close())
        .await
        .expect("close hung on a stuck handler")
        .unwrap();
}

#[tokio::test]
async fn close_from_inside_handler_does_not_deadlock() {
    let bus = fast_bus();
    let closer = bus.clone();
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe_all(
        TASK_TOPIC,
        handler_fn(move |_d: Delivery| {
            let closer = closer.clone();
            let tx = tx.clone();
            async move {
                closer.close().await?;
                tx.send(closer.is_closed()).ok();
                Ok::<_, ArborError>(())
            }
        }),
    )
    .unwrap();
    bus.publish(TASK_TOPIC, &ready(Uuid::new_v4())).await.unwrap();
    let closed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(closed);
    assert!(matches!(
        bus.publish(TASK_TOPIC, &ready(Uuid::new_v4())).await,
        Err(ArborError::BusClosed)
    ));
}

#[tokio::test]
async fn blocked_publisher_is_released_by_close() {
    let bus = EventBus::new(BusConfig {
        buffer_capacity: 1,
        close_timeout_ms: 50,
        ..BusConfig::default()
    })
    .unwrap();
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    bus.subscribe_all(
        TASK_TOPIC,
        handler_fn(move |_d: Delivery| {
            let started_tx = started_tx.clone();
            async move {
                started_tx.send(()).ok();
                std::future::pending::<()>().await;
                Ok::<_, ArborError>(())
            }
        }),
    )
    .unwrap();

    // First message occupies the handler, second fills the queue.
    bus.publish(TASK_TOPIC, &ready(Uuid::new_v4())).await.unwrap();
    started_rx.recv().await.unwrap();
    bus.publish(TASK_TOPIC, &ready(Uuid::new_v4())).await.unwrap();

    let publisher = bus.clone();
    let blocked = tokio::spawn(async move {
        publisher
            .publish(TASK_TOPIC, &ready(Uuid::new_v4()))
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!blocked.is_finished());

    bus.close().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), blocked)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(ArborError::BusClosed)));
}

#[tokio::test]
async fn close_is_callable_from_another_task() {
    let bus = fast_bus();
    let (handler, _rx) = collector();
    bus.subscribe_all(TASK_TOPIC, handler).unwrap();
    let remote = bus.clone();
    tokio::spawn(async move { remote.close().await })
        .await
        .unwrap()
        .unwrap();
    assert!(bus.is_closed());
    bus.close().await.unwrap();
}
