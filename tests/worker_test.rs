//! End-to-end tests for the ingestion loop and worker lifecycle using
//! the in-memory transport.

mod common;

use async_trait::async_trait;
use common::{CallLog, Gate, Overlap, Picky, Recording, pipeline, wait_until};
use notification_processor::command::CreateIncident;
use notification_processor::engine::{Phase, Worker, WorkerConfig};
use notification_processor::error::Error;
use notification_processor::handler::HandlerRegistry;
use notification_processor::handler::builtin::default_registry;
use notification_processor::transport::memory::TransportEvent;
use notification_processor::transport::{
    Delivery, FlowControl, InMemoryTransport, Message, Settle, Subscription, Transport,
    TransportError,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

fn config(max_messages: usize) -> WorkerConfig {
    WorkerConfig {
        max_messages,
        drain_timeout: Duration::from_secs(5),
    }
}

fn settled(transport: &InMemoryTransport) -> usize {
    transport.acknowledged().len() + transport.rejected().len()
}

// ---------------------------------------------------------------------------
// Dispositions
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn valid_incident_is_acknowledged() {
    let transport = InMemoryTransport::new();
    let id = transport.publish_json(&json!({"description": "disk full"}));

    let worker = Worker::new(transport.clone(), pipeline(default_registry()), config(4));
    let shutdown = worker.shutdown_handle();
    let run = tokio::spawn(worker.run());

    wait_until(|| settled(&transport) == 1).await;
    shutdown.shutdown();
    let report = run.await.unwrap().unwrap();

    assert_eq!(transport.acknowledged(), vec![id]);
    assert!(transport.rejected().is_empty());
    assert_eq!(report.acknowledged, 1);
    assert_eq!(report.rejected, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_incident_is_rejected_without_dispatch() {
    let log = CallLog::default();
    let registry = HandlerRegistry::builder()
        .register::<CreateIncident, _>(Recording::ok("h1", &log))
        .build();
    let transport = InMemoryTransport::new();
    let id = transport.publish_json(&json!({"description": ""}));

    let worker = Worker::new(transport.clone(), pipeline(registry), config(4));
    let shutdown = worker.shutdown_handle();
    let run = tokio::spawn(worker.run());

    wait_until(|| settled(&transport) == 1).await;
    shutdown.shutdown();
    run.await.unwrap().unwrap();

    let rejected = transport.rejected();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].0, id);
    assert!(rejected[0].1.contains("description cannot be empty"));
    assert!(log.calls().is_empty(), "dispatcher must not run");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn undecodable_payload_is_rejected_without_dispatch() {
    let log = CallLog::default();
    let registry = HandlerRegistry::builder()
        .register::<CreateIncident, _>(Recording::ok("h1", &log))
        .build();
    let transport = InMemoryTransport::new();
    transport.publish(vec![0xff, 0x00]);

    let worker = Worker::new(transport.clone(), pipeline(registry), config(4));
    let shutdown = worker.shutdown_handle();
    let run = tokio::spawn(worker.run());

    wait_until(|| settled(&transport) == 1).await;
    shutdown.shutdown();
    run.await.unwrap().unwrap();

    assert_eq!(transport.rejected().len(), 1);
    assert!(log.calls().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unregistered_kind_is_rejected() {
    let log = CallLog::default();
    let registry = HandlerRegistry::builder()
        .register::<CreateIncident, _>(Recording::ok("h1", &log))
        .build();
    let transport = InMemoryTransport::new();
    transport.publish_json(&json!({"command": "ping"}));

    let worker = Worker::new(transport.clone(), pipeline(registry), config(4));
    let shutdown = worker.shutdown_handle();
    let run = tokio::spawn(worker.run());

    wait_until(|| settled(&transport) == 1).await;
    shutdown.shutdown();
    run.await.unwrap().unwrap();

    let rejected = transport.rejected();
    assert!(rejected[0].1.contains("no handlers registered"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_delivery_settles_exactly_once() {
    let registry = HandlerRegistry::builder()
        .register::<CreateIncident, _>(Picky)
        .build();
    let transport = InMemoryTransport::new();
    let mut published = Vec::new();
    for i in 0..30 {
        let payload = match i % 5 {
            0 => json!({"description": "fail"}),
            1 => json!({"description": ""}),
            2 => json!({"command": "ResolveIncident"}),
            3 => json!({"description": "panic"}),
            _ => json!({"description": format!("incident {i}")}),
        };
        published.push(transport.publish_json(&payload));
    }

    let worker = Worker::new(transport.clone(), pipeline(registry), config(5));
    let shutdown = worker.shutdown_handle();
    let run = tokio::spawn(worker.run());

    wait_until(|| settled(&transport) == published.len()).await;
    shutdown.shutdown();
    let report = run.await.unwrap().unwrap();

    let mut dispositions: HashMap<String, usize> = HashMap::new();
    for event in transport.events() {
        match event {
            TransportEvent::Acknowledged { id } | TransportEvent::Rejected { id, .. } => {
                *dispositions.entry(id).or_default() += 1;
            }
            _ => {}
        }
    }
    for id in &published {
        assert_eq!(dispositions.get(id), Some(&1), "{id} settled more or less than once");
    }
    assert_eq!(report.acknowledged, 6);
    assert_eq!(report.rejected, 24);
    assert_eq!(report.settled(), 30);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_handler_rejects_its_delivery_only() {
    let registry = HandlerRegistry::builder()
        .register::<CreateIncident, _>(Picky)
        .build();
    let transport = InMemoryTransport::new();
    let bad = transport.publish_json(&json!({"description": "panic"}));
    let good = transport.publish_json(&json!({"description": "fine"}));

    let worker = Worker::new(transport.clone(), pipeline(registry), config(2));
    let shutdown = worker.shutdown_handle();
    let run = tokio::spawn(worker.run());

    wait_until(|| settled(&transport) == 2).await;
    shutdown.shutdown();
    run.await.unwrap().unwrap();

    assert_eq!(transport.acknowledged(), vec![good]);
    let rejected = transport.rejected();
    assert_eq!(rejected[0].0, bad);
    assert!(rejected[0].1.contains("panicked"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_message_is_redelivered() {
    let log = CallLog::default();
    let registry = HandlerRegistry::builder()
        .register::<CreateIncident, _>(Picky)
        .register::<CreateIncident, _>(Recording::ok("after", &log))
        .build();
    let transport = InMemoryTransport::with_redelivery();
    let id = transport.publish_json(&json!({"description": "fail"}));

    let worker = Worker::new(transport.clone(), pipeline(registry), config(1));
    let shutdown = worker.shutdown_handle();
    let run = tokio::spawn(worker.run());

    wait_until(|| transport.rejected().len() >= 3).await;
    shutdown.shutdown();
    run.await.unwrap().unwrap();

    let attempts: Vec<u32> = transport
        .events()
        .into_iter()
        .filter_map(|e| match e {
            TransportEvent::Leased { id: leased, attempt } if leased == id => Some(attempt),
            _ => None,
        })
        .take(3)
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert!(log.calls().is_empty(), "fail-fast must skip later handlers");
}

// ---------------------------------------------------------------------------
// Flow control
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_never_exceeds_max_messages() {
    let overlap = Overlap::new(Duration::from_millis(20));
    let registry = HandlerRegistry::builder()
        .register::<CreateIncident, _>(overlap.clone())
        .build();
    let transport = InMemoryTransport::new();
    for i in 0..20 {
        transport.publish_json(&json!({"description": format!("incident {i}")}));
    }

    let worker = Worker::new(transport.clone(), pipeline(registry), config(3));
    let shutdown = worker.shutdown_handle();
    let run = tokio::spawn(worker.run());

    wait_until(|| transport.acknowledged().len() == 20).await;
    shutdown.shutdown();
    run.await.unwrap().unwrap();

    assert!(overlap.peak() >= 1);
    assert!(overlap.peak() <= 3, "handlers overlapped {} times", overlap.peak());
    assert!(
        transport.peak_in_flight() <= 3,
        "{} deliveries were unresolved at once",
        transport.peak_in_flight()
    );
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn phases_advance_in_order() {
    let transport = InMemoryTransport::new();
    let worker = Worker::new(transport.clone(), pipeline(default_registry()), config(2));
    assert_eq!(worker.phase(), Phase::Idle);

    let mut phases = worker.watch_phase();
    let shutdown = worker.shutdown_handle();
    let run = tokio::spawn(worker.run());

    phases.wait_for(|p| *p == Phase::Running).await.unwrap();
    shutdown.shutdown();
    run.await.unwrap().unwrap();

    assert_eq!(*phases.borrow(), Phase::Stopped);
    assert!(transport.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_before_run_stops_immediately() {
    let transport = InMemoryTransport::new();
    transport.publish_json(&json!({"description": "never read"}));
    let worker = Worker::new(transport.clone(), pipeline(default_registry()), config(2));
    worker.shutdown_handle().shutdown();

    let report = worker.run().await.unwrap();

    assert_eq!(report.acknowledged, 0);
    assert!(transport.is_closed());
    assert!(transport.acknowledged().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn drain_waits_for_in_flight_delivery() {
    let gate = Gate::default();
    let registry = HandlerRegistry::builder()
        .register::<CreateIncident, _>(gate.clone())
        .build();
    let transport = InMemoryTransport::new();
    let id = transport.publish_json(&json!({"description": "slow"}));

    let worker = Worker::new(transport.clone(), pipeline(registry), config(2));
    let mut phases = worker.watch_phase();
    let shutdown = worker.shutdown_handle();
    let run = tokio::spawn(worker.run());

    gate.entered.notified().await;
    shutdown.shutdown();
    phases.wait_for(|p| *p == Phase::Draining).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!transport.is_closed(), "transport closed before the delivery settled");

    gate.release.notify_one();
    let report = run.await.unwrap().unwrap();

    assert_eq!(report.acknowledged, 1);
    assert_eq!(report.abandoned, 0);
    let events = transport.events();
    let acked_at = events
        .iter()
        .position(|e| *e == TransportEvent::Acknowledged { id: id.clone() })
        .expect("delivery acknowledged");
    let closed_at = events
        .iter()
        .position(|e| *e == TransportEvent::Closed)
        .expect("transport closed");
    assert!(acked_at < closed_at);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn drain_timeout_abandons_stuck_delivery() {
    let gate = Gate::default();
    let registry = HandlerRegistry::builder()
        .register::<CreateIncident, _>(gate.clone())
        .build();
    let transport = InMemoryTransport::new();
    transport.publish_json(&json!({"description": "stuck"}));

    let worker = Worker::new(
        transport.clone(),
        pipeline(registry),
        WorkerConfig {
            max_messages: 2,
            drain_timeout: Duration::from_millis(100),
        },
    );
    let shutdown = worker.shutdown_handle();
    let run = tokio::spawn(worker.run());

    gate.entered.notified().await;
    shutdown.shutdown();
    let report = run.await.unwrap().unwrap();

    assert_eq!(report.abandoned, 1);
    assert!(transport.is_closed());
    assert!(transport.acknowledged().is_empty());

    // An abandoned handler is stopped with its delivery, so opening the
    // gate afterwards must not let it complete.
    gate.release.notify_one();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!gate.finished(), "abandoned handler kept running after stop");
}

#[tokio::test]
async fn zero_max_messages_is_refused() {
    let worker = Worker::new(
        InMemoryTransport::new(),
        pipeline(default_registry()),
        config(0),
    );
    assert!(worker.run().await.is_err());
}

#[tokio::test]
async fn subscribing_to_closed_transport_fails() {
    let transport = InMemoryTransport::new();
    transport.close().await.unwrap();
    let worker = Worker::new(transport, pipeline(default_registry()), config(1));

    assert!(worker.run().await.is_err());
}

// ---------------------------------------------------------------------------
// Scripted transport
// ---------------------------------------------------------------------------

enum Step {
    Deliver(Value),
    Fail(&'static str),
}

/// Plays a fixed sequence of deliveries and errors, then keeps the feed
/// open until the subscription is cancelled.
#[derive(Clone, Default)]
struct Scripted {
    script: Arc<Mutex<Vec<Step>>>,
    /// `(id, None)` for an acknowledge, `(id, Some(reason))` for a reject.
    settled: Arc<Mutex<Vec<(String, Option<String>)>>>,
    fed: Arc<Notify>,
    closed: Arc<AtomicBool>,
}

impl Scripted {
    fn new(script: Vec<Step>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
            ..Self::default()
        }
    }

    fn settled(&self) -> Vec<(String, Option<String>)> {
        self.settled.lock().unwrap().clone()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct ScriptedSettle {
    id: String,
    settled: Arc<Mutex<Vec<(String, Option<String>)>>>,
}

#[async_trait]
impl Settle for ScriptedSettle {
    async fn acknowledge(self: Box<Self>) -> Result<(), TransportError> {
        self.settled.lock().unwrap().push((self.id, None));
        Ok(())
    }

    async fn reject(self: Box<Self>, reason: &str) -> Result<(), TransportError> {
        self.settled
            .lock()
            .unwrap()
            .push((self.id, Some(reason.to_string())));
        Ok(())
    }
}

#[async_trait]
impl Transport for Scripted {
    async fn subscribe(&self, _max_in_flight: usize) -> Result<Subscription, TransportError> {
        let steps: Vec<Step> = std::mem::take(&mut *self.script.lock().unwrap());
        let (feed, subscription) = Subscription::channel(CancellationToken::new());
        let flow = FlowControl::new(steps.len().max(1));
        let settled = Arc::clone(&self.settled);
        let fed = Arc::clone(&self.fed);

        tokio::spawn(async move {
            for (n, step) in steps.into_iter().enumerate() {
                let item = match step {
                    Step::Deliver(payload) => {
                        let id = format!("msg-{}", n + 1);
                        let credit = flow.acquire().await.unwrap();
                        let settle = Box::new(ScriptedSettle {
                            id: id.clone(),
                            settled: Arc::clone(&settled),
                        });
                        Ok(Delivery::new(
                            Message::new(id, payload.to_string()),
                            settle,
                            credit,
                        ))
                    }
                    Step::Fail(reason) => Err(TransportError::Other(reason.to_string())),
                };
                if feed.deliveries.send(item).await.is_err() {
                    return;
                }
            }
            fed.notify_one();
            feed.cancel.cancelled().await;
        });

        Ok(subscription)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Transport failure and shutdown leftovers
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transport_failure_drains_closes_and_returns_error() {
    let transport = Scripted::new(vec![
        Step::Deliver(json!({"description": "before the failure"})),
        Step::Fail("boom"),
    ]);

    let worker = Worker::new(transport.clone(), pipeline(default_registry()), config(4));
    let phases = worker.watch_phase();
    let result = worker.run().await;

    match result {
        Err(Error::Transport(TransportError::Other(reason))) => assert_eq!(reason, "boom"),
        other => panic!("expected the transport error, got {other:?}"),
    }
    assert_eq!(*phases.borrow(), Phase::Stopped);
    assert!(transport.is_closed());
    // The delivery taken before the failure still settles during drain.
    assert_eq!(transport.settled(), vec![("msg-1".to_string(), None)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn leased_but_unprocessed_delivery_is_rejected_at_shutdown() {
    let gate = Gate::default();
    let registry = HandlerRegistry::builder()
        .register::<CreateIncident, _>(gate.clone())
        .build();
    let transport = Scripted::new(vec![
        Step::Deliver(json!({"description": "in flight"})),
        Step::Deliver(json!({"description": "waiting"})),
    ]);

    let worker = Worker::new(transport.clone(), pipeline(registry), config(1));
    let mut phases = worker.watch_phase();
    let shutdown = worker.shutdown_handle();
    let run = tokio::spawn(worker.run());

    // The first delivery holds the only worker slot; the second is leased
    // and parked on the subscription.
    gate.entered.notified().await;
    transport.fed.notified().await;
    shutdown.shutdown();
    phases.wait_for(|p| *p == Phase::Draining).await.unwrap();
    gate.release.notify_one();
    let report = run.await.unwrap().unwrap();

    assert_eq!(report.acknowledged, 1);
    assert_eq!(report.rejected, 1);
    let settled = transport.settled();
    assert!(settled.contains(&("msg-1".to_string(), None)));
    assert!(settled.contains(&(
        "msg-2".to_string(),
        Some("worker is shutting down".to_string())
    )));
    assert!(transport.is_closed());
}
