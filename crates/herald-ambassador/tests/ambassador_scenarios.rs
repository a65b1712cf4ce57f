//! ---
//! herald_section: "04-publishing-resilience"
//! herald_subsection: "module"
//! herald_type: "source"
//! herald_scope: "code"
//! herald_description: "Circuit breaker, failed-message queue, and publishing facade."
//! herald_version: "v0.0.0-prealpha"
//! herald_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use herald_ambassador::{Ambassador, AmbassadorError, OperationEvent, OperationKind};
use herald_broker::InMemoryBroker;
use herald_common::config::{AmbassadorConfig, BrokerConfig, BrokerKind, OverflowPolicy};
use herald_metrics::{new_registry, prometheus::Registry, AmbassadorMetrics};
use tokio::time::{sleep, Instant};

const RESET: Duration = Duration::from_secs(60);

fn config(threshold: u32) -> AmbassadorConfig {
    AmbassadorConfig {
        failure_threshold: threshold,
        reset_timeout: RESET,
        broker: BrokerConfig {
            kind: BrokerKind::Memory,
            ..BrokerConfig::default()
        },
        ..AmbassadorConfig::default()
    }
}

fn queued_payloads(ambassador: &Ambassador) -> Vec<String> {
    ambassador
        .queued()
        .into_iter()
        .map(|message| String::from_utf8_lossy(&message.payload).into_owned())
        .collect()
}

async fn connected(broker: &InMemoryBroker, config: AmbassadorConfig) -> Ambassador {
    let ambassador = Ambassador::new(config, Arc::new(broker.connector())).unwrap();
    assert!(ambassador.wait_until_ready(Duration::from_secs(1)).await);
    ambassador
}

fn transitions(registry: &Registry, state: &str) -> f64 {
    registry
        .gather()
        .iter()
        .find(|family| family.get_name() == "herald_circuit_transitions_total")
        .and_then(|family| {
            family.get_metric().iter().find(|metric| {
                metric
                    .get_label()
                    .iter()
                    .any(|label| label.get_name() == "state" && label.get_value() == state)
            })
        })
        .map(|metric| metric.get_counter().get_value())
        .unwrap_or(0.0)
}

#[tokio::test(start_paused = true)]
async fn threshold_failures_open_then_reset_drains() {
    let broker = InMemoryBroker::new();
    let ambassador = connected(&broker, config(3)).await;
    broker.set_rejecting(true);

    for (n, text) in ["m1", "m2", "m3"].into_iter().enumerate() {
        assert!(!ambassador.breaker().is_open(), "opened before failure {}", n + 1);
        let err = ambassador.publish(text).await.unwrap_err();
        assert!(matches!(err, AmbassadorError::Publish { .. }));
    }
    assert!(ambassador.breaker().is_open());
    let metrics = ambassador.metrics();
    assert_eq!(metrics.failed_count, 3);
    assert_eq!(metrics.failed_queue_length, 3);
    assert!(metrics.circuit_open);

    // nothing reaches the broker while open
    let attempts = broker.attempts();
    assert!(matches!(
        ambassador.publish("m4").await,
        Err(AmbassadorError::CircuitOpen)
    ));
    assert_eq!(broker.attempts(), attempts);

    broker.set_rejecting(false);
    sleep(RESET + Duration::from_millis(1)).await;

    assert!(!ambassador.breaker().is_open());
    let metrics = ambassador.metrics();
    assert_eq!(metrics.failed_queue_length, 0);
    assert_eq!(metrics.redelivered_count, 4);
    assert_eq!(broker.payloads_on("log_channel"), vec!["m1", "m2", "m3", "m4"]);
}

#[tokio::test(start_paused = true)]
async fn circuit_closes_exactly_once_per_episode() {
    let broker = InMemoryBroker::new();
    let registry = new_registry();
    let exporter = AmbassadorMetrics::new(registry.clone()).unwrap();
    let ambassador =
        Ambassador::with_exporter(config(2), Arc::new(broker.connector()), exporter).unwrap();
    assert!(ambassador.wait_until_ready(Duration::from_secs(1)).await);
    broker.set_rejecting(true);

    let _ = ambassador.publish("a").await;
    let _ = ambassador.publish("b").await;
    assert!(ambassador.breaker().is_open());

    // keep hammering during the open window
    for _ in 0..10 {
        sleep(Duration::from_secs(5)).await;
        let _ = ambassador.publish("c").await;
    }
    sleep(RESET).await;

    assert_eq!(transitions(&registry, "open"), 1.0);
    assert_eq!(transitions(&registry, "closed"), 1.0);
    assert_eq!(ambassador.breaker().episode(), 1);
}

#[tokio::test(start_paused = true)]
async fn healthy_publishes_arrive_in_order() {
    let broker = InMemoryBroker::new();
    broker.set_subscribers("log_channel", 2);
    let ambassador = connected(&broker, AmbassadorConfig::default()).await;

    for n in 1..=5 {
        let receivers = ambassador.publish(format!("event-{n}")).await.unwrap();
        assert_eq!(receivers, 2);
    }

    let metrics = ambassador.metrics();
    assert_eq!(metrics.published_count, 5);
    assert_eq!(metrics.failed_count, 0);
    assert_eq!(metrics.failed_queue_length, 0);
    assert_eq!(
        broker.payloads_on("log_channel"),
        vec!["event-1", "event-2", "event-3", "event-4", "event-5"]
    );
}

#[tokio::test(start_paused = true)]
async fn unreachable_broker_times_out_after_grace() {
    let broker = InMemoryBroker::new();
    broker.set_reachable(false);
    let ambassador = Ambassador::new(config(5), Arc::new(broker.connector())).unwrap();

    let started = Instant::now();
    let err = ambassador.publish("lost?").await.unwrap_err();
    assert_eq!(started.elapsed(), Duration::from_secs(5));
    assert!(matches!(err, AmbassadorError::Connection { .. }));

    let metrics = ambassador.metrics();
    assert_eq!(metrics.failed_count, 1);
    assert_eq!(metrics.failed_queue_length, 1);
    assert_eq!(ambassador.breaker().consecutive_failures(), 1);
    assert!(broker.deliveries().is_empty());
}

#[tokio::test(start_paused = true)]
async fn metrics_reads_are_idempotent() {
    let broker = InMemoryBroker::new();
    let ambassador = connected(&broker, AmbassadorConfig::default()).await;
    ambassador.publish("x").await.unwrap();
    let first = ambassador.metrics();
    let second = ambassador.metrics();
    assert_eq!(first, second);
}

#[tokio::test(start_paused = true)]
async fn average_latency_is_exact() {
    let broker = InMemoryBroker::new();
    let ambassador = connected(&broker, AmbassadorConfig::default()).await;
    assert_eq!(ambassador.metrics().avg_latency_ms, 0.0);

    broker.set_latency(Duration::from_millis(10));
    ambassador.publish("a").await.unwrap();
    broker.set_latency(Duration::from_millis(30));
    ambassador.publish("b").await.unwrap();

    assert_eq!(ambassador.metrics().avg_latency_ms, 20.0);
}

#[tokio::test(start_paused = true)]
async fn bounded_queue_counts_drops() {
    let broker = InMemoryBroker::new();
    let config = AmbassadorConfig {
        queue_capacity: 2,
        overflow: OverflowPolicy::DropNewest,
        ..config(1)
    };
    let ambassador = connected(&broker, config).await;
    broker.set_rejecting(true);

    for text in ["a", "b", "c", "d"] {
        let _ = ambassador.publish(text).await;
    }
    let metrics = ambassador.metrics();
    assert_eq!(metrics.failed_queue_length, 2);
    assert_eq!(metrics.dropped_count, 2);
    assert_eq!(queued_payloads(&ambassador), vec!["a", "b"]);
}

#[tokio::test(start_paused = true)]
async fn configuration_update_keeps_queued_messages() {
    let broker = InMemoryBroker::new();
    let ambassador = connected(&broker, config(10)).await;
    broker.set_rejecting(true);
    let _ = ambassador.publish("queued-1").await;
    let _ = ambassador.publish("queued-2").await;
    assert_eq!(broker.connections(), 1);

    let updated = AmbassadorConfig {
        channel: "audit".into(),
        ..config(10)
    };
    ambassador.update_configuration(updated).await.unwrap();
    assert_eq!(broker.connections(), 2);
    assert_eq!(ambassador.default_channel(), "audit");
    assert_eq!(ambassador.metrics().failed_queue_length, 2);

    broker.set_rejecting(false);
    assert!(ambassador.wait_until_ready(Duration::from_secs(1)).await);
    ambassador.publish("fresh").await.unwrap();
    sleep(Duration::from_millis(1)).await;

    assert_eq!(broker.payloads_on("audit"), vec!["fresh"]);
    assert_eq!(broker.payloads_on("log_channel"), vec!["queued-1", "queued-2"]);
    assert_eq!(ambassador.metrics().failed_queue_length, 0);
}

#[tokio::test(start_paused = true)]
async fn invalid_configuration_is_rejected() {
    let broker = InMemoryBroker::new();
    let ambassador = connected(&broker, AmbassadorConfig::default()).await;
    let broken = AmbassadorConfig {
        failure_threshold: 0,
        ..AmbassadorConfig::default()
    };
    assert!(ambassador.update_configuration(broken).await.is_err());
    assert_eq!(broker.connections(), 1);
}

#[tokio::test(start_paused = true)]
async fn broker_kind_is_fixed_after_startup() {
    let broker = InMemoryBroker::new();
    let ambassador = connected(&broker, config(3)).await;
    let mut switched = config(3);
    switched.broker.kind = BrokerKind::Redis;

    let err = ambassador.update_configuration(switched).await.unwrap_err();
    assert!(err.to_string().contains("broker kind"), "{err}");
    assert_eq!(broker.connections(), 1);
    assert_eq!(ambassador.connection_state(), herald_broker::ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn latency_includes_wait_for_connection() {
    let broker = InMemoryBroker::new();
    broker.set_reachable(false);
    let ambassador = Ambassador::new(config(3), Arc::new(broker.connector())).unwrap();

    let switch = broker.clone();
    tokio::spawn(async move {
        sleep(Duration::from_secs(1)).await;
        switch.set_reachable(true);
    });
    ambassador.publish("late").await.unwrap();

    let metrics = ambassador.metrics();
    assert_eq!(metrics.published_count, 1);
    assert_eq!(metrics.avg_latency_ms, 1000.0);
}

#[tokio::test(start_paused = true)]
async fn drain_failures_are_requeued_silently() {
    let broker = InMemoryBroker::new();
    let ambassador = connected(&broker, config(5)).await;

    broker.set_rejecting(true);
    assert!(ambassador.publish("a").await.is_err());
    assert_eq!(ambassador.breaker().consecutive_failures(), 1);

    broker.set_rejecting(false);
    ambassador.publish("b").await.unwrap();
    // the drain spawned by the success runs against a rejecting broker
    broker.set_rejecting(true);
    sleep(Duration::from_millis(1)).await;

    assert_eq!(broker.attempts(), 3);
    assert_eq!(queued_payloads(&ambassador), vec!["a"]);
    assert_eq!(ambassador.breaker().consecutive_failures(), 0);
    assert!(!ambassador.breaker().is_open());
    assert_eq!(ambassador.metrics().failed_count, 1);

    assert!(ambassador.publish("c").await.is_err());
    assert_eq!(queued_payloads(&ambassador), vec!["a", "c"]);
    assert_eq!(ambassador.breaker().consecutive_failures(), 1);
    assert!(!ambassador.breaker().is_open());
}

#[tokio::test(start_paused = true)]
async fn connection_loss_mid_drain_keeps_remaining_order() {
    let broker = InMemoryBroker::new();
    let ambassador = connected(&broker, config(10)).await;

    broker.set_rejecting(true);
    for text in ["q1", "q2", "q3"] {
        assert!(ambassador.publish(text).await.is_err());
    }
    broker.set_rejecting(false);
    broker.set_latency(Duration::from_millis(100));

    // t=100ms: "live" lands and the drain starts on q1
    ambassador.publish("live").await.unwrap();
    sleep(Duration::from_millis(50)).await;
    broker.set_reachable(false);
    sleep(Duration::from_millis(200)).await;

    assert_eq!(broker.payloads_on("log_channel"), vec!["live", "q1"]);
    assert_eq!(queued_payloads(&ambassador), vec!["q2", "q3"]);
    let metrics = ambassador.metrics();
    assert_eq!(metrics.redelivered_count, 1);
    assert_eq!(metrics.failed_count, 3);
    assert!(!metrics.circuit_open);

    broker.set_reachable(true);
    assert!(ambassador.wait_until_ready(Duration::from_secs(1)).await);
    ambassador.flush().await;
    assert_eq!(
        broker.payloads_on("log_channel"),
        vec!["live", "q1", "q2", "q3"]
    );
    assert_eq!(ambassador.metrics().failed_queue_length, 0);
}

#[tokio::test(start_paused = true)]
async fn manual_reconnect_closes_circuit_early() {
    let broker = InMemoryBroker::new();
    let registry = new_registry();
    let exporter = AmbassadorMetrics::new(registry.clone()).unwrap();
    let ambassador =
        Ambassador::with_exporter(config(1), Arc::new(broker.connector()), exporter).unwrap();
    assert!(ambassador.wait_until_ready(Duration::from_secs(1)).await);

    broker.set_rejecting(true);
    let _ = ambassador.publish("pending").await;
    assert!(ambassador.breaker().is_open());

    broker.set_rejecting(false);
    ambassador.reconnect().await.unwrap();
    assert!(!ambassador.breaker().is_open());
    sleep(Duration::from_millis(1)).await;
    assert_eq!(broker.payloads_on("log_channel"), vec!["pending"]);

    // the cancelled timer must not produce a second close
    sleep(RESET * 2).await;
    assert_eq!(transitions(&registry, "closed"), 1.0);
    assert_eq!(ambassador.breaker().episode(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_failures_open_once() {
    let broker = InMemoryBroker::new();
    let ambassador = connected(&broker, config(3)).await;
    broker.set_rejecting(true);

    let calls: Vec<_> = (0..32)
        .map(|n| {
            let ambassador = ambassador.clone();
            tokio::spawn(async move { ambassador.publish(format!("m{n}")).await })
        })
        .collect();
    for call in calls {
        assert!(call.await.unwrap().is_err());
    }

    assert_eq!(ambassador.breaker().episode(), 1);
    let metrics = ambassador.metrics();
    assert_eq!(metrics.failed_queue_length, 32);
    assert_eq!(metrics.failed_count + metrics.short_circuited_count, 32);
    assert!(metrics.failed_count >= 3);
}

#[tokio::test(start_paused = true)]
async fn operation_events_never_fail_the_caller() {
    let broker = InMemoryBroker::new();
    let ambassador = connected(&broker, config(1)).await;

    let event = OperationEvent::new(OperationKind::Create, "johnd", 1).with_trace_id("t-1");
    ambassador.publish_event(&event).await;
    let delivered = broker.payloads_on("log_channel");
    assert_eq!(delivered.len(), 1);
    let json: serde_json::Value = serde_json::from_str(&delivered[0]).unwrap();
    assert_eq!(json["operationName"], "CREATE");
    assert_eq!(json["traceId"], "t-1");

    broker.set_rejecting(true);
    let event = OperationEvent::new(OperationKind::Delete, "johnd", 1);
    ambassador.publish_event(&event).await;
    ambassador.publish_event(&event).await;
    assert_eq!(ambassador.metrics().failed_queue_length, 2);
}
