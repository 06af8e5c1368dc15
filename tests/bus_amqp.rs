//! AMQP/RabbitMQ backend integration tests using testcontainers.
//!
//! Run with: cargo test --test bus_amqp --features amqp -- --nocapture
//!
//! These tests spin up RabbitMQ in a container using testcontainers-rs.
//! No manual RabbitMQ setup required.

#![cfg(feature = "amqp")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eventwire::bus::{AmqpConnector, BusError, Connector, Locator};
use eventwire::config::{BrokerConfig, BrokerType, SubscriberConfig};
use eventwire::connection::{ConnectionManager, ConnectionSettings};
use eventwire::envelope::Envelope;
use eventwire::publisher::{DeliveryOutcome, Publisher, PublisherSettings};
use eventwire::routing::{
    DestinationFilter, ExchangeKind, FallbackConfig, FallbackStrategy, RoutingConfig,
    RoutingPolicy,
};
use eventwire::subscriber::{handler_fn, EnvelopeHandler, Subscriber, SubscriberSettings};
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};
use tokio::sync::mpsc;

/// Start RabbitMQ container.
///
/// Returns (container, broker config) pointing at the mapped AMQP port.
async fn start_rabbitmq() -> (testcontainers::ContainerAsync<GenericImage>, BrokerConfig) {
    let image = GenericImage::new("rabbitmq", "3-management")
        .with_exposed_port(5672.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Server startup complete"));

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start rabbitmq container");

    // Brief delay to ensure RabbitMQ is fully ready
    tokio::time::sleep(Duration::from_secs(2)).await;

    let port = container
        .get_host_port_ipv4(5672)
        .await
        .expect("Failed to get mapped port");
    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let broker = BrokerConfig {
        broker_type: BrokerType::Amqp,
        host: host.to_string(),
        port: Some(port),
        ..Default::default()
    };
    println!("RabbitMQ available at: {}", broker.address());

    (container, broker)
}

async fn connect(broker: &BrokerConfig) -> Arc<ConnectionManager> {
    let connector = AmqpConnector::new(broker.clone(), SubscriberConfig::default());
    let manager = ConnectionManager::new(Arc::new(connector), ConnectionSettings::from(broker));
    manager.connect().await.expect("Failed to connect");
    manager
}

fn exchange_routing(exchange: &str) -> RoutingPolicy {
    RoutingPolicy::from_config(&RoutingConfig {
        rules: Vec::new(),
        fallback: FallbackConfig {
            strategy: FallbackStrategy::TypeAsRoutingKey,
            exchange: exchange.to_string(),
            kind: ExchangeKind::Topic,
            ..Default::default()
        },
    })
    .unwrap()
}

fn order(id: i64, event_type: &str) -> Envelope {
    Envelope::builder(format!("{{\"order-id\":{}}}", id), event_type)
        .key(id.to_string())
        .header("tenant", "acme")
        .build()
        .unwrap()
}

/// Handler that counts received envelopes and forwards them to a channel.
fn counting() -> (
    Arc<dyn EnvelopeHandler>,
    Arc<AtomicUsize>,
    mpsc::Receiver<Arc<Envelope>>,
) {
    let count = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel(100);
    let counter = count.clone();
    let handler = handler_fn(move |envelope| {
        let count = counter.clone();
        let tx = tx.clone();
        async move {
            count.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(envelope).await;
            Ok(())
        }
    });
    (handler, count, rx)
}

#[tokio::test]
async fn test_publish_and_consume() {
    println!("=== AMQP Publish and Consume Test ===");
    let (_container, broker) = start_rabbitmq().await;
    let exchange = format!("orders-ex-{}", uuid::Uuid::new_v4());
    let queue = format!("orders-queue-{}", uuid::Uuid::new_v4());

    let manager = connect(&broker).await;
    let subscriber = Subscriber::new(manager.clone(), SubscriberSettings::default());
    let (handler, count, mut rx) = counting();
    let handle = subscriber
        .subscribe(
            DestinationFilter::exchange(&exchange, ExchangeKind::Topic, "order-created", &queue),
            handler,
        )
        .await
        .expect("Failed to subscribe");

    let publisher = Publisher::new(
        manager.clone(),
        exchange_routing(&exchange),
        PublisherSettings::default(),
    );
    let sent = order(42, "order-created");
    let outcome = publisher.publish(&sent).await;
    assert!(
        matches!(outcome, DeliveryOutcome::Acknowledged(Locator::DeliveryTag { .. })),
        "unexpected outcome {:?}",
        outcome
    );

    let received = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("Timeout waiting for message")
        .expect("Channel closed");

    assert_eq!(received.event_type(), "order-created");
    assert_eq!(received.key(), Some("42"));
    assert_eq!(received.correlation_id(), sent.correlation_id());
    assert_eq!(
        received.headers().get_str("tenant").unwrap().unwrap(),
        "acme"
    );
    assert_eq!(count.load(Ordering::SeqCst), 1);

    handle.stop().await.unwrap();
    publisher.close().await.unwrap();
    manager.close().await.unwrap();
    println!("=== Test PASSED ===");
}

#[tokio::test]
async fn test_unroutable_publish_fails() {
    println!("=== AMQP Unroutable Publish Test ===");
    let (_container, broker) = start_rabbitmq().await;
    let exchange = format!("orders-ex-{}", uuid::Uuid::new_v4());

    let manager = connect(&broker).await;
    let publisher = Publisher::new(
        manager.clone(),
        exchange_routing(&exchange),
        PublisherSettings::default(),
    );

    // Exchange is declared on publish but nothing is bound to it
    let outcome = publisher.publish(&order(1, "order-created")).await;
    assert!(
        matches!(outcome, DeliveryOutcome::Failed(BusError::Unroutable(_))),
        "unexpected outcome {:?}",
        outcome
    );

    publisher.close().await.unwrap();
    manager.close().await.unwrap();
    println!("=== Test PASSED ===");
}

#[tokio::test]
async fn test_binding_key_filters_messages() {
    println!("=== AMQP Binding Filter Test ===");
    let (_container, broker) = start_rabbitmq().await;
    let exchange = format!("orders-ex-{}", uuid::Uuid::new_v4());
    let queue = format!("cancellations-{}", uuid::Uuid::new_v4());

    let manager = connect(&broker).await;
    let subscriber = Subscriber::new(manager.clone(), SubscriberSettings::default());
    let (handler, count, mut rx) = counting();
    let handle = subscriber
        .subscribe(
            DestinationFilter::exchange(&exchange, ExchangeKind::Topic, "order-cancelled", &queue),
            handler,
        )
        .await
        .unwrap();

    let publisher = Publisher::new(
        manager.clone(),
        exchange_routing(&exchange),
        PublisherSettings::default(),
    );
    // Unmatched type has no route and is returned
    assert!(!publisher.publish(&order(1, "order-created")).await.is_acknowledged());
    assert!(publisher.publish(&order(2, "order-cancelled")).await.is_acknowledged());

    let received = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("Timeout waiting for message")
        .expect("Channel closed");
    assert_eq!(received.key(), Some("2"));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    handle.stop().await.unwrap();
    manager.close().await.unwrap();
    println!("=== Test PASSED ===");
}

#[tokio::test]
async fn test_failed_handler_message_redelivered() {
    println!("=== AMQP Redelivery Test ===");
    let (_container, broker) = start_rabbitmq().await;
    let exchange = format!("orders-ex-{}", uuid::Uuid::new_v4());
    let queue = format!("orders-queue-{}", uuid::Uuid::new_v4());
    let filter = DestinationFilter::exchange(&exchange, ExchangeKind::Topic, "#", &queue);

    // First consumer fails every message, leaving it unacknowledged
    let failing = connect(&broker).await;
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let handle = Subscriber::new(failing.clone(), SubscriberSettings::default())
        .subscribe(
            filter.clone(),
            handler_fn(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(BusError::Handler("not today".to_string()))
                }
            }),
        )
        .await
        .unwrap();

    let manager = connect(&broker).await;
    let publisher = Publisher::new(
        manager.clone(),
        exchange_routing(&exchange),
        PublisherSettings::default(),
    );
    assert!(publisher.publish(&order(7, "order-created")).await.is_acknowledged());

    tokio::time::timeout(Duration::from_secs(10), async {
        while attempts.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("Timeout waiting for first attempt");

    // Closing the failing consumer's connection returns the message to the queue
    handle.stop().await.unwrap();
    failing.close().await.unwrap();

    let (handler, _count, mut rx) = counting();
    let handle = Subscriber::new(manager.clone(), SubscriberSettings::default())
        .subscribe(filter, handler)
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("Timeout waiting for redelivery")
        .expect("Channel closed");
    assert_eq!(received.key(), Some("7"));

    handle.stop().await.unwrap();
    manager.close().await.unwrap();
    println!("=== Test PASSED ===");
}

#[tokio::test]
async fn test_bad_credentials_are_fatal() {
    println!("=== AMQP Authentication Test ===");
    let (_container, broker) = start_rabbitmq().await;
    let broker = BrokerConfig {
        password: "wrong".to_string(),
        ..broker
    };

    let connector = AmqpConnector::new(broker, SubscriberConfig::default());
    match connector.connect().await {
        Err(BusError::Connection { fatal, .. }) => assert!(fatal),
        Err(other) => panic!("unexpected error {:?}", other),
        Ok(_) => panic!("connected with wrong password"),
    }
    println!("=== Test PASSED ===");
}
