use rdkafka::message::Timestamp;

use super::*;
use crate::config::BrokerType;
use crate::envelope::{Envelope, TYPE_HEADER};

fn kafka_broker() -> BrokerConfig {
    BrokerConfig {
        broker_type: BrokerType::Kafka,
        ..Default::default()
    }
}

#[test]
fn test_connector_address() {
    let connector = KafkaConnector::new(kafka_broker(), SubscriberConfig::default());
    assert_eq!(connector.address(), "kafka://localhost:9092");
}

#[test]
fn test_producer_config() {
    let connector = KafkaConnector::new(kafka_broker(), SubscriberConfig::default());
    let config = connector.producer_config();
    assert_eq!(config.get("bootstrap.servers"), Some("localhost:9092"));
    assert_eq!(config.get("acks"), Some("all"));
    assert_eq!(config.get("enable.idempotence"), Some("true"));
    assert_eq!(config.get("sasl.mechanism"), None);
}

#[test]
fn test_consumer_config() {
    let subscriber = SubscriberConfig {
        auto_offset_reset: "latest".to_string(),
        ..Default::default()
    };
    let connector = KafkaConnector::new(kafka_broker(), subscriber);
    let config = connector.consumer_config("orders");
    assert_eq!(config.get("group.id"), Some("orders"));
    assert_eq!(config.get("enable.auto.commit"), Some("false"));
    assert_eq!(config.get("auto.offset.reset"), Some("latest"));
}

#[test]
fn test_sasl_config() {
    let broker = BrokerConfig {
        username: "user".to_string(),
        password: "pass".to_string(),
        security_protocol: Some("SASL_SSL".to_string()),
        sasl_mechanism: Some("SCRAM-SHA-256".to_string()),
        ssl_ca_location: Some("/etc/ssl/ca.pem".to_string()),
        ..kafka_broker()
    };
    let connector = KafkaConnector::new(broker, SubscriberConfig::default());
    let config = connector.producer_config();
    assert_eq!(config.get("security.protocol"), Some("SASL_SSL"));
    assert_eq!(config.get("sasl.mechanism"), Some("SCRAM-SHA-256"));
    assert_eq!(config.get("sasl.username"), Some("user"));
    assert_eq!(config.get("sasl.password"), Some("pass"));
    assert_eq!(config.get("ssl.ca.location"), Some("/etc/ssl/ca.pem"));
}

#[test]
fn test_error_classification() {
    let auth = KafkaError::MetadataFetch(RDKafkaErrorCode::SaslAuthenticationFailed);
    assert!(matches!(
        connect_error("kafka://localhost:9092", auth),
        BusError::Connection { fatal: true, .. }
    ));

    let timeout = KafkaError::MetadataFetch(RDKafkaErrorCode::OperationTimedOut);
    assert!(matches!(
        connect_error("kafka://localhost:9092", timeout),
        BusError::Connection { fatal: false, .. }
    ));

    let unknown = KafkaError::MessageProduction(RDKafkaErrorCode::UnknownTopicOrPartition);
    assert!(matches!(delivery_error(unknown), BusError::Unroutable(_)));

    let down = KafkaError::MessageProduction(RDKafkaErrorCode::AllBrokersDown);
    assert!(matches!(delivery_error(down), BusError::ConnectionLost));
}

#[test]
fn test_record_headers_round_trip() {
    let envelope = Envelope::builder(r#"{"order-id":42}"#, "order-created")
        .key("42")
        .header("tenant", "acme")
        .build()
        .unwrap();
    let wire = envelope.to_wire();

    let record = OwnedMessage::new(
        Some(wire.payload.to_vec()),
        wire.key.as_ref().map(|k| k.as_bytes().to_vec()),
        "order-topic".to_string(),
        Timestamp::NotAvailable,
        0,
        7,
        Some(to_kafka_headers(&wire.headers)),
    );
    let received = from_kafka(&record);

    assert_eq!(received, wire);
    assert_eq!(
        received.headers.get_str(TYPE_HEADER).unwrap().unwrap(),
        "order-created"
    );
    assert_eq!(Envelope::from_wire(received).unwrap(), envelope);
}

#[test]
fn test_record_without_key_or_headers() {
    let record = OwnedMessage::new(
        None,
        None,
        "order-topic".to_string(),
        Timestamp::NotAvailable,
        0,
        0,
        None,
    );
    let received = from_kafka(&record);

    assert_eq!(received.key, None);
    assert!(received.payload.is_empty());
    assert!(received.headers.is_empty());
    assert!(Envelope::from_wire(received).is_err());
}
