//! eventwire - event envelope, routing and delivery pipeline
//!
//! Producers wrap domain events in an [`envelope::Envelope`], a
//! [`routing::RoutingPolicy`] picks the physical destination and a
//! [`publisher::Publisher`] hands the message to the broker and waits for its
//! acknowledgment. Consumers register a [`subscriber::Subscriber`] that
//! decodes, dispatches and acknowledges deliveries. Both share one
//! [`connection::ConnectionManager`], which reconnects on its own.
//!
//! Broker backends live in [`bus`]: RabbitMQ (`amqp` feature), Kafka
//! (`kafka` feature) and an in-process simulated broker.

pub mod bus;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod orders;
pub mod publisher;
pub mod routing;
pub mod subscriber;
pub mod utils;
