//! eventwire-consumer: logs every received order event
//!
//! Subscribes with the configured destination (a queue, an exchange binding
//! or a topic consumer group) and prints each delivery until Ctrl+C.
//!
//! ## Configuration
//! - First argument or EVENTWIRE_CONFIG: YAML config file
//! - EVENTWIRE__SUBSCRIBER__ACK_MODE: manual (default) or auto
//! - EVENTWIRE_LOG: log filter (default: info)

use tracing::info;

use eventwire::bus::init_connector;
use eventwire::connection::ConnectionManager;
use eventwire::subscriber::{handler_fn, Subscriber, SubscriberSettings};
use eventwire::utils::bootstrap::bootstrap;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = bootstrap("consumer")?;

    let connector = init_connector(&config.broker, &config.subscriber)?;
    let manager = ConnectionManager::from_config(connector, &config.broker);
    manager.connect().await?;

    let subscriber = Subscriber::new(manager.clone(), SubscriberSettings::from_config(&config));
    let filter = config.destination_filter();
    info!(consumer = %filter.consumer, source = ?filter.source, "Waiting for messages");

    let handle = subscriber
        .subscribe(
            filter,
            handler_fn(|envelope| async move {
                info!(
                    "{} => consumed '{}' => '{}' (sent {})",
                    envelope.event_type(),
                    envelope.key().unwrap_or_default(),
                    String::from_utf8_lossy(envelope.payload()),
                    envelope.timestamp().to_rfc3339()
                );
                Ok(())
            }),
        )
        .await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    handle.stop().await?;
    manager.close().await?;
    info!("eventwire-consumer stopped");
    Ok(())
}
