//! eventwire-producer: publishes the demo orders
//!
//! Reads a JSON array of orders and publishes each one as an envelope keyed
//! by the order id and typed by the order type. The routing policy decides
//! whether an order lands on a topic or an exchange.
//!
//! ## Configuration
//! - First argument or EVENTWIRE_CONFIG: YAML config file
//! - EVENTWIRE__PRODUCER__DATA_FILE: orders file (default: data.json)
//! - EVENTWIRE__PRODUCER__INTERVAL_MS: pause between publishes (default: 1000)
//! - EVENTWIRE_LOG: log filter (default: info)

use std::sync::Arc;

use tracing::{error, info, warn};

use eventwire::bus::init_connector;
use eventwire::config::BrokerType;
use eventwire::connection::ConnectionManager;
use eventwire::orders::load_orders;
use eventwire::publisher::{DeliveryOutcome, Publisher, PublisherSettings};
use eventwire::utils::bootstrap::bootstrap;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = bootstrap("producer")?;
    if config.broker.broker_type == BrokerType::Memory {
        warn!("Memory broker selected; messages stay inside this process");
    }

    let connector = init_connector(&config.broker, &config.subscriber)?;
    let manager = ConnectionManager::from_config(connector, &config.broker);
    manager.connect().await?;

    let publisher = Publisher::new(
        Arc::clone(&manager),
        config.routing_policy()?,
        PublisherSettings::from_config(&config),
    );

    let orders = load_orders(&config.producer.data_file)?;
    let mut failed = 0usize;
    for (index, order) in orders.iter().enumerate() {
        if index > 0 {
            tokio::time::sleep(config.producer.interval()).await;
        }

        let envelope = order.to_envelope()?;
        let payload = String::from_utf8_lossy(envelope.payload()).into_owned();
        match publisher.publish(&envelope).await {
            DeliveryOutcome::Acknowledged(locator) => {
                info!("Delivered '{}' to '{}'", payload, locator);
            }
            DeliveryOutcome::Failed(e) => {
                failed += 1;
                error!(order_id = order.id, error = %e, "Failed to deliver order");
            }
        }
    }

    publisher.close().await?;
    manager.close().await?;
    info!(published = orders.len() - failed, failed, "eventwire-producer finished");

    if failed > 0 {
        return Err(format!("{} of {} orders were not delivered", failed, orders.len()).into());
    }
    Ok(())
}
