//! Orders demo domain used by the producer and consumer binaries.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bus::Result;
use crate::envelope::Envelope;

/// Errors reading an orders file.
#[derive(Debug, thiserror::Error)]
pub enum OrdersError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One order as found in the data file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    #[serde(rename = "order-id")]
    pub id: i64,
    /// Event type published for this order, e.g. `order-created`.
    #[serde(rename = "type")]
    pub order_type: String,
}

impl Order {
    /// Envelope keyed by the order id, typed by the order type, JSON payload.
    pub fn to_envelope(&self) -> Result<Envelope> {
        let payload = serde_json::to_vec(self).map_err(|e| {
            crate::bus::BusError::InvalidEnvelope(format!("order serialization: {}", e))
        })?;
        Envelope::builder(payload, self.order_type.clone())
            .key(self.id.to_string())
            .build()
    }
}

/// Read a JSON array of orders.
///
/// A missing file or an empty array yields an empty list and a warning.
pub fn load_orders(path: impl AsRef<Path>) -> std::result::Result<Vec<Order>, OrdersError> {
    let path = path.as_ref();
    let shown = path.display().to_string();

    if !path.exists() {
        warn!(path = %shown, "Orders file not found");
        return Ok(Vec::new());
    }

    let raw = std::fs::read_to_string(path).map_err(|source| OrdersError::Io {
        path: shown.clone(),
        source,
    })?;
    let orders: Vec<Order> = serde_json::from_str(&raw).map_err(|source| OrdersError::Parse {
        path: shown.clone(),
        source,
    })?;

    if orders.is_empty() {
        warn!(path = %shown, "No orders found in file");
    }
    for order in &orders {
        info!(order_id = order.id, order_type = %order.order_type, "Loaded order");
    }
    Ok(orders)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_json(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_orders() {
        let file = write_json(
            r#"[{"order-id": 1, "type": "order-created"}, {"order-id": 2, "type": "order-shipped"}]"#,
        );

        let orders = load_orders(file.path()).unwrap();

        assert_eq!(
            orders,
            vec![
                Order {
                    id: 1,
                    order_type: "order-created".to_string()
                },
                Order {
                    id: 2,
                    order_type: "order-shipped".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let orders = load_orders(dir.path().join("data.json")).unwrap();
        assert!(orders.is_empty());
    }

    #[test]
    fn test_empty_array_is_empty() {
        let file = write_json("[]");
        assert!(load_orders(file.path()).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let file = write_json(r#"{"order-id": 1}"#);
        assert!(matches!(
            load_orders(file.path()),
            Err(OrdersError::Parse { .. })
        ));
    }

    #[test]
    fn test_order_envelope() {
        let order = Order {
            id: 42,
            order_type: "order-created".to_string(),
        };

        let envelope = order.to_envelope().unwrap();

        assert_eq!(envelope.key(), Some("42"));
        assert_eq!(envelope.event_type(), "order-created");
        assert_eq!(envelope.content_type(), "application/json");
        let decoded: serde_json::Value = envelope.decode_json().unwrap();
        assert_eq!(decoded["order-id"], 42);
        assert_eq!(envelope.decode_json::<Order>().unwrap(), order);
    }
}
