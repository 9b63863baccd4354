//! Stream intent payload.
//!
//! The wire shape consumed from the per-instrument order stream:
//! `{ "id": <order id>, "action": "ADD"|"REMOVE", "timestamp": <epoch ms> }`.
//! The delivery handle (stream message id) travels outside this payload.

use serde::{Deserialize, Serialize};

use super::now_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentAction {
    #[serde(rename = "ADD")]
    Add,
    #[serde(rename = "REMOVE")]
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderIntent {
    /// Order id the intent refers to.
    pub id: String,
    pub action: IntentAction,
    /// Emission timestamp, milliseconds since epoch.
    pub timestamp: u64,
}

impl OrderIntent {
    pub fn add(order_id: &str) -> Self {
        Self {
            id: order_id.to_string(),
            action: IntentAction::Add,
            timestamp: now_millis(),
        }
    }

    pub fn remove(order_id: &str) -> Self {
        Self {
            id: order_id.to_string(),
            action: IntentAction::Remove,
            timestamp: now_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let intent = OrderIntent {
            id: "o-77".into(),
            action: IntentAction::Add,
            timestamp: 1700000000000,
        };
        let json = serde_json::to_string(&intent).unwrap();
        assert_eq!(
            json,
            r#"{"id":"o-77","action":"ADD","timestamp":1700000000000}"#
        );

        let back: OrderIntent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, intent);
    }
}
