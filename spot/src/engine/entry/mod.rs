pub mod message;
pub mod order;
pub mod trade;

pub use message::{IntentAction, OrderIntent};
pub use order::{Order, OrderKind, OrderSide, OrderStatus};
pub use trade::Trade;

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
