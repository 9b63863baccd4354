//! Trade Types and Structures
//!
//! A trade represents a committed fill between a resting (maker) and an
//! incoming (taker) order on one instrument.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::now_millis;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    /// Unique identifier for the trade.
    pub id: String,
    /// Instrument the trade executed on, e.g. "BTC/USDT".
    pub instrument: String,
    /// Execution price (the maker's resting price).
    pub price: Decimal,
    /// Executed quantity.
    pub quantity: Decimal,
    pub buyer_order_id: String,
    pub seller_order_id: String,
    /// Whether the buy side was the resting (maker) order.
    pub is_buyer_maker: bool,
    /// Timestamp when the trade was committed, milliseconds since epoch.
    pub created_at: u64,
}

impl Trade {
    pub fn new(
        id: String,
        instrument: String,
        price: Decimal,
        quantity: Decimal,
        buyer_order_id: String,
        seller_order_id: String,
        is_buyer_maker: bool,
    ) -> Self {
        Self {
            id,
            instrument,
            price,
            quantity,
            buyer_order_id,
            seller_order_id,
            is_buyer_maker,
            created_at: now_millis(),
        }
    }

    /// Quote-currency value of the trade.
    pub fn total_amount(&self) -> Decimal {
        self.price * self.quantity
    }
}
