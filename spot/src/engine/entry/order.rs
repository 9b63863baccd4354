//! Order Types and Structures
//!
//! Defines the order record the matching core operates on, its side, kind
//! and lifecycle status, and the `can_match` predicate that gates admission
//! to the book.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::now_millis;

/// Side of the market an order rests on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    #[default]
    Buy,
    Sell,
}

/// Order kind as a closed tagged variant; kind-specific prices live on the
/// variant, so a market order cannot carry a limit price by construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrderKind {
    Limit { price: Decimal },
    Market,
    StopLimit { stop_price: Decimal, price: Decimal },
    StopMarket { stop_price: Decimal },
}

impl Default for OrderKind {
    fn default() -> Self {
        OrderKind::Market
    }
}

/// Lifecycle status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[default]
    Pending,
    /// Partially filled and still open.
    Executing,
    /// Fully filled, terminal.
    Executed,
    /// Canceled, terminal.
    Canceled,
}

/// An order as persisted by the upstream intake flow and consumed by the
/// matching engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    /// Quote currency of the instrument, e.g. "USDT".
    pub currency: String,
    /// Base coin of the instrument, e.g. "BTC".
    pub coin: String,
    pub side: OrderSide,
    #[serde(flatten)]
    pub kind: OrderKind,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub status: OrderStatus,
    /// Last-modified timestamp, milliseconds since epoch. Doubles as the
    /// time-priority key when the order first enters the book.
    pub updated_at: u64,
}

impl Order {
    pub fn new(
        id: String,
        currency: String,
        coin: String,
        side: OrderSide,
        kind: OrderKind,
        quantity: Decimal,
    ) -> Self {
        Self {
            id,
            currency,
            coin,
            side,
            kind,
            quantity,
            filled_quantity: Decimal::ZERO,
            status: OrderStatus::Pending,
            updated_at: now_millis(),
        }
    }

    /// Instrument key, e.g. "BTC/USDT".
    pub fn instrument(&self) -> String {
        format!("{}/{}", self.coin, self.currency)
    }

    /// The price this order would rest at once admitted to the book; `None`
    /// means the order crosses at any price (market, triggered stop-market).
    pub fn book_price(&self) -> Option<Decimal> {
        match self.kind {
            OrderKind::Limit { price } => Some(price),
            OrderKind::Market => None,
            OrderKind::StopLimit { price, .. } => Some(price),
            OrderKind::StopMarket { .. } => None,
        }
    }

    /// Trigger price for stop kinds, `None` otherwise.
    pub fn stop_price(&self) -> Option<Decimal> {
        match self.kind {
            OrderKind::StopLimit { stop_price, .. } => Some(stop_price),
            OrderKind::StopMarket { stop_price } => Some(stop_price),
            OrderKind::Limit { .. } | OrderKind::Market => None,
        }
    }

    pub fn is_market(&self) -> bool {
        self.book_price().is_none()
    }

    pub fn is_stop(&self) -> bool {
        self.stop_price().is_some()
    }

    /// Whether a held stop order should enter the book given the last trade
    /// price: a buy stop arms at or above its trigger, a sell stop at or
    /// below.
    pub fn is_triggered(&self, last_price: Decimal) -> bool {
        match (self.stop_price(), self.side) {
            (Some(stop), OrderSide::Buy) => last_price >= stop,
            (Some(stop), OrderSide::Sell) => last_price <= stop,
            (None, _) => true,
        }
    }

    pub fn remaining_quantity(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }

    pub fn is_filled(&self) -> bool {
        self.filled_quantity >= self.quantity
    }

    /// Still open and has unfilled quantity.
    pub fn can_match(&self) -> bool {
        matches!(self.status, OrderStatus::Pending | OrderStatus::Executing)
            && self.remaining_quantity() > Decimal::ZERO
    }

    /// Applies a fill and moves status to Executing/Executed accordingly.
    pub fn apply_fill(&mut self, quantity: Decimal) {
        self.filled_quantity += quantity;
        self.status = if self.is_filled() {
            OrderStatus::Executed
        } else {
            OrderStatus::Executing
        };
        self.updated_at = now_millis();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn limit_buy(qty: Decimal, price: Decimal) -> Order {
        Order::new(
            "o1".into(),
            "USDT".into(),
            "BTC".into(),
            OrderSide::Buy,
            OrderKind::Limit { price },
            qty,
        )
    }

    #[test]
    fn test_can_match_requires_open_status_and_quantity() {
        let mut order = limit_buy(dec!(10), dec!(100));
        assert!(order.can_match());

        order.apply_fill(dec!(4));
        assert_eq!(order.status, OrderStatus::Executing);
        assert!(order.can_match());

        order.apply_fill(dec!(6));
        assert_eq!(order.status, OrderStatus::Executed);
        assert!(!order.can_match());

        let mut canceled = limit_buy(dec!(10), dec!(100));
        canceled.status = OrderStatus::Canceled;
        assert!(!canceled.can_match());
    }

    #[test]
    fn test_book_price_by_kind() {
        let limit = limit_buy(dec!(1), dec!(100));
        assert_eq!(limit.book_price(), Some(dec!(100)));
        assert!(!limit.is_market());

        let mut market = limit_buy(dec!(1), dec!(100));
        market.kind = OrderKind::Market;
        assert_eq!(market.book_price(), None);
        assert!(market.is_market());

        let mut stop = limit_buy(dec!(1), dec!(100));
        stop.kind = OrderKind::StopLimit {
            stop_price: dec!(105),
            price: dec!(106),
        };
        assert_eq!(stop.book_price(), Some(dec!(106)));
        assert_eq!(stop.stop_price(), Some(dec!(105)));
    }

    #[test]
    fn test_stop_trigger_direction() {
        let mut buy_stop = limit_buy(dec!(1), dec!(100));
        buy_stop.kind = OrderKind::StopMarket {
            stop_price: dec!(105),
        };
        assert!(!buy_stop.is_triggered(dec!(104)));
        assert!(buy_stop.is_triggered(dec!(105)));

        let mut sell_stop = buy_stop.clone();
        sell_stop.side = OrderSide::Sell;
        assert!(sell_stop.is_triggered(dec!(104)));
        assert!(!sell_stop.is_triggered(dec!(106)));
    }

    #[test]
    fn test_instrument_key() {
        let order = limit_buy(dec!(1), dec!(100));
        assert_eq!(order.instrument(), "BTC/USDT");
    }
}
