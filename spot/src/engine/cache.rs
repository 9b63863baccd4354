//! Read/write-through order snapshot cache.
//!
//! Maps order id to the latest known snapshot. A miss is the caller's cue to
//! hit persistence. The engine must invalidate an id immediately after any
//! committed mutation to that order and before signaling a dependent
//! re-match, so later resolutions never see a stale snapshot.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::engine::entry::Order;

#[derive(Debug, Default)]
pub struct OrderCache {
    inner: Mutex<HashMap<String, Order>>,
}

impl OrderCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_order(&self, order_id: &str) -> Option<Order> {
        self.inner.lock().unwrap().get(order_id).cloned()
    }

    pub fn set_order(&self, order: Order) {
        self.inner.lock().unwrap().insert(order.id.clone(), order);
    }

    pub fn invalidate(&self, order_id: &str) {
        self.inner.lock().unwrap().remove(order_id);
    }

    /// Drops every snapshot. Used on engine restart so the book is rebuilt
    /// from persistence alone.
    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::entry::{OrderKind, OrderSide};
    use rust_decimal_macros::dec;

    fn order(id: &str) -> Order {
        Order::new(
            id.to_string(),
            "USDT".into(),
            "BTC".into(),
            OrderSide::Buy,
            OrderKind::Limit { price: dec!(100) },
            dec!(1),
        )
    }

    #[test]
    fn test_set_get_invalidate() {
        let cache = OrderCache::new();
        assert!(cache.get_order("1").is_none());

        cache.set_order(order("1"));
        assert_eq!(cache.get_order("1").unwrap().id, "1");

        cache.invalidate("1");
        assert!(cache.get_order("1").is_none());
    }

    #[test]
    fn test_set_overwrites() {
        let cache = OrderCache::new();
        cache.set_order(order("1"));
        let mut updated = order("1");
        updated.apply_fill(dec!(1));
        cache.set_order(updated);
        assert!(!cache.get_order("1").unwrap().can_match());
    }

    #[test]
    fn test_clear() {
        let cache = OrderCache::new();
        cache.set_order(order("1"));
        cache.set_order(order("2"));
        cache.clear();
        assert!(cache.is_empty());
    }
}
