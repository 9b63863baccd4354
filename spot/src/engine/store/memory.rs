//! In-memory order store.
//!
//! Backs tests and database-less configurations with the same transactional
//! contract as the MySQL store: a transaction stages its writes and applies
//! them atomically on commit. A fault-injection switch lets resilience tests
//! simulate a storage outage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{apply_match, OrderStore, StoreError, StoreTx};
use crate::engine::entry::{Order, OrderStatus, Trade};

#[derive(Debug, Default)]
struct Shared {
    orders: Mutex<HashMap<String, Order>>,
    trades: Mutex<Vec<Trade>>,
    failing: AtomicBool,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryOrderStore {
    shared: Arc<Shared>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an order as the upstream intake flow would.
    pub fn insert_order(&self, order: Order) {
        self.shared
            .orders
            .lock()
            .unwrap()
            .insert(order.id.clone(), order);
    }

    /// Marks an order canceled, as the upstream cancel flow would.
    pub fn cancel_order(&self, order_id: &str) {
        if let Some(order) = self.shared.orders.lock().unwrap().get_mut(order_id) {
            order.status = OrderStatus::Canceled;
        }
    }

    /// When set, every store operation fails with `Unavailable`.
    pub fn set_failing(&self, failing: bool) {
        self.shared.failing.store(failing, Ordering::SeqCst);
    }

    pub fn get_order(&self, order_id: &str) -> Option<Order> {
        self.shared.orders.lock().unwrap().get(order_id).cloned()
    }

    pub fn trades(&self) -> Vec<Trade> {
        self.shared.trades.lock().unwrap().clone()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.shared.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected fault".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn find_order(&self, order_id: &str) -> Result<Option<Order>, StoreError> {
        self.check_available()?;
        Ok(self.get_order(order_id))
    }

    async fn open_orders(&self, currency: &str, coin: &str) -> Result<Vec<Order>, StoreError> {
        self.check_available()?;
        Ok(self
            .shared
            .orders
            .lock()
            .unwrap()
            .values()
            .filter(|o| o.currency == currency && o.coin == coin && o.can_match())
            .cloned()
            .collect())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        self.check_available()?;
        Ok(Box::new(MemoryStoreTx {
            shared: self.shared.clone(),
            staged_orders: Vec::new(),
            staged_trade: None,
        }))
    }
}

struct MemoryStoreTx {
    shared: Arc<Shared>,
    staged_orders: Vec<Order>,
    staged_trade: Option<Trade>,
}

impl MemoryStoreTx {
    fn check_available(&self) -> Result<(), StoreError> {
        if self.shared.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected fault".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTx for MemoryStoreTx {
    async fn lock_order_for_update(&mut self, order_id: &str) -> Result<Option<Order>, StoreError> {
        self.check_available()?;
        Ok(self.shared.orders.lock().unwrap().get(order_id).cloned())
    }

    async fn match_orders(
        &mut self,
        buy: &Order,
        sell: &Order,
        is_buyer_maker: bool,
    ) -> Result<Option<Order>, StoreError> {
        self.check_available()?;
        let (buy, sell, trade) = apply_match(buy, sell, is_buyer_maker)?;
        let remainder = [&buy, &sell].into_iter().find(|o| o.can_match()).cloned();
        self.staged_orders.push(buy);
        self.staged_orders.push(sell);
        self.staged_trade = Some(trade);
        Ok(remainder)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.check_available()?;
        let mut orders = self.shared.orders.lock().unwrap();
        for order in self.staged_orders {
            orders.insert(order.id.clone(), order);
        }
        drop(orders);
        if let Some(trade) = self.staged_trade {
            self.shared.trades.lock().unwrap().push(trade);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        // Staged writes are simply dropped.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::entry::{OrderKind, OrderSide};
    use rust_decimal_macros::dec;

    fn limit(id: &str, side: OrderSide, price: rust_decimal::Decimal, qty: rust_decimal::Decimal) -> Order {
        Order::new(
            id.to_string(),
            "USDT".into(),
            "BTC".into(),
            side,
            OrderKind::Limit { price },
            qty,
        )
    }

    #[tokio::test]
    async fn test_match_orders_full_fill() {
        let store = MemoryOrderStore::new();
        store.insert_order(limit("b", OrderSide::Buy, dec!(100), dec!(10)));
        store.insert_order(limit("s", OrderSide::Sell, dec!(99), dec!(10)));

        let mut tx = store.begin().await.unwrap();
        let buy = tx.lock_order_for_update("b").await.unwrap().unwrap();
        let sell = tx.lock_order_for_update("s").await.unwrap().unwrap();
        let remainder = tx.match_orders(&buy, &sell, true).await.unwrap();
        tx.commit().await.unwrap();

        assert!(remainder.is_none());
        assert_eq!(store.get_order("b").unwrap().status, OrderStatus::Executed);
        assert_eq!(store.get_order("s").unwrap().status, OrderStatus::Executed);

        let trades = store.trades();
        assert_eq!(trades.len(), 1);
        // Maker (buy) price wins.
        assert_eq!(trades[0].price, dec!(100));
        assert_eq!(trades[0].quantity, dec!(10));
        assert!(trades[0].is_buyer_maker);
    }

    #[tokio::test]
    async fn test_match_orders_partial_fill_returns_remainder() {
        let store = MemoryOrderStore::new();
        store.insert_order(limit("b", OrderSide::Buy, dec!(100), dec!(5)));
        store.insert_order(limit("s", OrderSide::Sell, dec!(100), dec!(10)));

        let mut tx = store.begin().await.unwrap();
        let buy = tx.lock_order_for_update("b").await.unwrap().unwrap();
        let sell = tx.lock_order_for_update("s").await.unwrap().unwrap();
        let remainder = tx.match_orders(&buy, &sell, true).await.unwrap().unwrap();
        tx.commit().await.unwrap();

        assert_eq!(remainder.id, "s");
        assert_eq!(remainder.remaining_quantity(), dec!(5));
        assert_eq!(remainder.status, OrderStatus::Executing);
    }

    #[tokio::test]
    async fn test_rollback_discards_staged_writes() {
        let store = MemoryOrderStore::new();
        store.insert_order(limit("b", OrderSide::Buy, dec!(100), dec!(10)));
        store.insert_order(limit("s", OrderSide::Sell, dec!(100), dec!(10)));

        let mut tx = store.begin().await.unwrap();
        let buy = tx.lock_order_for_update("b").await.unwrap().unwrap();
        let sell = tx.lock_order_for_update("s").await.unwrap().unwrap();
        tx.match_orders(&buy, &sell, false).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(store.get_order("b").unwrap().can_match());
        assert!(store.trades().is_empty());
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = MemoryOrderStore::new();
        store.set_failing(true);
        assert!(matches!(
            store.find_order("x").await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_failing(false);
        assert!(store.find_order("x").await.unwrap().is_none());
    }
}
