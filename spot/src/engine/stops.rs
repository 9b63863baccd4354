//! Holding area for untriggered stop orders.
//!
//! Stop orders admitted via ADD wait here until the last trade price crosses
//! their trigger; they then enter the book as their underlying kind.

use std::sync::Mutex;

use rust_decimal::Decimal;

use crate::engine::entry::Order;

#[derive(Debug, Default)]
pub struct StopQueue {
    held: Mutex<Vec<Order>>,
}

impl StopQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, order: Order) {
        self.held.lock().unwrap().push(order);
    }

    pub fn contains(&self, order_id: &str) -> bool {
        self.held.lock().unwrap().iter().any(|o| o.id == order_id)
    }

    pub fn remove(&self, order_id: &str) -> bool {
        let mut held = self.held.lock().unwrap();
        let before = held.len();
        held.retain(|o| o.id != order_id);
        held.len() < before
    }

    /// Drains every held order whose trigger the last trade price crossed.
    pub fn take_triggered(&self, last_price: Decimal) -> Vec<Order> {
        let mut held = self.held.lock().unwrap();
        let (triggered, waiting): (Vec<Order>, Vec<Order>) = held
            .drain(..)
            .partition(|o| o.is_triggered(last_price));
        *held = waiting;
        triggered
    }

    pub fn len(&self) -> usize {
        self.held.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.lock().unwrap().is_empty()
    }
}
