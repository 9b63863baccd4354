//! Persistence collaborator.
//!
//! The engine consumes order storage through `OrderStore`: plain reads, a
//! bulk load of open orders at startup, and per-trade transactions exposed as
//! `StoreTx` with row-locked re-reads and a `match_orders` fill routine. One
//! committed transaction per trade; no multi-trade transactions are held
//! open across a matching cycle.

pub mod memory;
pub mod mysql;

pub use memory::MemoryOrderStore;
pub use mysql::MySqlOrderStore;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::engine::entry::{Order, Trade};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt order row: {0}")]
    Corrupt(String),
    #[error("cannot match orders: {0}")]
    Unmatchable(String),
}

/// An open transaction scoped to one trade execution.
#[async_trait]
pub trait StoreTx: Send {
    /// Re-reads an order under a row lock (`SELECT ... FOR UPDATE`
    /// semantics) so no concurrent executor can consume its quantity until
    /// this transaction resolves.
    async fn lock_order_for_update(&mut self, order_id: &str) -> Result<Option<Order>, StoreError>;

    /// Applies fill quantities to both orders, writes the trade record and
    /// returns the still-open remainder order if the fill was partial. The
    /// maker's resting price is the execution price.
    async fn match_orders(
        &mut self,
        buy: &Order,
        sell: &Order,
        is_buyer_maker: bool,
    ) -> Result<Option<Order>, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn find_order(&self, order_id: &str) -> Result<Option<Order>, StoreError>;

    /// All open (pending/executing) orders for one instrument, for the
    /// engine's startup bulk load.
    async fn open_orders(&self, currency: &str, coin: &str) -> Result<Vec<Order>, StoreError>;

    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;
}

/// Shared `match_orders` fill computation used by every backend: fill is the
/// smaller remainder, execution price is the maker's resting price, and at
/// most one side survives as a remainder.
pub(crate) fn apply_match(
    buy: &Order,
    sell: &Order,
    is_buyer_maker: bool,
) -> Result<(Order, Order, Trade), StoreError> {
    let fill = buy.remaining_quantity().min(sell.remaining_quantity());
    if fill <= rust_decimal::Decimal::ZERO {
        return Err(StoreError::Unmatchable(format!(
            "no remaining quantity between {} and {}",
            buy.id, sell.id
        )));
    }

    let (maker, taker) = if is_buyer_maker { (buy, sell) } else { (sell, buy) };
    let price = maker
        .book_price()
        .or_else(|| taker.book_price())
        .ok_or_else(|| {
            StoreError::Unmatchable(format!(
                "no reference price between {} and {}",
                buy.id, sell.id
            ))
        })?;

    let mut buy = buy.clone();
    let mut sell = sell.clone();
    buy.apply_fill(fill);
    sell.apply_fill(fill);

    let trade = Trade::new(
        Uuid::new_v4().to_string(),
        buy.instrument(),
        price,
        fill,
        buy.id.clone(),
        sell.id.clone(),
        is_buyer_maker,
    );
    Ok((buy, sell, trade))
}
