//! MySQL order store over sqlx.
//!
//! Row locks come from `SELECT ... FOR UPDATE` inside a transaction; each
//! trade commits exactly one transaction covering both order updates and the
//! trade insert.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::mysql::{MySqlPool, MySqlRow};
use sqlx::{MySql, Row, Transaction};

use super::{apply_match, OrderStore, StoreError, StoreTx};
use crate::engine::entry::{Order, OrderKind, OrderSide, OrderStatus};

const ORDER_COLUMNS: &str =
    "id, currency, coin, side, kind, price, stop_price, quantity, filled_quantity, status, updated_at";

#[derive(Debug, Clone)]
pub struct MySqlOrderStore {
    pool: MySqlPool,
}

impl MySqlOrderStore {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = MySqlPool::connect(url).await?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl OrderStore for MySqlOrderStore {
    async fn find_order(&self, order_id: &str) -> Result<Option<Order>, StoreError> {
        let sql = format!("SELECT {} FROM orders WHERE id = ?", ORDER_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| order_from_row(&r)).transpose()
    }

    async fn open_orders(&self, currency: &str, coin: &str) -> Result<Vec<Order>, StoreError> {
        let sql = format!(
            "SELECT {} FROM orders WHERE currency = ? AND coin = ? AND status IN ('pending', 'executing') ORDER BY updated_at",
            ORDER_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(currency)
            .bind(coin)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(order_from_row).collect()
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(MySqlStoreTx { tx }))
    }
}

struct MySqlStoreTx {
    tx: Transaction<'static, MySql>,
}

impl MySqlStoreTx {
    async fn update_order(&mut self, order: &Order) -> Result<(), StoreError> {
        sqlx::query("UPDATE orders SET filled_quantity = ?, status = ?, updated_at = ? WHERE id = ?")
            .bind(order.filled_quantity)
            .bind(status_str(order.status))
            .bind(order.updated_at as i64)
            .bind(&order.id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StoreTx for MySqlStoreTx {
    async fn lock_order_for_update(&mut self, order_id: &str) -> Result<Option<Order>, StoreError> {
        let sql = format!("SELECT {} FROM orders WHERE id = ? FOR UPDATE", ORDER_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(order_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.map(|r| order_from_row(&r)).transpose()
    }

    async fn match_orders(
        &mut self,
        buy: &Order,
        sell: &Order,
        is_buyer_maker: bool,
    ) -> Result<Option<Order>, StoreError> {
        let (buy, sell, trade) = apply_match(buy, sell, is_buyer_maker)?;
        let remainder = [&buy, &sell].into_iter().find(|o| o.can_match()).cloned();

        self.update_order(&buy).await?;
        self.update_order(&sell).await?;
        sqlx::query(
            "INSERT INTO trades (id, instrument, price, quantity, buyer_order_id, seller_order_id, is_buyer_maker, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&trade.id)
        .bind(&trade.instrument)
        .bind(trade.price)
        .bind(trade.quantity)
        .bind(&trade.buyer_order_id)
        .bind(&trade.seller_order_id)
        .bind(trade.is_buyer_maker)
        .bind(trade.created_at as i64)
        .execute(&mut *self.tx)
        .await?;

        Ok(remainder)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn order_from_row(row: &MySqlRow) -> Result<Order, StoreError> {
    let id: String = row.try_get("id")?;
    let side_s: String = row.try_get("side")?;
    let kind_s: String = row.try_get("kind")?;
    let price: Option<Decimal> = row.try_get("price")?;
    let stop_price: Option<Decimal> = row.try_get("stop_price")?;
    let status_s: String = row.try_get("status")?;

    let side = match side_s.as_str() {
        "buy" => OrderSide::Buy,
        "sell" => OrderSide::Sell,
        other => return Err(StoreError::Corrupt(format!("order {}: side '{}'", id, other))),
    };
    let kind = match (kind_s.as_str(), price, stop_price) {
        ("limit", Some(price), _) => OrderKind::Limit { price },
        ("market", _, _) => OrderKind::Market,
        ("stop_limit", Some(price), Some(stop_price)) => OrderKind::StopLimit { stop_price, price },
        ("stop_market", _, Some(stop_price)) => OrderKind::StopMarket { stop_price },
        (other, _, _) => {
            return Err(StoreError::Corrupt(format!(
                "order {}: kind '{}' with missing price fields",
                id, other
            )))
        }
    };
    let status = match status_s.as_str() {
        "pending" => OrderStatus::Pending,
        "executing" => OrderStatus::Executing,
        "executed" => OrderStatus::Executed,
        "canceled" => OrderStatus::Canceled,
        other => {
            return Err(StoreError::Corrupt(format!(
                "order {}: status '{}'",
                id, other
            )))
        }
    };

    Ok(Order {
        id,
        currency: row.try_get("currency")?,
        coin: row.try_get("coin")?,
        side,
        kind,
        quantity: row.try_get("quantity")?,
        filled_quantity: row.try_get("filled_quantity")?,
        status,
        updated_at: row.try_get::<i64, _>("updated_at")? as u64,
    })
}

fn status_str(status: OrderStatus) -> &'static str {
    match status {
        OrderStatus::Pending => "pending",
        OrderStatus::Executing => "executing",
        OrderStatus::Executed => "executed",
        OrderStatus::Canceled => "canceled",
    }
}
