//! Trade execution, shared by both concurrency drivers.
//!
//! Given a candidate pair popped from the book: open a transaction, re-read
//! both orders under row locks, re-validate, delegate the fill to the store's
//! `match_orders`, commit, then invalidate the cache and re-insert any
//! remainder. A pair that went stale between pop and lock is abandoned, with
//! whichever side is still live returned to the book; an infrastructure
//! failure leaves the book untouched so the caller's retry policy can re-run
//! the attempt, and the caller re-queues both sides once retries are spent.

use rust_decimal::Decimal;

use super::book::BookEntry;
use super::{EngineContext, EngineError};
use crate::metrics;

#[derive(Debug, Clone, PartialEq)]
pub enum ExecOutcome {
    /// Trade committed at `price`; `partial` when a remainder went back to
    /// rest in the book.
    Committed { price: Decimal, partial: bool },
    /// One or both sides were stale; nothing was committed.
    Abandoned,
}

pub async fn execute_match(
    ctx: &EngineContext,
    buy: &BookEntry,
    sell: &BookEntry,
) -> Result<ExecOutcome, EngineError> {
    let mut tx = ctx.store.begin().await?;

    let live_buy = tx.lock_order_for_update(&buy.order_id).await?;
    let live_sell = tx.lock_order_for_update(&sell.order_id).await?;

    let (live_buy, live_sell) = match (live_buy, live_sell) {
        (Some(b), Some(s)) if b.can_match() && s.can_match() => (b, s),
        (maybe_buy, maybe_sell) => {
            // Raced with a cancel or a concurrent fill; abandon rather than
            // trade on stale data. The still-valid side goes back to rest.
            tx.rollback().await?;
            metrics::MATCHES_ABANDONED
                .with_label_values(&[&ctx.instrument])
                .inc();
            let mut book = ctx.book.lock().unwrap();
            for (entry, live) in [(buy, maybe_buy), (sell, maybe_sell)] {
                match live {
                    Some(order) if order.can_match() => {
                        ctx.cache.set_order(order.clone());
                        book.add_order_at(order, entry.ts);
                    }
                    _ => ctx.cache.invalidate(&entry.order_id),
                }
            }
            log::debug!(
                "abandoned stale match {} / {} on {}",
                buy.order_id,
                sell.order_id,
                ctx.instrument
            );
            return Ok(ExecOutcome::Abandoned);
        }
    };

    // The side resting longer is the maker; equal resting times resolve to
    // the buy side.
    let is_buyer_maker = buy.ts <= sell.ts;

    let remainder = match tx.match_orders(&live_buy, &live_sell, is_buyer_maker).await {
        Ok(remainder) => remainder,
        Err(e) => {
            let _ = tx.rollback().await;
            return Err(e.into());
        }
    };
    let price = price_of(&live_buy, &live_sell, is_buyer_maker);
    tx.commit().await?;

    // Committed: stale snapshots must go before anything can re-resolve
    // these ids.
    ctx.cache.invalidate(&buy.order_id);
    ctx.cache.invalidate(&sell.order_id);

    let partial = match remainder {
        Some(order) => {
            // The remainder keeps its original resting timestamp so a
            // partial fill never costs queue position.
            let ts = if order.id == buy.order_id {
                buy.ts
            } else {
                sell.ts
            };
            ctx.cache.set_order(order.clone());
            ctx.book.lock().unwrap().add_order_at(order, ts);
            true
        }
        None => false,
    };

    metrics::TRADES_EXECUTED
        .with_label_values(&[&ctx.instrument])
        .inc();
    if let Some(price) = price {
        ctx.record_trade_price(price);
    }
    Ok(ExecOutcome::Committed {
        price: price.unwrap_or_default(),
        partial,
    })
}

/// Puts both sides of a failed attempt back at their original priorities.
pub fn requeue_pair(ctx: &EngineContext, buy: &BookEntry, sell: &BookEntry) {
    let mut book = ctx.book.lock().unwrap();
    book.add_order_at(buy.order.clone(), buy.ts);
    book.add_order_at(sell.order.clone(), sell.ts);
}

fn price_of(
    buy: &super::entry::Order,
    sell: &super::entry::Order,
    is_buyer_maker: bool,
) -> Option<Decimal> {
    let (maker, taker) = if is_buyer_maker { (buy, sell) } else { (sell, buy) };
    maker.book_price().or_else(|| taker.book_price())
}
