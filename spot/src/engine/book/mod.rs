//! Price-time-priority order book.
//!
//! One book per instrument. Each side is a `BTreeMap` keyed by
//! (price rank, resting timestamp, insertion sequence), so iteration order is
//! match-priority order and insertion stays O(log n). Market orders rank
//! ahead of every limit price. An id index mirrors the two sides: an id is in
//! the index iff it rests in exactly one side.
//!
//! The book holds order snapshots only; it never talks to persistence. Lazy
//! head cleanup in `get_matchable_pair` takes a caller-supplied refresh
//! closure so staleness checks stay at the caller's source of truth.

use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};

use crate::engine::entry::{Order, OrderSide};

/// A resting order's position in the book.
#[derive(Debug, Clone)]
pub struct BookEntry {
    pub order_id: String,
    pub side: OrderSide,
    /// Resting price; `None` crosses at any price (market orders).
    pub price: Option<Decimal>,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    /// Resting timestamp, the time-priority key. Preserved across remainder
    /// re-insertion so partial fills keep their queue position.
    pub ts: u64,
    /// Snapshot of the full order at admission or last head refresh.
    pub order: Order,
}

impl BookEntry {
    fn from_order(order: Order, ts: u64) -> Self {
        Self {
            order_id: order.id.clone(),
            side: order.side,
            price: order.book_price(),
            quantity: order.quantity,
            filled_quantity: order.filled_quantity,
            ts,
            order,
        }
    }

    pub fn remaining_quantity(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }
}

/// Sort rank of a resting price. Market sorts before every limit; limit
/// prices are stored pre-negated for bids so ascending key order is always
/// best-first on both sides.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum PriceRank {
    Market,
    Limit(Decimal),
}

type EntryKey = (PriceRank, u64, u64);

fn rank(side: OrderSide, price: Option<Decimal>) -> PriceRank {
    match price {
        None => PriceRank::Market,
        Some(p) => PriceRank::Limit(match side {
            OrderSide::Buy => -p,
            OrderSide::Sell => p,
        }),
    }
}

/// Read-only book statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct BookStats {
    pub bid_depth: usize,
    pub ask_depth: usize,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub spread: Option<Decimal>,
}

#[derive(Debug, Default)]
pub struct OrderBook {
    instrument: String,
    bids: BTreeMap<EntryKey, BookEntry>,
    asks: BTreeMap<EntryKey, BookEntry>,
    index: HashMap<String, (OrderSide, EntryKey)>,
    /// Monotonic insertion counter; breaks ties between equal timestamps.
    seq: u64,
}

impl OrderBook {
    pub fn new(instrument: &str) -> Self {
        Self {
            instrument: instrument.to_string(),
            ..Default::default()
        }
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    /// Admits an order at its own last-modified timestamp. No-op (false) if
    /// the order cannot match or its id is already resting.
    pub fn add_order(&mut self, order: Order) -> bool {
        let ts = order.updated_at;
        self.add_order_at(order, ts)
    }

    /// Admits an order at an explicit resting timestamp. Used to re-insert
    /// partial-fill remainders without losing their original queue position.
    pub fn add_order_at(&mut self, order: Order, ts: u64) -> bool {
        if !order.can_match() || self.index.contains_key(&order.id) {
            return false;
        }
        let side = order.side;
        let key = (rank(side, order.book_price()), ts, self.seq);
        self.seq += 1;
        let entry = BookEntry::from_order(order, ts);
        self.index.insert(entry.order_id.clone(), (side, key.clone()));
        self.side_mut(side).insert(key, entry);
        true
    }

    /// Removes an id from whichever side holds it. Safe for unknown ids.
    pub fn remove_order(&mut self, order_id: &str) -> bool {
        match self.index.remove(order_id) {
            Some((side, key)) => self.side_mut(side).remove(&key).is_some(),
            None => false,
        }
    }

    pub fn contains(&self, order_id: &str) -> bool {
        self.index.contains_key(order_id)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Pops the best crossed (buy, sell) pair, or returns None without
    /// mutation if the tops do not cross.
    ///
    /// First lazily drops head entries whose underlying order no longer
    /// passes `can_match()` according to `refresh` (the caller's source of
    /// truth; a miss leaves the resting snapshot authoritative). A pair
    /// crosses when exactly one side is a market order, or the bid price is
    /// at or above the ask price under exact decimal comparison. Two market
    /// tops never pair: there is no reference price to execute them at. Both
    /// tops are removed on success; the caller owns re-insertion of any
    /// remainder.
    pub fn get_matchable_pair<F>(&mut self, refresh: F) -> Option<(BookEntry, BookEntry)>
    where
        F: Fn(&str) -> Option<Order>,
    {
        Self::clean_head(&mut self.bids, &mut self.index, &refresh);
        Self::clean_head(&mut self.asks, &mut self.index, &refresh);

        let bid = self.bids.first_key_value().map(|(_, e)| e)?;
        let ask = self.asks.first_key_value().map(|(_, e)| e)?;
        if !Self::crosses(bid, ask) {
            return None;
        }

        let (_, buy) = self.bids.pop_first()?;
        let (_, sell) = self.asks.pop_first()?;
        self.index.remove(&buy.order_id);
        self.index.remove(&sell.order_id);
        Some((buy, sell))
    }

    fn crosses(bid: &BookEntry, ask: &BookEntry) -> bool {
        match (bid.price, ask.price) {
            (Some(bid_price), Some(ask_price)) => bid_price >= ask_price,
            // Two market orders have no reference price to trade at; they
            // rest until a priced order arrives.
            (None, None) => false,
            // One market order crosses any priced opposite.
            _ => true,
        }
    }

    fn clean_head<F>(
        side: &mut BTreeMap<EntryKey, BookEntry>,
        index: &mut HashMap<String, (OrderSide, EntryKey)>,
        refresh: &F,
    ) where
        F: Fn(&str) -> Option<Order>,
    {
        while let Some(mut head) = side.first_entry() {
            let entry = head.get_mut();
            let current = match refresh(&entry.order_id) {
                Some(order) => order,
                None => break,
            };
            if current.can_match() {
                // Keep the head but fold in the fresher snapshot.
                entry.quantity = current.quantity;
                entry.filled_quantity = current.filled_quantity;
                entry.order = current;
                break;
            }
            log::debug!("dropping stale book head {}", entry.order_id);
            index.remove(&entry.order_id);
            head.remove();
        }
    }

    /// Best resting limit bid price.
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.values().find_map(|e| e.price)
    }

    /// Best resting limit ask price.
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.values().find_map(|e| e.price)
    }

    pub fn get_spread(&self) -> Option<Decimal> {
        match (self.best_ask(), self.best_bid()) {
            (Some(ask), Some(bid)) => Some(ask - bid),
            _ => None,
        }
    }

    pub fn get_stats(&self) -> BookStats {
        BookStats {
            bid_depth: self.bids.len(),
            ask_depth: self.asks.len(),
            best_bid: self.best_bid(),
            best_ask: self.best_ask(),
            spread: self.get_spread(),
        }
    }

    fn side_mut(&mut self, side: OrderSide) -> &mut BTreeMap<EntryKey, BookEntry> {
        match side {
            OrderSide::Buy => &mut self.bids,
            OrderSide::Sell => &mut self.asks,
        }
    }
}
