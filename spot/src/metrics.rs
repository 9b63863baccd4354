//! Metrics collection module for the spot matching service
//!
//! This module provides functionality for collecting and exposing service
//! metrics using Prometheus.

use lazy_static::lazy_static;
use prometheus::{Counter, CounterVec, GaugeVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry instance
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Stream messages consumed, by instrument
    pub static ref MESSAGES_CONSUMED: CounterVec = CounterVec::new(
        Opts::new("messages_consumed", "stream messages consumed"),
        &["instrument"]
    )
    .unwrap();

    /// Orders admitted to a book, by instrument
    pub static ref ORDERS_ADDED: CounterVec = CounterVec::new(
        Opts::new("orders_added", "orders admitted to the book"),
        &["instrument"]
    )
    .unwrap();

    /// Orders evicted from a book, by instrument
    pub static ref ORDERS_REMOVED: CounterVec = CounterVec::new(
        Opts::new("orders_removed", "orders evicted from the book"),
        &["instrument"]
    )
    .unwrap();

    /// Trades committed, by instrument
    pub static ref TRADES_EXECUTED: CounterVec = CounterVec::new(
        Opts::new("trades_executed", "trades committed"),
        &["instrument"]
    )
    .unwrap();

    /// Candidate matches abandoned at re-validation, by instrument
    pub static ref MATCHES_ABANDONED: CounterVec = CounterVec::new(
        Opts::new("matches_abandoned", "matches abandoned as stale"),
        &["instrument"]
    )
    .unwrap();

    /// Order cache hits
    pub static ref CACHE_HITS: Counter =
        Counter::new("cache_hits", "order cache hits").unwrap();

    /// Order cache misses
    pub static ref CACHE_MISSES: Counter =
        Counter::new("cache_misses", "order cache misses").unwrap();

    /// Messages diverted to the dead-letter queue
    pub static ref DEAD_LETTERED: Counter =
        Counter::new("dead_lettered", "messages diverted to the DLQ").unwrap();

    /// Last loop-iteration heartbeat, unix seconds, by instrument
    pub static ref ENGINE_HEARTBEAT: GaugeVec = GaugeVec::new(
        Opts::new("engine_heartbeat", "last engine iteration, unix seconds"),
        &["instrument"]
    )
    .unwrap();
}

/// Initializes the metrics registry
///
/// Registers all metric collectors with the global registry
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(MESSAGES_CONSUMED.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(ORDERS_ADDED.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(ORDERS_REMOVED.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(TRADES_EXECUTED.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(MATCHES_ABANDONED.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(CACHE_HITS.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(CACHE_MISSES.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(DEAD_LETTERED.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(ENGINE_HEARTBEAT.clone()));
}

/// Per-iteration health-check side effect: records that an engine's loop is
/// still turning.
pub fn heartbeat(instrument: &str) {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as f64)
        .unwrap_or(0.0);
    ENGINE_HEARTBEAT.with_label_values(&[instrument]).set(now);
}
