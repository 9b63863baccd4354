//! Spot order-matching service: per-instrument price-time-priority books fed
//! by an order-intent stream, with transactional trade persistence.

pub mod config;
pub mod engine;
pub mod metrics;
pub mod server;
