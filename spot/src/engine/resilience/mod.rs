//! Fault-handling primitives used around the engine's external calls:
//! a circuit breaker for persistence access, bounded retry with exponential
//! backoff for trade execution, and a dead-letter queue for poison messages.

pub mod breaker;
pub mod dead_letter;
pub mod retry;

pub use breaker::{BreakerError, BreakerState, CircuitBreaker};
pub use dead_letter::{DeadLetterEntry, DeadLetterQueue, DlqVerdict};
pub use retry::RetryPolicy;
