//! Order-matching core.
//!
//! One engine per instrument, fully independent of every other instrument.
//! The shared core (`EngineContext` + `executor`) is driven by one of two
//! interchangeable concurrency drivers: the sequential loop in `serial` or
//! the cooperative task pipeline in `pipeline`.

pub mod book;
pub mod cache;
pub mod entry;
pub mod executor;
pub mod pipeline;
pub mod resilience;
pub mod serial;
pub mod stops;
pub mod store;
pub mod stream;
pub mod supervisor;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::config::EngineSettings;
use crate::metrics;
use book::OrderBook;
use cache::OrderCache;
use entry::{IntentAction, Order, OrderIntent};
use resilience::{BreakerError, CircuitBreaker, DeadLetterQueue, DlqVerdict, RetryPolicy};
use stops::StopQueue;
use store::{OrderStore, StoreError};
use stream::{IntentStream, StreamDelivery, StreamError};

/// Consumer group shared by every engine consumer of an order stream.
pub const CONSUMER_GROUP: &str = "matchers";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("invalid instrument '{0}', expected COIN/CURRENCY")]
    BadInstrument(String),
    #[error("engine for {0} aborted after {1} consecutive errors")]
    Aborted(String, u32),
}

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Initializing,
    Running,
    Stopping,
    Stopped,
}

/// What became of one delivered stream message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeOutcome {
    /// Admitted to the book; a matching pass is worthwhile.
    Added,
    /// A stop order parked until its trigger price prints.
    Held,
    /// Evicted from the book.
    Removed,
    /// Acknowledged without effect (duplicate, unknown or closed order).
    Skipped,
    /// Left un-acknowledged for idle-based redelivery.
    Deferred,
    /// Diverted to the dead-letter queue and acknowledged.
    DeadLettered,
}

/// Everything one instrument's engine shares between its driver tasks.
///
/// The book sits behind a std mutex: its guard is not `Send`, so no task can
/// hold it across an await point, which makes every book read-then-mutate
/// section a non-preemptible critical section by construction.
pub struct EngineContext {
    pub instrument: String,
    pub currency: String,
    pub coin: String,
    pub consumer: String,
    pub store: Arc<dyn OrderStore>,
    pub stream: Arc<dyn IntentStream>,
    pub cache: Arc<OrderCache>,
    pub book: Arc<Mutex<OrderBook>>,
    pub breaker: Arc<CircuitBreaker>,
    pub dlq: Arc<DeadLetterQueue>,
    pub stops: Arc<StopQueue>,
    last_price: Mutex<Option<Decimal>>,
    pub settings: EngineSettings,
}

impl EngineContext {
    pub fn new(
        instrument: &str,
        store: Arc<dyn OrderStore>,
        stream: Arc<dyn IntentStream>,
        settings: EngineSettings,
    ) -> Result<Self, EngineError> {
        let (coin, currency) = instrument
            .split_once('/')
            .ok_or_else(|| EngineError::BadInstrument(instrument.to_string()))?;
        Ok(Self {
            instrument: instrument.to_string(),
            currency: currency.to_string(),
            coin: coin.to_string(),
            consumer: format!("engine-{}", Uuid::new_v4()),
            store,
            stream,
            cache: Arc::new(OrderCache::new()),
            book: Arc::new(Mutex::new(OrderBook::new(instrument))),
            breaker: Arc::new(CircuitBreaker::new(
                &format!("store:{}", instrument),
                settings.breaker_failure_threshold,
                Duration::from_millis(settings.breaker_cooldown_ms),
            )),
            dlq: Arc::new(DeadLetterQueue::new(settings.dlq_max_retries)),
            stops: Arc::new(StopQueue::new()),
            last_price: Mutex::new(None),
            settings,
        })
    }

    pub fn stream_key(&self) -> String {
        format!("orders:{}", self.instrument)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.settings.retry_max,
            Duration::from_millis(self.settings.retry_base_backoff_ms),
            Duration::from_millis(self.settings.retry_backoff_cap_ms),
        )
    }

    /// INITIALIZING work: drop any pre-crash cache state, rebuild the book
    /// from persistence alone, and make sure the consumer group exists.
    pub async fn init(&self) -> Result<(), EngineError> {
        self.cache.clear();
        let open = self.store.open_orders(&self.currency, &self.coin).await?;
        let mut loaded = 0usize;
        {
            let mut book = self.book.lock().unwrap();
            for order in open {
                if order.is_stop() {
                    self.stops.push(order);
                } else if book.add_order(order) {
                    loaded += 1;
                }
            }
        }
        self.stream
            .create_consumer_group(&self.stream_key(), CONSUMER_GROUP)
            .await?;
        log::info!(
            "engine {}: loaded {} resting orders, {} held stops",
            self.instrument,
            loaded,
            self.stops.len()
        );
        Ok(())
    }

    /// Resolves an order snapshot: cache first, then persistence guarded by
    /// the circuit breaker.
    pub async fn resolve_order(
        &self,
        order_id: &str,
    ) -> Result<Option<Order>, BreakerError<StoreError>> {
        if let Some(order) = self.cache.get_order(order_id) {
            metrics::CACHE_HITS.inc();
            return Ok(Some(order));
        }
        metrics::CACHE_MISSES.inc();
        let found = self.breaker.call(|| self.store.find_order(order_id)).await?;
        if let Some(order) = &found {
            self.cache.set_order(order.clone());
        }
        Ok(found)
    }

    /// Applies one delivered message end to end, including its
    /// acknowledgement. Returns what happened so drivers can decide whether
    /// to signal a matching pass.
    pub async fn apply_delivery(
        &self,
        delivery: &StreamDelivery,
    ) -> Result<IntakeOutcome, EngineError> {
        metrics::MESSAGES_CONSUMED
            .with_label_values(&[&self.instrument])
            .inc();

        let intent: OrderIntent = match serde_json::from_str(&delivery.payload) {
            Ok(intent) => intent,
            Err(e) => {
                return self
                    .fail_delivery(delivery, &format!("unparseable payload: {}", e))
                    .await;
            }
        };

        match intent.action {
            IntentAction::Remove => {
                let removed = self.book.lock().unwrap().remove_order(&intent.id);
                let held = self.stops.remove(&intent.id);
                self.cache.invalidate(&intent.id);
                self.ack(delivery).await?;
                self.dlq.mark_processed(&delivery.message_id);
                if removed || held {
                    metrics::ORDERS_REMOVED
                        .with_label_values(&[&self.instrument])
                        .inc();
                    Ok(IntakeOutcome::Removed)
                } else {
                    Ok(IntakeOutcome::Skipped)
                }
            }
            IntentAction::Add => {
                // Duplicate delivery of an id already resting in the book or
                // held as an untriggered stop: idempotent.
                if self.book.lock().unwrap().contains(&intent.id) || self.stops.contains(&intent.id)
                {
                    self.ack(delivery).await?;
                    self.dlq.mark_processed(&delivery.message_id);
                    return Ok(IntakeOutcome::Skipped);
                }

                let order = match self.resolve_order(&intent.id).await {
                    Ok(Some(order)) => order,
                    Ok(None) => {
                        // Canceled or filled upstream before intake; expected.
                        log::debug!("order {} gone before intake, skipping", intent.id);
                        self.ack(delivery).await?;
                        self.dlq.mark_processed(&delivery.message_id);
                        return Ok(IntakeOutcome::Skipped);
                    }
                    Err(e) => {
                        return self.fail_delivery(delivery, &e.to_string()).await;
                    }
                };

                if !order.can_match() {
                    self.ack(delivery).await?;
                    self.dlq.mark_processed(&delivery.message_id);
                    return Ok(IntakeOutcome::Skipped);
                }

                let last = *self.last_price.lock().unwrap();
                let outcome = if order.is_stop() && !last.map_or(false, |p| order.is_triggered(p))
                {
                    self.stops.push(order);
                    IntakeOutcome::Held
                } else {
                    self.book.lock().unwrap().add_order(order);
                    metrics::ORDERS_ADDED
                        .with_label_values(&[&self.instrument])
                        .inc();
                    IntakeOutcome::Added
                };
                self.ack(delivery).await?;
                self.dlq.mark_processed(&delivery.message_id);
                Ok(outcome)
            }
        }
    }

    /// Reclaims deliveries whose consumer stalled past the idle threshold.
    pub async fn reclaim_stale(&self) -> Result<Vec<StreamDelivery>, EngineError> {
        let key = self.stream_key();
        let pending = self.stream.list_pending(&key, CONSUMER_GROUP).await?;
        let mut reclaimed = Vec::new();
        for info in pending {
            if info.idle_millis < self.settings.claim_idle_millis {
                continue;
            }
            if let Some(delivery) = self
                .stream
                .claim(
                    &key,
                    CONSUMER_GROUP,
                    &self.consumer,
                    self.settings.claim_idle_millis,
                    &info.message_id,
                )
                .await?
            {
                log::info!(
                    "engine {}: reclaimed stale delivery {} from {}",
                    self.instrument,
                    delivery.message_id,
                    info.consumer
                );
                reclaimed.push(delivery);
            }
        }
        Ok(reclaimed)
    }

    /// Records a committed trade price and admits any stop orders it
    /// triggered. Returns how many entered the book.
    pub fn record_trade_price(&self, price: Decimal) -> usize {
        *self.last_price.lock().unwrap() = Some(price);
        let triggered = self.stops.take_triggered(price);
        let mut admitted = 0;
        let mut book = self.book.lock().unwrap();
        for order in triggered {
            log::debug!("stop order {} triggered at {}", order.id, price);
            if book.add_order(order) {
                admitted += 1;
            }
        }
        if admitted > 0 {
            metrics::ORDERS_ADDED
                .with_label_values(&[&self.instrument])
                .inc_by(admitted as f64);
        }
        admitted
    }

    pub fn last_price(&self) -> Option<Decimal> {
        *self.last_price.lock().unwrap()
    }

    async fn ack(&self, delivery: &StreamDelivery) -> Result<(), EngineError> {
        self.stream
            .acknowledge(&self.stream_key(), CONSUMER_GROUP, &delivery.message_id)
            .await?;
        Ok(())
    }

    /// Failure path for a delivery: count it against the DLQ budget; divert
    /// and acknowledge once the budget is spent, otherwise leave it pending
    /// for redelivery.
    async fn fail_delivery(
        &self,
        delivery: &StreamDelivery,
        reason: &str,
    ) -> Result<IntakeOutcome, EngineError> {
        match self
            .dlq
            .record_failure(&delivery.message_id, &delivery.payload, reason)
        {
            DlqVerdict::Retry(count) => {
                log::warn!(
                    "engine {}: message {} failed ({}), attempt {}, leaving for redelivery",
                    self.instrument,
                    delivery.message_id,
                    reason,
                    count
                );
                Ok(IntakeOutcome::Deferred)
            }
            DlqVerdict::DeadLettered => {
                self.ack(delivery).await?;
                Ok(IntakeOutcome::DeadLettered)
            }
        }
    }
}
