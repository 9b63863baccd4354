//! Single-loop concurrency driver.
//!
//! One sequential loop per instrument: reclaim stale deliveries, pull a
//! bounded batch, apply each intent, then run a capped matching pass so
//! CPU-bound matching periodically yields back to message intake. Transient
//! cycle errors are counted and the loop only aborts after a high
//! consecutive-error threshold.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use super::executor::{execute_match, requeue_pair, ExecOutcome};
use super::resilience::RetryPolicy;
use super::{EngineContext, EngineError, EngineState, CONSUMER_GROUP};
use crate::metrics;

pub struct SerialEngine {
    ctx: Arc<EngineContext>,
    retry: RetryPolicy,
    state: AtomicU8,
}

impl SerialEngine {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        let retry = ctx.retry_policy();
        Self {
            ctx,
            retry,
            state: AtomicU8::new(EngineState::Initializing as u8),
        }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn state(&self) -> EngineState {
        match self.state.load(Ordering::SeqCst) {
            0 => EngineState::Initializing,
            1 => EngineState::Running,
            2 => EngineState::Stopping,
            _ => EngineState::Stopped,
        }
    }

    fn set_state(&self, state: EngineState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// INITIALIZING → RUNNING → (shutdown) STOPPING → STOPPED, or an
    /// `Aborted` error once the consecutive-error threshold is crossed.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), EngineError> {
        self.set_state(EngineState::Initializing);
        self.ctx.init().await?;
        self.set_state(EngineState::Running);
        log::info!("serial engine {} running", self.ctx.instrument);

        let mut consecutive_errors: u32 = 0;
        while !*shutdown.borrow() {
            match self.run_once().await {
                Ok(()) => consecutive_errors = 0,
                Err(e) => {
                    consecutive_errors += 1;
                    log::warn!(
                        "engine {} cycle error ({} consecutive): {}",
                        self.ctx.instrument,
                        consecutive_errors,
                        e
                    );
                    if consecutive_errors >= self.ctx.settings.error_threshold {
                        log::error!(
                            "engine {} aborting after {} consecutive errors",
                            self.ctx.instrument,
                            consecutive_errors
                        );
                        self.set_state(EngineState::Stopped);
                        return Err(EngineError::Aborted(
                            self.ctx.instrument.clone(),
                            consecutive_errors,
                        ));
                    }
                }
            }
        }

        self.set_state(EngineState::Stopping);
        log::info!("serial engine {} stopping", self.ctx.instrument);
        self.set_state(EngineState::Stopped);
        Ok(())
    }

    /// One full cycle: reclaim, read, apply, match, heartbeat. Public so
    /// tests can drive the engine deterministically.
    pub async fn run_once(&self) -> Result<(), EngineError> {
        let ctx = &self.ctx;

        for delivery in ctx.reclaim_stale().await? {
            ctx.apply_delivery(&delivery).await?;
        }

        let batch = ctx
            .stream
            .read_group(
                &ctx.stream_key(),
                CONSUMER_GROUP,
                &ctx.consumer,
                ctx.settings.batch_size,
                ctx.settings.block_millis,
            )
            .await?;
        for delivery in &batch {
            // Deferred outcomes stay un-acked and come back through the
            // idle reclaim path.
            ctx.apply_delivery(delivery).await?;
        }

        self.match_pass().await?;
        metrics::heartbeat(&ctx.instrument);
        Ok(())
    }

    /// Pops and executes matchable pairs, bounded by the per-cycle cap so
    /// the loop gets back to stream intake even on a deeply crossed book.
    async fn match_pass(&self) -> Result<(), EngineError> {
        let ctx = &self.ctx;
        for _ in 0..ctx.settings.match_cap {
            let pair = {
                let cache = ctx.cache.clone();
                ctx.book
                    .lock()
                    .unwrap()
                    .get_matchable_pair(move |id| cache.get_order(id))
            };
            let (buy, sell) = match pair {
                Some(pair) => pair,
                None => break,
            };

            match self.retry.run(|| execute_match(ctx, &buy, &sell)).await {
                Ok(ExecOutcome::Committed { .. }) | Ok(ExecOutcome::Abandoned) => {}
                Err(e) => {
                    // Out of retries: nothing committed, so both sides go
                    // back to rest at their original priorities.
                    requeue_pair(ctx, &buy, &sell);
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}
