//! Cooperative task-pipeline driver.
//!
//! The same intake/match/persist work as the serial loop, split across
//! bounded channels so slow persistence backpressures matching and slow
//! matching backpressures intake:
//!
//!   receiver -> intents -> processors -> signals -> matchers -> pairs -> persisters
//!
//! Book mutation stays serialized by the book mutex; the channels only move
//! work between stages. Every stage observes a shared stop flag and exits
//! cleanly, and a shared consecutive-error counter aborts the whole pipeline
//! past the configured threshold.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::book::BookEntry;
use super::executor::{execute_match, requeue_pair, ExecOutcome};
use super::stream::StreamDelivery;
use super::{EngineContext, EngineError, IntakeOutcome, CONSUMER_GROUP};
use crate::config::PipelineSettings;
use crate::metrics;

const SEND_TIMEOUT: Duration = Duration::from_secs(1);
const STOP_POLL: Duration = Duration::from_millis(100);

pub struct PipelineEngine {
    ctx: Arc<EngineContext>,
    pipeline: PipelineSettings,
}

struct Shared {
    ctx: Arc<EngineContext>,
    stop: watch::Receiver<bool>,
    errors: Arc<AtomicU32>,
}

impl Shared {
    fn stopped(&self) -> bool {
        *self.stop.borrow()
    }

    fn note_error(&self, what: &str, e: &EngineError) {
        let n = self.errors.fetch_add(1, Ordering::SeqCst) + 1;
        log::warn!(
            "pipeline {} {} error ({} consecutive): {}",
            self.ctx.instrument,
            what,
            n,
            e
        );
    }

    fn note_ok(&self) {
        self.errors.store(0, Ordering::SeqCst);
    }
}

impl PipelineEngine {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        let pipeline = crate::config::instance().lock().unwrap().pipeline.clone();
        Self { ctx, pipeline }
    }

    pub fn with_settings(ctx: Arc<EngineContext>, pipeline: PipelineSettings) -> Self {
        Self { ctx, pipeline }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), EngineError> {
        self.ctx.init().await?;
        log::info!(
            "pipeline engine {} running ({} processors, {} matchers, {} persisters)",
            self.ctx.instrument,
            self.pipeline.processors,
            self.pipeline.matchers,
            self.pipeline.persisters
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let errors = Arc::new(AtomicU32::new(0));
        let shared = || Shared {
            ctx: self.ctx.clone(),
            stop: stop_rx.clone(),
            errors: errors.clone(),
        };

        let (intent_tx, intent_rx) = mpsc::channel::<StreamDelivery>(self.pipeline.channel_capacity);
        let (signal_tx, signal_rx) = mpsc::channel::<()>(1);
        let (pair_tx, pair_rx) =
            mpsc::channel::<(BookEntry, BookEntry)>(self.pipeline.channel_capacity);
        let intent_rx = Arc::new(Mutex::new(intent_rx));
        let signal_rx = Arc::new(Mutex::new(signal_rx));
        let pair_rx = Arc::new(Mutex::new(pair_rx));

        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        handles.push(tokio::spawn(receiver_task(shared(), intent_tx)));
        for _ in 0..self.pipeline.processors {
            handles.push(tokio::spawn(processor_task(
                shared(),
                intent_rx.clone(),
                signal_tx.clone(),
            )));
        }
        for _ in 0..self.pipeline.matchers {
            handles.push(tokio::spawn(matcher_task(
                shared(),
                signal_rx.clone(),
                pair_tx.clone(),
                self.pipeline.matcher_wakeup_millis,
            )));
        }
        for _ in 0..self.pipeline.persisters {
            handles.push(tokio::spawn(persister_task(
                shared(),
                pair_rx.clone(),
                signal_tx.clone(),
            )));
        }
        drop(signal_tx);
        drop(pair_tx);

        // Supervise: wait for shutdown or the error threshold.
        let threshold = self.ctx.settings.error_threshold;
        let aborted = loop {
            if *shutdown.borrow() {
                break None;
            }
            let n = errors.load(Ordering::SeqCst);
            if n >= threshold {
                break Some(n);
            }
            tokio::time::sleep(STOP_POLL).await;
        };

        let _ = stop_tx.send(true);
        for handle in handles {
            let _ = handle.await;
        }

        match aborted {
            Some(n) => {
                log::error!(
                    "pipeline engine {} aborted after {} consecutive errors",
                    self.ctx.instrument,
                    n
                );
                Err(EngineError::Aborted(self.ctx.instrument.clone(), n))
            }
            None => {
                log::info!("pipeline engine {} stopped", self.ctx.instrument);
                Ok(())
            }
        }
    }
}

/// Pulls stream batches and feeds the intent channel. Also owns periodic
/// reclamation of stale deliveries, which re-enter through the same channel.
async fn receiver_task(shared: Shared, intent_tx: mpsc::Sender<StreamDelivery>) {
    let ctx = &shared.ctx;
    while !shared.stopped() {
        match ctx.reclaim_stale().await {
            Ok(reclaimed) => {
                for delivery in reclaimed {
                    if intent_tx.send_timeout(delivery, SEND_TIMEOUT).await.is_err() {
                        break;
                    }
                }
            }
            Err(e) => shared.note_error("reclaim", &e),
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
            .await;
        match batch {
            Ok(batch) => {
                shared.note_ok();
                for delivery in batch {
                    // Full channel past the timeout: drop unacked, the idle
                    // reclaim path will redeliver.
                    if intent_tx.send_timeout(delivery, SEND_TIMEOUT).await.is_err()
                        && shared.stopped()
                    {
                        return;
                    }
                }
                metrics::heartbeat(&ctx.instrument);
            }
            Err(e) => {
                shared.note_error("read", &e.into());
                tokio::time::sleep(Duration::from_millis(ctx.settings.block_millis)).await;
            }
        }
    }
}

/// Applies delivered intents to the book and nudges the matchers when an
/// order was admitted.
async fn processor_task(
    shared: Shared,
    intent_rx: Arc<Mutex<mpsc::Receiver<StreamDelivery>>>,
    signal_tx: mpsc::Sender<()>,
) {
    let ctx = &shared.ctx;
    while !shared.stopped() {
        let delivery = {
            let mut rx = intent_rx.lock().await;
            match timeout(STOP_POLL, rx.recv()).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => return,
                Err(_) => continue,
            }
        };
        match ctx.apply_delivery(&delivery).await {
            Ok(IntakeOutcome::Added) => {
                shared.note_ok();
                // try_send coalesces: a signal already queued is enough.
                let _ = signal_tx.try_send(());
            }
            Ok(_) => shared.note_ok(),
            Err(e) => shared.note_error("process", &e),
        }
    }
}

/// Pops matchable pairs off the book, bounded per pass, and hands them to
/// the persisters. Wakes on signal or on a timer so stops triggered by
/// trades never strand a crossed book.
async fn matcher_task(
    shared: Shared,
    signal_rx: Arc<Mutex<mpsc::Receiver<()>>>,
    pair_tx: mpsc::Sender<(BookEntry, BookEntry)>,
    wakeup_millis: u64,
) {
    let ctx = &shared.ctx;
    while !shared.stopped() {
        {
            let mut rx = signal_rx.lock().await;
            match timeout(Duration::from_millis(wakeup_millis), rx.recv()).await {
                Ok(None) => return,
                Ok(Some(())) | Err(_) => {}
            }
        }

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
            if let Err(e) = pair_tx
                .send_timeout((buy, sell), SEND_TIMEOUT)
                .await
            {
                // Persisters are saturated or gone; put the pair back so it
                // is re-picked on the next pass.
                let (buy, sell) = match e {
                    mpsc::error::SendTimeoutError::Timeout(pair) => pair,
                    mpsc::error::SendTimeoutError::Closed(pair) => pair,
                };
                requeue_pair(ctx, &buy, &sell);
                break;
            }
        }
    }
}

/// Executes matches transactionally, retrying transient failures, and
/// re-signals the matchers when a partial fill left a live remainder.
async fn persister_task(
    shared: Shared,
    pair_rx: Arc<Mutex<mpsc::Receiver<(BookEntry, BookEntry)>>>,
    signal_tx: mpsc::Sender<()>,
) {
    let ctx = &shared.ctx;
    let retry = ctx.retry_policy();
    while !shared.stopped() {
        let (buy, sell) = {
            let mut rx = pair_rx.lock().await;
            match timeout(STOP_POLL, rx.recv()).await {
                Ok(Some(pair)) => pair,
                Ok(None) => return,
                Err(_) => continue,
            }
        };
        match retry.run(|| execute_match(ctx, &buy, &sell)).await {
            Ok(ExecOutcome::Committed { partial, .. }) => {
                shared.note_ok();
                if partial {
                    let _ = signal_tx.try_send(());
                }
            }
            Ok(ExecOutcome::Abandoned) => shared.note_ok(),
            Err(e) => {
                requeue_pair(ctx, &buy, &sell);
                shared.note_error("persist", &e);
            }
        }
    }
}
