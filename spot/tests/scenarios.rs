//! End-to-end scenarios against the in-memory store and stream, driving the
//! serial engine one cycle at a time for determinism. A final smoke test
//! runs the pipeline driver against the same collaborators.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::watch;

use spot_match::config::{EngineSettings, PipelineSettings};
use spot_match::engine::entry::{Order, OrderIntent, OrderKind, OrderSide, OrderStatus};
use spot_match::engine::executor::{execute_match, ExecOutcome};
use spot_match::engine::pipeline::PipelineEngine;
use spot_match::engine::serial::SerialEngine;
use spot_match::engine::store::memory::MemoryOrderStore;
use spot_match::engine::stream::memory::MemoryStream;
use spot_match::engine::stream::IntentStream;
use spot_match::engine::{EngineContext, CONSUMER_GROUP};

const INSTRUMENT: &str = "BTC/USDT";
const STREAM_KEY: &str = "orders:BTC/USDT";

fn test_settings() -> EngineSettings {
    EngineSettings {
        block_millis: 10,
        claim_idle_millis: 50,
        retry_max: 1,
        retry_base_backoff_ms: 1,
        retry_backoff_cap_ms: 5,
        dlq_max_retries: 2,
        ..EngineSettings::default()
    }
}

struct Harness {
    store: MemoryOrderStore,
    stream: Arc<MemoryStream>,
    engine: SerialEngine,
}

async fn harness() -> Harness {
    let store = MemoryOrderStore::new();
    let stream = Arc::new(MemoryStream::new());
    let ctx = Arc::new(
        EngineContext::new(
            INSTRUMENT,
            Arc::new(store.clone()),
            stream.clone(),
            test_settings(),
        )
        .unwrap(),
    );
    ctx.init().await.unwrap();
    Harness {
        store,
        stream,
        engine: SerialEngine::new(ctx),
    }
}

fn limit(id: &str, side: OrderSide, price: Decimal, qty: Decimal) -> Order {
    Order::new(
        id.to_string(),
        "USDT".into(),
        "BTC".into(),
        side,
        OrderKind::Limit { price },
        qty,
    )
}

/// Persists the order and publishes its ADD intent, as the upstream order
/// intake flow would.
async fn submit(h: &Harness, order: Order) {
    h.store.insert_order(order.clone());
    let payload = serde_json::to_string(&OrderIntent::add(&order.id)).unwrap();
    h.stream.append(STREAM_KEY, &payload).await.unwrap();
}

#[tokio::test]
async fn test_crossed_orders_trade_once_and_empty_the_book() {
    let h = harness().await;
    submit(&h, limit("b1", OrderSide::Buy, dec!(100), dec!(10))).await;
    submit(&h, limit("s1", OrderSide::Sell, dec!(99), dec!(10))).await;

    h.engine.run_once().await.unwrap();

    let trades = h.store.trades();
    assert_eq!(trades.len(), 1);
    // Buy rested first, so the trade prints at the maker's limit.
    assert_eq!(trades[0].price, dec!(100));
    assert_eq!(trades[0].quantity, dec!(10));
    assert!(trades[0].is_buyer_maker);

    assert_eq!(h.store.get_order("b1").unwrap().status, OrderStatus::Executed);
    assert_eq!(h.store.get_order("s1").unwrap().status, OrderStatus::Executed);
    assert!(h.engine.context().book.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_partial_fill_leaves_remainder_resting() {
    let h = harness().await;
    submit(&h, limit("b1", OrderSide::Buy, dec!(100), dec!(5))).await;
    submit(&h, limit("s1", OrderSide::Sell, dec!(100), dec!(10))).await;

    h.engine.run_once().await.unwrap();

    let trades = h.store.trades();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].quantity, dec!(5));

    assert_eq!(h.store.get_order("b1").unwrap().status, OrderStatus::Executed);
    let sell = h.store.get_order("s1").unwrap();
    assert_eq!(sell.status, OrderStatus::Executing);
    assert_eq!(sell.remaining_quantity(), dec!(5));

    let book = h.engine.context().book.lock().unwrap();
    assert!(book.contains("s1"));
    assert_eq!(book.best_ask(), Some(dec!(100)));
    assert!(book.best_bid().is_none());
}

#[tokio::test]
async fn test_uncrossed_order_rests() {
    let h = harness().await;
    submit(&h, limit("s1", OrderSide::Sell, dec!(105), dec!(3))).await;
    submit(&h, limit("b1", OrderSide::Buy, dec!(100), dec!(3))).await;

    h.engine.run_once().await.unwrap();

    assert!(h.store.trades().is_empty());
    let book = h.engine.context().book.lock().unwrap();
    assert_eq!(book.best_ask(), Some(dec!(105)));
    assert_eq!(book.best_bid(), Some(dec!(100)));
    assert_eq!(book.get_spread(), Some(dec!(5)));
}

#[tokio::test]
async fn test_cancel_intent_evicts_resting_order() {
    let h = harness().await;
    submit(&h, limit("s1", OrderSide::Sell, dec!(105), dec!(3))).await;
    h.engine.run_once().await.unwrap();
    assert!(h.engine.context().book.lock().unwrap().contains("s1"));

    h.store.cancel_order("s1");
    let payload = serde_json::to_string(&OrderIntent::remove("s1")).unwrap();
    h.stream.append(STREAM_KEY, &payload).await.unwrap();
    h.engine.run_once().await.unwrap();

    assert!(!h.engine.context().book.lock().unwrap().contains("s1"));
    assert!(h.store.trades().is_empty());
}

#[tokio::test]
async fn test_stale_delivery_is_reclaimed_and_applied_once() {
    let h = harness().await;
    let order = limit("b1", OrderSide::Buy, dec!(100), dec!(1));
    h.store.insert_order(order.clone());
    let payload = serde_json::to_string(&OrderIntent::add("b1")).unwrap();
    h.stream.append(STREAM_KEY, &payload).await.unwrap();

    // A different consumer reads the message and dies without acking.
    let stuck = h
        .stream
        .read_group(STREAM_KEY, CONSUMER_GROUP, "crashed-consumer", 10, 10)
        .await
        .unwrap();
    assert_eq!(stuck.len(), 1);

    // Before the idle threshold the engine must not steal it.
    h.engine.run_once().await.unwrap();
    assert!(!h.engine.context().book.lock().unwrap().contains("b1"));

    tokio::time::sleep(Duration::from_millis(60)).await;
    h.engine.run_once().await.unwrap();
    assert!(h.engine.context().book.lock().unwrap().contains("b1"));

    // Acked after reclamation: nothing left pending, nothing re-applied.
    let pending = h
        .stream
        .list_pending(STREAM_KEY, CONSUMER_GROUP)
        .await
        .unwrap();
    assert!(pending.is_empty());
    h.engine.run_once().await.unwrap();
    assert_eq!(h.engine.context().book.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_market_pair_without_reference_price_rests_quietly() {
    let h = harness().await;
    let mut market_buy = limit("mb", OrderSide::Buy, dec!(0), dec!(1));
    market_buy.kind = OrderKind::Market;
    let mut market_sell = limit("ms", OrderSide::Sell, dec!(0), dec!(1));
    market_sell.kind = OrderKind::Market;
    submit(&h, market_buy).await;
    submit(&h, market_sell).await;

    // With no priced side there is nothing to execute at; every cycle must
    // come back clean rather than error toward the abort threshold.
    for _ in 0..3 {
        h.engine.run_once().await.unwrap();
    }

    assert!(h.store.trades().is_empty());
    let book = h.engine.context().book.lock().unwrap();
    assert!(book.contains("mb"));
    assert!(book.contains("ms"));
}

#[tokio::test]
async fn test_stale_duplicate_pair_fills_only_once() {
    let h = harness().await;
    let ctx = h.engine.context();
    let buy = limit("b1", OrderSide::Buy, dec!(100), dec!(10));
    let sell = limit("s1", OrderSide::Sell, dec!(100), dec!(10));
    h.store.insert_order(buy.clone());
    h.store.insert_order(sell.clone());
    {
        let mut book = ctx.book.lock().unwrap();
        book.add_order(buy);
        book.add_order(sell);
    }

    let pair = ctx.book.lock().unwrap().get_matchable_pair(|_| None).unwrap();
    let stale = pair.clone();

    let first = execute_match(ctx, &pair.0, &pair.1).await.unwrap();
    assert!(matches!(first, ExecOutcome::Committed { .. }));

    // A second execution against the same snapshots must re-validate and
    // walk away without consuming quantity twice.
    let second = execute_match(ctx, &stale.0, &stale.1).await.unwrap();
    assert_eq!(second, ExecOutcome::Abandoned);

    assert_eq!(h.store.trades().len(), 1);
    let buy = h.store.get_order("b1").unwrap();
    let sell = h.store.get_order("s1").unwrap();
    assert_eq!(buy.filled_quantity, buy.quantity);
    assert_eq!(sell.filled_quantity, sell.quantity);
    assert!(ctx.book.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_add_of_held_stop_is_skipped() {
    let h = harness().await;
    let mut stop = limit("stop1", OrderSide::Sell, dec!(0), dec!(2));
    stop.kind = OrderKind::StopMarket {
        stop_price: dec!(100),
    };
    submit(&h, stop).await;
    h.engine.run_once().await.unwrap();
    assert_eq!(h.engine.context().stops.len(), 1);

    // Redelivery of the same ADD must not queue a second copy.
    let payload = serde_json::to_string(&OrderIntent::add("stop1")).unwrap();
    h.stream.append(STREAM_KEY, &payload).await.unwrap();
    h.engine.run_once().await.unwrap();
    assert_eq!(h.engine.context().stops.len(), 1);
}

#[tokio::test]
async fn test_duplicate_add_of_executed_order_is_skipped() {
    let h = harness().await;
    submit(&h, limit("b1", OrderSide::Buy, dec!(100), dec!(10))).await;
    submit(&h, limit("s1", OrderSide::Sell, dec!(100), dec!(10))).await;
    h.engine.run_once().await.unwrap();
    assert_eq!(h.store.trades().len(), 1);

    // A replayed ADD for an already-executed order must not re-enter the
    // book or fill again.
    let payload = serde_json::to_string(&OrderIntent::add("b1")).unwrap();
    h.stream.append(STREAM_KEY, &payload).await.unwrap();
    h.engine.run_once().await.unwrap();

    assert!(h.engine.context().book.lock().unwrap().is_empty());
    assert_eq!(h.store.trades().len(), 1);
}

#[tokio::test]
async fn test_storage_outage_dead_letters_after_bounded_retries() {
    let h = harness().await;
    // Order exists only upstream; every resolution attempt hits the store.
    let payload = serde_json::to_string(&OrderIntent::add("ghost")).unwrap();
    h.stream.append(STREAM_KEY, &payload).await.unwrap();
    h.store.set_failing(true);

    // dlq_max_retries = 2: two failed attempts stay pending, the third
    // diverts and acks.
    h.engine.run_once().await.unwrap();
    assert!(h.engine.context().dlq.is_empty());
    for _ in 0..2 {
        tokio::time::sleep(Duration::from_millis(60)).await;
        h.engine.run_once().await.unwrap();
    }

    let dlq = h.engine.context().dlq.entries();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].retry_count, 3);
    let pending = h
        .stream
        .list_pending(STREAM_KEY, CONSUMER_GROUP)
        .await
        .unwrap();
    assert!(pending.is_empty());

    // Recovery: later messages flow normally.
    h.store.set_failing(false);
    tokio::time::sleep(Duration::from_millis(20)).await;
    submit(&h, limit("b1", OrderSide::Buy, dec!(100), dec!(1))).await;
    h.engine.run_once().await.unwrap();
    assert!(h.engine.context().book.lock().unwrap().contains("b1"));
}

#[tokio::test]
async fn test_canceled_order_abandons_match_without_trade() {
    let h = harness().await;
    submit(&h, limit("b1", OrderSide::Buy, dec!(100), dec!(10))).await;
    h.engine.run_once().await.unwrap();

    // Cancel lands in the store after b1 rested but before the opposing
    // order arrives; the match attempt must re-validate and walk away.
    h.store.cancel_order("b1");
    submit(&h, limit("s1", OrderSide::Sell, dec!(99), dec!(10))).await;
    h.engine.run_once().await.unwrap();

    assert!(h.store.trades().is_empty());
    let book = h.engine.context().book.lock().unwrap();
    assert!(!book.contains("b1"));
    assert!(book.contains("s1"));
}

#[tokio::test]
async fn test_stop_order_held_until_trigger_price_prints() {
    let h = harness().await;
    let mut stop = limit("stop1", OrderSide::Sell, dec!(0), dec!(2));
    stop.kind = OrderKind::StopMarket {
        stop_price: dec!(100),
    };
    submit(&h, stop).await;
    h.engine.run_once().await.unwrap();

    // Held off-book until a trade prints at or below the trigger.
    assert!(!h.engine.context().book.lock().unwrap().contains("stop1"));
    assert_eq!(h.engine.context().stops.len(), 1);

    submit(&h, limit("b1", OrderSide::Buy, dec!(100), dec!(7))).await;
    submit(&h, limit("s1", OrderSide::Sell, dec!(100), dec!(5))).await;
    h.engine.run_once().await.unwrap();
    // The first trade prints at 100 and triggers the stop; it then crosses
    // the bid's remaining 2.
    h.engine.run_once().await.unwrap();

    assert_eq!(h.engine.context().stops.len(), 0);
    let trades = h.store.trades();
    assert_eq!(trades.len(), 2);
    assert_eq!(trades[1].quantity, dec!(2));
    assert_eq!(
        h.store.get_order("stop1").unwrap().status,
        OrderStatus::Executed
    );
}

#[tokio::test]
async fn test_restart_rebuilds_book_from_persistence() {
    let store = MemoryOrderStore::new();
    store.insert_order(limit("b1", OrderSide::Buy, dec!(100), dec!(1)));
    store.insert_order(limit("s1", OrderSide::Sell, dec!(105), dec!(1)));
    let mut executed = limit("done", OrderSide::Buy, dec!(100), dec!(1));
    executed.apply_fill(dec!(1));
    store.insert_order(executed);

    let stream = Arc::new(MemoryStream::new());
    let ctx = Arc::new(
        EngineContext::new(
            INSTRUMENT,
            Arc::new(store.clone()),
            stream,
            test_settings(),
        )
        .unwrap(),
    );
    ctx.init().await.unwrap();

    let book = ctx.book.lock().unwrap();
    assert!(book.contains("b1"));
    assert!(book.contains("s1"));
    assert!(!book.contains("done"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pipeline_driver_matches_end_to_end() {
    let store = MemoryOrderStore::new();
    let stream = Arc::new(MemoryStream::new());
    let ctx = Arc::new(
        EngineContext::new(
            INSTRUMENT,
            Arc::new(store.clone()),
            stream.clone(),
            test_settings(),
        )
        .unwrap(),
    );
    let engine = PipelineEngine::with_settings(
        ctx,
        PipelineSettings {
            matcher_wakeup_millis: 20,
            ..PipelineSettings::default()
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move { engine.run(shutdown_rx).await });

    store.insert_order(limit("b1", OrderSide::Buy, dec!(100), dec!(10)));
    store.insert_order(limit("s1", OrderSide::Sell, dec!(99), dec!(10)));
    for id in ["b1", "s1"] {
        let payload = serde_json::to_string(&OrderIntent::add(id)).unwrap();
        stream.append(STREAM_KEY, &payload).await.unwrap();
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while store.trades().is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();

    let trades = store.trades();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].price, dec!(100));
    assert_eq!(store.get_order("b1").unwrap().status, OrderStatus::Executed);
    assert_eq!(store.get_order("s1").unwrap().status, OrderStatus::Executed);
}
