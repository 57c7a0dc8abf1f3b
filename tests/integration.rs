//! End-to-end scenarios driving a real `Engine` through the scheduler.
//!
//! `TimeKeeper` schedules every debounce/delay/interval formation against
//! `tokio::time::Instant`, so a paused runtime clock (`#[tokio::test(start_paused
//! = true)]` + `tokio::time::advance`) drives it exactly as it would drive a
//! bare `tokio::time::sleep` — no real wall-clock waiting, no CI jitter.

use cyre::{ChannelConfig, Engine, FnHandler, HandlerOutcome, IntraLink, Priority, RuntimeConfig};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn counting_handler() -> (Arc<dyn cyre::Handler>, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let counted = count.clone();
    let handler = Arc::new(FnHandler::new(move |payload: Value| {
        let counted = counted.clone();
        Box::pin(async move {
            counted.fetch_add(1, Ordering::SeqCst);
            HandlerOutcome::Result(payload)
        })
    }));
    (handler, count)
}

/// Advances the paused clock in small steps, yielding after each so spawned
/// tasks (the scheduler loop, dispatched handlers) get to run.
async fn advance(total: Duration) {
    let step = Duration::from_millis(1);
    let mut waited = Duration::ZERO;
    while waited < total {
        tokio::time::advance(step).await;
        tokio::task::yield_now().await;
        waited += step;
    }
}

#[tokio::test]
async fn fast_path_call_executes_immediately() {
    let engine = Engine::new(RuntimeConfig::default());
    engine.init();
    engine.action(ChannelConfig::new("fast")).unwrap();
    let (handler, count) = counting_handler();
    engine.on("fast", handler);

    let response = engine.call("fast", Some(json!({"v": 1}))).await;
    assert!(response.ok);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn throttle_rejects_calls_inside_the_window_then_admits_after() {
    let engine = Engine::new(RuntimeConfig::default());
    engine.init();
    let mut config = ChannelConfig::new("throttled");
    config.throttle_ms = 40;
    engine.action(config).unwrap();
    let (handler, count) = counting_handler();
    engine.on("throttled", handler);

    let first = engine.call("throttled", Some(json!(1))).await;
    assert!(first.ok);

    let second = engine.call("throttled", Some(json!(2))).await;
    assert!(!second.ok, "call inside the throttle window must be rejected");
    assert_eq!(count.load(Ordering::SeqCst), 1);

    advance(Duration::from_millis(60)).await;
    let third = engine.call("throttled", Some(json!(3))).await;
    assert!(third.ok, "call after the throttle window must be admitted");
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn debounce_coalesces_rapid_calls_into_one_execution() {
    let engine = Engine::new(RuntimeConfig::default());
    engine.init();
    let mut config = ChannelConfig::new("debounced");
    config.debounce_ms = 40;
    engine.action(config).unwrap();
    let (handler, count) = counting_handler();
    engine.on("debounced", handler);

    for n in 0..5 {
        let response = engine.call("debounced", Some(json!(n))).await;
        assert!(response.ok);
        assert_eq!(
            response.metadata.as_ref().and_then(|m| m.debounced),
            Some(true)
        );
        advance(Duration::from_millis(5)).await;
    }

    advance(Duration::from_millis(60)).await;
    assert_eq!(
        count.load(Ordering::SeqCst),
        1,
        "debounce window should settle to exactly one execution"
    );
}

#[tokio::test(start_paused = true)]
async fn interval_channel_fires_repeat_times_then_stops() {
    let engine = Engine::new(RuntimeConfig::default());
    engine.init();
    let mut config = ChannelConfig::new("ticker");
    config.interval_ms = 20;
    config.repeat = cyre::Repeat::Times(3);
    engine.action(config).unwrap();
    let (handler, count) = counting_handler();
    engine.on("ticker", handler);

    let response = engine.call("ticker", None).await;
    assert!(response.ok);

    advance(Duration::from_millis(80)).await;
    assert_eq!(count.load(Ordering::SeqCst), 3, "interval formation should fire 3 times");

    advance(Duration::from_millis(100)).await;
    assert_eq!(
        count.load(Ordering::SeqCst),
        3,
        "an exhausted repeat must not fire again"
    );
}

#[tokio::test(start_paused = true)]
async fn repeat_zero_registers_without_ever_executing() {
    let engine = Engine::new(RuntimeConfig::default());
    engine.init();
    let mut config = ChannelConfig::new("armed-only");
    config.interval_ms = 10;
    config.repeat = cyre::Repeat::Times(0);
    engine.action(config).unwrap();
    let (handler, count) = counting_handler();
    engine.on("armed-only", handler);

    let response = engine.call("armed-only", None).await;
    assert!(response.ok);

    advance(Duration::from_millis(100)).await;
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn intra_link_chains_one_channel_into_another() {
    let engine = Engine::new(RuntimeConfig::default());
    engine.init();
    engine.action(ChannelConfig::new("source")).unwrap();
    engine.action(ChannelConfig::new("target")).unwrap();

    engine.on(
        "source",
        Arc::new(FnHandler::new(|payload: Value| {
            Box::pin(async move {
                HandlerOutcome::Link(IntraLink {
                    id: "target".to_string(),
                    payload,
                })
            })
        })),
    );
    let (handler, count) = counting_handler();
    engine.on("target", handler);

    let response = engine.call("source", Some(json!({"hop": true}))).await;
    assert!(response.ok);
    assert_eq!(count.load(Ordering::SeqCst), 1);
    let chained = response
        .metadata
        .expect("chain metadata")
        .chain_result
        .expect("chain result");
    assert!(chained.ok);
    assert_eq!(chained.payload, json!({"hop": true}));
}

#[tokio::test(start_paused = true)]
async fn sustained_high_call_rate_triggers_recuperation_gate() {
    // Weighting stress fusion entirely on call-rate makes the transition
    // deterministic without depending on real CPU/memory load.
    let mut runtime = RuntimeConfig::default();
    runtime.stress_weights = cyre::config::StressWeights {
        cpu: 0.0,
        memory: 0.0,
        event_loop: 0.0,
        call_rate: 1.0,
    };
    runtime.call_rate_max = 1.0;
    runtime.base_rate_ms = 15;
    runtime.min_rate_ms = 10;
    runtime.max_rate_ms = 50;

    let engine = Engine::new(runtime);
    engine.init();
    let mut config = ChannelConfig::new("busy");
    config.priority = Priority::Medium;
    engine.action(config).unwrap();
    let (handler, _count) = counting_handler();
    engine.on("busy", handler);

    for n in 0..80 {
        let _ = engine.call("busy", Some(json!(n))).await;
    }

    advance(Duration::from_millis(200)).await;
    assert!(
        engine.breathing_state().is_recuperating,
        "sustained call rate should drive the system into recuperation"
    );

    let response = engine.call("busy", Some(json!("late"))).await;
    assert!(!response.ok, "medium-priority calls must be gated while recuperating");
}
