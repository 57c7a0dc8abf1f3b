use crate::breathing::{Breathing, BreathingSnapshot};
use crate::channel::{Channel, ChannelStore, SharedChannelStore};
use crate::config::{ChannelConfig, RuntimeConfig};
use crate::dispatch::{run_channel, DispatchContext};
use crate::error::CyreError;
use crate::flags::SystemFlags;
use crate::metrics::{EventKind, GlobalCounters, IdCounters, Sensor, SharedSensor};
use crate::payload::{PayloadSlot, PayloadStore, SharedPayloadStore};
use crate::subscriber::{Handler, SubscriberStore};
use crate::timekeeper::{Formation, FormationKind, FormationSink, TimeKeeper};
use crate::types::{ExecutionPath, ItemResult, Metadata, Priority, Response};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Durable snapshot of the parts of engine state that survive a restart
/// (SPEC_FULL.md §B). Channel *configs* hold closures and so aren't
/// serializable; the snapshot restores payload state and metrics for ids the
/// caller re-registers, rather than attempting to resurrect handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub channel_ids: Vec<String>,
    pub payloads: std::collections::HashMap<String, PayloadSlot>,
    pub metrics: GlobalCounters,
}

/// The call engine: owns every store and runs the dispatch pipeline
/// described in spec §4.4. Constructed as an explicit value (spec §9 "Engine
/// as an explicit value") rather than ambient global state — `lib.rs`'s
/// façade holds exactly one behind a `OnceLock`, but nothing stops a caller
/// from building a second, fully independent one (useful in tests).
pub struct Engine {
    channels: SharedChannelStore,
    subscribers: Arc<SubscriberStore>,
    payloads: SharedPayloadStore,
    sensor: SharedSensor,
    breathing: Arc<Breathing>,
    flags: Arc<SystemFlags>,
    timekeeper: Arc<TimeKeeper>,
    runtime: RuntimeConfig,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(runtime: RuntimeConfig) -> Arc<Self> {
        if let Err(reason) = runtime.validate() {
            warn!(%reason, "runtime config failed validation, using defaults");
        }
        let breathing = Arc::new(Breathing::new(runtime));
        let flags = Arc::new(SystemFlags::new());
        let sensor = Arc::new(Sensor::new(runtime.metrics_capacity));

        Arc::new_cyclic(|weak: &Weak<Engine>| {
            let timekeeper = Arc::new(TimeKeeper::new(
                breathing.clone(),
                flags.clone(),
                sensor.clone(),
            ));
            let sink: Weak<dyn FormationSink> = weak.clone();
            timekeeper.bind_sink(sink);
            Engine {
                channels: Arc::new(ChannelStore::new()),
                subscribers: Arc::new(SubscriberStore::new()),
                payloads: Arc::new(PayloadStore::new()),
                sensor,
                breathing,
                flags,
                timekeeper,
                runtime,
                scheduler: Mutex::new(None),
            }
        })
    }

    fn ctx(&self) -> DispatchContext {
        DispatchContext {
            channels: self.channels.clone(),
            subscribers: self.subscribers.clone(),
            payloads: self.payloads.clone(),
            sensor: self.sensor.clone(),
            max_chain_depth: self.runtime.max_chain_depth,
        }
    }

    /// Boots the scheduler and marks the system callable (spec §6 `init()`).
    pub fn init(&self) {
        if self.flags.initialized.swap(true, Ordering::Relaxed) {
            return;
        }
        self.flags.shutdown.store(false, Ordering::Relaxed);
        let handle = self.timekeeper.start();
        self.timekeeper.arm_breath();
        *self.scheduler.lock() = Some(handle);
        info!("engine initialized");
    }

    /// Registers or replaces a single channel (spec §4.1, §6 `action()`).
    pub fn action(&self, config: ChannelConfig) -> Result<(), CyreError> {
        if !self.flags.can_action() {
            return Err(self.action_rejection());
        }
        config.validate()?;
        let id = config.id.clone();
        let replaced = self.channels.contains(&id);
        self.channels.register(config);
        self.payloads.ensure(&id);
        if replaced {
            warn!(channel = %id, "re-registered channel, runtime scratch reset");
        }
        Ok(())
    }

    /// Batch registration (spec §4.1): the wire contract is `{ok:
    /// anySucceeded, message, payload: perItemResults}`, not a bare array —
    /// callers can check `.ok` without re-deriving it from the item list.
    pub fn action_batch(&self, configs: Vec<ChannelConfig>) -> Response {
        let results: Vec<ItemResult> = configs
            .into_iter()
            .map(|config| {
                let id = config.id.clone();
                match self.action(config) {
                    Ok(()) => ItemResult {
                        id,
                        ok: true,
                        message: "registered".into(),
                    },
                    Err(err) => ItemResult {
                        id,
                        ok: false,
                        message: err.code().to_string(),
                    },
                }
            })
            .collect();
        let any_ok = results.iter().any(|r| r.ok);
        let payload = serde_json::to_value(&results).unwrap_or(Value::Null);
        Response {
            ok: any_ok,
            payload,
            message: if any_ok {
                "batch processed".into()
            } else {
                "batch failed".into()
            },
            error: None,
            metadata: None,
        }
    }

    fn action_rejection(&self) -> CyreError {
        match self.flags.action_rejection_reason() {
            Some("SYSTEM_LOCKED") => CyreError::SystemLocked,
            Some("SYSTEM_SHUTDOWN") => CyreError::Shutdown,
            _ => CyreError::NotInitialized,
        }
    }

    /// Subscribes a handler to a channel id (spec §4.2, §6 `on()`). A second
    /// subscribe to the same id replaces the first, with a warning (spec §9).
    pub fn on(&self, id: impl Into<String>, handler: Arc<dyn Handler>) -> bool {
        let id = id.into();
        let replaced = self.subscribers.subscribe(id.clone(), handler);
        if replaced {
            warn!(channel = %id, "handler replaced");
        }
        replaced
    }

    pub fn on_batch(&self, pairs: Vec<(String, Arc<dyn Handler>)>) -> Vec<ItemResult> {
        pairs
            .into_iter()
            .map(|(id, handler)| {
                let replaced = self.subscribers.subscribe(id.clone(), handler);
                ItemResult {
                    id,
                    ok: true,
                    message: if replaced { "replaced".into() } else { "subscribed".into() },
                }
            })
            .collect()
    }

    pub fn forget(&self, id: &str) -> bool {
        self.timekeeper.cancel_all_for_channel(id);
        self.subscribers.forget(id);
        self.payloads.remove(id);
        self.channels.forget(id)
    }

    pub fn clear(&self) {
        self.timekeeper.cancel_all();
        self.channels.clear();
        self.subscribers.clear();
        self.payloads.clear();
        self.sensor.clear();
    }

    pub fn pause(&self, id: Option<&str>) {
        self.timekeeper.pause(id);
    }

    pub fn resume(&self, id: Option<&str>) {
        self.timekeeper.resume(id);
    }

    /// Blocks a channel at runtime, independent of its static
    /// `config.block` (spec §3 `_isBlocked`, §4.4 step 3). Lifted only by
    /// `unblock`, not by re-registration.
    pub fn block(&self, id: &str) -> bool {
        let Some(channel) = self.channels.get(id) else {
            return false;
        };
        channel.scratch.is_blocked.store(true, Ordering::Relaxed);
        true
    }

    pub fn unblock(&self, id: &str) -> bool {
        let Some(channel) = self.channels.get(id) else {
            return false;
        };
        channel.scratch.is_blocked.store(false, Ordering::Relaxed);
        true
    }

    pub fn lock(&self) {
        self.flags.locked.store(true, Ordering::Relaxed);
    }

    pub fn unlock(&self) {
        self.flags.locked.store(false, Ordering::Relaxed);
    }

    /// Tears the runtime down: no more calls are accepted and the scheduler
    /// task is stopped (spec §6 `shutdown()`). Mirrors `keeper-rs`'s clean
    /// shutdown of its polling task on SIGTERM.
    pub fn shutdown(&self) {
        self.flags.shutdown.store(true, Ordering::Relaxed);
        self.timekeeper.stop();
        if let Some(handle) = self.scheduler.lock().take() {
            handle.abort();
        }
        info!("engine shut down");
    }

    pub fn get(&self, id: &str) -> Option<Arc<Channel>> {
        self.channels.get(id)
    }

    pub fn has_changed(&self, id: &str, payload: &Value) -> bool {
        self.payloads.has_changed(id, payload)
    }

    pub fn get_previous(&self, id: &str) -> Option<Value> {
        self.payloads.previous(id)
    }

    pub fn update_payload(&self, id: &str, payload: Value) {
        self.payloads.update_payload(id, payload);
    }

    pub fn breathing_state(&self) -> BreathingSnapshot {
        self.breathing.snapshot()
    }

    pub fn performance_state(&self) -> GlobalCounters {
        self.sensor.global_snapshot()
    }

    pub fn metrics_for(&self, id: &str) -> Option<IdCounters> {
        self.sensor.counters_for(id)
    }

    /// The call engine (spec §4.4), executed in fixed order: system flags,
    /// channel lookup, block flag, recuperation gate, throttle, debounce,
    /// timer-path fork, immediate dispatch.
    pub async fn call(&self, id: &str, payload: Option<Value>) -> Response {
        if !self.flags.can_call() {
            let reason = self.flags.call_rejection_reason().unwrap_or("SYSTEM_NOT_INITIALIZED");
            return Response::err(reason);
        }

        let Some(channel) = self.channels.get(id) else {
            return Response::err(CyreError::ChannelNotFound(id.to_string()).code());
        };

        self.sensor.record(id, EventKind::Call, None);

        if channel.config.block || channel.scratch.is_blocked.load(Ordering::Relaxed) {
            self.sensor.record(id, EventKind::Blocked, None);
            return Response::err(CyreError::Blocked(id.to_string()).code());
        }

        if self.flags.recuperating.load(Ordering::Relaxed) && channel.config.priority != Priority::Critical {
            return Response::err(CyreError::Recuperating.code());
        }

        let payload = payload.unwrap_or_else(|| channel.config.payload.clone());
        self.payloads.set_req(id, payload.clone());

        if channel.config.throttle_ms > 0 {
            let last = *channel.scratch.last_exec_time.lock();
            if let Some(last) = last {
                let elapsed = tokio::time::Instant::now()
                    .saturating_duration_since(last)
                    .as_millis() as u64;
                if elapsed < channel.config.throttle_ms {
                    self.sensor.record(id, EventKind::Throttled, None);
                    return Response::err(CyreError::Throttled {
                        remaining_ms: channel.config.throttle_ms - elapsed,
                    }.code())
                    .with_metadata(Metadata {
                        throttled: Some(true),
                        remaining: Some(channel.config.throttle_ms - elapsed),
                        ..Default::default()
                    });
                }
            }
        }

        if channel.config.debounce_ms > 0 {
            return self.arm_debounce(id, &channel, payload);
        }

        if channel.config.has_timer_path() {
            return self.arm_timer(id, &channel, payload);
        }

        run_channel(&self.ctx(), &channel, payload).await
    }

    /// Debounce arming (spec §4.4 step 6, §9 pinned semantics): `maxWait` is
    /// relative to the first call in the *current* arming window, not reset
    /// on every re-call.
    fn arm_debounce(&self, id: &str, channel: &Arc<Channel>, payload: Value) -> Response {
        let mut active = channel.scratch.debounce_formation.lock();
        let now = tokio::time::Instant::now();

        if let Some(existing) = *active {
            self.timekeeper.cancel(existing);
            let started = *channel.scratch.debounce_start.lock();
            let max_wait = channel.config.max_wait_ms;
            let elapsed_ms = started
                .map(|started| now.saturating_duration_since(started).as_millis() as u64)
                .unwrap_or(0);
            if max_wait > 0 && elapsed_ms >= max_wait {
                *active = None;
                self.sensor.record(id, EventKind::Debounced, Some("max-wait-fired".into()));
                let engine_payload = payload;
                let ctx = self.ctx();
                let channel = channel.clone();
                tokio::spawn(async move {
                    run_channel(&ctx, &channel, engine_payload).await;
                });
                return Response::ok(Value::Null, "debounced").with_metadata(Metadata {
                    debounced: Some(true),
                    execution_path: Some(ExecutionPath::DebounceDelayed),
                    ..Default::default()
                });
            }
        } else {
            *channel.scratch.debounce_start.lock() = Some(now);
        }

        let new_id = self
            .timekeeper
            .schedule_once(id, FormationKind::Debounce, channel.config.debounce_ms);
        *active = Some(new_id);
        self.sensor.record(id, EventKind::Debounced, None);
        Response::ok(Value::Null, "debounced").with_metadata(Metadata {
            debounced: Some(true),
            delay: Some(channel.config.debounce_ms),
            execution_path: Some(ExecutionPath::DebounceDelayed),
            ..Default::default()
        })
    }

    /// Delay/interval/repeat registration (spec §4.4 step 7, §3 `repeat`
    /// semantics): `repeat=0` is registration-only and never schedules.
    ///
    /// `delay_ms` is `Option<u64>` precisely so `None` ("no delay
    /// configured") and `Some(0)` ("delay explicitly set to zero") stay
    /// distinguishable: the first means "wait one full interval before the
    /// first execution", the second means "execute now, then continue at
    /// `interval`" (spec §4.4 step 7 edge cases).
    fn arm_timer(&self, id: &str, channel: &Arc<Channel>, payload: Value) -> Response {
        if channel.config.repeat.is_zero() {
            return Response::ok(Value::Null, "registered").with_metadata(Metadata {
                execution_path: Some(ExecutionPath::Timer),
                ..Default::default()
            });
        }

        let interval_ms = channel.config.interval_ms;
        let delay_ms = match channel.config.delay_ms {
            Some(delay) => {
                if delay == 0 {
                    let ctx = self.ctx();
                    let channel_for_run = channel.clone();
                    tokio::spawn(async move {
                        run_channel(&ctx, &channel_for_run, payload).await;
                    });
                    if interval_ms > 0 {
                        let mut remaining = channel.config.repeat;
                        remaining.decrement();
                        if !remaining.is_exhausted() {
                            self.timekeeper
                                .schedule_interval(id, interval_ms, interval_ms, remaining);
                        }
                    }
                } else if interval_ms > 0 {
                    self.timekeeper.schedule_once(id, FormationKind::Once, delay);
                } else {
                    self.timekeeper.schedule_once(id, FormationKind::Delay, delay);
                }
                delay
            }
            None => {
                // interval>0 with no delay configured: first execution waits
                // one full interval, handled entirely by `schedule_interval`.
                self.timekeeper
                    .schedule_interval(id, interval_ms, interval_ms, channel.config.repeat);
                0
            }
        };

        Response::ok(Value::Null, "scheduled").with_metadata(Metadata {
            delay: Some(delay_ms),
            execution_path: Some(ExecutionPath::Timer),
            ..Default::default()
        })
    }

    /// Atomic temp-file + rename, mirroring `KeeperState::save` — never leave
    /// a half-written snapshot on disk for a concurrent reader to observe.
    pub fn snapshot(&self, path: impl AsRef<Path>) -> Result<(), CyreError> {
        let snapshot = EngineSnapshot {
            channel_ids: self.channels.ids(),
            payloads: self.payloads.snapshot(),
            metrics: self.sensor.global_snapshot(),
        };
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        let body = serde_json::to_vec_pretty(&snapshot).map_err(|e| CyreError::Snapshot(e.to_string()))?;
        fs::write(&tmp, body).map_err(|e| CyreError::Snapshot(e.to_string()))?;
        fs::rename(&tmp, path).map_err(|e| CyreError::Snapshot(e.to_string()))?;
        Ok(())
    }

    pub fn restore_snapshot(&self, path: impl AsRef<Path>) -> Result<(), CyreError> {
        let body = match fs::read(path.as_ref()) {
            Ok(body) => body,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(CyreError::Snapshot(e.to_string())),
        };
        let snapshot: EngineSnapshot =
            serde_json::from_slice(&body).map_err(|e| CyreError::Snapshot(e.to_string()))?;
        self.payloads.restore(snapshot.payloads);
        Ok(())
    }
}

#[async_trait]
impl FormationSink for Engine {
    /// Re-enters the call path at dispatch for a due debounce/delay/interval
    /// formation (spec §4.5). `Once` formations additionally arm the
    /// follow-up `Interval` chain for a delay+interval combo.
    async fn on_formation_fired(&self, formation: Formation) {
        let Some(channel) = self.channels.get(&formation.channel_id) else {
            return;
        };
        let payload = self
            .payloads
            .get(&formation.channel_id)
            .map(|slot| slot.req)
            .unwrap_or_else(|| channel.config.payload.clone());

        match formation.kind {
            FormationKind::Debounce => {
                *channel.scratch.debounce_formation.lock() = None;
                run_channel(&self.ctx(), &channel, payload).await;
            }
            FormationKind::Delay | FormationKind::Interval => {
                run_channel(&self.ctx(), &channel, payload).await;
            }
            FormationKind::Once => {
                run_channel(&self.ctx(), &channel, payload).await;
                let remaining = {
                    let mut r = channel.config.repeat;
                    r.decrement();
                    r
                };
                if channel.config.interval_ms > 0 && !remaining.is_exhausted() {
                    self.timekeeper.schedule_interval(
                        &formation.channel_id,
                        channel.config.interval_ms,
                        channel.config.interval_ms,
                        remaining,
                    );
                }
            }
            FormationKind::Breath => unreachable!("breath formations never reach the sink"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber::FnHandler;
    use crate::types::HandlerOutcome;
    use serde_json::json;

    fn counting_handler() -> (Arc<dyn Handler>, Arc<std::sync::atomic::AtomicUsize>) {
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counted = count.clone();
        let handler = Arc::new(FnHandler::new(move |p| {
            let counted = counted.clone();
            Box::pin(async move {
                counted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                HandlerOutcome::Result(p)
            })
        }));
        (handler, count)
    }

    #[test]
    fn action_batch_envelopes_per_item_results() {
        let engine = Engine::new(RuntimeConfig::default());
        let response = engine.action_batch(vec![
            ChannelConfig::new("ok-one"),
            ChannelConfig::new(""),
        ]);
        assert!(response.ok, "at least one registration succeeded");
        let items: Vec<ItemResult> = serde_json::from_value(response.payload).unwrap();
        assert_eq!(items.len(), 2);
        assert!(items[0].ok);
        assert!(!items[1].ok);
    }

    #[test]
    fn action_batch_reports_not_ok_when_every_item_fails() {
        let engine = Engine::new(RuntimeConfig::default());
        let response = engine.action_batch(vec![ChannelConfig::new(""), ChannelConfig::new("")]);
        assert!(!response.ok);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_zero_executes_immediately_then_continues_at_interval() {
        let engine = Engine::new(RuntimeConfig::default());
        engine.init();
        let mut config = ChannelConfig::new("warm-start");
        config.delay_ms = Some(0);
        config.interval_ms = 20;
        config.repeat = crate::config::Repeat::Times(2);
        engine.action(config).unwrap();
        let (handler, count) = counting_handler();
        engine.on("warm-start", handler);

        let response = engine.call("warm-start", Some(json!(1))).await;
        assert!(response.ok);
        tokio::task::yield_now().await;
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1, "delay=0 executes now");

        for _ in 0..25 {
            tokio::time::advance(std::time::Duration::from_millis(1)).await;
            tokio::task::yield_now().await;
        }
        assert_eq!(
            count.load(std::sync::atomic::Ordering::SeqCst),
            2,
            "remaining repeat fires once more at `interval`"
        );
    }

    #[tokio::test]
    async fn on_warns_but_still_replaces_the_prior_handler() {
        let engine = Engine::new(RuntimeConfig::default());
        engine.action(ChannelConfig::new("echo")).unwrap();
        let (first, first_count) = counting_handler();
        let (second, second_count) = counting_handler();
        assert!(!engine.on("echo", first));
        assert!(engine.on("echo", second));
        engine.init();

        let _ = engine.call("echo", Some(json!(1))).await;
        assert_eq!(first_count.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(second_count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn block_rejects_calls_until_unblocked() {
        let engine = Engine::new(RuntimeConfig::default());
        engine.init();
        engine.action(ChannelConfig::new("gate")).unwrap();
        let (handler, count) = counting_handler();
        engine.on("gate", handler);

        assert!(engine.block("gate"));
        let blocked = engine.call("gate", Some(json!(1))).await;
        assert!(!blocked.ok);
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 0);

        assert!(engine.unblock("gate"));
        let admitted = engine.call("gate", Some(json!(1))).await;
        assert!(admitted.ok);
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_window_advances_with_the_paused_clock() {
        let engine = Engine::new(RuntimeConfig::default());
        engine.init();
        let mut config = ChannelConfig::new("throttled");
        config.throttle_ms = 30;
        engine.action(config).unwrap();
        let (handler, count) = counting_handler();
        engine.on("throttled", handler);

        assert!(engine.call("throttled", Some(json!(1))).await.ok);
        assert!(!engine.call("throttled", Some(json!(2))).await.ok);

        tokio::time::advance(std::time::Duration::from_millis(40)).await;
        assert!(engine.call("throttled", Some(json!(3))).await.ok);
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
