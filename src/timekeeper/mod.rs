mod formation;

pub use formation::{Formation, FormationKind};

use crate::breathing::{Breathing, Sampler};
use crate::config::Repeat;
use crate::flags::SystemFlags;
use crate::metrics::Sensor;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Callback the TimeKeeper fires into when a debounce/delay/interval
/// formation comes due. The engine implements this and re-enters the call
/// path at dispatch (spec §4.5 "re-enter the call engine at the dispatch
/// step, not a fresh call"). Kept as a trait object (not a bare closure) the
/// same way `aa-rs`/`keeper-rs`'s polling loop hands events to a handler
/// rather than owning the side effect itself.
#[async_trait]
pub trait FormationSink: Send + Sync {
    async fn on_formation_fired(&self, formation: Formation);
}

/// Single min-due-first scheduler for every timed behavior in the system:
/// debounce windows, delay/interval formations, and the self-rescheduling
/// breath timer (spec §4.5, §4.6). Modeled on `keeper-rs`'s
/// `tokio::time::sleep`-driven poll loop, generalized from "one fixed poll
/// interval" to "sleep until the next due formation, wake early on change".
///
/// Due times are `tokio::time::Instant`, not wall-clock timestamps — the
/// whole scheduler rides tokio's clock, so `tokio::time::pause`/`advance`
/// drive it deterministically in tests exactly as they drive a plain
/// `tokio::time::sleep`.
pub struct TimeKeeper {
    heap: Mutex<BinaryHeap<Reverse<(Instant, u64)>>>,
    formations: dashmap::DashMap<u64, Formation>,
    by_channel: dashmap::DashMap<String, Vec<u64>>,
    next_id: AtomicU64,
    notify: Notify,
    sink: OnceLock<Weak<dyn FormationSink>>,
    paused_global: AtomicBool,
    paused_channels: dashmap::DashSet<String>,
    running: AtomicBool,

    breathing: Arc<Breathing>,
    flags: Arc<SystemFlags>,
    sensor: Arc<Sensor>,
    sampler: Mutex<Sampler>,

    /// Reserved id for the breath formation; never handed out to callers.
    breath_formation_id: u64,
}

impl TimeKeeper {
    pub fn new(breathing: Arc<Breathing>, flags: Arc<SystemFlags>, sensor: Arc<Sensor>) -> Self {
        TimeKeeper {
            heap: Mutex::new(BinaryHeap::new()),
            formations: dashmap::DashMap::new(),
            by_channel: dashmap::DashMap::new(),
            next_id: AtomicU64::new(1),
            notify: Notify::new(),
            sink: OnceLock::new(),
            paused_global: AtomicBool::new(false),
            paused_channels: dashmap::DashSet::new(),
            running: AtomicBool::new(false),
            breathing,
            flags,
            sensor,
            sampler: Mutex::new(Sampler::new()),
            breath_formation_id: 0,
        }
    }

    /// Bound after the owning engine is constructed (the engine can't hand
    /// out `Arc<Self>` to the TimeKeeper during its own construction).
    pub fn bind_sink(&self, sink: Weak<dyn FormationSink>) {
        let _ = self.sink.set(sink);
    }

    fn next_formation_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn push_due(&self, id: u64, due_at: Instant) {
        self.heap.lock().push(Reverse((due_at, id)));
        self.notify.notify_one();
    }

    fn track_channel(&self, channel_id: &str, id: u64) {
        self.by_channel
            .entry(channel_id.to_string())
            .or_default()
            .push(id);
    }

    fn untrack_channel(&self, channel_id: &str, id: u64) {
        if let Some(mut ids) = self.by_channel.get_mut(channel_id) {
            ids.retain(|existing| *existing != id);
        }
    }

    /// Arms a single one-shot formation (debounce window, plain delay, or the
    /// initial shot of a delay+interval combo) due `delay_ms` from now.
    pub fn schedule_once(&self, channel_id: &str, kind: FormationKind, delay_ms: u64) -> u64 {
        let id = self.next_formation_id();
        let due_at = Instant::now() + Duration::from_millis(delay_ms);
        let formation = Formation {
            id,
            channel_id: channel_id.to_string(),
            kind,
            due_at,
            every_ms: None,
            remaining: Repeat::Times(1),
            paused_remaining: None,
        };
        self.formations.insert(id, formation);
        self.track_channel(channel_id, id);
        self.push_due(id, due_at);
        id
    }

    /// Arms a repeating interval chain. `first_delay_ms` lets the first tick
    /// either coincide with `every_ms` (plain interval) or land right after
    /// an initial delay shot already fired (delay+interval combo). The first
    /// wait is stress-stretched the same way every subsequent tick is (spec
    /// §8 invariant 7: "spaced `>= I*(1+stress)` each... first wait included
    /// when no delay").
    pub fn schedule_interval(
        &self,
        channel_id: &str,
        first_delay_ms: u64,
        every_ms: u64,
        remaining: Repeat,
    ) -> u64 {
        let id = self.next_formation_id();
        let stress = self.breathing.snapshot().stress;
        let effective_first_delay_ms = ((first_delay_ms as f64) * (1.0 + stress)) as u64;
        let due_at = Instant::now() + Duration::from_millis(effective_first_delay_ms.max(1));
        let formation = Formation {
            id,
            channel_id: channel_id.to_string(),
            kind: FormationKind::Interval,
            due_at,
            every_ms: Some(every_ms),
            remaining,
            paused_remaining: None,
        };
        self.formations.insert(id, formation);
        self.track_channel(channel_id, id);
        self.push_due(id, due_at);
        id
    }

    /// Cancels a single formation. Firing never observes a cancelled
    /// formation: the heap entry is left in place (lazy deletion) and
    /// skipped once popped.
    pub fn cancel(&self, formation_id: u64) -> Option<Formation> {
        let removed = self.formations.remove(&formation_id).map(|(_, f)| f);
        if let Some(formation) = &removed {
            self.untrack_channel(&formation.channel_id, formation_id);
        }
        removed
    }

    /// Removes every formation belonging to a channel — `forget(id)` per
    /// spec §4.5: callbacks for cancelled formations are never invoked.
    pub fn cancel_all_for_channel(&self, channel_id: &str) -> usize {
        let ids = self
            .by_channel
            .remove(channel_id)
            .map(|(_, ids)| ids)
            .unwrap_or_default();
        for id in &ids {
            self.formations.remove(id);
        }
        ids.len()
    }

    /// Removes every non-breath formation — used by `clear()` (spec §6).
    pub fn cancel_all(&self) {
        let ids: Vec<String> = self.by_channel.iter().map(|r| r.key().clone()).collect();
        for channel_id in ids {
            self.cancel_all_for_channel(&channel_id);
        }
    }

    pub fn active_formations_for(&self, channel_id: &str) -> Vec<Formation> {
        self.by_channel
            .get(channel_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.formations.get(id).map(|f| f.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Pauses globally (`channel_id = None`) or a single channel's
    /// formations, stashing remaining time-to-due so `resume` can rebase
    /// `due_at = now + remaining` rather than firing everything at once
    /// (spec §4.5).
    pub fn pause(&self, channel_id: Option<&str>) {
        match channel_id {
            None => self.paused_global.store(true, Ordering::Relaxed),
            Some(channel_id) => {
                self.paused_channels.insert(channel_id.to_string());
            }
        }
        let now = Instant::now();
        let ids: Vec<u64> = match channel_id {
            None => self.formations.iter().map(|r| *r.key()).collect(),
            Some(channel_id) => self
                .by_channel
                .get(channel_id)
                .map(|ids| ids.clone())
                .unwrap_or_default(),
        };
        for id in ids {
            if let Some(mut formation) = self.formations.get_mut(&id) {
                if formation.paused_remaining.is_none() {
                    formation.paused_remaining = Some(formation.due_at.saturating_duration_since(now));
                }
            }
        }
    }

    pub fn resume(&self, channel_id: Option<&str>) {
        match channel_id {
            None => self.paused_global.store(false, Ordering::Relaxed),
            Some(channel_id) => {
                self.paused_channels.remove(channel_id);
            }
        }
        let now = Instant::now();
        let ids: Vec<u64> = match channel_id {
            None => self.formations.iter().map(|r| *r.key()).collect(),
            Some(channel_id) => self
                .by_channel
                .get(channel_id)
                .map(|ids| ids.clone())
                .unwrap_or_default(),
        };
        for id in ids {
            if let Some(mut formation) = self.formations.get_mut(&id) {
                if let Some(remaining) = formation.paused_remaining.take() {
                    let new_due = now + remaining;
                    formation.due_at = new_due;
                    self.push_due(id, new_due);
                }
            }
        }
    }

    fn is_paused(&self, channel_id: &str) -> bool {
        self.paused_global.load(Ordering::Relaxed) || self.paused_channels.contains(channel_id)
    }

    /// Arms the self-rescheduling breath timer (spec §4.6, §4.5 "TimeKeeper
    /// also owns the breath timer"). Idempotent: calling it twice just
    /// re-arms at the current rate.
    pub fn arm_breath(&self) {
        let due_at = Instant::now() + Duration::from_millis(self.breathing.current_rate_ms());
        self.formations.insert(
            self.breath_formation_id,
            Formation {
                id: self.breath_formation_id,
                channel_id: String::new(),
                kind: FormationKind::Breath,
                due_at,
                every_ms: None,
                remaining: Repeat::Infinite,
                paused_remaining: None,
            },
        );
        self.push_due(self.breath_formation_id, due_at);
    }

    fn breath_tick(&self) {
        let call_rate = self.sensor.call_rate();
        let inputs = self.sampler.lock().sample(call_rate, 0.0);
        let transitioned = self.breathing.update(inputs);
        if transitioned {
            self.flags
                .recuperating
                .store(self.breathing.is_recuperating(), Ordering::Relaxed);
        }
        let next_due = Instant::now() + Duration::from_millis(self.breathing.current_rate_ms());
        self.formations
            .entry(self.breath_formation_id)
            .and_modify(|f| f.due_at = next_due);
        self.push_due(self.breath_formation_id, next_due);
    }

    /// Spawns the scheduler loop. Returns its `JoinHandle` so `shutdown()`
    /// can abort it (spec §6 `shutdown()` tears down the whole runtime).
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        self.running.store(true, Ordering::Relaxed);
        let this = self.clone();
        tokio::spawn(async move { this.run().await })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.notify.notify_one();
    }

    async fn run(self: Arc<Self>) {
        while self.running.load(Ordering::Relaxed) {
            let next = { self.heap.lock().peek().map(|Reverse((due, id))| (*due, *id)) };
            match next {
                None => {
                    self.notify.notified().await;
                }
                Some((due, id)) => {
                    let now = Instant::now();
                    if due > now {
                        tokio::select! {
                            _ = tokio::time::sleep_until(due) => {}
                            _ = self.notify.notified() => {}
                        }
                    } else {
                        self.heap.lock().pop();
                        self.fire(due, id).await;
                    }
                }
            }
        }
    }

    async fn fire(&self, popped_due: Instant, id: u64) {
        if id == self.breath_formation_id {
            let current = self.formations.get(&id).map(|f| f.due_at);
            if current != Some(popped_due) {
                return;
            }
            self.breath_tick();
            return;
        }

        let formation = match self.formations.get(&id) {
            Some(f) if f.due_at == popped_due => f.clone(),
            _ => return,
        };

        if self.is_paused(&formation.channel_id) {
            // Shouldn't normally happen (pause() rebases due_at far out), but
            // guards against a race between pause() and an in-flight fire.
            return;
        }

        match formation.kind {
            FormationKind::Debounce | FormationKind::Delay | FormationKind::Once => {
                self.formations.remove(&id);
                self.untrack_channel(&formation.channel_id, id);
            }
            FormationKind::Interval => {
                let mut remaining = formation.remaining;
                remaining.decrement();
                if remaining.is_exhausted() {
                    self.formations.remove(&id);
                    self.untrack_channel(&formation.channel_id, id);
                } else {
                    let every_ms = formation.every_ms.unwrap_or(0);
                    let stress = self.breathing.snapshot().stress;
                    let effective_ms = ((every_ms as f64) * (1.0 + stress)) as u64;
                    let next_due = Instant::now() + Duration::from_millis(effective_ms.max(1));
                    self.formations.entry(id).and_modify(|f| {
                        f.due_at = next_due;
                        f.remaining = remaining;
                    });
                    self.push_due(id, next_due);
                }
            }
            FormationKind::Breath => unreachable!("breath formation handled above"),
        }

        if let Some(sink) = self.sink.get().and_then(|weak| weak.upgrade()) {
            sink.on_formation_fired(formation).await;
        }
    }
}

pub type SharedTimeKeeper = Arc<TimeKeeper>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    fn test_timekeeper() -> Arc<TimeKeeper> {
        let breathing = Arc::new(Breathing::new(RuntimeConfig::default()));
        let flags = Arc::new(SystemFlags::new());
        let sensor = Arc::new(Sensor::new(16));
        Arc::new(TimeKeeper::new(breathing, flags, sensor))
    }

    #[test]
    fn schedule_once_registers_formation_for_channel() {
        let tk = test_timekeeper();
        let id = tk.schedule_once("c", FormationKind::Delay, 50);
        assert_eq!(tk.active_formations_for("c").len(), 1);
        assert_eq!(tk.active_formations_for("c")[0].id, id);
    }

    #[test]
    fn cancel_all_for_channel_removes_every_formation() {
        let tk = test_timekeeper();
        tk.schedule_once("c", FormationKind::Debounce, 50);
        tk.schedule_interval("c", 10, 10, Repeat::Times(3));
        assert_eq!(tk.cancel_all_for_channel("c"), 2);
        assert!(tk.active_formations_for("c").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pause_then_resume_rebases_due_at() {
        let tk = test_timekeeper();
        let id = tk.schedule_once("c", FormationKind::Delay, 1_000);
        tk.pause(Some("c"));
        let paused_due = tk.formations.get(&id).unwrap().due_at;
        tokio::time::advance(Duration::from_millis(5)).await;
        tk.resume(Some("c"));
        let resumed_due = tk.formations.get(&id).unwrap().due_at;
        assert!(resumed_due >= paused_due);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_formation_fires_after_advancing_past_due() {
        struct Counter(std::sync::atomic::AtomicUsize);
        #[async_trait]
        impl FormationSink for Counter {
            async fn on_formation_fired(&self, _formation: Formation) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let tk = test_timekeeper();
        let sink: Arc<Counter> = Arc::new(Counter(std::sync::atomic::AtomicUsize::new(0)));
        let weak: Weak<dyn FormationSink> = Arc::downgrade(&sink) as Weak<dyn FormationSink>;
        tk.bind_sink(weak);
        tk.schedule_once("c", FormationKind::Delay, 20);
        let handle = tk.start();

        tokio::time::advance(Duration::from_millis(25)).await;
        tokio::task::yield_now().await;

        assert_eq!(sink.0.load(Ordering::SeqCst), 1);
        tk.stop();
        handle.abort();
    }
}
