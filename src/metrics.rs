use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Call,
    Execution,
    Error,
    Throttled,
    Debounced,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub ts_ms: u64,
    pub id: String,
    pub kind: EventKind,
    pub meta: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdCounters {
    pub calls: u64,
    pub executions: u64,
    pub errors: u64,
    pub last_call_ms: u64,
    pub last_execution_ms: u64,
}

/// Ring buffer (oldest evicted) plus per-id and global counters, feeding both
/// `get_metrics()` and the breathing loop's call-rate input (spec §4.8).
/// Modeled on `collector.rs`'s `AtomicStats`/`CollectStats` split: atomics on
/// the hot path, an owned snapshot struct on read.
pub struct Sensor {
    capacity: usize,
    ring: Mutex<VecDeque<EventRecord>>,
    per_id: DashMap<String, IdCounters>,
    total_calls: AtomicU64,
    total_executions: AtomicU64,
    total_errors: AtomicU64,
    start_ms: u64,
}

impl Sensor {
    pub fn new(capacity: usize) -> Self {
        Sensor {
            capacity: capacity.max(1),
            ring: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            per_id: DashMap::new(),
            total_calls: AtomicU64::new(0),
            total_executions: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            start_ms: now_ms(),
        }
    }

    pub fn record(&self, id: &str, kind: EventKind, meta: Option<String>) {
        let ts_ms = now_ms();
        {
            let mut ring = self.ring.lock();
            if ring.len() == self.capacity {
                ring.pop_front();
            }
            ring.push_back(EventRecord {
                ts_ms,
                id: id.to_string(),
                kind,
                meta,
            });
        }

        let mut counters = self.per_id.entry(id.to_string()).or_default();
        match kind {
            EventKind::Call => {
                counters.calls += 1;
                counters.last_call_ms = ts_ms;
                self.total_calls.fetch_add(1, Ordering::Relaxed);
            }
            EventKind::Execution => {
                counters.executions += 1;
                counters.last_execution_ms = ts_ms;
                self.total_executions.fetch_add(1, Ordering::Relaxed);
            }
            EventKind::Error => {
                counters.errors += 1;
                self.total_errors.fetch_add(1, Ordering::Relaxed);
            }
            EventKind::Throttled | EventKind::Debounced | EventKind::Blocked => {}
        }
    }

    /// Executions-per-second over the sensor's lifetime; feeds the breathing
    /// fusion's `callRate` term (spec §4.6, §4.8).
    pub fn call_rate(&self) -> f64 {
        let elapsed_s = ((now_ms().saturating_sub(self.start_ms)) as f64 / 1000.0).max(1.0);
        self.total_calls.load(Ordering::Relaxed) as f64 / elapsed_s
    }

    pub fn counters_for(&self, id: &str) -> Option<IdCounters> {
        self.per_id.get(id).map(|r| r.clone())
    }

    /// Filtered export per spec §4.8: `{id?, kind?, since?, limit?}`.
    pub fn export(
        &self,
        id: Option<&str>,
        kind: Option<EventKind>,
        since_ms: Option<u64>,
        limit: Option<usize>,
    ) -> Vec<EventRecord> {
        let ring = self.ring.lock();
        let mut out: Vec<EventRecord> = ring
            .iter()
            .filter(|r| id.map(|i| r.id == i).unwrap_or(true))
            .filter(|r| kind.map(|k| r.kind == k).unwrap_or(true))
            .filter(|r| since_ms.map(|s| r.ts_ms >= s).unwrap_or(true))
            .cloned()
            .collect();
        if let Some(limit) = limit {
            let len = out.len();
            if len > limit {
                out.drain(0..len - limit);
            }
        }
        out
    }

    pub fn global_snapshot(&self) -> GlobalCounters {
        GlobalCounters {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_executions: self.total_executions.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            call_rate: self.call_rate(),
            start_ms: self.start_ms,
        }
    }

    pub fn clear(&self) {
        self.ring.lock().clear();
        self.per_id.clear();
        self.total_calls.store(0, Ordering::Relaxed);
        self.total_executions.store(0, Ordering::Relaxed);
        self.total_errors.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalCounters {
    pub total_calls: u64,
    pub total_executions: u64,
    pub total_errors: u64,
    pub call_rate: f64,
    pub start_ms: u64,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub type SharedSensor = Arc<Sensor>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_evicts_oldest() {
        let sensor = Sensor::new(2);
        sensor.record("a", EventKind::Call, None);
        sensor.record("b", EventKind::Call, None);
        sensor.record("c", EventKind::Call, None);
        let all = sensor.export(None, None, None, None);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "b");
        assert_eq!(all[1].id, "c");
    }

    #[test]
    fn per_id_counters_increment() {
        let sensor = Sensor::new(16);
        sensor.record("a", EventKind::Call, None);
        sensor.record("a", EventKind::Execution, None);
        sensor.record("a", EventKind::Error, None);
        let c = sensor.counters_for("a").unwrap();
        assert_eq!(c.calls, 1);
        assert_eq!(c.executions, 1);
        assert_eq!(c.errors, 1);
    }
}
