use crate::error::CyreError;
use crate::types::Priority;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// `repeat`: non-negative integer, or infinite. `repeat=0` forbids execution
/// (registration only); `repeat=1` fires exactly once (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Repeat {
    Times(u64),
    Infinite,
}

impl Default for Repeat {
    fn default() -> Self {
        Repeat::Times(1)
    }
}

impl Repeat {
    pub fn is_zero(&self) -> bool {
        matches!(self, Repeat::Times(0))
    }

    pub fn decrement(&mut self) {
        if let Repeat::Times(n) = self {
            *n = n.saturating_sub(1);
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Repeat::Times(0))
    }
}

pub type Validator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;
pub type Condition = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
pub type Transform = Arc<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>;

/// Declarative per-channel configuration (spec §3). This is the table-driven
/// replacement for "config as an open bag of fields" (spec §9): every field
/// recognized by the façade (§6) has an explicit slot here, validated by
/// `validate()` before a channel is ever compiled.
#[derive(Clone)]
pub struct ChannelConfig {
    pub id: String,
    pub path: Option<String>,
    pub payload: Value,

    pub throttle_ms: u64,
    pub debounce_ms: u64,
    pub max_wait_ms: u64,
    pub detect_changes: bool,

    pub schema: Option<Validator>,
    pub condition: Option<Condition>,
    pub transform: Option<Transform>,

    pub delay_ms: Option<u64>,
    pub interval_ms: u64,
    pub repeat: Repeat,

    pub priority: Priority,
    pub log: bool,
    pub block: bool,
}

impl std::fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("throttle_ms", &self.throttle_ms)
            .field("debounce_ms", &self.debounce_ms)
            .field("max_wait_ms", &self.max_wait_ms)
            .field("detect_changes", &self.detect_changes)
            .field("has_schema", &self.schema.is_some())
            .field("has_condition", &self.condition.is_some())
            .field("has_transform", &self.transform.is_some())
            .field("delay_ms", &self.delay_ms)
            .field("interval_ms", &self.interval_ms)
            .field("repeat", &self.repeat)
            .field("priority", &self.priority)
            .field("log", &self.log)
            .field("block", &self.block)
            .finish()
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            id: String::new(),
            path: None,
            payload: Value::Null,
            throttle_ms: 0,
            debounce_ms: 0,
            max_wait_ms: 0,
            detect_changes: false,
            schema: None,
            condition: None,
            transform: None,
            delay_ms: None,
            interval_ms: 0,
            repeat: Repeat::Times(1),
            priority: Priority::Medium,
            log: false,
            block: false,
        }
    }
}

impl ChannelConfig {
    pub fn new(id: impl Into<String>) -> Self {
        ChannelConfig {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Table-driven validation against the data-definition table in spec §4.1:
    /// non-empty id, and throttle/debounce mutual exclusion is the only fatal
    /// combination named by the spec.
    pub fn validate(&self) -> Result<(), CyreError> {
        if self.id.trim().is_empty() {
            return Err(CyreError::InvalidId);
        }
        if self.throttle_ms > 0 && self.debounce_ms > 0 {
            return Err(CyreError::ConflictingProtections(self.id.clone()));
        }
        Ok(())
    }

    /// True when none of the four pipeline-stage protections (§4.3) are
    /// configured — the compiler takes this straight to `isFastPath`.
    pub fn has_pipeline_stages(&self) -> bool {
        self.schema.is_some()
            || self.condition.is_some()
            || self.transform.is_some()
            || self.detect_changes
    }

    pub fn has_timer_path(&self) -> bool {
        self.delay_ms.is_some() || self.interval_ms > 0 || matches!(self.repeat, Repeat::Infinite)
            || matches!(self.repeat, Repeat::Times(n) if n > 1)
    }
}

/// Process-wide tunables (SPEC_FULL.md §A). Stress fusion weights/thresholds
/// are deliberately exposed here rather than hard-coded, per spec §9 Open
/// Questions ("treat them as tunables with the defaults above").
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StressWeights {
    pub cpu: f64,
    pub memory: f64,
    pub event_loop: f64,
    pub call_rate: f64,
}

impl Default for StressWeights {
    fn default() -> Self {
        StressWeights {
            cpu: 0.3,
            memory: 0.3,
            event_loop: 0.25,
            call_rate: 0.15,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StressThresholds {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
}

impl Default for StressThresholds {
    fn default() -> Self {
        StressThresholds {
            low: 0.5,
            medium: 0.75,
            high: 0.9,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub stress_weights: StressWeights,
    pub stress_thresholds: StressThresholds,

    /// Base breathing-tick interval, before stress stretching (spec §4.6).
    pub base_rate_ms: u64,
    pub min_rate_ms: u64,
    pub max_rate_ms: u64,
    /// `currentRate = BASE_RATE * (1 + stress * RATE_SPAN)`.
    pub rate_span: f64,

    /// Event-loop-lag and call-rate normalization caps used by the fusion (§4.6).
    pub loop_lag_max_ms: u64,
    pub call_rate_max: f64,

    /// Ring-buffer capacity for the metrics/sensor log (§4.8).
    pub metrics_capacity: usize,

    /// Chain-link trampoline bound (§4.7, §9).
    pub max_chain_depth: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            stress_weights: StressWeights::default(),
            stress_thresholds: StressThresholds::default(),
            base_rate_ms: 200,
            min_rate_ms: 50,
            max_rate_ms: 2_000,
            rate_span: 4.0,
            loop_lag_max_ms: 200,
            call_rate_max: 200.0,
            metrics_capacity: 4096,
            max_chain_depth: 20,
        }
    }
}

impl RuntimeConfig {
    /// Clamp+warn validation, mirroring the teacher's
    /// `KeeperConfig::from_cli_and_deployment` posture (base<=max, nonzero caps).
    pub fn validate(&self) -> Result<(), String> {
        let w = &self.stress_weights;
        let sum = w.cpu + w.memory + w.event_loop + w.call_rate;
        if (sum - 1.0).abs() > 0.01 {
            return Err(format!("stress weights must sum to ~1.0, got {sum}"));
        }
        let t = &self.stress_thresholds;
        if !(t.low < t.medium && t.medium < t.high) {
            return Err("stress thresholds must be strictly increasing (low < medium < high)".into());
        }
        if self.min_rate_ms == 0 || self.min_rate_ms > self.max_rate_ms {
            return Err("min_rate_ms must be > 0 and <= max_rate_ms".into());
        }
        if self.metrics_capacity == 0 {
            return Err("metrics_capacity must be > 0".into());
        }
        Ok(())
    }
}
