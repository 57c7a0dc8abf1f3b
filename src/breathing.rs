use crate::config::RuntimeConfig;
use crate::metrics::now_ms;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use sysinfo::System;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pattern {
    Normal,
    Elevated,
    Recovery,
}

/// Raw per-tick samples (spec §4.6). Kept as a plain struct so the fusion
/// itself (`fuse`) stays a pure function independent of how samples are
/// gathered — "Stress as side-effect of a timer" -> "pure function
/// `stress(inputs) -> (scalar, pattern)`" (spec §9).
#[derive(Debug, Clone, Copy, Default)]
pub struct StressInputs {
    pub cpu: f64,
    pub memory: f64,
    pub loop_lag_ms: f64,
    pub call_rate: f64,
}

/// `{breathCount, currentRate_ms, lastBreath, stress, isRecuperating,
/// recuperationDepth, pattern}` (spec §3). Mutated only by the breathing tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreathingSnapshot {
    pub breath_count: u64,
    pub current_rate_ms: u64,
    pub last_breath_ms: u64,
    pub stress: f64,
    pub is_recuperating: bool,
    pub recuperation_depth: f64,
    pub pattern: Pattern,
}

impl Default for BreathingSnapshot {
    fn default() -> Self {
        BreathingSnapshot {
            breath_count: 0,
            current_rate_ms: 0,
            last_breath_ms: 0,
            stress: 0.0,
            is_recuperating: false,
            recuperation_depth: 0.0,
            pattern: Pattern::Normal,
        }
    }
}

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// Pure stress fusion (spec §4.6):
/// `stress = clamp01(wCPU*cpu + wMem*mem + wLoop*min(loop/LOOP_MAX,1) + wRate*min(callRate/RATE_MAX,1))`.
pub fn fuse(inputs: StressInputs, cfg: &RuntimeConfig) -> (f64, Pattern) {
    let w = &cfg.stress_weights;
    let loop_term = (inputs.loop_lag_ms / cfg.loop_lag_max_ms.max(1) as f64).min(1.0);
    let rate_term = (inputs.call_rate / cfg.call_rate_max.max(1.0)).min(1.0);
    let stress = clamp01(
        w.cpu * clamp01(inputs.cpu)
            + w.memory * clamp01(inputs.memory)
            + w.event_loop * loop_term
            + w.call_rate * rate_term,
    );
    let t = &cfg.stress_thresholds;
    let pattern = if stress < t.low {
        Pattern::Normal
    } else if stress < t.high {
        Pattern::Elevated
    } else {
        Pattern::Recovery
    };
    (stress, pattern)
}

/// `currentRate = BASE_RATE * (1 + stress * RATE_SPAN)`, clamped (spec §4.6).
pub fn adapt_rate(stress: f64, cfg: &RuntimeConfig) -> u64 {
    let rate = cfg.base_rate_ms as f64 * (1.0 + stress * cfg.rate_span);
    rate.clamp(cfg.min_rate_ms as f64, cfg.max_rate_ms as f64) as u64
}

/// Samples CPU/memory from the OS via `sysinfo`, pairing with the sensor's
/// call rate and a caller-supplied event-loop-lag estimate. The teacher has
/// no analog for this; grounded in the pack's `sysinfo` usage (e.g.
/// `tor-memquota`) for real OS sampling rather than a stubbed constant.
pub struct Sampler {
    system: System,
}

impl Sampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Sampler { system }
    }

    pub fn sample(&mut self, call_rate: f64, loop_lag_ms: f64) -> StressInputs {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        let cpu = self.system.global_cpu_usage() as f64 / 100.0;
        let memory = if self.system.total_memory() > 0 {
            self.system.used_memory() as f64 / self.system.total_memory() as f64
        } else {
            0.0
        };
        StressInputs {
            cpu,
            memory,
            loop_lag_ms,
            call_rate,
        }
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the live `BreathingSnapshot`. `update()` is the entire breathing tick
/// body (spec §4.6): "the tick is just `update(read_samples())`".
pub struct Breathing {
    state: RwLock<BreathingSnapshot>,
    cfg: RuntimeConfig,
}

impl Breathing {
    pub fn new(cfg: RuntimeConfig) -> Self {
        let mut snapshot = BreathingSnapshot::default();
        snapshot.current_rate_ms = cfg.base_rate_ms;
        Breathing {
            state: RwLock::new(snapshot),
            cfg,
        }
    }

    /// Runs the fusion against `inputs`, advances the snapshot, and returns
    /// `true` iff this tick transitioned into or out of recuperation (the
    /// signal that system flags must be recomputed, spec §4.6).
    pub fn update(&self, inputs: StressInputs) -> bool {
        let (stress, pattern) = fuse(inputs, &self.cfg);
        let rate = adapt_rate(stress, &self.cfg);
        let mut state = self.state.write();
        let was_recuperating = state.is_recuperating;
        let is_recuperating = pattern == Pattern::Recovery;

        if is_recuperating {
            state.recuperation_depth = (state.recuperation_depth + 0.1).min(1.0);
        } else if stress < self.cfg.stress_thresholds.low {
            state.recuperation_depth = (state.recuperation_depth - 0.1).max(0.0);
        }

        state.breath_count += 1;
        state.current_rate_ms = rate;
        state.last_breath_ms = now_ms();
        state.stress = stress;
        state.is_recuperating = is_recuperating;
        state.pattern = pattern;

        was_recuperating != is_recuperating
    }

    pub fn snapshot(&self) -> BreathingSnapshot {
        self.state.read().clone()
    }

    pub fn current_rate_ms(&self) -> u64 {
        self.state.read().current_rate_ms
    }

    pub fn is_recuperating(&self) -> bool {
        self.state.read().is_recuperating
    }

    pub fn recuperation_depth(&self) -> f64 {
        self.state.read().recuperation_depth
    }
}

pub type SharedBreathing = Arc<Breathing>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_stress_is_normal_pattern() {
        let cfg = RuntimeConfig::default();
        let (stress, pattern) = fuse(
            StressInputs {
                cpu: 0.1,
                memory: 0.1,
                loop_lag_ms: 0.0,
                call_rate: 0.0,
            },
            &cfg,
        );
        assert!(stress < cfg.stress_thresholds.low);
        assert_eq!(pattern, Pattern::Normal);
    }

    #[test]
    fn saturated_inputs_enter_recovery() {
        let cfg = RuntimeConfig::default();
        let (stress, pattern) = fuse(
            StressInputs {
                cpu: 1.0,
                memory: 1.0,
                loop_lag_ms: 10_000.0,
                call_rate: 10_000.0,
            },
            &cfg,
        );
        assert!(stress >= cfg.stress_thresholds.high);
        assert_eq!(pattern, Pattern::Recovery);
    }

    #[test]
    fn adapt_rate_is_clamped() {
        let cfg = RuntimeConfig::default();
        assert_eq!(adapt_rate(0.0, &cfg), cfg.base_rate_ms.max(cfg.min_rate_ms));
        assert!(adapt_rate(1.0, &cfg) <= cfg.max_rate_ms);
    }

    #[test]
    fn update_reports_recuperation_transition() {
        let breathing = Breathing::new(RuntimeConfig::default());
        let transitioned = breathing.update(StressInputs {
            cpu: 1.0,
            memory: 1.0,
            loop_lag_ms: 10_000.0,
            call_rate: 10_000.0,
        });
        assert!(transitioned);
        assert!(breathing.is_recuperating());
    }
}
