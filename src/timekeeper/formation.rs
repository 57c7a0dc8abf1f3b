use crate::config::Repeat;
use tokio::time::Instant;

/// `kind` discriminates what a due formation means to the call engine (spec
/// §4.5). `Breath` is internal: it never surfaces through the public API, it
/// only exists so the breathing tick rides the same scheduler as everything
/// else instead of running its own timer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormationKind {
    Debounce,
    Delay,
    Interval,
    /// The first shot of a delay+interval combo; a plain `Interval`
    /// formation takes over for every tick after this one.
    Once,
    Breath,
}

/// A single scheduled wakeup (spec §3 `{id, kind, dueAt, everyMs?, remaining,
/// paused}`). `due_at` rides tokio's clock (not wall time) so the scheduler
/// is driven entirely by `tokio::time::sleep_until`, the same primitive
/// `pause`/`advance` control in tests. `paused_remaining` replaces the
/// spec's boolean `paused` flag with the stashed time-to-due needed to
/// rebase `due_at` on resume without firing immediately.
#[derive(Debug, Clone)]
pub struct Formation {
    pub id: u64,
    pub channel_id: String,
    pub kind: FormationKind,
    pub due_at: Instant,
    pub every_ms: Option<u64>,
    pub remaining: Repeat,
    pub paused_remaining: Option<std::time::Duration>,
}
