use crate::config::ChannelConfig;
use crate::pipeline::CompiledPipeline;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

/// Runtime scratch mutated only by the call engine / TimeKeeper (spec §3).
/// Split from `ChannelConfig` so re-registration can reset it without
/// touching the payload slot (the one piece of state re-registration
/// preserves).
///
/// Throttle/debounce timestamps ride `tokio::time::Instant`, the same clock
/// `TimeKeeper` schedules against, so `tokio::time::pause`/`advance` moves
/// them exactly as it moves formation due-times.
pub struct RuntimeScratch {
    pub last_exec_time: Mutex<Option<Instant>>,
    /// Toggled by `Engine::block`/`unblock` independently of the channel's
    /// static `config.block` — a runtime block survives until explicitly
    /// lifted, a config block until the next re-registration (spec §4.4
    /// step 3, §3 `_isBlocked`).
    pub is_blocked: AtomicBool,
    /// Id of the active debounce formation for this channel, if any.
    pub debounce_formation: Mutex<Option<u64>>,
    /// When the current debounce window was first armed — the `maxWait`
    /// baseline (spec §9, pinned semantics).
    pub debounce_start: Mutex<Option<Instant>>,
}

impl Default for RuntimeScratch {
    fn default() -> Self {
        RuntimeScratch {
            last_exec_time: Mutex::new(None),
            is_blocked: AtomicBool::new(false),
            debounce_formation: Mutex::new(None),
            debounce_start: Mutex::new(None),
        }
    }
}

/// A registered channel: config + compiled pipeline + runtime scratch
/// (spec §3). Re-registration replaces `config` and `compiled` and resets
/// `scratch`, but the owning `PayloadStore` entry survives independently.
pub struct Channel {
    pub config: ChannelConfig,
    pub compiled: CompiledPipeline,
    pub scratch: RuntimeScratch,
    /// Serializes dispatch for this id (invariant: at most one in-flight
    /// dispatch per id, spec §8 invariant 3).
    pub dispatch_lock: tokio::sync::Mutex<()>,
}

impl Channel {
    pub fn new(config: ChannelConfig) -> Self {
        let compiled = CompiledPipeline::compile(&config);
        Channel {
            config,
            compiled,
            scratch: RuntimeScratch::default(),
            dispatch_lock: tokio::sync::Mutex::new(()),
        }
    }
}

/// Mapping channel-id -> channel record (spec §4.1). Channels are stored
/// behind `Arc` so callers (the call engine, the TimeKeeper) can hold a
/// handle across an `.await` point without locking the whole map.
#[derive(Default)]
pub struct ChannelStore {
    channels: DashMap<String, Arc<Channel>>,
}

impl ChannelStore {
    pub fn new() -> Self {
        ChannelStore {
            channels: DashMap::new(),
        }
    }

    /// Registers or replaces a channel. Returns the previous compiled pipeline
    /// artifact count as a cheap signal of whether this was a fresh
    /// registration or a replace (used for batch-result bookkeeping).
    pub fn register(&self, config: ChannelConfig) -> Arc<Channel> {
        let channel = Arc::new(Channel::new(config));
        let id = channel.config.id.clone();
        self.channels.insert(id, channel.clone());
        channel
    }

    pub fn get(&self, id: &str) -> Option<Arc<Channel>> {
        self.channels.get(id).map(|r| r.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.channels.contains_key(id)
    }

    pub fn forget(&self, id: &str) -> bool {
        self.channels.remove(id).is_some()
    }

    pub fn clear(&self) {
        self.channels.clear();
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn ids(&self) -> Vec<String> {
        self.channels.iter().map(|r| r.key().clone()).collect()
    }
}

pub type SharedChannelStore = Arc<ChannelStore>;
