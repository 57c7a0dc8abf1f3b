use std::sync::atomic::{AtomicBool, Ordering};

/// Pre-computed booleans read without locks on every hot-path call (spec §3,
/// §4.6). Recomputed on init/lock/unlock/shutdown and on any breathing-tick
/// recuperation transition.
#[derive(Default)]
pub struct SystemFlags {
    pub initialized: AtomicBool,
    pub locked: AtomicBool,
    pub shutdown: AtomicBool,
    pub recuperating: AtomicBool,
}

impl SystemFlags {
    pub fn new() -> Self {
        SystemFlags::default()
    }

    /// `canCall`: the call path is open. Shutdown and an uninitialized system
    /// both reject; lock only blocks *registration*, not calls (spec §6 `lock()`).
    pub fn can_call(&self) -> bool {
        self.initialized.load(Ordering::Relaxed) && !self.shutdown.load(Ordering::Relaxed)
    }

    pub fn can_action(&self) -> bool {
        self.initialized.load(Ordering::Relaxed)
            && !self.shutdown.load(Ordering::Relaxed)
            && !self.locked.load(Ordering::Relaxed)
    }

    pub fn is_operational(&self) -> bool {
        self.initialized.load(Ordering::Relaxed) && !self.shutdown.load(Ordering::Relaxed)
    }

    /// Reason list behind a `can_call`/`can_action` rejection, used to build
    /// the Response message (spec §7 "messages come from the flag reason list").
    pub fn call_rejection_reason(&self) -> Option<&'static str> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Some("SYSTEM_SHUTDOWN");
        }
        if !self.initialized.load(Ordering::Relaxed) {
            return Some("SYSTEM_NOT_INITIALIZED");
        }
        None
    }

    pub fn action_rejection_reason(&self) -> Option<&'static str> {
        if let Some(reason) = self.call_rejection_reason() {
            return Some(reason);
        }
        if self.locked.load(Ordering::Relaxed) {
            return Some("SYSTEM_LOCKED");
        }
        None
    }
}
