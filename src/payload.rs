use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Per-id `{req, res, prev}` payload slot (spec §3). `req` is the most-recent
/// input (read by debounced wakes), `res` the most recent handler return,
/// `prev` the baseline compared against for change-detection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PayloadSlot {
    pub req: Value,
    pub res: Value,
    pub prev: Value,
}

/// Owns every channel's payload slot. Kept independent of `ChannelStore` so
/// that re-registration can replace the channel record while preserving the
/// payload slot, per spec §4.1 ("preserves the payload slot").
#[derive(Default)]
pub struct PayloadStore {
    slots: DashMap<String, PayloadSlot>,
}

impl PayloadStore {
    pub fn new() -> Self {
        PayloadStore {
            slots: DashMap::new(),
        }
    }

    pub fn ensure(&self, id: &str) {
        self.slots.entry(id.to_string()).or_default();
    }

    pub fn remove(&self, id: &str) {
        self.slots.remove(id);
    }

    pub fn clear(&self) {
        self.slots.clear();
    }

    pub fn get(&self, id: &str) -> Option<PayloadSlot> {
        self.slots.get(id).map(|r| r.clone())
    }

    pub fn set_req(&self, id: &str, payload: Value) {
        self.slots.entry(id.to_string()).or_default().req = payload;
    }

    pub fn set_res(&self, id: &str, payload: Value) {
        self.slots.entry(id.to_string()).or_default().res = payload;
    }

    /// Structural-equality change detection against `prev` (spec §4.3 stage 4).
    /// Returns `true` when the payload differs (and therefore should dispatch),
    /// and always advances `prev` to the new payload as a side effect — mirrors
    /// the debounce "latest wins" read-then-arm pattern used elsewhere in the
    /// pipeline.
    pub fn has_changed_and_update(&self, id: &str, payload: &Value) -> bool {
        let mut slot = self.slots.entry(id.to_string()).or_default();
        let changed = slot.prev != *payload;
        slot.prev = payload.clone();
        changed
    }

    pub fn has_changed(&self, id: &str, payload: &Value) -> bool {
        self.slots
            .get(id)
            .map(|s| s.prev != *payload)
            .unwrap_or(true)
    }

    pub fn previous(&self, id: &str) -> Option<Value> {
        self.slots.get(id).map(|s| s.prev.clone())
    }

    pub fn update_payload(&self, id: &str, payload: Value) {
        let mut slot = self.slots.entry(id.to_string()).or_default();
        slot.prev = payload.clone();
        slot.req = payload;
    }

    pub fn snapshot(&self) -> std::collections::HashMap<String, PayloadSlot> {
        self.slots
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect()
    }

    pub fn restore(&self, data: std::collections::HashMap<String, PayloadSlot>) {
        self.slots.clear();
        for (k, v) in data {
            self.slots.insert(k, v);
        }
    }
}

pub type SharedPayloadStore = Arc<PayloadStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn change_detect_flags_first_call_as_changed() {
        let store = PayloadStore::new();
        assert!(store.has_changed_and_update("a", &json!({"v": 1})));
    }

    #[test]
    fn change_detect_dedupes_equal_payload() {
        let store = PayloadStore::new();
        assert!(store.has_changed_and_update("a", &json!({"v": 1})));
        assert!(!store.has_changed_and_update("a", &json!({"v": 1})));
        assert!(store.has_changed_and_update("a", &json!({"v": 2})));
    }

    #[test]
    fn reregistration_preserves_prev() {
        let store = PayloadStore::new();
        store.has_changed_and_update("a", &json!(1));
        store.ensure("a");
        assert_eq!(store.previous("a"), Some(json!(1)));
    }
}
