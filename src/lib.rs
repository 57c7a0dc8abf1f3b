//! In-process reactive event manager: channels carrying declarative
//! protection policies (throttle, debounce, schema, change-detection)
//! dispatched through a compiled pipeline, plus a cooperative timer and
//! stress-adaptive scheduler (the breathing system).
//!
//! The library exposes both an explicit [`Engine`] value for callers who
//! want an independent instance, and a thin global façade (the free
//! functions in this module) backed by a lazily-constructed default engine —
//! the shape most callers reach for first.

pub mod breathing;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod flags;
pub mod metrics;
pub mod payload;
pub mod pipeline;
pub mod subscriber;
pub mod timekeeper;
pub mod types;

pub use channel::Channel;
pub use config::{ChannelConfig, Repeat, RuntimeConfig};
pub use engine::{Engine, EngineSnapshot};
pub use error::CyreError;
pub use subscriber::{FnHandler, Handler};
pub use types::{ExecutionPath, HandlerOutcome, IntraLink, ItemResult, Metadata, Priority, Response};

use serde_json::Value;
use std::sync::{Arc, OnceLock};

static DEFAULT_ENGINE: OnceLock<Arc<Engine>> = OnceLock::new();

/// The process-wide default engine, built on first use with
/// [`RuntimeConfig::default`]. Mirrors `keeper-rs`'s single
/// `KeeperState`/`KeeperConfig` instance per process, generalized to a
/// lazily-constructed handle so the façade never forces an explicit
/// constructor call before first use.
fn default_engine() -> &'static Arc<Engine> {
    DEFAULT_ENGINE.get_or_init(|| Engine::new(RuntimeConfig::default()))
}

pub fn init() {
    default_engine().init();
}

pub fn action(config: ChannelConfig) -> Result<(), CyreError> {
    default_engine().action(config)
}

pub fn action_batch(configs: Vec<ChannelConfig>) -> Response {
    default_engine().action_batch(configs)
}

pub fn on(id: impl Into<String>, handler: Arc<dyn Handler>) -> bool {
    default_engine().on(id, handler)
}

pub fn on_batch(pairs: Vec<(String, Arc<dyn Handler>)>) -> Vec<ItemResult> {
    default_engine().on_batch(pairs)
}

pub async fn call(id: &str, payload: Option<Value>) -> Response {
    default_engine().call(id, payload).await
}

pub fn forget(id: &str) -> bool {
    default_engine().forget(id)
}

pub fn clear() {
    default_engine().clear();
}

pub fn block(id: &str) -> bool {
    default_engine().block(id)
}

pub fn unblock(id: &str) -> bool {
    default_engine().unblock(id)
}

pub fn pause(id: Option<&str>) {
    default_engine().pause(id);
}

pub fn resume(id: Option<&str>) {
    default_engine().resume(id);
}

pub fn lock() {
    default_engine().lock();
}

pub fn unlock() {
    default_engine().unlock();
}

pub fn shutdown() {
    default_engine().shutdown();
}

pub fn get(id: &str) -> Option<Arc<Channel>> {
    default_engine().get(id)
}

pub fn has_changed(id: &str, payload: &Value) -> bool {
    default_engine().has_changed(id, payload)
}

pub fn get_previous(id: &str) -> Option<Value> {
    default_engine().get_previous(id)
}

pub fn update_payload(id: &str, payload: Value) {
    default_engine().update_payload(id, payload);
}

pub fn breathing_state() -> breathing::BreathingSnapshot {
    default_engine().breathing_state()
}

pub fn performance_state() -> metrics::GlobalCounters {
    default_engine().performance_state()
}

pub fn metrics_for(id: &str) -> Option<metrics::IdCounters> {
    default_engine().metrics_for(id)
}

/// Installs a `tracing` subscriber reading `RUST_LOG` (default `info`),
/// matching `keeper-rs/src/main.rs`'s startup sequence. Safe to call more
/// than once; later calls are no-ops.
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn facade_roundtrips_a_fast_path_call() {
        // Each test in this module talks to its own Engine rather than the
        // process-wide default, since the default is shared across the
        // whole test binary.
        let engine = Engine::new(RuntimeConfig::default());
        engine.init();
        engine.action(ChannelConfig::new("ping")).unwrap();
        engine.on(
            "ping",
            Arc::new(FnHandler::new(|p| Box::pin(async move { HandlerOutcome::Result(p) }))),
        );
        let response = engine.call("ping", Some(json!({"n": 1}))).await;
        assert!(response.ok);
        assert_eq!(response.payload, json!({"n": 1}));
    }

    #[tokio::test]
    async fn uninitialized_engine_rejects_calls() {
        let engine = Engine::new(RuntimeConfig::default());
        let response = engine.call("missing", None).await;
        assert!(!response.ok);
    }
}
