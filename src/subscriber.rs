use crate::types::HandlerOutcome;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// A channel's handler. Mirrors the boxed-trait-object subscriber pattern in
/// `r3bl_redux`'s `Store` (`Box<dyn AsyncSubscriber<S> + Send + Sync>`), but
/// returns the explicit `Result | Link` sum type from spec §9 instead of a
/// bare value, so dispatch never has to guess at the handler's intent.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, payload: Value) -> HandlerOutcome;
}

/// Adapts a plain async closure into a `Handler`. Most callers register via
/// `subscribe_fn` rather than implementing `Handler` by hand.
pub struct FnHandler<F> {
    f: F,
}

type BoxFut = Pin<Box<dyn Future<Output = HandlerOutcome> + Send>>;

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(Value) -> BoxFut + Send + Sync,
{
    async fn call(&self, payload: Value) -> HandlerOutcome {
        (self.f)(payload).await
    }
}

impl<F> FnHandler<F>
where
    F: Fn(Value) -> BoxFut + Send + Sync,
{
    pub fn new(f: F) -> Self {
        FnHandler { f }
    }
}

/// At most one active handler per channel id (spec §4.2). A second subscribe
/// **replaces** the first — this store never fans a call out to more than one
/// handler, eliminating the "which handler answers" ambiguity the spec calls
/// out as a pinned Open Question.
#[derive(Default)]
pub struct SubscriberStore {
    handlers: DashMap<String, Arc<dyn Handler>>,
}

impl SubscriberStore {
    pub fn new() -> Self {
        SubscriberStore {
            handlers: DashMap::new(),
        }
    }

    /// Returns `true` if this replaced an existing handler (caller should log
    /// a re-subscribe warning, per spec §9).
    pub fn subscribe(&self, id: impl Into<String>, handler: Arc<dyn Handler>) -> bool {
        let id = id.into();
        let replaced = self.handlers.contains_key(&id);
        self.handlers.insert(id, handler);
        replaced
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(id).map(|r| r.clone())
    }

    pub fn forget(&self, id: &str) -> bool {
        self.handlers.remove(id).is_some()
    }

    pub fn clear(&self) {
        self.handlers.clear();
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

pub type SharedSubscriberStore = Arc<SubscriberStore>;
