use crate::channel::{Channel, SharedChannelStore};
use crate::error::CyreError;
use crate::metrics::{EventKind, SharedSensor};
use crate::payload::SharedPayloadStore;
use crate::pipeline::{run_pipeline, StageOutcome};
use crate::subscriber::SharedSubscriberStore;
use crate::types::{ExecutionPath, HandlerOutcome, IntraLink, Metadata, Response};
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, warn};

/// Everything `dispatch` needs reach into, bundled so the IntraLink
/// trampoline can recurse without threading five separate arguments through
/// every call (spec §4.7). Mirrors `keeper-rs`'s habit of handing a poll
/// loop a single context struct rather than a long parameter list.
pub struct DispatchContext {
    pub channels: SharedChannelStore,
    pub subscribers: SharedSubscriberStore,
    pub payloads: SharedPayloadStore,
    pub sensor: SharedSensor,
    pub max_chain_depth: u32,
}

/// Runs a channel's compiled pipeline (unless it is fast-path) followed by
/// dispatch, entry point used by both the immediate call path and the
/// debounce/delay/interval wake path (spec §4.4 step 8, §4.5).
pub async fn run_channel(ctx: &DispatchContext, channel: &Arc<Channel>, payload: Value) -> Response {
    if channel.compiled.is_fast_path {
        return dispatch(ctx, channel, payload, ExecutionPath::Fast, 0).await;
    }
    match run_pipeline(
        &channel.compiled,
        &channel.config,
        &channel.config.id,
        &ctx.payloads,
        payload,
    ) {
        StageOutcome::Halt(response) => response,
        StageOutcome::Next(payload) => dispatch(ctx, channel, payload, ExecutionPath::Pipeline, 0).await,
    }
}

/// Invokes the channel's subscriber, catching handler panics without tearing
/// down the call (spec §4.4 step 8 "handler panics are caught"), and follows
/// at most `max_chain_depth` `IntraLink` hops (spec §4.7, §9).
async fn dispatch(
    ctx: &DispatchContext,
    channel: &Arc<Channel>,
    payload: Value,
    execution_path: ExecutionPath,
    depth: u32,
) -> Response {
    let _guard = channel.dispatch_lock.lock().await;
    let id = channel.config.id.clone();
    *channel.scratch.last_exec_time.lock() = Some(tokio::time::Instant::now());

    let Some(handler) = ctx.subscribers.get(&id) else {
        ctx.sensor.record(&id, EventKind::Error, Some("no subscriber".into()));
        return error_response(&id, CyreError::Blocked(id.clone()), execution_path);
    };

    let payload_for_handler = payload.clone();
    let join = tokio::spawn(async move { handler.call(payload_for_handler).await });

    let outcome = match join.await {
        Ok(outcome) => outcome,
        Err(join_err) => {
            let reason = if join_err.is_panic() {
                "handler panicked".to_string()
            } else {
                "handler task cancelled".to_string()
            };
            error!(channel = %id, reason = %reason, "handler failed");
            ctx.sensor.record(&id, EventKind::Error, Some(reason.clone()));
            return error_response(
                &id,
                CyreError::HandlerPanicked(id.clone(), reason),
                execution_path,
            );
        }
    };

    match outcome {
        HandlerOutcome::Result(value) => {
            ctx.payloads.set_res(&id, value.clone());
            ctx.sensor.record(&id, EventKind::Execution, None);
            Response::ok(value, "ok").with_metadata(Metadata {
                execution_path: Some(execution_path),
                ..Default::default()
            })
        }
        HandlerOutcome::Link(link) => {
            // Chain overflow terminates quietly: the spec's "original response
            // is returned" means the parent keeps its own `ok`/`payload`, it
            // just never gains a `chain_result` (spec §4.7).
            if depth >= ctx.max_chain_depth {
                warn!(target = %link.id, depth, "chain depth exceeded, dropping link");
                return Response::ok(Value::Null, "chained").with_metadata(Metadata {
                    execution_path: Some(execution_path),
                    ..Default::default()
                });
            }
            follow_link(ctx, link, execution_path, depth).await
        }
    }
}

async fn follow_link(
    ctx: &DispatchContext,
    link: IntraLink,
    execution_path: ExecutionPath,
    depth: u32,
) -> Response {
    let Some(target) = ctx.channels.get(&link.id) else {
        return error_response(
            &link.id,
            CyreError::ChannelNotFound(link.id.clone()),
            execution_path,
        );
    };

    let chained = if target.compiled.is_fast_path {
        Box::pin(dispatch(ctx, &target, link.payload, ExecutionPath::Fast, depth + 1)).await
    } else {
        match run_pipeline(
            &target.compiled,
            &target.config,
            &target.config.id,
            &ctx.payloads,
            link.payload,
        ) {
            StageOutcome::Halt(response) => response,
            StageOutcome::Next(payload) => {
                Box::pin(dispatch(ctx, &target, payload, ExecutionPath::Pipeline, depth + 1)).await
            }
        }
    };

    Response::ok(Value::Null, "chained").with_metadata(Metadata {
        execution_path: Some(execution_path),
        chain_result: Some(Box::new(chained)),
        ..Default::default()
    })
}

fn error_response(id: &str, err: CyreError, execution_path: ExecutionPath) -> Response {
    let _ = id;
    Response::err_with(err.code(), err.to_string()).with_metadata(Metadata {
        execution_path: Some(execution_path),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelStore;
    use crate::config::ChannelConfig;
    use crate::metrics::Sensor;
    use crate::payload::PayloadStore;
    use crate::subscriber::{FnHandler, SubscriberStore};
    use serde_json::json;

    fn test_ctx() -> (DispatchContext, Arc<ChannelStore>) {
        let channels = Arc::new(ChannelStore::new());
        let ctx = DispatchContext {
            channels: channels.clone(),
            subscribers: Arc::new(SubscriberStore::new()),
            payloads: Arc::new(PayloadStore::new()),
            sensor: Arc::new(Sensor::new(16)),
            max_chain_depth: 4,
        };
        (ctx, channels)
    }

    #[tokio::test]
    async fn fast_path_dispatch_returns_handler_result() {
        let (ctx, channels) = test_ctx();
        let channel = channels.register(ChannelConfig::new("echo"));
        ctx.subscribers.subscribe(
            "echo",
            Arc::new(FnHandler::new(|p| Box::pin(async move { HandlerOutcome::Result(p) }))),
        );
        let response = run_channel(&ctx, &channel, json!({"v": 1})).await;
        assert!(response.ok);
        assert_eq!(response.payload, json!({"v": 1}));
    }

    #[tokio::test]
    async fn missing_subscriber_is_not_ok() {
        let (ctx, channels) = test_ctx();
        let channel = channels.register(ChannelConfig::new("silent"));
        let response = run_channel(&ctx, &channel, json!(null)).await;
        assert!(!response.ok);
    }

    #[tokio::test]
    async fn intra_link_chains_into_target_channel() {
        let (ctx, channels) = test_ctx();
        let a = channels.register(ChannelConfig::new("a"));
        channels.register(ChannelConfig::new("b"));
        ctx.subscribers.subscribe(
            "a",
            Arc::new(FnHandler::new(|_| {
                Box::pin(async move {
                    HandlerOutcome::Link(IntraLink {
                        id: "b".to_string(),
                        payload: json!({"hop": 1}),
                    })
                })
            })),
        );
        ctx.subscribers.subscribe(
            "b",
            Arc::new(FnHandler::new(|p| Box::pin(async move { HandlerOutcome::Result(p) }))),
        );
        let response = run_channel(&ctx, &a, json!(null)).await;
        assert!(response.ok);
        let chained = response.metadata.unwrap().chain_result.unwrap();
        assert!(chained.ok);
        assert_eq!(chained.payload, json!({"hop": 1}));
    }
}
