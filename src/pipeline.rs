use crate::config::ChannelConfig;
use crate::error::CyreError;
use crate::payload::PayloadStore;
use crate::types::Response;
use serde_json::{json, Value};

/// The fixed stage order declared as data (spec §4.3, §9 "Protection policy
/// order implicit in code" -> "declare the stage order once as data"). The
/// compiler below only ever emits a subsequence of this list, in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Schema,
    Condition,
    Transform,
    ChangeDetect,
}

const STAGE_ORDER: [StageKind; 4] = [
    StageKind::Schema,
    StageKind::Condition,
    StageKind::Transform,
    StageKind::ChangeDetect,
];

/// Output of a pipeline compilation: the ordered stage list plus the
/// fast-path flag. When `is_fast_path` is true the call engine skips
/// compilation (and this struct's `stages` is empty) and dispatches directly,
/// per spec §4.3.
#[derive(Debug, Clone)]
pub struct CompiledPipeline {
    pub stages: Vec<StageKind>,
    pub is_fast_path: bool,
}

impl CompiledPipeline {
    pub fn compile(config: &ChannelConfig) -> Self {
        if !config.has_pipeline_stages() {
            return CompiledPipeline {
                stages: Vec::new(),
                is_fast_path: true,
            };
        }
        let stages = STAGE_ORDER
            .iter()
            .copied()
            .filter(|stage| match stage {
                StageKind::Schema => config.schema.is_some(),
                StageKind::Condition => config.condition.is_some(),
                StageKind::Transform => config.transform.is_some(),
                StageKind::ChangeDetect => config.detect_changes,
            })
            .collect();
        CompiledPipeline {
            stages,
            is_fast_path: false,
        }
    }
}

/// Result of running a compiled pipeline: either the (possibly transformed)
/// payload to dispatch, or a halt response to return directly to the caller.
pub enum StageOutcome {
    Next(Value),
    Halt(Response),
}

/// Executes the compiled stage list in order (spec §4.3). Each stage either
/// passes the payload on (possibly transformed) or halts the pipeline with a
/// structured response; halts are not errors in the Rust sense (condition and
/// change-detect halts are routine filtering), only schema/transform failures
/// carry an `error` field.
pub fn run_pipeline(
    pipeline: &CompiledPipeline,
    config: &ChannelConfig,
    channel_id: &str,
    payload_store: &PayloadStore,
    mut payload: Value,
) -> StageOutcome {
    for stage in &pipeline.stages {
        match stage {
            StageKind::Schema => {
                if let Some(validator) = &config.schema {
                    if let Err(issues) = validator(&payload) {
                        let err = CyreError::SchemaViolation(issues.clone());
                        return StageOutcome::Halt(Response::err_with(
                            err.code(),
                            issues,
                        ));
                    }
                }
            }
            StageKind::Condition => {
                if let Some(condition) = &config.condition {
                    if !condition(&payload) {
                        return StageOutcome::Halt(Response {
                            ok: false,
                            payload: Value::Null,
                            message: CyreError::ConditionNotMet.code().to_string(),
                            error: None,
                            metadata: None,
                        });
                    }
                }
            }
            StageKind::Transform => {
                if let Some(transform) = &config.transform {
                    match transform(&payload) {
                        Ok(next) => payload = next,
                        Err(reason) => {
                            let err = CyreError::TransformFailed(reason.clone());
                            return StageOutcome::Halt(Response::err_with(err.code(), reason));
                        }
                    }
                }
            }
            StageKind::ChangeDetect => {
                if !payload_store.has_changed_and_update(channel_id, &payload) {
                    return StageOutcome::Halt(Response {
                        ok: false,
                        payload: json!(null),
                        message: CyreError::NoChangesDetected.code().to_string(),
                        error: None,
                        metadata: None,
                    });
                }
            }
        }
    }
    StageOutcome::Next(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn no_protections_compiles_to_fast_path() {
        let config = ChannelConfig::new("u");
        let compiled = CompiledPipeline::compile(&config);
        assert!(compiled.is_fast_path);
        assert!(compiled.stages.is_empty());
    }

    #[test]
    fn stage_order_is_schema_condition_transform_change_detect() {
        let mut config = ChannelConfig::new("c");
        config.detect_changes = true;
        config.transform = Some(Arc::new(|v: &Value| Ok(v.clone())));
        config.condition = Some(Arc::new(|_: &Value| true));
        config.schema = Some(Arc::new(|_: &Value| Ok(())));
        let compiled = CompiledPipeline::compile(&config);
        assert_eq!(
            compiled.stages,
            vec![
                StageKind::Schema,
                StageKind::Condition,
                StageKind::Transform,
                StageKind::ChangeDetect
            ]
        );
    }

    #[test]
    fn condition_false_halts_as_non_error_filter() {
        let mut config = ChannelConfig::new("c");
        config.condition = Some(Arc::new(|_: &Value| false));
        let compiled = CompiledPipeline::compile(&config);
        let store = PayloadStore::new();
        match run_pipeline(&compiled, &config, "c", &store, json!(1)) {
            StageOutcome::Halt(resp) => {
                assert!(!resp.ok);
                assert_eq!(resp.message, "condition-not-met");
                assert!(resp.error.is_none());
            }
            _ => panic!("expected halt"),
        }
    }

    #[test]
    fn change_detect_halts_on_equal_payload() {
        let mut config = ChannelConfig::new("c");
        config.detect_changes = true;
        let compiled = CompiledPipeline::compile(&config);
        let store = PayloadStore::new();
        assert!(matches!(
            run_pipeline(&compiled, &config, "c", &store, json!({"v": 1})),
            StageOutcome::Next(_)
        ));
        assert!(matches!(
            run_pipeline(&compiled, &config, "c", &store, json!({"v": 1})),
            StageOutcome::Halt(_)
        ));
    }
}
