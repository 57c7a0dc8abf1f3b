use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Call priority. Drives the recuperation gate (§4.4 step 4) and, optionally,
/// graded admission as recuperation depth rises (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Background,
    Low,
    Medium,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

/// `Response.metadata.executionPath`, per spec §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionPath {
    Fast,
    Pipeline,
    DebounceDelayed,
    Timer,
    Error,
}

/// Known metadata keys, per spec §6. Left as an open map so callers (and the
/// façade) can attach additional diagnostic fields without a schema bump.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throttled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debounced: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_path: Option<ExecutionPath>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_result: Option<Box<Response>>,
}

/// The wire-stable response contract (spec §3, §6). Always returned, never
/// thrown — every fallible step in the call pipeline folds into one of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    pub payload: Value,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl Response {
    pub fn ok(payload: Value, message: impl Into<String>) -> Self {
        Response {
            ok: true,
            payload,
            message: message.into(),
            error: None,
            metadata: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Response {
            ok: false,
            payload: Value::Null,
            message: message.into(),
            error: None,
            metadata: None,
        }
    }

    pub fn err_with(message: impl Into<String>, error: impl Into<String>) -> Self {
        Response {
            ok: false,
            payload: Value::Null,
            message: message.into(),
            error: Some(error.into()),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A subscriber's return value. Replaces the source's "union of result or
/// `{id,payload}`" with an explicit sum type (spec §9, Design Notes) so
/// dispatch never string-sniffs a handler's return shape.
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    Result(Value),
    Link(IntraLink),
}

/// A handler return value that chains into another channel (spec §4.7, GLOSSARY).
#[derive(Debug, Clone)]
pub struct IntraLink {
    pub id: String,
    pub payload: Value,
}

/// One record in a channel's per-batch registration/subscription result set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemResult {
    pub id: String,
    pub ok: bool,
    pub message: String,
}
