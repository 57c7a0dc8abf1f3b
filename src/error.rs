use thiserror::Error;

/// Internal error type. Never crosses the public façade directly — `Engine::call`
/// and friends fold every variant into a `Response` (see `types::Response`).
#[derive(Debug, Error, Clone)]
pub enum CyreError {
    #[error("channel id must be a non-empty string")]
    InvalidId,

    #[error("channel '{0}' conflicts: throttle and debounce cannot both be set")]
    ConflictingProtections(String),

    #[error("channel '{0}' not found")]
    ChannelNotFound(String),

    #[error("system is locked")]
    SystemLocked,

    #[error("system is not initialized")]
    NotInitialized,

    #[error("system is shutting down")]
    Shutdown,

    #[error("schema validation failed: {0}")]
    SchemaViolation(String),

    #[error("condition not met")]
    ConditionNotMet,

    #[error("transform failed: {0}")]
    TransformFailed(String),

    #[error("no changes detected")]
    NoChangesDetected,

    #[error("throttled, retry in {remaining_ms}ms")]
    Throttled { remaining_ms: u64 },

    #[error("debounced")]
    Debounced,

    #[error("system is recuperating")]
    Recuperating,

    #[error("channel '{0}' is blocked")]
    Blocked(String),

    #[error("handler for '{0}' raised: {1}")]
    HandlerPanicked(String, String),

    #[error("chain depth exceeded for '{0}'")]
    ChainOverflow(String),

    #[error("snapshot I/O failed: {0}")]
    Snapshot(String),
}

impl CyreError {
    /// The stable string used in `Response.message` / `Response.error`, per spec §6/§7.
    pub fn code(&self) -> &'static str {
        match self {
            CyreError::InvalidId => "CALL_INVALID_ID",
            CyreError::ConflictingProtections(_) => "CONFLICTING_PROTECTIONS",
            CyreError::ChannelNotFound(_) => "Channel not found",
            CyreError::SystemLocked => "SYSTEM_LOCKED",
            CyreError::NotInitialized => "SYSTEM_NOT_INITIALIZED",
            CyreError::Shutdown => "SYSTEM_SHUTDOWN",
            CyreError::SchemaViolation(_) => "SCHEMA_VIOLATION",
            CyreError::ConditionNotMet => "condition-not-met",
            CyreError::TransformFailed(_) => "TRANSFORM_FAILED",
            CyreError::NoChangesDetected => "No changes detected",
            CyreError::Throttled { .. } => "Throttled",
            CyreError::Debounced => "Debounced",
            CyreError::Recuperating => "System is recuperating",
            CyreError::Blocked(_) => "CALL_NOT_RESPONDING",
            CyreError::HandlerPanicked(..) => "CALL_NOT_RESPONDING",
            CyreError::ChainOverflow(_) => "CHAIN_OVERFLOW",
            CyreError::Snapshot(_) => "SNAPSHOT_ERROR",
        }
    }
}
