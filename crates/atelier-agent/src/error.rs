//! Structured error type for the agent crate.

use thiserror::Error;

/// Errors surfaced by agent services.
///
/// `Validation` maps to HTTP 400 at the edge; everything else is either
/// handled locally (tool failures become tool-call rows in status `error`,
/// memory failures become retryable events) or returned as 500.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AgentError {
    // --- Validation (HTTP 400, no retry) ---
    #[error("{0}")]
    Validation(String),

    #[error("chat not found: {chat_id}")]
    ChatNotFound { chat_id: String },

    #[error("checkpoint not found: {checkpoint_id}")]
    CheckpointNotFound { checkpoint_id: String },

    #[error("tool call not found: {tool_call_id}")]
    ToolCallNotFound { tool_call_id: String },

    #[error("tool call is not pending: {tool_call_id}")]
    ToolCallNotPending { tool_call_id: String },

    // --- Upstream provider ---
    #[error("provider error: {0}")]
    Provider(String),

    // --- Persistence ---
    #[error("database error: {0}")]
    Database(String),

    // --- Filesystem / subprocess ---
    #[error("io error: {0}")]
    Io(String),

    // --- MCP ---
    #[error("MCP {transport} server failed: {reason}")]
    McpServerFailed { transport: String, reason: String },

    // --- Cancellation (propagates, never logged as error) ---
    #[error("cancelled")]
    Cancelled,

    // --- Generic internal ---
    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Whether this error should surface as a caller mistake (HTTP 400).
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            AgentError::Validation(_)
                | AgentError::ChatNotFound { .. }
                | AgentError::CheckpointNotFound { .. }
                | AgentError::ToolCallNotFound { .. }
                | AgentError::ToolCallNotPending { .. }
        )
    }
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::Database(e.to_string())
    }
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        AgentError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Internal(format!("serialization error: {}", e))
    }
}

impl From<atelier::LLMError> for AgentError {
    fn from(e: atelier::LLMError) -> Self {
        AgentError::Provider(e.to_string())
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(e: anyhow::Error) -> Self {
        AgentError::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_variants_are_flagged() {
        assert!(AgentError::Validation("bad".into()).is_validation());
        assert!(AgentError::ChatNotFound { chat_id: "c".into() }.is_validation());
        assert!(!AgentError::Provider("x".into()).is_validation());
        assert!(!AgentError::Cancelled.is_validation());
    }

    #[test]
    fn messages_carry_context() {
        let err = AgentError::ToolCallNotPending {
            tool_call_id: "tc-9".into(),
        };
        assert!(err.to_string().contains("tc-9"));
    }
}
