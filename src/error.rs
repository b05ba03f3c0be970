//! Error types for a3s-flow

use thiserror::Error;

/// Errors that can occur while orchestrating a pipeline
#[derive(Debug, Error)]
pub enum FlowError {
    /// Raw input could not be accepted (missing fields, bad shape)
    #[error("Input processing error: {0}")]
    InputProcessing(String),

    /// Vector store search failure
    #[error("Retrieval error: {0}")]
    Retrieval(String),

    /// Vector store search exceeded its deadline
    #[error("Knowledge retrieval timed out after {0}ms")]
    RetrievalTimeout(u64),

    /// Model backend failure, surfaced from the fragment stream
    #[error("Generation error: {0}")]
    Generation(String),

    /// Command exceeded its execution deadline
    #[error("Command execution timed out after {timeout_ms}ms: {command}")]
    CommandTimeout { command: String, timeout_ms: u64 },

    /// Command could not be spawned or exited abnormally
    #[error("Command execution failed: {0}")]
    CommandExecution(String),

    /// Response chunk payload is missing its `content` field
    #[error("Invalid response chunk format: {0}")]
    InvalidChunkFormat(String),

    /// Completion metadata could not be assembled
    #[error("Metadata error: {0}")]
    Metadata(String),

    /// An event handler returned an error or panicked
    #[error("Handler failed for event '{event_type}': {reason}")]
    Handler { event_type: String, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Session persistence failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Operation was cancelled by a session-wide cancel request
    #[error("Operation cancelled")]
    Cancelled,

    /// Internal lock was poisoned
    #[error("Lock poisoned: {0}")]
    Lock(String),
}

impl FlowError {
    /// Stage label carried in published `error` events
    pub fn stage(&self) -> &'static str {
        match self {
            FlowError::InputProcessing(_) => "input_processing",
            FlowError::Retrieval(_) => "retrieval",
            FlowError::RetrievalTimeout(_) => "retrieval_timeout",
            FlowError::Generation(_) => "response_generation",
            FlowError::CommandTimeout { .. } => "command_timeout",
            FlowError::CommandExecution(_) => "command_execution",
            FlowError::InvalidChunkFormat(_) => "invalid_chunk",
            FlowError::Metadata(_) => "metadata_error",
            FlowError::Handler { .. } => "handler",
            FlowError::Config(_) => "config",
            FlowError::Persistence(_) => "persistence",
            FlowError::Serialization(_) => "serialization",
            FlowError::Cancelled => "cancelled",
            FlowError::Lock(_) => "processing",
        }
    }
}

/// Result type alias for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_labels() {
        assert_eq!(FlowError::RetrievalTimeout(100).stage(), "retrieval_timeout");
        assert_eq!(
            FlowError::InvalidChunkFormat("x".into()).stage(),
            "invalid_chunk"
        );
        assert_eq!(
            FlowError::CommandTimeout {
                command: "sleep 5".into(),
                timeout_ms: 10
            }
            .stage(),
            "command_timeout"
        );
    }

    #[test]
    fn test_display_includes_context() {
        let err = FlowError::Handler {
            event_type: "user_input".into(),
            reason: "boom".into(),
        };
        assert_eq!(
            err.to_string(),
            "Handler failed for event 'user_input': boom"
        );
    }
}
