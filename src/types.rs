//! Core event types for the a3s-flow system
//!
//! Events carry an opaque JSON payload; the shape of each payload is a
//! contract between publisher and handler, not something the bus checks.

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Closed set of event types understood by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// `{text, session_id}` from a front end
    UserInput,
    /// `{session_id}`
    ClearHistory,
    /// `{session_id}` once history is gone
    HistoryCleared,
    /// `{state, session_id}`
    StatusUpdate,
    /// `{type, command, session_id}`
    SecurityAlert,
    /// `{session_id, question}`
    RetrieveKnowledge,
    /// `{session_id, correlation_id?, items}`
    KnowledgeResult,
    GenerationStart,
    GenerationComplete,
    CommandStart,
    CommandResult,
    CommandSuccess,
    CommandError,
    /// `{chunk, session_id, correlation_id}`
    ResponseChunk,
    StreamStart,
    StreamEnd,
    /// `{session_id}`
    CancelOperation,
    /// `{stage, message, context}` or `{event_type, error, stack_trace}`
    Error,
}

impl EventType {
    /// Every event type, in declaration order
    pub const ALL: [EventType; 18] = [
        EventType::UserInput,
        EventType::ClearHistory,
        EventType::HistoryCleared,
        EventType::StatusUpdate,
        EventType::SecurityAlert,
        EventType::RetrieveKnowledge,
        EventType::KnowledgeResult,
        EventType::GenerationStart,
        EventType::GenerationComplete,
        EventType::CommandStart,
        EventType::CommandResult,
        EventType::CommandSuccess,
        EventType::CommandError,
        EventType::ResponseChunk,
        EventType::StreamStart,
        EventType::StreamEnd,
        EventType::CancelOperation,
        EventType::Error,
    ];

    /// Wire name of this event type
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::UserInput => "user_input",
            EventType::ClearHistory => "clear_history",
            EventType::HistoryCleared => "history_cleared",
            EventType::StatusUpdate => "status_update",
            EventType::SecurityAlert => "security_alert",
            EventType::RetrieveKnowledge => "retrieve_knowledge",
            EventType::KnowledgeResult => "knowledge_result",
            EventType::GenerationStart => "generation_start",
            EventType::GenerationComplete => "generation_complete",
            EventType::CommandStart => "command_start",
            EventType::CommandResult => "command_result",
            EventType::CommandSuccess => "command_success",
            EventType::CommandError => "command_error",
            EventType::ResponseChunk => "response_chunk",
            EventType::StreamStart => "stream_start",
            EventType::StreamEnd => "stream_end",
            EventType::CancelOperation => "cancel_operation",
            EventType::Error => "error",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single event flowing through the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Unique event identifier (evt-<uuid>)
    pub id: String,

    /// Event type
    pub event_type: EventType,

    /// Payload schema version for this event type
    #[serde(default = "default_version")]
    pub version: u32,

    /// Event payload, arbitrary JSON
    pub payload: serde_json::Value,

    /// Unix timestamp in milliseconds
    pub timestamp: u64,

    /// Optional key-value metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_version() -> u32 {
    1
}

impl Event {
    /// Create a new event with auto-generated id and timestamp
    pub fn new(event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            id: format!("evt-{}", uuid::Uuid::new_v4()),
            event_type,
            version: 1,
            payload,
            timestamp: now_millis(),
            metadata: HashMap::new(),
        }
    }

    /// Override the payload version
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Deserialize the payload into a typed struct
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// String field from the payload, if present
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

    /// Correlation id stamped on the payload, if any
    pub fn correlation_id(&self) -> Option<&str> {
        self.payload_str("correlation_id")
    }
}

/// How `publish` delivers an event to its handlers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Handlers run on the caller's task, in registration order
    Sync,
    /// Each handler is scheduled independently on the worker pool
    #[default]
    Async,
}

/// Inbound `user_input` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInput {
    pub text: String,
    pub session_id: String,
}

/// Inbound payload for events keyed only by session
/// (`cancel_operation`, `clear_history`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRef {
    pub session_id: String,
}

/// Inbound `retrieve_knowledge` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieveRequest {
    pub session_id: String,
    pub question: String,
}

/// Current time in Unix milliseconds
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation() {
        let event = Event::new(
            EventType::UserInput,
            serde_json::json!({"text": "hi", "session_id": "s1"}),
        );

        assert!(event.id.starts_with("evt-"));
        assert_eq!(event.event_type, EventType::UserInput);
        assert_eq!(event.version, 1);
        assert!(event.timestamp > 0);
        assert!(event.metadata.is_empty());
    }

    #[test]
    fn test_event_type_wire_names_match_serde() {
        for ty in EventType::ALL {
            let json = serde_json::to_string(&ty).unwrap();
            assert_eq!(json, format!("\"{}\"", ty.as_str()));
        }
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::new(EventType::StreamStart, serde_json::json!({"correlation_id": "c-1"}))
            .with_metadata("origin", "test")
            .with_version(2);

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"eventType\":\"stream_start\""));
        assert!(json.contains("\"version\":2"));

        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event_type, EventType::StreamStart);
        assert_eq!(parsed.correlation_id(), Some("c-1"));
        assert_eq!(parsed.metadata["origin"], "test");
    }

    #[test]
    fn test_event_version_backward_compat() {
        let json = r#"{
            "id": "evt-123",
            "eventType": "error",
            "payload": {},
            "timestamp": 1700000000000
        }"#;

        let event: Event = serde_json::from_str(json).unwrap();
        assert_eq!(event.version, 1);
        assert!(event.metadata.is_empty());
    }

    #[test]
    fn test_payload_as_typed() {
        let event = Event::new(
            EventType::UserInput,
            serde_json::json!({"text": "what is X?", "session_id": "s1"}),
        );
        let input: UserInput = event.payload_as().unwrap();
        assert_eq!(input.text, "what is X?");
        assert_eq!(input.session_id, "s1");

        let bad = Event::new(EventType::UserInput, serde_json::json!({"text": 3}));
        assert!(bad.payload_as::<UserInput>().is_err());
    }

    #[test]
    fn test_delivery_mode_default_is_async() {
        assert_eq!(DeliveryMode::default(), DeliveryMode::Async);
    }
}
