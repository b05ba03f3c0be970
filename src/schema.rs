//! Payload schemas: required-field contracts per event type
//!
//! The bus never inspects payloads. Handlers that need a guaranteed shape
//! validate against a `SchemaRegistry` before acting, so a malformed payload
//! is rejected at the point it would cause harm.

use crate::error::{FlowError, Result};
use crate::types::{Event, EventType};
use std::collections::HashMap;
use std::sync::RwLock;

/// Required-field contract for an event type at a specific version
#[derive(Debug, Clone)]
pub struct PayloadSchema {
    pub event_type: EventType,

    /// Payload version this schema applies to
    pub version: u32,

    /// Top-level fields that must be present in the payload
    pub required_fields: Vec<String>,

    /// Fields that, when present, must be non-empty strings
    pub string_fields: Vec<String>,
}

impl PayloadSchema {
    /// Schema for version 1 with the given required fields
    pub fn new(event_type: EventType, required_fields: &[&str]) -> Self {
        Self {
            event_type,
            version: 1,
            required_fields: required_fields.iter().map(|s| s.to_string()).collect(),
            string_fields: Vec::new(),
        }
    }

    /// Require the listed fields to be strings
    pub fn with_string_fields(mut self, fields: &[&str]) -> Self {
        self.string_fields = fields.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Check a bare payload against this schema
    pub fn check(&self, payload: &serde_json::Value) -> std::result::Result<(), String> {
        let Some(map) = payload.as_object() else {
            if self.required_fields.is_empty() {
                return Ok(());
            }
            return Err("payload must be a JSON object".to_string());
        };

        for field in &self.required_fields {
            if !map.contains_key(field) {
                return Err(format!("missing required field '{}'", field));
            }
        }
        for field in &self.string_fields {
            if let Some(value) = map.get(field) {
                if !value.is_string() {
                    return Err(format!("field '{}' must be a string", field));
                }
            }
        }
        Ok(())
    }
}

/// Trait for payload schema registries
pub trait SchemaRegistry: Send + Sync {
    /// Register (or replace) a schema
    fn register(&self, schema: PayloadSchema) -> Result<()>;

    /// Get the schema for an event type at a specific version
    fn get(&self, event_type: EventType, version: u32) -> Result<Option<PayloadSchema>>;

    /// List event types that have at least one schema
    fn list_types(&self) -> Result<Vec<EventType>>;

    /// Validate an event's payload; events without a schema pass
    fn validate(&self, event: &Event) -> Result<()>;
}

/// In-memory schema registry
pub struct MemorySchemaRegistry {
    /// (event_type, version) → schema
    schemas: RwLock<HashMap<(EventType, u32), PayloadSchema>>,
}

impl MemorySchemaRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            schemas: RwLock::new(HashMap::new()),
        }
    }

    /// Registry preloaded with the pipeline's inbound and chunk contracts
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        let defaults = [
            PayloadSchema::new(EventType::UserInput, &["text", "session_id"])
                .with_string_fields(&["text", "session_id"]),
            PayloadSchema::new(EventType::CancelOperation, &["session_id"])
                .with_string_fields(&["session_id"]),
            PayloadSchema::new(EventType::ClearHistory, &["session_id"])
                .with_string_fields(&["session_id"]),
            PayloadSchema::new(EventType::RetrieveKnowledge, &["session_id", "question"])
                .with_string_fields(&["session_id", "question"]),
            PayloadSchema::new(EventType::ResponseChunk, &["content"])
                .with_string_fields(&["content"]),
        ];
        if let Ok(mut schemas) = registry.schemas.write() {
            for schema in defaults {
                schemas.insert((schema.event_type, schema.version), schema);
            }
        }
        registry
    }

    /// Validate a bare payload as if it were an event of `event_type` v1
    pub fn validate_payload(
        &self,
        event_type: EventType,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let schemas = self
            .schemas
            .read()
            .map_err(|e| FlowError::Lock(format!("schema registry: {}", e)))?;
        match schemas.get(&(event_type, 1)) {
            Some(schema) => schema
                .check(payload)
                .map_err(|reason| validation_error(event_type, reason)),
            None => Ok(()),
        }
    }
}

impl Default for MemorySchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn validation_error(event_type: EventType, reason: String) -> FlowError {
    match event_type {
        EventType::ResponseChunk => FlowError::InvalidChunkFormat(reason),
        other => FlowError::InputProcessing(format!("{} payload: {}", other, reason)),
    }
}

impl SchemaRegistry for MemorySchemaRegistry {
    fn register(&self, schema: PayloadSchema) -> Result<()> {
        if schema.version == 0 {
            return Err(FlowError::Config("Schema version must be >= 1".to_string()));
        }

        let mut schemas = self
            .schemas
            .write()
            .map_err(|e| FlowError::Lock(format!("schema registry: {}", e)))?;
        schemas.insert((schema.event_type, schema.version), schema);
        Ok(())
    }

    fn get(&self, event_type: EventType, version: u32) -> Result<Option<PayloadSchema>> {
        let schemas = self
            .schemas
            .read()
            .map_err(|e| FlowError::Lock(format!("schema registry: {}", e)))?;
        Ok(schemas.get(&(event_type, version)).cloned())
    }

    fn list_types(&self) -> Result<Vec<EventType>> {
        let schemas = self
            .schemas
            .read()
            .map_err(|e| FlowError::Lock(format!("schema registry: {}", e)))?;
        let mut types: Vec<EventType> = schemas.keys().map(|(t, _)| *t).collect();
        types.sort_by_key(|t| t.as_str());
        types.dedup();
        Ok(types)
    }

    fn validate(&self, event: &Event) -> Result<()> {
        let schemas = self
            .schemas
            .read()
            .map_err(|e| FlowError::Lock(format!("schema registry: {}", e)))?;

        let schema = match schemas.get(&(event.event_type, event.version)) {
            Some(s) => s,
            None => return Ok(()), // No schema registered, pass through
        };

        schema
            .check(&event.payload)
            .map_err(|reason| validation_error(event.event_type, reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_get() {
        let reg = MemorySchemaRegistry::new();
        reg.register(PayloadSchema::new(EventType::StatusUpdate, &["state"]))
            .unwrap();

        let schema = reg.get(EventType::StatusUpdate, 1).unwrap().unwrap();
        assert_eq!(schema.required_fields, vec!["state"]);
        assert!(reg.get(EventType::StatusUpdate, 2).unwrap().is_none());
    }

    #[test]
    fn test_register_zero_version_fails() {
        let reg = MemorySchemaRegistry::new();
        let mut schema = PayloadSchema::new(EventType::StatusUpdate, &[]);
        schema.version = 0;
        assert!(reg.register(schema).is_err());
    }

    #[test]
    fn test_defaults_cover_inbound_events() {
        let reg = MemorySchemaRegistry::with_defaults();
        let types = reg.list_types().unwrap();
        assert!(types.contains(&EventType::UserInput));
        assert!(types.contains(&EventType::CancelOperation));
        assert!(types.contains(&EventType::ResponseChunk));
    }

    #[test]
    fn test_chunk_without_content_is_invalid_chunk() {
        let reg = MemorySchemaRegistry::with_defaults();
        let err = reg
            .validate_payload(EventType::ResponseChunk, &serde_json::json!({"text": "hi"}))
            .unwrap_err();
        assert!(matches!(err, FlowError::InvalidChunkFormat(_)));

        let err = reg
            .validate_payload(EventType::ResponseChunk, &serde_json::json!({"content": 42}))
            .unwrap_err();
        assert!(matches!(err, FlowError::InvalidChunkFormat(_)));

        assert!(reg
            .validate_payload(EventType::ResponseChunk, &serde_json::json!({"content": "ok"}))
            .is_ok());
    }

    #[test]
    fn test_validate_event() {
        let reg = MemorySchemaRegistry::with_defaults();

        let valid = Event::new(
            EventType::UserInput,
            serde_json::json!({"text": "hi", "session_id": "s1"}),
        );
        assert!(reg.validate(&valid).is_ok());

        let invalid = Event::new(EventType::UserInput, serde_json::json!({"text": "hi"}));
        let err = reg.validate(&invalid).unwrap_err();
        assert!(matches!(err, FlowError::InputProcessing(_)));
        assert!(err.to_string().contains("session_id"));

        let not_object = Event::new(EventType::UserInput, serde_json::json!("hi"));
        assert!(reg.validate(&not_object).is_err());
    }

    #[test]
    fn test_unregistered_type_passes() {
        let reg = MemorySchemaRegistry::with_defaults();
        let event = Event::new(EventType::GenerationStart, serde_json::json!(null));
        assert!(reg.validate(&event).is_ok());

        let v2 = Event::new(EventType::UserInput, serde_json::json!({})).with_version(2);
        assert!(reg.validate(&v2).is_ok());
    }
}
