//! # a3s-flow
//!
//! Event-driven orchestration for a retrieval-augmented conversational
//! assistant.
//!
//! ## Overview
//!
//! Every interaction enters as an event on the [`EventBus`]. The
//! [`ProcessController`] admits each `user_input` under a concurrency cap,
//! sanitizes it, and either hands it to the [`CommandGate`](gate::CommandGate)
//! or answers it: hybrid retrieval, prompt assembly, streamed generation
//! and session persistence. Every stage reports progress and failures as
//! events of its own; nothing is raised back to the publisher.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a3s_flow::{
//!     DeliveryMode, EventBus, EventType, FlowConfig, OllamaBackend, ProcessController,
//!     SessionStore,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> a3s_flow::Result<()> {
//! let config = FlowConfig::default();
//! let bus = Arc::new(EventBus::from_config(&config.bus));
//! let model = Arc::new(OllamaBackend::new(config.model.ollama.clone())?);
//! let sessions = Arc::new(SessionStore::from_config(&config.session));
//!
//! let controller = Arc::new(ProcessController::new(bus.clone(), model, sessions, config)?);
//! controller.register()?;
//!
//! bus.publish(
//!     EventType::UserInput,
//!     serde_json::json!({"text": "What is a vector store?", "session_id": "s1"}),
//!     DeliveryMode::Async,
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **bus**: typed publish/subscribe with sync and pooled async delivery
//! - **controller**: admission, cancellation and the pipeline itself
//! - **gate**: input sanitizing, command classification and execution
//! - **retrieval**: hybrid vector search, fusion and enrichment
//! - **model**: streaming model backends (Ollama)
//! - **session**: per-session history and the streaming response buffer
//! - **persist**: session persistence backends
//! - **schema**: inbound payload contracts
//! - **config**: YAML/JSON configuration with `${VAR:default}` expansion

pub mod bus;
pub mod config;
pub mod controller;
pub mod error;
pub mod gate;
pub mod logging;
pub mod model;
pub mod persist;
pub mod prompt;
pub mod retrieval;
pub mod schema;
pub mod session;
pub mod types;

// Re-export core types
pub use bus::{handler_fn, EventBus, EventHandler, HandlerKind, SubscriptionId};
pub use config::FlowConfig;
pub use controller::{PipelineOutcome, ProcessController};
pub use error::{FlowError, Result};
pub use gate::{CommandGate, CommandOutcome, CommandStatus};
pub use logging::{init_tracing, LoggingConfig};
pub use model::{ChatMessage, FragmentStream, ModelBackend, OllamaBackend, OllamaConfig};
pub use persist::{FileSessionPersistence, MemorySessionPersistence, SessionPersistence};
pub use retrieval::{
    KnowledgeItem, MemoryVectorStore, RetrievalConfig, SearchHit, SearchKind, VectorStore,
};
pub use schema::{MemorySchemaRegistry, PayloadSchema, SchemaRegistry};
pub use session::{Message, Role, Session, SessionStore};
pub use types::{DeliveryMode, Event, EventType, UserInput};
