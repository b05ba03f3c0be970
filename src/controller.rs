//! Process controller
//!
//! Turns one `user_input` event into a supervised tree of tasks:
//! admission → sanitize → branch → (command | retrieve → generate → stream
//! → persist). Every failure inside the tree is reported once as an
//! `error` event; nothing propagates back to the publisher.
//!
//! Concurrency is bounded by a semaphore of `task_control.max_concurrent_tasks`
//! permits. Each input registers a cancellation token under its session id
//! before it waits for a permit, so `cancel_operation` reaches inputs that
//! are still queued as well as those already running.

use crate::bus::{handler_fn, EventBus, SubscriptionId};
use crate::config::FlowConfig;
use crate::error::{FlowError, Result};
use crate::gate::CommandGate;
use crate::model::ModelBackend;
use crate::prompt::{build_messages, split_reasoning, summarize};
use crate::retrieval::{enrich, KnowledgeItem, RetrievalOutcome, RetrievalService, VectorStore};
use crate::schema::{MemorySchemaRegistry, SchemaRegistry};
use crate::session::{Message, Role, SessionStore};
use crate::types::{DeliveryMode, Event, EventType, RetrieveRequest, SessionRef, UserInput};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Terminal state of one input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// QA turn finished, or the input was empty
    Completed,
    /// Input went to the command gate (run or refused)
    CommandDispatched,
    Cancelled,
    /// A stage failed; an `error` event was published
    Failed,
}

/// State of one QA attempt
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub session_id: String,
    pub question: String,
    pub correlation_id: String,
    pub knowledge: Vec<KnowledgeItem>,
    pub cancel: CancellationToken,
}

/// Metadata attached to the finalized assistant message
#[derive(Debug, Clone, Serialize)]
struct CompletionMetadata<'a> {
    model: &'a str,
    generated_at: DateTime<Utc>,
    response_time_ms: u64,
    sources: &'a [String],
    correlation_id: &'a str,
}

/// session id → task id → token
#[derive(Default)]
struct ActiveTasks {
    tasks: Mutex<HashMap<String, HashMap<u64, CancellationToken>>>,
    next_id: AtomicU64,
}

impl ActiveTasks {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, HashMap<u64, CancellationToken>>> {
        // The map holds no invariants a panicking holder could break
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(self: &Arc<Self>, session_id: &str) -> TaskGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.lock()
            .entry(session_id.to_string())
            .or_default()
            .insert(id, token.clone());
        TaskGuard {
            tasks: Arc::clone(self),
            session_id: session_id.to_string(),
            id,
            token,
        }
    }

    fn cancel_session(&self, session_id: &str) -> usize {
        let tasks = self.lock();
        let Some(tokens) = tasks.get(session_id) else {
            return 0;
        };
        for token in tokens.values() {
            token.cancel();
        }
        tokens.len()
    }

    fn count(&self, session_id: &str) -> usize {
        self.lock().get(session_id).map_or(0, |t| t.len())
    }
}

/// Deregisters its token when the task it belongs to ends
struct TaskGuard {
    tasks: Arc<ActiveTasks>,
    session_id: String,
    id: u64,
    token: CancellationToken,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let mut tasks = self.tasks.lock();
        if let Some(tokens) = tasks.get_mut(&self.session_id) {
            tokens.remove(&self.id);
            if tokens.is_empty() {
                tasks.remove(&self.session_id);
            }
        }
    }
}

/// Race `fut` against the session token
async fn cancellable<F: Future>(token: &CancellationToken, fut: F) -> Result<F::Output> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(FlowError::Cancelled),
        out = fut => Ok(out),
    }
}

/// Orchestrates the pipeline for every session
pub struct ProcessController {
    bus: Arc<EventBus>,
    gate: CommandGate,
    retrieval: Option<RetrievalService>,
    model: Arc<dyn ModelBackend>,
    sessions: Arc<SessionStore>,
    schemas: MemorySchemaRegistry,
    config: FlowConfig,
    permits: Arc<Semaphore>,
    active: Arc<ActiveTasks>,
}

impl ProcessController {
    /// Create a controller without a vector store
    ///
    /// Until [`with_vector_store`](Self::with_vector_store) is called, QA
    /// turns report a `retrieval_error` and answer without knowledge.
    pub fn new(
        bus: Arc<EventBus>,
        model: Arc<dyn ModelBackend>,
        sessions: Arc<SessionStore>,
        config: FlowConfig,
    ) -> Result<Self> {
        config.validate()?;
        let gate = CommandGate::new(&config.gate.extra_danger_patterns)?;
        Ok(Self {
            bus,
            gate,
            retrieval: None,
            model,
            sessions,
            schemas: MemorySchemaRegistry::with_defaults(),
            permits: Arc::new(Semaphore::new(config.task_control.max_concurrent_tasks)),
            active: Arc::new(ActiveTasks::default()),
            config,
        })
    }

    /// Attach the vector store used for hybrid retrieval
    pub fn with_vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.retrieval = Some(RetrievalService::new(
            store,
            self.config.retrieval.clone(),
            self.config.task_control.retrieval_timeout(),
        ));
        self
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Permits not currently held by a running input
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    /// Inputs registered (queued or running) for a session
    pub fn active_tasks(&self, session_id: &str) -> usize {
        self.active.count(session_id)
    }

    /// Subscribe the controller to its inbound events
    pub fn register(self: &Arc<Self>) -> Result<Vec<SubscriptionId>> {
        let mut ids = Vec::with_capacity(4);

        let this = Arc::clone(self);
        ids.push(self.bus.subscribe(
            EventType::UserInput,
            handler_fn("process_controller.user_input", move |event| {
                let this = Arc::clone(&this);
                async move {
                    match this.decode::<UserInput>(&event) {
                        // Detached: admission must not hold a bus worker
                        Ok(input) => drop(this.submit(input)),
                        Err(e) => this.publish_error(&e, event.payload.clone(), None).await,
                    }
                    Ok(())
                }
            }),
        )?);

        let this = Arc::clone(self);
        ids.push(self.bus.subscribe(
            EventType::CancelOperation,
            handler_fn("process_controller.cancel", move |event| {
                let this = Arc::clone(&this);
                async move {
                    match this.decode::<SessionRef>(&event) {
                        Ok(target) => {
                            this.cancel_session(&target.session_id);
                        }
                        Err(e) => this.publish_error(&e, event.payload.clone(), None).await,
                    }
                    Ok(())
                }
            }),
        )?);

        let this = Arc::clone(self);
        ids.push(self.bus.subscribe(
            EventType::ClearHistory,
            handler_fn("process_controller.clear_history", move |event| {
                let this = Arc::clone(&this);
                async move {
                    match this.decode::<SessionRef>(&event) {
                        Ok(target) => this.clear_history(&target.session_id).await,
                        Err(e) => {
                            this.publish_error(&e, event.payload.clone(), None).await;
                            Ok(())
                        }
                    }
                }
            }),
        )?);

        let this = Arc::clone(self);
        ids.push(self.bus.subscribe(
            EventType::RetrieveKnowledge,
            handler_fn("process_controller.retrieve", move |event| {
                let this = Arc::clone(&this);
                async move {
                    match this.decode::<RetrieveRequest>(&event) {
                        Ok(request) => this.handle_retrieve_request(request).await,
                        Err(e) => this.publish_error(&e, event.payload.clone(), None).await,
                    }
                    Ok(())
                }
            }),
        )?);

        tracing::info!("Process controller registered");
        Ok(ids)
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, event: &Event) -> Result<T> {
        self.schemas.validate(event)?;
        event
            .payload_as()
            .map_err(|e| FlowError::InputProcessing(format!("{} payload: {}", event.event_type, e)))
    }

    /// Process one input to a terminal state
    ///
    /// Waits for a concurrency slot; the wait ends early if the session is
    /// cancelled. The pipeline itself runs in its own task.
    pub async fn handle_user_input(self: &Arc<Self>, input: UserInput) -> PipelineOutcome {
        if input.text.trim().is_empty() {
            return PipelineOutcome::Completed;
        }
        let guard = self.active.register(&input.session_id);
        self.admit_and_run(input, guard).await
    }

    /// Start processing an input in the background
    ///
    /// The input is registered for cancellation before this returns, so a
    /// `cancel_operation` published afterwards always reaches it.
    pub fn submit(self: &Arc<Self>, input: UserInput) -> JoinHandle<PipelineOutcome> {
        let guard = (!input.text.trim().is_empty()).then(|| self.active.register(&input.session_id));
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match guard {
                Some(guard) => this.admit_and_run(input, guard).await,
                None => PipelineOutcome::Completed,
            }
        })
    }

    async fn admit_and_run(self: &Arc<Self>, input: UserInput, guard: TaskGuard) -> PipelineOutcome {
        let token = guard.token.clone();

        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => {
                tracing::info!(session_id = %input.session_id, "Input cancelled while queued");
                self.publish_status(&input.session_id, None, "cancelled").await;
                return PipelineOutcome::Cancelled;
            }
            permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => {
                    let err = FlowError::InputProcessing("controller is closed".to_string());
                    self.publish_error(&err, json!(input.text), None).await;
                    return PipelineOutcome::Failed;
                }
            },
        };

        let this = Arc::clone(self);
        let session_id = input.session_id.clone();
        let question = input.text.clone();
        let handle = tokio::spawn(async move {
            // Held for the lifetime of the pipeline task
            let _permit = permit;
            let _guard = guard;
            this.run_pipeline(input, token).await
        });

        match handle.await {
            Ok(outcome) => outcome,
            Err(join) => {
                let reason = if join.is_panic() {
                    panic_message(join.into_panic())
                } else {
                    join.to_string()
                };
                tracing::error!(session_id = %session_id, error = %reason, "Pipeline task aborted");
                self.emit(
                    EventType::Error,
                    json!({"stage": "processing", "message": reason, "context": question}),
                    DeliveryMode::Async,
                )
                .await;
                self.publish_status(&session_id, None, "idle").await;
                PipelineOutcome::Failed
            }
        }
    }

    /// Cancel every queued or running input of a session
    pub fn cancel_session(&self, session_id: &str) -> usize {
        let cancelled = self.active.cancel_session(session_id);
        tracing::info!(session_id = %session_id, cancelled, "Session cancellation requested");
        cancelled
    }

    /// Erase a session's history and announce it
    pub async fn clear_history(&self, session_id: &str) -> Result<()> {
        self.sessions.clear_history(session_id)?;
        self.emit(
            EventType::HistoryCleared,
            json!({"session_id": session_id}),
            DeliveryMode::Async,
        )
        .await;
        Ok(())
    }

    async fn handle_retrieve_request(self: &Arc<Self>, request: RetrieveRequest) {
        let guard = self.active.register(&request.session_id);
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let result = self
            .retrieve(&request.session_id, &request.question, &correlation_id, &guard.token)
            .await;
        match result {
            Ok(_) => {}
            Err(FlowError::Cancelled) => {
                self.publish_status(&request.session_id, Some(&correlation_id), "cancelled")
                    .await;
            }
            Err(e) => {
                self.publish_error(&e, json!(request.question), Some(&correlation_id))
                    .await
            }
        }
    }

    async fn run_pipeline(&self, input: UserInput, token: CancellationToken) -> PipelineOutcome {
        let sanitized = self.gate.sanitize(&input.text);
        if sanitized.is_empty() {
            tracing::debug!(session_id = %input.session_id, "Input empty after sanitizing");
            return PipelineOutcome::Completed;
        }

        // Explicit commands run as typed, minus the marker
        let explicit = self.gate.is_explicit_command(&input.text);
        let command = self.gate.strip_command_marker(&input.text);
        let dangerous = self.gate.is_dangerous(&input.text)
            || self.gate.is_dangerous(&sanitized)
            || (explicit
                && (self.gate.is_dangerous_command(command)
                    || self
                        .gate
                        .is_dangerous_command(self.gate.strip_command_marker(&sanitized))));
        let to_gate = dangerous || explicit;

        // QA attempts are correlated from their first event
        let correlation_id = (!to_gate).then(|| uuid::Uuid::new_v4().to_string());
        let cid = correlation_id.as_deref();

        self.publish_status(&input.session_id, cid, "processing").await;

        let result = match cid {
            None => {
                self.command_flow(&input.session_id, command, dangerous, &token)
                    .await
            }
            Some(cid) => self.qa_flow(&input, cid, &token).await,
        };

        match result {
            Ok(outcome) => {
                self.publish_status(&input.session_id, cid, "idle").await;
                outcome
            }
            Err(FlowError::Cancelled) => {
                tracing::info!(session_id = %input.session_id, "Pipeline cancelled");
                self.publish_status(&input.session_id, cid, "cancelled").await;
                PipelineOutcome::Cancelled
            }
            Err(e) => {
                self.publish_error(&e, json!(input.text), cid).await;
                self.publish_status(&input.session_id, cid, "idle").await;
                PipelineOutcome::Failed
            }
        }
    }

    async fn command_flow(
        &self,
        session_id: &str,
        command: &str,
        dangerous: bool,
        token: &CancellationToken,
    ) -> Result<PipelineOutcome> {
        if dangerous {
            tracing::warn!(session_id = %session_id, command = %command, "Dangerous command refused");
            self.emit(
                EventType::SecurityAlert,
                json!({"type": "dangerous_command", "command": command, "session_id": session_id}),
                DeliveryMode::Async,
            )
            .await;
            return Ok(PipelineOutcome::CommandDispatched);
        }

        if command.is_empty() {
            return Err(FlowError::InputProcessing("empty command".to_string()));
        }

        self.emit(
            EventType::CommandStart,
            json!({"command": command, "session_id": session_id}),
            DeliveryMode::Async,
        )
        .await;

        let timeout = self.config.task_control.command_timeout();
        let outcome = cancellable(token, self.gate.execute(command, timeout)).await?;

        if outcome.timed_out {
            return Err(FlowError::CommandTimeout {
                command: command.to_string(),
                timeout_ms: self.config.task_control.command_timeout_ms,
            });
        }

        let (ty, summary) = if outcome.is_success() {
            (
                EventType::CommandSuccess,
                json!({"status": "success", "output": outcome.output, "session_id": session_id}),
            )
        } else {
            (
                EventType::CommandError,
                json!({"status": "error", "error": outcome.error, "session_id": session_id}),
            )
        };
        self.emit(ty, summary, DeliveryMode::Async).await;

        let mut result = serde_json::to_value(&outcome)?;
        if let Some(map) = result.as_object_mut() {
            map.insert("command".into(), json!(command));
            map.insert("session_id".into(), json!(session_id));
        }
        self.emit(EventType::CommandResult, result, DeliveryMode::Async).await;

        Ok(PipelineOutcome::CommandDispatched)
    }

    async fn qa_flow(
        &self,
        input: &UserInput,
        correlation_id: &str,
        token: &CancellationToken,
    ) -> Result<PipelineOutcome> {
        let mut ctx = PipelineContext {
            session_id: input.session_id.clone(),
            question: input.text.trim().to_string(),
            correlation_id: correlation_id.to_string(),
            knowledge: Vec::new(),
            cancel: token.clone(),
        };

        let span = tracing::info_span!(
            "a3s.flow.qa",
            session_id = %ctx.session_id,
            correlation_id = %ctx.correlation_id,
        );

        let prior = self
            .sessions
            .history(&ctx.session_id, self.config.model.history_messages)?;
        self.sessions.add_message(
            &ctx.session_id,
            Message::new(Role::User, ctx.question.clone())
                .with_metadata("correlation_id", ctx.correlation_id.clone()),
        )?;
        self.sessions.begin_turn(&ctx.session_id, &ctx.correlation_id)?;

        let result = self.answer(&mut ctx, &prior).instrument(span).await;
        if result.is_err() {
            self.sessions
                .abandon_turn(&ctx.session_id, &ctx.correlation_id)?;
        }
        result.map(|()| PipelineOutcome::Completed)
    }

    /// Retrieve, generate, stream and finalize one QA turn
    async fn answer(&self, ctx: &mut PipelineContext, prior: &[Message]) -> Result<()> {
        ctx.knowledge = self
            .retrieve(&ctx.session_id, &ctx.question, &ctx.correlation_id, &ctx.cancel)
            .await?;

        let messages = build_messages(
            &self.config.model.system_prompt,
            prior,
            &ctx.question,
            &ctx.knowledge,
        );
        let mut sources: Vec<String> = Vec::new();
        for item in &ctx.knowledge {
            if !sources.contains(&item.source) {
                sources.push(item.source.clone());
            }
        }

        let started = Instant::now();
        let start_time = Utc::now();
        self.emit(
            EventType::GenerationStart,
            json!({
                "question": ctx.question,
                "session_id": ctx.session_id,
                "correlation_id": ctx.correlation_id,
                "model": self.model.model_name(),
                "sources": sources,
                "start_time": start_time,
            }),
            DeliveryMode::Async,
        )
        .await;
        self.emit(
            EventType::StreamStart,
            json!({"session_id": ctx.session_id, "correlation_id": ctx.correlation_id}),
            DeliveryMode::Sync,
        )
        .await;

        let mut fragments = self.model.chat(messages, self.config.model.stream);
        while let Some(fragment) = cancellable(&ctx.cancel, fragments.next()).await? {
            let fragment = fragment?;
            if fragment.is_empty() {
                continue;
            }
            let content = self.gate.filter_response(&fragment);
            self.process_chunk(ctx, json!({ "content": content })).await?;
        }

        let metadata = CompletionMetadata {
            model: self.model.model_name(),
            generated_at: Utc::now(),
            response_time_ms: started.elapsed().as_millis() as u64,
            sources: &sources,
            correlation_id: &ctx.correlation_id,
        };
        let metadata_value =
            serde_json::to_value(&metadata).map_err(|e| FlowError::Metadata(e.to_string()))?;

        let model_cfg = &self.config.model;
        let finalized = self.sessions.finalize_turn(&ctx.session_id, &ctx.correlation_id, |text| {
            let (thought, answer) =
                split_reasoning(&text, &model_cfg.reasoning_start, &model_cfg.reasoning_end);
            let summary = summarize(&answer, model_cfg.summary_max_chars);
            let mut message = Message::new(Role::Assistant, answer)
                .with_summary(summary)
                .with_metadata("model", metadata.model)
                .with_metadata("generated_at", metadata.generated_at.to_rfc3339())
                .with_metadata("response_time_ms", metadata.response_time_ms.to_string())
                .with_metadata("sources", metadata.sources.join(","))
                .with_metadata("correlation_id", metadata.correlation_id);
            if let Some(thought) = thought {
                message = message.with_thought(thought);
            }
            message
        })?;

        // The turn was superseded by a newer input on the same session
        let Some(message) = finalized else {
            return Err(FlowError::Cancelled);
        };

        self.emit(
            EventType::StreamEnd,
            json!({
                "session_id": ctx.session_id,
                "correlation_id": ctx.correlation_id,
                "metadata": metadata_value,
            }),
            DeliveryMode::Sync,
        )
        .await;
        self.emit(
            EventType::GenerationComplete,
            json!({
                "session_id": ctx.session_id,
                "correlation_id": ctx.correlation_id,
                "status": "success",
                "content": message.content,
                "thought": message.thought,
                "summary": message.summary,
                "suggested_commands": self.gate.detect_commands(&message.content),
                "metadata": metadata_value,
            }),
            DeliveryMode::Async,
        )
        .await;

        tracing::info!(
            session_id = %ctx.session_id,
            correlation_id = %ctx.correlation_id,
            response_time_ms = metadata.response_time_ms,
            "Response generated"
        );
        Ok(())
    }

    /// Hybrid search plus enrichment, publishing `knowledge_result`
    ///
    /// A timeout or a missing vector store is reported and degrades to no
    /// knowledge; any other search failure is returned.
    async fn retrieve(
        &self,
        session_id: &str,
        question: &str,
        correlation_id: &str,
        token: &CancellationToken,
    ) -> Result<Vec<KnowledgeItem>> {
        let Some(service) = &self.retrieval else {
            self.emit(
                EventType::Error,
                json!({
                    "stage": "retrieval_error",
                    "message": "Vector store not configured",
                    "context": question,
                    "session_id": session_id,
                    "correlation_id": correlation_id,
                }),
                DeliveryMode::Async,
            )
            .await;
            return Ok(Vec::new());
        };

        let top_k = service.config().top_k;
        let items = match cancellable(token, service.hybrid_search(question, top_k)).await? {
            RetrievalOutcome::Items(items) => enrich(items, Utc::now(), service.config()),
            RetrievalOutcome::Timeout => {
                let err = FlowError::RetrievalTimeout(service.timeout().as_millis() as u64);
                self.publish_error(&err, json!(question), Some(correlation_id))
                    .await;
                Vec::new()
            }
            RetrievalOutcome::Failed(reason) => return Err(FlowError::Retrieval(reason)),
        };

        self.emit(
            EventType::KnowledgeResult,
            json!({
                "session_id": session_id,
                "correlation_id": correlation_id,
                "items": items,
            }),
            DeliveryMode::Async,
        )
        .await;
        Ok(items)
    }

    /// Validate, buffer and broadcast one chunk payload
    ///
    /// The payload must carry a string `content`; anything else is refused
    /// before it touches the session or the bus.
    pub(crate) async fn process_chunk(&self, ctx: &PipelineContext, chunk: Value) -> Result<()> {
        self.schemas
            .validate_payload(EventType::ResponseChunk, &chunk)?;
        let content = chunk
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| FlowError::InvalidChunkFormat("content must be a string".to_string()))?;
        if content.is_empty() {
            return Ok(());
        }
        if ctx.cancel.is_cancelled() {
            return Err(FlowError::Cancelled);
        }
        if !self
            .sessions
            .append_chunk(&ctx.session_id, &ctx.correlation_id, content)?
        {
            return Err(FlowError::Cancelled);
        }

        self.emit(
            EventType::ResponseChunk,
            json!({
                "chunk": chunk,
                "session_id": ctx.session_id,
                "correlation_id": ctx.correlation_id,
            }),
            DeliveryMode::Sync,
        )
        .await;
        Ok(())
    }

    async fn publish_status(&self, session_id: &str, correlation_id: Option<&str>, state: &str) {
        self.emit(
            EventType::StatusUpdate,
            json!({"state": state, "session_id": session_id, "correlation_id": correlation_id}),
            DeliveryMode::Async,
        )
        .await;
    }

    async fn publish_error(&self, err: &FlowError, context: Value, correlation_id: Option<&str>) {
        tracing::error!(
            stage = err.stage(),
            correlation_id = correlation_id.unwrap_or_default(),
            error = %err,
            "Pipeline stage failed"
        );
        self.emit(
            EventType::Error,
            json!({
                "stage": err.stage(),
                "message": err.to_string(),
                "context": context,
                "correlation_id": correlation_id,
            }),
            DeliveryMode::Async,
        )
        .await;
    }

    async fn emit(&self, event_type: EventType, payload: Value, mode: DeliveryMode) {
        if let Err(e) = self.bus.publish(event_type, payload, mode).await {
            tracing::error!(event_type = %event_type, error = %e, "Failed to publish event");
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("pipeline panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("pipeline panicked: {}", s)
    } else {
        "pipeline panicked".to_string()
    }
}
