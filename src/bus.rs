//! In-process event bus with typed subscriptions
//!
//! `EventBus` maps each [`EventType`] to an ordered list of handlers and
//! dispatches published events either inline on the caller's task
//! ([`DeliveryMode::Sync`]) or on a bounded worker pool
//! ([`DeliveryMode::Async`]).
//!
//! Handler failures (errors and panics) are isolated per handler, logged,
//! and re-published as an [`EventType::Error`] event. A failing `error`
//! handler is only logged, so a broken error handler can never cause
//! unbounded fan-out.

use crate::config::BusConfig;
use crate::error::{FlowError, Result};
use crate::types::{DeliveryMode, Event, EventType};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Semaphore;

/// Upper bound on async dispatch workers
const MAX_WORKERS: usize = 32;

/// Asynchronous event handler
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handler name, used in logs and error events
    fn name(&self) -> &str;

    /// Handle one event
    async fn handle(&self, event: &Event) -> Result<()>;
}

/// Synchronous handler closure
pub type BlockingHandler = Arc<dyn Fn(&Event) -> Result<()> + Send + Sync>;

/// Execution capability a subscriber declares at subscribe time
#[derive(Clone)]
pub enum HandlerKind {
    /// Awaited on the dispatching task (sync) or spawned (async)
    Async(Arc<dyn EventHandler>),
    /// Called inline (sync) or on the blocking pool (async)
    Blocking(BlockingHandler),
}

/// Identifier returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    name: String,
    kind: HandlerKind,
}

/// Adapter turning an async closure into an [`EventHandler`]
pub struct FnHandler<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        (self.f)(event.clone()).await
    }
}

/// Wrap an async closure as a shareable handler
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}

/// State shared with spawned dispatch tasks
struct Shared {
    /// event type → handlers, replaced wholesale on every change
    subscriptions: RwLock<HashMap<EventType, Arc<Vec<Subscription>>>>,
    workers: Arc<Semaphore>,
    closed: AtomicBool,
}

impl Shared {
    fn snapshot(&self, event_type: EventType) -> Result<Option<Arc<Vec<Subscription>>>> {
        let subs = self
            .subscriptions
            .read()
            .map_err(|e| FlowError::Lock(format!("subscription registry: {}", e)))?;
        Ok(subs.get(&event_type).filter(|list| !list.is_empty()).cloned())
    }

    /// Build the error event for a failed handler, or `None` when the
    /// failing event is itself an error event.
    fn failure_event(event: &Event, handler: &str, reason: &str) -> Option<Event> {
        tracing::error!(
            event_type = %event.event_type,
            event_id = %event.id,
            handler = %handler,
            error = %reason,
            "Event handler failed"
        );

        if event.event_type == EventType::Error {
            return None;
        }

        Some(Event::new(
            EventType::Error,
            serde_json::json!({
                "event_type": event.event_type.as_str(),
                "handler": handler,
                "error": reason,
                "stack_trace": std::backtrace::Backtrace::capture().to_string(),
            }),
        ))
    }

    /// Dispatch an error event to `error` subscribers without re-publishing
    /// their own failures
    async fn deliver_failure_inline(&self, error_event: Event) {
        let subs = match self.snapshot(EventType::Error) {
            Ok(Some(subs)) => subs,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(error = %e, "Cannot deliver error event");
                return;
            }
        };
        for sub in subs.iter() {
            if let Err(reason) = invoke_inline(sub, &error_event).await {
                tracing::error!(handler = %sub.name, error = %reason, "Error handler failed");
            }
        }
    }

    fn deliver_failure_spawned(self: &Arc<Self>, error_event: Event) {
        let subs = match self.snapshot(EventType::Error) {
            Ok(Some(subs)) => subs,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(error = %e, "Cannot deliver error event");
                return;
            }
        };
        let error_event = Arc::new(error_event);
        for sub in subs.iter().cloned() {
            let shared = Arc::clone(self);
            let event = Arc::clone(&error_event);
            tokio::spawn(async move {
                let Ok(_permit) = shared.workers.clone().acquire_owned().await else {
                    return;
                };
                if let Err(reason) = invoke_spawned(&sub, event).await {
                    tracing::error!(handler = %sub.name, error = %reason, "Error handler failed");
                }
            });
        }
    }
}

/// Run a handler on the current task, catching errors and panics
async fn invoke_inline(sub: &Subscription, event: &Event) -> std::result::Result<(), String> {
    let outcome = match &sub.kind {
        HandlerKind::Async(handler) => AssertUnwindSafe(handler.handle(event)).catch_unwind().await,
        HandlerKind::Blocking(f) => std::panic::catch_unwind(AssertUnwindSafe(|| (**f)(event))),
    };
    flatten(outcome)
}

/// Run a handler as part of an async dispatch
async fn invoke_spawned(sub: &Subscription, event: Arc<Event>) -> std::result::Result<(), String> {
    match &sub.kind {
        HandlerKind::Async(handler) => {
            flatten(AssertUnwindSafe(handler.handle(event.as_ref())).catch_unwind().await)
        }
        HandlerKind::Blocking(f) => {
            let f = Arc::clone(f);
            match tokio::task::spawn_blocking(move || (*f)(event.as_ref())).await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(join) if join.is_panic() => Err(panic_message(join.into_panic())),
                Err(join) => Err(join.to_string()),
            }
        }
    }
}

fn flatten(
    outcome: std::thread::Result<Result<()>>,
) -> std::result::Result<(), String> {
    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(panic) => Err(panic_message(panic)),
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}

/// Typed publish/subscribe dispatcher
///
/// Cheap to share behind an `Arc`; every component that publishes or
/// subscribes receives the same instance.
pub struct EventBus {
    shared: Arc<Shared>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create a bus with the default worker pool size (`min(32, cpus + 4)`)
    pub fn new() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_workers(MAX_WORKERS.min(cpus + 4))
    }

    /// Create a bus with an explicit async worker pool size
    pub fn with_workers(workers: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                subscriptions: RwLock::new(HashMap::new()),
                workers: Arc::new(Semaphore::new(workers.max(1))),
                closed: AtomicBool::new(false),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create a bus sized by configuration
    pub fn from_config(config: &BusConfig) -> Self {
        config.workers.map_or_else(Self::new, Self::with_workers)
    }

    /// Subscribe an async handler
    pub fn subscribe(
        &self,
        event_type: EventType,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionId> {
        let name = handler.name().to_string();
        self.insert(event_type, name, HandlerKind::Async(handler))
    }

    /// Subscribe a synchronous closure
    pub fn subscribe_blocking<F>(
        &self,
        event_type: EventType,
        name: impl Into<String>,
        f: F,
    ) -> Result<SubscriptionId>
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.insert(event_type, name.into(), HandlerKind::Blocking(Arc::new(f)))
    }

    fn insert(
        &self,
        event_type: EventType,
        name: String,
        kind: HandlerKind,
    ) -> Result<SubscriptionId> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subs = self
            .shared
            .subscriptions
            .write()
            .map_err(|e| FlowError::Lock(format!("subscription registry: {}", e)))?;

        let mut list: Vec<Subscription> = subs
            .get(&event_type)
            .map(|l| l.as_ref().clone())
            .unwrap_or_default();
        list.push(Subscription {
            id,
            name: name.clone(),
            kind,
        });
        subs.insert(event_type, Arc::new(list));

        tracing::debug!(event_type = %event_type, handler = %name, "Subscribed");
        Ok(id)
    }

    /// Remove a subscription; returns false if it was not registered
    pub fn unsubscribe(&self, event_type: EventType, id: SubscriptionId) -> Result<bool> {
        let mut subs = self
            .shared
            .subscriptions
            .write()
            .map_err(|e| FlowError::Lock(format!("subscription registry: {}", e)))?;

        let Some(current) = subs.get(&event_type) else {
            return Ok(false);
        };
        if !current.iter().any(|s| s.id == id) {
            return Ok(false);
        }

        let remaining: Vec<Subscription> =
            current.iter().filter(|s| s.id != id).cloned().collect();
        subs.insert(event_type, Arc::new(remaining));

        tracing::debug!(event_type = %event_type, ?id, "Unsubscribed");
        Ok(true)
    }

    /// Number of handlers registered for an event type
    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.shared
            .snapshot(event_type)
            .ok()
            .flatten()
            .map(|l| l.len())
            .unwrap_or(0)
    }

    /// Drop every subscription
    pub fn clear_subscriptions(&self) -> Result<()> {
        let mut subs = self
            .shared
            .subscriptions
            .write()
            .map_err(|e| FlowError::Lock(format!("subscription registry: {}", e)))?;
        subs.clear();
        Ok(())
    }

    /// Publish a payload, returning the number of handlers dispatched
    pub async fn publish(
        &self,
        event_type: EventType,
        payload: serde_json::Value,
        mode: DeliveryMode,
    ) -> Result<usize> {
        self.publish_event(Event::new(event_type, payload), mode).await
    }

    /// Publish a pre-built event
    ///
    /// In sync mode this returns once every handler has returned. In async
    /// mode it returns as soon as the handlers are scheduled.
    pub async fn publish_event(&self, event: Event, mode: DeliveryMode) -> Result<usize> {
        let Some(subs) = self.shared.snapshot(event.event_type)? else {
            return Ok(0);
        };

        tracing::debug!(
            event_type = %event.event_type,
            event_id = %event.id,
            handlers = subs.len(),
            ?mode,
            "Dispatching event"
        );

        match mode {
            DeliveryMode::Sync => {
                for sub in subs.iter() {
                    if let Err(reason) = invoke_inline(sub, &event).await {
                        if let Some(err) = Shared::failure_event(&event, &sub.name, &reason) {
                            self.shared.deliver_failure_inline(err).await;
                        }
                    }
                }
            }
            DeliveryMode::Async => {
                if self.shared.closed.load(Ordering::Acquire) {
                    tracing::warn!(
                        event_type = %event.event_type,
                        "Event bus is shut down, dropping async dispatch"
                    );
                    return Ok(0);
                }
                let event = Arc::new(event);
                for sub in subs.iter().cloned() {
                    let shared = Arc::clone(&self.shared);
                    let event = Arc::clone(&event);
                    tokio::spawn(async move {
                        let Ok(_permit) = shared.workers.clone().acquire_owned().await else {
                            tracing::debug!(handler = %sub.name, "Worker pool closed");
                            return;
                        };
                        if let Err(reason) = invoke_spawned(&sub, Arc::clone(&event)).await {
                            if let Some(err) = Shared::failure_event(&event, &sub.name, &reason) {
                                shared.deliver_failure_spawned(err);
                            }
                        }
                    });
                }
            }
        }

        Ok(subs.len())
    }

    /// Stop accepting async dispatch; queued async handlers are dropped
    pub fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.workers.close();
        tracing::info!("Event bus shut down");
    }

    /// Whether `shutdown` has been called
    pub fn is_shut_down(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
