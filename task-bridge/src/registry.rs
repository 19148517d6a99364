//! Task handler registry.
//!
//! Maps an envelope's `type` tag to the handler that processes it. Handlers
//! report an explicit [`Outcome`], which the dispatcher turns into an ack or a
//! reject. Tags without a handler go to the registry's fallback, which must be
//! chosen when the registry is built.

use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::queue::Envelope;

/// What to do with a delivery once its handler is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Acknowledge: the message is removed from the queue.
    Processed,
    /// Reject, returning the message to the queue when `requeue` is set.
    Rejected { requeue: bool },
}

impl Outcome {
    /// Reject and return the message to the queue for redelivery.
    pub const fn retry() -> Self {
        Outcome::Rejected { requeue: true }
    }

    /// Reject without requeue: the message is dropped (or dead-lettered by the
    /// broker, if the queue is set up for it).
    pub const fn discard() -> Self {
        Outcome::Rejected { requeue: false }
    }
}

/// A decoded delivery handed to a handler.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: Envelope,
    pub delivery_tag: u64,
    /// Set when the broker delivered this message before.
    pub redelivered: bool,
}

/// Processes one type of task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery) -> Outcome;
}

/// Handler built from an async closure. See [`handler_fn`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    async fn handle(&self, delivery: Delivery) -> Outcome {
        (self.0)(delivery).await
    }
}

/// Wrap an async closure as a [`TaskHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    FnHandler(f)
}

/// Policy for envelopes whose type has no registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackPolicy {
    /// Log and acknowledge. The message is lost.
    Acknowledge,
    /// Log and requeue, so another consumer that knows the type can take it.
    Requeue,
    /// Log and reject without requeue.
    Discard,
}

impl FromStr for FallbackPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ack" | "acknowledge" => Ok(FallbackPolicy::Acknowledge),
            "requeue" => Ok(FallbackPolicy::Requeue),
            "discard" | "reject" => Ok(FallbackPolicy::Discard),
            other => Err(format!("unknown fallback policy '{other}'")),
        }
    }
}

impl FallbackPolicy {
    fn outcome(self) -> Outcome {
        match self {
            FallbackPolicy::Acknowledge => Outcome::Processed,
            FallbackPolicy::Requeue => Outcome::retry(),
            FallbackPolicy::Discard => Outcome::discard(),
        }
    }
}

/// Fallback handler applying a [`FallbackPolicy`].
struct PolicyFallback(FallbackPolicy);

#[async_trait]
impl TaskHandler for PolicyFallback {
    async fn handle(&self, delivery: Delivery) -> Outcome {
        info!(
            task_type = %delivery.envelope.kind(),
            delivery_tag = delivery.delivery_tag,
            policy = ?self.0,
            "Not recognized task type"
        );
        self.0.outcome()
    }
}

/// Registry construction errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no fallback handler configured for unrecognized task types")]
    MissingFallback,

    #[error("task type tag must not be empty")]
    EmptyTag,

    #[error("a handler is already registered for task type '{0}'")]
    DuplicateTag(String),
}

/// Registry of task handlers by type tag.
pub struct TaskRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    fallback: Arc<dyn TaskHandler>,
}

impl TaskRegistry {
    pub fn builder() -> TaskRegistryBuilder {
        TaskRegistryBuilder::default()
    }

    /// Register a handler for `tag`.
    pub fn register<H: TaskHandler + 'static>(
        &self,
        tag: impl Into<String>,
        handler: H,
    ) -> Result<(), RegistryError> {
        let tag = tag.into();
        if tag.is_empty() {
            return Err(RegistryError::EmptyTag);
        }

        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(&tag) {
            return Err(RegistryError::DuplicateTag(tag));
        }
        handlers.insert(tag, Arc::new(handler));
        Ok(())
    }

    /// Handler registered for `tag`, if any.
    pub fn resolve(&self, tag: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tag)
            .cloned()
    }

    /// Handler for `tag`, or the fallback when none is registered.
    pub fn resolve_or_fallback(&self, tag: &str) -> Arc<dyn TaskHandler> {
        self.resolve(tag).unwrap_or_else(|| {
            warn!(task_type = %tag, "task_handler_not_found");
            Arc::clone(&self.fallback)
        })
    }

    pub fn has_handler(&self, tag: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(tag)
    }

    /// Registered tags, sorted.
    pub fn task_types(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        tags.sort();
        tags
    }
}

/// Builder validating the registry before it is used.
#[derive(Default)]
pub struct TaskRegistryBuilder {
    handlers: Vec<(String, Arc<dyn TaskHandler>)>,
    fallback: Option<Arc<dyn TaskHandler>>,
}

impl TaskRegistryBuilder {
    pub fn handler<H: TaskHandler + 'static>(mut self, tag: impl Into<String>, handler: H) -> Self {
        self.handlers.push((tag.into(), Arc::new(handler)));
        self
    }

    /// Use one of the built-in fallback policies.
    pub fn fallback_policy(mut self, policy: FallbackPolicy) -> Self {
        self.fallback = Some(Arc::new(PolicyFallback(policy)));
        self
    }

    /// Use a custom fallback handler.
    pub fn fallback<H: TaskHandler + 'static>(mut self, handler: H) -> Self {
        self.fallback = Some(Arc::new(handler));
        self
    }

    /// Fails if no fallback was chosen, a tag is empty, or a tag is repeated.
    pub fn build(self) -> Result<TaskRegistry, RegistryError> {
        let fallback = self.fallback.ok_or(RegistryError::MissingFallback)?;

        let mut handlers = HashMap::with_capacity(self.handlers.len());
        for (tag, handler) in self.handlers {
            if tag.is_empty() {
                return Err(RegistryError::EmptyTag);
            }
            if handlers.contains_key(&tag) {
                return Err(RegistryError::DuplicateTag(tag));
            }
            handlers.insert(tag, handler);
        }

        Ok(TaskRegistry {
            handlers: RwLock::new(handlers),
            fallback,
        })
    }
}
