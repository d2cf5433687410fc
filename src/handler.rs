//! Handler traits, the handler error taxonomy and the action registry.

use crate::routing::ActionId;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Outcome of a failed handler invocation.
///
/// `Environment` and `InvalidPayload` are recoverable: the message goes back
/// to the queue. Every other variant is unrecognized and the message is
/// dead-lettered (or the loop halts, see `UnrecognizedErrorPolicy`).
#[derive(Debug, Error)]
pub enum HandlerError {
    /// A transient environment problem: a missing resource, an unavailable
    /// downstream, data that is not there yet.
    #[error("environment unavailable: {0}")]
    Environment(String),

    /// The payload is malformed or carries an invalid value.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The routing key carries no action segments.
    #[error("routing key `{0}` carries no action")]
    MissingAction(String),

    #[error("no handler registered for action `{0}`")]
    NoHandler(ActionId),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            HandlerError::Environment(_) | HandlerError::InvalidPayload(_)
        )
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::InvalidPayload(err.to_string())
    }
}

impl From<std::str::Utf8Error> for HandlerError {
    fn from(err: std::str::Utf8Error) -> Self {
        HandlerError::InvalidPayload(err.to_string())
    }
}

/// A handler that receives the raw message body.
#[async_trait]
pub trait RawHandler: Send + Sync {
    async fn handle_raw(&self, payload: &[u8]) -> Result<(), HandlerError>;

    /// A name for the handler, used for logging and identification.
    fn handler_name(&self) -> &str;
}

/// A trait for processing JSON messages of a known type.
///
/// Register implementations with [`HandlerRegistry::register_json`]; a body
/// that fails to deserialize is reported as [`HandlerError::InvalidPayload`].
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// The type of the message that this handler can process.
    type MessageType: DeserializeOwned + Send + Sync;

    /// Processes a single deserialized message.
    async fn handle_message(&self, message: Self::MessageType) -> Result<(), HandlerError>;

    /// A name for the handler, used for logging and identification.
    fn handler_name(&self) -> &str;
}

struct Json<H>(H);

#[async_trait]
impl<H: MessageHandler> RawHandler for Json<H> {
    async fn handle_raw(&self, payload: &[u8]) -> Result<(), HandlerError> {
        let message: H::MessageType = serde_json::from_slice(payload)?;
        self.0.handle_message(message).await
    }

    fn handler_name(&self) -> &str {
        self.0.handler_name()
    }
}

/// Adapts an async closure taking the owned payload.
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

#[async_trait]
impl<F, Fut> RawHandler for FnHandler<F>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle_raw(&self, payload: &[u8]) -> Result<(), HandlerError> {
        (self.f)(payload.to_vec()).await
    }

    fn handler_name(&self) -> &str {
        &self.name
    }
}

/// Routes an action identifier and payload to whatever handles it.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, action: &ActionId, payload: &[u8]) -> Result<(), HandlerError>;
}

/// Maps action identifiers to handlers.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<ActionId, Arc<dyn RawHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `action`, replacing any previous one.
    pub fn register(
        &mut self,
        action: impl Into<ActionId>,
        handler: impl RawHandler + 'static,
    ) -> &mut Self {
        let action = action.into();
        if let Some(previous) = self.handlers.insert(action.clone(), Arc::new(handler)) {
            log::warn!(
                "Handler '{}' for action `{}` was replaced",
                previous.handler_name(),
                action
            );
        }
        self
    }

    pub fn register_json<H>(&mut self, action: impl Into<ActionId>, handler: H) -> &mut Self
    where
        H: MessageHandler + 'static,
    {
        self.register(action, Json(handler))
    }

    pub fn register_fn<F, Fut>(&mut self, action: impl Into<ActionId>, f: F) -> &mut Self
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let action = action.into();
        let name = action.to_string();
        self.register(action, FnHandler::new(name, f))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[async_trait]
impl Dispatch for HandlerRegistry {
    async fn dispatch(&self, action: &ActionId, payload: &[u8]) -> Result<(), HandlerError> {
        let handler = self
            .handlers
            .get(action)
            .ok_or_else(|| HandlerError::NoHandler(action.clone()))?;
        log::debug!("Dispatching `{}` to '{}'", action, handler.handler_name());
        handler.handle_raw(payload).await
    }
}
