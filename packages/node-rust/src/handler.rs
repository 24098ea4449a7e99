//! Handler registration and dispatch.
//!
//! An explicit registry maps message type names to boxed async invokers,
//! populated at startup. Zero-or-one handler per type; a missing handler
//! is a [`NoHandlerFor`](crate::error::CourierError::NoHandlerFor)
//! condition at dispatch time, never a startup failure.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{decode_message, Envelope, Message};
use dashmap::DashMap;

use crate::context::MessageContext;
use crate::error::CourierError;

/// A typed message handler.
///
/// The context lets handlers enlist cascading sends in the same unit of
/// work as the inbound message. Returning an error hands the envelope to
/// the error policy engine.
#[async_trait]
pub trait MessageHandler<M: Message>: Send + Sync + 'static {
    async fn handle(&self, message: M, context: &mut MessageContext) -> anyhow::Result<()>;
}

/// Erased handler invocation: decode the payload, run the handler.
type BoxedInvoker = Arc<
    dyn Fn(Envelope, MessageContext) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
        + Send
        + Sync,
>;

/// Registry mapping message type names to handler invokers.
///
/// Backed by a `DashMap` so registration (&self) and concurrent resolution
/// from worker tasks need no external locking.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, BoxedInvoker>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `M`, replacing any previous registration.
    ///
    /// The stored invoker decodes the envelope payload into `M` before
    /// calling the handler; a payload that does not decode surfaces as a
    /// serialization failure, which the dispatcher dead-letters without
    /// retrying.
    pub fn register<M: Message, H: MessageHandler<M>>(&self, handler: H) {
        let handler = Arc::new(handler);
        let invoker: BoxedInvoker = Arc::new(move |envelope, mut context| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let message: M =
                    decode_message(&envelope.payload).map_err(CourierError::Serialization)?;
                handler.handle(message, &mut context).await
            })
        });

        if self.handlers.insert(M::NAME.to_string(), invoker).is_some() {
            tracing::warn!(message_type = M::NAME, "replaced existing handler registration");
        }
    }

    /// Resolves the invoker for a message type, if one is registered.
    #[must_use]
    pub fn resolve(&self, message_type: &str) -> Option<BoxedInvoker> {
        self.handlers.get(message_type).map(|entry| Arc::clone(&entry))
    }

    /// Whether a handler exists for the type.
    #[must_use]
    pub fn contains(&self, message_type: &str) -> bool {
        self.handlers.contains_key(message_type)
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handlers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
