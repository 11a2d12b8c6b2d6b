//! MessageDispatchRegistry — routes decoded messages to handlers.
//!
//! Application logic registers handlers by message kind once at
//! startup; every `process_one_message` call then delivers through
//! here, synchronously, in the calling task.

use crate::error::{CommsError, CommsResult};
use loadswarm_wire::{MessageKind, ReceivedMessage};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::warn;

/// A handler for one kind of message. Invoked synchronously in the
/// dispatching task.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, message: &ReceivedMessage) -> CommsResult<()>;
}

impl<F> MessageHandler for F
where
    F: Fn(&ReceivedMessage) -> CommsResult<()> + Send + Sync + 'static,
{
    fn handle(&self, message: &ReceivedMessage) -> CommsResult<()> {
        self(message)
    }
}

/// Routing table from message kind to registered handlers.
#[derive(Default)]
pub struct MessageDispatchRegistry {
    handlers: RwLock<HashMap<MessageKind, Vec<Arc<dyn MessageHandler>>>>,
}

impl MessageDispatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for every future message of `kind`.
    pub fn register(&self, kind: MessageKind, handler: Arc<dyn MessageHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(kind)
            .or_default()
            .push(handler);
    }

    /// Closure convenience for [`register`](Self::register).
    pub fn register_fn(
        &self,
        kind: MessageKind,
        handler: impl Fn(&ReceivedMessage) -> CommsResult<()> + Send + Sync + 'static,
    ) {
        self.register(kind, Arc::new(handler));
    }

    /// Number of handlers registered for a kind (diagnostic).
    pub fn handler_count(&self, kind: MessageKind) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Invoke every handler registered for the message's kind, in
    /// registration order. A failing handler never prevents later
    /// handlers from running; the first failure is returned after all
    /// handlers were attempted. No registered handler is a silent no-op.
    pub fn dispatch(&self, message: &ReceivedMessage) -> CommsResult<()> {
        let handlers: Vec<Arc<dyn MessageHandler>> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&message.kind())
            .cloned()
            .unwrap_or_default();

        let mut first_failure = None;
        for handler in &handlers {
            if let Err(e) = handler.handle(message) {
                warn!(kind = %message.kind(), error = %e, "message handler failed");
                if first_failure.is_none() {
                    first_failure = Some(e);
                }
            }
        }
        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
