//! Message handlers and the handler lookup service.
//!
//! A handler executes the effect of one decoded message type against a
//! session. The session type `S` belongs to whoever embeds the protocol
//! layer; this crate only passes it through.

use crate::error::ProtocolError;
use crate::lookup::RegistrationPolicy;
use crate::message::{Message, MessageType};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Error returned by a handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Executes one message type against a session.
pub trait MessageHandler<S>: Send + Sync + 'static {
    type Message: Message;

    fn handle(&self, session: &mut S, message: &Self::Message) -> Result<(), HandlerError>;
}

/// [`MessageHandler`] backed by a closure.
pub struct FnHandler<M, F> {
    f: F,
    _message: PhantomData<fn(&M)>,
}

impl<S, M, F> MessageHandler<S> for FnHandler<M, F>
where
    M: Message,
    F: Fn(&mut S, &M) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    type Message = M;

    fn handle(&self, session: &mut S, message: &M) -> Result<(), HandlerError> {
        (self.f)(session, message)
    }
}

trait ErasedHandler<S>: Send + Sync {
    fn handle(&self, session: &mut S, message: &dyn Message) -> Result<(), HandlerError>;
}

impl<S, H: MessageHandler<S>> ErasedHandler<S> for H {
    fn handle(&self, session: &mut S, message: &dyn Message) -> Result<(), HandlerError> {
        let typed = message.downcast_ref::<H::Message>().ok_or_else(|| {
            ProtocolError::MessageTypeMismatch {
                expected: MessageType::of::<H::Message>().name(),
                actual: message.message_type().name(),
            }
        })?;
        MessageHandler::handle(self, session, typed)
    }
}

/// A handler bound to the message type it accepts.
pub struct Handler<S> {
    message_type: MessageType,
    inner: Box<dyn ErasedHandler<S>>,
}

impl<S: 'static> Handler<S> {
    pub fn new<H: MessageHandler<S>>(handler: H) -> Self {
        Self {
            message_type: MessageType::of::<H::Message>(),
            inner: Box::new(handler),
        }
    }

    /// Wraps a closure handling messages of type `M`.
    pub fn from_fn<M, F>(f: F) -> Self
    where
        M: Message,
        F: Fn(&mut S, &M) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Self::new(FnHandler {
            f,
            _message: PhantomData,
        })
    }
}

impl<S> Handler<S> {
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn handle(&self, session: &mut S, message: &dyn Message) -> Result<(), HandlerError> {
        self.inner.handle(session, message)
    }
}

impl<S> fmt::Debug for Handler<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("message_type", &self.message_type)
            .finish()
    }
}

/// Outcome of [`HandlerLookupService::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    /// No handler is registered for the message type.
    Unhandled,
}

/// Message type → handler index for one protocol.
pub struct HandlerLookupService<S> {
    handlers: HashMap<MessageType, Arc<Handler<S>>>,
}

impl<S> HandlerLookupService<S> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registers a handler, rejecting a second handler for the same type.
    pub fn register(&mut self, handler: Handler<S>) -> Result<(), ProtocolError> {
        self.register_with(handler, RegistrationPolicy::Reject)
    }

    pub fn register_with(
        &mut self,
        handler: Handler<S>,
        policy: RegistrationPolicy,
    ) -> Result<(), ProtocolError> {
        let message_type = handler.message_type();
        if policy == RegistrationPolicy::Reject && self.handlers.contains_key(&message_type) {
            return Err(ProtocolError::DuplicateHandler {
                message: message_type.name(),
            });
        }
        self.handlers.insert(message_type, Arc::new(handler));
        tracing::trace!(message = message_type.name(), "registered handler");
        Ok(())
    }

    pub fn find(&self, message_type: MessageType) -> Option<&Arc<Handler<S>>> {
        self.handlers.get(&message_type)
    }

    /// Finds the handler for the concrete type of `message`.
    pub fn find_for(&self, message: &dyn Message) -> Option<&Arc<Handler<S>>> {
        self.find(message.message_type())
    }

    /// Resolves and runs the handler for `message`.
    pub fn dispatch(&self, session: &mut S, message: &dyn Message) -> Result<Dispatch, HandlerError> {
        match self.find_for(message) {
            Some(handler) => {
                handler.handle(session, message)?;
                Ok(Dispatch::Handled)
            }
            None => Ok(Dispatch::Unhandled),
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Names of handled message types, sorted.
    pub fn message_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().map(|t| t.name()).collect();
        names.sort_unstable();
        names
    }
}

impl<S> Default for HandlerLookupService<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> fmt::Debug for HandlerLookupService<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.message_names()).finish()
    }
}
