//! Decoded messages and their runtime type identity.
//!
//! Messages are type-erased so one protocol can carry any number of message
//! structs. The concrete type is recovered through [`MessageType`], which is
//! the key for both codec and handler lookup.

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};

/// An immutable decoded payload.
///
/// Implement with [`impl_message!`](crate::impl_message).
pub trait Message: Any + Send + Sync + fmt::Debug {
    /// Convert to `&dyn Any` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Type identity of the concrete message.
    fn message_type(&self) -> MessageType {
        MessageType::of::<Self>()
    }
}

impl dyn Message {
    /// Returns the concrete message if it is an `M`.
    pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
        self.as_any().downcast_ref::<M>()
    }

    pub fn is<M: Message>(&self) -> bool {
        self.as_any().is::<M>()
    }
}

/// Runtime identity of a message type.
///
/// Equality and hashing use the `TypeId` only; the name is for logs and
/// error messages.
#[derive(Clone, Copy)]
pub struct MessageType {
    id: TypeId,
    name: &'static str,
}

impl MessageType {
    pub fn of<M: Message + ?Sized>() -> Self {
        let full = std::any::type_name::<M>();
        Self {
            id: TypeId::of::<M>(),
            name: full.rsplit("::").next().unwrap_or(full),
        }
    }

    /// Short type name, without the module path.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for MessageType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MessageType {}

impl Hash for MessageType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageType({})", self.name)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Implements [`Message`] for one or more types.
///
/// # Example
/// ```ignore
/// #[derive(Debug, Clone, PartialEq)]
/// pub struct Ping { pub nonce: u32 }
///
/// impl_message!(Ping);
/// ```
#[macro_export]
macro_rules! impl_message {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::message::Message for $ty {
                fn as_any(&self) -> &dyn ::std::any::Any {
                    self
                }
            }
        )+
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Ping {
        nonce: u32,
    }

    #[derive(Debug)]
    struct Pong;

    crate::impl_message!(Ping, Pong);

    #[test]
    fn test_message_type_identity() {
        assert_eq!(MessageType::of::<Ping>(), MessageType::of::<Ping>());
        assert_ne!(MessageType::of::<Ping>(), MessageType::of::<Pong>());
        assert_eq!(MessageType::of::<Ping>().name(), "Ping");
    }

    #[test]
    fn test_dyn_message_reports_concrete_type() {
        let boxed: Box<dyn Message> = Box::new(Ping { nonce: 7 });
        assert_eq!(boxed.message_type(), MessageType::of::<Ping>());
        assert_eq!(boxed.message_type().to_string(), "Ping");
    }

    #[test]
    fn test_downcast() {
        let boxed: Box<dyn Message> = Box::new(Ping { nonce: 7 });
        assert!(boxed.is::<Ping>());
        assert!(!boxed.is::<Pong>());
        assert_eq!(boxed.downcast_ref::<Ping>(), Some(&Ping { nonce: 7 }));
        assert!(boxed.downcast_ref::<Pong>().is_none());
    }
}
