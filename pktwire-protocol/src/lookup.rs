//! Codec lookup: opcode → codec and message type → codec.

use crate::codec::{MessageCodec, Opcode};
use crate::error::ProtocolError;
use crate::message::{Message, MessageType};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// What to do when a registration collides with an existing binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationPolicy {
    /// Fail and keep the existing binding.
    #[default]
    Reject,
    /// Last writer wins. Every binding the new entry displaces is removed,
    /// in both directions.
    Replace,
}

/// Bidirectional codec index for one protocol.
///
/// Populated through `&mut self` while a protocol is being defined. Once it
/// is moved into a protocol only the `&self` lookups remain reachable, so
/// concurrent reads need no locking.
#[derive(Default)]
pub struct CodecLookupService {
    by_opcode: HashMap<Opcode, Arc<MessageCodec>>,
    by_type: HashMap<MessageType, Arc<MessageCodec>>,
}

impl CodecLookupService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a codec, rejecting opcode or message type collisions.
    pub fn register(&mut self, codec: MessageCodec) -> Result<(), ProtocolError> {
        self.register_with(codec, RegistrationPolicy::Reject)
    }

    /// Registers a codec under an explicit collision policy.
    ///
    /// A rejected registration leaves both indices unchanged.
    pub fn register_with(
        &mut self,
        codec: MessageCodec,
        policy: RegistrationPolicy,
    ) -> Result<(), ProtocolError> {
        let opcode = codec.opcode();
        let message_type = codec.message_type();

        match policy {
            RegistrationPolicy::Reject => {
                if let Some(existing) = self.by_opcode.get(&opcode) {
                    return Err(ProtocolError::DuplicateOpcode {
                        opcode,
                        existing: existing.message_type().name(),
                        attempted: message_type.name(),
                    });
                }
                if let Some(existing) = self.by_type.get(&message_type) {
                    return Err(ProtocolError::DuplicateMessageType {
                        message: message_type.name(),
                        existing: existing.opcode(),
                    });
                }
            }
            RegistrationPolicy::Replace => {
                if let Some(old) = self.by_opcode.remove(&opcode) {
                    self.by_type.remove(&old.message_type());
                    tracing::debug!(%opcode, replaced = old.message_type().name(), "replacing codec");
                }
                if let Some(old) = self.by_type.remove(&message_type) {
                    self.by_opcode.remove(&old.opcode());
                }
            }
        }

        let codec = Arc::new(codec);
        self.by_opcode.insert(opcode, codec.clone());
        self.by_type.insert(message_type, codec);
        tracing::trace!(%opcode, message = message_type.name(), "registered codec");
        Ok(())
    }

    pub fn find_by_opcode(&self, opcode: Opcode) -> Option<&Arc<MessageCodec>> {
        self.by_opcode.get(&opcode)
    }

    pub fn find_by_message_type(&self, message_type: MessageType) -> Option<&Arc<MessageCodec>> {
        self.by_type.get(&message_type)
    }

    /// Typed form of [`find_by_message_type`](Self::find_by_message_type).
    pub fn find<M: Message>(&self) -> Option<&Arc<MessageCodec>> {
        self.find_by_message_type(MessageType::of::<M>())
    }

    pub fn len(&self) -> usize {
        self.by_opcode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_opcode.is_empty()
    }

    /// Registered opcodes in ascending order.
    pub fn opcodes(&self) -> Vec<Opcode> {
        let mut opcodes: Vec<_> = self.by_opcode.keys().copied().collect();
        opcodes.sort();
        opcodes
    }

    /// Registered codecs in ascending opcode order.
    pub fn codecs(&self) -> Vec<&Arc<MessageCodec>> {
        let mut codecs: Vec<_> = self.by_opcode.values().collect();
        codecs.sort_by_key(|codec| codec.opcode());
        codecs
    }
}

impl fmt::Debug for CodecLookupService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.codecs()).finish()
    }
}
