//! Built-in protocol versions.
//!
//! | id        | opcode  | length | unknown opcode | introduction |
//! |-----------|---------|--------|----------------|--------------|
//! | `classic` | u8      | none   | fatal          | none         |
//! | `framed`  | u16 BE  | u32 BE | skipped        | required     |
//! | `compact` | varint  | varint | skipped        | required     |

use crate::config::ProtocolConfig;
use crate::error::SessionError;
use crate::handler::builtin_handlers;
use crate::messages::{Chat, CommandInvoke, Introduction, Kick, Ping, Pong};
use crate::session::Session;
use pktwire_protocol::{
    ChatArguments, CodecLookupService, Command, FrameLayout, IntWidth, Message, MessageCodec,
    MessageFactory, ProtocolError, ProtocolRegistry, SharedProtocol, StandardProtocol,
};
use std::sync::Arc;

pub const CLASSIC: &str = "classic";
pub const FRAMED: &str = "framed";
pub const COMPACT: &str = "compact";

/// Ids of every built-in version, sorted.
pub const BUILTIN_PROTOCOLS: &[&str] = &[CLASSIC, COMPACT, FRAMED];

/// Opcodes of the `classic` version.
pub mod classic_opcodes {
    pub const CHAT: u8 = 0x03;
    pub const PING: u8 = 0x05;
    pub const PONG: u8 = 0x06;
    pub const COMMAND: u8 = 0x10;
    pub const KICK: u8 = 0xFF;
}

/// Opcodes shared by the `framed` and `compact` versions.
pub mod opcodes {
    pub const INTRODUCTION: u16 = 0x0001;
    pub const PING: u16 = 0x0002;
    pub const PONG: u16 = 0x0003;
    pub const KICK: u16 = 0x0004;
    pub const COMMAND: u16 = 0x0005;
    pub const CHAT: u16 = 0x0006;
}

/// Factory for `classic`: kick reasons keep legacy style codes and there is
/// no introduction.
struct ClassicFactory;

impl MessageFactory for ClassicFactory {
    fn kick_message(&self, reason: &ChatArguments) -> Box<dyn Message> {
        Box::new(Kick {
            reason: reason.legacy(),
        })
    }

    fn command_message(&self, command: &Command, arguments: &ChatArguments) -> Box<dyn Message> {
        command_invoke(command, arguments)
    }

    fn introduction_message(&self, _identity: &str) -> Option<Box<dyn Message>> {
        None
    }
}

/// Factory for versions that open with an introduction naming the protocol.
struct IntroducingFactory {
    protocol: &'static str,
}

impl MessageFactory for IntroducingFactory {
    fn kick_message(&self, reason: &ChatArguments) -> Box<dyn Message> {
        Box::new(Kick {
            reason: reason.plain(),
        })
    }

    fn command_message(&self, command: &Command, arguments: &ChatArguments) -> Box<dyn Message> {
        command_invoke(command, arguments)
    }

    fn introduction_message(&self, identity: &str) -> Option<Box<dyn Message>> {
        Some(Box::new(Introduction {
            identity: identity.to_string(),
            protocol: self.protocol.to_string(),
        }))
    }
}

fn command_invoke(command: &Command, arguments: &ChatArguments) -> Box<dyn Message> {
    Box::new(CommandInvoke {
        command: command.name().to_string(),
        args: arguments.words(),
    })
}

fn classic_codecs() -> Result<CodecLookupService, ProtocolError> {
    use classic_opcodes::*;

    let mut codecs = CodecLookupService::new();
    codecs.register(MessageCodec::wire::<Chat>(CHAT))?;
    codecs.register(MessageCodec::wire::<Ping>(PING))?;
    codecs.register(MessageCodec::wire::<Pong>(PONG))?;
    codecs.register(MessageCodec::wire::<CommandInvoke>(COMMAND))?;
    codecs.register(MessageCodec::wire::<Kick>(KICK))?;
    Ok(codecs)
}

fn introducing_codecs() -> Result<CodecLookupService, ProtocolError> {
    use opcodes::*;

    let mut codecs = CodecLookupService::new();
    codecs.register(MessageCodec::wire::<Introduction>(INTRODUCTION))?;
    codecs.register(MessageCodec::wire::<Ping>(PING))?;
    codecs.register(MessageCodec::wire::<Pong>(PONG))?;
    codecs.register(MessageCodec::wire::<Kick>(KICK))?;
    codecs.register(MessageCodec::wire::<CommandInvoke>(COMMAND))?;
    codecs.register(MessageCodec::wire::<Chat>(CHAT))?;
    Ok(codecs)
}

/// u8 opcode, no length prefix.
pub fn classic(max_payload: usize) -> Result<StandardProtocol<Session>, ProtocolError> {
    Ok(StandardProtocol::new(
        CLASSIC,
        FrameLayout::opcode_only(IntWidth::U8).with_max_payload(max_payload),
        classic_codecs()?,
        builtin_handlers()?,
        ClassicFactory,
    ))
}

/// u16 opcode, u32 payload length.
pub fn framed(max_payload: usize) -> Result<StandardProtocol<Session>, ProtocolError> {
    Ok(StandardProtocol::new(
        FRAMED,
        FrameLayout::length_prefixed(IntWidth::U16, IntWidth::U32).with_max_payload(max_payload),
        introducing_codecs()?,
        builtin_handlers()?,
        IntroducingFactory { protocol: FRAMED },
    ))
}

/// Varint opcode, varint payload length.
pub fn compact(max_payload: usize) -> Result<StandardProtocol<Session>, ProtocolError> {
    Ok(StandardProtocol::new(
        COMPACT,
        FrameLayout::length_prefixed(IntWidth::VarInt, IntWidth::VarInt)
            .with_max_payload(max_payload),
        introducing_codecs()?,
        builtin_handlers()?,
        IntroducingFactory { protocol: COMPACT },
    ))
}

/// Builds the built-in version named `id`.
pub fn build(id: &str, max_payload: usize) -> Result<SharedProtocol<Session>, SessionError> {
    let protocol = match id {
        CLASSIC => classic(max_payload)?,
        FRAMED => framed(max_payload)?,
        COMPACT => compact(max_payload)?,
        other => return Err(SessionError::UnknownProtocol(other.to_string())),
    };
    Ok(Arc::new(protocol))
}

/// Registers every enabled built-in version.
pub fn register_builtin(
    registry: &ProtocolRegistry<Session>,
    config: &ProtocolConfig,
) -> Result<(), SessionError> {
    for id in &config.enabled {
        let protocol = build(id, config.max_payload_bytes)?;
        registry.register(id.clone(), protocol);
    }
    tracing::info!(protocols = ?registry.ids(), "registered built-in protocols");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pktwire_protocol::{HeaderRead, Inbound, MessageType, Opcode};
    use bytes::BytesMut;

    fn all() -> Vec<SharedProtocol<Session>> {
        BUILTIN_PROTOCOLS
            .iter()
            .map(|id| build(id, pktwire_protocol::MAX_PAYLOAD_SIZE).unwrap())
            .collect()
    }

    #[test]
    fn test_classic_ping_bytes() {
        let protocol = build(CLASSIC, 1024).unwrap();
        let frame = protocol.encode_frame(&Ping { nonce: 42 }).unwrap();
        assert_eq!(&frame[..], &[0x05, 0x00, 0x00, 0x00, 0x2A]);

        let mut cursor: &[u8] = &frame;
        let HeaderRead::Codec { codec, .. } = protocol.read_header(&mut cursor).unwrap() else {
            panic!("expected codec");
        };
        assert_eq!(codec.message_type(), MessageType::of::<Ping>());
        assert!(protocol
            .handler_lookup()
            .find(MessageType::of::<Ping>())
            .is_some());
    }

    #[test]
    fn test_framed_ping_bytes() {
        let protocol = build(FRAMED, 1024).unwrap();
        let frame = protocol.encode_frame(&Ping { nonce: 1 }).unwrap();
        assert_eq!(
            &frame[..],
            &[0x00, 0x02, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x01]
        );
    }

    #[test]
    fn test_compact_ping_bytes() {
        let protocol = build(COMPACT, 1024).unwrap();
        let frame = protocol.encode_frame(&Ping { nonce: 1 }).unwrap();
        assert_eq!(&frame[..], &[0x02, 0x04, 0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_every_message_roundtrips_in_every_version() {
        let messages: Vec<Box<dyn Message>> = vec![
            Box::new(Ping { nonce: 7 }),
            Box::new(Pong { nonce: 7 }),
            Box::new(Kick {
                reason: "bye".to_string(),
            }),
            Box::new(CommandInvoke {
                command: "say".to_string(),
                args: vec!["hi".to_string()],
            }),
            Box::new(Chat {
                text: "hello".to_string(),
            }),
        ];

        for protocol in all() {
            for message in &messages {
                let frame = protocol.encode_frame(message.as_ref()).unwrap();
                let mut buf = BytesMut::from(&frame[..]);
                let Some(Inbound::Message { message: decoded, .. }) =
                    protocol.decode_frame(&mut buf).unwrap()
                else {
                    panic!("{}: no message", protocol.name());
                };
                assert_eq!(decoded.message_type(), message.message_type());
                assert_eq!(format!("{:?}", decoded), format!("{:?}", message));
                assert!(buf.is_empty());
            }
        }
    }

    #[test]
    fn test_introduction_presence() {
        assert!(build(CLASSIC, 1024)
            .unwrap()
            .introduction_message("alice")
            .is_none());

        for id in [FRAMED, COMPACT] {
            let protocol = build(id, 1024).unwrap();
            let intro = protocol.introduction_message("alice").unwrap();
            assert_eq!(
                intro.downcast_ref::<Introduction>(),
                Some(&Introduction {
                    identity: "alice".to_string(),
                    protocol: id.to_string(),
                })
            );
        }
    }

    #[test]
    fn test_classic_cannot_encode_introduction() {
        let protocol = build(CLASSIC, 1024).unwrap();
        let err = protocol
            .encode_frame(&Introduction {
                identity: "a".to_string(),
                protocol: CLASSIC.to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, ProtocolError::NoCodecForMessage { .. }));
    }

    #[test]
    fn test_kick_reason_rendering() {
        let reason = ChatArguments::new()
            .style(pktwire_protocol::ChatStyle::Bold)
            .text("spam");

        let classic = build(CLASSIC, 1024).unwrap().kick_message(&reason);
        assert_eq!(classic.downcast_ref::<Kick>().unwrap().reason, "§lspam");

        let framed = build(FRAMED, 1024).unwrap().kick_message(&reason);
        assert_eq!(framed.downcast_ref::<Kick>().unwrap().reason, "spam");
    }

    #[test]
    fn test_command_message() {
        let protocol = build(COMPACT, 1024).unwrap();
        let message = protocol.command_message(
            &Command::new("give").with_alias("g"),
            &ChatArguments::from("alice 64"),
        );
        assert_eq!(
            message.downcast_ref::<CommandInvoke>(),
            Some(&CommandInvoke {
                command: "give".to_string(),
                args: vec!["alice".to_string(), "64".to_string()],
            })
        );
    }

    #[test]
    fn test_unknown_opcode_behaviour() {
        let classic = build(CLASSIC, 1024).unwrap();
        let mut buf = BytesMut::from(&[0x42, 0x00][..]);
        assert!(matches!(
            classic.decode_frame(&mut buf),
            Err(ProtocolError::UnknownPacket { opcode: Opcode(0x42) })
        ));

        let framed = build(FRAMED, 1024).unwrap();
        let mut buf = BytesMut::from(&[0x00, 0x42, 0x00, 0x00, 0x00, 0x01, 0xAA][..]);
        assert!(matches!(
            framed.decode_frame(&mut buf).unwrap(),
            Some(Inbound::Skipped { frame_len: 7, .. })
        ));
    }

    #[test]
    fn test_max_payload_applies() {
        let protocol = build(FRAMED, 4).unwrap();
        let err = protocol
            .encode_frame(&Chat {
                text: "too long".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { max: 4, .. }));
    }

    #[test]
    fn test_build_unknown() {
        assert!(matches!(
            build("v9", 1024),
            Err(SessionError::UnknownProtocol(_))
        ));
    }

    #[test]
    fn test_register_builtin() {
        let registry = ProtocolRegistry::new();
        let config = ProtocolConfig {
            enabled: vec![CLASSIC.to_string(), FRAMED.to_string()],
            ..Default::default()
        };
        register_builtin(&registry, &config).unwrap();
        assert_eq!(registry.ids(), vec![CLASSIC, FRAMED]);
        assert!(!registry.contains(COMPACT));
    }
}
