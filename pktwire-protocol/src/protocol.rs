//! The protocol capability and its stock implementation.
//!
//! A [`Protocol`] owns the codec and handler lookups for one protocol
//! version, the header framing rules, and the factories for the handful of
//! messages every version must be able to produce.

use crate::chat::{ChatArguments, Command};
use crate::codec::{MessageCodec, Opcode};
use crate::error::ProtocolError;
use crate::frame::{FrameLayout, HeaderPeek};
use crate::handler::HandlerLookupService;
use crate::lookup::CodecLookupService;
use crate::message::Message;
use bytes::{Buf, Bytes, BytesMut};
use std::fmt;
use std::sync::Arc;

/// Result of [`Protocol::read_header`].
#[derive(Debug)]
pub enum HeaderRead {
    /// The header was consumed and the opcode resolved.
    Codec {
        codec: Arc<MessageCodec>,
        /// Payload length, when the header carries one.
        payload_len: Option<usize>,
    },
    /// The opcode has no codec but the frame length was known; the whole
    /// frame was consumed and discarded.
    Skipped { opcode: Opcode, frame_len: usize },
    /// Not enough bytes buffered; nothing was consumed.
    Incomplete { needed: usize },
}

/// One inbound frame, decoded.
#[derive(Debug)]
pub enum Inbound {
    Message {
        opcode: Opcode,
        message: Box<dyn Message>,
    },
    Skipped {
        opcode: Opcode,
        frame_len: usize,
    },
}

/// A complete protocol version.
///
/// Implementations are immutable once constructed and shared behind
/// `Arc<dyn Protocol<Session = S>>`.
pub trait Protocol: Send + Sync {
    /// Session handle passed to message handlers.
    type Session;

    fn name(&self) -> &str;

    fn codec_lookup(&self) -> &CodecLookupService;

    fn handler_lookup(&self) -> &HandlerLookupService<Self::Session>;

    /// Whether every frame's length can be determined from its header.
    fn is_self_delimiting(&self) -> bool;

    /// Largest payload accepted in either direction.
    fn max_payload(&self) -> usize;

    /// Reads a packet header from the front of `buf`.
    ///
    /// On success the header has been consumed and the returned codec
    /// decodes the payload that follows. If the opcode is unknown and the
    /// frame length is known, the whole frame is consumed and
    /// [`HeaderRead::Skipped`] returned. If the frame length is not known,
    /// fails with [`ProtocolError::UnknownPacket`]; the stream is then
    /// unusable.
    fn read_header(&self, buf: &mut &[u8]) -> Result<HeaderRead, ProtocolError>;

    /// Builds a new buffer holding the header for `codec` followed by
    /// `payload`.
    fn write_header(&self, codec: &MessageCodec, payload: &[u8]) -> Result<Bytes, ProtocolError>;

    /// Message that ends a session, carrying a human-readable reason.
    fn kick_message(&self, reason: &ChatArguments) -> Box<dyn Message>;

    /// Message that invokes `command` with `arguments`.
    fn command_message(&self, command: &Command, arguments: &ChatArguments) -> Box<dyn Message>;

    /// First message a connecting party sends, or `None` if this version has
    /// no introduction.
    fn introduction_message(&self, identity: &str) -> Option<Box<dyn Message>>;

    /// Decodes the next frame from `buf`, consuming it.
    ///
    /// Returns `Ok(None)` if more bytes are needed; nothing is consumed in
    /// that case.
    fn decode_frame(&self, buf: &mut BytesMut) -> Result<Option<Inbound>, ProtocolError> {
        let mut cursor: &[u8] = &buf[..];
        let (codec, payload_len) = match self.read_header(&mut cursor)? {
            HeaderRead::Incomplete { .. } => return Ok(None),
            HeaderRead::Skipped { opcode, frame_len } => {
                buf.advance(frame_len);
                return Ok(Some(Inbound::Skipped { opcode, frame_len }));
            }
            HeaderRead::Codec { codec, payload_len } => (codec, payload_len),
        };
        let header_len = buf.len() - cursor.len();

        match payload_len {
            Some(len) => {
                let Some(mut payload) = cursor.get(..len) else {
                    return Ok(None);
                };
                let decoded = codec.decode(&mut payload);
                let trailing = payload.len();
                // The frame boundary is known, so it is consumed whether or
                // not the payload decodes.
                buf.advance(header_len + len);

                let message = decoded.map_err(|err| malformed(&codec, err))?;
                if trailing > 0 {
                    return Err(ProtocolError::MalformedPayload {
                        message: codec.message_type().name(),
                        reason: format!("{} trailing bytes", trailing),
                    });
                }
                Ok(Some(Inbound::Message {
                    opcode: codec.opcode(),
                    message,
                }))
            }
            // Without a length prefix the payload limit is enforced on what
            // the codec consumed, or on what is buffered while it waits.
            None => {
                let max = self.max_payload();
                match codec.decode(&mut cursor) {
                    Ok(message) => {
                        let size = buf.len() - header_len - cursor.len();
                        if size > max {
                            return Err(ProtocolError::FrameTooLarge { size, max });
                        }
                        let consumed = buf.len() - cursor.len();
                        buf.advance(consumed);
                        Ok(Some(Inbound::Message {
                            opcode: codec.opcode(),
                            message,
                        }))
                    }
                    Err(ProtocolError::IncompleteFrame { .. }) => {
                        let size = buf.len() - header_len;
                        if size > max {
                            return Err(ProtocolError::FrameTooLarge { size, max });
                        }
                        Ok(None)
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// Encodes `message` with its registered codec and frames it.
    fn encode_frame(&self, message: &dyn Message) -> Result<Bytes, ProtocolError> {
        let message_type = message.message_type();
        let codec = self
            .codec_lookup()
            .find_by_message_type(message_type)
            .ok_or(ProtocolError::NoCodecForMessage {
                message: message_type.name(),
            })?;
        let mut payload = BytesMut::new();
        codec.encode(message, &mut payload)?;
        self.write_header(codec, &payload)
    }
}

/// Shared handle to a protocol.
pub type SharedProtocol<S> = Arc<dyn Protocol<Session = S>>;

/// A payload that ran short inside a length-delimited frame is malformed,
/// not incomplete.
fn malformed(codec: &MessageCodec, err: ProtocolError) -> ProtocolError {
    match err {
        ProtocolError::IncompleteFrame { needed } => ProtocolError::MalformedPayload {
            message: codec.message_type().name(),
            reason: format!("payload ends {} bytes early", needed),
        },
        other => other,
    }
}

/// The version-specific messages a [`StandardProtocol`] produces.
pub trait MessageFactory: Send + Sync {
    fn kick_message(&self, reason: &ChatArguments) -> Box<dyn Message>;

    fn command_message(&self, command: &Command, arguments: &ChatArguments) -> Box<dyn Message>;

    fn introduction_message(&self, identity: &str) -> Option<Box<dyn Message>>;
}

/// A [`Protocol`] assembled from a frame layout, a codec set, a handler set
/// and a message factory.
pub struct StandardProtocol<S> {
    name: String,
    layout: FrameLayout,
    codecs: CodecLookupService,
    handlers: HandlerLookupService<S>,
    factory: Box<dyn MessageFactory>,
}

impl<S> StandardProtocol<S> {
    pub fn new(
        name: impl Into<String>,
        layout: FrameLayout,
        codecs: CodecLookupService,
        handlers: HandlerLookupService<S>,
        factory: impl MessageFactory + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            layout,
            codecs,
            handlers,
            factory: Box::new(factory),
        }
    }

    pub fn layout(&self) -> FrameLayout {
        self.layout
    }
}

impl<S> Protocol for StandardProtocol<S> {
    type Session = S;

    fn name(&self) -> &str {
        &self.name
    }

    fn codec_lookup(&self) -> &CodecLookupService {
        &self.codecs
    }

    fn handler_lookup(&self) -> &HandlerLookupService<S> {
        &self.handlers
    }

    fn is_self_delimiting(&self) -> bool {
        self.layout.has_length()
    }

    fn max_payload(&self) -> usize {
        self.layout.max_payload()
    }

    fn read_header(&self, buf: &mut &[u8]) -> Result<HeaderRead, ProtocolError> {
        let header = match self.layout.peek_header(buf)? {
            HeaderPeek::Header(header) => header,
            HeaderPeek::Incomplete { needed } => return Ok(HeaderRead::Incomplete { needed }),
        };

        if let Some(frame_len) = header.frame_len() {
            if buf.len() < frame_len {
                return Ok(HeaderRead::Incomplete {
                    needed: frame_len - buf.len(),
                });
            }
        }

        match self.codecs.find_by_opcode(header.opcode) {
            Some(codec) => {
                buf.advance(header.header_len);
                Ok(HeaderRead::Codec {
                    codec: codec.clone(),
                    payload_len: header.payload_len,
                })
            }
            None => match header.frame_len() {
                Some(frame_len) => {
                    buf.advance(frame_len);
                    Ok(HeaderRead::Skipped {
                        opcode: header.opcode,
                        frame_len,
                    })
                }
                None => Err(ProtocolError::UnknownPacket {
                    opcode: header.opcode,
                }),
            },
        }
    }

    fn write_header(&self, codec: &MessageCodec, payload: &[u8]) -> Result<Bytes, ProtocolError> {
        self.layout.write_frame(codec.opcode(), payload)
    }

    fn kick_message(&self, reason: &ChatArguments) -> Box<dyn Message> {
        self.factory.kick_message(reason)
    }

    fn command_message(&self, command: &Command, arguments: &ChatArguments) -> Box<dyn Message> {
        self.factory.command_message(command, arguments)
    }

    fn introduction_message(&self, identity: &str) -> Option<Box<dyn Message>> {
        self.factory.introduction_message(identity)
    }
}

impl<S> fmt::Debug for StandardProtocol<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StandardProtocol")
            .field("name", &self.name)
            .field("layout", &self.layout)
            .field("codecs", &self.codecs)
            .field("handlers", &self.handlers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufExt, BufMutExt};
    use crate::frame::IntWidth;
    use crate::handler::{Dispatch, Handler};
    use crate::message::MessageType;
    use bytes::BufMut;

    #[derive(Debug, Clone, PartialEq)]
    struct Ping {
        nonce: u32,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Kick {
        reason: String,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Hello {
        name: String,
    }

    crate::impl_message!(Ping, Kick, Hello);

    impl crate::codec::Wire for Ping {
        fn encode_to(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
            buf.put_u32(self.nonce);
            Ok(())
        }

        fn decode_from(buf: &mut &[u8]) -> Result<Self, ProtocolError> {
            Ok(Self {
                nonce: buf.read_u32()?,
            })
        }
    }

    impl crate::codec::Wire for Kick {
        fn encode_to(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
            buf.put_string(&self.reason)
        }

        fn decode_from(buf: &mut &[u8]) -> Result<Self, ProtocolError> {
            Ok(Self {
                reason: buf.read_string()?,
            })
        }
    }

    impl crate::codec::Wire for Hello {
        fn encode_to(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
            buf.put_string(&self.name)
        }

        fn decode_from(buf: &mut &[u8]) -> Result<Self, ProtocolError> {
            Ok(Self {
                name: buf.read_string()?,
            })
        }
    }

    #[derive(Default)]
    struct Session {
        pings: Vec<u32>,
    }

    struct TestFactory {
        introduce: bool,
    }

    impl MessageFactory for TestFactory {
        fn kick_message(&self, reason: &ChatArguments) -> Box<dyn Message> {
            Box::new(Kick {
                reason: reason.plain(),
            })
        }

        fn command_message(&self, command: &Command, arguments: &ChatArguments) -> Box<dyn Message> {
            Box::new(Kick {
                reason: format!("/{} {}", command.name(), arguments.plain()),
            })
        }

        fn introduction_message(&self, identity: &str) -> Option<Box<dyn Message>> {
            self.introduce.then(|| {
                Box::new(Hello {
                    name: identity.to_string(),
                }) as Box<dyn Message>
            })
        }
    }

    fn protocol(layout: FrameLayout, introduce: bool) -> StandardProtocol<Session> {
        let mut codecs = CodecLookupService::new();
        codecs.register(MessageCodec::wire::<Ping>(5u8)).unwrap();
        codecs.register(MessageCodec::wire::<Kick>(0xFFu8)).unwrap();

        let mut handlers = HandlerLookupService::new();
        handlers
            .register(Handler::from_fn(|session: &mut Session, ping: &Ping| {
                session.pings.push(ping.nonce);
                Ok(())
            }))
            .unwrap();

        StandardProtocol::new("test", layout, codecs, handlers, TestFactory { introduce })
    }

    fn classic() -> StandardProtocol<Session> {
        protocol(FrameLayout::opcode_only(IntWidth::U8), false)
    }

    fn framed() -> StandardProtocol<Session> {
        protocol(
            FrameLayout::length_prefixed(IntWidth::U8, IntWidth::U16),
            true,
        )
    }

    #[test]
    fn test_ping_scenario() {
        let protocol = classic();
        let bytes = [0x05, 0x00, 0x00, 0x00, 0x2A];
        let mut cursor: &[u8] = &bytes;

        let HeaderRead::Codec { codec, payload_len } = protocol.read_header(&mut cursor).unwrap()
        else {
            panic!("expected codec");
        };
        assert_eq!(codec.message_type(), MessageType::of::<Ping>());
        assert_eq!(payload_len, None);
        assert_eq!(cursor.len(), 4);

        let message = codec.decode(&mut cursor).unwrap();
        assert_eq!(message.downcast_ref::<Ping>(), Some(&Ping { nonce: 42 }));

        let handler = protocol.handler_lookup().find_for(message.as_ref()).unwrap();
        assert_eq!(handler.message_type(), MessageType::of::<Ping>());

        let mut session = Session::default();
        assert_eq!(
            protocol
                .handler_lookup()
                .dispatch(&mut session, message.as_ref())
                .unwrap(),
            Dispatch::Handled
        );
        assert_eq!(session.pings, vec![42]);
    }

    #[test]
    fn test_unknown_opcode_with_known_length_is_skipped() {
        let protocol = framed();
        // opcode 0x33 (unregistered), length 3, then a Ping frame.
        let bytes = [0x33, 0x00, 0x03, 0xAA, 0xBB, 0xCC, 0x05, 0x00, 0x04, 0, 0, 0, 1];
        let mut cursor: &[u8] = &bytes;

        let read = protocol.read_header(&mut cursor).unwrap();
        assert!(matches!(
            read,
            HeaderRead::Skipped {
                opcode: Opcode(0x33),
                frame_len: 6
            }
        ));
        // Advanced by exactly the frame length.
        assert_eq!(bytes.len() - cursor.len(), 6);

        let read = protocol.read_header(&mut cursor).unwrap();
        assert!(matches!(
            read,
            HeaderRead::Codec {
                payload_len: Some(4),
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_opcode_with_unknown_length_fails() {
        let protocol = classic();
        let bytes = [0x33, 0xAA, 0xBB];
        let mut cursor: &[u8] = &bytes;

        let err = protocol.read_header(&mut cursor).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownPacket { opcode: Opcode(0x33) }));
        assert!(err.is_fatal());
        assert!(!protocol.is_self_delimiting());
    }

    #[test]
    fn test_read_header_waits_for_full_frame() {
        let protocol = framed();
        let bytes = [0x05, 0x00, 0x04, 0x00];
        let mut cursor: &[u8] = &bytes;

        assert!(matches!(
            protocol.read_header(&mut cursor).unwrap(),
            HeaderRead::Incomplete { needed: 3 }
        ));
        assert_eq!(cursor.len(), bytes.len());

        let mut empty: &[u8] = &[];
        assert!(matches!(
            protocol.read_header(&mut empty).unwrap(),
            HeaderRead::Incomplete { .. }
        ));
    }

    #[test]
    fn test_write_header_does_not_touch_payload() {
        let protocol = framed();
        let codec = protocol.codec_lookup().find::<Ping>().unwrap().clone();
        let payload = Bytes::from_static(&[0, 0, 0, 7]);

        let framed = protocol.write_header(&codec, &payload).unwrap();
        assert_eq!(&framed[..], &[0x05, 0x00, 0x04, 0, 0, 0, 7]);
        assert_eq!(&payload[..], &[0, 0, 0, 7]);
    }

    #[test]
    fn test_encode_decode_frame() {
        for protocol in [classic(), framed()] {
            let frame = protocol.encode_frame(&Ping { nonce: 99 }).unwrap();
            let mut buf = BytesMut::from(&frame[..]);

            let Some(Inbound::Message { opcode, message }) = protocol.decode_frame(&mut buf).unwrap()
            else {
                panic!("expected message");
            };
            assert_eq!(opcode, Opcode(5));
            assert_eq!(message.downcast_ref::<Ping>(), Some(&Ping { nonce: 99 }));
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_decode_frame_partial_input() {
        for protocol in [classic(), framed()] {
            let frame = protocol
                .encode_frame(&Kick {
                    reason: "bye".to_string(),
                })
                .unwrap();

            let mut buf = BytesMut::from(&frame[..frame.len() - 1]);
            assert!(protocol.decode_frame(&mut buf).unwrap().is_none());
            assert_eq!(buf.len(), frame.len() - 1);

            buf.extend_from_slice(&frame[frame.len() - 1..]);
            let inbound = protocol.decode_frame(&mut buf).unwrap();
            assert!(matches!(inbound, Some(Inbound::Message { .. })));
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_decode_frame_skips_then_decodes() {
        let protocol = framed();
        let mut buf = BytesMut::from(&[0x40, 0x00, 0x01, 0xEE][..]);
        buf.extend_from_slice(&protocol.encode_frame(&Ping { nonce: 1 }).unwrap());

        assert!(matches!(
            protocol.decode_frame(&mut buf).unwrap(),
            Some(Inbound::Skipped {
                opcode: Opcode(0x40),
                frame_len: 4
            })
        ));
        assert!(matches!(
            protocol.decode_frame(&mut buf).unwrap(),
            Some(Inbound::Message { .. })
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_trailing_payload_bytes_rejected() {
        let protocol = framed();
        // Ping payload is 4 bytes but the frame declares 5.
        let mut buf = BytesMut::from(&[0x05, 0x00, 0x05, 0, 0, 0, 1, 0xFF, 0x05][..]);

        let err = protocol.decode_frame(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedPayload { message: "Ping", .. }));
        // The bad frame is consumed; the next byte is the following frame.
        assert_eq!(&buf[..], &[0x05]);
    }

    #[test]
    fn test_short_payload_in_delimited_frame_is_malformed() {
        let protocol = framed();
        let mut buf = BytesMut::from(&[0x05, 0x00, 0x02, 0, 0][..]);
        assert!(matches!(
            protocol.decode_frame(&mut buf).unwrap_err(),
            ProtocolError::MalformedPayload { .. }
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_unframed_payload_over_limit_is_fatal() {
        let protocol = protocol(
            FrameLayout::opcode_only(IntWidth::U8).with_max_payload(8),
            false,
        );
        // Kick with a 100-byte reason: the codec decodes it but the payload
        // is larger than the layout allows.
        let mut frame = vec![0xFF, 0x00, 100];
        frame.extend_from_slice(&[b'x'; 100]);
        let mut buf = BytesMut::from(&frame[..]);

        let err = protocol.decode_frame(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { size: 102, max: 8 }));
        assert!(err.is_fatal());
        assert!(protocol
            .encode_frame(&Kick {
                reason: "x".repeat(100),
            })
            .is_err());
    }

    #[test]
    fn test_unframed_incomplete_payload_over_limit_is_fatal() {
        let protocol = protocol(
            FrameLayout::opcode_only(IntWidth::U8).with_max_payload(8),
            false,
        );
        // Kick claiming a 65535-byte reason, arriving in pieces.
        let mut buf = BytesMut::from(&[0xFF, 0xFF, 0xFF][..]);
        assert!(protocol.decode_frame(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&[b'z'; 6]);
        assert!(protocol.decode_frame(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&[b'z'; 1]);
        assert!(matches!(
            protocol.decode_frame(&mut buf).unwrap_err(),
            ProtocolError::FrameTooLarge { size: 9, max: 8 }
        ));
    }

    #[test]
    fn test_encode_unregistered_message() {
        let protocol = classic();
        let err = protocol
            .encode_frame(&Hello {
                name: "x".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, ProtocolError::NoCodecForMessage { message: "Hello" }));
    }

    #[test]
    fn test_introduction_absent_vs_empty() {
        let absent = classic().introduction_message("alice");
        assert!(absent.is_none());

        let present = framed().introduction_message("").unwrap();
        assert_eq!(
            present.downcast_ref::<Hello>(),
            Some(&Hello {
                name: String::new()
            })
        );
    }

    #[test]
    fn test_factories() {
        let protocol = classic();
        let kick = protocol.kick_message(&ChatArguments::from("flooding"));
        assert_eq!(
            kick.downcast_ref::<Kick>().map(|k| k.reason.as_str()),
            Some("flooding")
        );

        let command = protocol.command_message(&Command::new("say"), &ChatArguments::from("hi"));
        assert_eq!(
            command.downcast_ref::<Kick>().map(|k| k.reason.as_str()),
            Some("/say hi")
        );
    }
}
