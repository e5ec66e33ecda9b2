//! Inbound decode/dispatch pipeline and outbound framing for one session.
//!
//! A [`Connection`] is transport-agnostic: bytes go in through
//! [`feed`](Connection::feed), frames come out of the `send` family. The
//! async driver in [`server`](crate::server) moves bytes between it and a
//! socket.

use crate::error::SessionError;
use crate::messages::Ping;
use crate::metrics::{error_kind, Metrics};
use crate::session::{Session, SessionState};
use bytes::{Bytes, BytesMut};
use pktwire_protocol::{
    ChatArguments, Command, Dispatch, Inbound, Message, ProtocolError, SharedProtocol,
};
use std::sync::Arc;

/// A session bound to the protocol it speaks.
pub struct Connection {
    protocol: SharedProtocol<Session>,
    session: Session,
    inbound: BytesMut,
    metrics: Option<Arc<Metrics>>,
}

impl Connection {
    pub fn new(protocol: SharedProtocol<Session>, session: Session) -> Self {
        Self {
            protocol,
            session,
            inbound: BytesMut::with_capacity(8192),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn protocol(&self) -> &SharedProtocol<Session> {
        &self.protocol
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn into_session(self) -> Session {
        self.session
    }

    /// Appends received bytes to the inbound buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.inbound.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet decoded.
    pub fn buffered(&self) -> usize {
        self.inbound.len()
    }

    /// Decodes the next message, passing over frames that have no codec.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A decode error that
    /// leaves the read position off a frame boundary invalidates the
    /// session's framing; every later call fails with
    /// [`SessionError::FramingInvalid`].
    pub fn next_message(&mut self) -> Result<Option<Box<dyn Message>>, SessionError> {
        if !self.session.is_framing_valid() {
            return Err(SessionError::FramingInvalid);
        }

        loop {
            match self.protocol.decode_frame(&mut self.inbound) {
                Ok(None) => return Ok(None),
                Ok(Some(Inbound::Skipped { opcode, frame_len })) => {
                    tracing::warn!(
                        session = self.session.id(),
                        protocol = self.protocol.name(),
                        %opcode,
                        frame_len,
                        "skipped packet with no codec"
                    );
                    self.session.stats().record_skipped();
                    if let Some(ref metrics) = self.metrics {
                        metrics
                            .frames_skipped_total
                            .with_label_values(&[self.protocol.name()])
                            .inc();
                    }
                }
                Ok(Some(Inbound::Message { opcode, message })) => {
                    tracing::trace!(
                        session = self.session.id(),
                        %opcode,
                        message = message.message_type().name(),
                        "decoded"
                    );
                    self.session.stats().record_inbound();
                    if let Some(ref metrics) = self.metrics {
                        metrics
                            .frames_decoded_total
                            .with_label_values(&[
                                self.protocol.name(),
                                message.message_type().name(),
                            ])
                            .inc();
                    }
                    return Ok(Some(message));
                }
                Err(err) => {
                    self.on_decode_error(&err);
                    return Err(err.into());
                }
            }
        }
    }

    fn on_decode_error(&mut self, err: &ProtocolError) {
        if let Some(ref metrics) = self.metrics {
            metrics
                .framing_errors_total
                .with_label_values(&[self.protocol.name(), error_kind(err)])
                .inc();
        }

        // Without a length prefix a failed decode leaves the read position
        // somewhere inside the frame.
        if err.is_fatal() || !self.protocol.is_self_delimiting() {
            tracing::error!(
                session = self.session.id(),
                protocol = self.protocol.name(),
                error = %err,
                "framing lost"
            );
            self.session.invalidate_framing(err.to_string());
        } else {
            tracing::warn!(
                session = self.session.id(),
                protocol = self.protocol.name(),
                error = %err,
                "dropped malformed frame"
            );
        }
    }

    /// Runs the registered handler for `message`.
    pub fn dispatch(&mut self, message: &dyn Message) -> Result<Dispatch, SessionError> {
        let name = message.message_type().name();
        let outcome = self
            .protocol
            .handler_lookup()
            .dispatch(&mut self.session, message)
            .map_err(|e| SessionError::Handler {
                message: name,
                reason: e.to_string(),
            })?;

        if outcome == Dispatch::Unhandled {
            tracing::debug!(session = self.session.id(), message = name, "no handler");
            if let Some(ref metrics) = self.metrics {
                metrics
                    .unhandled_total
                    .with_label_values(&[self.protocol.name(), name])
                    .inc();
            }
        }
        Ok(outcome)
    }

    /// Decodes and dispatches every complete frame buffered.
    ///
    /// Stops early once the session leaves the open states. Malformed
    /// frames on a self-delimiting protocol and failing handlers are logged
    /// and passed over. Returns the number of messages dispatched.
    pub fn process(&mut self) -> Result<usize, SessionError> {
        let mut dispatched = 0;
        while self.session.is_open() {
            let message = match self.next_message() {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(err) if self.session.is_framing_valid() => {
                    tracing::debug!(error = %err, "continuing after frame error");
                    continue;
                }
                Err(err) => return Err(err),
            };

            match self.dispatch(message.as_ref()) {
                Ok(_) => dispatched += 1,
                Err(err) => {
                    tracing::warn!(session = self.session.id(), error = %err, "handler failed")
                }
            }
        }
        Ok(dispatched)
    }

    /// Encodes and frames `message`.
    pub fn send(&mut self, message: &dyn Message) -> Result<Bytes, SessionError> {
        if self.session.state() == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        let frame = self.protocol.encode_frame(message)?;
        self.session.stats().record_outbound();
        if let Some(ref metrics) = self.metrics {
            metrics
                .frames_encoded_total
                .with_label_values(&[self.protocol.name(), message.message_type().name()])
                .inc();
        }
        Ok(frame)
    }

    /// Encodes every reply the handlers queued, in order.
    pub fn flush(&mut self) -> Result<BytesMut, SessionError> {
        let mut out = BytesMut::new();
        for message in self.session.take_outbound() {
            let frame = self.send(message.as_ref())?;
            out.extend_from_slice(&frame);
        }
        Ok(out)
    }

    /// Frames this side's introduction, if the protocol has one.
    pub fn introduce(&mut self, identity: &str) -> Result<Option<Bytes>, SessionError> {
        match self.protocol.introduction_message(identity) {
            Some(message) => Ok(Some(self.send(message.as_ref())?)),
            None => Ok(None),
        }
    }

    /// Frames a kick and starts closing the session.
    pub fn kick(&mut self, reason: &ChatArguments) -> Result<Bytes, SessionError> {
        let message = self.protocol.kick_message(reason);
        let frame = self.send(message.as_ref())?;
        self.session.close(reason.plain());
        Ok(frame)
    }

    /// Frames a command invocation.
    pub fn command(
        &mut self,
        command: &Command,
        arguments: &ChatArguments,
    ) -> Result<Bytes, SessionError> {
        let message = self.protocol.command_message(command, arguments);
        self.send(message.as_ref())
    }

    /// Frames a ping and starts timing its round trip.
    pub fn ping(&mut self, nonce: u32) -> Result<Bytes, SessionError> {
        let frame = self.send(&Ping { nonce })?;
        self.session.record_ping_sent(nonce);
        Ok(frame)
    }
}
