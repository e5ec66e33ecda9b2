//! Handlers for the built-in messages.

use crate::messages::{Chat, CommandInvoke, Introduction, Kick, Ping, Pong};
use crate::session::Session;
use parking_lot::Mutex;
use pktwire_protocol::{
    Handler, HandlerError, HandlerLookupService, MessageHandler, ProtocolError,
};

/// Receives commands invoked by a peer.
pub trait CommandSink: Send + Sync {
    fn invoke(&self, session_id: &str, command: &str, args: &[String]) -> Result<(), HandlerError>;
}

/// Logs commands and does nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

impl CommandSink for LoggingSink {
    fn invoke(&self, session_id: &str, command: &str, args: &[String]) -> Result<(), HandlerError> {
        tracing::info!(session = session_id, command, ?args, "command invoked");
        Ok(())
    }
}

/// One recorded command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub session_id: String,
    pub command: String,
    pub args: Vec<String>,
}

/// Keeps every invocation in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    invocations: Mutex<Vec<Invocation>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.invocations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.invocations.lock().is_empty()
    }
}

impl CommandSink for RecordingSink {
    fn invoke(&self, session_id: &str, command: &str, args: &[String]) -> Result<(), HandlerError> {
        self.invocations.lock().push(Invocation {
            session_id: session_id.to_string(),
            command: command.to_string(),
            args: args.to_vec(),
        });
        Ok(())
    }
}

/// Answers a ping with a pong carrying the same nonce.
pub struct PingHandler;

impl MessageHandler<Session> for PingHandler {
    type Message = Ping;

    fn handle(&self, session: &mut Session, ping: &Ping) -> Result<(), HandlerError> {
        session.queue(Box::new(Pong { nonce: ping.nonce }))?;
        Ok(())
    }
}

pub struct PongHandler;

impl MessageHandler<Session> for PongHandler {
    type Message = Pong;

    fn handle(&self, session: &mut Session, pong: &Pong) -> Result<(), HandlerError> {
        match session.record_pong(pong.nonce) {
            Some(rtt) => {
                tracing::debug!(session = session.id(), nonce = pong.nonce, ?rtt, "pong")
            }
            None => tracing::debug!(session = session.id(), nonce = pong.nonce, "unsolicited pong"),
        }
        Ok(())
    }
}

pub struct KickHandler;

impl MessageHandler<Session> for KickHandler {
    type Message = Kick;

    fn handle(&self, session: &mut Session, kick: &Kick) -> Result<(), HandlerError> {
        tracing::info!(session = session.id(), reason = %kick.reason, "kicked by peer");
        session.close(kick.reason.clone());
        Ok(())
    }
}

pub struct IntroductionHandler;

impl MessageHandler<Session> for IntroductionHandler {
    type Message = Introduction;

    fn handle(&self, session: &mut Session, intro: &Introduction) -> Result<(), HandlerError> {
        if intro.protocol != session.protocol() {
            return Err(Box::new(ProtocolError::MalformedPayload {
                message: "Introduction",
                reason: format!(
                    "peer speaks '{}', session speaks '{}'",
                    intro.protocol,
                    session.protocol()
                ),
            }));
        }
        tracing::debug!(session = session.id(), identity = %intro.identity, "introduced");
        session.introduce(intro.identity.clone());
        Ok(())
    }
}

pub struct CommandHandler;

impl MessageHandler<Session> for CommandHandler {
    type Message = CommandInvoke;

    fn handle(&self, session: &mut Session, invoke: &CommandInvoke) -> Result<(), HandlerError> {
        session
            .commands()
            .invoke(session.id(), &invoke.command, &invoke.args)
    }
}

pub struct ChatHandler;

impl MessageHandler<Session> for ChatHandler {
    type Message = Chat;

    fn handle(&self, session: &mut Session, chat: &Chat) -> Result<(), HandlerError> {
        session.push_chat(chat.text.clone());
        Ok(())
    }
}

/// Handlers for every built-in message.
pub fn builtin_handlers() -> Result<HandlerLookupService<Session>, ProtocolError> {
    let mut handlers = HandlerLookupService::new();
    handlers.register(Handler::new(PingHandler))?;
    handlers.register(Handler::new(PongHandler))?;
    handlers.register(Handler::new(KickHandler))?;
    handlers.register(Handler::new(IntroductionHandler))?;
    handlers.register(Handler::new(CommandHandler))?;
    handlers.register(Handler::new(ChatHandler))?;
    Ok(handlers)
}
