//! Per-connection session state.
//!
//! A [`Session`] is the handle built-in message handlers act on. It is owned
//! by the connection driving it; only [`SessionStats`] is shared.

use crate::error::SessionError;
use crate::handler::{CommandSink, LoggingSink};
use parking_lot::Mutex;
use pktwire_protocol::Message;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Default cap on queued replies.
pub const DEFAULT_OUTBOUND_LIMIT: usize = 256;

/// Default number of chat lines a session keeps.
pub const DEFAULT_INBOX_LIMIT: usize = 64;

/// Default number of unanswered pings a session tracks.
pub const DEFAULT_PENDING_PING_LIMIT: usize = 16;

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, no introduction received.
    Connected,
    /// Peer introduced itself.
    Introduced,
    /// Kicked or framing lost; pending output may still be flushed.
    Closing,
    /// Connection torn down.
    Closed,
}

/// Counters readable from outside the connection task.
#[derive(Debug)]
pub struct SessionStats {
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    frames_skipped: AtomicU64,
    created_at: Instant,
    last_activity: Mutex<Instant>,
}

impl SessionStats {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            frames_in: AtomicU64::new(0),
            frames_out: AtomicU64::new(0),
            frames_skipped: AtomicU64::new(0),
            created_at: now,
            last_activity: Mutex::new(now),
        }
    }

    pub fn record_inbound(&self) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
        *self.last_activity.lock() = Instant::now();
    }

    pub fn record_skipped(&self) {
        self.frames_skipped.fetch_add(1, Ordering::Relaxed);
        *self.last_activity.lock() = Instant::now();
    }

    pub fn record_outbound(&self) {
        self.frames_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_in(&self) -> u64 {
        self.frames_in.load(Ordering::Relaxed)
    }

    pub fn frames_out(&self) -> u64 {
        self.frames_out.load(Ordering::Relaxed)
    }

    pub fn frames_skipped(&self) -> u64 {
        self.frames_skipped.load(Ordering::Relaxed)
    }

    /// Time since the last inbound frame.
    pub fn idle_duration(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// A peer session.
pub struct Session {
    id: String,
    peer: Option<SocketAddr>,
    protocol: String,
    state: SessionState,
    identity: Option<String>,
    close_reason: Option<String>,
    framing_valid: bool,
    outbound: VecDeque<Box<dyn Message>>,
    outbound_limit: usize,
    inbox: VecDeque<String>,
    inbox_limit: usize,
    pending_pings: HashMap<u32, Instant>,
    pending_ping_limit: usize,
    last_rtt: Option<Duration>,
    commands: Arc<dyn CommandSink>,
    stats: Arc<SessionStats>,
}

impl Session {
    /// Creates a session speaking `protocol`.
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            peer: None,
            protocol: protocol.into(),
            state: SessionState::Connected,
            identity: None,
            close_reason: None,
            framing_valid: true,
            outbound: VecDeque::new(),
            outbound_limit: DEFAULT_OUTBOUND_LIMIT,
            inbox: VecDeque::new(),
            inbox_limit: DEFAULT_INBOX_LIMIT,
            pending_pings: HashMap::new(),
            pending_ping_limit: DEFAULT_PENDING_PING_LIMIT,
            last_rtt: None,
            commands: Arc::new(LoggingSink),
            stats: Arc::new(SessionStats::new()),
        }
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn with_outbound_limit(mut self, limit: usize) -> Self {
        self.outbound_limit = limit;
        self
    }

    pub fn with_inbox_limit(mut self, limit: usize) -> Self {
        self.inbox_limit = limit.max(1);
        self
    }

    pub fn with_pending_ping_limit(mut self, limit: usize) -> Self {
        self.pending_ping_limit = limit.max(1);
        self
    }

    /// Sets where received commands are forwarded.
    pub fn with_command_sink(mut self, sink: Arc<dyn CommandSink>) -> Self {
        self.commands = sink;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Id of the protocol this session speaks.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, SessionState::Connected | SessionState::Introduced)
    }

    /// Identity from the peer's introduction.
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    /// Records the peer's introduction.
    pub fn introduce(&mut self, identity: impl Into<String>) {
        self.identity = Some(identity.into());
        if self.state == SessionState::Connected {
            self.state = SessionState::Introduced;
        }
    }

    /// Moves the session to `Closing`. The first reason given is kept.
    pub fn close(&mut self, reason: impl Into<String>) {
        if self.close_reason.is_none() {
            self.close_reason = Some(reason.into());
        }
        if self.state != SessionState::Closed {
            self.state = SessionState::Closing;
        }
    }

    pub fn mark_closed(&mut self) {
        self.state = SessionState::Closed;
        self.outbound.clear();
    }

    /// Whether the inbound stream is still positioned on a frame boundary.
    pub fn is_framing_valid(&self) -> bool {
        self.framing_valid
    }

    /// Marks the inbound stream unusable and starts closing.
    pub fn invalidate_framing(&mut self, reason: impl Into<String>) {
        self.framing_valid = false;
        self.close(reason);
    }

    /// Queues a reply for the connection to encode and send.
    pub fn queue(&mut self, message: Box<dyn Message>) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        if self.outbound.len() >= self.outbound_limit {
            return Err(SessionError::OutboundQueueFull {
                limit: self.outbound_limit,
            });
        }
        self.outbound.push_back(message);
        Ok(())
    }

    /// Removes and returns all queued replies in order.
    pub fn take_outbound(&mut self) -> Vec<Box<dyn Message>> {
        self.outbound.drain(..).collect()
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    /// Appends a received chat line, dropping the oldest once the inbox is full.
    pub fn push_chat(&mut self, text: impl Into<String>) {
        if self.inbox.len() >= self.inbox_limit {
            self.inbox.pop_front();
            tracing::debug!(
                session = %self.id,
                limit = self.inbox_limit,
                "inbox full, dropped oldest line"
            );
        }
        self.inbox.push_back(text.into());
    }

    pub fn inbox(&self) -> &VecDeque<String> {
        &self.inbox
    }

    pub fn take_inbox(&mut self) -> Vec<String> {
        self.inbox.drain(..).collect()
    }

    /// Remembers when a ping with `nonce` was sent.
    ///
    /// Once the limit is reached the oldest unanswered ping is forgotten;
    /// a late pong for it is then unmatched.
    pub fn record_ping_sent(&mut self, nonce: u32) {
        if !self.pending_pings.contains_key(&nonce)
            && self.pending_pings.len() >= self.pending_ping_limit
        {
            let oldest = self
                .pending_pings
                .iter()
                .min_by_key(|(_, sent)| **sent)
                .map(|(nonce, _)| *nonce);
            if let Some(oldest) = oldest {
                self.pending_pings.remove(&oldest);
            }
        }
        self.pending_pings.insert(nonce, Instant::now());
    }

    pub fn pending_pings(&self) -> usize {
        self.pending_pings.len()
    }

    /// Matches a pong to its ping, returning the round trip time.
    pub fn record_pong(&mut self, nonce: u32) -> Option<Duration> {
        let sent = self.pending_pings.remove(&nonce)?;
        let rtt = sent.elapsed();
        self.last_rtt = Some(rtt);
        Some(rtt)
    }

    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    pub fn commands(&self) -> &Arc<dyn CommandSink> {
        &self.commands
    }

    pub fn stats(&self) -> &Arc<SessionStats> {
        &self.stats
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("protocol", &self.protocol)
            .field("state", &self.state)
            .field("identity", &self.identity)
            .field("framing_valid", &self.framing_valid)
            .field("outbound", &self.outbound.len())
            .finish()
    }
}
