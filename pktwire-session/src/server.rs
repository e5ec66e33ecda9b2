//! TCP listener and the async loop driving a [`Connection`].

use crate::connection::Connection;
use crate::error::SessionError;
use crate::handler::{CommandSink, LoggingSink};
use crate::metrics::Metrics;
use crate::session::{
    Session, DEFAULT_INBOX_LIMIT, DEFAULT_OUTBOUND_LIMIT, DEFAULT_PENDING_PING_LIMIT,
};
use pktwire_protocol::{ChatArguments, ProtocolRegistry};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Protocol id every accepted connection speaks.
    pub protocol: String,
    /// Idle connection timeout.
    pub idle_timeout: Duration,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Per-session outbound queue limit.
    pub outbound_limit: usize,
    /// Per-session chat inbox limit.
    pub inbox_limit: usize,
    /// Per-session limit on unanswered pings.
    pub pending_ping_limit: usize,
    /// Where received commands go.
    pub command_sink: Arc<dyn CommandSink>,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("protocol", &self.protocol)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_connections", &self.max_connections)
            .field("outbound_limit", &self.outbound_limit)
            .field("inbox_limit", &self.inbox_limit)
            .field("pending_ping_limit", &self.pending_ping_limit)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr, protocol: impl Into<String>) -> Self {
        Self {
            bind_addr,
            protocol: protocol.into(),
            idle_timeout: Duration::from_secs(300),
            max_connections: 1000,
            outbound_limit: DEFAULT_OUTBOUND_LIMIT,
            inbox_limit: DEFAULT_INBOX_LIMIT,
            pending_ping_limit: DEFAULT_PENDING_PING_LIMIT,
            command_sink: Arc::new(LoggingSink),
            metrics: None,
        }
    }

    /// Builds the server configuration from loaded settings.
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            idle_timeout: config.session.idle_timeout(),
            max_connections: config.network.max_connections,
            outbound_limit: config.session.outbound_queue_limit,
            inbox_limit: config.session.inbox_limit,
            pending_ping_limit: config.session.pending_ping_limit,
            ..Self::new(config.network.bind_addr, config.protocol.default.clone())
        }
    }

    pub fn with_command_sink(mut self, sink: Arc<dyn CommandSink>) -> Self {
        self.command_sink = sink;
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Accepts TCP connections and runs one session per connection.
pub struct Server {
    config: ServerConfig,
    registry: Arc<ProtocolRegistry<Session>>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    pub fn new(config: ServerConfig, registry: Arc<ProtocolRegistry<Session>>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            config,
            registry,
            stats: Arc::new(ServerStats::default()),
            shutdown,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(&self) -> Result<(), SessionError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serves connections from an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), SessionError> {
        if !self.registry.contains(&self.config.protocol) {
            return Err(SessionError::UnknownProtocol(self.config.protocol.clone()));
        }
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            "Server listening on {} (protocol {})",
            listener.local_addr()?,
            self.config.protocol
        );

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((mut stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            let Some(protocol) = self.registry.get(&self.config.protocol) else {
                                tracing::error!("Protocol {} disappeared from registry", self.config.protocol);
                                continue;
                            };

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
                            if let Some(ref metrics) = self.config.metrics {
                                metrics.connections_total.inc();
                                metrics.connections_active.inc();
                            }

                            let session = Session::new(protocol.name())
                                .with_peer(addr)
                                .with_outbound_limit(self.config.outbound_limit)
                                .with_inbox_limit(self.config.inbox_limit)
                                .with_pending_ping_limit(self.config.pending_ping_limit)
                                .with_command_sink(self.config.command_sink.clone());
                            let mut conn = Connection::new(protocol, session);
                            if let Some(ref metrics) = self.config.metrics {
                                conn = conn.with_metrics(metrics.clone());
                            }

                            let stats = self.stats.clone();
                            let config = self.config.clone();
                            let mut conn_shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                tracing::info!("Client connected: {} (session {})", addr, conn.session().id());
                                let result = drive(&mut stream, &mut conn, config.idle_timeout, &mut conn_shutdown).await;
                                if let Err(e) = result {
                                    tracing::debug!("Connection {} error: {}", addr, e);
                                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                }
                                conn.session_mut().mark_closed();

                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                if let Some(ref metrics) = config.metrics {
                                    metrics.connections_active.dec();
                                }
                                tracing::info!("Client disconnected: {}", addr);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}

/// Moves bytes between `stream` and `conn` until the session ends.
///
/// Replies queued by handlers are written after every read. Returns `Ok` when
/// the peer disconnects, the session closes, or the idle timeout elapses.
/// Pending replies are still written before a framing error is returned and
/// before the idle or shutdown kick.
pub async fn drive<T>(
    stream: &mut T,
    conn: &mut Connection,
    idle_timeout: Duration,
    shutdown: &mut broadcast::Receiver<()>,
) -> Result<(), SessionError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 8192];

    loop {
        tokio::select! {
            result = stream.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        tracing::debug!(session = conn.session().id(), "connection closed by peer");
                        return Ok(());
                    }
                    Ok(n) => {
                        tracing::trace!(session = conn.session().id(), "received {} bytes", n);
                        conn.feed(&buf[..n]);
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            _ = tokio::time::sleep(idle_timeout) => {
                if conn.session().stats().idle_duration() >= idle_timeout {
                    tracing::debug!(session = conn.session().id(), "idle timeout");
                    write_pending(stream, conn).await?;
                    let frame = conn.kick(&ChatArguments::from("idle timeout"))?;
                    stream.write_all(&frame).await?;
                    return Ok(());
                }
                continue;
            }

            _ = shutdown.recv() => {
                tracing::debug!(session = conn.session().id(), "shutdown signal received");
                write_pending(stream, conn).await?;
                let frame = conn.kick(&ChatArguments::from("server shutting down"))?;
                stream.write_all(&frame).await?;
                return Err(SessionError::ShuttingDown);
            }
        }

        let processed = conn.process();
        write_pending(stream, conn).await?;
        processed?;

        if !conn.session().is_open() {
            tracing::debug!(
                session = conn.session().id(),
                reason = conn.session().close_reason().unwrap_or(""),
                "session closing"
            );
            return Ok(());
        }
    }
}

/// Encodes and writes every reply queued on the session.
async fn write_pending<T>(stream: &mut T, conn: &mut Connection) -> Result<(), SessionError>
where
    T: AsyncWrite + Unpin,
{
    let out = conn.flush()?;
    if !out.is_empty() {
        tracing::trace!(session = conn.session().id(), "writing {} bytes", out.len());
        stream.write_all(&out).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;
    use crate::handler::RecordingSink;
    use crate::messages::{CommandInvoke, Kick, Ping, Pong};
    use crate::session::SessionState;
    use crate::versions::{self, CLASSIC, FRAMED};
    use pktwire_protocol::Message;
    use tokio::net::TcpStream;

    fn frame(id: &str, message: &dyn Message) -> Vec<u8> {
        versions::build(id, 1024)
            .unwrap()
            .encode_frame(message)
            .unwrap()
            .to_vec()
    }

    fn connection(id: &str) -> Connection {
        Connection::new(versions::build(id, 1024).unwrap(), Session::new(id))
    }

    #[tokio::test]
    async fn test_drive_answers_ping() {
        let mut stream = tokio_test::io::Builder::new()
            .read(&frame(FRAMED, &Ping { nonce: 3 }))
            .write(&frame(FRAMED, &Pong { nonce: 3 }))
            .build();
        let (_tx, mut rx) = broadcast::channel(1);
        let mut conn = connection(FRAMED);

        drive(&mut stream, &mut conn, Duration::from_secs(60), &mut rx)
            .await
            .unwrap();
        assert_eq!(conn.session().stats().frames_in(), 1);
    }

    #[tokio::test]
    async fn test_drive_stops_on_kick() {
        let mut stream = tokio_test::io::Builder::new()
            .read(&frame(
                CLASSIC,
                &Kick {
                    reason: "bye".to_string(),
                },
            ))
            .build();
        let (_tx, mut rx) = broadcast::channel(1);
        let mut conn = connection(CLASSIC);

        drive(&mut stream, &mut conn, Duration::from_secs(60), &mut rx)
            .await
            .unwrap();
        assert_eq!(conn.session().state(), SessionState::Closing);
    }

    #[tokio::test]
    async fn test_drive_flushes_before_framing_error() {
        let mut bytes = frame(CLASSIC, &Ping { nonce: 1 });
        bytes.push(0x42);
        let mut stream = tokio_test::io::Builder::new()
            .read(&bytes)
            .write(&frame(CLASSIC, &Pong { nonce: 1 }))
            .build();
        let (_tx, mut rx) = broadcast::channel(1);
        let mut conn = connection(CLASSIC);

        let err = drive(&mut stream, &mut conn, Duration::from_secs(60), &mut rx)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(!conn.session().is_framing_valid());
    }

    #[tokio::test]
    async fn test_drive_kicks_idle_peer_after_pending_replies() {
        tokio::time::pause();
        let mut stream = tokio_test::io::Builder::new()
            .write(&frame(FRAMED, &Pong { nonce: 9 }))
            .write(&frame(
                FRAMED,
                &Kick {
                    reason: "idle timeout".to_string(),
                },
            ))
            .build();
        let (_tx, mut rx) = broadcast::channel(1);
        let mut conn = connection(FRAMED);
        conn.session_mut().queue(Box::new(Pong { nonce: 9 })).unwrap();

        let started = tokio::time::Instant::now();
        drive(&mut stream, &mut conn, Duration::from_secs(60), &mut rx)
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert_eq!(conn.session().state(), SessionState::Closing);
        assert_eq!(conn.session().close_reason(), Some("idle timeout"));
    }

    #[tokio::test]
    async fn test_drive_kicks_on_shutdown() {
        let (mut client, mut server_side) = tokio::io::duplex(1024);
        let (tx, mut rx) = broadcast::channel(1);

        let task = tokio::spawn(async move {
            let mut conn = connection(FRAMED);
            drive(&mut server_side, &mut conn, Duration::from_secs(60), &mut rx).await
        });

        tx.send(()).unwrap();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(SessionError::ShuttingDown)));

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        let mut peer = connection(FRAMED);
        peer.feed(&received);
        peer.process().unwrap();
        assert_eq!(peer.session().close_reason(), Some("server shutting down"));
    }

    #[tokio::test]
    async fn test_server_round_trip() {
        let registry = Arc::new(ProtocolRegistry::new());
        versions::register_builtin(&registry, &ProtocolConfig::default()).unwrap();

        let sink = Arc::new(RecordingSink::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap(), FRAMED)
            .with_command_sink(sink.clone())
            .with_metrics(metrics.clone());
        let server = Arc::new(Server::new(config, registry));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut client = connection(FRAMED);
        stream
            .write_all(&client.introduce("tester").unwrap().unwrap())
            .await
            .unwrap();
        stream
            .write_all(&frame(
                FRAMED,
                &CommandInvoke {
                    command: "list".to_string(),
                    args: vec![],
                },
            ))
            .await
            .unwrap();
        stream.write_all(&client.ping(11).unwrap()).await.unwrap();

        let mut buf = [0u8; 64];
        while client.session().last_rtt().is_none() {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "server closed early");
            client.feed(&buf[..n]);
            client.process().unwrap();
        }

        assert_eq!(sink.len(), 1);
        assert_eq!(sink.invocations()[0].command, "list");
        assert_eq!(server.stats().connections_total.load(Ordering::Relaxed), 1);
        assert_eq!(
            metrics
                .frames_decoded_total
                .with_label_values(&[FRAMED, "Ping"])
                .get(),
            1.0
        );

        server.shutdown();
        handle.await.unwrap().unwrap();
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_serve_unknown_protocol() {
        let registry = Arc::new(ProtocolRegistry::new());
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap(), "v9");
        let server = Server::new(config, registry);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        assert!(matches!(
            server.serve(listener).await,
            Err(SessionError::UnknownProtocol(_))
        ));
    }
}
