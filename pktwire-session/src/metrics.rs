//! Prometheus metrics for the packet pipeline.

use pktwire_protocol::ProtocolError;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};

/// Prometheus metrics for protocol sessions.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Frames decoded by protocol and message.
    pub frames_decoded_total: CounterVec,
    /// Frames skipped for lack of a codec, by protocol.
    pub frames_skipped_total: CounterVec,
    /// Framing and decode errors by protocol and kind.
    pub framing_errors_total: CounterVec,
    /// Frames encoded by protocol and message.
    pub frames_encoded_total: CounterVec,
    /// Decoded messages with no registered handler, by protocol and message.
    pub unhandled_total: CounterVec,
    /// Total connections accepted.
    pub connections_total: Counter,
    /// Currently active connections.
    pub connections_active: Gauge,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let frames_decoded_total = CounterVec::new(
            Opts::new("pktwire_frames_decoded_total", "Frames decoded"),
            &["protocol", "message"],
        )?;
        registry.register(Box::new(frames_decoded_total.clone()))?;

        let frames_skipped_total = CounterVec::new(
            Opts::new(
                "pktwire_frames_skipped_total",
                "Frames skipped because no codec is registered for the opcode",
            ),
            &["protocol"],
        )?;
        registry.register(Box::new(frames_skipped_total.clone()))?;

        let framing_errors_total = CounterVec::new(
            Opts::new("pktwire_framing_errors_total", "Framing and decode errors"),
            &["protocol", "kind"],
        )?;
        registry.register(Box::new(framing_errors_total.clone()))?;

        let frames_encoded_total = CounterVec::new(
            Opts::new("pktwire_frames_encoded_total", "Frames encoded"),
            &["protocol", "message"],
        )?;
        registry.register(Box::new(frames_encoded_total.clone()))?;

        let unhandled_total = CounterVec::new(
            Opts::new(
                "pktwire_unhandled_total",
                "Decoded messages with no registered handler",
            ),
            &["protocol", "message"],
        )?;
        registry.register(Box::new(unhandled_total.clone()))?;

        let connections_total = Counter::with_opts(Opts::new(
            "pktwire_connections_total",
            "Total number of connections accepted",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "pktwire_connections_active",
            "Number of currently active connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        Ok(Self {
            registry,
            frames_decoded_total,
            frames_skipped_total,
            framing_errors_total,
            frames_encoded_total,
            unhandled_total,
            connections_total,
            connections_active,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Metric label for a decode error.
pub fn error_kind(err: &ProtocolError) -> &'static str {
    match err {
        ProtocolError::UnknownPacket { .. } => "unknown_packet",
        ProtocolError::FrameTooLarge { .. } => "frame_too_large",
        ProtocolError::VarIntTooLong { .. } => "varint_too_long",
        ProtocolError::VarIntOverflow => "varint_overflow",
        ProtocolError::MalformedPayload { .. } => "malformed_payload",
        ProtocolError::InvalidUtf8 => "invalid_utf8",
        ProtocolError::IncompleteFrame { .. } => "incomplete",
        _ => "other",
    }
}
