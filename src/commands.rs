//! Command execution.

use crate::Commands;
use bytes::BytesMut;
use colored::Colorize;
use pktwire_protocol::{ChatArguments, Command, Inbound, ProtocolRegistry, SharedProtocol};
use pktwire_session::{error_kind, Config, Connection, Metrics, Session};
use serde::Serialize;
use std::error::Error;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

type CommandResult = Result<String, Box<dyn Error>>;

/// How long `ping` waits for its pong.
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Looks up `id` in the registry.
pub fn resolve(
    registry: &ProtocolRegistry<Session>,
    id: &str,
) -> Result<SharedProtocol<Session>, Box<dyn Error>> {
    registry.get(id).ok_or_else(|| {
        format!(
            "unknown protocol '{}' (registered: {})",
            id,
            registry.ids().join(", ")
        )
        .into()
    })
}

/// Executes an offline command and returns the formatted output.
pub fn execute(
    registry: &ProtocolRegistry<Session>,
    config: &Config,
    protocol_id: &str,
    cmd: Commands,
) -> CommandResult {
    match cmd {
        Commands::Serve { .. } | Commands::Ping { .. } | Commands::Send { .. } => {
            Err("network commands are not executed here".into())
        }

        Commands::Protocols => Ok(format_protocols(registry, &config.protocol.default)),

        Commands::Config => Ok(serde_yaml::to_string(config)?),

        Commands::Decode {
            input,
            file,
            json,
            metrics,
        } => {
            let protocol = resolve(registry, protocol_id)?;
            let bytes = match (input, file) {
                (_, Some(path)) => read_file(&path)?,
                (Some(text), None) => parse_hex(&text)?,
                (None, None) => return Err("provide hex input or --file".into()),
            };

            let metrics = if metrics {
                Some(Metrics::new()?)
            } else {
                None
            };
            let reports = decode(&protocol, &bytes, metrics.as_ref());

            let mut output = if json {
                serde_json::to_string_pretty(&reports)?
            } else {
                format_reports(&reports)
            };
            if let Some(metrics) = metrics {
                output.push('\n');
                output.push_str(&String::from_utf8_lossy(&metrics.encode()?));
            }
            Ok(output)
        }

        Commands::EncodeKick { reason } => {
            let protocol = resolve(registry, protocol_id)?;
            let message = protocol.kick_message(&ChatArguments::from(reason));
            Ok(hex::encode(protocol.encode_frame(message.as_ref())?))
        }

        Commands::EncodeCommand { command, args } => {
            let protocol = resolve(registry, protocol_id)?;
            let message = protocol
                .command_message(&Command::new(command), &ChatArguments::from(args.join(" ")));
            Ok(hex::encode(protocol.encode_frame(message.as_ref())?))
        }

        Commands::Intro { identity } => {
            let protocol = resolve(registry, protocol_id)?;
            let message = protocol.introduction_message(&identity).ok_or_else(|| {
                format!("protocol '{}' has no introduction message", protocol.name())
            })?;
            Ok(hex::encode(protocol.encode_frame(message.as_ref())?))
        }
    }
}

/// Connects, introduces, pings and waits for the matching pong.
pub async fn ping(
    server: SocketAddr,
    protocol: SharedProtocol<Session>,
    identity: &str,
    nonce: u32,
) -> CommandResult {
    let (mut stream, mut conn) = open(server, protocol, identity).await?;

    let frame = conn.ping(nonce)?;
    stream.write_all(&frame).await?;

    let rtt = tokio::time::timeout(REPLY_TIMEOUT, await_pong(&mut stream, &mut conn))
        .await
        .map_err(|_| "timed out waiting for pong")??;

    let frame = conn.kick(&ChatArguments::from("done"))?;
    stream.write_all(&frame).await?;

    Ok(format!(
        "{} from {} in {:.2?}",
        "PONG".green(),
        server.to_string().cyan(),
        rtt
    ))
}

/// Connects, introduces, invokes `command` and disconnects.
pub async fn send(
    server: SocketAddr,
    protocol: SharedProtocol<Session>,
    identity: &str,
    command: &str,
    args: &[String],
) -> CommandResult {
    let (mut stream, mut conn) = open(server, protocol, identity).await?;

    let frame = conn.command(&Command::new(command), &ChatArguments::from(args.join(" ")))?;
    stream.write_all(&frame).await?;

    let frame = conn.kick(&ChatArguments::from("done"))?;
    stream.write_all(&frame).await?;
    stream.shutdown().await?;

    Ok(format!(
        "{} {} to {} ({} frames)",
        "Sent".green(),
        command.cyan(),
        server,
        conn.session().stats().frames_out()
    ))
}

async fn open(
    server: SocketAddr,
    protocol: SharedProtocol<Session>,
    identity: &str,
) -> Result<(TcpStream, Connection), Box<dyn Error>> {
    let mut stream = TcpStream::connect(server).await?;
    let session = Session::new(protocol.name());
    let mut conn = Connection::new(protocol, session);

    if let Some(frame) = conn.introduce(identity)? {
        stream.write_all(&frame).await?;
    }
    tracing::debug!(%server, session = conn.session().id(), "connected");
    Ok((stream, conn))
}

async fn await_pong(
    stream: &mut TcpStream,
    conn: &mut Connection,
) -> Result<Duration, Box<dyn Error>> {
    let mut buf = [0u8; 8192];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err("connection closed by server".into());
        }
        conn.feed(&buf[..n]);
        conn.process()?;

        let replies = conn.flush()?;
        if !replies.is_empty() {
            stream.write_all(&replies).await?;
        }

        if let Some(rtt) = conn.session().last_rtt() {
            return Ok(rtt);
        }
        if !conn.session().is_open() {
            return Err(format!(
                "kicked by server: {}",
                conn.session().close_reason().unwrap_or("no reason")
            )
            .into());
        }
    }
}

/// One entry of a decode run.
#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FrameReport {
    Message {
        offset: usize,
        len: usize,
        opcode: u32,
        message: &'static str,
        fields: String,
    },
    Skipped {
        offset: usize,
        len: usize,
        opcode: u32,
    },
    Error {
        offset: usize,
        error: String,
        fatal: bool,
    },
    Incomplete {
        offset: usize,
        remaining: usize,
    },
}

/// Decodes every frame in `bytes`, stopping where framing is lost.
pub fn decode(
    protocol: &SharedProtocol<Session>,
    bytes: &[u8],
    metrics: Option<&Metrics>,
) -> Vec<FrameReport> {
    let mut buf = BytesMut::from(bytes);
    let mut reports = Vec::new();

    while !buf.is_empty() {
        let offset = bytes.len() - buf.len();
        match protocol.decode_frame(&mut buf) {
            Ok(Some(Inbound::Message { opcode, message })) => {
                let name = message.message_type().name();
                if let Some(metrics) = metrics {
                    metrics
                        .frames_decoded_total
                        .with_label_values(&[protocol.name(), name])
                        .inc();
                }
                reports.push(FrameReport::Message {
                    offset,
                    len: bytes.len() - buf.len() - offset,
                    opcode: opcode.value(),
                    message: name,
                    fields: format!("{:?}", message),
                });
            }
            Ok(Some(Inbound::Skipped { opcode, frame_len })) => {
                if let Some(metrics) = metrics {
                    metrics
                        .frames_skipped_total
                        .with_label_values(&[protocol.name()])
                        .inc();
                }
                reports.push(FrameReport::Skipped {
                    offset,
                    len: frame_len,
                    opcode: opcode.value(),
                });
            }
            Ok(None) => {
                reports.push(FrameReport::Incomplete {
                    offset,
                    remaining: buf.len(),
                });
                break;
            }
            Err(err) => {
                if let Some(metrics) = metrics {
                    metrics
                        .framing_errors_total
                        .with_label_values(&[protocol.name(), error_kind(&err)])
                        .inc();
                }
                let consumed = bytes.len() - buf.len() > offset;
                let fatal = err.is_fatal() || !protocol.is_self_delimiting() || !consumed;
                reports.push(FrameReport::Error {
                    offset,
                    error: err.to_string(),
                    fatal,
                });
                if fatal {
                    break;
                }
            }
        }
    }

    reports
}

fn format_reports(reports: &[FrameReport]) -> String {
    if reports.is_empty() {
        return "(no frames)".dimmed().to_string();
    }
    reports
        .iter()
        .map(|report| match report {
            FrameReport::Message {
                offset,
                len,
                opcode,
                message,
                fields,
            } => format!(
                "{:>6}  {:>4}B  0x{:02x}  {} {}",
                offset,
                len,
                opcode,
                message.green(),
                fields.dimmed()
            ),
            FrameReport::Skipped {
                offset,
                len,
                opcode,
            } => format!(
                "{:>6}  {:>4}B  0x{:02x}  {}",
                offset,
                len,
                opcode,
                "skipped (no codec)".yellow()
            ),
            FrameReport::Error {
                offset,
                error,
                fatal,
            } => {
                let label = if *fatal {
                    "framing lost".red()
                } else {
                    "dropped".yellow()
                };
                format!("{:>6}  {}: {}", offset, label, error)
            }
            FrameReport::Incomplete { offset, remaining } => format!(
                "{:>6}  {}",
                offset,
                format!("incomplete frame ({} bytes buffered)", remaining).yellow()
            ),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_protocols(registry: &ProtocolRegistry<Session>, default: &str) -> String {
    let mut lines = Vec::new();
    for id in registry.ids() {
        let Some(protocol) = registry.get(&id) else {
            continue;
        };
        let framing = if protocol.is_self_delimiting() {
            "length-prefixed".green()
        } else {
            "opcode-only".yellow()
        };
        let intro = if protocol.introduction_message("").is_some() {
            "introduction"
        } else {
            "no introduction"
        };
        let marker = if id == default { " (default)" } else { "" };
        lines.push(format!(
            "{}{}  {}  {}",
            id.cyan().bold(),
            marker,
            framing,
            intro.dimmed()
        ));

        let mut codecs = protocol.codec_lookup().codecs();
        codecs.sort_by_key(|codec| codec.opcode());
        for codec in codecs {
            lines.push(format!(
                "  {:>6}  {}",
                codec.opcode().to_string(),
                codec.message_type().name()
            ));
        }
    }
    lines.join("\n")
}

fn parse_hex(text: &str) -> Result<Vec<u8>, hex::FromHexError> {
    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    hex::decode(cleaned.trim_start_matches("0x"))
}

fn read_file(path: &Path) -> Result<Vec<u8>, Box<dyn Error>> {
    std::fs::read(path)
        .map_err(|e| format!("failed to read '{}': {}", path.display(), e).into())
}
