//! pktwire - packet protocol toolkit
//!
//! Inspects the built-in protocol versions, decodes captured byte streams,
//! builds frames, and runs or talks to a session server.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use pktwire_protocol::ProtocolRegistry;
use pktwire_session::{register_builtin, Config, Metrics, Server, ServerConfig, Session};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pktwire")]
#[command(about = "Packet protocol toolkit: decode, encode, serve")]
#[command(version)]
struct Cli {
    /// YAML config file (defaults to $PKTWIRE_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Protocol id (defaults to protocol.default from config)
    #[arg(short, long, global = true)]
    protocol: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List registered protocols and their opcodes
    Protocols,

    /// Print the effective configuration as YAML
    Config,

    /// Decode a captured byte stream
    Decode {
        /// Hex-encoded bytes
        input: Option<String>,

        /// Read raw bytes from a file instead
        #[arg(short, long, conflicts_with = "input")]
        file: Option<PathBuf>,

        /// Print frames as JSON
        #[arg(long)]
        json: bool,

        /// Print Prometheus metrics for the decode run
        #[arg(long)]
        metrics: bool,
    },

    /// Encode a kick frame
    EncodeKick {
        /// Reason shown to the peer
        reason: String,
    },

    /// Encode a command invocation frame
    EncodeCommand {
        /// Command name
        command: String,

        /// Command arguments
        args: Vec<String>,
    },

    /// Encode an introduction frame
    Intro {
        /// Identity to introduce
        identity: String,
    },

    /// Run a session server
    Serve {
        /// Bind address (overrides network.bind_addr)
        #[arg(short, long)]
        bind: Option<SocketAddr>,

        /// Print Prometheus metrics on shutdown
        #[arg(long)]
        metrics: bool,
    },

    /// Ping a server and report the round trip
    Ping {
        /// Server address
        #[arg(short, long, default_value = "127.0.0.1:7420")]
        server: SocketAddr,

        /// Identity sent in the introduction
        #[arg(short, long, default_value = "pktwire-cli")]
        identity: String,

        /// Nonce carried by the ping
        #[arg(short, long, default_value_t = 1)]
        nonce: u32,
    },

    /// Invoke a command on a server
    Send {
        /// Server address
        #[arg(short, long, default_value = "127.0.0.1:7420")]
        server: SocketAddr,

        /// Identity sent in the introduction
        #[arg(short, long, default_value = "pktwire-cli")]
        identity: String,

        /// Command name
        command: String,

        /// Command arguments
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    if cli.config.is_some() {
        config.apply_overrides(|key| std::env::var(key).ok());
    }
    config.validate()?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log.level)),
        )
        .init();

    let registry = Arc::new(ProtocolRegistry::<Session>::new());
    register_builtin(&registry, &config.protocol)?;

    let protocol_id = cli
        .protocol
        .clone()
        .unwrap_or_else(|| config.protocol.default.clone());

    let result = match cli.command {
        Commands::Serve { bind, metrics } => {
            serve(&config, registry, protocol_id, bind, metrics).await
        }
        Commands::Ping {
            server,
            identity,
            nonce,
        } => match commands::resolve(&registry, &protocol_id) {
            Ok(protocol) => commands::ping(server, protocol, &identity, nonce).await,
            Err(e) => Err(e),
        },
        Commands::Send {
            server,
            identity,
            command,
            args,
        } => match commands::resolve(&registry, &protocol_id) {
            Ok(protocol) => commands::send(server, protocol, &identity, &command, &args).await,
            Err(e) => Err(e),
        },
        cmd => commands::execute(&registry, &config, &protocol_id, cmd),
    };

    match result {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn serve(
    config: &Config,
    registry: Arc<ProtocolRegistry<Session>>,
    protocol_id: String,
    bind: Option<SocketAddr>,
    with_metrics: bool,
) -> Result<String, Box<dyn std::error::Error>> {
    let protocol = commands::resolve(&registry, &protocol_id)?;

    let mut server_config = ServerConfig::from_config(config);
    server_config.protocol = protocol.name().to_string();
    if let Some(bind) = bind {
        server_config.bind_addr = bind;
    }
    let metrics = if with_metrics {
        let metrics = Arc::new(Metrics::new()?);
        server_config = server_config.with_metrics(metrics.clone());
        Some(metrics)
    } else {
        None
    };

    tracing::info!("Starting pktwire server");
    tracing::info!("  Bind address: {}", server_config.bind_addr);
    tracing::info!("  Protocol: {}", server_config.protocol);
    tracing::info!("  Idle timeout: {:?}", server_config.idle_timeout);
    tracing::info!("  Max connections: {}", server_config.max_connections);

    let server = Arc::new(Server::new(server_config, registry));

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    server.run().await?;
    tracing::info!("Server stopped");

    match metrics {
        Some(metrics) => Ok(String::from_utf8_lossy(&metrics.encode()?).into_owned()),
        None => Ok(String::new()),
    }
}
