//! Tandem - Bidirectional multiplexed RPC
//!
//! Command-line front end: serve the demo services, call them, and manage
//! configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tandem::config::{self, Config};
use tandem::context::{ContextKey, SessionContext, SessionContextFactory};
use tandem::network::{NetworkConfig as NetConfig, RpcClient, RpcServer, ServerEvent};
use tandem::protocol::{self, PeerRole, SerializationFormat, ServiceCallIdentifier};
use tandem::rpc::{NodeBuilder, NodeConfig, ResponseSink, ServiceRegistry, Streaming};
use tandem::HeartbeatFactory;

/// Name the server publishes in each peer's session context
const SERVER_NAME: ContextKey<String> = ContextKey::new("tandem.server-name");

/// Tandem - Bidirectional multiplexed RPC
#[derive(Parser)]
#[command(name = "tandem")]
#[command(author = "Tandem Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Bidirectional multiplexed RPC over a single connection", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the demo services
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Interface to bind to
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Make a unary call with a JSON request
    Call {
        /// Server address (host or host:port)
        #[arg(short, long, default_value = "127.0.0.1")]
        server: String,

        /// Call identifier, e.g. demo/strlen
        call: ServiceCallIdentifier,

        /// Request as JSON
        #[arg(default_value = "null")]
        request: String,
    },

    /// Make a server-streaming call and print every response
    Stream {
        /// Server address (host or host:port)
        #[arg(short, long, default_value = "127.0.0.1")]
        server: String,

        /// Call identifier, e.g. demo/count
        call: ServiceCallIdentifier,

        /// Request as JSON
        #[arg(default_value = "null")]
        request: String,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show protocol information
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging; RUST_LOG wins over the flags
    let level = if cli.verbose || config.general.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Serve { port, bind } => {
            run_server(config, port, bind).await?;
        }
        Commands::Call {
            server,
            call,
            request,
        } => {
            run_call(config, &server, call, &request).await?;
        }
        Commands::Stream {
            server,
            call,
            request,
        } => {
            run_stream(config, &server, call, &request).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print_protocol_info(&config);
        }
    }

    Ok(())
}

/// Node builder carrying the configured extensions
fn node_builder(config: &Config, role: PeerRole, context: Option<SessionContextFactory>) -> NodeBuilder {
    let mut builder = NodeBuilder::new(role).config(NodeConfig::from(config));
    if config.heartbeat.enabled {
        builder = builder.extension(HeartbeatFactory::from(config));
    }
    if let Some(context) = context.filter(|_| config.context.enabled) {
        builder = builder.extension(context);
    }
    builder
}

fn demo_call(name: &str) -> ServiceCallIdentifier {
    ServiceCallIdentifier::new("demo", name)
}

/// Services offered by `tandem serve`
fn demo_registry() -> ServiceRegistry {
    let mut registry = ServiceRegistry::new();

    registry
        .register_unary(demo_call("strlen"), |text: String| async move {
            Ok(text.chars().count() as u64)
        })
        .register_server_stream(demo_call("count"), |up_to: u64, sink: ResponseSink<u64>| async move {
            for n in 1..=up_to {
                sink.send(&n).await?;
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Ok(())
        })
        .register_client_stream(demo_call("sum"), |mut numbers: Streaming<i64>| async move {
            let mut total = 0i64;
            while let Some(n) = numbers.message().await? {
                total = total.checked_add(n).context("sum overflowed")?;
            }
            Ok(total)
        })
        .register_bidi_stream(
            demo_call("echo"),
            |mut lines: Streaming<String>, sink: ResponseSink<String>| async move {
                while let Some(line) = lines.message().await? {
                    sink.send(&line).await?;
                }
                Ok(())
            },
        );

    registry
}

/// Run the demo server
async fn run_server(config: Config, port: Option<u16>, bind: Option<String>) -> anyhow::Result<()> {
    let mut net_config = NetConfig::from(&config);
    if let Some(port) = port {
        net_config.port = port;
    }
    if let Some(bind) = bind {
        net_config = net_config.with_bind_address(bind);
    }

    let server_name = config.general.name.clone();
    let context = SessionContextFactory::per_connection(SerializationFormat::Json, move |context| {
        if let Err(e) = context.set(&SERVER_NAME, &server_name) {
            tracing::warn!("Could not publish server name: {}", e);
        }
    });

    let builder = node_builder(&config, PeerRole::Acceptor, Some(context)).registry(demo_registry());
    let mut server = RpcServer::new(net_config, builder);
    let mut event_rx = server
        .take_event_receiver()
        .context("server event receiver already taken")?;

    let bound = server.start().await?;

    println!("\n========================================");
    println!("  Tandem Server Running");
    println!("========================================");
    println!("  Name: {}", config.general.name);
    println!("  Address: {}", bound);
    println!("  Services: demo/strlen demo/count demo/sum demo/echo");
    println!("========================================");
    println!("\nPress Ctrl+C to stop.\n");

    // Main event loop
    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ServerEvent::PeerConnected { addr, node_id } => {
                        println!("+ Peer connected: {} ({})", node_id, addr);
                    }
                    ServerEvent::PeerDisconnected { addr } => {
                        println!("- Peer disconnected: {}", addr);
                    }
                    ServerEvent::HandshakeFailed { addr, message } => {
                        tracing::warn!("Rejected {}: {}", addr, message);
                    }
                    ServerEvent::Error { message } => {
                        tracing::error!("Server error: {}", message);
                    }
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    server.stop().await?;
    tracing::info!("Server stopped");

    Ok(())
}

fn parse_server(server: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let addr = if server.contains(':') {
        server.parse()?
    } else {
        format!("{}:{}", server, port).parse()?
    };
    Ok(addr)
}

/// Connect as an initiator that only speaks JSON, so requests and responses
/// can be arbitrary JSON values
async fn connect_json(config: &Config, server: &str) -> anyhow::Result<(RpcClient, std::sync::Arc<SessionContext>)> {
    let mut config = config.clone();
    config.node.formats = vec![SerializationFormat::Json];

    let net_config = NetConfig::from(&config);
    let addr = parse_server(server, net_config.port)?;
    let context = SessionContext::new();
    let builder = node_builder(
        &config,
        PeerRole::Initiator,
        Some(SessionContextFactory::new(context.clone())),
    );

    let client = RpcClient::connect(addr, &net_config, builder)
        .await
        .with_context(|| format!("connecting to {}", addr))?;
    Ok((client, context))
}

/// Unary call from the command line
async fn run_call(config: Config, server: &str, call: ServiceCallIdentifier, request: &str) -> anyhow::Result<()> {
    let request: serde_json::Value = serde_json::from_str(request).context("request is not valid JSON")?;
    let (client, _context) = connect_json(&config, server).await?;

    let response: serde_json::Value = client.transport().unary(&call, &request).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);

    client.disconnect().await;
    Ok(())
}

/// Server-streaming call from the command line
async fn run_stream(config: Config, server: &str, call: ServiceCallIdentifier, request: &str) -> anyhow::Result<()> {
    let request: serde_json::Value = serde_json::from_str(request).context("request is not valid JSON")?;
    let (client, context) = connect_json(&config, server).await?;

    let mut responses = client
        .transport()
        .server_stream::<_, serde_json::Value>(&call, &request)
        .await?;

    loop {
        tokio::select! {
            item = responses.next() => match item {
                Some(Ok(value)) => println!("{}", value),
                Some(Err(e)) => return Err(e.into()),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("\nCancelling...");
                responses.cancel();
                break;
            }
        }
    }

    if let Ok(Some(name)) = context.get(&SERVER_NAME) {
        tracing::info!("Served by {}", name);
    }
    client.disconnect().await;
    Ok(())
}

/// Print protocol information
fn print_protocol_info(config: &Config) {
    println!("Tandem Protocol Information");
    println!("===========================\n");

    println!("Protocol version: {}", protocol::PROTOCOL_VERSION);
    println!("Default port: {}", protocol::DEFAULT_PORT);
    let formats: Vec<&str> = config.node.formats.iter().map(|f| f.name()).collect();
    println!("Formats (preferred first): {}", formats.join(", "));

    println!("\nExtensions:");
    println!(
        "  heartbeat: {} (every {} ms, timeout {} ms)",
        if config.heartbeat.enabled { "on" } else { "off" },
        config.heartbeat.interval_ms,
        config.heartbeat.timeout_ms
    );
    println!(
        "  session-context: {}",
        if config.context.enabled { "on" } else { "off" }
    );
}
