use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use websocket_tunnel::{
    ClientConfig, ServerConfig, client,
    config::{CLIENT_CONFIG_FILE, SERVER_CONFIG_FILE},
    load_or_create, server,
};

#[derive(Parser, Debug)]
#[command(
    name = "websocket-tunnel",
    version,
    about = "Tunnel raw TCP connections over WebSocket"
)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Accept local TCP connections and carry each over its own WebSocket
    Client(ModeArgs),
    /// Accept WebSocket connections and carry each to the TCP backend
    Server(ModeArgs),
}

#[derive(Args, Debug)]
struct ModeArgs {
    /// Configuration file; created with defaults if missing
    #[arg(long, short, env = "WEBSOCKET_TUNNEL_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "websocket-tunnel starting");

    let result = match cli.mode {
        Mode::Client(args) => run_client(args).await,
        Mode::Server(args) => run_server(args).await,
    };

    if let Err(ref e) = result {
        let error = format!("{e:#}");
        error!(error = %error, "Fatal error, shutting down");
    }
    result
}

async fn run_client(args: ModeArgs) -> Result<()> {
    let path = args
        .config
        .unwrap_or_else(|| PathBuf::from(CLIENT_CONFIG_FILE));
    let config: ClientConfig = load_or_create(&path)
        .with_context(|| format!("Failed to load {}", path.display()))?;

    info!(
        config_file = %path.display(),
        local_port = config.local_port,
        websocket_url = %config.websocket_url,
        reconnect_delay_sec = config.reconnect_delay_sec,
        max_retries = config.max_retries,
        handshake_timeout_sec = config.handshake_timeout_sec,
        resolve_cdn = config.resolve_cdn,
        "Configuration loaded"
    );

    client::run(config).await
}

async fn run_server(args: ModeArgs) -> Result<()> {
    let path = args
        .config
        .unwrap_or_else(|| PathBuf::from(SERVER_CONFIG_FILE));
    let config: ServerConfig = load_or_create(&path)
        .with_context(|| format!("Failed to load {}", path.display()))?;

    info!(
        config_file = %path.display(),
        ws_port = config.ws_port,
        tcp_host = %config.tcp_host,
        tcp_port = config.tcp_port,
        tls = config.tls.is_some(),
        "Configuration loaded"
    );

    server::run(config).await
}
