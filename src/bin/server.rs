//! Specter Relay Server
//!
//! Accepts WebSocket upgrades, authenticates the handshake header against
//! the configured user id, and bridges each session to its outbound target
//! through the relay engine.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, info};

use futures_util::StreamExt;
use specter_relay::channel::{decode_early_data, WsChunkSource, WsClientSink, EARLY_DATA_HEADER};
use specter_relay::dns::{DnsTransport, DohClient};
use specter_relay::fallback::FallbackCoordinator;
use specter_relay::relay::{RelayEngine, TcpDialer};
use specter_relay::Config;

/// Specter Relay Server - WebSocket-to-TCP proxy relay
#[derive(Parser, Debug)]
#[command(name = "specter-server")]
#[command(about = "Authenticated WebSocket-to-TCP proxy relay")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,

    /// Write an example configuration file and exit
    #[arg(long)]
    write_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log_level))
        .init();

    if args.write_config {
        Config::default()
            .save(&args.config)
            .context("Failed to write example configuration")?;
        info!("Wrote example configuration to {}", args.config);
        return Ok(());
    }

    let config = if Path::new(&args.config).exists() {
        Config::load(&args.config).context("Failed to load configuration")?
    } else {
        debug!("no configuration file at {}, using defaults", args.config);
        Config::default()
    };

    let listen = args.listen.unwrap_or_else(|| config.server.listen.clone());
    let user_id = config.server.user_id().context("Invalid user id")?;

    let dns: Arc<dyn DnsTransport> = Arc::new(
        DohClient::new(config.server.doh_endpoint.clone())
            .context("Failed to build DNS-over-HTTPS client")?,
    );

    let prefixes = config.server.nat64_prefixes().context("Invalid NAT64 prefixes")?;
    let fallback = if prefixes.is_empty() {
        info!("no NAT64 prefixes configured, fallback disabled");
        None
    } else {
        Some(Arc::new(FallbackCoordinator::new(dns.clone(), prefixes)))
    };

    let engine = Arc::new(RelayEngine::new(
        user_id,
        Arc::new(TcpDialer),
        dns,
        fallback,
    ));

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!("specter-relay listening on {}", listen);

    loop {
        let (stream, peer) = listener.accept().await.context("accept failed")?;
        debug!("new connection from {}", peer);

        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_client(stream, engine).await {
                debug!("session from {} ended: {}", peer, err);
            }
        });
    }
}

/// Upgrade one TCP connection to a WebSocket and run its relay session.
async fn handle_client(stream: TcpStream, engine: Arc<RelayEngine>) -> Result<()> {
    stream.set_nodelay(true).ok();

    // The early-data header doubles as the negotiated subprotocol; echo it
    // back so clients that sent one accept the upgrade.
    let mut early_data_header: Option<String> = None;
    let ws_stream = accept_hdr_async(stream, |req: &Request, mut resp: Response| {
        if let Some(value) = req
            .headers()
            .get(EARLY_DATA_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            if let Ok(echo) = HeaderValue::from_str(value) {
                resp.headers_mut().insert(EARLY_DATA_HEADER, echo);
            }
            early_data_header = Some(value.to_string());
        }
        Ok::<Response, ErrorResponse>(resp)
    })
    .await
    .context("websocket upgrade failed")?;

    let early_data = early_data_header.as_deref().and_then(decode_early_data);

    let (ws_sink, ws_source) = ws_stream.split();
    let source = Box::new(WsChunkSource::new(ws_source, early_data));
    let sink = Arc::new(WsClientSink::new(ws_sink));

    if let Err(err) = engine.run(source, sink).await {
        // Session-level failures are expected operational noise; the engine
        // has already logged the interesting ones.
        debug!("relay session error: {}", err);
    }
    Ok(())
}
