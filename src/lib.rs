//! # Specter Relay
//!
//! An authenticated proxy relay that bridges WebSocket clients to outbound
//! TCP connections, with a narrow UDP-over-HTTPS path for DNS traffic.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Server Binary                       │
//! │        (accept loop, WebSocket upgrade, CLI)         │
//! ├─────────────────────────────────────────────────────┤
//! │                   Relay Engine                       │
//! │   (session state machine, bidirectional pumps)       │
//! ├──────────────────────────┬──────────────────────────┤
//! │   Fallback Coordinator   │    Datagram Reframer      │
//! │   (NAT64 re-dial, once)  │    (DNS-over-HTTPS)       │
//! ├──────────────────────────┴──────────────────────────┤
//! │          Header Codec  /  Channel Adapter            │
//! │   (binary handshake, chunked duplex channel)         │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! A session starts when a WebSocket client delivers its handshake header
//! (optionally as base64url "early data" on the upgrade request). The header
//! names a target address and a command; stream commands open a TCP bridge,
//! datagram commands are accepted only for DNS and relayed over HTTPS. If a
//! direct TCP egress connects but produces no data, the session is re-routed
//! exactly once through a synthesized NAT64 IPv6 address.

pub mod channel;
pub mod config;
pub mod dns;
pub mod fallback;
pub mod protocol;
pub mod relay;

pub use config::Config;
pub use relay::RelayEngine;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The only UDP target port the datagram command accepts
pub const DNS_PORT: u16 = 53;

/// Maximum bytes read from the outbound connection per pump iteration
pub const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Header error: {0}")]
    Header(#[from] protocol::HeaderError),

    #[error("Channel error: {0}")]
    Channel(#[from] channel::ChannelError),

    #[error("Relay error: {0}")]
    Relay(#[from] relay::RelayError),

    #[error("Fallback error: {0}")]
    Fallback(#[from] fallback::FallbackError),

    #[error("DNS error: {0}")]
    Dns(#[from] dns::DnsError),

    #[error("Configuration error: {0}")]
    Config(String),
}
