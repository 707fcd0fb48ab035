//! Channel adapter
//!
//! Wraps the event-driven duplex channel (a WebSocket) as a pull-based
//! sequence of binary chunks with explicit end and error terminals, so the
//! relay engine stays callback-free and can be driven by synthetic sources
//! in tests.
//!
//! If the upgrade request carried base64url "early data" in the
//! `sec-websocket-protocol` header, it is decoded and delivered as the
//! logical first chunk before any live message; a client can therefore send
//! its handshake with zero additional round trips. Early data that fails to
//! decode is treated as absent, never as a session error.

use async_trait::async_trait;
use base64::alphabet;
use base64::engine::general_purpose::GeneralPurpose;
use base64::engine::{DecodePaddingMode, GeneralPurposeConfig};
use base64::Engine as _;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::trace;

/// Normal-closure status code
pub const CLOSE_NORMAL: u16 = 1000;

/// Abnormal-closure status code (internal error)
pub const CLOSE_ABNORMAL: u16 = 1011;

/// Upgrade-request header that may carry early data
pub const EARLY_DATA_HEADER: &str = "sec-websocket-protocol";

/// Clients pad or omit base64 padding inconsistently; accept both.
const EARLY_DATA_B64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Channel errors
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("channel closed")]
    Closed,
}

/// Pull side of the duplex channel: a sequence of binary chunks.
///
/// `None` is the end-of-stream terminal; `Some(Err(_))` is the error
/// terminal. After either, no further chunks are produced.
#[async_trait]
pub trait ChunkSource: Send {
    async fn next_chunk(&mut self) -> Option<Result<Bytes, ChannelError>>;
}

/// Push side of the duplex channel.
///
/// Shared by the outbound pump and the datagram pipeline, so methods take
/// `&self`. `close` is best-effort: a channel that is already gone is not an
/// error worth surfacing.
#[async_trait]
pub trait ClientSink: Send + Sync {
    async fn send(&self, data: Bytes) -> Result<(), ChannelError>;
    async fn close(&self, code: u16, reason: &str);
}

/// Decode base64url early data from the upgrade request.
///
/// Returns `None` on empty input or any decode failure.
pub fn decode_early_data(header_value: &str) -> Option<Bytes> {
    if header_value.is_empty() {
        return None;
    }
    match EARLY_DATA_B64.decode(header_value) {
        Ok(data) if !data.is_empty() => Some(Bytes::from(data)),
        Ok(_) => None,
        Err(err) => {
            trace!("ignoring undecodable early data: {}", err);
            None
        }
    }
}

/// WebSocket-backed chunk source
pub struct WsChunkSource<S> {
    inner: SplitStream<WebSocketStream<S>>,
    early_data: Option<Bytes>,
}

impl<S> WsChunkSource<S> {
    pub fn new(inner: SplitStream<WebSocketStream<S>>, early_data: Option<Bytes>) -> Self {
        Self { inner, early_data }
    }
}

#[async_trait]
impl<S> ChunkSource for WsChunkSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn next_chunk(&mut self) -> Option<Result<Bytes, ChannelError>> {
        if let Some(data) = self.early_data.take() {
            return Some(Ok(data));
        }

        while let Some(message) = self.inner.next().await {
            match message {
                Ok(Message::Binary(data)) => return Some(Ok(data)),
                Ok(Message::Close(_)) => return None,
                // Text frames carry nothing for this protocol; ping/pong are
                // handled by the websocket layer.
                Ok(_) => continue,
                Err(err) => return Some(Err(ChannelError::WebSocket(err.to_string()))),
            }
        }
        None
    }
}

/// WebSocket-backed client sink
pub struct WsClientSink<S> {
    inner: Mutex<SplitSink<WebSocketStream<S>, Message>>,
}

impl<S> WsClientSink<S> {
    pub fn new(inner: SplitSink<WebSocketStream<S>, Message>) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }
}

#[async_trait]
impl<S> ClientSink for WsClientSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&self, data: Bytes) -> Result<(), ChannelError> {
        let mut sink = self.inner.lock().await;
        sink.send(Message::Binary(data))
            .await
            .map_err(|e| ChannelError::WebSocket(e.to_string()))
    }

    async fn close(&self, code: u16, reason: &str) {
        let mut sink = self.inner.lock().await;
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        let _ = sink.send(Message::Close(Some(frame))).await;
        let _ = sink.close().await;
    }
}
