//! Relay engine
//!
//! One session per accepted channel. The first chunk is parsed by the
//! header codec; stream commands open a TCP bridge and run two concurrent
//! pumps, datagram commands (DNS only) run the reframer pipeline. The
//! engine owns the session state machine:
//!
//! ```text
//! Init -> HeaderPending -> Dialing -> Relaying -> Closed
//!                 \            \          \
//!                  +------------+----------+--> Failed
//! ```
//!
//! If the primary egress closes without having delivered a single byte and
//! a fallback coordinator is wired, the engine re-dials once through a
//! synthesized NAT64 address and restarts the pumps; the retry itself gets
//! no further fallback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{ChannelError, ChunkSource, ClientSink, CLOSE_ABNORMAL, CLOSE_NORMAL};
use crate::dns::{self, DnsTransport};
use crate::fallback::{FallbackCoordinator, FallbackError};
use crate::protocol::{Command, HeaderError, ProtocolHeader};
use crate::{DNS_PORT, READ_BUFFER_SIZE};

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("header rejected: {0}")]
    Header(#[from] HeaderError),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("udp relay supports only dns (port 53), got port {0}")]
    UnsupportedUdpTarget(u16),

    #[error("fallback failed: {0}")]
    Fallback(#[from] FallbackError),
}

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the first chunk
    Init,
    /// First chunk arrived, header being parsed
    HeaderPending,
    /// Opening the outbound connection
    Dialing,
    /// Both pumps running
    Relaying,
    /// Terminated cleanly
    Closed,
    /// Terminated by an error
    Failed,
}

/// Anything that can serve as an outbound byte stream
pub trait OutboundStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> OutboundStream for T {}

/// Boxed outbound connection handle
pub type BoxedOutbound = Box<dyn OutboundStream>;

/// Outbound dial capability, injected so tests can substitute in-memory
/// connections and deterministic failures.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> std::io::Result<BoxedOutbound>;
}

/// Direct TCP dialer
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, host: &str, port: u16) -> std::io::Result<BoxedOutbound> {
        // Bare IPv6 literals need brackets before the port is appended
        let addr = if host.contains(':') && !host.starts_with('[') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        };
        let stream = TcpStream::connect(&addr).await?;
        stream.set_nodelay(true).ok();
        Ok(Box::new(stream))
    }
}

/// Per-channel session state.
///
/// The two flags are the only cross-pump communication: each is written
/// once and read by the pump that owns the opposite direction, so plain
/// atomics suffice.
pub struct Session {
    header: ProtocolHeader,
    datagram: bool,
    state: std::sync::Mutex<SessionState>,
    prefix_sent: AtomicBool,
    bytes_received: AtomicBool,
}

impl Session {
    fn new(header: ProtocolHeader) -> Self {
        let datagram = header.command == Command::Datagram;
        Self {
            header,
            datagram,
            state: std::sync::Mutex::new(SessionState::Dialing),
            prefix_sent: AtomicBool::new(false),
            bytes_received: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
        debug!(?state, "session state");
    }

    fn mark_bytes_received(&self) {
        self.bytes_received.store(true, Ordering::Release);
    }

    fn saw_bytes(&self) -> bool {
        self.bytes_received.load(Ordering::Acquire)
    }

    /// Frame a payload for the client, claiming the response-prefix slot on
    /// the first call. The compare-exchange makes the injection exactly-once
    /// even under concurrent delivery.
    fn frame_for_client(&self, payload: &[u8]) -> Bytes {
        let first = self
            .prefix_sent
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            let prefix = self.header.response_prefix();
            let mut combined = BytesMut::with_capacity(prefix.len() + payload.len());
            combined.extend_from_slice(&prefix);
            combined.extend_from_slice(payload);
            combined.freeze()
        } else {
            Bytes::copy_from_slice(payload)
        }
    }
}

/// The session state machine and pump driver
pub struct RelayEngine {
    user_id: Uuid,
    dialer: Arc<dyn Dialer>,
    dns: Arc<dyn DnsTransport>,
    fallback: Option<Arc<FallbackCoordinator>>,
}

impl RelayEngine {
    pub fn new(
        user_id: Uuid,
        dialer: Arc<dyn Dialer>,
        dns: Arc<dyn DnsTransport>,
        fallback: Option<Arc<FallbackCoordinator>>,
    ) -> Self {
        Self {
            user_id,
            dialer,
            dns,
            fallback,
        }
    }

    /// Run one session to completion.
    ///
    /// Consumes the chunk source; the sink is shared with whichever pump
    /// sends to the client. All fatal conditions surface to the client only
    /// as a close code/reason pair.
    pub async fn run(
        &self,
        mut source: Box<dyn ChunkSource>,
        sink: Arc<dyn ClientSink>,
    ) -> Result<(), RelayError> {
        let first = match source.next_chunk().await {
            Some(Ok(chunk)) => chunk,
            Some(Err(err)) => {
                sink.close(CLOSE_ABNORMAL, "channel error").await;
                return Err(err.into());
            }
            None => {
                debug!("channel closed before handshake");
                return Ok(());
            }
        };

        let header = match ProtocolHeader::parse(&first, &self.user_id) {
            Ok(header) => header,
            Err(err) => {
                warn!("handshake rejected: {}", err);
                // Rejected handshakes never see a response prefix.
                sink.close(CLOSE_ABNORMAL, "handshake rejected").await;
                return Err(err.into());
            }
        };

        let initial_payload = first.slice(header.payload_offset..);
        let session = Session::new(header);
        info!(
            remote = %session.header.target,
            port = session.header.port,
            command = ?session.header.command,
            "session established"
        );

        if session.datagram {
            if session.header.port != DNS_PORT {
                let port = session.header.port;
                session.set_state(SessionState::Failed);
                sink.close(CLOSE_ABNORMAL, "udp relay supports dns only").await;
                return Err(RelayError::UnsupportedUdpTarget(port));
            }
            return self.run_datagram(source, sink, session, initial_payload).await;
        }

        self.run_stream(source, sink, session, initial_payload).await
    }

    /// Stream command: TCP bridge with two concurrent pumps.
    async fn run_stream(
        &self,
        mut source: Box<dyn ChunkSource>,
        sink: Arc<dyn ClientSink>,
        session: Session,
        initial: Bytes,
    ) -> Result<(), RelayError> {
        let host = session.header.target.host();
        let port = session.header.port;

        let outbound = match self.dialer.dial(&host, port).await {
            Ok(stream) => stream,
            Err(err) => {
                // An immediate dial failure is not a fallback trigger; the
                // fallback is reserved for connections that open but
                // deliver nothing.
                warn!("connect to {}:{} failed: {}", host, port, err);
                session.set_state(SessionState::Failed);
                sink.close(CLOSE_ABNORMAL, "connect failed").await;
                return Err(RelayError::ConnectFailed(err.to_string()));
            }
        };

        let (reader, writer) = tokio::io::split(outbound);
        let writer = Arc::new(Mutex::new(writer));

        // The remainder of the handshake chunk is the first outbound write.
        if !initial.is_empty() {
            if let Err(err) = writer.lock().await.write_all(&initial).await {
                session.set_state(SessionState::Failed);
                sink.close(CLOSE_ABNORMAL, "outbound write failed").await;
                return Err(err.into());
            }
        }

        session.set_state(SessionState::Relaying);

        // Inbound pump: every further client chunk goes to the outbound
        // handle verbatim. Ends when the client channel ends.
        let inbound_writer = writer.clone();
        let inbound = async {
            while let Some(item) = source.next_chunk().await {
                let chunk = item?;
                inbound_writer.lock().await.write_all(&chunk).await?;
            }
            Ok::<(), RelayError>(())
        };

        // Outbound pump: remote bytes go to the client, response prefix on
        // the first chunk only. A zero-data close escalates to the
        // single-shot fallback; the loop re-enters with the replacement
        // connection and an emptied fallback slot.
        let outbound_sink = sink.clone();
        let outbound = async {
            let mut reader = reader;
            let mut fallback = self.fallback.clone();
            loop {
                pump_outbound(&mut reader, outbound_sink.as_ref(), &session).await?;

                let coordinator = if session.saw_bytes() { None } else { fallback.take() };
                let Some(coordinator) = coordinator else {
                    return Ok::<(), RelayError>(());
                };

                let alternate = coordinator.resolve_alternate(&session.header.target).await?;
                info!("primary egress produced no data, retrying via {}", alternate);

                let replacement = self
                    .dialer
                    .dial(&alternate, session.header.port)
                    .await
                    .map_err(|err| {
                        RelayError::ConnectFailed(format!("fallback dial failed: {}", err))
                    })?;
                let (new_reader, new_writer) = tokio::io::split(replacement);
                {
                    let mut guard = writer.lock().await;
                    *guard = new_writer;
                    if !initial.is_empty() {
                        guard.write_all(&initial).await?;
                    }
                }
                reader = new_reader;
            }
        };

        // Whichever side finishes first decides the teardown; dropping the
        // other pump future cancels its pending I/O and releases the
        // outbound handle.
        let result = tokio::select! {
            res = inbound => match res {
                Ok(()) => {
                    debug!("client channel closed");
                    Ok(())
                }
                Err(err) => Err(err),
            },
            res = outbound => match res {
                Ok(()) => {
                    sink.close(CLOSE_NORMAL, "normal closure").await;
                    Ok(())
                }
                Err(err) => Err(err),
            },
        };

        match &result {
            Ok(()) => session.set_state(SessionState::Closed),
            Err(err) => {
                warn!("relay terminated: {}", err);
                session.set_state(SessionState::Failed);
                sink.close(CLOSE_ABNORMAL, &err.to_string()).await;
            }
        }
        result
    }

    /// Datagram command: reframer pipeline against the DNS upstream.
    async fn run_datagram(
        &self,
        mut source: Box<dyn ChunkSource>,
        sink: Arc<dyn ClientSink>,
        session: Session,
        initial: Bytes,
    ) -> Result<(), RelayError> {
        session.set_state(SessionState::Relaying);

        let result = async {
            self.forward_datagrams(&initial, sink.as_ref(), &session).await?;
            while let Some(item) = source.next_chunk().await {
                let chunk = item?;
                self.forward_datagrams(&chunk, sink.as_ref(), &session).await?;
            }
            Ok::<(), RelayError>(())
        }
        .await;

        match &result {
            Ok(()) => {
                session.set_state(SessionState::Closed);
                sink.close(CLOSE_NORMAL, "normal closure").await;
            }
            Err(err) => {
                warn!("datagram relay terminated: {}", err);
                session.set_state(SessionState::Failed);
                sink.close(CLOSE_ABNORMAL, &err.to_string()).await;
            }
        }
        result
    }

    /// Issue one upstream query per frame in `chunk`, in order.
    ///
    /// A failed query is logged and skipped; it must not cascade into
    /// closing the channel. A failed send to the client is fatal.
    async fn forward_datagrams(
        &self,
        chunk: &[u8],
        sink: &dyn ClientSink,
        session: &Session,
    ) -> Result<(), RelayError> {
        for query in dns::split_frames(chunk) {
            let response = match self.dns.query_message(&query).await {
                Ok(response) => response,
                Err(err) => {
                    warn!("dns query failed: {}", err);
                    continue;
                }
            };
            debug!("dns answer of {} bytes", response.len());
            let framed = dns::frame_response(&response);
            sink.send(session.frame_for_client(&framed)).await?;
        }
        Ok(())
    }
}

/// Copy outbound bytes to the client until the remote side closes.
///
/// Returns `Ok(())` on clean close (read of zero), error on I/O or send
/// failure. Sets the byte-received flag before delivering each chunk.
async fn pump_outbound<R>(
    reader: &mut R,
    sink: &dyn ClientSink,
    session: &Session,
) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        session.mark_bytes_received();
        sink.send(session.frame_for_client(&buf[..n])).await?;
    }
}
