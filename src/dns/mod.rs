//! Datagram reframing and DNS-over-HTTPS transport
//!
//! The datagram command carries DNS messages over the byte channel as
//! repeated `[2-byte big-endian length][payload]` frames. Each extracted
//! payload becomes one independent HTTPS query; each response is re-framed
//! the same way and returned in submission order.
//!
//! The same HTTPS endpoint also answers the JSON-format A-record lookups
//! the fallback coordinator needs.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// A-record answer type in the DNS JSON format
const RECORD_TYPE_A: u16 = 1;

/// DNS transport errors
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("http error: {0}")]
    Http(String),

    #[error("bad response: {0}")]
    BadResponse(String),

    #[error("no A record for {0}")]
    NoAnswer(String),
}

/// DNS-over-HTTPS capability.
///
/// Injected into the relay engine and the fallback coordinator so tests can
/// substitute deterministic in-memory implementations.
#[async_trait]
pub trait DnsTransport: Send + Sync {
    /// Resolve a name to an IPv4 address via the JSON answer format.
    async fn resolve_a(&self, name: &str) -> Result<Ipv4Addr, DnsError>;

    /// Relay one raw DNS message; returns the raw response message bytes.
    async fn query_message(&self, message: &[u8]) -> Result<Bytes, DnsError>;
}

/// Split a chunk into datagram payloads.
///
/// Scans `[len(2,BE)][payload(len)]` repeatedly until the chunk is
/// exhausted. Each chunk is scanned independently; a frame whose declared
/// length overruns the chunk terminates the scan and the truncated tail is
/// dropped.
pub fn split_frames(chunk: &[u8]) -> Vec<Bytes> {
    let mut frames = Vec::new();
    let mut index = 0;

    while index + 2 <= chunk.len() {
        let len = u16::from_be_bytes([chunk[index], chunk[index + 1]]) as usize;
        let start = index + 2;
        let end = start + len;
        if end > chunk.len() {
            debug!(
                "dropping truncated datagram frame: declared {} bytes, {} available",
                len,
                chunk.len() - start
            );
            break;
        }
        frames.push(Bytes::copy_from_slice(&chunk[start..end]));
        index = end;
    }

    frames
}

/// Re-frame a response payload as `[len(2,BE)][payload]`.
pub fn frame_response(payload: &[u8]) -> Bytes {
    let mut framed = BytesMut::with_capacity(2 + payload.len());
    framed.put_u16(payload.len() as u16);
    framed.extend_from_slice(payload);
    framed.freeze()
}

#[derive(Debug, Deserialize)]
struct DnsJsonResponse {
    #[serde(rename = "Answer", default)]
    answer: Vec<DnsJsonAnswer>,
}

#[derive(Debug, Deserialize)]
struct DnsJsonAnswer {
    #[serde(rename = "type")]
    record_type: u16,
    data: String,
}

/// DNS-over-HTTPS client against a single resolver endpoint
pub struct DohClient {
    endpoint: String,
    client: reqwest::Client,
}

impl DohClient {
    /// Create a client for the given query endpoint,
    /// e.g. `https://1.1.1.1/dns-query`.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, DnsError> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .build()
            .map_err(|e| DnsError::Http(e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }
}

#[async_trait]
impl DnsTransport for DohClient {
    async fn resolve_a(&self, name: &str) -> Result<Ipv4Addr, DnsError> {
        let resp = self
            .client
            .get(&self.endpoint)
            .query(&[("name", name), ("type", "A")])
            .header(ACCEPT, "application/dns-json")
            .send()
            .await
            .map_err(|e| DnsError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(DnsError::BadResponse(format!("status={}", resp.status())));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| DnsError::Http(e.to_string()))?;
        let parsed: DnsJsonResponse =
            serde_json::from_slice(&body).map_err(|e| DnsError::BadResponse(e.to_string()))?;

        parsed
            .answer
            .iter()
            .find(|record| record.record_type == RECORD_TYPE_A)
            .and_then(|record| record.data.parse().ok())
            .ok_or_else(|| DnsError::NoAnswer(name.to_string()))
    }

    async fn query_message(&self, message: &[u8]) -> Result<Bytes, DnsError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/dns-message")
            .body(message.to_vec())
            .send()
            .await
            .map_err(|e| DnsError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(DnsError::BadResponse(format!("status={}", resp.status())));
        }

        resp.bytes().await.map_err(|e| DnsError::Http(e.to_string()))
    }
}
