//! Handshake header codec
//!
//! Wire layout of the client's first chunk:
//!
//! ```text
//! +--------+----------------+--------+----------+--------+--------+
//! | ver(1) |     id(16)     | opt(1) | opt data | cmd(1) | port(2)|
//! +--------+----------------+--------+----------+--------+--------+
//! | atyp(1)|  addr(var)     |           payload (rest)            |
//! +--------+----------------+-------------------------------------+
//! ```
//!
//! `atyp=1` is 4 raw IPv4 octets, `atyp=2` a length-prefixed UTF-8 domain,
//! `atyp=3` is 16 raw IPv6 bytes. The options region is skipped without
//! interpretation. Everything after the address is the first slice of
//! upstream payload and is forwarded verbatim, never re-parsed.

use std::fmt;
use std::net::Ipv4Addr;

use thiserror::Error;
use uuid::Uuid;

/// Minimum byte length of the fixed header fields
pub const MIN_HEADER_LEN: usize = 24;

/// Header parse errors; all of these are fatal to the session
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("header too short: {0} bytes")]
    TooShort(usize),

    #[error("unauthorized user id")]
    Unauthorized,

    #[error("unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type: {0}")]
    UnsupportedAddressType(u8),
}

/// Declared session command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Byte-oriented outbound connection (TCP)
    Stream = 0x01,
    /// Discrete message relay (UDP); restricted to DNS upstream
    Datagram = 0x02,
}

impl TryFrom<u8> for Command {
    type Error = HeaderError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Stream),
            0x02 => Ok(Command::Datagram),
            _ => Err(HeaderError::UnsupportedCommand(value)),
        }
    }
}

/// Target address in one of the three wire encodings
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    /// IPv4, rendered dotted-decimal
    Ipv4(Ipv4Addr),
    /// Domain name, forwarded as received
    Domain(String),
    /// IPv6 as eight big-endian 16-bit groups
    Ipv6([u16; 8]),
}

impl TargetAddr {
    /// Hostname string used for dialing.
    ///
    /// IPv6 groups are written as lowercase hex with leading zeros dropped
    /// and joined by `:` with no `::` run compression, e.g.
    /// `2001:db8:0:0:0:0:0:1`.
    pub fn host(&self) -> String {
        match self {
            TargetAddr::Ipv4(ip) => ip.to_string(),
            TargetAddr::Domain(name) => name.clone(),
            TargetAddr::Ipv6(groups) => {
                let parts: Vec<String> = groups.iter().map(|g| format!("{:x}", g)).collect();
                parts.join(":")
            }
        }
    }

    /// True if this is a name that still needs resolution
    pub fn is_domain(&self) -> bool {
        matches!(self, TargetAddr::Domain(_))
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.host())
    }
}

/// A successfully parsed handshake header.
///
/// Only constructible through [`ProtocolHeader::parse`]; never partially
/// populated.
#[derive(Debug, Clone)]
pub struct ProtocolHeader {
    /// Protocol version byte, echoed in the response prefix
    pub version: u8,
    /// Declared command
    pub command: Command,
    /// Target address
    pub target: TargetAddr,
    /// Target port
    pub port: u16,
    /// Offset into the original buffer where upstream payload begins
    pub payload_offset: usize,
}

impl ProtocolHeader {
    /// Parse a handshake header and authenticate it against `expected_user`.
    pub fn parse(buf: &[u8], expected_user: &Uuid) -> Result<Self, HeaderError> {
        if buf.len() < MIN_HEADER_LEN {
            return Err(HeaderError::TooShort(buf.len()));
        }

        let version = buf[0];

        let mut id = [0u8; 16];
        id.copy_from_slice(&buf[1..17]);
        if Uuid::from_bytes(id) != *expected_user {
            return Err(HeaderError::Unauthorized);
        }

        // Options region is skipped, not interpreted
        let options_len = buf[17] as usize;

        let cmd_index = 18 + options_len;
        let command =
            Command::try_from(*buf.get(cmd_index).ok_or(HeaderError::TooShort(buf.len()))?)?;

        let port_index = cmd_index + 1;
        let port_bytes = buf
            .get(port_index..port_index + 2)
            .ok_or(HeaderError::TooShort(buf.len()))?;
        let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);

        let atyp_index = port_index + 2;
        let atyp = *buf.get(atyp_index).ok_or(HeaderError::TooShort(buf.len()))?;
        let addr_index = atyp_index + 1;

        let (target, payload_offset) = match atyp {
            0x01 => {
                let octets = buf
                    .get(addr_index..addr_index + 4)
                    .ok_or(HeaderError::TooShort(buf.len()))?;
                let ip = Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]);
                (TargetAddr::Ipv4(ip), addr_index + 4)
            }
            0x02 => {
                let len = *buf.get(addr_index).ok_or(HeaderError::TooShort(buf.len()))? as usize;
                let name_start = addr_index + 1;
                let name = buf
                    .get(name_start..name_start + len)
                    .ok_or(HeaderError::TooShort(buf.len()))?;
                let domain = String::from_utf8_lossy(name).to_string();
                (TargetAddr::Domain(domain), name_start + len)
            }
            0x03 => {
                let raw = buf
                    .get(addr_index..addr_index + 16)
                    .ok_or(HeaderError::TooShort(buf.len()))?;
                let mut groups = [0u16; 8];
                for (i, pair) in raw.chunks_exact(2).enumerate() {
                    groups[i] = u16::from_be_bytes([pair[0], pair[1]]);
                }
                (TargetAddr::Ipv6(groups), addr_index + 16)
            }
            other => return Err(HeaderError::UnsupportedAddressType(other)),
        };

        Ok(Self {
            version,
            command,
            target,
            port,
            payload_offset,
        })
    }

    /// The 2-byte acceptance marker: the client's version byte followed by
    /// a zero. Prepended exactly once to the first outbound-to-client chunk.
    pub fn response_prefix(&self) -> [u8; 2] {
        [self.version, 0x00]
    }
}
