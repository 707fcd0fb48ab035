//! NAT64 fallback coordination
//!
//! When a direct TCP egress connects but closes without delivering a single
//! byte, the session is re-routed once through a translating IPv6 path: the
//! target is resolved to an IPv4 address over DNS-over-HTTPS, the four
//! octets are hex-embedded into the low 32 bits of a configured NAT64
//! prefix, and the synthesized literal is dialed on the original port. A
//! fallback attempt that itself yields nothing closes the session; there is
//! no second retry.

use std::net::Ipv4Addr;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::dns::{DnsError, DnsTransport};
use crate::protocol::TargetAddr;

/// Fallback errors; fatal to the session
#[derive(Debug, Error)]
pub enum FallbackError {
    #[error("resolution failed: {0}")]
    Resolution(#[from] DnsError),

    #[error("invalid NAT64 prefix: {0}")]
    InvalidPrefix(String),

    #[error("no NAT64 prefix configured")]
    NoPrefix,
}

/// A NAT64 translation prefix such as `2602:fc59:b0:64::`.
///
/// The low 32 bits must be free for the embedded IPv4 address, so the
/// textual form is required to end in `::`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nat64Prefix(String);

impl Nat64Prefix {
    pub fn parse(text: &str) -> Result<Self, FallbackError> {
        if !text.ends_with("::") || text.len() <= 2 {
            return Err(FallbackError::InvalidPrefix(text.to_string()));
        }
        Ok(Self(text.to_string()))
    }

    /// Embed an IPv4 address into the prefix, producing a bracketed IPv6
    /// literal ready for dialing, e.g. `[2602:fc59:b0:64::5db8:d822]`.
    pub fn synthesize(&self, addr: Ipv4Addr) -> String {
        let o = addr.octets();
        format!(
            "[{}{:02x}{:02x}:{:02x}{:02x}]",
            self.0, o[0], o[1], o[2], o[3]
        )
    }
}

/// Resolves the alternate egress address for a single-shot retry
pub struct FallbackCoordinator {
    resolver: Arc<dyn DnsTransport>,
    prefixes: Vec<Nat64Prefix>,
}

impl FallbackCoordinator {
    pub fn new(resolver: Arc<dyn DnsTransport>, prefixes: Vec<Nat64Prefix>) -> Self {
        Self { resolver, prefixes }
    }

    /// Resolve the original target to a synthesized IPv6 literal.
    ///
    /// Domains go through an A-record lookup; an IPv4 literal target embeds
    /// directly. The prefix list currently holds a single configured entry,
    /// so selection is the first element.
    pub async fn resolve_alternate(&self, target: &TargetAddr) -> Result<String, FallbackError> {
        let prefix = self.prefixes.first().ok_or(FallbackError::NoPrefix)?;

        let ipv4 = match target {
            TargetAddr::Ipv4(ip) => *ip,
            other => {
                let name = other.host();
                debug!("resolving {} for NAT64 fallback", name);
                self.resolver.resolve_a(&name).await?
            }
        };

        let literal = prefix.synthesize(ipv4);
        info!("synthesized NAT64 address {} for {}", literal, target);
        Ok(literal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;

    struct FixedResolver(Ipv4Addr);

    #[async_trait]
    impl DnsTransport for FixedResolver {
        async fn resolve_a(&self, _name: &str) -> Result<Ipv4Addr, DnsError> {
            Ok(self.0)
        }

        async fn query_message(&self, _message: &[u8]) -> Result<Bytes, DnsError> {
            Err(DnsError::BadResponse("not used".to_string()))
        }
    }

    #[test]
    fn test_prefix_parse() {
        assert!(Nat64Prefix::parse("2602:fc59:b0:64::").is_ok());
        assert!(Nat64Prefix::parse("2602:fc59:b0:64").is_err());
        assert!(Nat64Prefix::parse("::").is_err());
    }

    #[test]
    fn test_synthesize_embeds_octets() {
        let prefix = Nat64Prefix::parse("2602:fc59:b0:64::").unwrap();
        let literal = prefix.synthesize(Ipv4Addr::new(93, 184, 216, 34));
        assert_eq!(literal, "[2602:fc59:b0:64::5db8:d822]");
    }

    #[test]
    fn test_synthesize_zero_padding() {
        let prefix = Nat64Prefix::parse("64:ff9b::").unwrap();
        let literal = prefix.synthesize(Ipv4Addr::new(1, 2, 3, 4));
        assert_eq!(literal, "[64:ff9b::0102:0304]");
    }

    #[tokio::test]
    async fn test_resolve_alternate_domain() {
        let coordinator = FallbackCoordinator::new(
            Arc::new(FixedResolver(Ipv4Addr::new(93, 184, 216, 34))),
            vec![Nat64Prefix::parse("2602:fc59:b0:64::").unwrap()],
        );

        let target = TargetAddr::Domain("example.com".to_string());
        let literal = coordinator.resolve_alternate(&target).await.unwrap();
        assert_eq!(literal, "[2602:fc59:b0:64::5db8:d822]");
    }

    #[tokio::test]
    async fn test_resolve_alternate_ipv4_literal_skips_lookup() {
        struct FailingResolver;

        #[async_trait]
        impl DnsTransport for FailingResolver {
            async fn resolve_a(&self, name: &str) -> Result<Ipv4Addr, DnsError> {
                Err(DnsError::NoAnswer(name.to_string()))
            }

            async fn query_message(&self, _message: &[u8]) -> Result<Bytes, DnsError> {
                Err(DnsError::BadResponse("not used".to_string()))
            }
        }

        let coordinator = FallbackCoordinator::new(
            Arc::new(FailingResolver),
            vec![Nat64Prefix::parse("2602:fc59:b0:64::").unwrap()],
        );

        let target = TargetAddr::Ipv4(Ipv4Addr::new(1, 1, 1, 1));
        let literal = coordinator.resolve_alternate(&target).await.unwrap();
        assert_eq!(literal, "[2602:fc59:b0:64::0101:0101]");
    }

    #[tokio::test]
    async fn test_no_prefix_configured() {
        let coordinator = FallbackCoordinator::new(
            Arc::new(FixedResolver(Ipv4Addr::new(1, 1, 1, 1))),
            Vec::new(),
        );
        let target = TargetAddr::Domain("example.com".to_string());
        assert!(matches!(
            coordinator.resolve_alternate(&target).await,
            Err(FallbackError::NoPrefix)
        ));
    }
}
