//! Multiaddress-style peer addresses.
//!
//! Location hints arrive as strings such as:
//!
//! ```text
//! /ip4/10.0.0.5/tcp/4001/p2p/<peer>                          direct TCP
//! /ip4/10.0.0.5/udp/4001/quic-v1/p2p/<peer>                  direct QUIC
//! /dns4/relay.example/tcp/443/wss/p2p/<relay>/p2p-circuit/p2p/<peer>   relayed
//! /memory/<name>/p2p/<peer>                                  in-process (tests)
//! ```
//!
//! Classification is by substring match, relay first since relayed
//! addresses also contain the relay's own transport.

use serde::{Deserialize, Serialize};

/// Which kind of dialer an address must be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Routed through a relay (`/p2p-circuit`).
    Relay,
    /// Direct QUIC (`/quic-v1`).
    Quic,
    /// Direct TCP (`/tcp/<port>`).
    Tcp,
    /// In-process memory network (`/memory/<name>`).
    Memory,
}

impl TransportKind {
    /// Classify an address string.
    ///
    /// Returns `None` for strings matching no known transport.
    pub fn classify(addr: &str) -> Option<Self> {
        if addr.contains("/p2p-circuit") {
            Some(Self::Relay)
        } else if addr.contains("/quic-v1") {
            Some(Self::Quic)
        } else if addr.contains("/tcp/") {
            Some(Self::Tcp)
        } else if addr.starts_with("/memory/") {
            Some(Self::Memory)
        } else {
            None
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Relay => "relay",
            Self::Quic => "quic",
            Self::Tcp => "tcp",
            Self::Memory => "memory",
        };
        f.write_str(name)
    }
}

/// A classified dialable address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    kind: TransportKind,
    addr: String,
}

impl PeerAddress {
    /// Classify and wrap an address string.
    ///
    /// Returns `None` when the transport cannot be determined.
    ///
    /// # Examples
    ///
    /// ```
    /// use ocap_core::{PeerAddress, TransportKind};
    ///
    /// let addr = PeerAddress::parse("/ip4/127.0.0.1/tcp/4001").expect("tcp");
    /// assert_eq!(addr.kind(), TransportKind::Tcp);
    /// assert!(PeerAddress::parse("127.0.0.1:4001").is_none());
    /// ```
    pub fn parse(addr: &str) -> Option<Self> {
        TransportKind::classify(addr).map(|kind| Self {
            kind,
            addr: addr.to_string(),
        })
    }

    /// Transport kind of this address.
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Full address string, including any `/p2p/<peer>` suffix.
    pub fn as_str(&self) -> &str {
        &self.addr
    }

    /// Address with a trailing `/p2p/<peer>` component removed.
    ///
    /// Relay addresses keep everything up to the last `/p2p/`, so the
    /// circuit through the relay is preserved.
    pub fn transport_part(&self) -> &str {
        match self.addr.rfind("/p2p/") {
            Some(idx) if !self.addr[idx + 5..].contains('/') => &self.addr[..idx],
            _ => &self.addr,
        }
    }

    /// Peer id named by the trailing `/p2p/<peer>` component, if present.
    pub fn peer_suffix(&self) -> Option<&str> {
        let idx = self.addr.rfind("/p2p/")?;
        let tail = &self.addr[idx + 5..];
        (!tail.is_empty() && !tail.contains('/')).then_some(tail)
    }

    /// `host:port` for a TCP multiaddress (`/ip4|ip6|dns|dns4|dns6/<host>/tcp/<port>`).
    pub fn tcp_socket_addr(&self) -> Option<String> {
        let mut parts = self.transport_part().split('/').filter(|p| !p.is_empty());
        let proto = parts.next()?;
        let host = parts.next()?;
        if parts.next()? != "tcp" {
            return None;
        }
        let port: u16 = parts.next()?.parse().ok()?;
        match proto {
            "ip6" => Some(format!("[{}]:{}", host, port)),
            "ip4" | "dns" | "dns4" | "dns6" => Some(format!("{}:{}", host, port)),
            _ => None,
        }
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: &str = "4f2a";

    #[test]
    fn test_classify_by_substring() {
        assert_eq!(
            TransportKind::classify("/ip4/1.2.3.4/tcp/4001"),
            Some(TransportKind::Tcp)
        );
        assert_eq!(
            TransportKind::classify("/ip4/1.2.3.4/udp/4001/quic-v1"),
            Some(TransportKind::Quic)
        );
        assert_eq!(
            TransportKind::classify("/dns4/relay/tcp/443/wss/p2p/r1/p2p-circuit/p2p/x"),
            Some(TransportKind::Relay)
        );
        assert_eq!(
            TransportKind::classify("/memory/alice"),
            Some(TransportKind::Memory)
        );
        assert_eq!(TransportKind::classify("http://example.com"), None);
    }

    #[test]
    fn test_transport_part_strips_peer_suffix() {
        let addr = PeerAddress::parse(&format!("/memory/alice/p2p/{PEER}")).expect("parse");
        assert_eq!(addr.transport_part(), "/memory/alice");
        assert_eq!(addr.peer_suffix(), Some(PEER));

        let bare = PeerAddress::parse("/memory/alice").expect("parse");
        assert_eq!(bare.transport_part(), "/memory/alice");
        assert_eq!(bare.peer_suffix(), None);
    }

    #[test]
    fn test_relay_keeps_circuit() {
        let addr = PeerAddress::parse("/ip4/9.9.9.9/tcp/9001/ws/p2p/relay/p2p-circuit/p2p/target")
            .expect("parse");
        assert_eq!(addr.kind(), TransportKind::Relay);
        assert_eq!(
            addr.transport_part(),
            "/ip4/9.9.9.9/tcp/9001/ws/p2p/relay/p2p-circuit"
        );
        assert_eq!(addr.peer_suffix(), Some("target"));
    }

    #[test]
    fn test_tcp_socket_addr() {
        let v4 = PeerAddress::parse(&format!("/ip4/127.0.0.1/tcp/4001/p2p/{PEER}")).expect("v4");
        assert_eq!(v4.tcp_socket_addr().as_deref(), Some("127.0.0.1:4001"));

        let v6 = PeerAddress::parse("/ip6/::1/tcp/4002").expect("v6");
        assert_eq!(v6.tcp_socket_addr().as_deref(), Some("[::1]:4002"));

        let dns = PeerAddress::parse("/dns4/kernel.local/tcp/80").expect("dns");
        assert_eq!(dns.tcp_socket_addr().as_deref(), Some("kernel.local:80"));

        let bad_port = PeerAddress::parse("/ip4/127.0.0.1/tcp/notaport").expect("parse");
        assert_eq!(bad_port.tcp_socket_addr(), None);
    }
}
