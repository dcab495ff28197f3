//! Network transport seen by the SA core
//!
//! Phase 1 SAs keep a shared reference to the transport their negotiation
//! runs over. The core only needs the peer address (for peer lookups) and
//! a printable form for diagnostics; sending is the transport layer's
//! business.

use std::fmt;
use std::net::SocketAddr;

/// Transport an ISAKMP SA is bound to
pub trait Transport: Send + Sync + fmt::Debug {
    /// Remote address of the peer
    fn peer_addr(&self) -> SocketAddr;

    /// Local address, when known
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Printable description for logs and reports
    fn decode_ids(&self) -> String {
        match self.local_addr() {
            Some(local) => format!("src: {} dst: {}", local, self.peer_addr()),
            None => format!("dst: {}", self.peer_addr()),
        }
    }
}

/// UDP transport endpoint pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpTransport {
    local: SocketAddr,
    peer: SocketAddr,
}

impl UdpTransport {
    /// Create transport between `local` and `peer`
    pub fn new(local: SocketAddr, peer: SocketAddr) -> Self {
        UdpTransport { local, peer }
    }
}

impl Transport for UdpTransport {
    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local)
    }
}
