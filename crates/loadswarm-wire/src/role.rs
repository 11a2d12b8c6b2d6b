//! Connection roles and peer addressing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// The role a remote process declares when it connects to the console.
///
/// The role is fixed for the lifetime of the connection: it decides
/// which receiver pool drains the connection and whether the fan-out
/// sender may write to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionRole {
    /// A test-execution node; owns zero or more workers.
    Agent,
    /// An operator-facing peer (UI/CLI) for control and status.
    ConsoleClient,
    /// A process spawned by an agent that executes script iterations.
    Worker,
}

impl ConnectionRole {
    /// All roles the console accepts, in drain order.
    pub const ALL: [ConnectionRole; 3] = [
        ConnectionRole::Agent,
        ConnectionRole::ConsoleClient,
        ConnectionRole::Worker,
    ];
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionRole::Agent => write!(f, "agent"),
            ConnectionRole::ConsoleClient => write!(f, "console-client"),
            ConnectionRole::Worker => write!(f, "worker"),
        }
    }
}

/// Identity of one remote endpoint.
///
/// Two addresses are equal iff they denote the same network endpoint.
/// Used as the routing key for addressed sends and resolver lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress(SocketAddr);

impl PeerAddress {
    /// Wrap a socket address.
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    /// The underlying socket address.
    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_address_equality_by_endpoint() {
        let a = PeerAddress::new("127.0.0.1:9000".parse().unwrap());
        let b = PeerAddress::from("127.0.0.1:9000".parse::<SocketAddr>().unwrap());
        let c = PeerAddress::new("127.0.0.1:9001".parse().unwrap());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_role_serde_tags() {
        let json = serde_json::to_string(&ConnectionRole::ConsoleClient).unwrap();
        assert_eq!(json, "\"console_client\"");
        let role: ConnectionRole = serde_json::from_str("\"agent\"").unwrap();
        assert_eq!(role, ConnectionRole::Agent);
    }
}
