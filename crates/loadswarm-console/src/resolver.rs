//! AddressResolver — the local endpoint a peer should use to reach the
//! console back.
//!
//! The console may be multi-homed; an agent that connected over one
//! interface must be told that interface's address when it needs a
//! connect-back channel, not whatever the listener happens to report.

use crate::acceptor::Acceptor;
use dashmap::DashMap;
use loadswarm_wire::PeerAddress;
use std::net::SocketAddr;
use std::sync::Arc;

/// Lookup table from peer to the advertised local address.
pub struct AddressResolver {
    bound_addr: SocketAddr,
    routes: Arc<DashMap<PeerAddress, SocketAddr>>,
}

impl AddressResolver {
    /// Register the live acceptor. Valid until the next rebuild replaces
    /// this resolver; lookups always answer for the last registration.
    pub fn register(acceptor: &Acceptor) -> Self {
        Self {
            bound_addr: acceptor.local_addr(),
            routes: acceptor.routes(),
        }
    }

    /// The local address `peer` connected to, falling back to the bound
    /// address for peers that have not connected yet.
    pub fn resolve_local_address(&self, peer: &PeerAddress) -> String {
        self.routes
            .get(peer)
            .map(|entry| entry.value().to_string())
            .unwrap_or_else(|| self.bound_addr.to_string())
    }
}
