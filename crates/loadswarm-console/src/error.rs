//! Console communication error types.

use loadswarm_wire::{FrameError, MessageKind, PeerAddress};
use thiserror::Error;

/// Errors from the console communication subsystem.
#[derive(Debug, Error)]
pub enum CommsError {
    /// The listening endpoint could not be opened. Reported to the
    /// operator; an in-progress rebuild stops.
    #[error("failed to bind console endpoint {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Transient per-connection accept failure; the accept loop keeps
    /// running and the failure is surfaced via the pending-error stream.
    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),

    /// A connecting peer never produced a valid role declaration.
    #[error("handshake with {peer} failed: {reason}")]
    Handshake { peer: PeerAddress, reason: String },

    /// An outbound write to one peer failed. Never aborts delivery to
    /// other peers.
    #[error("send to {peer} failed: {source}")]
    Send {
        peer: PeerAddress,
        #[source]
        source: std::io::Error,
    },

    /// Addressed send to a peer the sender does not track.
    #[error("unknown peer: {0}")]
    UnknownPeer(PeerAddress),

    /// Send attempted after the sender was shut down.
    #[error("sender is shut down")]
    SenderClosed,

    /// The acceptor's accept loop could not be stopped cleanly.
    #[error("acceptor shutdown failed: {0}")]
    Shutdown(String),

    /// A registered message handler rejected a message.
    #[error("handler for {kind} message failed: {reason}")]
    Handler { kind: MessageKind, reason: String },

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Alias for console communication results.
pub type CommsResult<T> = Result<T, CommsError>;
