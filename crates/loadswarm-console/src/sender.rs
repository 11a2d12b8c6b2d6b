//! FanOutSender — outbound delivery to connected agents.
//!
//! The sender tracks one writable channel per agent connection. A
//! broadcast attempts delivery to every tracked peer with bounded
//! concurrency; a failure on one peer is reported to the error handler
//! and never aborts delivery to the rest. Addressed sends fail fast on
//! unknown peers.

use crate::acceptor::{Acceptor, AgentLink};
use crate::error::{CommsError, CommsResult};
use crate::handler::ErrorHandler;
use dashmap::DashMap;
use futures::StreamExt;
use loadswarm_wire::{encode_frame, PeerAddress, WireMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// One tracked agent connection.
struct AgentPeer {
    writer: AsyncMutex<OwnedWriteHalf>,
}

/// Fans messages out to every connected agent.
pub struct FanOutSender {
    peers: Arc<DashMap<PeerAddress, Arc<AgentPeer>>>,
    fanout_workers: usize,
    closed: Arc<AtomicBool>,
    error_handler: Arc<dyn ErrorHandler>,
    ingest_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl FanOutSender {
    /// Start the sender over the acceptor's agent links.
    ///
    /// Panics if another sender already took the link stream — a
    /// construction-time programming error.
    pub fn start(
        acceptor: &Acceptor,
        fanout_workers: usize,
        error_handler: Arc<dyn ErrorHandler>,
    ) -> Self {
        assert!(fanout_workers > 0, "sender needs at least one fan-out slot");
        let mut links = acceptor
            .take_agent_links()
            .expect("agent link stream already taken");

        let peers: Arc<DashMap<PeerAddress, Arc<AgentPeer>>> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        let ingest_task = tokio::spawn({
            let peers = Arc::clone(&peers);
            let closed = Arc::clone(&closed);
            async move {
                while let Some(link) = links.recv().await {
                    if closed.load(Ordering::SeqCst) {
                        break;
                    }
                    debug!(peer = %link.peer, "agent registered for fan-out");
                    peers.insert(
                        link.peer,
                        Arc::new(AgentPeer {
                            writer: AsyncMutex::new(link.writer),
                        }),
                    );
                }
            }
        });

        Self {
            peers,
            fanout_workers,
            closed,
            error_handler,
            ingest_task: std::sync::Mutex::new(Some(ingest_task)),
        }
    }

    /// Track an agent connection explicitly (tests and reconnects).
    pub fn register_peer(&self, link: AgentLink) {
        self.peers.insert(
            link.peer,
            Arc::new(AgentPeer {
                writer: AsyncMutex::new(link.writer),
            }),
        );
    }

    /// Stop tracking a peer, closing its outbound channel. Returns
    /// whether the peer was tracked.
    pub fn unregister_peer(&self, peer: &PeerAddress) -> bool {
        self.peers.remove(peer).is_some()
    }

    /// Number of currently sendable agents.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Deliver to every tracked agent. Per-peer failures go to the
    /// error handler; the broken peer is dropped and the remaining
    /// deliveries proceed. Never fails the caller.
    pub async fn broadcast(&self, message: &WireMessage) {
        if self.closed.load(Ordering::SeqCst) {
            self.error_handler.handle_error(&CommsError::SenderClosed);
            return;
        }
        let frame = match encode_frame(message) {
            Ok(frame) => frame,
            Err(e) => {
                self.error_handler.handle_error(&CommsError::Frame(e));
                return;
            }
        };

        let targets: Vec<(PeerAddress, Arc<AgentPeer>)> = self
            .peers
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        futures::stream::iter(targets)
            .for_each_concurrent(self.fanout_workers, |(peer, target)| {
                let frame = frame.clone();
                async move {
                    if let Err(source) = write_frame(&target, &frame).await {
                        self.peers.remove(&peer);
                        self.error_handler
                            .handle_error(&CommsError::Send { peer, source });
                    }
                }
            })
            .await;
    }

    /// Deliver to exactly one tracked agent.
    pub async fn send_to(&self, peer: &PeerAddress, message: &WireMessage) -> CommsResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CommsError::SenderClosed);
        }
        let target = self
            .peers
            .get(peer)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(CommsError::UnknownPeer(*peer))?;

        let frame = encode_frame(message)?;
        write_frame(&target, &frame).await.map_err(|source| {
            self.peers.remove(peer);
            CommsError::Send {
                peer: *peer,
                source,
            }
        })
    }

    /// Close all outbound channels. Subsequent sends fail with
    /// `SenderClosed`. Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let ingest = self
            .ingest_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = ingest {
            task.abort();
        }
        self.peers.clear();
        debug!("fan-out sender shut down");
    }
}

async fn write_frame(target: &AgentPeer, frame: &[u8]) -> std::io::Result<()> {
    let mut writer = target.writer.lock().await;
    writer.write_all(frame).await?;
    writer.flush().await
}
