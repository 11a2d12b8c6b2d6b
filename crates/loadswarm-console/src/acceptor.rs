//! Acceptor — binds the console endpoint and classifies inbound connections.
//!
//! Every connecting process must send a role declaration as its first
//! frame. The read half of a classified connection is queued for the
//! receiver; the write half of an agent connection is queued for the
//! fan-out sender. Accept and classification problems are never thrown
//! across task boundaries: they land on a pending-error stream that the
//! lifecycle controller's problem observer drains.

use crate::error::{CommsError, CommsResult};
use dashmap::DashMap;
use loadswarm_wire::{
    ConnectionRole, PeerAddress, WireMessage, WirePayload, MAX_FRAME_SIZE, PROTOCOL_VERSION,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a connecting process has to declare its role.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Decrements the live-connection count when the owning connection drops.
#[derive(Debug)]
pub struct ConnectionGuard {
    count: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    fn new(count: Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self { count }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A classified inbound connection, handed to the receiver.
#[derive(Debug)]
pub struct InboundConnection {
    pub peer: PeerAddress,
    pub reader: OwnedReadHalf,
    pub guard: ConnectionGuard,
}

/// The writable half of an agent connection, handed to the fan-out sender.
#[derive(Debug)]
pub struct AgentLink {
    pub peer: PeerAddress,
    pub writer: OwnedWriteHalf,
}

/// The console's listening endpoint.
pub struct Acceptor {
    local_addr: SocketAddr,
    conn_count: Arc<AtomicUsize>,
    /// Which local address each peer connected to (multi-homed hosts).
    routes: Arc<DashMap<PeerAddress, SocketAddr>>,
    inbound: std::sync::Mutex<HashMap<ConnectionRole, mpsc::UnboundedReceiver<InboundConnection>>>,
    agent_links: std::sync::Mutex<Option<mpsc::UnboundedReceiver<AgentLink>>>,
    errors: AsyncMutex<mpsc::UnboundedReceiver<CommsError>>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Acceptor {
    /// Open the listening endpoint and start the accept loop.
    ///
    /// An empty host binds all interfaces. Failures (address in use,
    /// permission denied, unresolvable host) surface as
    /// [`CommsError::Bind`].
    pub async fn bind(host: &str, port: u16, backlog: u32) -> CommsResult<Self> {
        let addr_str = if host.is_empty() {
            format!("0.0.0.0:{port}")
        } else {
            format!("{host}:{port}")
        };
        let bind_err = |source: std::io::Error| CommsError::Bind {
            addr: addr_str.clone(),
            source,
        };

        let addr = tokio::net::lookup_host(&addr_str)
            .await
            .map_err(bind_err)?
            .next()
            .ok_or_else(|| {
                bind_err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "host resolved to no addresses",
                ))
            })?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;
        let listener = socket.listen(backlog).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        info!(addr = %local_addr, "console acceptor listening");

        let conn_count = Arc::new(AtomicUsize::new(0));
        let routes = Arc::new(DashMap::new());
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let (links_tx, links_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut inbound_txs = HashMap::new();
        let mut inbound_rxs = HashMap::new();
        for role in ConnectionRole::ALL {
            let (tx, rx) = mpsc::unbounded_channel();
            inbound_txs.insert(role, tx);
            inbound_rxs.insert(role, rx);
        }

        let loop_state = AcceptLoop {
            inbound_txs,
            links_tx,
            errors_tx,
            conn_count: Arc::clone(&conn_count),
            routes: Arc::clone(&routes),
        };
        let accept_task = tokio::spawn(loop_state.run(listener, shutdown_rx));

        Ok(Self {
            local_addr,
            conn_count,
            routes,
            inbound: std::sync::Mutex::new(inbound_rxs),
            agent_links: std::sync::Mutex::new(Some(links_rx)),
            errors: AsyncMutex::new(errors_rx),
            shutdown_tx,
            accept_task: std::sync::Mutex::new(Some(accept_task)),
        })
    }

    /// The actual bound address (useful when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of classified connections that are still alive.
    pub fn number_of_connections(&self) -> usize {
        self.conn_count.load(Ordering::SeqCst)
    }

    /// Take the inbound-connection stream for one role. Each role's
    /// stream can be taken once, by the receiver that will drain it.
    pub fn take_inbound(
        &self,
        role: ConnectionRole,
    ) -> Option<mpsc::UnboundedReceiver<InboundConnection>> {
        self.inbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&role)
    }

    /// Take the agent write-half stream, consumed once by the sender.
    pub fn take_agent_links(&self) -> Option<mpsc::UnboundedReceiver<AgentLink>> {
        self.agent_links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Wait for the next queued accept problem. Returns `None` once the
    /// acceptor has been shut down and no problems remain.
    pub async fn pending_error(&self) -> Option<CommsError> {
        self.errors.lock().await.recv().await
    }

    /// The per-peer local-address table, shared with the resolver.
    pub(crate) fn routes(&self) -> Arc<DashMap<PeerAddress, SocketAddr>> {
        Arc::clone(&self.routes)
    }

    /// Stop accepting and close the listening endpoint. Idempotent;
    /// unblocks the accept loop and, once in-flight classifications
    /// finish, the pending-error stream.
    pub async fn shutdown(&self) -> CommsResult<()> {
        if self.shutdown_tx.send_replace(true) {
            return Ok(());
        }
        let task = self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.await
                .map_err(|e| CommsError::Shutdown(e.to_string()))?;
        }
        debug!(addr = %self.local_addr, "console acceptor shut down");
        Ok(())
    }
}

/// Shared state cloned into each classification task.
struct AcceptLoop {
    inbound_txs: HashMap<ConnectionRole, mpsc::UnboundedSender<InboundConnection>>,
    links_tx: mpsc::UnboundedSender<AgentLink>,
    errors_tx: mpsc::UnboundedSender<CommsError>,
    conn_count: Arc<AtomicUsize>,
    routes: Arc<DashMap<PeerAddress, SocketAddr>>,
}

impl AcceptLoop {
    async fn run(self, listener: TcpListener, mut shutdown_rx: watch::Receiver<bool>) {
        let state = Arc::new(self);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(peer = %addr, "accepted connection");
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            state.classify(stream, addr).await;
                        });
                    }
                    Err(e) => {
                        let _ = state.errors_tx.send(CommsError::Accept(e));
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
            }
        }
        debug!("accept loop stopped");
        // The listener and the error/link senders drop here, which
        // closes the pending-error stream for the problem observer.
    }

    /// Read the role declaration and route the connection halves.
    async fn classify(&self, mut stream: TcpStream, addr: SocketAddr) {
        let peer = PeerAddress::from(addr);
        let local = stream.local_addr().ok();

        let declaration =
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_handshake(&mut stream)).await {
                Ok(Ok(message)) => message,
                Ok(Err(e)) => {
                    let _ = self.errors_tx.send(e);
                    return;
                }
                Err(_) => {
                    let _ = self.errors_tx.send(CommsError::Handshake {
                        peer,
                        reason: "no role declaration within handshake timeout".to_string(),
                    });
                    return;
                }
            };

        let role = match declaration.payload {
            WirePayload::RoleDeclaration {
                role,
                protocol_version,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    let _ = self.errors_tx.send(CommsError::Handshake {
                        peer,
                        reason: format!(
                            "protocol version mismatch: local={PROTOCOL_VERSION}, \
                             remote={protocol_version}"
                        ),
                    });
                    return;
                }
                role
            }
            other => {
                warn!(peer = %peer, "rejected connection without role declaration");
                let _ = self.errors_tx.send(CommsError::Handshake {
                    peer,
                    reason: format!("expected role declaration, got {}", other.kind()),
                });
                return;
            }
        };

        debug!(peer = %peer, role = %role, "connection classified");
        if let Some(local) = local {
            self.routes.insert(peer, local);
        }

        let (reader, writer) = stream.into_split();
        let guard = ConnectionGuard::new(Arc::clone(&self.conn_count));

        if role == ConnectionRole::Agent {
            let _ = self.links_tx.send(AgentLink { peer, writer });
        }
        // A dropped send means the owning pool is gone; the guard then
        // releases the connection count on its way out.
        if let Some(tx) = self.inbound_txs.get(&role) {
            let _ = tx.send(InboundConnection {
                peer,
                reader,
                guard,
            });
        }
    }
}

/// Read exactly one frame from an unsplit stream.
async fn read_handshake(stream: &mut TcpStream) -> CommsResult<WireMessage> {
    let peer = PeerAddress::from(stream.peer_addr()?);
    let mut header = [0u8; 4];
    match stream.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(CommsError::Handshake {
                peer,
                reason: "connection closed before role declaration".to_string(),
            });
        }
        Err(e) => return Err(CommsError::Io(e)),
    }

    let len = u32::from_be_bytes(header);
    if len > MAX_FRAME_SIZE {
        return Err(CommsError::Handshake {
            peer,
            reason: format!("declaration frame of {len} bytes exceeds limit"),
        });
    }

    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    serde_json::from_slice(&body).map_err(|e| CommsError::Handshake {
        peer,
        reason: format!("undecodable declaration: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadswarm_wire::encode_frame;
    use tokio::io::AsyncWriteExt;

    async fn connect_with_role(addr: SocketAddr, role: ConnectionRole) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let declaration = WireMessage::new(WirePayload::RoleDeclaration {
            role,
            protocol_version: PROTOCOL_VERSION,
        });
        stream
            .write_all(&encode_frame(&declaration).unwrap())
            .await
            .unwrap();
        stream
    }

    #[tokio::test]
    async fn test_bind_and_classify_agent() {
        let acceptor = Acceptor::bind("127.0.0.1", 0, 16).await.unwrap();
        let mut inbound = acceptor.take_inbound(ConnectionRole::Agent).unwrap();
        let mut links = acceptor.take_agent_links().unwrap();

        let _client = connect_with_role(acceptor.local_addr(), ConnectionRole::Agent).await;

        let conn = inbound.recv().await.unwrap();
        let link = links.recv().await.unwrap();
        assert_eq!(conn.peer, link.peer);
        assert_eq!(acceptor.number_of_connections(), 1);

        drop(conn);
        assert_eq!(acceptor.number_of_connections(), 0);
        acceptor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_non_agent_gets_no_link() {
        let acceptor = Acceptor::bind("127.0.0.1", 0, 16).await.unwrap();
        let mut inbound = acceptor.take_inbound(ConnectionRole::Worker).unwrap();
        let mut links = acceptor.take_agent_links().unwrap();

        let _client = connect_with_role(acceptor.local_addr(), ConnectionRole::Worker).await;

        let conn = inbound.recv().await.unwrap();
        assert_eq!(conn.peer.socket_addr().ip().to_string(), "127.0.0.1");
        assert!(links.try_recv().is_err());
        acceptor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_handshake_queues_error() {
        let acceptor = Acceptor::bind("127.0.0.1", 0, 16).await.unwrap();

        // Send a valid frame that is not a role declaration.
        let mut stream = TcpStream::connect(acceptor.local_addr()).await.unwrap();
        let message = WireMessage::new(WirePayload::StopWorkers);
        stream
            .write_all(&encode_frame(&message).unwrap())
            .await
            .unwrap();

        match acceptor.pending_error().await {
            Some(CommsError::Handshake { .. }) => {}
            other => panic!("Expected Handshake error, got {other:?}"),
        }
        assert_eq!(acceptor.number_of_connections(), 0);
        acceptor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_error_on_occupied_port() {
        let first = Acceptor::bind("127.0.0.1", 0, 16).await.unwrap();
        let port = first.local_addr().port();

        match Acceptor::bind("127.0.0.1", port, 16).await {
            Err(CommsError::Bind { addr, .. }) => {
                assert!(addr.contains(&port.to_string()));
            }
            other => panic!("Expected Bind error, got {:?}", other.map(|a| a.local_addr())),
        }
        first.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_idempotent_and_unblocks_error_stream() {
        let acceptor = Acceptor::bind("127.0.0.1", 0, 16).await.unwrap();
        let addr = acceptor.local_addr();

        acceptor.shutdown().await.unwrap();
        acceptor.shutdown().await.unwrap();

        // Error stream yields None once the loop is gone.
        assert!(acceptor.pending_error().await.is_none());
        // The listening endpoint is closed.
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
