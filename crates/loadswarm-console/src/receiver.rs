//! ConsoleReceiver — a pool of drain workers over classified connections.
//!
//! Workers repeatedly try a non-blocking read on each pooled
//! connection, decode any complete frames, and sleep the idle poll
//! delay when nothing had data. A connection silent for longer than the
//! inactivity timeout is closed and dropped from the pool. Decoded
//! messages feed one channel; `wait_for_message` is the single blocking
//! operation the lifecycle controller exposes to callers.

use crate::acceptor::{Acceptor, ConnectionGuard, InboundConnection};
use crate::error::{CommsError, CommsResult};
use bytes::BytesMut;
use loadswarm_wire::{decode_frames, ConnectionRole, PeerAddress, ReceivedMessage};
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One connection owned by the drain pool.
struct PooledConnection {
    peer: PeerAddress,
    reader: OwnedReadHalf,
    buf: BytesMut,
    last_activity: Instant,
    _guard: ConnectionGuard,
}

/// Result of one non-blocking drain pass over a connection.
enum Drained {
    /// No new data.
    Idle,
    /// At least one complete message decoded.
    Messages(Vec<ReceivedMessage>),
    /// The peer closed the connection.
    Closed,
}

/// Drains classified connections and queues decoded messages.
pub struct ConsoleReceiver {
    message_rx: AsyncMutex<mpsc::UnboundedReceiver<ReceivedMessage>>,
    pool: Arc<Mutex<VecDeque<PooledConnection>>>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ConsoleReceiver {
    /// Spawn `workers` drain tasks over the given role set.
    ///
    /// Panics on an empty or duplicated role set, a zero worker count,
    /// or a role whose inbound stream was already taken — all
    /// construction-time programming errors.
    pub fn start(
        acceptor: &Acceptor,
        roles: &[ConnectionRole],
        workers: usize,
        idle_poll_delay: Duration,
        inactivity_timeout: Duration,
    ) -> Self {
        assert!(!roles.is_empty(), "receiver role set must not be empty");
        assert!(workers > 0, "receiver needs at least one drain worker");
        let mut seen = HashSet::new();
        for role in roles {
            assert!(seen.insert(*role), "duplicate role {role} in receiver role set");
        }

        let sources: Vec<mpsc::UnboundedReceiver<InboundConnection>> = roles
            .iter()
            .map(|role| {
                acceptor
                    .take_inbound(*role)
                    .unwrap_or_else(|| panic!("inbound stream for {role} already drained"))
            })
            .collect();
        let sources = Arc::new(Mutex::new(sources));

        let pool: Arc<Mutex<VecDeque<PooledConnection>>> = Arc::new(Mutex::new(VecDeque::new()));
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            handles.push(tokio::spawn(drain_loop(
                worker,
                Arc::clone(&pool),
                Arc::clone(&sources),
                message_tx.clone(),
                idle_poll_delay,
                inactivity_timeout,
                shutdown_tx.subscribe(),
            )));
        }

        Self {
            message_rx: AsyncMutex::new(message_rx),
            pool,
            shutdown_tx,
            workers: Mutex::new(handles),
        }
    }

    /// Block until a decoded message is available, or return `None`
    /// once the receiver has been shut down and the queue is drained.
    ///
    /// Concurrent callers each receive a distinct message; order is
    /// preserved per connection, not across connections.
    pub async fn wait_for_message(&self) -> Option<ReceivedMessage> {
        self.message_rx.lock().await.recv().await
    }

    /// Stop all drain workers and close owned connections. Messages
    /// already decoded remain retrievable until the queue drains; after
    /// that, every blocked `wait_for_message` call returns `None`.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        let handles = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            let _ = handle.await;
        }
        self.pool
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        debug!("console receiver shut down");
    }
}

/// One drain worker: ingest fresh connections, poll the pool, sleep
/// when idle.
async fn drain_loop(
    worker: usize,
    pool: Arc<Mutex<VecDeque<PooledConnection>>>,
    sources: Arc<Mutex<Vec<mpsc::UnboundedReceiver<InboundConnection>>>>,
    message_tx: mpsc::UnboundedSender<ReceivedMessage>,
    idle_poll_delay: Duration,
    inactivity_timeout: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        ingest_new_connections(&pool, &sources);

        let mut produced = false;
        let pending = pool.lock().unwrap_or_else(|e| e.into_inner()).len();
        for _ in 0..pending {
            let conn = pool.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
            let Some(mut conn) = conn else { break };

            match drain_connection(&mut conn) {
                Ok(Drained::Idle) => {
                    if conn.last_activity.elapsed() >= inactivity_timeout {
                        info!(peer = %conn.peer, "closing inactive connection");
                    } else {
                        pool.lock().unwrap_or_else(|e| e.into_inner()).push_back(conn);
                    }
                }
                Ok(Drained::Messages(messages)) => {
                    produced = true;
                    for message in messages {
                        if message_tx.send(message).is_err() {
                            return;
                        }
                    }
                    pool.lock().unwrap_or_else(|e| e.into_inner()).push_back(conn);
                }
                Ok(Drained::Closed) => {
                    debug!(peer = %conn.peer, "connection closed by peer");
                }
                Err(e) => {
                    warn!(peer = %conn.peer, error = %e, "dropping connection after read error");
                }
            }
        }

        if produced {
            tokio::task::yield_now().await;
        } else {
            tokio::select! {
                _ = tokio::time::sleep(idle_poll_delay) => {}
                _ = shutdown_rx.changed() => {}
            }
        }
    }
    debug!(worker, "drain worker stopped");
}

/// Move newly classified connections from the acceptor into the pool.
fn ingest_new_connections(
    pool: &Mutex<VecDeque<PooledConnection>>,
    sources: &Mutex<Vec<mpsc::UnboundedReceiver<InboundConnection>>>,
) {
    let mut sources = sources.lock().unwrap_or_else(|e| e.into_inner());
    for source in sources.iter_mut() {
        while let Ok(inbound) = source.try_recv() {
            debug!(peer = %inbound.peer, "connection joined drain pool");
            pool.lock()
                .unwrap_or_else(|e| e.into_inner())
                .push_back(PooledConnection {
                    peer: inbound.peer,
                    reader: inbound.reader,
                    buf: BytesMut::with_capacity(4096),
                    last_activity: Instant::now(),
                    _guard: inbound.guard,
                });
        }
    }
}

/// Non-blocking read into the connection's frame accumulator, then
/// decode every complete frame.
///
/// A peer may write its last message and close in one motion; frames
/// buffered before the EOF are still delivered. The connection reports
/// `Closed` on the next pass, once its buffer holds no complete frame.
fn drain_connection(conn: &mut PooledConnection) -> CommsResult<Drained> {
    let mut eof = false;
    loop {
        match conn.reader.try_read_buf(&mut conn.buf) {
            Ok(0) => {
                eof = true;
                break;
            }
            Ok(_) => conn.last_activity = Instant::now(),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(CommsError::Io(e)),
        }
    }

    let frames = decode_frames(&mut conn.buf)?;
    if frames.is_empty() {
        return Ok(if eof { Drained::Closed } else { Drained::Idle });
    }
    Ok(Drained::Messages(
        frames
            .into_iter()
            .map(|message| ReceivedMessage {
                message,
                sender: conn.peer,
            })
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadswarm_wire::{
        encode_frame, MessageKind, WireMessage, WirePayload, PROTOCOL_VERSION,
    };
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    async fn agent_client(addr: std::net::SocketAddr) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let declaration = WireMessage::new(WirePayload::RoleDeclaration {
            role: ConnectionRole::Agent,
            protocol_version: PROTOCOL_VERSION,
        });
        stream
            .write_all(&encode_frame(&declaration).unwrap())
            .await
            .unwrap();
        stream
    }

    fn report(free_memory: u64) -> WireMessage {
        WireMessage::new(WirePayload::AgentReport {
            state: "ready".to_string(),
            operating_system: "linux".to_string(),
            free_memory,
        })
    }

    #[tokio::test]
    async fn test_receives_messages_in_connection_order() {
        let acceptor = Acceptor::bind("127.0.0.1", 0, 16).await.unwrap();
        let receiver = ConsoleReceiver::start(
            &acceptor,
            &ConnectionRole::ALL,
            2,
            Duration::from_millis(20),
            Duration::from_secs(30),
        );

        let mut client = agent_client(acceptor.local_addr()).await;
        let first = report(1);
        let second = report(2);
        client
            .write_all(&encode_frame(&first).unwrap())
            .await
            .unwrap();
        client
            .write_all(&encode_frame(&second).unwrap())
            .await
            .unwrap();

        let got_first = receiver.wait_for_message().await.unwrap();
        let got_second = receiver.wait_for_message().await.unwrap();
        assert_eq!(got_first.message.id, first.id);
        assert_eq!(got_second.message.id, second.id);
        assert_eq!(got_first.kind(), MessageKind::AgentReport);
        assert_eq!(
            got_first.sender.socket_addr(),
            client.local_addr().unwrap()
        );

        receiver.shutdown().await;
        acceptor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_message_sent_just_before_close_is_delivered() {
        let acceptor = Acceptor::bind("127.0.0.1", 0, 16).await.unwrap();
        let receiver = ConsoleReceiver::start(
            &acceptor,
            &ConnectionRole::ALL,
            1,
            Duration::from_millis(10),
            Duration::from_secs(30),
        );

        // The normal worker exit pattern: final report, then close.
        let mut client = agent_client(acceptor.local_addr()).await;
        let last = report(9);
        client
            .write_all(&encode_frame(&last).unwrap())
            .await
            .unwrap();
        drop(client);

        let got = tokio::time::timeout(Duration::from_secs(2), receiver.wait_for_message())
            .await
            .expect("message sent before close was dropped")
            .unwrap();
        assert_eq!(got.message.id, last.id);

        // The closed connection leaves the pool afterwards.
        let deadline = Instant::now() + Duration::from_secs(2);
        while acceptor.number_of_connections() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(acceptor.number_of_connections(), 0);

        receiver.shutdown().await;
        acceptor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_inactive_connection_evicted() {
        let acceptor = Acceptor::bind("127.0.0.1", 0, 16).await.unwrap();
        let receiver = ConsoleReceiver::start(
            &acceptor,
            &ConnectionRole::ALL,
            1,
            Duration::from_millis(20),
            Duration::from_millis(150),
        );

        let _client = agent_client(acceptor.local_addr()).await;
        let deadline = Instant::now() + Duration::from_secs(2);
        while acceptor.number_of_connections() == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(acceptor.number_of_connections(), 1);

        // The silent connection crosses the inactivity timeout.
        let deadline = Instant::now() + Duration::from_secs(2);
        while acceptor.number_of_connections() == 1 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(acceptor.number_of_connections(), 0);

        receiver.shutdown().await;
        acceptor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_returns_sentinel_after_drain() {
        let acceptor = Acceptor::bind("127.0.0.1", 0, 16).await.unwrap();
        let receiver = ConsoleReceiver::start(
            &acceptor,
            &ConnectionRole::ALL,
            1,
            Duration::from_millis(10),
            Duration::from_secs(30),
        );

        let mut client = agent_client(acceptor.local_addr()).await;
        let message = report(7);
        client
            .write_all(&encode_frame(&message).unwrap())
            .await
            .unwrap();

        // Let the drain worker decode it before shutting down.
        let queued = receiver.wait_for_message().await.unwrap();
        assert_eq!(queued.message.id, message.id);

        receiver.shutdown().await;
        assert!(receiver.wait_for_message().await.is_none());
        // Sentinel is sticky.
        assert!(receiver.wait_for_message().await.is_none());
        acceptor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_parked_caller() {
        let acceptor = Acceptor::bind("127.0.0.1", 0, 16).await.unwrap();
        let receiver = Arc::new(ConsoleReceiver::start(
            &acceptor,
            &ConnectionRole::ALL,
            1,
            Duration::from_millis(10),
            Duration::from_secs(30),
        ));

        let parked = {
            let receiver = Arc::clone(&receiver);
            tokio::spawn(async move { receiver.wait_for_message().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        receiver.shutdown().await;
        assert!(parked.await.unwrap().is_none());
        acceptor.shutdown().await.unwrap();
    }

    #[tokio::test]
    #[should_panic(expected = "duplicate role")]
    async fn test_duplicate_role_set_panics() {
        let acceptor = Acceptor::bind("127.0.0.1", 0, 16).await.unwrap();
        let _ = ConsoleReceiver::start(
            &acceptor,
            &[ConnectionRole::Agent, ConnectionRole::Agent],
            1,
            Duration::from_millis(10),
            Duration::from_secs(30),
        );
    }
}
