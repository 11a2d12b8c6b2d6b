//! ConsoleCommunication — lifecycle controller for the console
//! communication subsystem.
//!
//! Owns the acceptor/receiver/sender triple, rebuilds it whenever the
//! bind host or port changes, and exposes the steady-state
//! `process_one_message` loop plus the outbound send operations the
//! rest of the console calls. The triple is replaced, never mutated in
//! place: readers always observe a fully constructed generation.

use crate::acceptor::Acceptor;
use crate::dispatch::MessageDispatchRegistry;
use crate::flag::StateFlag;
use crate::handler::ErrorHandler;
use crate::properties::{ConsoleProperties, PropertyKey};
use crate::receiver::ConsoleReceiver;
use crate::resolver::AddressResolver;
use crate::sender::FanOutSender;
use loadswarm_wire::{ConnectionRole, PeerAddress, WireMessage};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// One generation of live communication components.
struct CommsTriple {
    acceptor: Arc<Acceptor>,
    resolver: Arc<AddressResolver>,
    receiver: Arc<ConsoleReceiver>,
    sender: Arc<FanOutSender>,
    /// Drains the acceptor's pending-error stream to the error handler.
    problem_observer: JoinHandle<()>,
}

/// The console communication subsystem.
pub struct ConsoleCommunication {
    properties: Arc<ConsoleProperties>,
    error_handler: Arc<dyn ErrorHandler>,
    dispatch: Arc<MessageDispatchRegistry>,
    /// True while a receiver is live and accepting `wait_for_message`.
    processing: StateFlag,
    /// Monotonic false→true; once set, rebuilds are refused.
    shutdown_flag: StateFlag,
    live: RwLock<Option<Arc<CommsTriple>>>,
    /// Serializes reset/shutdown; steady-state calls never take it.
    reset_lock: AsyncMutex<()>,
}

impl ConsoleCommunication {
    /// Build the subsystem and perform the initial bind.
    ///
    /// A bind failure is reported through the error handler and leaves
    /// the subsystem idle until the properties change or [`reset`]
    /// (Self::reset) is called again; it never fails construction.
    pub async fn start(
        properties: Arc<ConsoleProperties>,
        error_handler: Arc<dyn ErrorHandler>,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            properties: Arc::clone(&properties),
            error_handler,
            dispatch: Arc::new(MessageDispatchRegistry::new()),
            processing: StateFlag::new(false),
            shutdown_flag: StateFlag::new(false),
            live: RwLock::new(None),
            reset_lock: AsyncMutex::new(()),
        });

        // A host or port change rebuilds the triple.
        let weak = Arc::downgrade(&this);
        properties.subscribe(move |change| {
            if matches!(
                change.key,
                PropertyKey::ConsoleHost | PropertyKey::ConsolePort
            ) {
                if let Some(comms) = weak.upgrade() {
                    info!(
                        key = ?change.key,
                        old = %change.old,
                        new = %change.new,
                        "console address changed, rebuilding communication"
                    );
                    tokio::spawn(async move { comms.reset().await });
                }
            }
        });

        this.reset().await;
        this
    }

    /// Registry for handler registration during startup.
    pub fn message_dispatch_registry(&self) -> Arc<MessageDispatchRegistry> {
        Arc::clone(&self.dispatch)
    }

    /// The properties this subsystem reacts to.
    pub fn properties_handle(&self) -> Arc<ConsoleProperties> {
        Arc::clone(&self.properties)
    }

    /// Tear down the previous generation and, unless shut down, bind
    /// and start a new one.
    pub async fn reset(&self) {
        let _guard = self.reset_lock.lock().await;

        let previous = self
            .live
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        if let Some(previous) = previous {
            previous.problem_observer.abort();
            if let Err(e) = previous.acceptor.shutdown().await {
                // Abort the reset; the previous generation stays in place.
                self.error_handler.handle_error(&e);
                return;
            }
            previous.sender.shutdown().await;
            previous.receiver.shutdown().await;

            // Wait until we are deaf. A `process_one_message` caller
            // must observe the sentinel and drop the flag; we cannot
            // drain the old receiver ourselves, as valid messages may
            // still be queued for it.
            self.processing.wait_for(false).await;

            // Only now may the dead generation disappear: the sentinel
            // check above needs it, and diagnostics must not keep
            // reporting a closed endpoint.
            *self.live.write().unwrap_or_else(|e| e.into_inner()) = None;
        }

        if self.shutdown_flag.get() {
            return;
        }

        let options = self.properties.options();
        let acceptor = match Acceptor::bind(
            &options.console_host,
            options.console_port,
            options.accept_backlog,
        )
        .await
        {
            Ok(acceptor) => Arc::new(acceptor),
            Err(e) => {
                self.error_handler.handle_error(&e);
                // Release any callers parked in process_one_message.
                self.processing.wake_all();
                return;
            }
        };

        let resolver = Arc::new(AddressResolver::register(&acceptor));

        let problem_observer = tokio::spawn({
            let acceptor = Arc::clone(&acceptor);
            let error_handler = Arc::clone(&self.error_handler);
            async move {
                while let Some(error) = acceptor.pending_error().await {
                    error_handler.handle_error(&error);
                }
                debug!("acceptor problem observer finished");
            }
        });

        let receiver = Arc::new(ConsoleReceiver::start(
            &acceptor,
            &ConnectionRole::ALL,
            options.receiver_workers,
            options.idle_poll_delay(),
            options.inactive_client_timeout(),
        ));
        let sender = Arc::new(FanOutSender::start(
            &acceptor,
            options.sender_workers,
            Arc::clone(&self.error_handler),
        ));

        info!(addr = %acceptor.local_addr(), "console communication live");
        *self.live.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(CommsTriple {
            acceptor,
            resolver,
            receiver,
            sender,
            problem_observer,
        }));
        self.processing.set(true);
    }

    /// Terminal teardown. Idempotent; after this returns,
    /// `process_one_message` always returns `false` without blocking.
    pub async fn shutdown(&self) {
        self.shutdown_flag.set(true);
        self.processing.set(false);
        self.reset().await;
    }

    /// Wait for one message and dispatch it.
    ///
    /// Returns `true` once a message was processed, `false` once the
    /// subsystem has been shut down. Any number of tasks may call this
    /// concurrently; each decoded message is delivered to exactly one
    /// caller.
    pub async fn process_one_message(&self) -> bool {
        loop {
            if self.shutdown_flag.get() {
                return false;
            }

            if !self.processing.wait_for(true).await {
                continue;
            }

            let receiver = self
                .live
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .as_ref()
                .map(|triple| Arc::clone(&triple.receiver));
            let Some(receiver) = receiver else {
                tokio::task::yield_now().await;
                continue;
            };

            match receiver.wait_for_message().await {
                Some(message) => match self.dispatch.dispatch(&message) {
                    Ok(()) => return true,
                    Err(e) => self.error_handler.handle_error(&e),
                },
                None => {
                    // The receiver shut down. Drop the flag only if it
                    // is still the current generation, so a stale
                    // sentinel cannot stall a rebuilt receiver.
                    let current = self
                        .live
                        .read()
                        .unwrap_or_else(|e| e.into_inner())
                        .as_ref()
                        .map_or(false, |triple| Arc::ptr_eq(&triple.receiver, &receiver));
                    if current {
                        self.processing.set(false);
                    }
                }
            }
        }
    }

    /// Broadcast to every connected agent. Failures are reported
    /// through the error handler, never raised.
    pub async fn send_to_agents(&self, message: WireMessage) {
        let sender = self
            .live
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|triple| Arc::clone(&triple.sender));
        match sender {
            Some(sender) => sender.broadcast(&message).await,
            None => self
                .error_handler
                .handle_message("cannot send to agents: console communication is not running"),
        }
    }

    /// Send to one connected agent. Failures are reported through the
    /// error handler, never raised.
    pub async fn send_to_addressed_agents(&self, peer: &PeerAddress, message: WireMessage) {
        let sender = self
            .live
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|triple| Arc::clone(&triple.sender));
        match sender {
            Some(sender) => {
                if let Err(e) = sender.send_to(peer, &message).await {
                    self.error_handler.handle_error(&e);
                }
            }
            None => self
                .error_handler
                .handle_message("cannot send to agent: console communication is not running"),
        }
    }

    /// The local address the given peer should use to reach the console.
    pub fn local_connecting_address(&self, peer: &PeerAddress) -> Option<String> {
        self.live
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|triple| triple.resolver.resolve_local_address(peer))
    }

    /// Currently accepted, still-active connections (diagnostic).
    pub fn number_of_connections(&self) -> usize {
        self.live
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(0, |triple| triple.acceptor.number_of_connections())
    }

    /// The actual bound address of the live acceptor, if any.
    pub fn bound_address(&self) -> Option<SocketAddr> {
        self.live
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|triple| triple.acceptor.local_addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CommsError;
    use crate::properties::ConsoleOptions;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHandler {
        reports: Mutex<Vec<String>>,
    }

    impl RecordingHandler {
        fn reports(&self) -> Vec<String> {
            self.reports.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }
    }

    impl ErrorHandler for RecordingHandler {
        fn handle_error(&self, error: &CommsError) {
            self.reports
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(error.to_string());
        }

        fn handle_message(&self, message: &str) {
            self.reports
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(message.to_string());
        }
    }

    fn ephemeral_properties() -> Arc<ConsoleProperties> {
        Arc::new(ConsoleProperties::new(ConsoleOptions {
            console_host: "127.0.0.1".to_string(),
            console_port: 0,
            ..ConsoleOptions::default()
        }))
    }

    #[tokio::test]
    async fn test_start_binds_and_shutdown_is_idempotent() {
        let handler = Arc::new(RecordingHandler::default());
        let comms = ConsoleCommunication::start(ephemeral_properties(), handler.clone()).await;

        let addr = comms.bound_address().expect("live after start");
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert_eq!(comms.number_of_connections(), 0);

        comms.shutdown().await;
        comms.shutdown().await;
        assert!(!comms.process_one_message().await);
        assert!(!comms.process_one_message().await);
        // The dead endpoint no longer shows up in diagnostics.
        assert!(comms.bound_address().is_none());
        assert_eq!(comms.number_of_connections(), 0);
        assert!(handler.reports().is_empty(), "{:?}", handler.reports());
    }

    #[tokio::test]
    async fn test_failed_rebuild_clears_live_endpoint() {
        let handler = Arc::new(RecordingHandler::default());
        let comms = ConsoleCommunication::start(ephemeral_properties(), handler.clone()).await;
        assert!(comms.bound_address().is_some());

        // An active pump, so the rebuild can drain the old receiver.
        let pump = tokio::spawn({
            let comms = Arc::clone(&comms);
            async move { while comms.process_one_message().await {} }
        });

        // Move the console onto a port that is already taken.
        let occupant = Acceptor::bind("127.0.0.1", 0, 16).await.unwrap();
        comms
            .properties_handle()
            .set_console_port(occupant.local_addr().port());

        let bind_failed = || handler.reports().iter().any(|r| r.contains("failed to bind"));
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !bind_failed() && std::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(bind_failed(), "{:?}", handler.reports());
        assert!(comms.bound_address().is_none());
        assert_eq!(comms.number_of_connections(), 0);

        comms.shutdown().await;
        pump.await.unwrap();
        occupant.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_bind_leaves_subsystem_idle_not_crashed() {
        // Occupy a port, then ask the console to bind it.
        let occupant = Acceptor::bind("127.0.0.1", 0, 16).await.unwrap();
        let port = occupant.local_addr().port();

        let handler = Arc::new(RecordingHandler::default());
        let properties = Arc::new(ConsoleProperties::new(ConsoleOptions {
            console_host: "127.0.0.1".to_string(),
            console_port: port,
            ..ConsoleOptions::default()
        }));
        let comms = ConsoleCommunication::start(properties, handler.clone()).await;

        assert!(comms.bound_address().is_none());
        assert_eq!(comms.number_of_connections(), 0);
        let reports = handler.reports();
        assert!(
            reports.iter().any(|r| r.contains("failed to bind")),
            "{reports:?}"
        );

        // Sends report instead of panicking while degraded.
        comms
            .send_to_agents(WireMessage::new(loadswarm_wire::WirePayload::StopWorkers))
            .await;
        assert!(handler
            .reports()
            .iter()
            .any(|r| r.contains("not running")));

        comms.shutdown().await;
        occupant.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_recovers_after_port_becomes_free() {
        let occupant = Acceptor::bind("127.0.0.1", 0, 16).await.unwrap();
        let port = occupant.local_addr().port();

        let handler = Arc::new(RecordingHandler::default());
        let properties = Arc::new(ConsoleProperties::new(ConsoleOptions {
            console_host: "127.0.0.1".to_string(),
            console_port: port,
            ..ConsoleOptions::default()
        }));
        let comms = ConsoleCommunication::start(properties, handler.clone()).await;
        assert!(comms.bound_address().is_none());

        // Operator frees the port and triggers another reset.
        occupant.shutdown().await.unwrap();
        comms.reset().await;

        assert_eq!(comms.bound_address().unwrap().port(), port);
        comms.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_to_unknown_agent_reports_error() {
        let handler = Arc::new(RecordingHandler::default());
        let comms = ConsoleCommunication::start(ephemeral_properties(), handler.clone()).await;

        let stranger = PeerAddress::new("127.0.0.1:1".parse().unwrap());
        comms
            .send_to_addressed_agents(
                &stranger,
                WireMessage::new(loadswarm_wire::WirePayload::StopWorkers),
            )
            .await;
        assert!(handler
            .reports()
            .iter()
            .any(|r| r.contains("unknown peer")));

        comms.shutdown().await;
    }
}
