//! Console properties with change subscription and TOML loading.
//!
//! The recognized options cover the communication subsystem only. Host
//! and port changes are observable: subscribers receive a synchronous
//! [`PropertyChange`] notification, which is how the lifecycle
//! controller learns it must rebuild.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{info, warn};

/// Default console port (agents connect here).
pub const DEFAULT_CONSOLE_PORT: u16 = 16001;

/// How long receiver workers sleep when no connection has data.
pub const DEFAULT_IDLE_POLL_DELAY_MS: u64 = 500;

/// How long a connection may present no data before it is closed.
pub const DEFAULT_INACTIVE_CLIENT_TIMEOUT_MS: u64 = 30_000;

/// The communication options, as stored on disk and held in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleOptions {
    /// Bind host; empty means all interfaces.
    pub console_host: String,
    /// Bind port.
    pub console_port: u16,
    /// Listen backlog, fixed at bind time.
    pub accept_backlog: u32,
    /// Receiver idle poll delay in milliseconds.
    pub idle_poll_delay_ms: u64,
    /// Inactive client timeout in milliseconds.
    pub inactive_client_timeout_ms: u64,
    /// Drain workers shared across the receiver's role set.
    pub receiver_workers: usize,
    /// Concurrent outbound writes during a broadcast.
    pub sender_workers: usize,
}

impl Default for ConsoleOptions {
    fn default() -> Self {
        Self {
            console_host: String::new(),
            console_port: DEFAULT_CONSOLE_PORT,
            accept_backlog: 16,
            idle_poll_delay_ms: DEFAULT_IDLE_POLL_DELAY_MS,
            inactive_client_timeout_ms: DEFAULT_INACTIVE_CLIENT_TIMEOUT_MS,
            receiver_workers: 5,
            sender_workers: 3,
        }
    }
}

impl ConsoleOptions {
    pub fn idle_poll_delay(&self) -> Duration {
        Duration::from_millis(self.idle_poll_delay_ms)
    }

    pub fn inactive_client_timeout(&self) -> Duration {
        Duration::from_millis(self.inactive_client_timeout_ms)
    }
}

/// The configuration keys a subscriber can observe changing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKey {
    ConsoleHost,
    ConsolePort,
}

/// A synchronous change notification with old and new values.
#[derive(Debug, Clone)]
pub struct PropertyChange {
    pub key: PropertyKey,
    pub old: String,
    pub new: String,
}

type Listener = Box<dyn Fn(&PropertyChange) + Send + Sync>;

/// Shared, observable console properties.
pub struct ConsoleProperties {
    options: RwLock<ConsoleOptions>,
    listeners: RwLock<Vec<Listener>>,
}

impl ConsoleProperties {
    /// Wrap a fixed set of options.
    pub fn new(options: ConsoleOptions) -> Self {
        Self {
            options: RwLock::new(options),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Load options from a TOML file, falling back to defaults on any
    /// read or parse problem.
    pub fn load(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(contents) => match toml::from_str::<ConsoleOptions>(&contents) {
                    Ok(options) => {
                        info!(path = %path.display(), "Loaded console properties");
                        return Self::new(options);
                    }
                    Err(e) => {
                        warn!(
                            error = %e,
                            path = %path.display(),
                            "Failed to parse console properties, using defaults"
                        );
                    }
                },
                Err(e) => {
                    warn!(
                        error = %e,
                        path = %path.display(),
                        "Failed to read console properties, using defaults"
                    );
                }
            }
        } else {
            info!(
                path = %path.display(),
                "Console properties file not found, using defaults"
            );
        }
        Self::new(ConsoleOptions::default())
    }

    /// A snapshot of the current options.
    pub fn options(&self) -> ConsoleOptions {
        self.options
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Register a change listener. Listeners are invoked synchronously
    /// on the thread performing the change.
    pub fn subscribe(&self, listener: impl Fn(&PropertyChange) + Send + Sync + 'static) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(listener));
    }

    /// Change the bind host. No-op (no notification) if unchanged.
    pub fn set_console_host(&self, host: &str) {
        let old = {
            let mut options = self.options.write().unwrap_or_else(|e| e.into_inner());
            if options.console_host == host {
                return;
            }
            std::mem::replace(&mut options.console_host, host.to_string())
        };
        self.notify(PropertyChange {
            key: PropertyKey::ConsoleHost,
            old,
            new: host.to_string(),
        });
    }

    /// Change the bind port. No-op (no notification) if unchanged.
    pub fn set_console_port(&self, port: u16) {
        let old = {
            let mut options = self.options.write().unwrap_or_else(|e| e.into_inner());
            if options.console_port == port {
                return;
            }
            std::mem::replace(&mut options.console_port, port)
        };
        self.notify(PropertyChange {
            key: PropertyKey::ConsolePort,
            old: old.to_string(),
            new: port.to_string(),
        });
    }

    fn notify(&self, change: PropertyChange) {
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        for listener in listeners.iter() {
            listener(&change);
        }
    }
}
