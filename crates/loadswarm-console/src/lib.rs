//! LoadSwarm console communication subsystem.
//!
//! The console is the coordinator of a distributed load test: agents,
//! console clients, and workers connect to it over long-lived TCP
//! connections carrying typed messages. This crate is the transport and
//! dispatch substrate the rest of the console rides on.
//!
//! ## Architecture
//!
//! - **Acceptor**: binds the console endpoint, classifies inbound
//!   connections by declared role, queues accept problems
//! - **AddressResolver**: which local address a peer should use to
//!   reach the console back
//! - **ConsoleReceiver**: drain-worker pool producing decoded messages
//! - **MessageDispatchRegistry**: message kind → registered handlers
//! - **FanOutSender**: broadcast/addressed delivery to agents
//! - **ConsoleCommunication**: lifecycle controller that owns the
//!   triple and rebuilds it when the bind address changes

pub mod acceptor;
pub mod communication;
pub mod dispatch;
pub mod error;
pub mod flag;
pub mod handler;
pub mod properties;
pub mod receiver;
pub mod resolver;
pub mod sender;

pub use acceptor::Acceptor;
pub use communication::ConsoleCommunication;
pub use dispatch::{MessageDispatchRegistry, MessageHandler};
pub use error::{CommsError, CommsResult};
pub use handler::{ErrorHandler, TracingErrorHandler};
pub use properties::{ConsoleOptions, ConsoleProperties, PropertyChange, PropertyKey};
pub use receiver::ConsoleReceiver;
pub use resolver::AddressResolver;
pub use sender::FanOutSender;
