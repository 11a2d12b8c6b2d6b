//! The injected error-reporting collaborator.
//!
//! Socket and protocol failures are never thrown across the public
//! `process_one_message`/`send_to_*` boundary; they are funneled here
//! so the console keeps running degraded-but-alive.

use crate::error::CommsError;
use tracing::error;

/// Receives every failure the subsystem chooses not to propagate.
pub trait ErrorHandler: Send + Sync + 'static {
    /// A structured communication error.
    fn handle_error(&self, error: &CommsError);

    /// A plain operator-facing message with no underlying error value.
    fn handle_message(&self, message: &str);
}

/// Default handler: log through `tracing`.
#[derive(Debug, Default)]
pub struct TracingErrorHandler;

impl ErrorHandler for TracingErrorHandler {
    fn handle_error(&self, error: &CommsError) {
        error!(error = %error, "console communication error");
    }

    fn handle_message(&self, message: &str) {
        error!("{message}");
    }
}
