//! Error taxonomy for kernel sessions.

use std::time::Duration;

use crate::NotebookId;

pub type Result<T, E = KernelError> = std::result::Result<T, E>;

/// Errors surfaced by sessions, the router and the control surface.
///
/// Every variant renders as a single human-readable line; the UI shows the
/// `Display` output verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error("Kernel did not become ready within {0:?}")]
    StartupTimeout(Duration),

    #[error("Kernel failed to start: {0}")]
    StartupFailure(String),

    #[error("Kernel transport error: {0}")]
    TransportError(String),

    #[error("Cannot {operation} while kernel is {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("No response from kernel within {0:?}")]
    NoResponseTimeout(Duration),

    #[error("Kernel output channel closed")]
    ChannelClosed,

    #[error("Unknown kernel spec: {0}")]
    UnknownKernelSpec(String),

    #[error("No kernel session for {0}")]
    NoSession(NotebookId),
}

impl KernelError {
    pub(crate) fn invalid_state(operation: &'static str, state: impl ToString) -> Self {
        KernelError::InvalidState {
            operation,
            state: state.to_string(),
        }
    }

    /// Whether the session that produced this error is unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, KernelError::ChannelClosed)
    }
}

impl From<std::io::Error> for KernelError {
    fn from(e: std::io::Error) -> Self {
        KernelError::TransportError(e.to_string())
    }
}
