//! Error types for thread-affine dispatch
//!
//! Every failure in this crate is scoped to the call that requested it;
//! nothing here is fatal to the process.

use thiserror::Error;

/// Main error type for dispatch, codec and continuation operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A thread identifier field combination cannot be encoded or decoded
    #[error("Invalid thread encoding: {reason}")]
    InvalidThreadEncoding {
        /// Which field was out of range
        reason: String,
    },

    /// The host could not deliver a dispatched callback
    #[error("Dispatch failed: {reason}")]
    DispatchFailure {
        /// Reason reported by the host or the dispatch layer
        reason: String,
    },

    /// The wrapped operation was cancelled and the caller asked to observe it
    #[error("Operation was cancelled")]
    CancellationObserved,

    /// The wrapped operation itself was cancelled
    #[error("Operation cancelled before producing a result")]
    Cancelled,

    /// A dispatch token was presented after it had already been released
    #[error("Dispatch token {token:#x} is stale or was never allocated")]
    StaleToken {
        /// Raw value of the offending token
        token: u64,
    },

    /// A dispatched callback panicked on the target thread
    #[error("Dispatched callback panicked: {reason}")]
    CallbackPanicked {
        /// Panic payload, when it was a string
        reason: String,
    },

    /// An ambient dispatch was requested with no context installed
    #[error("No ambient dispatch context is installed on this thread")]
    NoAmbientContext,

    /// A blocking send did not complete within the configured timeout
    #[error("Operation timed out")]
    Timeout,

    /// The host dispatcher itself failed
    #[error("Host error: {reason}")]
    HostError {
        /// Reason for the host failure
        reason: String,
    },
}

impl Error {
    /// Whether this error represents cancellation of the wrapped operation
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::CancellationObserved)
    }
}

impl From<futures::channel::oneshot::Canceled> for Error {
    fn from(_: futures::channel::oneshot::Canceled) -> Self {
        Error::Cancelled
    }
}

/// Convenient result type alias
pub type Result<T> = std::result::Result<T, Error>;
