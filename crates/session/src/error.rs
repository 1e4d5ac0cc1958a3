//! Session error types

use thiserror::Error;

/// Errors surfaced to clients of a device session
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The device was detached while the operation was in progress
    #[error("Device is gone")]
    DeviceGone,

    /// Non-blocking call would have had to wait
    #[error("Operation would block")]
    WouldBlock,

    /// A blocking wait was interrupted by the caller
    #[error("Interrupted while waiting")]
    Interrupted,

    /// The endpoint stalled (or the device was reset)
    #[error("Endpoint stalled")]
    PipeStall,

    /// Generic transfer failure
    #[error("I/O error")]
    Io,

    /// No minor numbers or transfer memory left
    #[error("Resources exhausted")]
    ResourceExhausted,

    /// No session is registered under the requested minor
    #[error("No device for minor {0}")]
    NotFound(u32),

    /// The client handle has already been closed
    #[error("Handle already closed")]
    Closed,

    /// The session only admits one opener at a time
    #[error("Device is busy")]
    Busy,

    /// Probe could not find both a bulk-in and a bulk-out endpoint
    #[error("Could not find both bulk-in and bulk-out endpoints")]
    NoEndpoints,

    /// The power collaborator refused to keep the device awake
    #[error("Power management error: {0}")]
    Power(String),
}

impl SessionError {
    /// Errors that mean "try again", not failure
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::WouldBlock | SessionError::Interrupted)
    }
}

/// Type alias for session results
pub type Result<T> = std::result::Result<T, SessionError>;
