//! Errors of the shared host plumbing

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The other end of the USB thread bridge went away
    #[error("USB bridge closed: {0}")]
    BridgeClosed(String),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

pub type Result<T> = std::result::Result<T, Error>;
