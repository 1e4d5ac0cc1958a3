//! Single-slot store for the last transfer failure
//!
//! Completion callbacks record into the latch from transport threads; client
//! calls drain it. Every latched failure is reported to exactly one caller.

use crate::error::SessionError;
use crate::transfer::TransferStatus;
use std::sync::{Mutex, PoisonError};
use tracing::warn;

#[derive(Debug, Default)]
pub struct ErrorLatch {
    slot: Mutex<Option<TransferStatus>>,
}

impl ErrorLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a transfer outcome
    ///
    /// Success and cancellation-class statuses are ignored. Returns whether the
    /// status was latched.
    pub fn record(&self, status: TransferStatus) -> bool {
        if status.is_success() || status.is_benign() {
            return false;
        }

        warn!("Transfer failed with status {:?}", status);
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(status);
        true
    }

    /// Latch a failure that did not come from a transfer, such as a reset
    pub fn set(&self, status: TransferStatus) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(status);
    }

    /// Read and clear the latched failure
    pub fn take(&self) -> Option<SessionError> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(|status| match status {
                TransferStatus::Stall => SessionError::PipeStall,
                _ => SessionError::Io,
            })
    }

    pub fn is_set(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}
