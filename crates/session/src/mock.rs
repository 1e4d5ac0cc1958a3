//! In-memory collaborators for tests
//!
//! [`MockTransport`] parks every submitted transfer until the test completes
//! it, so tests decide exactly when and how each transfer finishes.
//! [`MockPower`] counts power-management calls.
//!
//! # Example
//!
//! ```
//! use session::mock::MockTransport;
//! use session::transfer::{Direction, Endpoint, TransferChannel};
//!
//! let transport = MockTransport::new();
//! let channel = TransferChannel::new(Endpoint::new(0x81, 64), transport.clone());
//! channel.submit(vec![0; 64], 64, |c| assert_eq!(c.data(), b"hi")).unwrap();
//! assert!(transport.complete_in(b"hi"));
//! assert!(channel.is_idle());
//! ```

use crate::error::{Result, SessionError};
use crate::power::PowerPolicy;
use crate::transfer::{Direction, SubmitError, Transfer, TransferId, TransferStatus, Transport};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// How long [`MockTransport::wait_for_pending`] polls before giving up
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct MockState {
    pending: VecDeque<Transfer>,
    submitted_in: usize,
    submitted_out: usize,
    last_length_in: Option<usize>,
    last_length_out: Option<usize>,
    written: Vec<u8>,
    cancelled: Vec<TransferId>,
    fail_next: Option<SubmitError>,
}

#[derive(Debug)]
pub struct MockTransport {
    state: Mutex<MockState>,
    cancel_completes: AtomicBool,
    auto_complete_out: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState::default()),
            cancel_completes: AtomicBool::new(true),
            auto_complete_out: AtomicBool::new(false),
        })
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reject the next submission with `err`
    pub fn fail_next_submit(&self, err: SubmitError) {
        self.state().fail_next = Some(err);
    }

    /// Whether cancel completes the transfer right away (default) or leaves
    /// it parked, like a transport that is slow to withdraw requests
    pub fn set_cancel_completes(&self, completes: bool) {
        self.cancel_completes.store(completes, Ordering::Release);
    }

    /// Complete outbound transfers successfully as soon as they are submitted
    pub fn set_auto_complete_out(&self, auto: bool) {
        self.auto_complete_out.store(auto, Ordering::Release);
    }

    pub fn pending(&self, direction: Direction) -> usize {
        self.state()
            .pending
            .iter()
            .filter(|t| t.direction() == direction)
            .count()
    }

    /// Total transfers accepted in `direction`
    pub fn submitted(&self, direction: Direction) -> usize {
        let state = self.state();
        match direction {
            Direction::In => state.submitted_in,
            Direction::Out => state.submitted_out,
        }
    }

    /// Requested length of the oldest parked transfer in `direction`
    pub fn pending_length(&self, direction: Direction) -> Option<usize> {
        self.state()
            .pending
            .iter()
            .find(|t| t.direction() == direction)
            .map(Transfer::length)
    }

    /// Requested length of the most recent submission in `direction`
    pub fn last_length(&self, direction: Direction) -> Option<usize> {
        let state = self.state();
        match direction {
            Direction::In => state.last_length_in,
            Direction::Out => state.last_length_out,
        }
    }

    /// Every outbound payload accepted so far, concatenated
    pub fn written(&self) -> Vec<u8> {
        self.state().written.clone()
    }

    pub fn cancelled(&self) -> Vec<TransferId> {
        self.state().cancelled.clone()
    }

    fn take_pending(&self, direction: Direction) -> Option<Transfer> {
        let mut state = self.state();
        let index = state
            .pending
            .iter()
            .position(|t| t.direction() == direction)?;
        state.pending.remove(index)
    }

    /// Complete the oldest inbound transfer with `data` (truncated to the
    /// requested length). Returns false if none was pending.
    pub fn complete_in(&self, data: &[u8]) -> bool {
        let Some(mut transfer) = self.take_pending(Direction::In) else {
            return false;
        };
        let n = data.len().min(transfer.length());
        transfer.data_mut()[..n].copy_from_slice(&data[..n]);
        transfer.complete(TransferStatus::Completed, n);
        true
    }

    /// Fail the oldest inbound transfer with `status`
    pub fn fail_in(&self, status: TransferStatus) -> bool {
        match self.take_pending(Direction::In) {
            Some(transfer) => {
                transfer.complete(status, 0);
                true
            }
            None => false,
        }
    }

    /// Finish the oldest outbound transfer with `status`
    pub fn complete_out(&self, status: TransferStatus) -> bool {
        match self.take_pending(Direction::Out) {
            Some(transfer) => {
                let actual = if status.is_success() {
                    transfer.length()
                } else {
                    0
                };
                transfer.complete(status, actual);
                true
            }
            None => false,
        }
    }

    /// Finish every parked outbound transfer; returns how many there were
    pub fn complete_all_out(&self, status: TransferStatus) -> usize {
        let mut count = 0;
        while self.complete_out(status) {
            count += 1;
        }
        count
    }

    /// Poll until at least `count` transfers are parked in `direction`
    pub async fn wait_for_pending(&self, direction: Direction, count: usize) -> bool {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        while self.pending(direction) < count {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        true
    }
}

impl Transport for MockTransport {
    fn submit(&self, transfer: Transfer) -> std::result::Result<(), SubmitError> {
        let mut state = self.state();
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }

        let direction = transfer.direction();
        match direction {
            Direction::In => {
                state.submitted_in += 1;
                state.last_length_in = Some(transfer.length());
            }
            Direction::Out => {
                state.submitted_out += 1;
                state.last_length_out = Some(transfer.length());
                state.written.extend_from_slice(transfer.data());
            }
        }

        if direction == Direction::Out && self.auto_complete_out.load(Ordering::Acquire) {
            drop(state);
            let length = transfer.length();
            transfer.complete(TransferStatus::Completed, length);
            return Ok(());
        }

        state.pending.push_back(transfer);
        Ok(())
    }

    fn cancel(&self, id: TransferId) {
        let transfer = {
            let mut state = self.state();
            state.cancelled.push(id);
            if !self.cancel_completes.load(Ordering::Acquire) {
                return;
            }
            let index = state.pending.iter().position(|t| t.id() == id);
            index.and_then(|i| state.pending.remove(i))
        };

        if let Some(transfer) = transfer {
            transfer.complete(TransferStatus::Cancelled, 0);
        }
    }
}

/// Counts idle-suspend calls; can be told to refuse
#[derive(Debug, Default)]
pub struct MockPower {
    prevented: AtomicUsize,
    allowed: AtomicUsize,
    fail: AtomicBool,
}

impl MockPower {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Release);
    }

    pub fn prevented(&self) -> usize {
        self.prevented.load(Ordering::Acquire)
    }

    pub fn allowed(&self) -> usize {
        self.allowed.load(Ordering::Acquire)
    }
}

impl PowerPolicy for MockPower {
    fn prevent_idle_suspend(&self) -> Result<()> {
        if self.fail.load(Ordering::Acquire) {
            return Err(SessionError::Power("refused by mock".to_string()));
        }
        self.prevented.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn allow_idle_suspend(&self) {
        self.allowed.fetch_add(1, Ordering::AcqRel);
    }
}
