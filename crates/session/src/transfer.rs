//! Bulk transfer primitives
//!
//! A [`Transfer`] is one asynchronous request handed to a [`Transport`]. The
//! transport moves the bytes and reports the outcome exactly once through the
//! transfer's completion callback, on whatever thread it likes.
//!
//! [`TransferChannel`] binds an endpoint to a transport, hands out transfer ids
//! and keeps the set of transfers still in flight so they can be cancelled on
//! suspend or disconnect.

use crate::error::SessionError;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Transfer direction, seen from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

impl Direction {
    /// Direction encoded in bit 7 of an endpoint address
    pub fn from_address(address: u8) -> Self {
        if address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// A bulk endpoint as reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub address: u8,
    pub max_packet_size: usize,
}

impl Endpoint {
    pub fn new(address: u8, max_packet_size: usize) -> Self {
        Self {
            address,
            max_packet_size,
        }
    }

    pub fn direction(&self) -> Direction {
        Direction::from_address(self.address)
    }
}

/// Identifies one submitted transfer; unique per endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId {
    pub endpoint: u8,
    pub seq: u64,
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}/{}", self.endpoint, self.seq)
    }
}

/// Final status of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Transfer finished normally
    Completed,
    /// Request was withdrawn (cancelled by us)
    Cancelled,
    /// Request was unlinked while in progress
    ConnectionReset,
    /// Endpoint or device shut down underneath the request
    Shutdown,
    /// Endpoint halted
    Stall,
    /// Device sent more data than requested
    Overflow,
    /// Transport-level timeout
    Timeout,
    /// Generic I/O failure
    Io,
    /// Anything the transport could not classify
    Other,
}

impl TransferStatus {
    pub fn is_success(self) -> bool {
        self == TransferStatus::Completed
    }

    /// Cancellation-class statuses that are never reported to clients
    pub fn is_benign(self) -> bool {
        matches!(
            self,
            TransferStatus::Cancelled | TransferStatus::ConnectionReset | TransferStatus::Shutdown
        )
    }
}

/// Outcome handed to a transfer's completion callback
#[derive(Debug)]
pub struct Completion {
    pub id: TransferId,
    pub status: TransferStatus,
    pub actual_length: usize,
    /// The transfer buffer, returned to its owner
    pub buffer: Vec<u8>,
}

impl Completion {
    /// Bytes actually transferred
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.actual_length.min(self.buffer.len())]
    }
}

type CompletionFn = Box<dyn FnOnce(Completion) + Send + 'static>;

/// One in-flight request
pub struct Transfer {
    id: TransferId,
    endpoint: Endpoint,
    buffer: Vec<u8>,
    length: usize,
    on_complete: CompletionFn,
}

impl Transfer {
    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn direction(&self) -> Direction {
        self.endpoint.direction()
    }

    /// Requested length in bytes
    pub fn length(&self) -> usize {
        self.length
    }

    /// Outbound payload (or the inbound target, before completion)
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.length]
    }

    /// Inbound target area
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[..self.length]
    }

    /// Finish the transfer and run its completion callback
    pub fn complete(self, status: TransferStatus, actual_length: usize) {
        let completion = Completion {
            id: self.id,
            status,
            actual_length: actual_length.min(self.length),
            buffer: self.buffer,
        };
        trace!(
            "Transfer {} completed: {:?}, {} bytes",
            completion.id, completion.status, completion.actual_length
        );
        (self.on_complete)(completion);
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

/// Reasons a transport refuses a submission
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("Device not present")]
    NoDevice,

    #[error("Out of transfer memory")]
    NoMemory,

    #[error("Transport rejected transfer: {0}")]
    Rejected(String),
}

impl From<SubmitError> for SessionError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::NoMemory => SessionError::ResourceExhausted,
            _ => SessionError::Io,
        }
    }
}

/// The layer that actually moves bytes over the wire
///
/// A transfer accepted by `submit` must be completed exactly once, also when
/// it is cancelled or the transport shuts down. A transfer rejected by
/// `submit` is dropped and its callback never runs.
pub trait Transport: Send + Sync + 'static {
    fn submit(&self, transfer: Transfer) -> Result<(), SubmitError>;

    /// Ask for an in-flight transfer to be withdrawn. Completion (with a
    /// cancellation status, or normally if it raced) follows asynchronously.
    fn cancel(&self, id: TransferId);
}

#[derive(Default)]
struct InFlight {
    ids: Mutex<HashSet<TransferId>>,
    idle: Notify,
}

impl InFlight {
    fn insert(&self, id: TransferId) {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
    }

    fn remove(&self, id: TransferId) {
        let mut ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        ids.remove(&id);
        if ids.is_empty() {
            drop(ids);
            self.idle.notify_waiters();
        }
    }

    fn snapshot(&self) -> Vec<TransferId> {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    fn len(&self) -> usize {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Submits transfers for one endpoint and tracks the ones in flight
pub struct TransferChannel {
    endpoint: Endpoint,
    transport: Arc<dyn Transport>,
    next_seq: AtomicU64,
    in_flight: Arc<InFlight>,
}

impl TransferChannel {
    pub fn new(endpoint: Endpoint, transport: Arc<dyn Transport>) -> Self {
        Self {
            endpoint,
            transport,
            next_seq: AtomicU64::new(0),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// Submit `buffer[..length]` on this endpoint
    ///
    /// `on_complete` runs exactly once if this returns `Ok`, never otherwise.
    /// The transfer leaves the in-flight set only after `on_complete` returned.
    pub fn submit<F>(
        &self,
        buffer: Vec<u8>,
        length: usize,
        on_complete: F,
    ) -> Result<TransferId, SubmitError>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        let id = TransferId {
            endpoint: self.endpoint.address,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        let length = length.min(buffer.len());

        let in_flight = Arc::clone(&self.in_flight);
        let transfer = Transfer {
            id,
            endpoint: self.endpoint,
            buffer,
            length,
            on_complete: Box::new(move |completion| {
                let id = completion.id;
                on_complete(completion);
                in_flight.remove(id);
            }),
        };

        self.in_flight.insert(id);
        if let Err(e) = self.transport.submit(transfer) {
            debug!("Submission of transfer {} failed: {}", id, e);
            self.in_flight.remove(id);
            return Err(e);
        }

        trace!("Submitted transfer {} ({} bytes)", id, length);
        Ok(id)
    }

    /// Number of transfers not yet completed
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight() == 0
    }

    /// Wait until every submitted transfer has completed
    pub async fn idle(&self) {
        loop {
            let notified = self.in_flight.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Wait for idleness for at most `timeout`; returns false on timeout
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.idle()).await.is_ok()
    }

    /// Cancel everything in flight and wait for the completions to run
    pub async fn kill(&self) {
        loop {
            let ids = self.in_flight.snapshot();
            if ids.is_empty() {
                return;
            }
            debug!(
                "Cancelling {} transfer(s) on endpoint {:#04x}",
                ids.len(),
                self.endpoint.address
            );
            for id in ids {
                self.transport.cancel(id);
            }
            self.idle().await;
        }
    }
}

impl fmt::Debug for TransferChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferChannel")
            .field("endpoint", &self.endpoint)
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}
