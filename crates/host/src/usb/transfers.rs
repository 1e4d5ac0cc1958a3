//! rusb-backed bulk transport
//!
//! Each claimed interface gets one worker thread per direction. Transfers are
//! queued to the worker, which runs them one at a time with the synchronous
//! rusb calls and completes them on its own thread. Bulk IN reads are split
//! into short polls so a cancel request is seen within one poll timeout.

use async_channel::{Receiver, Sender, unbounded};
use rusb::{Context, DeviceHandle};
use session::{Direction, SubmitError, Transfer, TransferId, TransferStatus, Transport};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Timeouts applied by the transfer workers
#[derive(Debug, Clone, Copy)]
pub struct TransferTimeouts {
    pub poll: Duration,
    pub write: Duration,
}

/// Transfers queued or running, and the cancels requested for them
///
/// Both sets live under one lock so a cancel can never land after the
/// transfer it names has finished.
#[derive(Debug, Default)]
struct TransferBook {
    live: HashSet<TransferId>,
    cancelled: HashSet<TransferId>,
}

impl TransferBook {
    fn track(&mut self, id: TransferId) {
        self.live.insert(id);
    }

    /// Forget a transfer that finished or was never queued
    fn untrack(&mut self, id: TransferId) {
        self.live.remove(&id);
        self.cancelled.remove(&id);
    }

    /// Record a cancel; ignored unless `id` is still queued or running
    fn request_cancel(&mut self, id: TransferId) -> bool {
        self.live.contains(&id) && self.cancelled.insert(id)
    }

    fn take_cancel(&mut self, id: TransferId) -> bool {
        self.cancelled.remove(&id)
    }
}

/// State shared by the transport and its workers
struct Shared {
    handle: DeviceHandle<Context>,
    book: Mutex<TransferBook>,
    closed: AtomicBool,
    timeouts: TransferTimeouts,
}

impl Shared {
    fn book(&self) -> MutexGuard<'_, TransferBook> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Consume a pending cancel request for `id`
    fn take_cancel(&self, id: TransferId) -> bool {
        self.book().take_cancel(id)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

pub struct RusbTransport {
    shared: Arc<Shared>,
    inbound: Sender<Transfer>,
    outbound: Sender<Transfer>,
}

impl RusbTransport {
    /// Start the transfer workers for an opened device with a claimed
    /// interface
    pub fn new(
        handle: DeviceHandle<Context>,
        name: &str,
        timeouts: TransferTimeouts,
    ) -> std::io::Result<Arc<Self>> {
        let shared = Arc::new(Shared {
            handle,
            book: Mutex::new(TransferBook::default()),
            closed: AtomicBool::new(false),
            timeouts,
        });

        let (inbound, inbound_rx) = unbounded();
        let (outbound, outbound_rx) = unbounded();

        // Workers are detached: the last reference to the transport may be
        // dropped on one of them
        spawn_worker(format!("{}-in", name), Arc::clone(&shared), inbound_rx)?;
        spawn_worker(format!("{}-out", name), Arc::clone(&shared), outbound_rx)?;

        Ok(Arc::new(Self {
            shared,
            inbound,
            outbound,
        }))
    }
}

impl Transport for RusbTransport {
    fn submit(&self, transfer: Transfer) -> Result<(), SubmitError> {
        if self.shared.is_closed() {
            return Err(SubmitError::NoDevice);
        }

        let queue = match transfer.direction() {
            Direction::In => &self.inbound,
            Direction::Out => &self.outbound,
        };
        let id = transfer.id();
        self.shared.book().track(id);
        queue.try_send(transfer).map_err(|e| {
            debug!("Transfer queue closed: {}", e);
            self.shared.book().untrack(id);
            SubmitError::NoDevice
        })
    }

    fn cancel(&self, id: TransferId) {
        if self.shared.book().request_cancel(id) {
            trace!("Cancel requested for transfer {}", id);
        }
    }
}

impl Drop for RusbTransport {
    fn drop(&mut self) {
        // Queued transfers still complete, with Shutdown
        self.shared.closed.store(true, Ordering::Release);
        self.inbound.close();
        self.outbound.close();
    }
}

fn spawn_worker(
    name: String,
    shared: Arc<Shared>,
    queue: Receiver<Transfer>,
) -> std::io::Result<()> {
    thread::Builder::new().name(name).spawn(move || {
        while let Ok(transfer) = queue.recv_blocking() {
            execute(&shared, transfer);
        }
        trace!("Transfer worker exiting");
    })?;
    Ok(())
}

/// Run one transfer to completion
fn execute(shared: &Shared, mut transfer: Transfer) {
    let id = transfer.id();
    if shared.take_cancel(id) {
        shared.book().untrack(id);
        transfer.complete(TransferStatus::Cancelled, 0);
        return;
    }
    if shared.is_closed() {
        shared.book().untrack(id);
        transfer.complete(TransferStatus::Shutdown, 0);
        return;
    }

    let address = transfer.endpoint().address;
    let (status, actual) = match transfer.direction() {
        Direction::In => loop {
            match shared
                .handle
                .read_bulk(address, transfer.data_mut(), shared.timeouts.poll)
            {
                Ok(n) => break (TransferStatus::Completed, n),
                Err(rusb::Error::Timeout) => {
                    if shared.take_cancel(id) {
                        break (TransferStatus::Cancelled, 0);
                    }
                    if shared.is_closed() {
                        break (TransferStatus::Shutdown, 0);
                    }
                }
                Err(e) => break (map_rusb_error(e), 0),
            }
        },
        Direction::Out => {
            match shared
                .handle
                .write_bulk(address, transfer.data(), shared.timeouts.write)
            {
                Ok(n) => (TransferStatus::Completed, n),
                Err(e) => (map_rusb_error(e), 0),
            }
        }
    };

    if !status.is_success() && !status.is_benign() {
        warn!("Bulk transfer {} failed: {:?}", id, status);
    }
    // Also drops a cancel that raced with completion
    shared.book().untrack(id);
    transfer.complete(status, actual);
}

/// Map rusb::Error to a transfer status
pub fn map_rusb_error(err: rusb::Error) -> TransferStatus {
    match err {
        rusb::Error::Timeout => TransferStatus::Timeout,
        rusb::Error::Pipe => TransferStatus::Stall,
        rusb::Error::Overflow => TransferStatus::Overflow,
        rusb::Error::Io => TransferStatus::Io,
        // The device is gone; hot-plug will report the detach
        rusb::Error::NoDevice => TransferStatus::Shutdown,
        rusb::Error::Interrupted => TransferStatus::ConnectionReset,
        _ => TransferStatus::Other,
    }
}
