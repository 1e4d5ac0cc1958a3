//! Device session: one attached bulk endpoint pair
//!
//! A `DeviceSession` lives in an `Arc`. The registry holds one reference while
//! the device is attached, every open client handle holds one, and every
//! in-flight transfer's completion holds one. Dropping the last of them runs
//! `Drop`, which is the only place resources are released.
//!
//! Client I/O is serialized by the I/O lock. Disconnect clears the live
//! interface under that lock, so any call that gets the lock afterwards fails
//! with `DeviceGone`.

use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::interrupt::Interrupter;
use crate::latch::ErrorLatch;
use crate::power::PowerPolicy;
use crate::read::ReadSession;
use crate::throttle::WriteThrottle;
use crate::transfer::{Endpoint, TransferStatus, Transport};
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::{MutexGuard, OwnedMutexGuard};
use tracing::{debug, info, warn};

const DETACH_POLL: Duration = Duration::from_millis(50);

/// Attachment state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    Attached = 0,
    Detaching = 1,
    Detached = 2,
}

impl LinkState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LinkState::Attached,
            1 => LinkState::Detaching,
            _ => LinkState::Detached,
        }
    }
}

/// State guarded by the I/O lock
#[derive(Debug)]
pub(crate) struct IoState {
    /// Interface number while the device is attached
    interface: Option<u8>,
}

pub struct DeviceSession {
    minor: OnceLock<u32>,
    config: SessionConfig,
    power: Arc<dyn PowerPolicy>,
    io: Arc<tokio::sync::Mutex<IoState>>,
    link: AtomicU8,
    latch: ErrorLatch,
    inbound: ReadSession,
    throttle: WriteThrottle,
    open_count: AtomicUsize,
    /// I/O lock kept between pre-reset and post-reset
    reset_guard: Mutex<Option<OwnedMutexGuard<IoState>>>,
}

impl DeviceSession {
    pub fn new(
        interface: u8,
        bulk_in: Option<Endpoint>,
        bulk_out: Endpoint,
        transport: Arc<dyn Transport>,
        power: Arc<dyn PowerPolicy>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let inbound = ReadSession::new(bulk_in, Arc::clone(&transport));
        let throttle = WriteThrottle::new(
            bulk_out,
            transport,
            config.writes_in_flight,
            config.max_transfer,
        );

        Arc::new(Self {
            minor: OnceLock::new(),
            config,
            power,
            io: Arc::new(tokio::sync::Mutex::new(IoState {
                interface: Some(interface),
            })),
            link: AtomicU8::new(LinkState::Attached as u8),
            latch: ErrorLatch::new(),
            inbound,
            throttle,
            open_count: AtomicUsize::new(0),
            reset_guard: Mutex::new(None),
        })
    }

    /// Minor number, or 0 before registration
    pub fn minor(&self) -> u32 {
        self.minor.get().copied().unwrap_or(0)
    }

    pub(crate) fn assign_minor(&self, minor: u32) {
        if self.minor.set(minor).is_err() {
            warn!("Session already registered as minor {}", self.minor());
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn link_state(&self) -> LinkState {
        LinkState::from_u8(self.link.load(Ordering::Acquire))
    }

    fn set_link_state(&self, state: LinkState) {
        self.link.store(state as u8, Ordering::Release);
    }

    pub fn is_attached(&self) -> bool {
        self.link_state() == LinkState::Attached
    }

    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::Acquire)
    }

    pub fn inbound(&self) -> &ReadSession {
        &self.inbound
    }

    pub fn throttle(&self) -> &WriteThrottle {
        &self.throttle
    }

    pub fn latch(&self) -> &ErrorLatch {
        &self.latch
    }

    /// Take the I/O lock, failing with `DeviceGone` if the device left
    pub(crate) async fn lock_io(
        &self,
        interrupter: &Interrupter,
    ) -> Result<MutexGuard<'_, IoState>> {
        let io = interrupter.run(self.io.lock()).await?;
        self.ensure_live(&io)?;
        Ok(io)
    }

    pub(crate) fn ensure_live(&self, io: &IoState) -> Result<()> {
        if io.interface.is_none() || !self.is_attached() {
            return Err(SessionError::DeviceGone);
        }
        Ok(())
    }

    /// Register one more opener
    pub(crate) async fn open(self: &Arc<Self>) -> Result<()> {
        if !self.is_attached() {
            return Err(SessionError::DeviceGone);
        }

        let previous = self.open_count.fetch_add(1, Ordering::AcqRel);
        if previous > 0 && self.config.exclusive_open {
            self.open_count.fetch_sub(1, Ordering::AcqRel);
            return Err(SessionError::Busy);
        }

        if previous == 0 {
            if let Err(e) = self.power.prevent_idle_suspend() {
                self.open_count.fetch_sub(1, Ordering::AcqRel);
                warn!("Open of minor {} refused: {}", self.minor(), e);
                return Err(e);
            }

            if self.config.prime_reads {
                let io = self.io.lock().await;
                if self.ensure_live(&io).is_ok() {
                    if let Err(e) = self.inbound.prime(self) {
                        warn!("Priming read on minor {} failed: {}", self.minor(), e);
                    }
                }
            }
        }

        info!(
            "Opened minor {} ({} open handle(s))",
            self.minor(),
            previous + 1
        );
        Ok(())
    }

    /// Drop one opener; a count that is already zero is rejected
    pub(crate) fn close(&self) -> Result<()> {
        let previous = self
            .open_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_err(|_| SessionError::Closed)?;

        if previous == 1 && self.is_attached() {
            self.power.allow_idle_suspend();
        }

        debug!(
            "Closed handle on minor {} ({} left)",
            self.minor(),
            previous - 1
        );
        Ok(())
    }

    pub(crate) async fn read(
        self: &Arc<Self>,
        count: usize,
        nonblocking: bool,
        interrupter: &Interrupter,
    ) -> Result<Vec<u8>> {
        self.inbound.read(self, count, nonblocking, interrupter).await
    }

    pub(crate) async fn write(
        self: &Arc<Self>,
        data: &[u8],
        nonblocking: bool,
        interrupter: &Interrupter,
    ) -> Result<usize> {
        self.throttle
            .write(self, data, nonblocking, interrupter)
            .await
    }

    pub(crate) async fn readable(&self, interrupter: &Interrupter) -> Result<()> {
        self.inbound.readable(self, interrupter).await
    }

    /// Drain outstanding I/O and report (and clear) the latched error
    pub async fn flush(&self) -> Result<()> {
        let _io = self.io.lock().await;
        self.draw_down().await;
        match self.latch.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Wait a bounded time for writes to finish, kill stragglers, then kill
    /// the inbound transfer
    async fn draw_down(&self) {
        let timeout = self.config.draw_down_timeout();
        if !self.throttle.wait_idle(timeout).await {
            warn!(
                "Minor {}: {} write(s) still in flight after {:?}, cancelling",
                self.minor(),
                self.throttle.in_flight(),
                timeout
            );
            self.throttle.kill().await;
        }
        self.inbound.kill().await;
    }

    /// The device went away
    ///
    /// Takes over the registry's reference and releases it when done. Open
    /// handles stay valid; every operation on them now fails with
    /// `DeviceGone`.
    pub async fn disconnect(self: Arc<Self>) {
        info!("Disconnecting minor {}", self.minor());
        self.set_link_state(LinkState::Detaching);
        self.throttle.close();

        // A device reset that never finished must not keep the I/O lock
        let held = self
            .reset_guard
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(held);

        // A reader waiting for a completion holds the I/O lock; keep killing
        // the inbound transfer until the lock comes free
        let mut io = loop {
            self.inbound.kill().await;
            if let Ok(io) = tokio::time::timeout(DETACH_POLL, self.io.lock()).await {
                break io;
            }
        };
        io.interface = None;
        drop(io);

        self.inbound.kill().await;
        self.throttle.kill().await;
        self.set_link_state(LinkState::Detached);

        info!(
            "Minor {} disconnected ({} handle(s) still open)",
            self.minor(),
            self.open_count()
        );
    }

    pub async fn suspend(&self) {
        debug!("Suspending minor {}", self.minor());
        let _io = self.io.lock().await;
        self.draw_down().await;
    }

    pub async fn resume(&self) {
        debug!("Resuming minor {}", self.minor());
    }

    /// Quiesce and keep the I/O lock across the reset
    pub async fn pre_reset(&self) {
        debug!("Pre-reset of minor {}", self.minor());
        let io = Arc::clone(&self.io).lock_owned().await;
        self.draw_down().await;
        *self
            .reset_guard
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(io);
    }

    /// Report the reset to the next client call and release the I/O lock
    pub async fn post_reset(&self) {
        debug!("Post-reset of minor {}", self.minor());
        self.latch.set(TransferStatus::Stall);
        let held = self
            .reset_guard
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if held.is_none() {
            warn!("Post-reset of minor {} without pre-reset", self.minor());
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        info!("Released device session for minor {}", self.minor());
    }
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("minor", &self.minor())
            .field("link", &self.link_state())
            .field("open_count", &self.open_count())
            .field("inbound", &self.inbound.snapshot())
            .finish_non_exhaustive()
    }
}
