//! Interruption of blocking waits
//!
//! Each client handle carries an [`Interrupter`]. Any clone of it can be used
//! from another task to break the handle out of a blocking wait, which then
//! fails with [`SessionError::Interrupted`]. An interrupt raised while nothing
//! is waiting stays pending until the next wait consumes it.

use crate::error::{Result, SessionError};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    pending: AtomicBool,
    notify: Notify,
}

#[derive(Debug, Clone, Default)]
pub struct Interrupter {
    inner: Arc<Inner>,
}

impl Interrupter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interrupt the current (or next) blocking wait
    pub fn interrupt(&self) {
        self.inner.pending.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_pending(&self) -> bool {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Drop a pending interrupt without delivering it
    pub fn clear(&self) {
        self.inner.pending.store(false, Ordering::Release);
    }

    /// Resolves once an interrupt is delivered, consuming it
    pub async fn interrupted(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.pending.swap(false, Ordering::AcqRel) {
                return;
            }
            notified.await;
        }
    }

    /// Drive `fut` unless an interrupt arrives first
    ///
    /// A future that is ready immediately wins over a pending interrupt, which
    /// then stays pending.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output> {
        tokio::select! {
            biased;
            out = fut => Ok(out),
            _ = self.interrupted() => Err(SessionError::Interrupted),
        }
    }
}
