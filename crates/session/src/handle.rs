//! Client handles

use crate::device::DeviceSession;
use crate::error::{Result, SessionError};
use crate::interrupt::Interrupter;
use std::sync::Arc;
use tracing::debug;

/// One open client of a device session
///
/// Holds a reference to the session until closed. Blocking calls can be
/// broken from another task through [`ClientHandle::interrupter`].
#[derive(Debug)]
pub struct ClientHandle {
    session: Option<Arc<DeviceSession>>,
    minor: u32,
    nonblocking: bool,
    interrupter: Interrupter,
}

impl ClientHandle {
    pub(crate) fn new(session: Arc<DeviceSession>, nonblocking: bool) -> Self {
        Self {
            minor: session.minor(),
            session: Some(session),
            nonblocking,
            interrupter: Interrupter::new(),
        }
    }

    fn session(&self) -> Result<&Arc<DeviceSession>> {
        self.session.as_ref().ok_or(SessionError::Closed)
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking
    }

    pub fn set_nonblocking(&mut self, nonblocking: bool) {
        self.nonblocking = nonblocking;
    }

    /// A clone that interrupts this handle's blocking waits
    pub fn interrupter(&self) -> Interrupter {
        self.interrupter.clone()
    }

    /// The session behind this handle, while open
    pub fn device(&self) -> Option<&Arc<DeviceSession>> {
        self.session.as_ref()
    }

    /// Read up to `max_len` bytes
    pub async fn read(&self, max_len: usize) -> Result<Vec<u8>> {
        self.session()?
            .read(max_len, self.nonblocking, &self.interrupter)
            .await
    }

    /// Queue one write; returns how many bytes were accepted
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        self.session()?
            .write(data, self.nonblocking, &self.interrupter)
            .await
    }

    /// Queue all of `data`, one capped write at a time
    pub async fn write_all(&self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let n = self.write(data).await?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Wait for outstanding transfers and report any latched error
    pub async fn flush(&self) -> Result<()> {
        self.session()?.flush().await
    }

    /// Wait until a read would find data (or an error) without blocking on
    /// the in-flight transfer
    pub async fn readable(&self) -> Result<()> {
        self.session()?.readable(&self.interrupter).await
    }

    /// Release this handle's reference; a second close fails with `Closed`
    pub fn close(&mut self) -> Result<()> {
        let session = self.session.take().ok_or(SessionError::Closed)?;
        debug!("Closing handle on minor {}", self.minor);
        session.close()
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        if self.is_open() {
            let _ = self.close();
        }
    }
}
