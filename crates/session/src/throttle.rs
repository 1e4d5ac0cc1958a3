//! Outbound side of a device session
//!
//! Writes are fire-and-forget: the data is copied into a fresh transfer
//! buffer, submitted, and the call returns. A counting semaphore bounds the
//! number of outbound transfers in flight, which bounds the memory they pin.
//! Each transfer's completion owns its throttle slot and gives it back.

use crate::device::DeviceSession;
use crate::error::{Result, SessionError};
use crate::interrupt::Interrupter;
use crate::transfer::{Endpoint, Transport, TransferChannel};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, warn};

#[derive(Debug)]
pub struct WriteThrottle {
    slots: Arc<Semaphore>,
    limit: usize,
    max_transfer: usize,
    channel: TransferChannel,
}

impl WriteThrottle {
    pub(crate) fn new(
        endpoint: Endpoint,
        transport: Arc<dyn Transport>,
        limit: usize,
        max_transfer: usize,
    ) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(limit)),
            limit,
            max_transfer,
            channel: TransferChannel::new(endpoint, transport),
        }
    }

    /// Maximum outbound transfers in flight
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Slots not currently held by a write
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.channel.in_flight()
    }

    pub fn max_transfer(&self) -> usize {
        self.max_transfer
    }

    async fn acquire(
        &self,
        nonblocking: bool,
        interrupter: &Interrupter,
    ) -> Result<OwnedSemaphorePermit> {
        if nonblocking {
            return Arc::clone(&self.slots)
                .try_acquire_owned()
                .map_err(|e| match e {
                    TryAcquireError::NoPermits => SessionError::WouldBlock,
                    TryAcquireError::Closed => SessionError::DeviceGone,
                });
        }

        interrupter
            .run(Arc::clone(&self.slots).acquire_owned())
            .await?
            .map_err(|_| SessionError::DeviceGone)
    }

    /// Queue up to `max_transfer` bytes of `data`; returns the accepted count
    pub(crate) async fn write(
        &self,
        owner: &Arc<DeviceSession>,
        data: &[u8],
        nonblocking: bool,
        interrupter: &Interrupter,
    ) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let writesize = data.len().min(self.max_transfer);

        let permit = self.acquire(nonblocking, interrupter).await?;

        if let Some(err) = owner.latch().take() {
            debug!("Write on minor {} reports {}", owner.minor(), err);
            return Err(err);
        }

        let buffer = data[..writesize].to_vec();

        let io = owner.lock_io(interrupter).await?;
        let session = Arc::clone(owner);
        let id = self
            .channel
            .submit(buffer, writesize, move |completion| {
                session.latch().record(completion.status);
                drop(permit);
            })
            .map_err(|e| {
                warn!("Failed to submit write on minor {}: {}", owner.minor(), e);
                SessionError::from(e)
            })?;
        drop(io);

        debug!(
            "Submitted write {} ({} of {} bytes) on minor {}",
            id,
            writesize,
            data.len(),
            owner.minor()
        );
        Ok(writesize)
    }

    /// Wake blocked writers with `DeviceGone`; used on disconnect
    pub(crate) fn close(&self) {
        self.slots.close();
    }

    pub(crate) async fn wait_idle(&self, timeout: Duration) -> bool {
        self.channel.wait_idle(timeout).await
    }

    pub(crate) async fn kill(&self) {
        self.channel.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::mock::{MockPower, MockTransport};
    use crate::transfer::{Direction, TransferStatus};

    fn session(transport: &Arc<MockTransport>, config: SessionConfig) -> Arc<DeviceSession> {
        DeviceSession::new(
            0,
            Some(Endpoint::new(0x81, 64)),
            Endpoint::new(0x02, 64),
            transport.clone(),
            MockPower::new(),
            config,
        )
    }

    #[tokio::test]
    async fn test_empty_write_accepts_nothing() {
        let transport = MockTransport::new();
        let session = session(&transport, SessionConfig::default());
        let interrupter = Interrupter::new();

        let n = session
            .throttle()
            .write(&session, &[], false, &interrupter)
            .await
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(transport.submitted(Direction::Out), 0);
    }

    #[tokio::test]
    async fn test_completion_releases_slot() {
        let transport = MockTransport::new();
        let config = SessionConfig {
            writes_in_flight: 2,
            ..Default::default()
        };
        let session = session(&transport, config);
        let interrupter = Interrupter::new();
        let throttle = session.throttle();

        throttle.write(&session, b"a", true, &interrupter).await.unwrap();
        throttle.write(&session, b"b", true, &interrupter).await.unwrap();
        assert_eq!(throttle.available_slots(), 0);
        assert_eq!(
            throttle.write(&session, b"c", true, &interrupter).await,
            Err(SessionError::WouldBlock)
        );

        transport.complete_out(TransferStatus::Completed);
        assert_eq!(throttle.available_slots(), 1);
        assert_eq!(throttle.write(&session, b"c", true, &interrupter).await, Ok(1));
    }

    #[tokio::test]
    async fn test_failed_write_surfaces_on_next_write() {
        let transport = MockTransport::new();
        let session = session(&transport, SessionConfig::default());
        let interrupter = Interrupter::new();
        let throttle = session.throttle();

        throttle.write(&session, b"data", false, &interrupter).await.unwrap();
        transport.complete_out(TransferStatus::Io);

        assert_eq!(
            throttle.write(&session, b"more", false, &interrupter).await,
            Err(SessionError::Io)
        );
        // The failed attempt gave its slot back and the latch is clear
        assert_eq!(throttle.available_slots(), throttle.limit());
        assert_eq!(throttle.write(&session, b"more", false, &interrupter).await, Ok(4));
    }

    #[tokio::test]
    async fn test_submit_failure_releases_slot() {
        let transport = MockTransport::new();
        let session = session(&transport, SessionConfig::default());
        let interrupter = Interrupter::new();
        let throttle = session.throttle();

        transport.fail_next_submit(crate::transfer::SubmitError::NoMemory);
        assert_eq!(
            throttle.write(&session, b"data", false, &interrupter).await,
            Err(SessionError::ResourceExhausted)
        );
        assert_eq!(throttle.available_slots(), throttle.limit());
        assert_eq!(throttle.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_blocked_writer_can_be_interrupted() {
        let transport = MockTransport::new();
        let config = SessionConfig {
            writes_in_flight: 1,
            ..Default::default()
        };
        let session = session(&transport, config);
        let interrupter = Interrupter::new();

        session
            .throttle()
            .write(&session, b"x", false, &interrupter)
            .await
            .unwrap();

        let blocked = {
            let session = Arc::clone(&session);
            let interrupter = interrupter.clone();
            tokio::spawn(async move {
                session
                    .throttle()
                    .write(&session, b"y", false, &interrupter)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        interrupter.interrupt();

        let result = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(SessionError::Interrupted));
        assert_eq!(transport.submitted(Direction::Out), 1);
    }
}
