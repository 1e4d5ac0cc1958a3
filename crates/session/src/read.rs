//! Inbound side of a device session
//!
//! One buffer, sized to the bulk-in max packet size, is shared by every reader
//! of the session. While a transfer is in flight the buffer is lent to it and
//! comes back with the completion; `pending` is exactly "the buffer is out".
//! Readers take bytes from `buffer[consumed..filled]` and top it up with a new
//! transfer when it runs dry, so a client asking for more than one packet gets
//! what is there now plus a look-ahead transfer for the rest.

use crate::device::DeviceSession;
use crate::error::{Result, SessionError};
use crate::interrupt::Interrupter;
use crate::latch::ErrorLatch;
use crate::transfer::{Completion, Endpoint, Transport, TransferChannel};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, trace};

#[derive(Debug)]
struct InboundState {
    /// `None` while lent to an in-flight transfer
    buffer: Option<Vec<u8>>,
    capacity: usize,
    filled: usize,
    consumed: usize,
    pending: bool,
    /// The last completion has been seen by a reader
    processed: bool,
}

/// Point-in-time view of the inbound buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundSnapshot {
    pub capacity: usize,
    pub filled: usize,
    pub consumed: usize,
    pub pending: bool,
    pub processed: bool,
}

#[derive(Debug)]
pub struct ReadSession {
    channel: Option<TransferChannel>,
    state: Mutex<InboundState>,
    completion: Notify,
}

impl ReadSession {
    pub(crate) fn new(endpoint: Option<Endpoint>, transport: Arc<dyn Transport>) -> Self {
        let capacity = endpoint.map(|e| e.max_packet_size).unwrap_or(0);
        Self {
            channel: endpoint.map(|e| TransferChannel::new(e, transport)),
            state: Mutex::new(InboundState {
                buffer: Some(vec![0; capacity]),
                capacity,
                filled: 0,
                consumed: 0,
                pending: false,
                processed: true,
            }),
            completion: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, InboundState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> InboundSnapshot {
        let state = self.state();
        InboundSnapshot {
            capacity: state.capacity,
            filled: state.filled,
            consumed: state.consumed,
            pending: state.pending,
            processed: state.processed,
        }
    }

    pub fn has_channel(&self) -> bool {
        self.channel.is_some()
    }

    fn is_pending(&self) -> bool {
        self.state().pending
    }

    /// Wait until no inbound transfer is in flight
    async fn completed(&self) {
        loop {
            let notified = self.completion.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_pending() {
                return;
            }
            notified.await;
        }
    }

    /// Take ownership of the latest completion
    fn observe(&self) {
        let mut state = self.state();
        state.consumed = 0;
        state.processed = true;
    }

    /// Read up to `count` bytes
    ///
    /// The caller has checked nothing; this takes the session's I/O lock and
    /// holds it for the whole call, including completion waits.
    pub(crate) async fn read(
        &self,
        owner: &Arc<DeviceSession>,
        count: usize,
        nonblocking: bool,
        interrupter: &Interrupter,
    ) -> Result<Vec<u8>> {
        if self.channel.is_none() || count == 0 {
            return Ok(Vec::new());
        }

        let io = owner.lock_io(interrupter).await?;

        loop {
            if self.is_pending() {
                if nonblocking {
                    return Err(SessionError::WouldBlock);
                }
                interrupter.run(self.completed()).await?;
                self.observe();
            }

            if !self.state().processed {
                // A completion landed that no reader has looked at yet
                self.completed().await;
                self.observe();
            }

            owner.ensure_live(&io)?;

            if let Some(err) = owner.latch().take() {
                self.state().filled = 0;
                debug!("Read on minor {} reports {}", owner.minor(), err);
                return Err(err);
            }

            let mut state = self.state();
            if state.filled > 0 {
                let available = state.filled - state.consumed;
                if available == 0 {
                    drop(state);
                    self.submit(owner, count)?;
                    continue;
                }

                let chunk = available.min(count);
                let start = state.consumed;
                let data = match state.buffer.as_ref() {
                    Some(buffer) => buffer[start..start + chunk].to_vec(),
                    None => return Err(SessionError::Io),
                };
                state.consumed += chunk;
                drop(state);

                trace!(
                    "Read {} of {} requested bytes on minor {}",
                    chunk,
                    count,
                    owner.minor()
                );

                if available < count {
                    if let Err(e) = self.submit(owner, count - chunk) {
                        debug!("Look-ahead read on minor {} failed: {}", owner.minor(), e);
                    }
                }
                return Ok(data);
            }
            drop(state);

            self.submit(owner, count)?;
            if nonblocking {
                return Err(SessionError::WouldBlock);
            }
        }
    }

    /// Wait until a read would not have to wait for the in-flight transfer
    pub(crate) async fn readable(
        &self,
        owner: &DeviceSession,
        interrupter: &Interrupter,
    ) -> Result<()> {
        if self.channel.is_none() {
            return Ok(());
        }
        interrupter.run(self.completed()).await?;
        if !owner.is_attached() {
            return Err(SessionError::DeviceGone);
        }
        Ok(())
    }

    /// Submit an inbound transfer for `count` bytes, capped at the capacity
    fn submit(&self, owner: &Arc<DeviceSession>, count: usize) -> Result<()> {
        let Some(channel) = self.channel.as_ref() else {
            return Ok(());
        };

        let mut state = self.state();
        let Some(buffer) = state.buffer.take() else {
            // Already in flight
            return Ok(());
        };
        let length = count.min(state.capacity);
        state.pending = true;
        state.processed = false;
        drop(state);

        let session = Arc::clone(owner);
        let submitted = channel.submit(buffer, length, move |completion| {
            session.inbound().complete(completion, session.latch());
        });

        match submitted {
            Ok(id) => {
                debug!(
                    "Submitted read {} ({} bytes) on minor {}",
                    id,
                    length,
                    owner.minor()
                );
                Ok(())
            }
            Err(e) => {
                let mut state = self.state();
                state.buffer = Some(vec![0; state.capacity]);
                state.filled = 0;
                state.consumed = 0;
                state.pending = false;
                state.processed = true;
                drop(state);
                self.completion.notify_waiters();
                Err(e.into())
            }
        }
    }

    /// Start a read of a full packet if the channel is idle and drained
    pub(crate) fn prime(&self, owner: &Arc<DeviceSession>) -> Result<()> {
        let capacity = {
            let state = self.state();
            if state.pending || state.filled > state.consumed {
                return Ok(());
            }
            state.capacity
        };
        self.submit(owner, capacity)
    }

    /// Completion path; runs on the transport's thread
    pub(crate) fn complete(&self, completion: Completion, latch: &ErrorLatch) {
        latch.record(completion.status);

        let mut state = self.state();
        state.filled = if completion.status.is_success() {
            completion.actual_length.min(state.capacity)
        } else {
            0
        };
        state.consumed = 0;
        state.buffer = Some(completion.buffer);
        state.pending = false;
        drop(state);

        self.completion.notify_waiters();
    }

    /// Cancel the in-flight read, if any, and wait for its completion
    pub(crate) async fn kill(&self) {
        if let Some(channel) = &self.channel {
            channel.kill().await;
        }
    }
}


/// Property-based tests using proptest
#[cfg(test)]
mod proptests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::mock::{MockPower, MockTransport};
    use crate::transfer::Direction;
    use proptest::prelude::*;

    const CAPACITY: usize = 64;

    fn packet_sizes() -> impl Strategy<Value = Vec<usize>> {
        proptest::collection::vec(1usize..=CAPACITY, 1..24)
    }

    fn read_counts() -> impl Strategy<Value = Vec<usize>> {
        proptest::collection::vec(1usize..=160, 1..48)
    }

    proptest! {
        /// Property: bytes come out in order, none lost or duplicated, and
        /// the buffer offsets stay ordered after every call
        #[test]
        fn prop_stitching_conserves_bytes(sizes in packet_sizes(), counts in read_counts()) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            runtime.block_on(async {
                let transport = MockTransport::new();
                let session = DeviceSession::new(
                    0,
                    Some(Endpoint::new(0x81, CAPACITY)),
                    Endpoint::new(0x02, 64),
                    transport.clone(),
                    MockPower::new(),
                    SessionConfig::default(),
                );
                let interrupter = Interrupter::new();
                let mut sizes = sizes.into_iter();
                let mut delivered: Vec<u8> = Vec::new();
                let mut received: Vec<u8> = Vec::new();

                'reads: for count in counts {
                    for _ in 0..4 {
                        match session.inbound().read(&session, count, true, &interrupter).await {
                            Ok(data) => {
                                prop_assert!(!data.is_empty());
                                prop_assert!(data.len() <= count);
                                received.extend_from_slice(&data);
                                break;
                            }
                            Err(SessionError::WouldBlock) => {
                                let Some(size) = sizes.next() else {
                                    break 'reads;
                                };
                                let limit = transport.pending_length(Direction::In).unwrap_or(0);
                                let packet: Vec<u8> = (0..size.min(limit))
                                    .map(|i| ((delivered.len() + i) % 251) as u8)
                                    .collect();
                                prop_assert!(transport.complete_in(&packet));
                                delivered.extend_from_slice(&packet);
                            }
                            Err(e) => return Err(TestCaseError::fail(format!("read failed: {e}"))),
                        }

                        let snapshot = session.inbound().snapshot();
                        prop_assert!(snapshot.consumed <= snapshot.filled);
                        prop_assert!(snapshot.filled <= snapshot.capacity);
                    }

                    let snapshot = session.inbound().snapshot();
                    prop_assert!(snapshot.consumed <= snapshot.filled);
                    prop_assert!(snapshot.filled <= snapshot.capacity);
                    prop_assert_eq!(
                        delivered.len(),
                        received.len() + snapshot.filled - snapshot.consumed
                    );
                }

                prop_assert_eq!(&received[..], &delivered[..received.len()]);
                Ok(())
            })?;
        }
    }
}
