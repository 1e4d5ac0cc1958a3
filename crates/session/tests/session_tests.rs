//! Session integration tests
//!
//! Drives the driver and client handles end to end against the mock
//! transport:
//! - Read stitching across calls and handles
//! - Write throttling and capping
//! - Handle lifecycle and session release
//! - Disconnect, suspend and reset while clients are active
//!
//! Run with: `cargo test -p session --test session_tests`

use session::mock::{MockPower, MockTransport};
use session::{
    ClientHandle, Direction, Driver, EndpointDescriptor, InterfaceDescriptor, MAX_TRANSFER,
    OpenFlags, SessionConfig, SessionError, TransferKind, TransferStatus,
};
use std::sync::Arc;
use std::time::Duration;

const TEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Route session logs to the test harness; `RUST_LOG=debug` shows them
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Helpers
// ============================================================================

fn interface(max_packet_size: u16) -> InterfaceDescriptor {
    let bulk = |address| EndpointDescriptor {
        address,
        kind: TransferKind::Bulk,
        max_packet_size,
    };
    InterfaceDescriptor {
        number: 0,
        endpoints: vec![bulk(0x81), bulk(0x02)],
    }
}

struct Rig {
    driver: Driver,
    transport: Arc<MockTransport>,
    power: Arc<MockPower>,
    minor: u32,
}

impl Rig {
    fn new(config: SessionConfig) -> Self {
        init_tracing();
        let power = MockPower::new();
        let transport = MockTransport::new();
        let driver = Driver::new(config, power.clone());
        let minor = driver.on_attach(&interface(64), transport.clone()).unwrap();
        Self {
            driver,
            transport,
            power,
            minor,
        }
    }

    async fn open(&self, nonblocking: bool) -> ClientHandle {
        self.driver
            .open(self.minor, OpenFlags { nonblocking })
            .await
            .unwrap()
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| i as u8).collect()
}

// ============================================================================
// Reads
// ============================================================================

mod reads {
    use super::*;

    #[tokio::test]
    async fn test_primed_packet_is_stitched_across_reads() {
        let rig = Rig::new(SessionConfig {
            prime_reads: true,
            ..Default::default()
        });
        let handle = rig.open(false).await;
        assert_eq!(rig.transport.pending_length(Direction::In), Some(64));

        let packet = pattern(64);
        assert!(rig.transport.complete_in(&packet));

        let first = handle.read(40).await.unwrap();
        assert_eq!(first, &packet[..40]);
        // Enough was buffered; no new transfer
        assert_eq!(rig.transport.submitted(Direction::In), 1);

        let second = handle.read(40).await.unwrap();
        assert_eq!(second, &packet[40..]);
        // The rest of the request is fetched ahead
        assert_eq!(rig.transport.submitted(Direction::In), 2);
        assert_eq!(rig.transport.pending_length(Direction::In), Some(16));

        let snapshot = handle.device().unwrap().inbound().snapshot();
        assert_eq!(snapshot.filled, 64);
        assert_eq!(snapshot.consumed, 64);
        assert!(snapshot.pending);
    }

    #[tokio::test]
    async fn test_blocking_read_waits_for_data() {
        let rig = Rig::new(SessionConfig::default());
        let handle = rig.open(false).await;

        let reader = tokio::spawn(async move { handle.read(32).await });
        assert!(rig.transport.wait_for_pending(Direction::In, 1).await);
        assert!(rig.transport.complete_in(b"payload"));

        let data = tokio::time::timeout(TEST_TIMEOUT, reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(data, b"payload");
    }

    #[tokio::test]
    async fn test_zero_length_read_submits_nothing() {
        let rig = Rig::new(SessionConfig::default());
        let handle = rig.open(false).await;

        assert_eq!(handle.read(0).await, Ok(Vec::new()));
        assert_eq!(rig.transport.submitted(Direction::In), 0);
    }

    #[tokio::test]
    async fn test_handles_share_the_inbound_buffer() {
        let rig = Rig::new(SessionConfig::default());
        let a = rig.open(true).await;
        let b = rig.open(true).await;

        assert_eq!(a.read(64).await, Err(SessionError::WouldBlock));
        assert!(rig.transport.complete_in(b"abcdef"));

        assert_eq!(b.read(2).await.unwrap(), b"ab");
        assert_eq!(a.read(2).await.unwrap(), b"cd");
        assert_eq!(b.read(8).await.unwrap(), b"ef");
    }

    #[tokio::test]
    async fn test_blocking_read_can_be_interrupted() {
        let rig = Rig::new(SessionConfig::default());
        let handle = rig.open(false).await;
        let interrupter = handle.interrupter();

        let reader = tokio::spawn(async move { handle.read(32).await });
        assert!(rig.transport.wait_for_pending(Direction::In, 1).await);
        interrupter.interrupt();

        let result = tokio::time::timeout(TEST_TIMEOUT, reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(SessionError::Interrupted));
        // The transfer stays in flight for the next reader
        assert_eq!(rig.transport.pending(Direction::In), 1);
    }

    #[tokio::test]
    async fn test_failed_read_reported_once() {
        let rig = Rig::new(SessionConfig::default());
        let handle = rig.open(true).await;

        assert_eq!(handle.read(8).await, Err(SessionError::WouldBlock));
        assert!(rig.transport.fail_in(TransferStatus::Overflow));

        assert_eq!(handle.read(8).await, Err(SessionError::Io));
        assert_eq!(handle.read(8).await, Err(SessionError::WouldBlock));
    }
}

// ============================================================================
// Writes
// ============================================================================

mod writes {
    use super::*;

    #[tokio::test]
    async fn test_ninth_nonblocking_write_would_block() {
        let rig = Rig::new(SessionConfig::default());
        let handle = rig.open(true).await;

        let mut would_block = 0;
        for i in 0..9u8 {
            match handle.write(&[i; 16]).await {
                Ok(n) => assert_eq!(n, 16),
                Err(SessionError::WouldBlock) => would_block += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(would_block, 1);
        assert_eq!(rig.transport.pending(Direction::Out), 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_nonblocking_writes_one_would_block() {
        let rig = Rig::new(SessionConfig::default());
        let barrier = Arc::new(tokio::sync::Barrier::new(9));

        let mut writers = Vec::new();
        for i in 0..9u8 {
            let handle = rig.open(true).await;
            let barrier = Arc::clone(&barrier);
            writers.push(tokio::spawn(async move {
                barrier.wait().await;
                handle.write(&[i; 16]).await
            }));
        }

        let mut accepted = 0;
        let mut would_block = 0;
        for writer in writers {
            match tokio::time::timeout(TEST_TIMEOUT, writer).await.unwrap().unwrap() {
                Ok(n) => {
                    assert_eq!(n, 16);
                    accepted += 1;
                }
                Err(SessionError::WouldBlock) => would_block += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(accepted, 8);
        assert_eq!(would_block, 1);
        assert_eq!(rig.transport.submitted(Direction::Out), 8);
    }

    #[tokio::test]
    async fn test_write_proceeds_while_reader_waits_for_data() {
        let rig = Rig::new(SessionConfig::default());
        rig.transport.set_auto_complete_out(true);
        let reader = Arc::new(rig.open(true).await);
        let writer = rig.open(false).await;

        // Nothing inbound yet: the reader submits and parks in readable()
        assert_eq!(reader.read(512).await, Err(SessionError::WouldBlock));
        let waiting = {
            let reader = Arc::clone(&reader);
            tokio::spawn(async move { reader.readable().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiting.is_finished());

        let written = tokio::time::timeout(TEST_TIMEOUT, writer.write(b"ping"))
            .await
            .unwrap();
        assert_eq!(written, Ok(4));
        assert_eq!(rig.transport.written(), b"ping");
        assert!(!waiting.is_finished());

        assert!(rig.transport.complete_in(b"pong"));
        tokio::time::timeout(TEST_TIMEOUT, waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reader.read(512).await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn test_write_is_capped() {
        let rig = Rig::new(SessionConfig::default());
        let handle = rig.open(false).await;

        let data = pattern(5000);
        assert_eq!(handle.write(&data).await, Ok(MAX_TRANSFER));
        assert_eq!(MAX_TRANSFER, 3584);
        assert_eq!(rig.transport.last_length(Direction::Out), Some(3584));
        assert_eq!(rig.transport.written(), &data[..3584]);
    }

    #[tokio::test]
    async fn test_blocked_writer_resumes_when_slot_frees() {
        let rig = Rig::new(SessionConfig {
            writes_in_flight: 1,
            ..Default::default()
        });
        let handle = Arc::new(rig.open(false).await);

        handle.write(b"first").await.unwrap();
        let writer = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.write(b"second").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!writer.is_finished());

        assert!(rig.transport.complete_out(TransferStatus::Completed));
        let result = tokio::time::timeout(TEST_TIMEOUT, writer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Ok(6));
        assert_eq!(rig.transport.written(), b"firstsecond");
    }

    #[tokio::test]
    async fn test_stall_surfaces_on_next_write() {
        let rig = Rig::new(SessionConfig::default());
        let handle = rig.open(false).await;

        handle.write(b"x").await.unwrap();
        assert!(rig.transport.complete_out(TransferStatus::Stall));

        assert_eq!(handle.write(b"y").await, Err(SessionError::PipeStall));
        assert_eq!(handle.write(b"y").await, Ok(1));
    }

    #[tokio::test]
    async fn test_flush_reports_latched_error() {
        let rig = Rig::new(SessionConfig::default());
        let handle = rig.open(false).await;

        handle.write(b"x").await.unwrap();
        assert!(rig.transport.complete_out(TransferStatus::Timeout));
        assert_eq!(handle.flush().await, Err(SessionError::Io));
        assert_eq!(handle.flush().await, Ok(()));
    }

    #[tokio::test]
    async fn test_flush_kills_stuck_writes() {
        let rig = Rig::new(SessionConfig {
            draw_down_timeout_ms: 20,
            ..Default::default()
        });
        let handle = rig.open(false).await;

        handle.write(b"stuck").await.unwrap();
        assert_eq!(handle.flush().await, Ok(()));
        assert_eq!(rig.transport.cancelled().len(), 1);
        let device = handle.device().unwrap();
        assert_eq!(device.throttle().available_slots(), device.throttle().limit());
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_second_close_fails() {
        let rig = Rig::new(SessionConfig::default());
        let mut handle = rig.open(false).await;

        assert_eq!(handle.close(), Ok(()));
        assert_eq!(handle.close(), Err(SessionError::Closed));
        assert_eq!(rig.power.prevented(), 1);
        assert_eq!(rig.power.allowed(), 1);
    }

    #[tokio::test]
    async fn test_exclusive_open_rejects_second_client() {
        let rig = Rig::new(SessionConfig {
            exclusive_open: true,
            ..Default::default()
        });
        let mut first = rig.open(false).await;

        assert!(matches!(
            rig.driver.open(rig.minor, OpenFlags::default()).await,
            Err(SessionError::Busy)
        ));

        first.close().unwrap();
        assert!(rig.driver.open(rig.minor, OpenFlags::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_session_released_after_last_reference() {
        let rig = Rig::new(SessionConfig::default());
        let mut handle = rig.open(false).await;
        let weak = Arc::downgrade(handle.device().unwrap());

        handle.write(b"in flight").await.unwrap();
        handle.close().unwrap();
        drop(rig.driver.registry().unregister(rig.minor));

        // The pending completion still holds a reference
        assert!(weak.upgrade().is_some());

        assert!(rig.transport.complete_out(TransferStatus::Completed));
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn test_disconnect_wakes_blocked_reader() {
        let rig = Rig::new(SessionConfig::default());
        let handle = rig.open(false).await;
        let weak = Arc::downgrade(handle.device().unwrap());

        let reader = tokio::spawn(async move {
            let result = handle.read(64).await;
            (result, handle)
        });
        assert!(rig.transport.wait_for_pending(Direction::In, 1).await);

        tokio::time::timeout(TEST_TIMEOUT, rig.driver.on_detach(rig.minor))
            .await
            .unwrap()
            .unwrap();

        let (result, mut handle) = tokio::time::timeout(TEST_TIMEOUT, reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(SessionError::DeviceGone));
        assert_eq!(handle.write(b"x").await, Err(SessionError::DeviceGone));

        // Only the handle keeps the session now
        assert!(weak.upgrade().is_some());
        handle.close().unwrap();
        assert!(weak.upgrade().is_none());
        assert!(
            rig.driver
                .open(rig.minor, OpenFlags::default())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_disconnect_wakes_blocked_writer() {
        let rig = Rig::new(SessionConfig {
            writes_in_flight: 1,
            ..Default::default()
        });
        let handle = Arc::new(rig.open(false).await);
        handle.write(b"a").await.unwrap();

        let writer = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.write(b"b").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        rig.driver.on_detach(rig.minor).await.unwrap();
        let result = tokio::time::timeout(TEST_TIMEOUT, writer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(SessionError::DeviceGone));
    }

    #[tokio::test]
    async fn test_suspend_cancels_in_flight_io() {
        let rig = Rig::new(SessionConfig {
            draw_down_timeout_ms: 20,
            ..Default::default()
        });
        let handle = rig.open(true).await;

        handle.write(b"x").await.unwrap();
        assert_eq!(handle.read(8).await, Err(SessionError::WouldBlock));

        rig.driver.on_suspend(rig.minor).await.unwrap();
        rig.driver.on_resume(rig.minor).await.unwrap();
        assert_eq!(rig.transport.pending(Direction::In), 0);
        assert_eq!(rig.transport.pending(Direction::Out), 0);

        // Nothing was reported: cancellation is not a failure
        assert_eq!(handle.read(8).await, Err(SessionError::WouldBlock));
        assert_eq!(rig.transport.submitted(Direction::In), 2);
    }

    #[tokio::test]
    async fn test_reset_reported_as_stall() {
        let rig = Rig::new(SessionConfig::default());
        let handle = rig.open(true).await;

        rig.driver.on_pre_reset(rig.minor).await.unwrap();
        rig.driver.on_post_reset(rig.minor).await.unwrap();

        assert_eq!(handle.read(8).await, Err(SessionError::PipeStall));
        assert_eq!(handle.read(8).await, Err(SessionError::WouldBlock));
    }
}
