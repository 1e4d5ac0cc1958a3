//! stdin/stdout bridge over one device session
//!
//! Two client handles are opened on the bridged minor: the reader copies
//! device data to stdout, the writer queues stdin data to the device. Stdin is
//! read on its own thread and handed over through an async channel so a
//! blocked terminal read never holds up runtime shutdown.

use crate::config::HostSettings;
use async_channel::{Receiver, bounded};
use session::{ClientHandle, Driver, Interrupter, OpenFlags, SessionError};
use std::io::Read;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const STDIN_CHUNK: usize = 4096;

/// Start the stdin reader thread
///
/// The returned channel closes at end of input.
pub fn spawn_stdin_pump() -> std::io::Result<Receiver<Vec<u8>>> {
    let (tx, rx) = bounded(16);
    std::thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            let mut stdin = std::io::stdin().lock();
            let mut buf = vec![0u8; STDIN_CHUNK];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send_blocking(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        warn!("stdin read failed: {}", e);
                        break;
                    }
                }
            }
            debug!("stdin closed");
        })?;
    Ok(rx)
}

pub struct Bridge {
    minor: u32,
    interrupters: [Interrupter; 2],
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Bridge {
    /// Open the two handles on `minor` and start copying
    pub async fn start(
        driver: &Driver,
        minor: u32,
        settings: &HostSettings,
        stdin: Receiver<Vec<u8>>,
    ) -> session::Result<Self> {
        // A blocking read would hold the I/O lock until the device sends
        // something, starving the writer; the reader waits via readable()
        let reader = driver
            .open(minor, OpenFlags { nonblocking: true })
            .await?;
        let writer = driver.open(minor, OpenFlags::default()).await?;

        let interrupters = [reader.interrupter(), writer.interrupter()];
        let chunk = settings.read_chunk;

        info!("Bridging minor {} to stdin/stdout", minor);
        Ok(Self {
            minor,
            interrupters,
            reader: tokio::spawn(pump_to_writer(reader, chunk, tokio::io::stdout())),
            writer: tokio::spawn(pump_from_stdin(writer, stdin)),
        })
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    /// Interrupt both directions and wait for them to finish
    pub async fn stop(self) {
        for interrupter in &self.interrupters {
            interrupter.interrupt();
        }
        let _ = self.reader.await;
        let _ = self.writer.await;
        debug!("Bridge on minor {} stopped", self.minor);
    }
}

/// Copy device data to `out` until interrupted or the device leaves
///
/// `handle` must be non-blocking.
async fn pump_to_writer<W>(handle: ClientHandle, chunk: usize, mut out: W)
where
    W: AsyncWrite + Unpin,
{
    let interrupter = handle.interrupter();

    loop {
        // A steady stream never waits, so the interrupt is checked here too
        if interrupter.is_pending() {
            break;
        }
        match handle.readable().await {
            Ok(()) => {}
            Err(SessionError::Interrupted) => break,
            Err(e) => {
                info!("Reader on minor {} stopping: {}", handle.minor(), e);
                break;
            }
        }

        match handle.read(chunk).await {
            Ok(data) => {
                if let Err(e) = out.write_all(&data).await {
                    warn!("Output write failed: {}", e);
                    break;
                }
                let _ = out.flush().await;
            }
            Err(SessionError::WouldBlock) => {}
            Err(SessionError::Interrupted) => break,
            Err(SessionError::DeviceGone) => {
                info!("Device behind minor {} is gone", handle.minor());
                break;
            }
            Err(e) => warn!("Read on minor {} failed: {}", handle.minor(), e),
        }
    }
}

async fn pump_from_stdin(handle: ClientHandle, stdin: Receiver<Vec<u8>>) {
    let interrupter = handle.interrupter();

    loop {
        let data = match interrupter.run(stdin.recv()).await {
            Ok(Ok(data)) => data,
            Ok(Err(_)) => {
                debug!("End of input, flushing minor {}", handle.minor());
                if let Err(e) = handle.flush().await {
                    warn!("Flush on minor {} reported: {}", handle.minor(), e);
                }
                break;
            }
            Err(_) => break,
        };

        match handle.write_all(&data).await {
            Ok(()) => {}
            Err(SessionError::Interrupted) => break,
            Err(SessionError::DeviceGone) => break,
            // Latched from an earlier transfer; the rest of this chunk is dropped
            Err(e) => warn!("Write on minor {} failed: {}", handle.minor(), e),
        }
    }
}
