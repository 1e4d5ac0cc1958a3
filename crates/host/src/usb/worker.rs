//! USB worker thread
//!
//! Dedicated thread that owns the rusb context. It runs the libusb event
//! loop (which drives hot-plug callbacks), turns hot-plug notifications into
//! attach/detach events for the runtime and answers its commands.

use crate::usb::manager::DeviceManager;
use crate::usb::transfers::TransferTimeouts;
use common::{UsbCommand, UsbWorker};
use rusb::UsbContext;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// libusb event wait per loop iteration
const EVENT_TIMEOUT: Duration = Duration::from_millis(100);

/// Device rescan period when hot-plug is unavailable
const RESCAN_INTERVAL: Duration = Duration::from_secs(1);

pub struct UsbWorkerThread {
    manager: DeviceManager,
    worker: UsbWorker,
}

impl UsbWorkerThread {
    pub fn new(
        worker: UsbWorker,
        filters: Vec<String>,
        timeouts: TransferTimeouts,
    ) -> Result<Self, rusb::Error> {
        let mut manager = DeviceManager::new(worker.event_tx.clone(), filters, timeouts)?;
        manager.initialize()?;

        Ok(Self { manager, worker })
    }

    /// Run until Shutdown is received or the runtime side goes away
    pub fn run(mut self) -> Result<(), rusb::Error> {
        info!("USB worker thread started");
        let mut last_rescan = Instant::now();

        loop {
            match self.worker.try_recv_command() {
                Some(UsbCommand::Shutdown) => {
                    info!("USB worker shutting down");
                    break;
                }
                Some(UsbCommand::ListDevices { response }) => {
                    let devices = self.manager.list_devices();
                    debug!("Listing {} devices", devices.len());
                    let _ = response.send(devices);
                }
                None if self.worker.is_closed() => {
                    info!("Runtime gone, USB worker stopping");
                    break;
                }
                None => {}
            }

            match self.manager.context().handle_events(Some(EVENT_TIMEOUT)) {
                Ok(()) => {}
                Err(rusb::Error::Interrupted) => {
                    debug!("USB event handling interrupted");
                }
                Err(e) => {
                    warn!("Error handling USB events: {}", e);
                    std::thread::sleep(EVENT_TIMEOUT);
                }
            }

            self.manager.process_hotplug_events();

            if !self.manager.has_hotplug() && last_rescan.elapsed() >= RESCAN_INTERVAL {
                if let Err(e) = self.manager.rescan() {
                    warn!("Device rescan failed: {}", e);
                }
                last_rescan = Instant::now();
            }
        }

        info!("USB worker thread stopped");
        Ok(())
    }
}

/// Spawn the USB worker thread
pub fn spawn_usb_worker(
    worker: UsbWorker,
    filters: Vec<String>,
    timeouts: TransferTimeouts,
) -> std::io::Result<std::thread::JoinHandle<Result<(), rusb::Error>>> {
    std::thread::Builder::new()
        .name("usb-worker".to_string())
        .spawn(move || {
            let worker_thread = UsbWorkerThread::new(worker, filters, timeouts)?;
            worker_thread.run()
        })
}
