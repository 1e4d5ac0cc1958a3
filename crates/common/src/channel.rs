//! Async channel bridge between Tokio runtime and USB thread

use crate::usb_types::DeviceSummary;
use async_channel::{Receiver, Sender, bounded};
use session::{InterfaceDescriptor, Transport};
use std::fmt;
use std::sync::Arc;

/// Commands from Tokio runtime to USB thread
#[derive(Debug)]
pub enum UsbCommand {
    /// List all devices passing the configured filters
    ListDevices {
        /// Channel to send response back
        response: tokio::sync::oneshot::Sender<Vec<DeviceSummary>>,
    },

    /// Shutdown the USB thread gracefully
    Shutdown,
}

/// USB events from the device manager
pub enum UsbEvent {
    /// A device with a bulk pair was opened and its interface claimed
    DeviceArrived {
        device: DeviceSummary,
        interface: InterfaceDescriptor,
        /// Moves bytes for the claimed interface
        transport: Arc<dyn Transport>,
    },

    /// A previously announced device was unplugged
    DeviceLeft { bus_number: u8, device_address: u8 },
}

impl fmt::Debug for UsbEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsbEvent::DeviceArrived {
                device, interface, ..
            } => f
                .debug_struct("DeviceArrived")
                .field("device", device)
                .field("interface", interface)
                .finish_non_exhaustive(),
            UsbEvent::DeviceLeft {
                bus_number,
                device_address,
            } => f
                .debug_struct("DeviceLeft")
                .field("bus_number", bus_number)
                .field("device_address", device_address)
                .finish(),
        }
    }
}

/// Handle for Tokio runtime (async)
#[derive(Clone)]
pub struct UsbBridge {
    cmd_tx: Sender<UsbCommand>,
    event_rx: Receiver<UsbEvent>,
}

impl UsbBridge {
    /// Send a command to the USB thread
    pub async fn send_command(&self, cmd: UsbCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::BridgeClosed(e.to_string()))
    }

    /// Receive an event from the USB thread
    pub async fn recv_event(&self) -> crate::Result<UsbEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::BridgeClosed(e.to_string()))
    }

    /// Ask the USB thread for the current device list
    pub async fn list_devices(&self) -> crate::Result<Vec<DeviceSummary>> {
        let (response, rx) = tokio::sync::oneshot::channel();
        self.send_command(UsbCommand::ListDevices { response })
            .await?;
        rx.await
            .map_err(|e| crate::Error::BridgeClosed(e.to_string()))
    }
}

/// Handle for USB thread (blocking)
pub struct UsbWorker {
    cmd_rx: Receiver<UsbCommand>,
    /// Event sender (public for the hot-plug path to clone)
    pub event_tx: Sender<UsbEvent>,
}

impl UsbWorker {
    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<UsbCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Whether the runtime side is gone
    pub fn is_closed(&self) -> bool {
        self.cmd_rx.is_closed()
    }

    /// Send an event to Tokio runtime (blocking)
    pub fn send_event(&self, event: UsbEvent) -> crate::Result<()> {
        self.event_tx
            .send_blocking(event)
            .map_err(|e| crate::Error::BridgeClosed(e.to_string()))
    }
}

/// Create the channel bridge between Tokio and USB thread
///
/// Returns (UsbBridge for Tokio, UsbWorker for USB thread)
pub fn create_usb_bridge() -> (UsbBridge, UsbWorker) {
    let (cmd_tx, cmd_rx) = bounded(64);
    let (event_tx, event_rx) = bounded(64);

    (
        UsbBridge { cmd_tx, event_rx },
        UsbWorker { cmd_rx, event_tx },
    )
}
