//! USB subsystem
//!
//! Device enumeration, hot-plug detection and the rusb-backed bulk transport.
//! All libusb work happens on dedicated threads; the runtime only sees
//! attach/detach events and the `Transport` of each attached device.

pub mod device;
pub mod manager;
pub mod transfers;
pub mod worker;

pub use transfers::TransferTimeouts;
pub use worker::spawn_usb_worker;

use session::PowerPolicy;
use tracing::debug;

/// Power policy of the host
///
/// libusb offers no runtime power management, so the device simply stays
/// awake; open/close transitions are logged.
#[derive(Debug, Default)]
pub struct HostPower;

impl PowerPolicy for HostPower {
    fn prevent_idle_suspend(&self) -> session::Result<()> {
        debug!("Device in use, idle suspend blocked");
        Ok(())
    }

    fn allow_idle_suspend(&self) {
        debug!("Device idle, suspend allowed");
    }
}
