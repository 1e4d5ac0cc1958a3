//! USB device abstraction
//!
//! Wraps a rusb::Device with its cached descriptor and the interface that
//! carries the bulk endpoint pair, if it has one.

use common::DeviceSummary;
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle, UsbContext};
use session::{EndpointDescriptor, InterfaceDescriptor, TransferKind};
use std::time::Duration;
use tracing::{debug, warn};

/// Timeout for string descriptor reads
const STRING_TIMEOUT: Duration = Duration::from_millis(200);

pub struct UsbDevice {
    device: Device<Context>,
    descriptor: DeviceDescriptor,
    bulk_interface: Option<InterfaceDescriptor>,
}

impl UsbDevice {
    /// Read and cache the descriptors of `device`
    pub fn new(device: Device<Context>) -> Result<Self, rusb::Error> {
        let descriptor = device.device_descriptor()?;
        let bulk_interface = find_bulk_interface(&device);

        Ok(Self {
            device,
            descriptor,
            bulk_interface,
        })
    }

    pub fn bus_number(&self) -> u8 {
        self.device.bus_number()
    }

    pub fn device_address(&self) -> u8 {
        self.device.address()
    }

    pub fn location(&self) -> (u8, u8) {
        (self.bus_number(), self.device_address())
    }

    pub fn vendor_id(&self) -> u16 {
        self.descriptor.vendor_id()
    }

    pub fn product_id(&self) -> u16 {
        self.descriptor.product_id()
    }

    /// Root hubs are never attached
    pub fn is_root_hub(&self) -> bool {
        self.descriptor.vendor_id() == 0x1d6b && self.descriptor.class_code() == 9
    }

    pub fn bulk_interface(&self) -> Option<&InterfaceDescriptor> {
        self.bulk_interface.as_ref()
    }

    /// Summary for listings and events
    ///
    /// Opens the device briefly to read the product string, if permitted.
    pub fn summary(&self) -> DeviceSummary {
        let product = self.device.open().ok().and_then(|handle| {
            let language = handle.read_languages(STRING_TIMEOUT).ok()?.into_iter().next()?;
            handle
                .read_product_string(language, &self.descriptor, STRING_TIMEOUT)
                .ok()
        });

        DeviceSummary {
            bus_number: self.bus_number(),
            device_address: self.device_address(),
            vendor_id: self.vendor_id(),
            product_id: self.product_id(),
            product,
            bulk_interface: self.bulk_interface.as_ref().map(|i| i.number),
        }
    }

    /// Open the device and claim the bulk interface
    ///
    /// A kernel driver bound to the interface is detached first where the
    /// platform supports it.
    pub fn open(&self) -> Result<DeviceHandle<Context>, rusb::Error> {
        let number = self
            .bulk_interface
            .as_ref()
            .map(|i| i.number)
            .ok_or(rusb::Error::NotFound)?;

        let mut handle = self.device.open().map_err(|e| {
            warn!(
                "Failed to open device {:03}/{:03}: {}",
                self.bus_number(),
                self.device_address(),
                e
            );
            e
        })?;

        match handle.set_auto_detach_kernel_driver(true) {
            Ok(()) | Err(rusb::Error::NotSupported) => {}
            Err(e) => debug!("Could not enable kernel driver auto-detach: {}", e),
        }

        handle.claim_interface(number)?;
        debug!(
            "Claimed interface {} on device {:03}/{:03}",
            number,
            self.bus_number(),
            self.device_address()
        );
        Ok(handle)
    }
}

/// First interface (alternate setting 0) with a bulk-in/bulk-out pair
fn find_bulk_interface<T: UsbContext>(device: &Device<T>) -> Option<InterfaceDescriptor> {
    let config = device.active_config_descriptor().ok()?;

    config.interfaces().find_map(|interface| {
        let setting = interface.descriptors().next()?;
        let descriptor = InterfaceDescriptor {
            number: setting.interface_number(),
            endpoints: setting
                .endpoint_descriptors()
                .map(|e| EndpointDescriptor {
                    address: e.address(),
                    kind: map_transfer_type(e.transfer_type()),
                    max_packet_size: e.max_packet_size(),
                })
                .collect(),
        };
        descriptor.bulk_pair().map(|_| descriptor)
    })
}

fn map_transfer_type(kind: rusb::TransferType) -> TransferKind {
    match kind {
        rusb::TransferType::Control => TransferKind::Control,
        rusb::TransferType::Isochronous => TransferKind::Isochronous,
        rusb::TransferType::Bulk => TransferKind::Bulk,
        rusb::TransferType::Interrupt => TransferKind::Interrupt,
    }
}
