//! USB device manager
//!
//! Handles device enumeration and hot-plug events, opens devices that carry
//! a bulk pair and announces them to the runtime. Runs in the USB thread.

use crate::usb::device::UsbDevice;
use crate::usb::transfers::{RusbTransport, TransferTimeouts};
use common::{DeviceSummary, UsbEvent};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

/// Hot-plug notification queued for the worker loop
enum HotplugEvent {
    Arrived(Device<Context>),
    Left { bus: u8, address: u8 },
}

type HotplugQueue = Arc<Mutex<Vec<HotplugEvent>>>;

pub struct DeviceManager {
    context: Context,
    /// Devices passing the filters, by (bus, address)
    devices: HashMap<(u8, u8), UsbDevice>,
    /// Devices announced to the runtime
    attached: HashSet<(u8, u8)>,
    hotplug_queue: HotplugQueue,
    _hotplug_registration: Option<Registration<Context>>,
    event_sender: async_channel::Sender<UsbEvent>,
    allowed_filters: Vec<String>,
    timeouts: TransferTimeouts,
}

impl DeviceManager {
    pub fn new(
        event_sender: async_channel::Sender<UsbEvent>,
        allowed_filters: Vec<String>,
        timeouts: TransferTimeouts,
    ) -> Result<Self, rusb::Error> {
        let context = Context::new()?;

        Ok(Self {
            context,
            devices: HashMap::new(),
            attached: HashSet::new(),
            hotplug_queue: Arc::new(Mutex::new(Vec::new())),
            _hotplug_registration: None,
            event_sender,
            allowed_filters,
            timeouts,
        })
    }

    /// Enumerate present devices and register for hot-plug
    ///
    /// Without hot-plug support the worker falls back to periodic rescans.
    pub fn initialize(&mut self) -> Result<(), rusb::Error> {
        self.rescan()?;

        if rusb::has_hotplug() {
            self.register_hotplug()?;
        } else {
            warn!("Hot-plug not supported on this platform, polling for devices");
        }

        info!(
            "Device manager initialized with {} device(s)",
            self.devices.len()
        );
        Ok(())
    }

    pub fn has_hotplug(&self) -> bool {
        self._hotplug_registration.is_some()
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    fn register_hotplug(&mut self) -> Result<(), rusb::Error> {
        let callback = HotplugCallback {
            queue: Arc::clone(&self.hotplug_queue),
        };

        let registration = HotplugBuilder::new()
            .enumerate(false)
            .register(&self.context, Box::new(callback))?;

        self._hotplug_registration = Some(registration);
        debug!("Hot-plug callbacks registered");
        Ok(())
    }

    /// Reconcile the tracked set with the bus
    pub fn rescan(&mut self) -> Result<(), rusb::Error> {
        let present = self.context.devices()?;
        let mut seen = HashSet::new();

        for device in present.iter() {
            let key = (device.bus_number(), device.address());
            seen.insert(key);
            if !self.devices.contains_key(&key) {
                self.handle_device_arrived(device);
            }
        }

        let gone: Vec<(u8, u8)> = self
            .devices
            .keys()
            .filter(|key| !seen.contains(key))
            .copied()
            .collect();
        for (bus, address) in gone {
            self.handle_device_left(bus, address);
        }
        Ok(())
    }

    /// Handle notifications queued by the hot-plug callback
    ///
    /// Devices are opened here rather than in the callback, which must not
    /// call back into libusb.
    pub fn process_hotplug_events(&mut self) {
        let events = std::mem::take(
            &mut *self
                .hotplug_queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );

        for event in events {
            match event {
                HotplugEvent::Arrived(device) => self.handle_device_arrived(device),
                HotplugEvent::Left { bus, address } => self.handle_device_left(bus, address),
            }
        }
    }

    fn handle_device_arrived(&mut self, device: Device<Context>) {
        let key = (device.bus_number(), device.address());
        if self.devices.contains_key(&key) {
            return;
        }

        let usb_device = match UsbDevice::new(device) {
            Ok(d) => d,
            Err(e) => {
                warn!("Failed to read descriptors of {:03}/{:03}: {}", key.0, key.1, e);
                return;
            }
        };

        if usb_device.is_root_hub() {
            return;
        }

        if !Self::check_filter(
            usb_device.vendor_id(),
            usb_device.product_id(),
            &self.allowed_filters,
        ) {
            debug!(
                "Device ignored by filter: bus={}, addr={}, vid={:#06x}, pid={:#06x}",
                key.0,
                key.1,
                usb_device.vendor_id(),
                usb_device.product_id()
            );
            return;
        }

        if usb_device.bulk_interface().is_some() {
            self.attach(&usb_device);
        } else {
            debug!("Device {:03}/{:03} has no bulk pair", key.0, key.1);
        }
        self.devices.insert(key, usb_device);
    }

    /// Open the device, start its transport and announce it
    fn attach(&mut self, device: &UsbDevice) {
        let Some(interface) = device.bulk_interface().cloned() else {
            return;
        };
        let summary = device.summary();

        let handle = match device.open() {
            Ok(h) => h,
            Err(e) => {
                warn!("Cannot attach {}: {}", summary, e);
                return;
            }
        };

        let name = format!("usb-{:03}-{:03}", summary.bus_number, summary.device_address);
        let transport = match RusbTransport::new(handle, &name, self.timeouts) {
            Ok(t) => t,
            Err(e) => {
                error!("Failed to start transfer workers for {}: {}", summary, e);
                return;
            }
        };

        info!("Device arrived: {}", summary);
        let location = summary.location();
        if let Err(e) = self.event_sender.send_blocking(UsbEvent::DeviceArrived {
            device: summary,
            interface,
            transport,
        }) {
            error!("Failed to send DeviceArrived event: {}", e);
            return;
        }
        self.attached.insert(location);
    }

    fn handle_device_left(&mut self, bus: u8, address: u8) {
        let key = (bus, address);
        if self.devices.remove(&key).is_none() {
            return;
        }
        debug!("Removed device {:03}/{:03}", bus, address);

        if self.attached.remove(&key)
            && let Err(e) = self.event_sender.send_blocking(UsbEvent::DeviceLeft {
                bus_number: bus,
                device_address: address,
            })
        {
            error!("Failed to send DeviceLeft event: {}", e);
        }
    }

    /// All tracked devices
    pub fn list_devices(&self) -> Vec<DeviceSummary> {
        let mut devices: Vec<DeviceSummary> =
            self.devices.values().map(UsbDevice::summary).collect();
        devices.sort_by_key(DeviceSummary::location);
        devices
    }

    /// Check if a VID/PID pair is allowed by the filters
    fn check_filter(vid: u16, pid: u16, filters: &[String]) -> bool {
        if filters.is_empty() {
            return true;
        }

        filters.iter().any(|filter| {
            // Filters are validated by the config loader
            let Some((filter_vid, filter_pid)) = filter.split_once(':') else {
                return false;
            };
            Self::id_matches(filter_vid, vid) && Self::id_matches(filter_pid, pid)
        })
    }

    fn id_matches(pattern: &str, id: u16) -> bool {
        if pattern == "*" {
            return true;
        }
        let hex = pattern
            .strip_prefix("0x")
            .or_else(|| pattern.strip_prefix("0X"))
            .unwrap_or(pattern);
        u16::from_str_radix(hex, 16)
            .map(|v| v == id)
            .unwrap_or(false)
    }
}

/// Hot-plug callback handler
///
/// Only queues the notification; the worker loop does the work.
struct HotplugCallback {
    queue: HotplugQueue,
}

impl HotplugCallback {
    fn push(&self, event: HotplugEvent) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl Hotplug<Context> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        self.push(HotplugEvent::Arrived(device));
    }

    fn device_left(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        self.push(HotplugEvent::Left {
            bus: device.bus_number(),
            address: device.address(),
        });
    }
}
