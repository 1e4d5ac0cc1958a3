//! USB device summaries shared between the USB thread and the runtime

use std::fmt;

/// What the host knows about one enumerated device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub bus_number: u8,
    pub device_address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub product: Option<String>,
    /// Interface carrying a bulk-in/bulk-out pair, if any
    pub bulk_interface: Option<u8>,
}

impl DeviceSummary {
    /// Bus/address pair identifying the device while it is plugged in
    pub fn location(&self) -> (u8, u8) {
        (self.bus_number, self.device_address)
    }
}

impl fmt::Display for DeviceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bus {:03} Device {:03}: ID {:04x}:{:04x}",
            self.bus_number, self.device_address, self.vendor_id, self.product_id
        )?;
        if let Some(product) = &self.product {
            write!(f, " {}", product)?;
        }
        match self.bulk_interface {
            Some(number) => write!(f, " [bulk interface {}]", number),
            None => write!(f, " [no bulk pair]"),
        }
    }
}
