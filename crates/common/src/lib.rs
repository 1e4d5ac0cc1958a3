//! Common utilities for bulk-link
//!
//! This crate provides shared functionality for the host binary: error
//! handling, logging setup, USB device summaries and the async channel bridge
//! between the USB thread and the Tokio runtime.

pub mod channel;
pub mod error;
pub mod logging;
pub mod usb_types;

pub use channel::{UsbBridge, UsbCommand, UsbEvent, UsbWorker, create_usb_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::DeviceSummary;
