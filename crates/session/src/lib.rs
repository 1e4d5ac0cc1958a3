//! Device sessions for a point-to-point bulk link
//!
//! One attached device exposes one bulk-in and one bulk-out endpoint. Any
//! number of clients may open it concurrently and read, write and close
//! independently while the device comes and goes underneath them.
//!
//! - [`Driver`] receives attach/detach/suspend/reset events and opens handles
//! - [`DeviceSession`] is the reference-counted per-device state
//! - [`ClientHandle`] is one client's view of a session
//! - [`Transport`] and [`PowerPolicy`] are supplied by the host platform

pub mod config;
pub mod device;
pub mod driver;
pub mod error;
pub mod handle;
pub mod interrupt;
pub mod latch;
pub mod mock;
pub mod power;
pub mod read;
pub mod registry;
pub mod throttle;
pub mod transfer;

pub use config::{MAX_TRANSFER, SessionConfig, WRITES_IN_FLIGHT};
pub use device::{DeviceSession, LinkState};
pub use driver::{Driver, EndpointDescriptor, InterfaceDescriptor, OpenFlags, TransferKind};
pub use error::{Result, SessionError};
pub use handle::ClientHandle;
pub use interrupt::Interrupter;
pub use power::PowerPolicy;
pub use transfer::{
    Completion, Direction, Endpoint, SubmitError, Transfer, TransferId, TransferStatus, Transport,
};
