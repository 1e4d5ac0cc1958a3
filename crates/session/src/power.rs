//! Idle-suspend control
//!
//! The platform keeps a device awake while at least one client has it open.

use crate::error::Result;

pub trait PowerPolicy: Send + Sync + 'static {
    /// Called when the first handle opens; failing aborts the open
    fn prevent_idle_suspend(&self) -> Result<()>;

    /// Called when the last handle closes on a live device
    fn allow_idle_suspend(&self);
}
