//! Session tunables

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest single outbound transfer: a page minus the largest possible
/// packet, so buffers stay page sized and hold a whole number of packets.
pub const MAX_TRANSFER: usize = 4096 - 512;

/// Outbound transfers allowed in flight at once
pub const WRITES_IN_FLIGHT: usize = 8;

/// First minor number handed out by the registry
pub const MINOR_BASE: u32 = 192;

/// Number of minors available to the registry
pub const MAX_MINORS: u32 = 16;

/// Default bound on draw-down waits (1 second)
pub const DRAW_DOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-driver session configuration
///
/// Embedded in the host's `[session]` config section; every field has a
/// default so partial tables are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Throttle slots for outbound transfers
    pub writes_in_flight: usize,
    /// Cap on the bytes accepted by one write call
    pub max_transfer: usize,
    /// Draw-down wait before in-flight writes are killed, in milliseconds
    pub draw_down_timeout_ms: u64,
    pub minor_base: u32,
    pub max_minors: u32,
    /// Submit an inbound transfer when the first handle opens
    pub prime_reads: bool,
    /// Refuse a second concurrent open with `Busy`
    pub exclusive_open: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            writes_in_flight: WRITES_IN_FLIGHT,
            max_transfer: MAX_TRANSFER,
            draw_down_timeout_ms: DRAW_DOWN_TIMEOUT.as_millis() as u64,
            minor_base: MINOR_BASE,
            max_minors: MAX_MINORS,
            prime_reads: false,
            exclusive_open: false,
        }
    }
}

impl SessionConfig {
    pub fn draw_down_timeout(&self) -> Duration {
        Duration::from_millis(self.draw_down_timeout_ms)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), String> {
        if self.writes_in_flight == 0 {
            return Err("writes_in_flight must be at least 1".to_string());
        }
        if self.max_transfer == 0 {
            return Err("max_transfer must be greater than 0".to_string());
        }
        if self.max_minors == 0 {
            return Err("max_minors must be at least 1".to_string());
        }
        if self.minor_base.checked_add(self.max_minors).is_none() {
            return Err(format!(
                "minor range {}+{} overflows",
                self.minor_base, self.max_minors
            ));
        }
        Ok(())
    }
}
