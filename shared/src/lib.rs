//! Lock Agent Shared Types
//!
//! This crate provides the device data model, the connection state machine and
//! the record codec shared between the device agent and operator tooling.

pub mod codec;
pub mod model;
pub mod state_machine;

use std::time::{SystemTime, UNIX_EPOCH};

// Re-export commonly used types at crate root
pub use model::*;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Timing and power parameters for the agent
pub mod timing {
    /// Nominal heartbeat interval in milliseconds
    pub const HEARTBEAT_INTERVAL_MS: u64 = 30_000;

    /// Heartbeat interval while the battery is low
    pub const LOW_BATTERY_HEARTBEAT_INTERVAL_MS: u64 = 180_000;

    /// Heartbeat interval on critical battery or in emergency mode
    pub const CRITICAL_BATTERY_HEARTBEAT_INTERVAL_MS: u64 = 300_000;

    /// Maximum consecutive reconnect attempts before giving up
    pub const MAX_RETRY: u32 = 5;

    /// Reconnect delay step: attempt `n` waits `n * RETRY_STEP_MS`
    pub const RETRY_STEP_MS: u64 = 2_000;

    /// Delay before the single attempt made by a forced reconnect
    pub const FORCE_RECONNECT_DELAY_MS: u64 = 1_000;

    /// Upper bound on a single registration or heartbeat write
    pub const WRITE_TIMEOUT_MS: u64 = 10_000;

    /// Commands older than this are not executed
    pub const COMMAND_TTL_MS: u64 = 5 * 60 * 1000;

    /// Battery percentage at or below which the heartbeat slows down
    pub const LOW_BATTERY_PERCENT: u8 = 20;

    /// Battery percentage at or below which emergency mode starts
    pub const CRITICAL_BATTERY_PERCENT: u8 = 10;

    /// Battery percentage (while charging) that clears emergency mode
    pub const BATTERY_RESTORED_PERCENT: u8 = 80;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms_is_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(a > 0);
        assert!(b >= a);
    }

    #[test]
    fn test_degraded_intervals_are_slower() {
        assert!(timing::LOW_BATTERY_HEARTBEAT_INTERVAL_MS > timing::HEARTBEAT_INTERVAL_MS);
        assert!(
            timing::CRITICAL_BATTERY_HEARTBEAT_INTERVAL_MS
                > timing::LOW_BATTERY_HEARTBEAT_INTERVAL_MS
        );
        assert!(timing::CRITICAL_BATTERY_PERCENT < timing::LOW_BATTERY_PERCENT);
    }
}
