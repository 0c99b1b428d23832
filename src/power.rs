//! Battery-driven heartbeat cadence
//!
//! | mode        | trigger                              | interval |
//! |-------------|--------------------------------------|----------|
//! | normal      | battery above the low threshold      | 30 s     |
//! | low_battery | battery at or below 20%              | 180 s    |
//! | emergency   | battery at or below 10%, sticky      | 300 s    |
//!
//! Emergency mode is persisted and only clears once the battery is back to 80%
//! while charging.

use lockagent_shared::timing;
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::device::BatteryState;
use crate::error::PersistenceError;
use crate::persistence::Preferences;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    Normal,
    LowBattery,
    Emergency,
}

impl PowerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerMode::Normal => "normal",
            PowerMode::LowBattery => "low_battery",
            PowerMode::Emergency => "emergency",
        }
    }
}

impl fmt::Display for PowerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PowerPolicy {
    normal: Duration,
    low_battery: Duration,
    emergency: Duration,
}

impl PowerPolicy {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            normal: config.heartbeat_interval,
            low_battery: config.low_battery_interval,
            emergency: config.critical_battery_interval,
        }
    }

    pub fn interval(&self, mode: PowerMode) -> Duration {
        match mode {
            PowerMode::Normal => self.normal,
            PowerMode::LowBattery => self.low_battery,
            PowerMode::Emergency => self.emergency,
        }
    }

    /// Pure evaluation: returns the mode and the new emergency flag
    pub fn evaluate(battery: BatteryState, emergency: bool) -> (PowerMode, bool) {
        let restored = battery.is_charging && battery.level >= timing::BATTERY_RESTORED_PERCENT;
        let emergency = if emergency { !restored } else { battery.level <= timing::CRITICAL_BATTERY_PERCENT };

        let mode = if emergency {
            PowerMode::Emergency
        } else if battery.level <= timing::LOW_BATTERY_PERCENT {
            PowerMode::LowBattery
        } else {
            PowerMode::Normal
        };
        (mode, emergency)
    }

    /// Evaluate against the persisted emergency flag, updating it on change
    pub fn assess(prefs: &Preferences, battery: BatteryState) -> Result<PowerMode, PersistenceError> {
        let was_emergency = prefs.emergency_mode()?;
        let (mode, emergency) = Self::evaluate(battery, was_emergency);

        if emergency != was_emergency {
            prefs.set_emergency_mode(emergency)?;
            if emergency {
                warn!("[CONN] Entering emergency power mode at {}% battery", battery.level);
            } else {
                info!("[CONN] Leaving emergency power mode at {}% battery", battery.level);
            }
        }
        Ok(mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn battery(level: u8, is_charging: bool) -> BatteryState {
        BatteryState { level, is_charging }
    }

    #[test]
    fn test_interval_table() {
        let policy = PowerPolicy::from_config(&AgentConfig::default());
        assert_eq!(policy.interval(PowerMode::Normal), Duration::from_secs(30));
        assert_eq!(policy.interval(PowerMode::LowBattery), Duration::from_secs(180));
        assert_eq!(policy.interval(PowerMode::Emergency), Duration::from_secs(300));
    }

    #[test]
    fn test_thresholds() {
        assert_eq!(PowerPolicy::evaluate(battery(21, false), false).0, PowerMode::Normal);
        assert_eq!(PowerPolicy::evaluate(battery(20, false), false).0, PowerMode::LowBattery);
        assert_eq!(
            PowerPolicy::evaluate(battery(10, false), false),
            (PowerMode::Emergency, true)
        );
    }

    #[test]
    fn test_emergency_is_sticky_until_charged() {
        let prefs = Preferences::in_memory();

        assert_eq!(PowerPolicy::assess(&prefs, battery(8, false)).unwrap(), PowerMode::Emergency);
        assert!(prefs.emergency_mode().unwrap());

        // Recovering without charging keeps emergency mode
        assert_eq!(PowerPolicy::assess(&prefs, battery(50, false)).unwrap(), PowerMode::Emergency);
        // Charging but not yet at 80%
        assert_eq!(PowerPolicy::assess(&prefs, battery(79, true)).unwrap(), PowerMode::Emergency);

        assert_eq!(PowerPolicy::assess(&prefs, battery(80, true)).unwrap(), PowerMode::Normal);
        assert!(!prefs.emergency_mode().unwrap());
    }
}
