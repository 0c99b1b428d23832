//! Hardware probe and device identity

use lockagent_shared::{now_ms, HardwareInfo};
use std::sync::{Mutex, PoisonError};
use tracing::info;

use crate::error::PersistenceError;
use crate::persistence::Preferences;

/// Battery reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryState {
    pub level: u8,
    pub is_charging: bool,
}

impl Default for BatteryState {
    fn default() -> Self {
        Self {
            level: 100,
            is_charging: false,
        }
    }
}

/// Source of hardware facts about the device
pub trait DeviceProbe: Send + Sync {
    /// Stable hardware identifier, if the platform exposes one
    fn hardware_id(&self) -> Option<String>;

    fn hardware_info(&self) -> HardwareInfo;

    fn battery(&self) -> BatteryState;

    /// Opaque push-notification token
    fn push_token(&self) -> Option<String>;
}

/// Probe with fixed metadata and a settable battery level
pub struct StaticProbe {
    hardware_id: Option<String>,
    info: HardwareInfo,
    push_token: Option<String>,
    battery: Mutex<BatteryState>,
}

impl StaticProbe {
    pub fn new(hardware_id: Option<String>, info: HardwareInfo) -> Self {
        Self {
            hardware_id,
            info,
            push_token: None,
            battery: Mutex::new(BatteryState::default()),
        }
    }

    pub fn with_push_token(mut self, token: impl Into<String>) -> Self {
        self.push_token = Some(token.into());
        self
    }

    pub fn set_battery(&self, level: u8, is_charging: bool) {
        *self.battery.lock().unwrap_or_else(PoisonError::into_inner) = BatteryState {
            level: level.min(100),
            is_charging,
        };
    }
}

impl DeviceProbe for StaticProbe {
    fn hardware_id(&self) -> Option<String> {
        self.hardware_id.clone()
    }

    fn hardware_info(&self) -> HardwareInfo {
        self.info.clone()
    }

    fn battery(&self) -> BatteryState {
        *self.battery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_token(&self) -> Option<String> {
        self.push_token.clone()
    }
}

fn sanitize(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Resolve the device id.
///
/// A previously persisted id always wins. Otherwise the id comes from the
/// hardware identifier, or `device_<millis>_<model>` when there is none, and is
/// persisted for every later start.
pub fn derive_device_id(
    prefs: &Preferences,
    probe: &dyn DeviceProbe,
) -> Result<String, PersistenceError> {
    if let Some(id) = prefs.device_id()? {
        return Ok(id);
    }

    let id = match probe.hardware_id().map(|h| sanitize(&h)).filter(|h| !h.is_empty()) {
        Some(hardware_id) => hardware_id,
        None => {
            let model = sanitize(&probe.hardware_info().model);
            let model = if model.is_empty() { "unknown".to_string() } else { model };
            format!("device_{}_{}", now_ms(), model)
        }
    };

    prefs.save_device_id(&id)?;
    info!("Assigned device id {}", id);
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(model: &str) -> HardwareInfo {
        HardwareInfo {
            model: model.into(),
            ..HardwareInfo::default()
        }
    }

    #[test]
    fn test_id_from_hardware_identifier() {
        let prefs = Preferences::in_memory();
        let probe = StaticProbe::new(Some("a1b2c3".into()), info("Pixel 7"));
        assert_eq!(derive_device_id(&prefs, &probe).unwrap(), "a1b2c3");
    }

    #[test]
    fn test_fallback_id_is_persisted() {
        let prefs = Preferences::in_memory();
        let probe = StaticProbe::new(None, info("Pixel 7"));

        let first = derive_device_id(&prefs, &probe).unwrap();
        assert!(first.starts_with("device_"));
        assert!(first.ends_with("_Pixel_7"));

        // Stable across restarts
        let second = derive_device_id(&prefs, &probe).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_persisted_id_wins_over_hardware() {
        let prefs = Preferences::in_memory();
        prefs.save_device_id("kept").unwrap();
        let probe = StaticProbe::new(Some("other".into()), info("X"));
        assert_eq!(derive_device_id(&prefs, &probe).unwrap(), "kept");
    }

    #[test]
    fn test_battery_is_clamped() {
        let probe = StaticProbe::new(None, HardwareInfo::default());
        probe.set_battery(140, true);
        assert_eq!(
            probe.battery(),
            BatteryState {
                level: 100,
                is_charging: true
            }
        );
    }
}
