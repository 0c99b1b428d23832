//! Local persistence
//!
//! [`Preferences`] is the typed view over the encrypted key-value store that
//! the reconciler, the scheduler and the lock controller read and write.
//! Reads of absent entries return default values.

mod kv;

pub use kv::{EncryptedKvStore, WriteTxn};

use lockagent_shared::{LockConfiguration, LockStatus, ScheduleConfig};
use serde::de::DeserializeOwned;
use std::sync::Arc;

use crate::error::PersistenceError;

/// Keys used in the local store
pub mod keys {
    pub const LOCK_CONFIGURATION: &str = "lock_configuration";
    pub const LOCK_STATUS: &str = "lock_status";
    pub const SCHEDULE_CONFIG: &str = "schedule_config";
    pub const DEVICE_ID: &str = "device_id";
    pub const EMERGENCY_MODE: &str = "emergency_mode";
    pub const LAST_SYNC: &str = "last_sync";
}

#[derive(Clone)]
pub struct Preferences {
    kv: Arc<EncryptedKvStore>,
}

impl Preferences {
    pub fn new(kv: Arc<EncryptedKvStore>) -> Self {
        Self { kv }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(EncryptedKvStore::in_memory()))
    }

    fn read<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T, PersistenceError> {
        Ok(self.kv.get(key)?.unwrap_or_default())
    }

    pub fn transaction(&self) -> WriteTxn<'_> {
        self.kv.transaction()
    }

    pub fn lock_configuration(&self) -> Result<LockConfiguration, PersistenceError> {
        self.read(keys::LOCK_CONFIGURATION)
    }

    /// Raw write for fixtures; live edits go through `Reconciler::save_local`
    #[cfg(test)]
    pub(crate) fn save_lock_configuration(&self, config: &LockConfiguration) -> Result<(), PersistenceError> {
        self.kv.put(keys::LOCK_CONFIGURATION, config)
    }

    pub fn lock_status(&self) -> Result<LockStatus, PersistenceError> {
        self.read(keys::LOCK_STATUS)
    }

    pub fn save_lock_status(&self, status: &LockStatus) -> Result<(), PersistenceError> {
        self.kv.put(keys::LOCK_STATUS, status)
    }

    pub fn schedule_config(&self) -> Result<ScheduleConfig, PersistenceError> {
        self.read(keys::SCHEDULE_CONFIG)
    }

    pub fn save_schedule_config(&self, config: &ScheduleConfig) -> Result<(), PersistenceError> {
        self.kv.put(keys::SCHEDULE_CONFIG, config)
    }

    pub fn device_id(&self) -> Result<Option<String>, PersistenceError> {
        self.kv.get(keys::DEVICE_ID)
    }

    pub fn save_device_id(&self, device_id: &str) -> Result<(), PersistenceError> {
        self.kv.put(keys::DEVICE_ID, &device_id)
    }

    pub fn emergency_mode(&self) -> Result<bool, PersistenceError> {
        self.read(keys::EMERGENCY_MODE)
    }

    pub fn set_emergency_mode(&self, enabled: bool) -> Result<(), PersistenceError> {
        self.kv.put(keys::EMERGENCY_MODE, &enabled)
    }

    /// Epoch milliseconds of the last successful configuration upload
    pub fn last_sync(&self) -> Result<Option<u64>, PersistenceError> {
        self.kv.get(keys::LAST_SYNC)
    }

    pub fn set_last_sync(&self, at_ms: u64) -> Result<(), PersistenceError> {
        self.kv.put(keys::LAST_SYNC, &at_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockagent_shared::{LockType, TimeOfDay};

    #[test]
    fn test_defaults_when_absent() {
        let prefs = Preferences::in_memory();
        assert_eq!(prefs.lock_configuration().unwrap(), LockConfiguration::default());
        assert_eq!(prefs.lock_status().unwrap(), LockStatus::default());
        assert_eq!(prefs.schedule_config().unwrap(), ScheduleConfig::default());
        assert!(!prefs.emergency_mode().unwrap());
        assert_eq!(prefs.device_id().unwrap(), None);
        assert_eq!(prefs.last_sync().unwrap(), None);
    }

    #[test]
    fn test_typed_round_trip() {
        let prefs = Preferences::in_memory();

        let status = LockStatus::locked(LockType::CustomArea, 1_000);
        prefs.save_lock_status(&status).unwrap();
        assert_eq!(prefs.lock_status().unwrap(), status);

        let schedule = ScheduleConfig {
            lock_time: Some(TimeOfDay::new(22, 0).unwrap()),
            unlock_time: None,
            days: vec![2, 3],
            enabled: true,
        };
        prefs.save_schedule_config(&schedule).unwrap();
        assert_eq!(prefs.schedule_config().unwrap(), schedule);

        prefs.save_device_id("dev-1").unwrap();
        assert_eq!(prefs.device_id().unwrap().as_deref(), Some("dev-1"));
    }

    #[test]
    fn test_clones_share_storage() {
        let prefs = Preferences::in_memory();
        let other = prefs.clone();
        prefs.set_emergency_mode(true).unwrap();
        assert!(other.emergency_mode().unwrap());
    }
}
