//! Local state reconciliation
//!
//! Configuration is replaced as a whole object under last-write-wins on
//! `lastUpdated`. A remote payload is applied only when it is strictly newer
//! than the local copy; the comparison and the write happen inside one store
//! transaction so a concurrent local save cannot interleave.

use bytes::Bytes;
use chrono::Utc;
use lockagent_shared::{into_document, now_ms, LockConfiguration};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::context::{ActuatorRequest, AgentContext, AgentEvent};
use crate::error::Result;
use crate::persistence::keys;

/// Outcome of merging a remote configuration
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Applied(LockConfiguration),
    Stale { local: u64, remote: u64 },
}

#[derive(Clone)]
pub struct Reconciler {
    ctx: Arc<AgentContext>,
}

impl Reconciler {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }

    pub fn current(&self) -> Result<LockConfiguration> {
        Ok(self.ctx.prefs.lock_configuration()?)
    }

    /// Compare and store a remote payload without side effects
    pub fn apply_remote(&self, payload: &Value) -> Result<MergeOutcome> {
        let remote = LockConfiguration::from_value(payload)?;

        let mut txn = self.ctx.prefs.transaction();
        let local: LockConfiguration = txn.get(keys::LOCK_CONFIGURATION)?.unwrap_or_default();

        if !remote.is_newer_than(&local) {
            return Ok(MergeOutcome::Stale {
                local: local.last_updated,
                remote: remote.last_updated,
            });
        }

        txn.put(keys::LOCK_CONFIGURATION, &remote)?;
        txn.commit()?;
        Ok(MergeOutcome::Applied(remote))
    }

    /// Merge a remote payload and, when it wins, push it to the actuator layer
    pub async fn merge(&self, payload: &Value) -> Result<MergeOutcome> {
        let outcome = self.apply_remote(payload)?;

        match &outcome {
            MergeOutcome::Applied(config) => {
                info!(
                    "[SYNC] Applied remote configuration (lastUpdated={})",
                    config.last_updated
                );
                self.ctx
                    .actuators
                    .send(ActuatorRequest::ApplyConfig(config.clone()))
                    .await?;
                self.ctx.notify(AgentEvent::ConfigApplied(config.clone()));
                if let Err(e) = self.ctx.prefs.set_last_sync(now_ms()) {
                    warn!("[SYNC] Could not record sync time: {}", e);
                }
            }
            MergeOutcome::Stale { local, remote } => {
                debug!(
                    "[SYNC] Ignoring stale configuration (remote={} local={})",
                    remote, local
                );
            }
        }
        Ok(outcome)
    }

    /// Save a locally edited configuration and publish it.
    ///
    /// The version is bumped past both the clock and the stored copy so a local
    /// edit always wins over what it replaces.
    pub async fn save_local(&self, mut config: LockConfiguration) -> Result<LockConfiguration> {
        {
            let mut txn = self.ctx.prefs.transaction();
            let local: LockConfiguration =
                txn.get(keys::LOCK_CONFIGURATION)?.unwrap_or_default();
            config.last_updated = now_ms().max(local.last_updated + 1);
            txn.put(keys::LOCK_CONFIGURATION, &config)?;
            txn.commit()?;
        }

        self.publish(&config).await;
        Ok(config)
    }

    /// Mirror the configuration to the device document and upload a snapshot.
    /// Best effort: failures are logged.
    pub async fn publish(&self, config: &LockConfiguration) {
        let store = &self.ctx.store;
        let device_id = &self.ctx.device_id;

        let fields = into_document(json!({
            "configuration": config.to_value(),
            "configurationUpdatedAt": Utc::now().to_rfc3339(),
        }));
        if let Err(e) = store.upsert_device(device_id, fields).await {
            warn!("[SYNC] Could not mirror configuration: {}", e);
            return;
        }

        let path = format!("configurations/{}_config.json", device_id);
        let body = match serde_json::to_vec_pretty(&config.to_value()) {
            Ok(body) => Bytes::from(body),
            Err(e) => {
                warn!("[SYNC] Could not encode configuration snapshot: {}", e);
                return;
            }
        };
        match store.upload_blob(&path, body).await {
            Ok(()) => {
                debug!("[SYNC] Uploaded {}", path);
                if let Err(e) = self.ctx.prefs.set_last_sync(now_ms()) {
                    warn!("[SYNC] Could not record sync time: {}", e);
                }
            }
            Err(e) => warn!("[SYNC] Could not upload {}: {}", path, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{harness, DEVICE_ID};
    use lockagent_shared::LockType;

    #[tokio::test]
    async fn test_newer_remote_wins() {
        let mut h = harness();
        let reconciler = Reconciler::new(h.ctx.clone());

        let outcome = reconciler
            .merge(&json!({"lockType": "EDGE_LOCK", "lastUpdated": 100}))
            .await
            .unwrap();
        assert!(matches!(outcome, MergeOutcome::Applied(_)));
        assert_eq!(reconciler.current().unwrap().lock_type, LockType::EdgeLock);
        assert_eq!(h.actuator_requests(), vec!["apply_config"]);
        assert!(h.ctx.prefs.last_sync().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_remote_leaves_local_unchanged() {
        let mut h = harness();
        let reconciler = Reconciler::new(h.ctx.clone());
        reconciler
            .apply_remote(&json!({"lockType": "EDGE_LOCK", "lastUpdated": 100}))
            .unwrap();
        let before = reconciler.current().unwrap();

        for version in [100, 99, 0] {
            let outcome = reconciler
                .merge(&json!({"lockType": "CUSTOM_AREA", "kioskMode": true, "lastUpdated": version}))
                .await
                .unwrap();
            assert_eq!(
                outcome,
                MergeOutcome::Stale {
                    local: 100,
                    remote: version
                }
            );
        }

        assert_eq!(reconciler.current().unwrap(), before);
        assert!(h.actuator_requests().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_payload_is_rejected() {
        let h = harness();
        let reconciler = Reconciler::new(h.ctx.clone());
        assert!(reconciler.apply_remote(&json!({"lockType": "sideways"})).is_err());
        assert_eq!(reconciler.current().unwrap(), LockConfiguration::default());
    }

    #[tokio::test]
    async fn test_local_save_bumps_version_and_publishes() {
        let h = harness();
        let reconciler = Reconciler::new(h.ctx.clone());

        // A remote copy stamped in the future
        let future = now_ms() + 60_000;
        reconciler
            .apply_remote(&json!({"lastUpdated": future}))
            .unwrap();

        let saved = reconciler
            .save_local(LockConfiguration {
                kiosk_mode: true,
                ..LockConfiguration::default()
            })
            .await
            .unwrap();
        assert_eq!(saved.last_updated, future + 1);

        let device = h.store.device(DEVICE_ID).unwrap();
        assert_eq!(device["configuration"]["kioskMode"], true);
        assert!(h
            .store
            .blob(&format!("configurations/{DEVICE_ID}_config.json"))
            .is_some());

        // Our own mirror coming back is not newer
        let echo = reconciler.apply_remote(&device["configuration"]).unwrap();
        assert!(matches!(echo, MergeOutcome::Stale { .. }));
    }
}
