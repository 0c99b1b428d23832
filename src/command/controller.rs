//! Idempotent lock actuation
//!
//! Remote commands, schedule alarms and boot replay all lock and unlock
//! through [`LockController`], which only actuates on an actual state change.

use lockagent_shared::{into_document, now_ms, LockStatus, LockType};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::analytics::events;
use crate::context::{ActuatorRequest, AgentContext, AgentEvent, LockSource, UnlockMethod};
use crate::error::Result;

pub struct LockController {
    ctx: Arc<AgentContext>,
    gate: Mutex<()>,
}

impl LockController {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self {
            ctx,
            gate: Mutex::new(()),
        }
    }

    pub fn status(&self) -> Result<LockStatus> {
        Ok(self.ctx.prefs.lock_status()?)
    }

    /// Lock the screen. Returns `false` when the device was already locked.
    pub async fn lock(&self, lock_type: LockType, source: LockSource) -> Result<bool> {
        let _gate = self.gate.lock().await;

        if self.ctx.prefs.lock_status()?.is_locked {
            debug!("[CMD] Lock requested ({}) while already locked", source.as_str());
            return Ok(false);
        }

        self.ctx
            .actuators
            .send(ActuatorRequest::Lock { lock_type })
            .await?;
        self.ctx
            .prefs
            .save_lock_status(&LockStatus::locked(lock_type, now_ms()))?;

        info!("[CMD] Locked ({}, {})", lock_type, source.as_str());
        self.ctx.notify(AgentEvent::Locked { lock_type, source });
        self.ctx.analytics.emit(
            events::LOCK_STATUS_CHANGED,
            into_document(json!({
                "lockType": lock_type.as_str(),
                "isLocked": true,
                "source": source.as_str(),
            })),
        );
        Ok(true)
    }

    /// Unlock the screen. Returns `false` when the device was not locked.
    pub async fn unlock(&self, method: UnlockMethod) -> Result<bool> {
        let _gate = self.gate.lock().await;

        let status = self.ctx.prefs.lock_status()?;
        if !status.is_locked {
            debug!("[CMD] Unlock requested ({}) while unlocked", method.as_str());
            return Ok(false);
        }

        self.ctx.actuators.send(ActuatorRequest::Unlock).await?;
        self.ctx.prefs.save_lock_status(&LockStatus::default())?;

        let locked_for_ms = now_ms().saturating_sub(status.start_time);
        info!("[CMD] Unlocked ({}) after {} ms", method.as_str(), locked_for_ms);
        self.ctx.notify(AgentEvent::Unlocked { method });
        self.ctx.analytics.emit(
            events::UNLOCK_EVENT,
            into_document(json!({
                "unlockMethod": method.as_str(),
                "lockedForMs": locked_for_ms,
            })),
        );
        self.ctx.analytics.emit(
            events::LOCK_STATUS_CHANGED,
            into_document(json!({
                "lockType": status.lock_type.as_str(),
                "isLocked": false,
            })),
        );
        Ok(true)
    }
}
