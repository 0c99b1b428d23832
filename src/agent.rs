//! Device agent wiring
//!
//! [`DeviceAgent`] owns one instance of every component, all sharing the same
//! [`AgentContext`]. The hosting app drives it with [`DeviceAgent::start`] and
//! [`DeviceAgent::shutdown`] and reads the local persistence interface through
//! it.

use lockagent_shared::{LockConfiguration, LockStatus, ScheduleConfig};
use std::sync::Arc;
use tracing::{info, warn};

use crate::command::{CommandDispatcher, LockController};
use crate::connection::{ConnectionManager, ConnectionStatus};
use crate::context::{AgentContext, LockSource};
use crate::error::Result;
use crate::reconcile::Reconciler;
use crate::schedule::{ArmedAlarm, Scheduler};

pub struct DeviceAgent {
    ctx: Arc<AgentContext>,
    lock: Arc<LockController>,
    reconciler: Reconciler,
    scheduler: Scheduler,
    connection: ConnectionManager,
}

impl DeviceAgent {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        let lock = Arc::new(LockController::new(ctx.clone()));
        let reconciler = Reconciler::new(ctx.clone());
        let scheduler = Scheduler::new(ctx.clone(), lock.clone());
        let dispatcher = Arc::new(CommandDispatcher::new(
            ctx.clone(),
            lock.clone(),
            reconciler.clone(),
            scheduler.clone(),
        ));
        let connection = ConnectionManager::new(ctx.clone(), dispatcher);

        Self {
            ctx,
            lock,
            reconciler,
            scheduler,
            connection,
        }
    }

    /// Boot-completion work that needs no connection: re-arm persisted alarms
    /// and honour auto-lock.
    pub async fn boot(&self) -> Result<Vec<ArmedAlarm>> {
        let armed = self.scheduler.restore_on_boot()?;

        let config = self.reconciler.current()?;
        if config.auto_lock_on_boot {
            match self.lock.lock(config.lock_type, LockSource::Boot).await {
                Ok(_) => {}
                Err(e) => warn!("Auto-lock on boot failed: {}", e),
            }
        }
        Ok(armed)
    }

    /// Boot, then connect. A failed first registration is not an error for the
    /// caller since the retry is already scheduled.
    pub async fn start(&self) -> Result<()> {
        let armed = self.boot().await?;
        info!(
            "Device agent {} starting ({} alarms armed)",
            self.ctx.device_id,
            armed.len()
        );

        match self.connection.initialize_connection().await {
            Ok(()) => Ok(()),
            Err(e) if e.is_retryable() => {
                warn!("[CONN] First registration failed, retrying in background: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn shutdown(&self) {
        self.connection.disconnect().await;
        self.scheduler.suspend();
        info!("Device agent {} stopped", self.ctx.device_id);
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn device_id(&self) -> &str {
        &self.ctx.device_id
    }

    pub fn context(&self) -> &Arc<AgentContext> {
        &self.ctx
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn lock_configuration(&self) -> Result<LockConfiguration> {
        self.reconciler.current()
    }

    /// Save a locally edited configuration; it wins over whatever it replaces
    pub async fn save_lock_configuration(&self, config: LockConfiguration) -> Result<LockConfiguration> {
        self.reconciler.save_local(config).await
    }

    pub fn lock_status(&self) -> Result<LockStatus> {
        self.lock.status()
    }

    pub fn schedule_config(&self) -> Result<ScheduleConfig> {
        Ok(self.ctx.prefs.schedule_config()?)
    }

    pub fn save_schedule_config(&self, config: ScheduleConfig) -> Result<Vec<ArmedAlarm>> {
        self.scheduler.apply_config(config)
    }
}
