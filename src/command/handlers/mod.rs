//! Command handlers for the different actions

mod config;
mod lock;
mod system;

pub use config::handle_update_config;
pub use lock::{handle_lock, handle_unlock};
pub use system::{handle_device_control, handle_restart, handle_screenshot};

use crate::command::LockController;
use crate::context::AgentContext;
use crate::reconcile::Reconciler;
use crate::schedule::Scheduler;
use std::sync::Arc;

/// Context passed to command handlers
pub struct HandlerContext<'a> {
    pub agent: &'a Arc<AgentContext>,
    pub lock: &'a LockController,
    pub reconciler: &'a Reconciler,
    pub scheduler: &'a Scheduler,
}
