//! Lock and unlock command handlers

use super::HandlerContext;
use crate::command::CommandResult;
use crate::context::{LockSource, UnlockMethod};
use crate::schedule::AlarmKind;
use lockagent_shared::{Command, LockType};
use tracing::{debug, info};

/// Handle LOCK
///
/// Parameters: `lockType` (optional, defaults to the configured type) and
/// `duration` in minutes. A positive duration arms a one-shot unlock alarm.
pub async fn handle_lock(ctx: &HandlerContext<'_>, command: &Command) -> CommandResult {
    let lock_type = match command.param_str("lockType") {
        Some(raw) => match LockType::parse(raw) {
            Some(lock_type) => lock_type,
            None => {
                return CommandResult::Rejected {
                    message: format!("Unknown lock type: {}", raw),
                };
            }
        },
        None => ctx
            .reconciler
            .current()
            .map(|config| config.lock_type)
            .unwrap_or_default(),
    };
    let duration = command.param_i64("duration").filter(|minutes| *minutes > 0);

    let changed = match ctx.lock.lock(lock_type, LockSource::Remote).await {
        Ok(changed) => changed,
        Err(e) => {
            return CommandResult::Failed {
                message: format!("Lock failed: {}", e),
            };
        }
    };
    if !changed {
        debug!("[CMD] Already locked, nothing to actuate");
    }

    if let Some(minutes) = duration {
        let minutes = u32::try_from(minutes).unwrap_or(u32::MAX);
        match ctx.scheduler.schedule_lock_for_duration(minutes) {
            Ok(unlock_at) => info!("[CMD] Lock expires at {}", unlock_at),
            Err(e) => {
                return CommandResult::Failed {
                    message: format!("Could not arm duration unlock: {}", e),
                };
            }
        }
    }

    let message = match (changed, duration) {
        (true, Some(minutes)) => format!("Locked ({}) for {} min", lock_type, minutes),
        (true, None) => format!("Locked ({})", lock_type),
        (false, _) => "Already locked".to_string(),
    };
    CommandResult::Completed { message }
}

/// Handle UNLOCK
pub async fn handle_unlock(ctx: &HandlerContext<'_>, _command: &Command) -> CommandResult {
    if ctx.scheduler.cancel(AlarmKind::DurationUnlock) {
        debug!("[CMD] Cancelled pending duration unlock");
    }

    match ctx.lock.unlock(UnlockMethod::Remote).await {
        Ok(true) => CommandResult::Completed {
            message: "Unlocked".into(),
        },
        Ok(false) => CommandResult::Completed {
            message: "Already unlocked".into(),
        },
        Err(e) => CommandResult::Failed {
            message: format!("Unlock failed: {}", e),
        },
    }
}
