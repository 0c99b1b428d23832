//! Restart, screenshot and device control handlers

use super::HandlerContext;
use crate::analytics::events;
use crate::command::CommandResult;
use crate::context::ActuatorRequest;
use lockagent_shared::{into_document, now_ms, Command, CommandAction};
use serde_json::json;
use tracing::{info, warn};

/// Handle RESTART
///
/// Telemetry is written before the request goes out since the process may not
/// survive it.
pub async fn handle_restart(ctx: &HandlerContext<'_>, command: &Command) -> CommandResult {
    ctx.agent
        .analytics
        .record(
            events::RESTART_REQUESTED,
            into_document(json!({ "commandId": command.id })),
        )
        .await;

    match ctx.agent.actuators.send(ActuatorRequest::Restart).await {
        Ok(()) => CommandResult::Completed {
            message: "Restart requested".into(),
        },
        Err(e) => CommandResult::Failed {
            message: format!("Restart failed: {}", e),
        },
    }
}

/// Handle SCREENSHOT
///
/// Capture and upload run in their own task; the command completes as soon as
/// the request is handed off.
pub async fn handle_screenshot(ctx: &HandlerContext<'_>, command: &Command) -> CommandResult {
    let agent = ctx.agent.clone();
    let command_id = command.id.clone();

    tokio::spawn(async move {
        let image = match agent.actuators.capture_screenshot().await {
            Ok(image) => image,
            Err(e) => {
                warn!("[CMD] Screenshot for {} not captured: {}", command_id, e);
                return;
            }
        };
        let path = format!("screenshots/{}_{}.jpg", agent.device_id, now_ms());
        match agent.store.upload_blob(&path, image).await {
            Ok(()) => info!("[CMD] Screenshot uploaded to {}", path),
            Err(e) => warn!("[CMD] Screenshot upload to {} failed: {}", path, e),
        }
    });

    CommandResult::Completed {
        message: "Screenshot requested".into(),
    }
}

/// Handle TOUCH_LOCK, TOUCH_UNLOCK, SLEEP, WAKE and REBOOT
pub async fn handle_device_control(ctx: &HandlerContext<'_>, command: &Command) -> CommandResult {
    let request = match &command.action {
        CommandAction::TouchLock => ActuatorRequest::TouchLock,
        CommandAction::TouchUnlock => ActuatorRequest::TouchUnlock,
        CommandAction::Sleep => ActuatorRequest::Sleep,
        CommandAction::Wake => ActuatorRequest::Wake,
        CommandAction::Reboot => ActuatorRequest::Reboot,
        other => {
            return CommandResult::Rejected {
                message: format!("{} is not a device control action", other),
            };
        }
    };
    let name = request.name();

    match ctx.agent.actuators.send(request).await {
        Ok(()) => CommandResult::Completed {
            message: format!("{} requested", name),
        },
        Err(e) => CommandResult::Failed {
            message: format!("{} failed: {}", name, e),
        },
    }
}
