//! Configuration update command handler

use super::HandlerContext;
use crate::command::CommandResult;
use crate::error::AgentError;
use crate::reconcile::MergeOutcome;
use lockagent_shared::{now_ms, Command, LockConfiguration};
use serde_json::Value;

/// Handle UPDATE_CONFIG
///
/// The payload is `parameters.config` when present, otherwise the parameters
/// themselves. A payload without `lastUpdated` is stamped with the command's
/// creation time.
pub async fn handle_update_config(ctx: &HandlerContext<'_>, command: &Command) -> CommandResult {
    let mut payload = match command.param("config") {
        Some(Value::Object(config)) => Value::Object(config.clone()),
        Some(_) => {
            return CommandResult::Rejected {
                message: "config must be an object".into(),
            };
        }
        None => Value::Object(command.parameters.clone()),
    };

    if !LockConfiguration::has_version(&payload) {
        let stamp = command
            .created_at
            .and_then(|t| u64::try_from(t.timestamp_millis()).ok())
            .unwrap_or_else(now_ms);
        if let Value::Object(map) = &mut payload {
            map.insert("lastUpdated".into(), Value::from(stamp));
        }
    }

    match ctx.reconciler.merge(&payload).await {
        Ok(MergeOutcome::Applied(config)) => CommandResult::Completed {
            message: format!("Configuration applied (lastUpdated={})", config.last_updated),
        },
        Ok(MergeOutcome::Stale { local, remote }) => CommandResult::Completed {
            message: format!(
                "Stale configuration ignored (remote={} local={})",
                remote, local
            ),
        },
        Err(AgentError::InvalidCommand(e)) => CommandResult::Rejected {
            message: e.to_string(),
        },
        Err(e) => CommandResult::Failed {
            message: e.to_string(),
        },
    }
}
