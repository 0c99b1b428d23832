//! Command dispatcher - de-duplicates, executes and acknowledges commands

use super::handlers::{self, HandlerContext};
use super::LockController;
use crate::analytics::events;
use crate::context::AgentContext;
use crate::error::{AgentError, StoreError};
use crate::reconcile::Reconciler;
use crate::schedule::Scheduler;
use crate::store::{ChangeKind, CommandChange};
use chrono::Utc;
use lockagent_shared::{into_document, Command, CommandAction, CommandStatus, Document};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Result of command execution
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    /// Command completed successfully
    Completed { message: String },
    /// Command accepted but the actuator failed
    Failed { message: String },
    /// Command refused (bad parameters, expired, etc.)
    Rejected { message: String },
}

/// Per-connection bookkeeping. Reset every time the listener (re)subscribes.
#[derive(Default)]
struct Session {
    id: String,
    /// Commands already executed in this session
    executed: HashSet<String>,
    /// Executed commands whose acknowledgement write has not gone through yet
    unacked: HashMap<String, Document>,
    /// Ids of embedded device-document commands already executed
    embedded: HashSet<String>,
    /// Body of the id-less embedded command still sitting in the device document
    embedded_body: Option<String>,
}

enum Delivery {
    New,
    Duplicate,
    AwaitingAck(Document),
}

/// Executes commands received from the remote store
pub struct CommandDispatcher {
    ctx: Arc<AgentContext>,
    lock: Arc<LockController>,
    reconciler: Reconciler,
    scheduler: Scheduler,
    session: Mutex<Session>,
}

impl CommandDispatcher {
    pub fn new(
        ctx: Arc<AgentContext>,
        lock: Arc<LockController>,
        reconciler: Reconciler,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            ctx,
            lock,
            reconciler,
            scheduler,
            session: Mutex::new(Session::default()),
        }
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forget everything seen in the previous connection session
    pub fn begin_session(&self) {
        let mut session = self.session();
        *session = Session {
            id: Uuid::new_v4().to_string(),
            ..Session::default()
        };
        debug!("[CMD] Command session {} started", session.id);
    }

    /// Number of commands executed in the current session
    pub fn executed_count(&self) -> usize {
        self.session().executed.len()
    }

    fn classify(&self, command_id: &str) -> Delivery {
        let session = self.session();
        if let Some(fields) = session.unacked.get(command_id) {
            Delivery::AwaitingAck(fields.clone())
        } else if session.executed.contains(command_id) {
            Delivery::Duplicate
        } else {
            Delivery::New
        }
    }

    /// Handle one change from the pending-command subscription
    pub async fn handle_command_change(&self, change: CommandChange) {
        if change.kind == ChangeKind::Removed {
            debug!("[CMD] Command {} left the pending set", change.id);
            return;
        }

        match self.classify(&change.id) {
            Delivery::Duplicate => {
                debug!("[CMD] Ignoring duplicate delivery of {}", change.id);
                return;
            }
            Delivery::AwaitingAck(fields) => {
                info!("[CMD] Retrying acknowledgement of {}", change.id);
                self.acknowledge(&change.id, fields).await;
                return;
            }
            Delivery::New => {}
        }

        let command = match Command::from_document(&change.id, &change.fields) {
            Ok(command) => command,
            Err(e) => {
                warn!("[CMD] Malformed command {}: {}", change.id, e);
                let fields = ack_fields(CommandStatus::Failed, "failureReason", &e.to_string());
                self.record_executed(&change.id, &fields);
                self.acknowledge(&change.id, fields).await;
                return;
            }
        };

        if command.status != CommandStatus::Pending {
            debug!(
                "[CMD] Skipping {} (status {})",
                command.id,
                command.status.as_str()
            );
            return;
        }
        if !command.device_id.is_empty() && command.device_id != self.ctx.device_id {
            warn!(
                "[CMD] Command {} is addressed to {}, not this device",
                command.id, command.device_id
            );
            return;
        }

        let fields = self.process(&command).await;
        self.record_executed(&command.id, &fields);
        self.acknowledge(&command.id, fields).await;
    }

    /// Handle a snapshot of the device's own document.
    ///
    /// The document may carry a one-shot `remoteCommand` and a `configuration`
    /// payload for the reconciler.
    pub async fn handle_device_snapshot(&self, doc: Document) {
        match doc.get("remoteCommand") {
            Some(Value::Object(embedded)) => self.handle_embedded_command(embedded).await,
            // Cleared: the same body may be sent again
            _ => self.session().embedded_body = None,
        }

        if let Some(config @ Value::Object(_)) = doc.get("configuration") {
            if let Err(e) = self.reconciler.merge(config).await {
                warn!("[SYNC] Remote configuration not applied: {}", e);
            }
        }
    }

    async fn handle_embedded_command(&self, embedded: &Document) {
        let explicit_id = embedded.get("id").and_then(Value::as_str);
        let first_sight = {
            let mut session = self.session();
            match explicit_id {
                Some(id) => session.embedded.insert(id.to_string()),
                None => {
                    let body = Value::Object(embedded.clone()).to_string();
                    let seen = session.embedded_body.as_deref() == Some(body.as_str());
                    session.embedded_body = Some(body);
                    !seen
                }
            }
        };
        if !first_sight {
            debug!("[CMD] Embedded command already handled");
            return;
        }

        let command_id = explicit_id
            .map(str::to_string)
            .unwrap_or_else(|| format!("embedded-{}", Uuid::new_v4()));
        let command = match Command::from_document(&command_id, embedded) {
            Ok(command) => command,
            Err(e) => {
                warn!("[CMD] Malformed embedded command: {}", e);
                return;
            }
        };
        if command.status != CommandStatus::Pending {
            return;
        }

        let result = self.process(&command).await;
        let mut clear = Document::new();
        clear.insert("remoteCommand".into(), Value::Null);
        clear.insert("remoteCommandProcessedAt".into(), Value::from(Utc::now().to_rfc3339()));
        clear.insert("remoteCommandResult".into(), Value::Object(result));
        if let Err(e) = self.ctx.store.upsert_device(&self.ctx.device_id, clear).await {
            warn!("[CMD] Could not clear embedded command: {}", e);
        }
    }

    /// Run one command and build the acknowledgement fields
    async fn process(&self, command: &Command) -> Document {
        if command.is_expired(Utc::now(), self.ctx.config.command_ttl) {
            warn!("[CMD] Command {} expired before execution", command.id);
            return ack_fields(CommandStatus::Failed, "failureReason", "expired");
        }

        info!(
            "[CMD] Executing command: id={} action={}",
            command.id, command.action
        );

        match self.execute(command).await {
            CommandResult::Completed { message } => {
                info!("[CMD] Command {} completed: {}", command.id, message);
                ack_fields(CommandStatus::Processed, "result", &message)
            }
            CommandResult::Failed { message } => {
                let err = AgentError::CommandExecution {
                    command_id: command.id.clone(),
                    message: message.clone(),
                };
                error!("[CMD] {}", err);
                self.ctx.analytics.emit(
                    events::ERROR,
                    into_document(json!({
                        "commandId": command.id,
                        "action": command.action.as_str(),
                        "message": message,
                    })),
                );
                ack_fields(CommandStatus::Processed, "errorMessage", &message)
            }
            CommandResult::Rejected { message } => {
                warn!("[CMD] Command {} rejected: {}", command.id, message);
                ack_fields(CommandStatus::Failed, "failureReason", &message)
            }
        }
    }

    /// Dispatch a command to its handler
    pub async fn execute(&self, command: &Command) -> CommandResult {
        let ctx = HandlerContext {
            agent: &self.ctx,
            lock: &self.lock,
            reconciler: &self.reconciler,
            scheduler: &self.scheduler,
        };

        match &command.action {
            CommandAction::Lock => handlers::handle_lock(&ctx, command).await,
            CommandAction::Unlock => handlers::handle_unlock(&ctx, command).await,
            CommandAction::UpdateConfig => handlers::handle_update_config(&ctx, command).await,
            CommandAction::Restart => handlers::handle_restart(&ctx, command).await,
            CommandAction::Screenshot => handlers::handle_screenshot(&ctx, command).await,
            CommandAction::TouchLock
            | CommandAction::TouchUnlock
            | CommandAction::Sleep
            | CommandAction::Wake
            | CommandAction::Reboot => handlers::handle_device_control(&ctx, command).await,
            CommandAction::Unknown(action) => {
                // Acknowledged so unknown actions do not come back forever
                warn!("[CMD] Unknown action {:?}, acknowledging", action);
                CommandResult::Completed {
                    message: format!("Unknown action {} ignored", action),
                }
            }
        }
    }

    fn record_executed(&self, command_id: &str, fields: &Document) {
        let mut session = self.session();
        session.executed.insert(command_id.to_string());
        session.unacked.insert(command_id.to_string(), fields.clone());
    }

    /// Write the acknowledgement; on failure it stays queued for the next delivery
    async fn acknowledge(&self, command_id: &str, fields: Document) {
        let write = self.ctx.store.update_command(command_id, fields);
        let outcome = match tokio::time::timeout(self.ctx.config.write_timeout, write).await {
            Ok(outcome) => outcome,
            Err(_) => Err(StoreError::Timeout(self.ctx.config.write_timeout)),
        };

        match outcome {
            Ok(()) => {
                self.session().unacked.remove(command_id);
                debug!("[CMD] Acknowledged {}", command_id);
            }
            Err(e) => warn!(
                "[CMD] Acknowledgement of {} failed, will retry on next delivery: {}",
                command_id, e
            ),
        }
    }
}

fn ack_fields(status: CommandStatus, key: &str, message: &str) -> Document {
    let mut fields = Document::new();
    fields.insert("status".into(), Value::from(status.as_str()));
    fields.insert("processedAt".into(), Value::from(Utc::now().to_rfc3339()));
    fields.insert(key.into(), Value::from(message));
    fields
}
