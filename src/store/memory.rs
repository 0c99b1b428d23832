//! In-process remote store backed by broadcast channels

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use lockagent_shared::{parse_timestamp, CommandStatus, Document};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{ChangeKind, CommandChange, CommandStream, DeviceStream, RemoteStore};
use crate::error::StoreError;

const CHANNEL_CAPACITY: usize = 256;

/// An analytics event as received by the store
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyticsRecord {
    pub device_id: String,
    pub event_type: String,
    pub payload: Document,
}

/// A successful device write, timestamped with the tokio clock
#[derive(Debug, Clone)]
pub struct DeviceWrite {
    pub at: Instant,
    pub device_id: String,
    pub fields: Document,
}

#[derive(Default)]
struct State {
    devices: HashMap<String, Document>,
    commands: BTreeMap<String, Document>,
    analytics: Vec<AnalyticsRecord>,
    blobs: HashMap<String, Bytes>,
    device_writes: Vec<DeviceWrite>,
    next_command: u64,
    fail_device_writes: u32,
    fail_command_updates: u32,
    stall_device_writes: bool,
}

type DeviceUpdate = Result<(String, Document), StoreError>;
type CommandUpdate = Result<(String, CommandChange), StoreError>;

/// Remote store living in process memory.
///
/// Besides the [`RemoteStore`] contract it exposes the operator side (enqueue,
/// inspect, purge) and failure injection for tests.
pub struct MemoryStore {
    state: Mutex<State>,
    device_tx: broadcast::Sender<DeviceUpdate>,
    command_tx: broadcast::Sender<CommandUpdate>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn is_pending(doc: &Document) -> bool {
    doc.get("status")
        .and_then(Value::as_str)
        .map_or(true, |s| s == CommandStatus::Pending.as_str())
}

fn target_device(doc: &Document) -> String {
    doc.get("deviceId")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

impl MemoryStore {
    pub fn new() -> Self {
        let (device_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (command_tx, _) = broadcast::channel(CHANNEL_CAPACITY);

        Self {
            state: Mutex::new(State::default()),
            device_tx,
            command_tx,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_command(&self, id: &str, doc: &Document, kind: ChangeKind) {
        let change = CommandChange {
            kind,
            id: id.to_string(),
            fields: doc.clone(),
        };
        // No subscribers is fine
        let _ = self.command_tx.send(Ok((target_device(doc), change)));
    }

    // -- operator side ------------------------------------------------------

    /// Queue a pending command for a device; returns the assigned id
    pub fn enqueue_command(&self, device_id: &str, action: &str, parameters: Value) -> String {
        let id = {
            let mut state = self.state();
            state.next_command += 1;
            format!("cmd-{:06}", state.next_command)
        };

        let mut doc = Document::new();
        doc.insert("deviceId".into(), Value::from(device_id));
        doc.insert("action".into(), Value::from(action));
        doc.insert("parameters".into(), parameters);
        doc.insert("status".into(), Value::from(CommandStatus::Pending.as_str()));
        doc.insert("createdAt".into(), Value::from(Utc::now().to_rfc3339()));

        self.insert_command(&id, doc);
        id
    }

    /// Insert a raw command document under a chosen id
    pub fn insert_command(&self, id: &str, doc: Document) {
        self.state().commands.insert(id.to_string(), doc.clone());
        if is_pending(&doc) {
            self.publish_command(id, &doc, ChangeKind::Added);
        }
    }

    /// Re-deliver a pending command as a modification
    pub fn touch_command(&self, id: &str) {
        let doc = self.state().commands.get(id).cloned();
        if let Some(doc) = doc.filter(is_pending) {
            self.publish_command(id, &doc, ChangeKind::Modified);
        }
    }

    /// Operator write into a device document (no failure injection, not logged as a device write)
    pub fn push_device_fields(&self, device_id: &str, fields: Document) {
        let snapshot = {
            let mut state = self.state();
            let doc = state.devices.entry(device_id.to_string()).or_default();
            doc.extend(fields);
            doc.clone()
        };
        let _ = self.device_tx.send(Ok((device_id.to_string(), snapshot)));
    }

    /// Delete commands that were never processed and are older than `ttl`
    pub fn purge_expired(&self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return 0;
        };

        let expired: Vec<(String, Document)> = {
            let mut state = self.state();
            let ids: Vec<String> = state
                .commands
                .iter()
                .filter(|(_, doc)| {
                    let processed = doc.get("status").and_then(Value::as_str)
                        == Some(CommandStatus::Processed.as_str());
                    let created = doc.get("createdAt").and_then(parse_timestamp);
                    !processed && created.is_some_and(|c| now.signed_duration_since(c) > ttl)
                })
                .map(|(id, _)| id.clone())
                .collect();

            ids.into_iter()
                .filter_map(|id| state.commands.remove(&id).map(|doc| (id, doc)))
                .collect()
        };

        for (id, doc) in &expired {
            debug!("[STORE] Purged expired command {}", id);
            self.publish_command(id, doc, ChangeKind::Removed);
        }
        expired.len()
    }

    /// Break every open subscription stream with `error`
    pub fn interrupt_subscriptions(&self, error: StoreError) {
        let _ = self.device_tx.send(Err(error.clone()));
        let _ = self.command_tx.send(Err(error));
    }

    // -- failure injection ----------------------------------------------------

    pub fn fail_next_device_writes(&self, n: u32) {
        self.state().fail_device_writes = n;
    }

    pub fn fail_next_command_updates(&self, n: u32) {
        self.state().fail_command_updates = n;
    }

    /// Make device writes hang until cleared
    pub fn stall_device_writes(&self, stall: bool) {
        self.state().stall_device_writes = stall;
    }

    // -- inspection -----------------------------------------------------------

    pub fn device(&self, device_id: &str) -> Option<Document> {
        self.state().devices.get(device_id).cloned()
    }

    pub fn command(&self, command_id: &str) -> Option<Document> {
        self.state().commands.get(command_id).cloned()
    }

    pub fn analytics_events(&self) -> Vec<AnalyticsRecord> {
        self.state().analytics.clone()
    }

    pub fn blob(&self, path: &str) -> Option<Bytes> {
        self.state().blobs.get(path).cloned()
    }

    pub fn blob_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.state().blobs.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn device_writes(&self) -> Vec<DeviceWrite> {
        self.state().device_writes.clone()
    }

    /// Instants of the successful heartbeat writes, oldest first
    pub fn heartbeat_times(&self) -> Vec<Instant> {
        self.state()
            .device_writes
            .iter()
            .filter(|w| w.fields.contains_key("lastHeartbeat"))
            .map(|w| w.at)
            .collect()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn upsert_device(&self, device_id: &str, fields: Document) -> Result<(), StoreError> {
        let stall = {
            let mut state = self.state();
            if state.fail_device_writes > 0 {
                state.fail_device_writes -= 1;
                return Err(StoreError::Unavailable("injected device write failure".into()));
            }
            state.stall_device_writes
        };

        if stall {
            futures::future::pending::<()>().await;
        }

        let snapshot = {
            let mut state = self.state();
            let doc = state.devices.entry(device_id.to_string()).or_default();
            doc.extend(fields.clone());
            let snapshot = doc.clone();
            state.device_writes.push(DeviceWrite {
                at: Instant::now(),
                device_id: device_id.to_string(),
                fields,
            });
            snapshot
        };

        let _ = self.device_tx.send(Ok((device_id.to_string(), snapshot)));
        Ok(())
    }

    async fn subscribe_device(&self, device_id: &str) -> Result<DeviceStream, StoreError> {
        let (initial, rx) = {
            let state = self.state();
            (state.devices.get(device_id).cloned(), self.device_tx.subscribe())
        };

        let id = device_id.to_string();
        let updates = stream::unfold(rx, move |mut rx| {
            let id = id.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(Ok((doc_id, doc))) if doc_id == id => return Some((Ok(doc), rx)),
                        Ok(Ok(_)) => continue,
                        Ok(Err(e)) => return Some((Err(e), rx)),
                        Err(RecvError::Lagged(n)) => {
                            warn!("[STORE] Device subscription lagged by {} snapshots", n);
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream::iter(initial.map(Ok)).chain(updates).boxed())
    }

    async fn subscribe_commands(&self, device_id: &str) -> Result<CommandStream, StoreError> {
        let (initial, rx) = {
            let state = self.state();
            let pending: Vec<CommandChange> = state
                .commands
                .iter()
                .filter(|(_, doc)| target_device(doc) == device_id && is_pending(doc))
                .map(|(id, doc)| CommandChange {
                    kind: ChangeKind::Added,
                    id: id.clone(),
                    fields: doc.clone(),
                })
                .collect();
            (pending, self.command_tx.subscribe())
        };

        let id = device_id.to_string();
        let updates = stream::unfold(rx, move |mut rx| {
            let id = id.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(Ok((target, change))) if target == id => return Some((Ok(change), rx)),
                        Ok(Ok(_)) => continue,
                        Ok(Err(e)) => return Some((Err(e), rx)),
                        Err(RecvError::Lagged(n)) => {
                            warn!("[STORE] Command subscription lagged by {} changes", n);
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream::iter(initial.into_iter().map(Ok)).chain(updates).boxed())
    }

    async fn update_command(&self, command_id: &str, fields: Document) -> Result<(), StoreError> {
        let doc = {
            let mut state = self.state();
            if state.fail_command_updates > 0 {
                state.fail_command_updates -= 1;
                return Err(StoreError::Unavailable("injected command update failure".into()));
            }
            let doc = state
                .commands
                .get_mut(command_id)
                .ok_or_else(|| StoreError::NotFound(command_id.to_string()))?;
            doc.extend(fields);
            doc.clone()
        };

        let kind = if is_pending(&doc) {
            ChangeKind::Modified
        } else {
            ChangeKind::Removed
        };
        self.publish_command(command_id, &doc, kind);
        Ok(())
    }

    async fn append_analytics_event(
        &self,
        device_id: &str,
        event_type: &str,
        payload: Document,
    ) -> Result<(), StoreError> {
        self.state().analytics.push(AnalyticsRecord {
            device_id: device_id.to_string(),
            event_type: event_type.to_string(),
            payload,
        });
        Ok(())
    }

    async fn upload_blob(&self, path: &str, bytes: Bytes) -> Result<(), StoreError> {
        debug!("[STORE] Stored blob {} ({} bytes)", path, bytes.len());
        self.state().blobs.insert(path.to_string(), bytes);
        Ok(())
    }
}
