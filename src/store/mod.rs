//! Remote store contract
//!
//! The agent only needs identifier-keyed documents with field-level upsert and
//! change subscriptions. Any document database with a pub/sub channel can
//! implement [`RemoteStore`]; [`MemoryStore`] is the in-process implementation
//! used by the demo binary and the tests.

mod memory;

pub use memory::{AnalyticsRecord, MemoryStore};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use lockagent_shared::Document;

use crate::error::StoreError;

/// Kind of change reported by a command subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    /// The command left the pending set (processed, failed or deleted)
    Removed,
}

/// A change to one command document
#[derive(Debug, Clone, PartialEq)]
pub struct CommandChange {
    pub kind: ChangeKind,
    pub id: String,
    pub fields: Document,
}

/// Stream of full device-document snapshots
pub type DeviceStream = BoxStream<'static, Result<Document, StoreError>>;

/// Stream of pending-command changes
pub type CommandStream = BoxStream<'static, Result<CommandChange, StoreError>>;

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Idempotent merge-write of top-level fields into the device document
    async fn upsert_device(&self, device_id: &str, fields: Document) -> Result<(), StoreError>;

    /// Current snapshot (if any) followed by a snapshot after every change
    async fn subscribe_device(&self, device_id: &str) -> Result<DeviceStream, StoreError>;

    /// Pending commands for the device, then add/modify/remove events
    async fn subscribe_commands(&self, device_id: &str) -> Result<CommandStream, StoreError>;

    /// Merge-write fields into a command document
    async fn update_command(&self, command_id: &str, fields: Document) -> Result<(), StoreError>;

    async fn append_analytics_event(
        &self,
        device_id: &str,
        event_type: &str,
        payload: Document,
    ) -> Result<(), StoreError>;

    async fn upload_blob(&self, path: &str, bytes: Bytes) -> Result<(), StoreError>;
}
