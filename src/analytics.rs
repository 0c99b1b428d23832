//! Analytics event emission

use chrono::Utc;
use lockagent_shared::Document;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::store::RemoteStore;

/// Event names written to the analytics collection
pub mod events {
    pub const LOCK_STATUS_CHANGED: &str = "lock_status_changed";
    pub const UNLOCK_EVENT: &str = "unlock_event";
    pub const ERROR: &str = "error";
    pub const RESTART_REQUESTED: &str = "restart_requested";
    pub const SCHEDULED_LOCK: &str = "scheduled_lock";
    pub const SCHEDULED_UNLOCK: &str = "scheduled_unlock";
}

#[derive(Clone)]
pub struct Analytics {
    store: Arc<dyn RemoteStore>,
    device_id: String,
    enabled: bool,
}

impl Analytics {
    pub fn new(store: Arc<dyn RemoteStore>, device_id: impl Into<String>, enabled: bool) -> Self {
        Self {
            store,
            device_id: device_id.into(),
            enabled,
        }
    }

    fn stamped(mut payload: Document) -> Document {
        payload
            .entry("timestamp")
            .or_insert_with(|| Value::from(Utc::now().to_rfc3339()));
        payload
    }

    /// Fire-and-forget; must be called from within the runtime
    pub fn emit(&self, event_type: &'static str, payload: Document) {
        if !self.enabled {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.record(event_type, payload).await;
        });
    }

    /// Write an event and wait for the store; failures are only logged
    pub async fn record(&self, event_type: &str, payload: Document) {
        if !self.enabled {
            return;
        }
        match self
            .store
            .append_analytics_event(&self.device_id, event_type, Self::stamped(payload))
            .await
        {
            Ok(()) => debug!("Analytics event {} recorded", event_type),
            Err(e) => warn!("Analytics event {} dropped: {}", event_type, e),
        }
    }
}
