//! Agent context
//!
//! Every component receives the same [`AgentContext`]: configuration, device
//! identity and handles to all collaborators. Local collaborators are reached
//! through channels: actuation requests go down an [`ActuatorRequest`] queue
//! and notifications go up as [`AgentEvent`]s.

use bytes::Bytes;
use lockagent_shared::{state_machine::ConnectionStatus, LockConfiguration, LockType};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::analytics::Analytics;
use crate::config::AgentConfig;
use crate::device::{derive_device_id, DeviceProbe};
use crate::error::{ActuatorError, PersistenceError};
use crate::persistence::Preferences;
use crate::schedule::Clock;
use crate::store::RemoteStore;

const ACTUATOR_QUEUE: usize = 64;

/// What started a lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockSource {
    Remote,
    Scheduled,
    Boot,
}

/// What ended a lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockMethod {
    Remote,
    Scheduled,
    Duration,
}

impl LockSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockSource::Remote => "remote",
            LockSource::Scheduled => "scheduled",
            LockSource::Boot => "boot",
        }
    }
}

impl UnlockMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnlockMethod::Remote => "remote",
            UnlockMethod::Scheduled => "scheduled",
            UnlockMethod::Duration => "duration",
        }
    }
}

/// Requests handled by the local actuator layer (overlay, kiosk, power)
#[derive(Debug)]
pub enum ActuatorRequest {
    Lock { lock_type: LockType },
    Unlock,
    ApplyConfig(LockConfiguration),
    Restart,
    CaptureScreenshot {
        reply: oneshot::Sender<Result<Bytes, ActuatorError>>,
    },
    TouchLock,
    TouchUnlock,
    Sleep,
    Wake,
    Reboot,
}

impl ActuatorRequest {
    pub fn name(&self) -> &'static str {
        match self {
            ActuatorRequest::Lock { .. } => "lock",
            ActuatorRequest::Unlock => "unlock",
            ActuatorRequest::ApplyConfig(_) => "apply_config",
            ActuatorRequest::Restart => "restart",
            ActuatorRequest::CaptureScreenshot { .. } => "screenshot",
            ActuatorRequest::TouchLock => "touch_lock",
            ActuatorRequest::TouchUnlock => "touch_unlock",
            ActuatorRequest::Sleep => "sleep",
            ActuatorRequest::Wake => "wake",
            ActuatorRequest::Reboot => "reboot",
        }
    }
}

impl fmt::Display for ActuatorRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Sending side of the actuator queue
#[derive(Clone)]
pub struct ActuatorHandle {
    tx: mpsc::Sender<ActuatorRequest>,
}

impl ActuatorHandle {
    pub async fn send(&self, request: ActuatorRequest) -> Result<(), ActuatorError> {
        self.tx
            .send(request)
            .await
            .map_err(|_| ActuatorError::Unavailable)
    }

    /// Ask the actuator layer for a screenshot and wait for the image
    pub async fn capture_screenshot(&self) -> Result<Bytes, ActuatorError> {
        let (reply, rx) = oneshot::channel();
        self.send(ActuatorRequest::CaptureScreenshot { reply }).await?;
        rx.await.map_err(|_| ActuatorError::Unavailable)?
    }
}

/// Notifications for the hosting app
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Connected,
    Disconnected,
    ConnectionError { message: String, exhausted: bool },
    StatusChanged(ConnectionStatus),
    Locked { lock_type: LockType, source: LockSource },
    Unlocked { method: UnlockMethod },
    ConfigApplied(LockConfiguration),
}

/// Receiving ends handed to the hosting app
pub struct AgentChannels {
    pub actuator_rx: mpsc::Receiver<ActuatorRequest>,
    pub event_rx: mpsc::UnboundedReceiver<AgentEvent>,
}

/// Shared state and collaborator handles for one device agent
pub struct AgentContext {
    pub config: AgentConfig,
    pub device_id: String,
    pub store: Arc<dyn RemoteStore>,
    pub prefs: Preferences,
    pub probe: Arc<dyn DeviceProbe>,
    pub actuators: ActuatorHandle,
    pub analytics: Analytics,
    pub clock: Arc<dyn Clock>,
    events: mpsc::UnboundedSender<AgentEvent>,
}

impl AgentContext {
    /// Build the context, resolving the device id from local storage or hardware
    pub fn new(
        config: AgentConfig,
        store: Arc<dyn RemoteStore>,
        prefs: Preferences,
        probe: Arc<dyn DeviceProbe>,
        clock: Arc<dyn Clock>,
    ) -> Result<(Arc<Self>, AgentChannels), PersistenceError> {
        let device_id = derive_device_id(&prefs, probe.as_ref())?;
        let (actuator_tx, actuator_rx) = mpsc::channel(ACTUATOR_QUEUE);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let analytics = Analytics::new(store.clone(), device_id.clone(), config.analytics_enabled);

        let ctx = Arc::new(Self {
            config,
            device_id,
            store,
            prefs,
            probe,
            actuators: ActuatorHandle { tx: actuator_tx },
            analytics,
            clock,
            events: event_tx,
        });

        Ok((
            ctx,
            AgentChannels {
                actuator_rx,
                event_rx,
            },
        ))
    }

    pub fn notify(&self, event: AgentEvent) {
        if self.events.send(event).is_err() {
            debug!("Agent event receiver dropped");
        }
    }
}
