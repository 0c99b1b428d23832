//! Shared fixtures for unit tests

use bytes::Bytes;
use chrono::{NaiveDate, NaiveDateTime};
use lockagent_shared::HardwareInfo;
use std::sync::Arc;

use crate::config::AgentConfig;
use crate::context::{ActuatorRequest, AgentChannels, AgentContext, AgentEvent};
use crate::device::StaticProbe;
use crate::persistence::Preferences;
use crate::schedule::FixedClock;
use crate::store::MemoryStore;

pub(crate) const DEVICE_ID: &str = "test-device";
pub(crate) const PUSH_TOKEN: &str = "push-token-1";

pub(crate) struct Harness {
    pub ctx: Arc<AgentContext>,
    pub store: Arc<MemoryStore>,
    pub probe: Arc<StaticProbe>,
    pub clock: Arc<FixedClock>,
    pub channels: AgentChannels,
}

/// Monday 2026-01-05 at the given wall-clock time
pub(crate) fn monday_at(hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 1, 5)
        .and_then(|d| d.and_hms_opt(hour, minute, 0))
        .expect("valid test date")
}

pub(crate) fn harness() -> Harness {
    harness_with(AgentConfig::default(), Preferences::in_memory())
}

pub(crate) fn harness_with(config: AgentConfig, prefs: Preferences) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let probe = Arc::new(StaticProbe::new(
        Some(DEVICE_ID.into()),
        HardwareInfo {
            device_name: "Lobby Tablet".into(),
            model: "Tab S8".into(),
            manufacturer: "Samsung".into(),
            ..HardwareInfo::default()
        },
    )
    .with_push_token(PUSH_TOKEN));
    let clock = Arc::new(FixedClock::new(monday_at(8, 0)));

    let (ctx, channels) = AgentContext::new(config, store.clone(), prefs, probe.clone(), clock.clone())
        .expect("context");

    Harness {
        ctx,
        store,
        probe,
        clock,
        channels,
    }
}

impl Harness {
    /// Drain queued actuator requests, answering screenshot requests with a fake image
    pub fn actuator_requests(&mut self) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(request) = self.channels.actuator_rx.try_recv() {
            names.push(request.name());
            if let ActuatorRequest::CaptureScreenshot { reply } = request {
                let _ = reply.send(Ok(Bytes::from_static(b"\xff\xd8jpeg")));
            }
        }
        names
    }

    pub fn events(&mut self) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.channels.event_rx.try_recv() {
            events.push(event);
        }
        events
    }
}
