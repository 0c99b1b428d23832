//! Connection manager with heartbeats and automatic reconnection

use chrono::Utc;
use futures::stream::{self, StreamExt};
use lockagent_shared::state_machine::{
    ConnectionStateMachine, ConnectionStatus, LinkEvent, LinkState, TransitionResult,
};
use lockagent_shared::{DeviceRecord, DeviceStatus, Document};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::command::CommandDispatcher;
use crate::context::{AgentContext, AgentEvent};
use crate::error::{AgentError, Result, StoreError};
use crate::power::{PowerMode, PowerPolicy};
use crate::store::CommandChange;

/// Background tasks owned by the manager. Each slot holds at most one task;
/// filling a slot aborts whatever was there.
#[derive(Default)]
struct Tasks {
    connect: Option<AbortHandle>,
    retry: Option<AbortHandle>,
    heartbeat: Option<AbortHandle>,
    listener: Option<AbortHandle>,
}

impl Tasks {
    fn replace(slot: &mut Option<AbortHandle>, handle: AbortHandle) {
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    /// Stop the heartbeat and the command listener
    fn abort_session(&mut self) {
        for slot in [&mut self.heartbeat, &mut self.listener] {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }

    fn abort_all(&mut self) {
        self.abort_session();
        for slot in [&mut self.connect, &mut self.retry] {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

struct Link {
    fsm: ConnectionStateMachine,
    /// Bumped by disconnect/force-reconnect; tasks from an older epoch are stale
    epoch: u64,
    tasks: Tasks,
}

struct Shared {
    ctx: Arc<AgentContext>,
    dispatcher: Arc<CommandDispatcher>,
    power: PowerPolicy,
    link: Mutex<Link>,
    status_tx: watch::Sender<ConnectionStatus>,
}

enum Inbound {
    Device(Document),
    Command(CommandChange),
}

/// Keeps the device registered with the remote store
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(ctx: Arc<AgentContext>, dispatcher: Arc<CommandDispatcher>) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let link = Link {
            fsm: ConnectionStateMachine::new(ctx.config.backoff_policy()),
            epoch: 0,
            tasks: Tasks::default(),
        };

        Self {
            shared: Arc::new(Shared {
                power: PowerPolicy::from_config(&ctx.config),
                ctx,
                dispatcher,
                link: Mutex::new(link),
                status_tx,
            }),
        }
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        self.shared.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ctx(&self) -> &AgentContext {
        &self.shared.ctx
    }

    pub fn status(&self) -> ConnectionStatus {
        self.link().fsm.status()
    }

    pub fn link_state(&self) -> LinkState {
        self.link().fsm.state()
    }

    pub fn retry_count(&self) -> u32 {
        self.link().fsm.retry_count()
    }

    /// Watch the connection status label
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Register the device and start the heartbeat and command listener.
    ///
    /// Returns the outcome of the first registration attempt; on failure a
    /// retry is already scheduled. Calling this while connected is a no-op.
    pub async fn initialize_connection(&self) -> Result<()> {
        let (epoch, task) = {
            let mut link = self.link();
            match link.fsm.process_event(LinkEvent::ConnectRequested) {
                TransitionResult::Success(_) => {}
                TransitionResult::Invalid { from, .. } => {
                    debug!("[CONN] Connect requested while {:?}, ignoring", from);
                    return Ok(());
                }
                other => {
                    debug!("[CONN] Unexpected transition {:?}", other);
                    return Ok(());
                }
            }
            link.epoch += 1;
            let epoch = link.epoch;
            link.tasks.abort_all();

            let this = self.clone();
            let task = tokio::spawn(async move { this.connect_attempt(epoch).await });
            Tasks::replace(&mut link.tasks.connect, task.abort_handle());
            (epoch, task)
        };
        self.publish_status();
        debug!("[CONN] Connection epoch {} started", epoch);

        match task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(AgentError::Cancelled),
            Err(e) => Err(AgentError::Registration(StoreError::Unavailable(e.to_string()))),
        }
    }

    /// Stop heartbeats, listeners and pending retries and mark the device offline.
    /// Safe to call repeatedly and while a connect attempt is in flight.
    pub async fn disconnect(&self) {
        let previous = {
            let mut link = self.link();
            link.epoch += 1;
            link.tasks.abort_all();
            let previous = link.fsm.state();
            link.fsm.process_event(LinkEvent::Disconnect);
            previous
        };
        self.publish_status();

        if previous == LinkState::Disconnected {
            debug!("[CONN] Already disconnected");
            return;
        }

        let mut fields = Document::new();
        fields.insert("status".into(), Value::from(DeviceStatus::Offline.as_str()));
        fields.insert("lastSeen".into(), Value::from(Utc::now().to_rfc3339()));
        if let Err(e) = self.timed_upsert(fields).await {
            warn!("[CONN] Could not mark device offline: {}", e);
        }

        info!("[CONN] Disconnected");
        self.ctx().notify(AgentEvent::Disconnected);
    }

    /// Drop the current link and retry once after a short delay, with the
    /// retry budget reset. Also leaves the exhausted state.
    pub fn force_reconnect(&self) {
        {
            let mut link = self.link();
            link.epoch += 1;
            let epoch = link.epoch;
            link.tasks.abort_all();

            if let TransitionResult::ScheduleRetry { delay, .. } =
                link.fsm.process_event(LinkEvent::ForceReconnect)
            {
                info!("[CONN] Forced reconnect in {:?}", delay);
                self.schedule_retry(&mut link, epoch, delay);
            }
        }
        self.publish_status();
    }

    async fn connect_attempt(&self, epoch: u64) -> Result<()> {
        info!("[CONN] Registering device {}", self.ctx().device_id);

        match self.timed_upsert(self.registration_fields()).await {
            Ok(()) => {
                self.on_registered(epoch);
                Ok(())
            }
            Err(e) => {
                let err = AgentError::Registration(e);
                self.handle_connection_error(epoch, &err);
                Err(err)
            }
        }
    }

    fn registration_fields(&self) -> Document {
        let ctx = self.ctx();
        let battery = ctx.probe.battery();
        let now = Utc::now();

        let mut hardware = ctx.probe.hardware_info();
        hardware.app_version = ctx.config.app_version.clone();

        DeviceRecord {
            device_id: ctx.device_id.clone(),
            status: DeviceStatus::Online,
            last_seen: Some(now),
            registered_at: Some(now),
            fcm_token: ctx.probe.push_token(),
            battery_level: battery.level,
            is_charging: battery.is_charging,
            hardware,
        }
        .to_document()
    }

    fn on_registered(&self, epoch: u64) {
        {
            let mut link = self.link();
            if link.epoch != epoch {
                debug!("[CONN] Registration from stale epoch {} ignored", epoch);
                return;
            }
            link.fsm.process_event(LinkEvent::Registered);

            let this = self.clone();
            let heartbeat = tokio::spawn(async move { this.heartbeat_loop(epoch).await });
            Tasks::replace(&mut link.tasks.heartbeat, heartbeat.abort_handle());

            let this = self.clone();
            let listener = tokio::spawn(async move { this.listen(epoch).await });
            Tasks::replace(&mut link.tasks.listener, listener.abort_handle());
        }

        info!("[CONN] Connected as {}", self.ctx().device_id);
        self.publish_status();
        self.ctx().notify(AgentEvent::Connected);
    }

    async fn heartbeat_loop(&self, epoch: u64) {
        loop {
            let ctx = self.ctx();
            let battery = ctx.probe.battery();
            let mode = match PowerPolicy::assess(&ctx.prefs, battery) {
                Ok(mode) => mode,
                Err(e) => {
                    warn!("[CONN] Could not evaluate power mode: {}", e);
                    PowerMode::Normal
                }
            };

            let now = Utc::now().to_rfc3339();
            let mut fields = Document::new();
            fields.insert("lastHeartbeat".into(), Value::from(now.clone()));
            fields.insert("lastSeen".into(), Value::from(now));
            fields.insert("batteryLevel".into(), Value::from(battery.level));
            fields.insert("isCharging".into(), Value::from(battery.is_charging));
            fields.insert("status".into(), Value::from(DeviceStatus::Online.as_str()));
            fields.insert("powerMode".into(), Value::from(mode.as_str()));

            if let Err(e) = self.timed_upsert(fields).await {
                self.handle_connection_error(epoch, &AgentError::Heartbeat(e));
                return;
            }

            let interval = self.shared.power.interval(mode);
            debug!(
                "[CONN] Heartbeat sent (battery {}%, {}), next in {:?}",
                battery.level, mode, interval
            );
            tokio::time::sleep(interval).await;
        }
    }

    /// Merge the device-document and pending-command subscriptions and handle
    /// events in arrival order
    async fn listen(&self, epoch: u64) {
        let ctx = self.ctx();

        let devices = match ctx.store.subscribe_device(&ctx.device_id).await {
            Ok(devices) => devices,
            Err(e) => {
                self.handle_connection_error(epoch, &AgentError::Subscription(e));
                return;
            }
        };
        let commands = match ctx.store.subscribe_commands(&ctx.device_id).await {
            Ok(commands) => commands,
            Err(e) => {
                self.handle_connection_error(epoch, &AgentError::Subscription(e));
                return;
            }
        };

        self.shared.dispatcher.begin_session();
        let mut inbound = stream::select(
            devices.map(|item| item.map(Inbound::Device)),
            commands.map(|item| item.map(Inbound::Command)),
        );

        while let Some(item) = inbound.next().await {
            match item {
                Ok(Inbound::Device(doc)) => self.shared.dispatcher.handle_device_snapshot(doc).await,
                Ok(Inbound::Command(change)) => {
                    self.shared.dispatcher.handle_command_change(change).await
                }
                Err(e) => {
                    self.handle_connection_error(epoch, &AgentError::Subscription(e));
                    return;
                }
            }
        }

        let closed = StoreError::Unavailable("subscription closed".into());
        self.handle_connection_error(epoch, &AgentError::Subscription(closed));
    }

    fn handle_connection_error(&self, epoch: u64, err: &AgentError) {
        let outcome = {
            let mut link = self.link();
            if link.epoch != epoch {
                debug!("[CONN] Ignoring error from stale epoch {}: {}", epoch, err);
                return;
            }
            link.tasks.abort_session();

            let outcome = link.fsm.process_event(LinkEvent::Failed {
                reason: err.to_string(),
            });
            if let TransitionResult::ScheduleRetry { delay, .. } = &outcome {
                self.schedule_retry(&mut link, epoch, *delay);
            }
            outcome
        };

        match outcome {
            TransitionResult::ScheduleRetry { attempt, delay } => {
                warn!("[CONN] {} (retry {} in {:?})", err, attempt, delay);
                self.ctx().notify(AgentEvent::ConnectionError {
                    message: err.to_string(),
                    exhausted: false,
                });
            }
            TransitionResult::Exhausted { reason } => {
                let exhausted = AgentError::ConnectionExhausted(reason);
                error!("[CONN] {} after: {}", exhausted, err);
                self.ctx().notify(AgentEvent::ConnectionError {
                    message: exhausted.to_string(),
                    exhausted: true,
                });
            }
            TransitionResult::Invalid { from, .. } => {
                debug!("[CONN] Error while {:?} ignored: {}", from, err);
            }
            TransitionResult::Success(_) => {}
        }
        self.publish_status();
    }

    fn schedule_retry(&self, link: &mut Link, epoch: u64, delay: Duration) {
        let this = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut link = this.link();
                if link.epoch != epoch {
                    return;
                }
                if !matches!(
                    link.fsm.process_event(LinkEvent::RetryDue),
                    TransitionResult::Success(_)
                ) {
                    return;
                }
            }
            this.publish_status();
            // Failures schedule the next retry themselves
            let _ = this.connect_attempt(epoch).await;
        });
        Tasks::replace(&mut link.tasks.retry, task.abort_handle());
    }

    /// Store write bounded by the configured timeout
    async fn timed_upsert(&self, fields: Document) -> Result<(), StoreError> {
        let ctx = self.ctx();
        let limit = ctx.config.write_timeout;
        match tokio::time::timeout(limit, ctx.store.upsert_device(&ctx.device_id, fields)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(limit)),
        }
    }

    fn publish_status(&self) {
        let status = self.status();
        let changed = self.shared.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });

        if changed {
            info!("[CONN] Status: {}", status);
            self.ctx().notify(AgentEvent::StatusChanged(status));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::LockController;
    use crate::reconcile::Reconciler;
    use crate::schedule::Scheduler;
    use crate::testing::{harness, Harness, DEVICE_ID, PUSH_TOKEN};
    use lockagent_shared::into_document;
    use serde_json::json;

    fn manager(h: &Harness) -> ConnectionManager {
        let lock = Arc::new(LockController::new(h.ctx.clone()));
        let scheduler = Scheduler::new(h.ctx.clone(), lock.clone());
        let dispatcher = Arc::new(CommandDispatcher::new(
            h.ctx.clone(),
            lock,
            Reconciler::new(h.ctx.clone()),
            scheduler,
        ));
        ConnectionManager::new(h.ctx.clone(), dispatcher)
    }

    fn gaps(times: &[tokio::time::Instant]) -> Vec<Duration> {
        times.windows(2).map(|w| w[1] - w[0]).collect()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_writes_device_record() {
        let mut h = harness();
        let m = manager(&h);

        m.initialize_connection().await.unwrap();

        assert_eq!(m.status(), ConnectionStatus::Connected);
        let device = h.store.device(DEVICE_ID).unwrap();
        assert_eq!(device["status"], "online");
        assert_eq!(device["model"], "Tab S8");
        assert_eq!(device["deviceName"], "Lobby Tablet");
        assert_eq!(device["appVersion"], env!("CARGO_PKG_VERSION"));
        assert_eq!(device["fcmToken"], PUSH_TOKEN);
        assert!(device.contains_key("registeredAt"));
        assert!(h.events().contains(&AgentEvent::Connected));

        // Already connected
        m.initialize_connection().await.unwrap();
        m.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_cadence() {
        let h = harness();
        let m = manager(&h);

        m.initialize_connection().await.unwrap();
        tokio::time::sleep(Duration::from_secs(95)).await;

        let beats = h.store.heartbeat_times();
        assert_eq!(beats.len(), 4);
        assert!(gaps(&beats).iter().all(|gap| *gap == Duration::from_secs(30)));
        m.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_battery_slows_heartbeat() {
        let h = harness();
        h.probe.set_battery(15, false);
        let m = manager(&h);

        m.initialize_connection().await.unwrap();
        tokio::time::sleep(Duration::from_secs(400)).await;

        let beats = h.store.heartbeat_times();
        assert_eq!(beats.len(), 3);
        assert!(gaps(&beats).iter().all(|gap| *gap == Duration::from_secs(180)));
        let last = h.store.device_writes().pop().unwrap();
        assert_eq!(last.fields["powerMode"], "low_battery");
        m.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_failures_reconnect_and_recover() {
        let mut h = harness();
        let m = manager(&h);

        m.initialize_connection().await.unwrap();
        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(h.store.heartbeat_times().len(), 3);
        h.events();

        // Heartbeat at 90s fails, the retry at 92s fails too
        h.store.fail_next_device_writes(2);
        tokio::time::sleep(Duration::from_secs(28)).await;
        assert_eq!(m.retry_count(), 2);
        assert_eq!(m.status(), ConnectionStatus::Reconnecting);

        // Third attempt at 96s succeeds
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(m.retry_count(), 0);
        assert_eq!(m.status(), ConnectionStatus::Connected);
        assert_eq!(h.store.heartbeat_times().len(), 4);

        let events = h.events();
        let errors = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::ConnectionError { exhausted: false, .. }))
            .count();
        assert_eq!(errors, 2);
        assert!(events.contains(&AgentEvent::StatusChanged(ConnectionStatus::Reconnecting)));
        assert_eq!(
            events.last(),
            Some(&AgentEvent::Connected)
        );
        m.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_stops_retrying_until_forced() {
        let mut h = harness();
        let m = manager(&h);

        h.store.fail_next_device_writes(u32::MAX);
        let err = m.initialize_connection().await.unwrap_err();
        assert!(matches!(err, AgentError::Registration(_)));

        // 2 + 4 + 6 + 8 + 10 seconds of backoff
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(m.link_state(), LinkState::Exhausted);
        assert_eq!(m.retry_count(), 5);
        assert_eq!(m.status(), ConnectionStatus::Disconnected);
        assert!(h.events().iter().any(|e| matches!(
            e,
            AgentEvent::ConnectionError { exhausted: true, message } if message.contains("max retries exceeded")
        )));

        h.store.fail_next_device_writes(0);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(h.store.device_writes().is_empty());

        m.force_reconnect();
        assert_eq!(m.retry_count(), 0);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(m.status(), ConnectionStatus::Connected);
        m.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_reconnect_while_connected_keeps_one_heartbeat() {
        let h = harness();
        let m = manager(&h);
        m.initialize_connection().await.unwrap();
        settle().await;
        assert_eq!(h.store.heartbeat_times().len(), 1);

        let mut status = m.subscribe_status();
        m.force_reconnect();
        m.force_reconnect();
        assert_eq!(*status.borrow_and_update(), ConnectionStatus::Reconnecting);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(status.has_changed().unwrap());
        assert_eq!(*status.borrow_and_update(), ConnectionStatus::Connected);

        // One beat before the reconnect, then a single 30s cadence from 1s on
        let beats = h.store.heartbeat_times();
        assert_eq!(beats.len(), 11);
        assert!(gaps(&beats[1..]).iter().all(|gap| *gap == Duration::from_secs(30)));
        let registrations = h
            .store
            .device_writes()
            .iter()
            .filter(|w| w.fields.contains_key("registeredAt"))
            .count();
        assert_eq!(registrations, 2);
        m.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_configuration_push_reaches_reconciler() {
        let mut h = harness();
        let m = manager(&h);
        m.initialize_connection().await.unwrap();
        settle().await;

        h.store.push_device_fields(
            DEVICE_ID,
            into_document(json!({
                "configuration": {"kioskMode": true, "lastUpdated": 5},
            })),
        );
        settle().await;

        assert!(h.ctx.prefs.lock_configuration().unwrap().kiosk_mode);
        assert_eq!(h.actuator_requests(), vec!["apply_config"]);

        // Later heartbeats echo the same document; it is not applied twice
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(h.actuator_requests().is_empty());
        m.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_inflight_attempt() {
        let h = harness();
        let m = manager(&h);

        h.store.stall_device_writes(true);
        let attempt = tokio::spawn({
            let m = m.clone();
            async move { m.initialize_connection().await }
        });
        settle().await;

        m.disconnect().await;
        h.store.stall_device_writes(false);
        assert!(matches!(attempt.await.unwrap(), Err(AgentError::Cancelled)));

        // Idempotent
        m.disconnect().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(h.store.device_writes().is_empty());
        assert_eq!(m.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_marks_offline_and_stops_heartbeat() {
        let mut h = harness();
        let m = manager(&h);

        m.initialize_connection().await.unwrap();
        m.disconnect().await;
        let beats = h.store.heartbeat_times().len();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.store.heartbeat_times().len(), beats);
        assert_eq!(h.store.device(DEVICE_ID).unwrap()["status"], "offline");
        assert!(h.events().contains(&AgentEvent::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_arrive_through_subscription() {
        let mut h = harness();
        let m = manager(&h);
        m.initialize_connection().await.unwrap();
        settle().await;

        h.store.fail_next_command_updates(1);
        let id = h.store.enqueue_command(DEVICE_ID, "lock", json!({"lockType": "EDGE_LOCK"}));
        settle().await;
        assert_eq!(h.store.command(&id).unwrap()["status"], "pending");

        // Redelivery only retries the acknowledgement
        h.store.touch_command(&id);
        settle().await;
        assert_eq!(h.store.command(&id).unwrap()["status"], "processed");
        assert_eq!(h.actuator_requests(), vec!["lock"]);
        m.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_broken_subscription_triggers_reconnect() {
        let h = harness();
        let m = manager(&h);
        m.initialize_connection().await.unwrap();
        settle().await;

        h.store
            .interrupt_subscriptions(StoreError::Unavailable("channel reset".into()));
        settle().await;
        assert_eq!(m.status(), ConnectionStatus::Reconnecting);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(m.status(), ConnectionStatus::Connected);
        let registrations = h
            .store
            .device_writes()
            .iter()
            .filter(|w| w.fields.contains_key("registeredAt"))
            .count();
        assert_eq!(registrations, 2);
        m.disconnect().await;
    }
}
