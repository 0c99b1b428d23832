//! Scheduler
//!
//! Fires lock and unlock at wall-clock times without needing a connection.
//! Each alarm kind has at most one armed task; arming again replaces (and
//! cancels) the previous one. Repeating alarms re-arm themselves for the next
//! matching day after firing. The persisted [`ScheduleConfig`] is replayed at
//! boot by [`Scheduler::restore_on_boot`].

mod clock;

pub use clock::{Clock, FixedClock, SystemClock};

use chrono::{Days, NaiveDateTime};
use lockagent_shared::{
    into_document, validate_days, weekday_number, ScheduleConfig, TimeOfDay,
};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::analytics::events;
use crate::command::LockController;
use crate::context::{AgentContext, LockSource, UnlockMethod};
use crate::error::{AgentError, Result};
use crate::persistence::keys;

/// First occurrence of `time` strictly after `now` on an allowed day.
///
/// `days` uses 1 = Sunday .. 7 = Saturday; empty means every day.
pub fn next_occurrence(now: NaiveDateTime, time: TimeOfDay, days: &[u8]) -> NaiveDateTime {
    let today = now.date();
    (0..=7u64)
        .map(|offset| today + Days::new(offset))
        .filter(|date| days.is_empty() || days.contains(&weekday_number(*date)))
        .map(|date| date.and_time(time.to_naive_time()))
        .find(|candidate| *candidate > now)
        .unwrap_or_else(|| (today + Days::new(1)).and_time(time.to_naive_time()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AlarmKind {
    Lock,
    Unlock,
    /// One-shot unlock armed by a timed lock
    DurationUnlock,
}

impl AlarmKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmKind::Lock => "lock",
            AlarmKind::Unlock => "unlock",
            AlarmKind::DurationUnlock => "duration_unlock",
        }
    }
}

impl fmt::Display for AlarmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArmedAlarm {
    pub kind: AlarmKind,
    pub fire_at: NaiveDateTime,
}

#[derive(Debug, Clone)]
enum Recurrence {
    Repeating { time: TimeOfDay, days: Vec<u8> },
    Once,
}

struct Slot {
    fire_at: NaiveDateTime,
    generation: u64,
    handle: AbortHandle,
}

#[derive(Default)]
struct Alarms {
    slots: HashMap<AlarmKind, Slot>,
    generation: u64,
}

struct Inner {
    ctx: Arc<AgentContext>,
    lock: Arc<LockController>,
    alarms: Mutex<Alarms>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

fn invalid_schedule(e: impl fmt::Display) -> AgentError {
    AgentError::InvalidSchedule(e.to_string())
}

impl Scheduler {
    pub fn new(ctx: Arc<AgentContext>, lock: Arc<LockController>) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                lock,
                alarms: Mutex::new(Alarms::default()),
            }),
        }
    }

    fn alarms(&self) -> MutexGuard<'_, Alarms> {
        self.inner.alarms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock every day (empty `days`) or on the listed weekdays
    pub fn schedule_lock(&self, hour: u8, minute: u8, days: Vec<u8>) -> Result<NaiveDateTime> {
        self.schedule(AlarmKind::Lock, hour, minute, days)
    }

    pub fn schedule_unlock(&self, hour: u8, minute: u8, days: Vec<u8>) -> Result<NaiveDateTime> {
        self.schedule(AlarmKind::Unlock, hour, minute, days)
    }

    fn schedule(&self, kind: AlarmKind, hour: u8, minute: u8, days: Vec<u8>) -> Result<NaiveDateTime> {
        let time = TimeOfDay::new(hour, minute).map_err(invalid_schedule)?;
        validate_days(&days).map_err(invalid_schedule)?;

        let config = {
            let mut txn = self.inner.ctx.prefs.transaction();
            let mut config: ScheduleConfig = txn.get(keys::SCHEDULE_CONFIG)?.unwrap_or_default();
            if kind == AlarmKind::Lock {
                config.lock_time = Some(time);
            } else {
                config.unlock_time = Some(time);
            }
            config.days = days.clone();
            config.enabled = true;
            txn.put(keys::SCHEDULE_CONFIG, &config)?;
            txn.commit()?;
            config
        };

        let fire_at = self.arm(kind, time, days);
        info!("[SCHED] {} alarm armed for {}", kind, fire_at);

        // Both alarms share one weekday set; keep the other one in step with it
        let other = match kind {
            AlarmKind::Lock => config.unlock_time.map(|t| (AlarmKind::Unlock, t)),
            _ => config.lock_time.map(|t| (AlarmKind::Lock, t)),
        };
        if let Some((other, time)) = other {
            let other_at = self.arm(other, time, config.days.clone());
            debug!("[SCHED] {} alarm re-armed for {}", other, other_at);
        }

        self.mirror(config);
        Ok(fire_at)
    }

    /// Arm a one-shot unlock `minutes` from now
    pub fn schedule_lock_for_duration(&self, minutes: u32) -> Result<NaiveDateTime> {
        if minutes == 0 {
            return Err(AgentError::InvalidSchedule("duration must be positive".into()));
        }
        let fire_at = self.inner.ctx.clock.now() + chrono::Duration::minutes(minutes.into());
        self.arm_at(AlarmKind::DurationUnlock, fire_at, Recurrence::Once);
        info!("[SCHED] Unlock armed in {} minutes ({})", minutes, fire_at);
        Ok(fire_at)
    }

    /// Disarm one alarm; returns whether it was armed
    pub fn cancel(&self, kind: AlarmKind) -> bool {
        match self.alarms().slots.remove(&kind) {
            Some(slot) => {
                slot.handle.abort();
                debug!("[SCHED] {} alarm cancelled", kind);
                true
            }
            None => false,
        }
    }

    /// Disarm everything and persist the schedule as disabled
    pub fn cancel_all_schedules(&self) -> Result<()> {
        self.suspend();

        let config = {
            let mut txn = self.inner.ctx.prefs.transaction();
            let mut config: ScheduleConfig = txn.get(keys::SCHEDULE_CONFIG)?.unwrap_or_default();
            config.enabled = false;
            txn.put(keys::SCHEDULE_CONFIG, &config)?;
            txn.commit()?;
            config
        };

        info!("[SCHED] All schedules cancelled");
        self.mirror(config);
        Ok(())
    }

    /// Replace the whole schedule, e.g. from a settings screen
    pub fn apply_config(&self, config: ScheduleConfig) -> Result<Vec<ArmedAlarm>> {
        validate_days(&config.days).map_err(invalid_schedule)?;
        self.inner.ctx.prefs.save_schedule_config(&config)?;

        self.suspend();
        let armed = self.restore_on_boot()?;
        self.mirror(config);
        Ok(armed)
    }

    /// Abort alarm tasks without touching the persisted schedule
    pub fn suspend(&self) {
        for (_, slot) in self.alarms().slots.drain() {
            slot.handle.abort();
        }
    }

    /// Re-arm alarms from the persisted schedule
    pub fn restore_on_boot(&self) -> Result<Vec<ArmedAlarm>> {
        let config = self.inner.ctx.prefs.schedule_config()?;
        if !config.enabled {
            debug!("[SCHED] No enabled schedule to restore");
            return Ok(Vec::new());
        }
        validate_days(&config.days).map_err(invalid_schedule)?;

        if let Some(time) = config.lock_time {
            self.arm(AlarmKind::Lock, time, config.days.clone());
        }
        if let Some(time) = config.unlock_time {
            self.arm(AlarmKind::Unlock, time, config.days.clone());
        }

        let armed = self.armed_alarms();
        for alarm in &armed {
            info!("[SCHED] Restored {} alarm for {}", alarm.kind, alarm.fire_at);
        }
        Ok(armed)
    }

    /// Currently armed alarms, soonest first
    pub fn armed_alarms(&self) -> Vec<ArmedAlarm> {
        let mut armed: Vec<ArmedAlarm> = self
            .alarms()
            .slots
            .iter()
            .map(|(kind, slot)| ArmedAlarm {
                kind: *kind,
                fire_at: slot.fire_at,
            })
            .collect();
        armed.sort_by_key(|a| (a.fire_at, a.kind));
        armed
    }

    fn arm(&self, kind: AlarmKind, time: TimeOfDay, days: Vec<u8>) -> NaiveDateTime {
        let fire_at = next_occurrence(self.inner.ctx.clock.now(), time, &days);
        self.arm_at(kind, fire_at, Recurrence::Repeating { time, days })
    }

    fn arm_at(&self, kind: AlarmKind, fire_at: NaiveDateTime, recurrence: Recurrence) -> NaiveDateTime {
        let mut alarms = self.alarms();
        alarms.generation += 1;
        let generation = alarms.generation;

        let this = self.clone();
        let task = tokio::spawn(async move {
            this.run_alarm(kind, generation, fire_at, recurrence).await;
        });

        let slot = Slot {
            fire_at,
            generation,
            handle: task.abort_handle(),
        };
        if let Some(previous) = alarms.slots.insert(kind, slot) {
            previous.handle.abort();
        }
        fire_at
    }

    async fn run_alarm(
        &self,
        kind: AlarmKind,
        generation: u64,
        mut fire_at: NaiveDateTime,
        recurrence: Recurrence,
    ) {
        loop {
            let wait = (fire_at - self.inner.ctx.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;

            self.fire(kind).await;

            match &recurrence {
                Recurrence::Once => {
                    let mut alarms = self.alarms();
                    if alarms.slots.get(&kind).is_some_and(|s| s.generation == generation) {
                        alarms.slots.remove(&kind);
                    }
                    return;
                }
                Recurrence::Repeating { time, days } => {
                    // The wall clock may lag the timer slightly; never re-arm for the same instant
                    let from = self.inner.ctx.clock.now().max(fire_at);
                    fire_at = next_occurrence(from, *time, days);

                    let mut alarms = self.alarms();
                    match alarms.slots.get_mut(&kind) {
                        Some(slot) if slot.generation == generation => slot.fire_at = fire_at,
                        _ => return,
                    }
                    debug!("[SCHED] {} alarm re-armed for {}", kind, fire_at);
                }
            }
        }
    }

    async fn fire(&self, kind: AlarmKind) {
        let ctx = &self.inner.ctx;
        info!("[SCHED] {} alarm fired", kind);

        let (result, event) = match kind {
            AlarmKind::Lock => {
                let lock_type = ctx
                    .prefs
                    .lock_configuration()
                    .map(|c| c.lock_type)
                    .unwrap_or_default();
                let result = self.inner.lock.lock(lock_type, LockSource::Scheduled).await;
                (result, events::SCHEDULED_LOCK)
            }
            AlarmKind::Unlock => {
                let result = self.inner.lock.unlock(UnlockMethod::Scheduled).await;
                (result, events::SCHEDULED_UNLOCK)
            }
            AlarmKind::DurationUnlock => {
                let result = self.inner.lock.unlock(UnlockMethod::Duration).await;
                (result, events::SCHEDULED_UNLOCK)
            }
        };

        match result {
            Ok(changed) => ctx.analytics.emit(
                event,
                into_document(json!({"alarm": kind.as_str(), "changed": changed})),
            ),
            Err(e) => {
                error!("[SCHED] {} alarm failed: {}", kind, e);
                ctx.analytics.emit(
                    events::ERROR,
                    into_document(json!({"source": "scheduler", "alarm": kind.as_str(), "message": e.to_string()})),
                );
            }
        }
    }

    /// Mirror the schedule into the device document for operators
    fn mirror(&self, config: ScheduleConfig) {
        let ctx = self.inner.ctx.clone();
        tokio::spawn(async move {
            let fields = into_document(json!({"schedule": config.to_value()}));
            if let Err(e) = ctx.store.upsert_device(&ctx.device_id, fields).await {
                warn!("[SCHED] Could not mirror schedule: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{harness, monday_at, Harness, DEVICE_ID};
    use lockagent_shared::LockType;

    fn at(s: &str) -> TimeOfDay {
        s.parse().unwrap()
    }

    fn scheduler(h: &Harness) -> Scheduler {
        let lock = Arc::new(LockController::new(h.ctx.clone()));
        Scheduler::new(h.ctx.clone(), lock)
    }

    #[test]
    fn test_next_occurrence_daily() {
        let now = monday_at(8, 0);
        assert_eq!(next_occurrence(now, at("09:00"), &[]), monday_at(9, 0));
        // Already passed today: tomorrow
        assert_eq!(
            next_occurrence(now, at("07:00"), &[]),
            monday_at(7, 0) + chrono::Duration::days(1)
        );
        // Exactly now counts as passed
        assert_eq!(
            next_occurrence(now, at("08:00"), &[]),
            monday_at(8, 0) + chrono::Duration::days(1)
        );
    }

    #[test]
    fn test_next_occurrence_weekly() {
        let now = monday_at(8, 0); // Monday = 2
        // Friday (6) later this week
        assert_eq!(
            next_occurrence(now, at("09:00"), &[6]),
            monday_at(9, 0) + chrono::Duration::days(4)
        );
        // Monday only, time passed: next Monday
        assert_eq!(
            next_occurrence(now, at("07:00"), &[2]),
            monday_at(7, 0) + chrono::Duration::days(7)
        );
        // Sunday (1) wraps to the following Sunday
        assert_eq!(
            next_occurrence(now, at("07:00"), &[1]),
            monday_at(7, 0) + chrono::Duration::days(6)
        );
    }

    #[tokio::test]
    async fn test_rescheduling_replaces_alarm() {
        let h = harness();
        let scheduler = scheduler(&h);

        scheduler.schedule_lock(9, 0, vec![]).unwrap();
        scheduler.schedule_lock(9, 0, vec![]).unwrap();

        assert_eq!(
            scheduler.armed_alarms(),
            vec![ArmedAlarm {
                kind: AlarmKind::Lock,
                fire_at: monday_at(9, 0)
            }]
        );
        scheduler.suspend();
    }

    #[tokio::test]
    async fn test_new_days_apply_to_both_alarms() {
        let h = harness();
        let scheduler = scheduler(&h);

        // Tuesday only
        let lock_at = scheduler.schedule_lock(22, 0, vec![3]).unwrap();
        assert_eq!(lock_at, monday_at(22, 0) + chrono::Duration::days(1));

        scheduler.schedule_unlock(7, 0, vec![]).unwrap();

        let armed = scheduler.armed_alarms();
        assert_eq!(
            armed,
            vec![
                ArmedAlarm {
                    kind: AlarmKind::Lock,
                    fire_at: monday_at(22, 0)
                },
                ArmedAlarm {
                    kind: AlarmKind::Unlock,
                    fire_at: monday_at(7, 0) + chrono::Duration::days(1)
                },
            ]
        );

        // A reboot arms exactly what is armed now
        scheduler.suspend();
        assert_eq!(scheduler.restore_on_boot().unwrap(), armed);
        scheduler.suspend();
    }

    #[tokio::test]
    async fn test_boot_later_in_the_day_skips_to_tomorrow() {
        let h = harness();
        let scheduler = scheduler(&h);
        scheduler.schedule_lock(22, 0, vec![]).unwrap();
        scheduler.suspend();

        h.clock.set(monday_at(23, 30));
        let armed = scheduler.restore_on_boot().unwrap();

        assert_eq!(armed[0].fire_at, monday_at(22, 0) + chrono::Duration::days(1));
        scheduler.suspend();
    }

    #[tokio::test]
    async fn test_boot_replay_rearms_both_alarms() {
        let h = harness();
        h.ctx
            .prefs
            .save_schedule_config(&ScheduleConfig {
                lock_time: Some(at("22:00")),
                unlock_time: Some(at("07:00")),
                days: vec![],
                enabled: true,
            })
            .unwrap();

        let scheduler = scheduler(&h);
        let armed = scheduler.restore_on_boot().unwrap();

        assert_eq!(
            armed,
            vec![
                ArmedAlarm {
                    kind: AlarmKind::Lock,
                    fire_at: monday_at(22, 0)
                },
                ArmedAlarm {
                    kind: AlarmKind::Unlock,
                    fire_at: monday_at(7, 0) + chrono::Duration::days(1)
                },
            ]
        );
        scheduler.suspend();
    }

    #[tokio::test]
    async fn test_disabled_schedule_is_not_restored() {
        let h = harness();
        h.ctx
            .prefs
            .save_schedule_config(&ScheduleConfig {
                lock_time: Some(at("22:00")),
                enabled: false,
                ..ScheduleConfig::default()
            })
            .unwrap();

        assert!(scheduler(&h).restore_on_boot().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_schedules_are_rejected() {
        let h = harness();
        let scheduler = scheduler(&h);

        assert!(matches!(
            scheduler.schedule_lock(24, 0, vec![]),
            Err(AgentError::InvalidSchedule(_))
        ));
        assert!(matches!(
            scheduler.schedule_unlock(7, 0, vec![0]),
            Err(AgentError::InvalidSchedule(_))
        ));
        assert!(matches!(
            scheduler.schedule_lock_for_duration(0),
            Err(AgentError::InvalidSchedule(_))
        ));
        assert!(scheduler.armed_alarms().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_alarm_fires_and_rearms() {
        let mut h = harness();
        let scheduler = scheduler(&h);

        scheduler.schedule_lock(8, 1, vec![]).unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(h.actuator_requests(), vec!["lock"]);
        assert!(h.ctx.prefs.lock_status().unwrap().is_locked);
        assert_eq!(
            scheduler.armed_alarms(),
            vec![ArmedAlarm {
                kind: AlarmKind::Lock,
                fire_at: monday_at(8, 1) + chrono::Duration::days(1)
            }]
        );

        let persisted = h.ctx.prefs.schedule_config().unwrap();
        assert_eq!(persisted.lock_time, Some(at("08:01")));
        assert!(persisted.enabled);
        assert_eq!(
            h.store.device(DEVICE_ID).unwrap()["schedule"]["lockTime"],
            "08:01"
        );
        scheduler.suspend();
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_unlock_is_one_shot() {
        let mut h = harness();
        let lock = Arc::new(LockController::new(h.ctx.clone()));
        let scheduler = Scheduler::new(h.ctx.clone(), lock.clone());

        lock.lock(LockType::FullScreen, LockSource::Remote).await.unwrap();
        let fire_at = scheduler.schedule_lock_for_duration(30).unwrap();
        assert_eq!(fire_at, monday_at(8, 30));

        tokio::time::sleep(Duration::from_secs(30 * 60 + 1)).await;

        assert_eq!(h.actuator_requests(), vec!["lock", "unlock"]);
        assert!(!lock.status().unwrap().is_locked);
        assert!(scheduler.armed_alarms().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_all_schedules() {
        let h = harness();
        let scheduler = scheduler(&h);
        scheduler.schedule_lock(22, 0, vec![]).unwrap();
        scheduler.schedule_unlock(7, 0, vec![]).unwrap();
        scheduler.schedule_lock_for_duration(10).unwrap();
        assert_eq!(scheduler.armed_alarms().len(), 3);

        scheduler.cancel_all_schedules().unwrap();

        assert!(scheduler.armed_alarms().is_empty());
        let persisted = h.ctx.prefs.schedule_config().unwrap();
        assert!(!persisted.enabled);
        assert_eq!(persisted.lock_time, Some(at("22:00")));
        assert!(scheduler.restore_on_boot().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_config_replaces_schedule() {
        let h = harness();
        let scheduler = scheduler(&h);
        scheduler.schedule_lock(22, 0, vec![]).unwrap();

        let armed = scheduler
            .apply_config(ScheduleConfig {
                lock_time: None,
                unlock_time: Some(at("18:30")),
                days: vec![2, 3],
                enabled: true,
            })
            .unwrap();

        assert_eq!(
            armed,
            vec![ArmedAlarm {
                kind: AlarmKind::Unlock,
                fire_at: monday_at(18, 30),
            }]
        );
        assert_eq!(h.ctx.prefs.schedule_config().unwrap().days, vec![2, 3]);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let device = h.store.device(DEVICE_ID).unwrap();
        assert_eq!(device["schedule"]["unlockTime"], "18:30");
    }
}
