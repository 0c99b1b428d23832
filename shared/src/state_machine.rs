//! Connection State Machine
//!
//! Tracks the agent's link to the remote store and decides when, and how long
//! after a failure, the next connection attempt happens. Reconnect delays grow
//! linearly (`attempt * step`) and stop after `max_retry` consecutive failures.

use std::fmt;
use std::time::Duration;

use crate::model::DeviceStatus;
use crate::timing;

/// Internal link state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Not connected and nothing scheduled
    Disconnected,
    /// Registration write in flight
    Connecting,
    /// Registered; heartbeat and listeners running
    Connected,
    /// Waiting for a scheduled retry
    Backoff,
    /// Gave up after too many failures; only a forced reconnect leaves this state
    Exhausted,
}

/// Events that drive the link state
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A connection attempt is starting
    ConnectRequested,
    /// Registration succeeded
    Registered,
    /// Registration, heartbeat or a listener failed
    Failed { reason: String },
    /// A scheduled retry timer fired
    RetryDue,
    /// Orderly shutdown
    Disconnect,
    /// Operator or app asked for an immediate reconnect
    ForceReconnect,
}

/// Result of a state transition attempt
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionResult {
    /// Transition was valid and state changed
    Success(LinkState),
    /// A retry must be scheduled after `delay`
    ScheduleRetry { attempt: u32, delay: Duration },
    /// Retries are used up
    Exhausted { reason: String },
    /// Transition was invalid from current state
    Invalid { from: LinkState, event: LinkEvent },
}

/// Status surfaced to the app and written to the device document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Reconnecting,
    Disconnected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Disconnected => "disconnected",
        }
    }

    pub fn device_status(&self) -> DeviceStatus {
        match self {
            ConnectionStatus::Connected => DeviceStatus::Online,
            ConnectionStatus::Reconnecting => DeviceStatus::Reconnecting,
            ConnectionStatus::Disconnected => DeviceStatus::Offline,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reconnect timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retry: u32,
    pub step: Duration,
    pub force_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retry: timing::MAX_RETRY,
            step: Duration::from_millis(timing::RETRY_STEP_MS),
            force_delay: Duration::from_millis(timing::FORCE_RECONNECT_DELAY_MS),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.step * attempt
    }
}

/// The connection state machine
#[derive(Debug)]
pub struct ConnectionStateMachine {
    current_state: LinkState,
    retry_count: u32,
    policy: BackoffPolicy,
    last_error: Option<String>,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

impl ConnectionStateMachine {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            current_state: LinkState::Disconnected,
            retry_count: 0,
            policy,
            last_error: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.current_state
    }

    /// Consecutive failed attempts since the last successful registration
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn status(&self) -> ConnectionStatus {
        match self.current_state {
            LinkState::Connected => ConnectionStatus::Connected,
            LinkState::Backoff => ConnectionStatus::Reconnecting,
            LinkState::Connecting if self.retry_count > 0 => ConnectionStatus::Reconnecting,
            LinkState::Connecting | LinkState::Disconnected | LinkState::Exhausted => {
                ConnectionStatus::Disconnected
            }
        }
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: LinkEvent) -> TransitionResult {
        use LinkState::*;

        match (self.current_state, &event) {
            (Disconnected | Backoff | Exhausted, LinkEvent::ConnectRequested) => {
                self.enter(Connecting)
            }
            (Connecting, LinkEvent::Registered) => {
                self.retry_count = 0;
                self.last_error = None;
                self.enter(Connected)
            }
            (Connecting | Connected, LinkEvent::Failed { reason }) => {
                let reason = reason.clone();
                self.on_failure(reason)
            }
            (Backoff, LinkEvent::RetryDue) => self.enter(Connecting),
            (_, LinkEvent::Disconnect) => {
                self.retry_count = 0;
                self.enter(Disconnected)
            }
            (_, LinkEvent::ForceReconnect) => {
                self.retry_count = 0;
                self.current_state = Backoff;
                TransitionResult::ScheduleRetry {
                    attempt: 0,
                    delay: self.policy.force_delay,
                }
            }
            _ => TransitionResult::Invalid {
                from: self.current_state,
                event,
            },
        }
    }

    fn enter(&mut self, state: LinkState) -> TransitionResult {
        self.current_state = state;
        TransitionResult::Success(state)
    }

    fn on_failure(&mut self, reason: String) -> TransitionResult {
        self.last_error = Some(reason);

        if self.retry_count >= self.policy.max_retry {
            self.current_state = LinkState::Exhausted;
            return TransitionResult::Exhausted {
                reason: "max retries exceeded".to_string(),
            };
        }

        self.retry_count += 1;
        self.current_state = LinkState::Backoff;
        TransitionResult::ScheduleRetry {
            attempt: self.retry_count,
            delay: self.policy.delay_for(self.retry_count),
        }
    }
}
