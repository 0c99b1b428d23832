//! Agent configuration

use lockagent_shared::{state_machine::BackoffPolicy, timing};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for the device agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Hardware identifier the device id is derived from
    pub hardware_id: Option<String>,
    /// Nominal heartbeat interval
    pub heartbeat_interval: Duration,
    /// Heartbeat interval while the battery is low
    pub low_battery_interval: Duration,
    /// Heartbeat interval on critical battery or in emergency mode
    pub critical_battery_interval: Duration,
    /// Consecutive reconnect attempts before giving up
    pub max_retry: u32,
    /// Reconnect delay step (delay = retry count x step)
    pub retry_step: Duration,
    /// Delay before the attempt made by a forced reconnect
    pub force_reconnect_delay: Duration,
    /// Upper bound on a registration or heartbeat write
    pub write_timeout: Duration,
    /// Commands older than this are marked failed instead of executed
    pub command_ttl: Duration,
    /// Encrypted local store file; `None` keeps state in memory
    pub state_path: Option<PathBuf>,
    pub analytics_enabled: bool,
    pub app_version: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hardware_id: Some("lock-agent-dev".into()),
            heartbeat_interval: Duration::from_millis(timing::HEARTBEAT_INTERVAL_MS),
            low_battery_interval: Duration::from_millis(timing::LOW_BATTERY_HEARTBEAT_INTERVAL_MS),
            critical_battery_interval: Duration::from_millis(
                timing::CRITICAL_BATTERY_HEARTBEAT_INTERVAL_MS,
            ),
            max_retry: timing::MAX_RETRY,
            retry_step: Duration::from_millis(timing::RETRY_STEP_MS),
            force_reconnect_delay: Duration::from_millis(timing::FORCE_RECONNECT_DELAY_MS),
            write_timeout: Duration::from_millis(timing::WRITE_TIMEOUT_MS),
            command_ttl: Duration::from_millis(timing::COMMAND_TTL_MS),
            state_path: None,
            analytics_enabled: true,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl AgentConfig {
    /// Build a configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            // An empty DEVICE_HARDWARE_ID means "no hardware id available"
            hardware_id: match env::var("DEVICE_HARDWARE_ID") {
                Ok(id) if id.trim().is_empty() => None,
                Ok(id) => Some(id),
                Err(_) => defaults.hardware_id,
            },
            heartbeat_interval: env_secs("HEARTBEAT_INTERVAL_SECS")
                .unwrap_or(defaults.heartbeat_interval),
            max_retry: env::var("MAX_RETRY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_retry),
            write_timeout: env_secs("WRITE_TIMEOUT_SECS").unwrap_or(defaults.write_timeout),
            state_path: env::var("STATE_PATH").ok().map(PathBuf::from),
            analytics_enabled: env::var("ANALYTICS_ENABLED")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.analytics_enabled),
            ..defaults
        }
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retry: self.max_retry,
            step: self.retry_step,
            force_delay: self.force_reconnect_delay,
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    env::var(name).ok().and_then(|raw| parse_secs(&raw))
}

/// Whole seconds, at least one; anything else falls back to the default
fn parse_secs(raw: &str) -> Option<Duration> {
    match raw.trim().parse::<u64>() {
        Ok(0) | Err(_) => None,
        Ok(secs) => Some(Duration::from_secs(secs)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.low_battery_interval, Duration::from_secs(180));
        assert_eq!(config.critical_battery_interval, Duration::from_secs(300));
        assert_eq!(config.command_ttl, Duration::from_secs(300));
        assert!(config.state_path.is_none());
    }

    #[test]
    fn test_interval_must_be_positive() {
        assert_eq!(parse_secs("45"), Some(Duration::from_secs(45)));
        assert_eq!(parse_secs(" 5 "), Some(Duration::from_secs(5)));
        assert_eq!(parse_secs("0"), None);
        assert_eq!(parse_secs("-3"), None);
        assert_eq!(parse_secs("soon"), None);
    }

    #[test]
    fn test_backoff_policy() {
        let config = AgentConfig {
            max_retry: 3,
            ..AgentConfig::default()
        };
        let policy = config.backoff_policy();
        assert_eq!(policy.max_retry, 3);
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.force_delay, Duration::from_secs(1));
    }
}
