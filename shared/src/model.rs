//! Device data model
//!
//! Documents exchanged with the remote store are JSON objects with camelCase
//! field names. The types here convert to and from those documents; local
//! persistence serializes the same types.

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// A remote store document: identifier-keyed, field-level JSON object
pub type Document = Map<String, Value>;

/// Errors raised while reading model types out of documents
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Turn a JSON object into a [`Document`]; anything else yields an empty document
pub fn into_document(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

fn invalid(field: &'static str, reason: impl fmt::Display) -> ModelError {
    ModelError::InvalidField {
        field,
        reason: reason.to_string(),
    }
}

/// Lowercase and strip separators so `touch_lock`, `touchLock` and `TOUCH-LOCK` compare equal
fn normalize(raw: &str) -> String {
    raw.chars()
        .filter(|c| *c != '_' && *c != '-' && !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

fn to_document<T: Serialize>(value: &T) -> Document {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => Document::new(),
    }
}

/// Parse a timestamp field written either as RFC 3339 text or as epoch milliseconds
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::<Utc>::from_timestamp_millis),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Device record
// ---------------------------------------------------------------------------

/// Liveness status as written to the device document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    #[default]
    Offline,
    Reconnecting,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static hardware metadata reported at registration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HardwareInfo {
    pub device_name: String,
    pub model: String,
    pub manufacturer: String,
    pub os_version: String,
    pub app_version: String,
    pub screen_resolution: String,
    pub ram_total: u64,
    pub storage_total: u64,
    pub network_type: String,
}

/// The device document kept in the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub device_id: String,
    #[serde(default)]
    pub status: DeviceStatus,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub registered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fcm_token: Option<String>,
    #[serde(default)]
    pub battery_level: u8,
    #[serde(default)]
    pub is_charging: bool,
    #[serde(flatten)]
    pub hardware: HardwareInfo,
}

impl DeviceRecord {
    /// Read a device record out of a (possibly larger) device document
    pub fn from_document(doc: &Document) -> Result<Self, ModelError> {
        serde_json::from_value(Value::Object(doc.clone())).map_err(|e| invalid("device", e))
    }

    pub fn to_document(&self) -> Document {
        to_document(self)
    }

    /// Status an operator should display.
    ///
    /// A device whose last sign of life is older than two heartbeat intervals is
    /// offline regardless of the status it last wrote.
    pub fn effective_status(&self, now: DateTime<Utc>, heartbeat_interval: Duration) -> DeviceStatus {
        let Some(last_seen) = self.last_seen else {
            return DeviceStatus::Offline;
        };
        let age = now.signed_duration_since(last_seen);
        match chrono::Duration::from_std(heartbeat_interval * 2) {
            Ok(limit) if age > limit => DeviceStatus::Offline,
            _ => self.status,
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Operator-issued action
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CommandAction {
    Lock,
    Unlock,
    UpdateConfig,
    Restart,
    Screenshot,
    TouchLock,
    TouchUnlock,
    Sleep,
    Wake,
    Reboot,
    /// An action this agent does not know; kept verbatim
    Unknown(String),
}

impl CommandAction {
    /// Parse an action name, accepting the historical aliases
    pub fn parse(raw: &str) -> Self {
        match normalize(raw).as_str() {
            "lock" | "lockscreen" => CommandAction::Lock,
            "unlock" | "unlockscreen" => CommandAction::Unlock,
            "updateconfig" | "configupdate" => CommandAction::UpdateConfig,
            "restart" | "restartapp" => CommandAction::Restart,
            "screenshot" | "takescreenshot" => CommandAction::Screenshot,
            "touchlock" => CommandAction::TouchLock,
            "touchunlock" => CommandAction::TouchUnlock,
            "sleep" => CommandAction::Sleep,
            "wake" => CommandAction::Wake,
            "reboot" => CommandAction::Reboot,
            _ => CommandAction::Unknown(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            CommandAction::Lock => "lock",
            CommandAction::Unlock => "unlock",
            CommandAction::UpdateConfig => "update_config",
            CommandAction::Restart => "restart",
            CommandAction::Screenshot => "screenshot",
            CommandAction::TouchLock => "touch_lock",
            CommandAction::TouchUnlock => "touch_unlock",
            CommandAction::Sleep => "sleep",
            CommandAction::Wake => "wake",
            CommandAction::Reboot => "reboot",
            CommandAction::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for CommandAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a command document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    #[default]
    Pending,
    Processed,
    Failed,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Processed => "processed",
            CommandStatus::Failed => "failed",
        }
    }
}

/// A command addressed to one device
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub id: String,
    pub device_id: String,
    pub action: CommandAction,
    pub parameters: Document,
    pub status: CommandStatus,
    pub created_at: Option<DateTime<Utc>>,
}

impl Command {
    /// Build a command from its store document.
    ///
    /// The action is read from `action`, falling back to `command`.
    pub fn from_document(id: impl Into<String>, doc: &Document) -> Result<Self, ModelError> {
        let action = doc
            .get("action")
            .or_else(|| doc.get("command"))
            .and_then(Value::as_str)
            .ok_or(ModelError::MissingField("action"))?;

        let parameters = match doc.get("parameters") {
            None | Some(Value::Null) => Document::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(other) => return Err(invalid("parameters", format!("expected object, got {other}"))),
        };

        let status = match doc.get("status") {
            None => CommandStatus::Pending,
            Some(v) => serde_json::from_value(v.clone()).map_err(|e| invalid("status", e))?,
        };

        Ok(Self {
            id: id.into(),
            device_id: doc
                .get("deviceId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            action: CommandAction::parse(action),
            parameters,
            status,
            created_at: doc.get("createdAt").and_then(parse_timestamp),
        })
    }

    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("deviceId".into(), Value::from(self.device_id.clone()));
        doc.insert("action".into(), Value::from(self.action.as_str()));
        doc.insert("parameters".into(), Value::Object(self.parameters.clone()));
        doc.insert("status".into(), Value::from(self.status.as_str()));
        if let Some(created_at) = self.created_at {
            doc.insert("createdAt".into(), Value::from(created_at.to_rfc3339()));
        }
        doc
    }

    /// Check if this command is too old to execute
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let Some(created_at) = self.created_at else {
            return false; // No timestamp, never expires
        };
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now.signed_duration_since(created_at) > ttl,
            Err(_) => false,
        }
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }

    /// Integer parameter; numeric strings are accepted too
    pub fn param_i64(&self, key: &str) -> Option<i64> {
        match self.parameters.get(key)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Lock configuration and status
// ---------------------------------------------------------------------------

/// Which part of the screen the lock covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LockType {
    #[default]
    FullScreen,
    EdgeLock,
    CustomArea,
}

impl LockType {
    /// Parse a lock type, accepting the short forms used by operators (`full`, `edge`, `custom`)
    pub fn parse(raw: &str) -> Option<Self> {
        match normalize(raw).as_str() {
            "full" | "fullscreen" => Some(LockType::FullScreen),
            "edge" | "edgelock" => Some(LockType::EdgeLock),
            "custom" | "customarea" => Some(LockType::CustomArea),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LockType::FullScreen => "FULL_SCREEN",
            LockType::EdgeLock => "EDGE_LOCK",
            LockType::CustomArea => "CUSTOM_AREA",
        }
    }
}

impl TryFrom<String> for LockType {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        LockType::parse(&value).ok_or_else(|| invalid("lockType", value))
    }
}

impl From<LockType> for String {
    fn from(value: LockType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Edge selection for [`LockType::EdgeLock`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeType {
    LeftEdge,
    RightEdge,
    #[default]
    BothEdges,
}

/// Rectangle for [`LockType::CustomArea`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CustomArea {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// Versioned lock configuration.
///
/// `last_updated` (epoch milliseconds) is bumped on every write and decides
/// which side wins during reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LockConfiguration {
    pub lock_type: LockType,
    pub edge_type: EdgeType,
    pub custom_area: Option<CustomArea>,
    pub floating_button_enabled: bool,
    pub double_tap_unlock: bool,
    pub taps_to_reveal: u32,
    pub pin_unlock_enabled: bool,
    pub block_icon_enabled: bool,
    pub animation_enabled: bool,
    pub volume_button_lock: bool,
    pub auto_lock_on_boot: bool,
    pub kiosk_mode: bool,
    pub whitelist_apps: Vec<String>,
    pub last_updated: u64,
}

impl Default for LockConfiguration {
    fn default() -> Self {
        Self {
            lock_type: LockType::FullScreen,
            edge_type: EdgeType::BothEdges,
            custom_area: None,
            floating_button_enabled: true,
            double_tap_unlock: true,
            taps_to_reveal: 3,
            pin_unlock_enabled: false,
            block_icon_enabled: true,
            animation_enabled: true,
            volume_button_lock: false,
            auto_lock_on_boot: false,
            kiosk_mode: false,
            whitelist_apps: Vec::new(),
            last_updated: 0,
        }
    }
}

impl LockConfiguration {
    /// Read a configuration payload; missing fields take their defaults
    pub fn from_value(value: &Value) -> Result<Self, ModelError> {
        serde_json::from_value(value.clone()).map_err(|e| invalid("configuration", e))
    }

    /// True when the payload carried an explicit `lastUpdated`
    pub fn has_version(value: &Value) -> bool {
        value.get("lastUpdated").is_some_and(|v| !v.is_null())
    }

    pub fn to_value(&self) -> Value {
        Value::Object(to_document(self))
    }

    /// Last-write-wins comparison
    pub fn is_newer_than(&self, other: &LockConfiguration) -> bool {
        self.last_updated > other.last_updated
    }
}

/// Current lock state of the device; local only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LockStatus {
    pub is_locked: bool,
    pub lock_type: LockType,
    /// Epoch milliseconds when the current lock started
    pub start_time: u64,
    pub unlock_attempts: u32,
}

impl LockStatus {
    pub fn locked(lock_type: LockType, start_time: u64) -> Self {
        Self {
            is_locked: true,
            lock_type,
            start_time,
            unlock_attempts: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

/// Wall-clock time of day, written as `HH:MM`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    hour: u8,
    minute: u8,
}

impl TimeOfDay {
    pub fn new(hour: u8, minute: u8) -> Result<Self, ModelError> {
        if hour > 23 {
            return Err(invalid("hour", hour));
        }
        if minute > 59 {
            return Err(invalid("minute", minute));
        }
        Ok(Self { hour, minute })
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    pub fn minute(&self) -> u8 {
        self.minute
    }

    pub fn to_naive_time(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour.into(), self.minute.into(), 0).unwrap_or_default()
    }
}

impl FromStr for TimeOfDay {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hour, minute) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| invalid("time", format!("expected HH:MM, got {s:?}")))?;
        let hour = hour.parse().map_err(|_| invalid("hour", hour))?;
        let minute = minute.parse().map_err(|_| invalid("minute", minute))?;
        TimeOfDay::new(hour, minute)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(value: TimeOfDay) -> Self {
        value.to_string()
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Day number of `date`, 1 = Sunday through 7 = Saturday
pub fn weekday_number(date: NaiveDate) -> u8 {
    date.weekday().number_from_sunday() as u8
}

/// Check a weekday list (1 = Sunday .. 7 = Saturday)
pub fn validate_days(days: &[u8]) -> Result<(), ModelError> {
    match days.iter().find(|d| !(1..=7).contains(*d)) {
        Some(day) => Err(invalid("days", format!("{day} is not in 1..=7"))),
        None => Ok(()),
    }
}

/// Persisted lock/unlock schedule. An empty `days` list means every day.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScheduleConfig {
    pub lock_time: Option<TimeOfDay>,
    pub unlock_time: Option<TimeOfDay>,
    pub days: Vec<u8>,
    pub enabled: bool,
}

impl ScheduleConfig {
    pub fn to_value(&self) -> Value {
        Value::Object(to_document(self))
    }
}
