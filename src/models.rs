//! Session data models (shared types between devices and server)
//!
//! Wire format is snake_case JSON. Timestamps are RFC 3339 UTC.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;

/// Upper bound for the daily counter and manual overrides
pub const MAX_DAILY_COUNT: u32 = 1000;

/// Kind of timer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    #[default]
    Work,
    ShortBreak,
    LongBreak,
}

/// Durations and rotation rules for the work/break cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerPolicy {
    #[serde(default = "default_work_secs")]
    pub work_secs: u64,
    #[serde(default = "default_short_break_secs")]
    pub short_break_secs: u64,
    #[serde(default = "default_long_break_secs")]
    pub long_break_secs: u64,
    /// Every n-th completed work session is followed by a long break
    #[serde(default = "default_long_break_frequency")]
    pub long_break_frequency: u32,
    /// Stop after a session completes instead of rolling into the next one
    #[serde(default)]
    pub wait_for_interaction: bool,
}

fn default_work_secs() -> u64 {
    25 * 60
}

fn default_short_break_secs() -> u64 {
    5 * 60
}

fn default_long_break_secs() -> u64 {
    15 * 60
}

fn default_long_break_frequency() -> u32 {
    4
}

impl Default for TimerPolicy {
    fn default() -> Self {
        Self {
            work_secs: default_work_secs(),
            short_break_secs: default_short_break_secs(),
            long_break_secs: default_long_break_secs(),
            long_break_frequency: default_long_break_frequency(),
            wait_for_interaction: false,
        }
    }
}

impl TimerPolicy {
    pub fn duration_for(&self, session_type: SessionType) -> u64 {
        match session_type {
            SessionType::Work => self.work_secs,
            SessionType::ShortBreak => self.short_break_secs,
            SessionType::LongBreak => self.long_break_secs,
        }
    }
}

/// The authoritative timer state for one account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSession {
    pub id: String,
    pub session_type: SessionType,
    pub duration_seconds: u64,
    pub elapsed_seconds: u64,
    pub is_running: bool,
    /// Sole ordering signal for convergence
    pub revision: u64,
    /// Work sessions left (skipped or completed) since the last reset
    #[serde(default)]
    pub completed_work_sessions: u32,
    /// Diagnostic only, never used for ordering
    pub updated_at_utc: DateTime<Utc>,
}

/// Daily counter with optional manual override
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounterState {
    pub today_count: u32,
    #[serde(default)]
    pub manual_override: Option<u32>,
    #[serde(default)]
    pub last_reset_utc: Option<DateTime<Utc>>,
}

impl SessionCounterState {
    /// Value shown to the user: the override wins while present
    pub fn displayed_count(&self) -> u32 {
        self.manual_override.unwrap_or(self.today_count)
    }
}

/// Local wall-clock time at which the daily counter resets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResetTimeOfDay {
    #[default]
    Midnight,
    Hour(u32),
    Custom { hour: u32, minute: u32 },
}

impl ResetTimeOfDay {
    pub fn hour_minute(&self) -> (u32, u32) {
        match *self {
            ResetTimeOfDay::Midnight => (0, 0),
            ResetTimeOfDay::Hour(hour) => (hour, 0),
            ResetTimeOfDay::Custom { hour, minute } => (hour, minute),
        }
    }
}

impl FromStr for ResetTimeOfDay {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("midnight") {
            return Ok(ResetTimeOfDay::Midnight);
        }

        let all_digits = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());

        if let Some((h, m)) = s.split_once(':') {
            if !all_digits(h) || h.len() > 2 || m.len() != 2 || !all_digits(m) {
                return Err(SyncError::InvalidInput(format!("malformed time '{}'", s)));
            }
            let hour: u32 = h.parse().map_err(|_| invalid_time(s))?;
            let minute: u32 = m.parse().map_err(|_| invalid_time(s))?;
            if hour > 23 || minute > 59 {
                return Err(invalid_time(s));
            }
            return Ok(ResetTimeOfDay::Custom { hour, minute });
        }

        if all_digits(s) && s.len() <= 2 {
            let hour: u32 = s.parse().map_err(|_| invalid_time(s))?;
            if hour > 23 {
                return Err(SyncError::InvalidInput(format!(
                    "reset hour must be 0-23, got {}",
                    hour
                )));
            }
            return Ok(ResetTimeOfDay::Hour(hour));
        }

        Err(invalid_time(s))
    }
}

fn invalid_time(s: &str) -> SyncError {
    SyncError::InvalidInput(format!("'{}' is not a valid 24-hour time", s))
}

impl fmt::Display for ResetTimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResetTimeOfDay::Midnight => write!(f, "midnight"),
            ResetTimeOfDay::Hour(hour) => write!(f, "{:02}", hour),
            ResetTimeOfDay::Custom { hour, minute } => write!(f, "{:02}:{:02}", hour, minute),
        }
    }
}

impl Serialize for ResetTimeOfDay {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResetTimeOfDay {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// User preferences that drive the daily reset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetConfiguration {
    /// IANA timezone identifier
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub reset_time: ResetTimeOfDay,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_enabled() -> bool {
    true
}

impl Default for ResetConfiguration {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            reset_time: ResetTimeOfDay::Midnight,
            enabled: default_enabled(),
        }
    }
}

/// What caused a counter reset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Scheduled,
    Manual,
    ConfigChange,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Scheduled => "scheduled",
            TriggerKind::Manual => "manual",
            TriggerKind::ConfigChange => "config_change",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(TriggerKind::Scheduled),
            "manual" => Some(TriggerKind::Manual),
            "config_change" => Some(TriggerKind::ConfigChange),
            _ => None,
        }
    }
}

/// Append-only audit record of a counter reset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionResetEvent {
    pub id: String,
    pub session_id: String,
    pub previous_count: u32,
    pub new_count: u32,
    pub fired_at_utc: DateTime<Utc>,
    pub trigger_kind: TriggerKind,
}

/// A live channel to one client, as tracked by the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConnection {
    pub device_id: String,
    pub connected_at_utc: DateTime<Utc>,
    pub last_seen_at_utc: DateTime<Utc>,
    pub last_delivered_revision: u64,
}

/// Control commands accepted by the hub
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Start,
    Pause,
    Reset,
    Skip,
    /// Manual override of today's counter
    SetCount { count: i64 },
    /// User-initiated counter reset
    ResetCount,
    ConfigureReset {
        timezone: String,
        reset_time: String,
        enabled: bool,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Pause => "pause",
            Command::Reset => "reset",
            Command::Skip => "skip",
            Command::SetCount { .. } => "set_count",
            Command::ResetCount => "reset_count",
            Command::ConfigureReset { .. } => "configure_reset",
        }
    }
}

/// Full session view delivered to devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub timer: TimerSession,
    pub counter: SessionCounterState,
    pub reset_config: ResetConfiguration,
    #[serde(default)]
    pub next_reset_utc: Option<DateTime<Utc>>,
    pub revision: u64,
}

/// Result of a submitted command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub snapshot: SessionSnapshot,
    /// False when the command was an idempotent no-op
    pub applied: bool,
}

/// Request body for the HTTP command endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub device_id: String,
    pub command: Command,
}

/// Messages a device sends over its WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Command { request_id: String, command: Command },
    /// Pull the authoritative state (reconnect / resync)
    Fetch,
    Ping,
}

/// Messages the server pushes over a device WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    State { snapshot: SessionSnapshot },
    Ack {
        request_id: String,
        revision: u64,
        applied: bool,
    },
    Error {
        #[serde(default)]
        request_id: Option<String>,
        code: String,
        message: String,
    },
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reset_times() {
        assert_eq!("midnight".parse::<ResetTimeOfDay>().unwrap(), ResetTimeOfDay::Midnight);
        assert_eq!("7".parse::<ResetTimeOfDay>().unwrap(), ResetTimeOfDay::Hour(7));
        assert_eq!("07".parse::<ResetTimeOfDay>().unwrap(), ResetTimeOfDay::Hour(7));
        assert_eq!(
            "23:45".parse::<ResetTimeOfDay>().unwrap(),
            ResetTimeOfDay::Custom {
                hour: 23,
                minute: 45
            }
        );
    }

    #[test]
    fn rejects_malformed_reset_times() {
        for bad in ["24", "24:00", "12:60", "7:5", "noon", "", "-1", "12:3a", "123"] {
            assert!(
                matches!(bad.parse::<ResetTimeOfDay>(), Err(SyncError::InvalidInput(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn reset_time_serializes_as_string() {
        let config = ResetConfiguration {
            timezone: "Europe/Berlin".to_string(),
            reset_time: ResetTimeOfDay::Custom { hour: 4, minute: 30 },
            enabled: true,
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["reset_time"], "04:30");

        let back: ResetConfiguration = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn override_wins_for_display() {
        let mut counter = SessionCounterState {
            today_count: 3,
            ..Default::default()
        };
        assert_eq!(counter.displayed_count(), 3);
        counter.manual_override = Some(15);
        assert_eq!(counter.displayed_count(), 15);
    }

    #[test]
    fn command_wire_format() {
        let cmd: Command = serde_json::from_str(r#"{"type":"set_count","count":15}"#).unwrap();
        assert_eq!(cmd, Command::SetCount { count: 15 });

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"command","request_id":"r1","command":{"type":"start"}}"#)
                .unwrap();
        assert!(matches!(
            msg,
            ClientMessage::Command {
                command: Command::Start,
                ..
            }
        ));
    }
}
