use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AlarmError {
    #[error("invalid alarm configuration: {hour:02}:{minute:02} is not a valid time of day")]
    InvalidConfiguration { hour: u32, minute: u32 },
    #[error("invalid alarm time '{input}', expected HH:MM")]
    InvalidFormat { input: String },
    #[error("alarm {alarm} has no valid local occurrence after {anchor}")]
    NoOccurrence { alarm: Alarm, anchor: String },
    #[error("wakeup at {alarm_instant} has not been triggered")]
    NotTriggered { alarm_instant: DateTime<Utc> },
    #[error("wakeup at {alarm_instant} is already acknowledged")]
    AlreadyAcknowledged { alarm_instant: DateTime<Utc> },
    #[error("wakeup at {alarm_instant} was superseded by the wakeup at {latest}")]
    Superseded {
        alarm_instant: DateTime<Utc>,
        latest: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A daily repeating wall-clock wake-up time.
///
/// Always holds a valid time of day: construction through [`Alarm::new`]
/// rejects out-of-range values instead of wrapping them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Alarm {
    hour: u32,
    minute: u32,
}

impl Alarm {
    pub fn new(hour: u32, minute: u32) -> Result<Self, AlarmError> {
        if hour > 23 || minute > 59 {
            return Err(AlarmError::InvalidConfiguration { hour, minute });
        }
        Ok(Self { hour, minute })
    }

    /// Takes the hour and minute of a picked local time.
    pub fn from_datetime<Tz: TimeZone>(picked: &DateTime<Tz>) -> Self {
        Self {
            hour: picked.hour(),
            minute: picked.minute(),
        }
    }

    pub fn hour(&self) -> u32 {
        self.hour
    }

    pub fn minute(&self) -> u32 {
        self.minute
    }

    /// True when this alarm's time of day is strictly later than `hour:minute`.
    pub fn is_ahead_of(&self, hour: u32, minute: u32) -> bool {
        (self.hour, self.minute) > (hour, minute)
    }
}

impl fmt::Display for Alarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for Alarm {
    type Err = AlarmError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let invalid = || AlarmError::InvalidFormat {
            input: input.to_string(),
        };
        let (hour, minute) = input.trim().split_once(':').ok_or_else(invalid)?;
        let hour = hour.parse::<u32>().map_err(|_| invalid())?;
        let minute = minute.parse::<u32>().map_err(|_| invalid())?;
        Alarm::new(hour, minute)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgment {
    pub ack_instant: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_reference: Option<String>,
}

/// One alarm occurrence, pending until acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wakeup {
    pub alarm_instant: DateTime<Utc>,
    #[serde(default)]
    pub acknowledgment: Option<Acknowledgment>,
}

impl Wakeup {
    pub fn pending(alarm_instant: DateTime<Utc>) -> Self {
        Self {
            alarm_instant,
            acknowledgment: None,
        }
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledgment.is_some()
    }

    pub fn acknowledge(&mut self, ack: Acknowledgment) -> Result<(), AlarmError> {
        if self.acknowledgment.is_some() {
            return Err(AlarmError::AlreadyAcknowledged {
                alarm_instant: self.alarm_instant,
            });
        }
        self.acknowledgment = Some(ack);
        Ok(())
    }

    /// Combines two records of the same occurrence. An existing
    /// acknowledgment always survives, so records only move forward.
    pub fn merge(self, incoming: Wakeup) -> Wakeup {
        Wakeup {
            alarm_instant: self.alarm_instant,
            acknowledgment: self.acknowledgment.or(incoming.acknowledgment),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeupTriggered {
    pub user_id: UserId,
    pub alarm_instant: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub poll_interval_ms: u64,
    pub tolerance_ms: u64,
    pub lookback_ms: u64,
    pub ack_window_ms: u64,
    pub write_timeout_ms: u64,
    pub forced_volume: f32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            tolerance_ms: default_tolerance_ms(),
            lookback_ms: default_lookback_ms(),
            ack_window_ms: default_ack_window_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            forced_volume: default_forced_volume(),
        }
    }
}

impl SchedulerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms.max(1))
    }

    pub fn tolerance(&self) -> chrono::Duration {
        clamp_ms_to_duration(self.tolerance_ms)
    }

    pub fn lookback(&self) -> chrono::Duration {
        clamp_ms_to_duration(self.lookback_ms)
    }

    pub fn ack_window(&self) -> chrono::Duration {
        clamp_ms_to_duration(self.ack_window_ms)
    }

    /// The lookback anchors the next-trigger search, so a tolerance wider
    /// than it would cut off the late side of the window.
    pub fn check_window(&self) -> Result<()> {
        if self.tolerance_ms > self.lookback_ms {
            bail!(
                "tolerance_ms ({}) must not exceed lookback_ms ({})",
                self.tolerance_ms,
                self.lookback_ms
            );
        }
        Ok(())
    }
}

pub(crate) fn clamp_ms_to_duration(ms: u64) -> chrono::Duration {
    let ms_i64 = i64::try_from(ms).unwrap_or(i64::MAX);
    chrono::Duration::milliseconds(ms_i64)
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserAlarm {
    pub user_id: UserId,
    pub alarm: Alarm,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WakeyConfig {
    #[allow(dead_code)]
    pub version: u32,
    pub settings: SchedulerSettings,
    pub alarms: Vec<UserAlarm>,
}

impl WakeyConfig {
    pub fn alarm_for(&self, user_id: &UserId) -> Option<Alarm> {
        self.alarms
            .iter()
            .find(|entry| &entry.user_id == user_id)
            .map(|entry| entry.alarm)
    }

    /// Replaces the user's alarm; the previous one is discarded.
    pub fn set_alarm(&mut self, user_id: UserId, alarm: Alarm) {
        match self.alarms.iter_mut().find(|entry| entry.user_id == user_id) {
            Some(entry) => entry.alarm = alarm,
            None => self.alarms.push(UserAlarm { user_id, alarm }),
        }
    }
}

pub fn load_config(path: &Path) -> Result<WakeyConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("unable to read config file {}", path.display()))?;
    parse_config_text(&content)
}

pub fn parse_config_text(content: &str) -> Result<WakeyConfig> {
    let raw = serde_json::from_str::<ConfigFile>(content).map_err(|err| {
        let line = err.line();
        let column = err.column();
        anyhow::anyhow!("invalid JSON at line {line}, column {column}: {err}")
    })?;

    if raw.version != CONFIG_VERSION {
        bail!(
            "unsupported config version {}; expected version {CONFIG_VERSION}",
            raw.version
        );
    }
    if raw.settings.poll_interval_ms == 0 {
        bail!("settings.poll_interval_ms must be > 0");
    }
    if !(0.0..=1.0).contains(&raw.settings.forced_volume) {
        bail!(
            "settings.forced_volume must be within 0.0..=1.0, got {}",
            raw.settings.forced_volume
        );
    }

    let mut ids = HashSet::new();
    let mut alarms = Vec::with_capacity(raw.alarms.len());
    for entry in raw.alarms {
        if !ids.insert(entry.user_id.clone()) {
            bail!("duplicate alarm entry for user: {}", entry.user_id);
        }
        let alarm = Alarm::new(entry.hour, entry.minute)
            .with_context(|| format!("alarm for user '{}' rejected", entry.user_id))?;
        alarms.push(UserAlarm {
            user_id: UserId::new(entry.user_id),
            alarm,
        });
    }

    let settings = SchedulerSettings {
        poll_interval_ms: raw.settings.poll_interval_ms,
        tolerance_ms: raw.settings.tolerance_ms,
        lookback_ms: raw.settings.lookback_ms,
        ack_window_ms: raw.settings.ack_window_ms,
        write_timeout_ms: raw.settings.write_timeout_ms,
        forced_volume: raw.settings.forced_volume,
    };
    settings.check_window().context("invalid settings")?;

    Ok(WakeyConfig {
        version: raw.version,
        settings,
        alarms,
    })
}

pub fn save_config(path: &Path, config: &WakeyConfig) -> Result<()> {
    let serialized_alarms = config
        .alarms
        .iter()
        .map(|entry| {
            let mut alarm_obj = Map::new();
            alarm_obj.insert(
                "user_id".to_string(),
                Value::String(entry.user_id.as_str().to_string()),
            );
            alarm_obj.insert("hour".to_string(), Value::Number(entry.alarm.hour().into()));
            alarm_obj.insert(
                "minute".to_string(),
                Value::Number(entry.alarm.minute().into()),
            );
            Value::Object(alarm_obj)
        })
        .collect::<Vec<_>>();

    let settings = &config.settings;
    let payload = json!({
        "version": CONFIG_VERSION,
        "settings": {
            "poll_interval_ms": settings.poll_interval_ms,
            "tolerance_ms": settings.tolerance_ms,
            "lookback_ms": settings.lookback_ms,
            "ack_window_ms": settings.ack_window_ms,
            "write_timeout_ms": settings.write_timeout_ms,
            "forced_volume": settings.forced_volume
        },
        "alarms": serialized_alarms,
    });
    let text = serde_json::to_string_pretty(&payload)?;
    fs::write(path, format!("{text}\n"))
        .with_context(|| format!("unable to write config file {}", path.display()))?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    version: u32,
    #[serde(default)]
    settings: SettingsFile,
    #[serde(default)]
    alarms: Vec<AlarmFile>,
}

#[derive(Debug, Deserialize)]
struct SettingsFile {
    #[serde(default = "default_poll_interval_ms")]
    poll_interval_ms: u64,
    #[serde(default = "default_tolerance_ms")]
    tolerance_ms: u64,
    #[serde(default = "default_lookback_ms")]
    lookback_ms: u64,
    #[serde(default = "default_ack_window_ms")]
    ack_window_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    write_timeout_ms: u64,
    #[serde(default = "default_forced_volume")]
    forced_volume: f32,
}

impl Default for SettingsFile {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            tolerance_ms: default_tolerance_ms(),
            lookback_ms: default_lookback_ms(),
            ack_window_ms: default_ack_window_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            forced_volume: default_forced_volume(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AlarmFile {
    user_id: String,
    hour: u32,
    minute: u32,
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_tolerance_ms() -> u64 {
    30_000
}

fn default_lookback_ms() -> u64 {
    60_000
}

fn default_ack_window_ms() -> u64 {
    30 * 60 * 1_000
}

fn default_write_timeout_ms() -> u64 {
    2_000
}

fn default_forced_volume() -> f32 {
    1.0
}
