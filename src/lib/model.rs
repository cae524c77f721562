use std::{fmt, str::FromStr};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as DeError};

use crate::{
    error::{IndexError, Result},
    event::EventPosition,
};

pub const SECONDS_PER_DAY: u64 = 86_400;

/// A 20-byte account address, always held as lowercase `0x`-prefixed hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(String);

impl Address {
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        if digits.len() != 40 {
            return Err(IndexError::InvalidEvent(format!(
                "address '{input}' must contain 40 hex digits"
            )));
        }
        hex::decode(digits).map_err(|err| {
            IndexError::InvalidEvent(format!("address '{input}' is not valid hex: {err}"))
        })?;
        Ok(Self(format!("0x{}", digits.to_ascii_lowercase())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = IndexError;

    fn from_str(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Address::parse(&raw).map_err(DeError::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Severity {
    pub const ALL: [Severity; 5] = [
        Severity::Debug,
        Severity::Info,
        Severity::Warn,
        Severity::Error,
        Severity::Fatal,
    ];

    pub fn from_level(level: u8) -> Option<Self> {
        Self::ALL.get(usize::from(level)).copied()
    }

    pub fn level(self) -> u8 {
        match self {
            Severity::Debug => 0,
            Severity::Info => 1,
            Severity::Warn => 2,
            Severity::Error => 3,
            Severity::Fatal => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_uppercase();
        match normalized.as_str() {
            "DEBUG" | "0" => Ok(Severity::Debug),
            "INFO" | "1" => Ok(Severity::Info),
            "WARN" | "WARNING" | "2" => Ok(Severity::Warn),
            "ERROR" | "3" => Ok(Severity::Error),
            "FATAL" | "4" => Ok(Severity::Fatal),
            _ => Err(format!("unsupported severity level '{value}'")),
        }
    }
}

/// Per-severity tallies for the global and daily rollups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelCounts {
    pub debug: u64,
    pub info: u64,
    pub warn: u64,
    pub error: u64,
    pub fatal: u64,
}

impl LevelCounts {
    pub fn increment(&mut self, level: Severity) {
        *self.slot(level) += 1;
    }

    pub fn get(&self, level: Severity) -> u64 {
        match level {
            Severity::Debug => self.debug,
            Severity::Info => self.info,
            Severity::Warn => self.warn,
            Severity::Error => self.error,
            Severity::Fatal => self.fatal,
        }
    }

    pub fn total(&self) -> u64 {
        self.debug + self.info + self.warn + self.error + self.fatal
    }

    fn slot(&mut self, level: Severity) -> &mut u64 {
        match level {
            Severity::Debug => &mut self.debug,
            Severity::Info => &mut self.info,
            Severity::Warn => &mut self.warn,
            Severity::Error => &mut self.error,
            Severity::Fatal => &mut self.fatal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterFault {
    /// `active_logs` would drop below zero.
    Underflow,
    /// `active_logs` would exceed `total_logs`.
    ExceedsTotal,
}

impl fmt::Display for CounterFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CounterFault::Underflow => f.write_str("active count underflow"),
            CounterFault::ExceedsTotal => f.write_str("active count exceeds total"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogCounters {
    pub total_logs: u64,
    pub active_logs: u64,
    #[serde(default)]
    pub first_log_at: Option<u64>,
    #[serde(default)]
    pub last_log_at: Option<u64>,
}

impl LogCounters {
    pub fn record_log(&mut self, timestamp: u64) {
        self.total_logs += 1;
        self.active_logs += 1;
        self.first_log_at = Some(match self.first_log_at {
            Some(first) => first.min(timestamp),
            None => timestamp,
        });
        self.last_log_at = Some(match self.last_log_at {
            Some(last) => last.max(timestamp),
            None => timestamp,
        });
    }

    pub fn deactivate(&mut self) -> std::result::Result<(), CounterFault> {
        self.active_logs = self
            .active_logs
            .checked_sub(1)
            .ok_or(CounterFault::Underflow)?;
        Ok(())
    }

    pub fn reactivate(&mut self) -> std::result::Result<(), CounterFault> {
        if self.active_logs >= self.total_logs {
            return Err(CounterFault::ExceedsTotal);
        }
        self.active_logs += 1;
        Ok(())
    }

    pub fn is_consistent(&self) -> bool {
        self.active_logs <= self.total_logs
    }
}

/// Records that remember the last event applied to them, so redelivered
/// events are ignored per entity.
pub trait Tracked {
    fn last_event(&self) -> Option<EventPosition>;
    fn set_last_event(&mut self, position: EventPosition);

    fn accepts(&self, position: EventPosition) -> bool {
        self.last_event().is_none_or(|last| position > last)
    }
}

macro_rules! impl_tracked {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl Tracked for $ty {
                fn last_event(&self) -> Option<EventPosition> {
                    self.last_event
                }

                fn set_last_event(&mut self, position: EventPosition) {
                    self.last_event = Some(position);
                }
            }
        )+
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: u64,
    pub creator: Address,
    pub level: Severity,
    pub category: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
    pub created_at: u64,
    pub block_number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
    pub active: bool,
    #[serde(default)]
    pub update_count: u64,
    #[serde(default)]
    pub updated_at: Option<u64>,
    #[serde(default)]
    pub last_event: Option<EventPosition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogUpdate {
    pub log_id: u64,
    pub sequence: u64,
    pub updater: Address,
    pub previous_message: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
    pub timestamp: u64,
    pub block_number: u64,
    pub position: EventPosition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub creator: Address,
    pub log_ids: Vec<u64>,
    pub count: u64,
    pub timestamp: u64,
    pub block_number: u64,
    pub position: EventPosition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub address: Address,
    #[serde(flatten)]
    pub counters: LogCounters,
    #[serde(default)]
    pub updates_made: u64,
    pub first_seen_at: u64,
    /// Event that first referenced this address.
    #[serde(default)]
    pub first_event: Option<EventPosition>,
    #[serde(default)]
    pub last_event: Option<EventPosition>,
}

impl UserRecord {
    pub fn new(address: Address, first_seen_at: u64) -> Self {
        Self {
            address,
            counters: LogCounters::default(),
            updates_made: 0,
            first_seen_at,
            first_event: None,
            last_event: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRecord {
    pub name: String,
    #[serde(flatten)]
    pub counters: LogCounters,
    #[serde(default)]
    pub first_event: Option<EventPosition>,
    #[serde(default)]
    pub last_event: Option<EventPosition>,
}

impl CategoryRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            counters: LogCounters::default(),
            first_event: None,
            last_event: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCategoryRecord {
    pub user: Address,
    pub category: String,
    #[serde(flatten)]
    pub counters: LogCounters,
    #[serde(default)]
    pub last_event: Option<EventPosition>,
}

impl UserCategoryRecord {
    pub fn new(user: Address, category: impl Into<String>) -> Self {
        Self {
            user,
            category: category.into(),
            counters: LogCounters::default(),
            last_event: None,
        }
    }
}

/// Append-only per-day ledger. Deactivation never rewrites history here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyStats {
    pub day: NaiveDate,
    pub day_start: u64,
    pub total_logs: u64,
    pub levels: LevelCounts,
    #[serde(default)]
    pub updates: u64,
    #[serde(default)]
    pub last_event: Option<EventPosition>,
}

impl DailyStats {
    pub fn new(day: NaiveDate) -> Self {
        Self {
            day,
            day_start: day_start(day),
            total_logs: 0,
            levels: LevelCounts::default(),
            updates: 0,
            last_event: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalStats {
    pub total_logs: u64,
    pub active_logs: u64,
    pub levels: LevelCounts,
    pub total_users: u64,
    pub total_categories: u64,
    pub total_updates: u64,
    pub total_batches: u64,
    #[serde(default)]
    pub last_event: Option<EventPosition>,
}

impl GlobalStats {
    pub fn active_counters(&self) -> LogCounters {
        LogCounters {
            total_logs: self.total_logs,
            active_logs: self.active_logs,
            first_log_at: None,
            last_log_at: None,
        }
    }
}

impl_tracked!(
    LogEntry,
    UserRecord,
    CategoryRecord,
    UserCategoryRecord,
    DailyStats,
    GlobalStats,
);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestCursor {
    pub position: Option<EventPosition>,
    pub events_applied: u64,
    pub events_skipped: u64,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityFault {
    pub entity: String,
    pub counter: String,
    pub detail: String,
    pub position: EventPosition,
    pub detected_at: DateTime<Utc>,
}

/// UTC calendar day containing the given unix timestamp.
pub fn day_for_timestamp(timestamp: u64) -> Result<NaiveDate> {
    let seconds = i64::try_from(timestamp).map_err(|_| {
        IndexError::InvalidEvent(format!("timestamp {timestamp} is out of range"))
    })?;
    DateTime::<Utc>::from_timestamp(seconds, 0)
        .map(|moment| moment.date_naive())
        .ok_or_else(|| IndexError::InvalidEvent(format!("timestamp {timestamp} is out of range")))
}

pub fn day_start(day: NaiveDate) -> u64 {
    day.and_hms_opt(0, 0, 0)
        .map(|moment| moment.and_utc().timestamp())
        .and_then(|seconds| u64::try_from(seconds).ok())
        .unwrap_or(0)
}
