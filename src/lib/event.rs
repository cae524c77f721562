use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    error::{IndexError, Result},
    model::{Address, Severity, day_for_timestamp},
};

/// Chain position of an emitted event. Orders by block, then log index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventPosition {
    pub block_number: u64,
    pub log_index: u64,
}

impl EventPosition {
    pub fn new(block_number: u64, log_index: u64) -> Self {
        Self {
            block_number,
            log_index,
        }
    }
}

impl fmt::Display for EventPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block_number, self.log_index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub block_number: u64,
    pub log_index: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
    #[serde(flatten)]
    pub event: ChainEvent,
}

impl EventEnvelope {
    pub fn new(block_number: u64, log_index: u64, event: ChainEvent) -> Self {
        Self {
            block_number,
            log_index,
            transaction_hash: None,
            event,
        }
    }

    pub fn position(&self) -> EventPosition {
        EventPosition::new(self.block_number, self.log_index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChainEvent {
    Stored(LogStored),
    Updated(LogUpdated),
    Deactivated(LogDeactivated),
    Reactivated(LogReactivated),
    BatchStored(BatchStored),
    StatsQueried(StatsQueried),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogStored {
    pub id: u64,
    pub creator: Address,
    #[serde(with = "level_code")]
    pub level: Severity,
    pub category: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogUpdated {
    pub id: u64,
    pub updater: Address,
    pub new_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_metadata: Option<String>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogDeactivated {
    pub id: u64,
    pub deactivator: Address,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogReactivated {
    pub id: u64,
    pub reactivator: Address,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStored {
    pub creator: Address,
    pub ids: Vec<u64>,
    pub count: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsQueried {
    pub querier: Address,
    pub timestamp: u64,
}

impl ChainEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ChainEvent::Stored(_) => "stored",
            ChainEvent::Updated(_) => "updated",
            ChainEvent::Deactivated(_) => "deactivated",
            ChainEvent::Reactivated(_) => "reactivated",
            ChainEvent::BatchStored(_) => "batch_stored",
            ChainEvent::StatsQueried(_) => "stats_queried",
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            ChainEvent::Stored(event) => event.timestamp,
            ChainEvent::Updated(event) => event.timestamp,
            ChainEvent::Deactivated(event) => event.timestamp,
            ChainEvent::Reactivated(event) => event.timestamp,
            ChainEvent::BatchStored(event) => event.timestamp,
            ChainEvent::StatsQueried(event) => event.timestamp,
        }
    }

    /// Shape checks the emitting contract guarantees but a JSON feed does not.
    pub fn validate(&self) -> Result<()> {
        // Every event lands in a daily bucket; reject before any write.
        day_for_timestamp(self.timestamp())?;
        match self {
            ChainEvent::Stored(event) => {
                if event.category.trim().is_empty() {
                    return Err(IndexError::InvalidEvent(format!(
                        "log {} has an empty category",
                        event.id
                    )));
                }
                // Category names become store key segments.
                if event.category.chars().any(char::is_control) {
                    return Err(IndexError::InvalidEvent(format!(
                        "log {} category contains control characters",
                        event.id
                    )));
                }
            }
            ChainEvent::BatchStored(event) => {
                if event.count != event.ids.len() as u64 {
                    return Err(IndexError::InvalidEvent(format!(
                        "batch from {} declares {} logs but lists {}",
                        event.creator,
                        event.count,
                        event.ids.len()
                    )));
                }
            }
            ChainEvent::Updated(_)
            | ChainEvent::Deactivated(_)
            | ChainEvent::Reactivated(_)
            | ChainEvent::StatsQueried(_) => {}
        }
        Ok(())
    }
}

/// Parses either a JSON array of envelopes or newline-delimited JSON.
pub fn parse_event_stream(input: &str) -> Result<Vec<EventEnvelope>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let envelopes: Vec<EventEnvelope> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)
            .map_err(|err| IndexError::InvalidEvent(format!("failed to parse event array: {err}")))?
    } else {
        let mut envelopes = Vec::new();
        for (index, line) in trimmed.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let envelope = serde_json::from_str(line).map_err(|err| {
                IndexError::InvalidEvent(format!("line {}: {err}", index + 1))
            })?;
            envelopes.push(envelope);
        }
        envelopes
    };

    for envelope in &envelopes {
        envelope.event.validate()?;
    }
    Ok(envelopes)
}

/// Severity travels as its contract integer (0-4). Symbolic names are also
/// accepted on input.
mod level_code {
    use serde::{Deserialize, Deserializer, Serializer, de::Error as DeError};

    use crate::model::Severity;

    pub fn serialize<S>(level: &Severity, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(level.level())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Severity, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Code(u64),
            Name(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Code(code) => u8::try_from(code)
                .ok()
                .and_then(Severity::from_level)
                .ok_or_else(|| DeError::custom(format!("invalid severity level {code}"))),
            Repr::Name(name) => name.parse().map_err(DeError::custom),
        }
    }
}
