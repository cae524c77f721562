use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{
    client::FetchedLog,
    model::{Address, Severity},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// Submitted locally, not yet seen by the indexer.
    Pending,
    Confirmed,
}

/// One row of a user's log history, either held locally after submission or
/// fetched from an indexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    #[serde(default)]
    pub log_id: Option<u64>,
    #[serde(default)]
    pub transaction_hash: Option<String>,
    pub creator: Address,
    pub level: Severity,
    pub category: String,
    pub message: String,
    pub timestamp: u64,
    pub status: RecordStatus,
}

impl HistoryRecord {
    fn matches(&self, needle: &str) -> bool {
        self.message.to_lowercase().contains(needle)
            || self.category.to_lowercase().contains(needle)
            || self.creator.as_str().contains(needle)
    }
}

impl TryFrom<FetchedLog> for HistoryRecord {
    type Error = std::num::ParseIntError;

    fn try_from(value: FetchedLog) -> Result<Self, Self::Error> {
        Ok(Self {
            log_id: Some(value.id.parse()?),
            transaction_hash: value.transaction_hash,
            creator: value.creator,
            level: value.level,
            category: value.category,
            message: value.message,
            timestamp: value.timestamp,
            status: RecordStatus::Confirmed,
        })
    }
}

/// Merges locally held records with fetched ones. A fetched record replaces
/// any local record with the same log id or transaction hash. The result is
/// newest first and, when `search` is given, restricted to records whose
/// message, category or creator contains it (case-insensitive).
pub fn merge_history(
    local: Vec<HistoryRecord>,
    fetched: Vec<HistoryRecord>,
    search: Option<&str>,
) -> Vec<HistoryRecord> {
    let mut seen_ids = HashSet::new();
    let mut seen_hashes = HashSet::new();
    let mut merged = Vec::with_capacity(local.len() + fetched.len());

    for record in fetched.into_iter().chain(local) {
        let id_seen = record.log_id.is_some_and(|id| !seen_ids.insert(id));
        let hash_seen = record
            .transaction_hash
            .as_ref()
            .is_some_and(|hash| !seen_hashes.insert(hash.to_ascii_lowercase()));
        if id_seen || (record.log_id.is_none() && hash_seen) {
            continue;
        }
        merged.push(record);
    }

    if let Some(needle) = search.map(str::trim).filter(|needle| !needle.is_empty()) {
        let needle = needle.to_lowercase();
        merged.retain(|record| record.matches(&needle));
    }

    merged.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| b.log_id.cmp(&a.log_id))
    });
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(
        log_id: Option<u64>,
        hash: Option<&str>,
        message: &str,
        timestamp: u64,
        status: RecordStatus,
    ) -> HistoryRecord {
        HistoryRecord {
            log_id,
            transaction_hash: hash.map(str::to_string),
            creator: Address::parse("0x00000000000000000000000000000000000000a1").unwrap(),
            level: Severity::Info,
            category: "payments".into(),
            message: message.into(),
            timestamp,
            status,
        }
    }

    #[test]
    fn fetched_records_replace_local_copies() {
        let local = vec![
            record(Some(1), Some("0xaa"), "local copy", 100, RecordStatus::Pending),
            record(None, Some("0xBB"), "awaiting index", 300, RecordStatus::Pending),
            record(None, Some("0xcc"), "still pending", 250, RecordStatus::Pending),
        ];
        let fetched = vec![
            record(Some(1), Some("0xaa"), "indexed", 100, RecordStatus::Confirmed),
            record(Some(2), Some("0xbb"), "indexed later", 300, RecordStatus::Confirmed),
        ];

        let merged = merge_history(local, fetched, None);
        let messages: Vec<_> = merged.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["indexed later", "still pending", "indexed"]);
        assert_eq!(merged[1].status, RecordStatus::Pending);
    }

    #[test]
    fn search_is_case_insensitive_over_message_and_category() {
        let local = vec![
            record(Some(1), None, "Transfer FAILED", 10, RecordStatus::Confirmed),
            record(Some(2), None, "heartbeat", 20, RecordStatus::Confirmed),
        ];
        let merged = merge_history(local.clone(), Vec::new(), Some("failed"));
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].log_id, Some(1));

        let by_category = merge_history(local.clone(), Vec::new(), Some("PAYMENTS"));
        assert_eq!(by_category.len(), 2);

        let blank = merge_history(local, Vec::new(), Some("   "));
        assert_eq!(blank.len(), 2);
    }
}
