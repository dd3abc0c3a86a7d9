//! Canonical notification records and the in-memory set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Notification priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    /// Background information.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// Needs attention.
    High,
}

impl Priority {
    /// Parses a priority tag case-insensitively.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            _ => None,
        }
    }

    /// Wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Normal => "NORMAL",
            Self::High => "HIGH",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A notification in canonical shape, whatever shape the server sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    /// Unique, stable identifier (synthesized when the server omits it).
    pub id: String,
    /// Headline.
    pub title: String,
    /// Message text.
    pub body: String,
    /// Whether the user has read it.
    pub is_read: bool,
    /// Priority, `NORMAL` unless the server says otherwise.
    pub priority: Priority,
    /// Whether the record arrived as a stream push.
    pub delivered_via_stream: bool,
    /// Creation time, or time of receipt when the server omits it.
    pub created_at: DateTime<Utc>,
    /// Expiry time, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl NotificationRecord {
    /// Returns `true` if the record still counts toward the unread total.
    pub fn is_unread(&self) -> bool {
        !self.is_read
    }
}

/// Index of the record with `id`, if present.
pub fn position(set: &[NotificationRecord], id: &str) -> Option<usize> {
    set.iter().position(|record| record.id == id)
}

/// Number of unread records in `set`.
pub fn unread_in(set: &[NotificationRecord]) -> u64 {
    set.iter().filter(|record| record.is_unread()).count() as u64
}

/// Drops later records whose id was already seen, keeping first occurrences.
pub fn dedup_by_id(set: &mut Vec<NotificationRecord>) {
    let mut seen = std::collections::HashSet::new();
    set.retain(|record| seen.insert(record.id.clone()));
}
