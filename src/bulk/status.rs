//! Bulk status types
//!
//! BulkStatus is the single mutable record per command. It is only ever
//! changed by merging a [`StatusMessage`] through the status aggregator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Sentinel for an unknown total
pub const UNKNOWN_TOTAL: i64 = -1;

/// State of a bulk command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BulkState {
    /// Accepted, waiting for the scroller
    Scheduled,
    /// The scroller is publishing buckets
    ScrollingStarted,
    /// Scrolling is done, buckets are being processed
    Running,
    /// Every bucket was processed (possibly with record errors)
    Completed,
    /// A system failure stopped the command
    Aborted,
}

impl BulkState {
    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, BulkState::Completed | BulkState::Aborted)
    }

    /// Stored/wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkState::Scheduled => "SCHEDULED",
            BulkState::ScrollingStarted => "SCROLLING_STARTED",
            BulkState::Running => "RUNNING",
            BulkState::Completed => "COMPLETED",
            BulkState::Aborted => "ABORTED",
        }
    }
}

impl std::fmt::Display for BulkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BulkState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SCHEDULED" => Ok(BulkState::Scheduled),
            "SCROLLING_STARTED" => Ok(BulkState::ScrollingStarted),
            "RUNNING" => Ok(BulkState::Running),
            "COMPLETED" => Ok(BulkState::Completed),
            "ABORTED" => Ok(BulkState::Aborted),
            other => Err(format!("unknown bulk state '{}'", other)),
        }
    }
}

/// Current status of a bulk command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkStatus {
    /// Command id
    pub command_id: String,
    /// Action name
    pub action: String,
    /// Submitting user
    pub username: String,
    /// Current state
    pub state: BulkState,
    /// Number of matching records, [`UNKNOWN_TOTAL`] until known
    pub total: i64,
    /// Records processed so far
    pub processed: u64,
    /// Records that failed
    pub error_count: u64,
    /// Latest error message
    pub error_message: Option<String>,
    /// Buckets published by the scroller, once scrolling ended
    pub bucket_count: Option<u64>,
    /// Buckets whose delta was merged
    pub buckets_done: u64,
    /// Submission time
    pub submitted_at: DateTime<Utc>,
    /// When scrolling started
    pub scroll_started_at: Option<DateTime<Utc>>,
    /// When scrolling ended
    pub scroll_ended_at: Option<DateTime<Utc>>,
    /// When a terminal state was reached
    pub completed_at: Option<DateTime<Utc>>,
}

impl BulkStatus {
    /// Fresh status for a newly submitted command
    pub fn scheduled(command_id: &str, action: &str, username: &str, at: DateTime<Utc>) -> Self {
        Self {
            command_id: command_id.to_string(),
            action: action.to_string(),
            username: username.to_string(),
            state: BulkState::Scheduled,
            total: UNKNOWN_TOTAL,
            processed: 0,
            error_count: 0,
            error_message: None,
            bucket_count: None,
            buckets_done: 0,
            submitted_at: at,
            scroll_started_at: None,
            scroll_ended_at: None,
            completed_at: None,
        }
    }

    /// Whether the command reached COMPLETED or ABORTED
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether any record failed or the command was aborted
    pub fn has_error(&self) -> bool {
        self.error_count > 0 || self.state == BulkState::Aborted
    }

    /// Whether the total is known
    pub fn has_total(&self) -> bool {
        self.total >= 0
    }

    /// Whether the command ran to completion with no error at all
    pub fn is_clean_completion(&self) -> bool {
        self.state == BulkState::Completed && !self.has_error()
    }
}

/// Progress of one processed bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusDelta {
    /// Command id
    pub command_id: String,
    /// Partition the bucket came from
    pub partition: u32,
    /// Bucket sequence within the partition
    pub sequence: u64,
    /// Records in the bucket
    pub processed: u64,
    /// Records that failed
    pub errors: u64,
    /// Last record failure, if any
    pub error_message: Option<String>,
}

impl StatusDelta {
    /// Dedup key: a bucket is counted once per (command, partition, sequence)
    pub fn dedup_key(&self) -> (&str, u32, u64) {
        (&self.command_id, self.partition, self.sequence)
    }
}

/// Messages merged by the status aggregator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StatusMessage {
    /// Scroller picked up the command
    #[serde(rename_all = "camelCase")]
    ScrollStarted {
        command_id: String,
        total: Option<u64>,
    },
    /// Every bucket was published
    #[serde(rename_all = "camelCase")]
    ScrollCompleted {
        command_id: String,
        total: u64,
        bucket_count: u64,
    },
    /// Selection or publishing failed
    #[serde(rename_all = "camelCase")]
    ScrollFailed { command_id: String, message: String },
    /// A bucket was processed
    Processed(StatusDelta),
}

impl StatusMessage {
    /// Command this message refers to
    pub fn command_id(&self) -> &str {
        match self {
            StatusMessage::ScrollStarted { command_id, .. }
            | StatusMessage::ScrollCompleted { command_id, .. }
            | StatusMessage::ScrollFailed { command_id, .. } => command_id,
            StatusMessage::Processed(delta) => &delta.command_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip_names() {
        for state in [
            BulkState::Scheduled,
            BulkState::ScrollingStarted,
            BulkState::Running,
            BulkState::Completed,
            BulkState::Aborted,
        ] {
            assert_eq!(state.as_str().parse::<BulkState>().unwrap(), state);
        }
        assert!("DONE".parse::<BulkState>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!BulkState::Scheduled.is_terminal());
        assert!(!BulkState::Running.is_terminal());
        assert!(BulkState::Completed.is_terminal());
        assert!(BulkState::Aborted.is_terminal());
    }

    #[test]
    fn test_has_error() {
        let mut status = BulkStatus::scheduled("c", "noop", "u", Utc::now());
        assert!(!status.has_error());
        assert_eq!(status.total, UNKNOWN_TOTAL);

        status.state = BulkState::Completed;
        assert!(status.is_clean_completion());

        status.error_count = 1;
        assert!(status.has_error());
        assert!(!status.is_clean_completion());

        status.error_count = 0;
        status.state = BulkState::Aborted;
        assert!(status.has_error());
    }

    #[test]
    fn test_status_message_wire_format() {
        let message = StatusMessage::ScrollCompleted {
            command_id: "c1".into(),
            total: 20,
            bucket_count: 2,
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "scrollCompleted");
        assert_eq!(json["commandId"], "c1");
        assert_eq!(json["bucketCount"], 2);

        let state = serde_json::to_value(BulkState::ScrollingStarted).unwrap();
        assert_eq!(state, "SCROLLING_STARTED");
    }
}
