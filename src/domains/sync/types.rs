use crate::errors::{DomainError, ValidationError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifies one provider feed: a provider and one of its record types.
/// Every sync key owns exactly one SyncState row and one outbox partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyncKey {
    pub provider_id: String,
    pub record_type: String,
}

impl SyncKey {
    pub fn new(provider_id: &str, record_type: &str) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            record_type: record_type.to_string(),
        }
    }

    /// Outbox partition name
    pub fn partition(&self) -> String {
        format!("{}:{}", self.provider_id, self.record_type)
    }

    /// Unique task name for the periodic sync worker of this key
    pub fn periodic_task_name(&self) -> String {
        format!("sync-periodic:{}", self.partition())
    }

    /// Unique task name for a one-off sync pass of this key
    pub fn one_shot_task_name(&self) -> String {
        format!("sync-once:{}", self.partition())
    }
}

impl fmt::Display for SyncKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.partition())
    }
}

impl FromStr for SyncKey {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((provider, record_type)) if !provider.is_empty() && !record_type.is_empty() => {
                Ok(SyncKey::new(provider, record_type))
            }
            _ => Err(DomainError::Validation(ValidationError::format(
                "sync_key",
                &format!("expected provider:record_type, got {}", s),
            ))),
        }
    }
}

/// Resumption checkpoint for one sync key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub key: SyncKey,
    /// Present only once a backfill has completed.
    pub resumption_token: Option<String>,
    pub last_run_at: DateTime<Utc>,
}

/// The type of a staged record operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxOperation {
    Upsert,
    Delete,
}

impl OutboxOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxOperation::Upsert => "upsert",
            OutboxOperation::Delete => "delete",
        }
    }
}

impl FromStr for OutboxOperation {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upsert" => Ok(OutboxOperation::Upsert),
            "delete" => Ok(OutboxOperation::Delete),
            _ => Err(DomainError::Validation(ValidationError::custom(
                &format!("Invalid OutboxOperation string: {}", s)
            )))
        }
    }
}

impl From<OutboxOperation> for String {
    fn from(operation: OutboxOperation) -> Self {
        operation.as_str().to_string()
    }
}

/// A pending record operation staged between the provider and the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub key: SyncKey,
    pub provider_record_id: String,
    pub operation: OutboxOperation,
    /// Full record for upserts; deletes carry none.
    pub record: Option<ProviderRecord>,
    /// Bumped every time a later operation supersedes this entry.
    pub revision: i64,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OutboxEntry {
    pub fn upsert(key: &SyncKey, record: ProviderRecord, now: DateTime<Utc>) -> Self {
        Self {
            key: key.clone(),
            provider_record_id: record.record_id.clone(),
            operation: OutboxOperation::Upsert,
            record: Some(record),
            revision: 1,
            attempts: 0,
            last_error: None,
            created_at: now,
        }
    }

    pub fn delete(key: &SyncKey, provider_record_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            key: key.clone(),
            provider_record_id: provider_record_id.to_string(),
            operation: OutboxOperation::Delete,
            record: None,
            revision: 1,
            attempts: 0,
            last_error: None,
            created_at: now,
        }
    }
}

/// A time-series record as read from a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub record_id: String,
    pub record_type: String,
    /// Data origin inside the provider (app package, device), if reported.
    #[serde(default)]
    pub source: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Day-level key for aggregate records; per-sample records use their id.
    #[serde(default)]
    pub logical_date: Option<chrono::NaiveDate>,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl ProviderRecord {
    pub fn logical_key(&self) -> String {
        match self.logical_date {
            Some(date) => format!("{}:{}", self.record_type, date),
            None => format!("{}:{}", self.record_type, self.record_id),
        }
    }
}

/// One change reported by incremental polling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordChange {
    Upsert { record: ProviderRecord },
    Delete { record_id: String },
}

/// A page of changes returned for a resumption token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangesPage {
    pub changes: Vec<RecordChange>,
    pub next_token: String,
    pub has_more: bool,
    #[serde(default)]
    pub token_expired: bool,
}

/// Closed historical interval read by a backfill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BackfillWindow {
    pub fn ending_at(end: DateTime<Utc>, length: chrono::Duration) -> Self {
        Self { start: end - length, end }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }
}

/// Result of one `sync` invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncOutcome {
    Backfilled {
        records_enqueued: usize,
        records_outside_window: usize,
    },
    Incremental {
        pages: u32,
        upserts: usize,
        deletes: usize,
        /// Page cap reached with pages still pending at the provider.
        more_pending: bool,
    },
    /// The token had expired; a fresh one was stored and no data read.
    TokenReset,
}

/// Counts reported by one outbox flush
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSummary {
    pub succeeded: usize,
    pub failed: usize,
    /// Entries superseded while in flight; left for the next flush.
    pub superseded: usize,
}

impl PushSummary {
    pub fn merge(&mut self, other: &PushSummary) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.superseded += other.superseded;
    }
}

/// Why a sync job did or did not run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncJobStatus {
    Completed {
        outcome: SyncOutcome,
        push: PushSummary,
    },
    /// Sync succeeded but the push could not reach the remote store.
    PushDeferred {
        outcome: SyncOutcome,
        reason: String,
    },
    SkippedDisabled,
    Failed {
        error: String,
        retryable: bool,
    },
}

/// Report for one background sync job run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRunReport {
    pub run_id: Uuid,
    pub key: SyncKey,
    pub status: SyncJobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_sync_key_round_trips_through_partition() {
        let key = SyncKey::new("health_connect", "steps");
        assert_eq!(key.partition(), "health_connect:steps");
        assert_eq!("health_connect:steps".parse::<SyncKey>().unwrap(), key);
        assert!("no-separator".parse::<SyncKey>().is_err());
        assert!(":steps".parse::<SyncKey>().is_err());
    }

    #[test]
    fn test_logical_key_prefers_date() {
        let mut record = ProviderRecord {
            record_id: "abc".into(),
            record_type: "steps".into(),
            source: None,
            start_time: Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
            end_time: None,
            logical_date: None,
            value: serde_json::json!({ "count": 10 }),
        };
        assert_eq!(record.logical_key(), "steps:abc");
        record.logical_date = chrono::NaiveDate::from_ymd_opt(2024, 5, 1);
        assert_eq!(record.logical_key(), "steps:2024-05-01");
    }

    #[test]
    fn test_backfill_window_is_inclusive() {
        let end = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let window = BackfillWindow::ending_at(end, chrono::Duration::days(10));
        assert!(window.contains(window.start));
        assert!(window.contains(end));
        assert!(!window.contains(window.start - chrono::Duration::seconds(1)));
        assert!(!window.contains(end + chrono::Duration::seconds(1)));
    }
}
