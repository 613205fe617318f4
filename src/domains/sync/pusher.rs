use log::{debug, info, warn};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::domains::remote::{RemoteFilter, RemoteStore};
use crate::domains::sync::backoff::{retry_with_backoff, BackoffPolicy};
use crate::domains::sync::repository::OutboxRepository;
use crate::domains::sync::types::{OutboxEntry, OutboxOperation, ProviderRecord, PushSummary, SyncKey};
use crate::domains::sync::utils::format_sync_operation;
use crate::errors::{PushError, PushResult, RemoteError};

/// Remote rows merge on this key, so re-sending a record never duplicates it.
pub const RECORD_CONFLICT_KEY: [&str; 3] = ["user_id", "source", "logical_key"];

/// Drains outbox partitions into the remote record table
pub struct OutboxPusher {
    outbox: Arc<dyn OutboxRepository>,
    remote: Arc<dyn RemoteStore>,
    user_id: String,
    records_table: String,
    policy: BackoffPolicy,
    batch_limit: u32,
    max_consecutive_transport_failures: u32,
}

impl OutboxPusher {
    pub fn new(
        outbox: Arc<dyn OutboxRepository>,
        remote: Arc<dyn RemoteStore>,
        user_id: &str,
        records_table: &str,
        policy: BackoffPolicy,
        batch_limit: u32,
        max_consecutive_transport_failures: u32,
    ) -> Self {
        Self {
            outbox,
            remote,
            user_id: user_id.to_string(),
            records_table: records_table.to_string(),
            policy,
            batch_limit: batch_limit.max(1),
            max_consecutive_transport_failures: max_consecutive_transport_failures.max(1),
        }
    }

    fn remote_row(&self, entry: &OutboxEntry, record: &ProviderRecord) -> Value {
        let key = &entry.key;
        json!({
            "user_id": self.user_id,
            "provider_id": key.provider_id,
            "source": record.source.clone().unwrap_or_else(|| key.provider_id.clone()),
            "logical_key": record.logical_key(),
            "provider_record_id": record.record_id,
            "record_type": record.record_type,
            "start_time": record.start_time.to_rfc3339(),
            "end_time": record.end_time.map(|t| t.to_rfc3339()),
            "value": record.value,
            "queued_at": entry.created_at.to_rfc3339(),
        })
    }

    async fn push_entry(&self, entry: &OutboxEntry) -> Result<(), RemoteError> {
        match (entry.operation, entry.record.as_ref()) {
            (OutboxOperation::Upsert, Some(record)) => {
                let rows = [self.remote_row(entry, record)];
                retry_with_backoff("remote upsert", &self.policy, || {
                    self.remote.upsert(&self.records_table, &rows, &RECORD_CONFLICT_KEY)
                })
                .await
            }
            (OutboxOperation::Upsert, None) => Err(RemoteError::Decode(format!(
                "upsert for {} has no payload",
                entry.provider_record_id
            ))),
            (OutboxOperation::Delete, _) => {
                let filter = RemoteFilter::new()
                    .eq("user_id", &self.user_id)
                    .eq("provider_id", &entry.key.provider_id)
                    .eq("provider_record_id", &entry.provider_record_id);
                let result = retry_with_backoff("remote delete", &self.policy, || {
                    self.remote.delete(&self.records_table, &filter)
                })
                .await;
                match result {
                    Ok(removed) => {
                        if removed == 0 {
                            debug!("Remote row for {} already absent", entry.provider_record_id);
                        }
                        Ok(())
                    }
                    Err(RemoteError::NotFound(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Push every pending entry of one partition. Individual failures stay
    /// queued and later entries are still attempted; an unreachable remote
    /// store fails the flush.
    pub async fn flush(&self, key: &SyncKey) -> PushResult<PushSummary> {
        let mut summary = PushSummary::default();
        let mut consecutive_transport_failures = 0u32;
        let mut transport_failures = 0usize;
        let mut last_transport_error: Option<RemoteError> = None;
        let mut cursor: Option<OutboxEntry> = None;

        loop {
            let batch = match &cursor {
                Some(after) => self.outbox.find_pending_after(key, after, self.batch_limit).await?,
                None => self.outbox.find_pending(key, self.batch_limit).await?,
            };
            let batch_len = batch.len();

            for entry in &batch {
                match self.push_entry(entry).await {
                    Ok(()) => {
                        consecutive_transport_failures = 0;
                        if self.outbox.remove_if_unchanged(entry).await? {
                            summary.succeeded += 1;
                        } else {
                            summary.superseded += 1;
                        }
                    }
                    Err(e) => {
                        warn!(
                            "{}",
                            format_sync_operation(
                                entry.operation.as_str(),
                                &key.partition(),
                                &entry.provider_record_id,
                                "failed",
                                Some(&e.to_string()),
                            )
                        );
                        self.outbox.record_failure(entry, &e.to_string()).await?;
                        summary.failed += 1;

                        if !e.is_transport() {
                            consecutive_transport_failures = 0;
                            continue;
                        }
                        consecutive_transport_failures += 1;
                        transport_failures += 1;
                        if consecutive_transport_failures >= self.max_consecutive_transport_failures {
                            return self.abort_unreachable(key, summary, e);
                        }
                        last_transport_error = Some(e);
                    }
                }
            }

            match batch.into_iter().last() {
                Some(last) if batch_len >= self.batch_limit as usize => cursor = Some(last),
                _ => break,
            }
        }

        // Nothing got through and every failure was the transport
        let total_outage = summary.succeeded == 0 && summary.superseded == 0 && transport_failures == summary.failed;
        if let (true, Some(e)) = (total_outage, last_transport_error) {
            return self.abort_unreachable(key, summary, e);
        }

        if summary.succeeded + summary.failed > 0 {
            info!(
                "[{}] Flushed outbox: {} pushed, {} failed, {} superseded",
                key, summary.succeeded, summary.failed, summary.superseded
            );
        }
        Ok(summary)
    }

    fn abort_unreachable(&self, key: &SyncKey, summary: PushSummary, last: RemoteError) -> PushResult<PushSummary> {
        if summary.succeeded == 0 {
            warn!("[{}] Remote store unreachable, flush abandoned: {}", key, last);
            return Err(PushError::TransportUnavailable(last.to_string()));
        }
        warn!("[{}] Remote store stopped responding mid-flush: {}", key, last);
        Ok(summary)
    }

    /// Flush every partition holding pending entries
    pub async fn flush_all(&self) -> PushResult<PushSummary> {
        let mut total = PushSummary::default();
        for key in self.outbox.find_pending_partitions().await? {
            let summary = self.flush(&key).await?;
            total.merge(&summary);
        }
        Ok(total)
    }
}
