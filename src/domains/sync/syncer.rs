use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::domains::provider::HealthProvider;
use crate::domains::sync::backoff::{retry_with_backoff, BackoffPolicy};
use crate::domains::sync::repository::{commit_page, OutboxRepository, SyncStateRepository};
use crate::domains::sync::types::{
    BackfillWindow, OutboxEntry, RecordChange, SyncKey, SyncOutcome, SyncState,
};
use crate::errors::{ProviderError, SyncError, SyncResult};

/// Reads provider data into the outbox: a bounded backfill on first run,
/// then incremental polling from the stored resumption token.
pub struct ChangeTokenSyncer {
    pool: SqlitePool,
    states: Arc<dyn SyncStateRepository>,
    outbox: Arc<dyn OutboxRepository>,
    policy: BackoffPolicy,
    backfill_window: chrono::Duration,
    max_pages_per_run: u32,
}

impl ChangeTokenSyncer {
    pub fn new(
        pool: SqlitePool,
        states: Arc<dyn SyncStateRepository>,
        outbox: Arc<dyn OutboxRepository>,
        policy: BackoffPolicy,
        backfill_window: chrono::Duration,
        max_pages_per_run: u32,
    ) -> Self {
        Self {
            pool,
            states,
            outbox,
            policy,
            backfill_window,
            max_pages_per_run: max_pages_per_run.max(1),
        }
    }

    pub async fn sync(&self, provider: &dyn HealthProvider, record_type: &str) -> SyncResult<SyncOutcome> {
        self.sync_at(provider, record_type, Utc::now()).await
    }

    pub async fn sync_at(
        &self,
        provider: &dyn HealthProvider,
        record_type: &str,
        now: DateTime<Utc>,
    ) -> SyncResult<SyncOutcome> {
        let key = SyncKey::new(provider.provider_id(), record_type);
        let state = self.states.get_sync_state(&key).await?;

        match state.and_then(|s| s.resumption_token) {
            None => self.backfill(provider, &key, now).await,
            Some(token) => self.poll(provider, &key, token, now).await,
        }
    }

    async fn backfill(
        &self,
        provider: &dyn HealthProvider,
        key: &SyncKey,
        now: DateTime<Utc>,
    ) -> SyncResult<SyncOutcome> {
        let window = BackfillWindow::ending_at(now, self.backfill_window);
        info!("[{}] Starting backfill from {} to {}", key, window.start, window.end);

        // Token first: changes landing during the read are replayed, not lost.
        let token = self.fresh_token(provider, key).await?;
        let records = retry_with_backoff(&format!("read_backfill {}", key), &self.policy, || {
            provider.read_backfill(&key.record_type, &window)
        })
        .await?;

        let total = records.len();
        let entries: Vec<OutboxEntry> = records
            .into_iter()
            .filter(|record| window.contains(record.start_time))
            .map(|record| OutboxEntry::upsert(key, record, now))
            .collect();
        let outside = total - entries.len();
        if outside > 0 {
            debug!("[{}] Dropped {} backfill records outside the window", key, outside);
        }

        let state = SyncState {
            key: key.clone(),
            resumption_token: Some(token),
            last_run_at: now,
        };
        commit_page(&self.pool, self.outbox.as_ref(), self.states.as_ref(), &entries, &state).await?;

        info!("[{}] Backfill enqueued {} records", key, entries.len());
        Ok(SyncOutcome::Backfilled {
            records_enqueued: entries.len(),
            records_outside_window: outside,
        })
    }

    async fn poll(
        &self,
        provider: &dyn HealthProvider,
        key: &SyncKey,
        mut token: String,
        now: DateTime<Utc>,
    ) -> SyncResult<SyncOutcome> {
        let mut pages = 0u32;
        let mut upserts = 0usize;
        let mut deletes = 0usize;
        let mut more_pending = false;

        loop {
            let polled = retry_with_backoff(&format!("poll_changes {}", key), &self.policy, || {
                provider.poll_changes(&token)
            })
            .await;

            let page = match polled {
                Ok(page) if page.token_expired => return self.reset_token(provider, key, now).await,
                Ok(page) => page,
                Err(ProviderError::TokenExpired) => return self.reset_token(provider, key, now).await,
                Err(e) => {
                    warn!("[{}] Polling stopped after {} pages: {}", key, pages, e);
                    return Err(e.into());
                }
            };

            let mut entries = Vec::with_capacity(page.changes.len());
            for change in page.changes {
                match change {
                    RecordChange::Upsert { record } => {
                        upserts += 1;
                        entries.push(OutboxEntry::upsert(key, record, now));
                    }
                    RecordChange::Delete { record_id } => {
                        deletes += 1;
                        entries.push(OutboxEntry::delete(key, &record_id, now));
                    }
                }
            }

            let state = SyncState {
                key: key.clone(),
                resumption_token: Some(page.next_token.clone()),
                last_run_at: now,
            };
            commit_page(&self.pool, self.outbox.as_ref(), self.states.as_ref(), &entries, &state).await?;
            pages += 1;
            token = page.next_token;

            if !page.has_more {
                break;
            }
            if pages >= self.max_pages_per_run {
                more_pending = true;
                info!("[{}] Page cap of {} reached; remaining pages deferred", key, self.max_pages_per_run);
                break;
            }
        }

        debug!("[{}] Polled {} pages: {} upserts, {} deletes", key, pages, upserts, deletes);
        Ok(SyncOutcome::Incremental { pages, upserts, deletes, more_pending })
    }

    /// Replace an expired token without backfilling. Changes made while the
    /// token was stale are not recovered.
    async fn reset_token(
        &self,
        provider: &dyn HealthProvider,
        key: &SyncKey,
        now: DateTime<Utc>,
    ) -> SyncResult<SyncOutcome> {
        info!("[{}] Resumption token expired; starting from a fresh token", key);
        let token = self.fresh_token(provider, key).await?;
        self.states
            .save_sync_state(&SyncState {
                key: key.clone(),
                resumption_token: Some(token),
                last_run_at: now,
            })
            .await?;
        Ok(SyncOutcome::TokenReset)
    }

    async fn fresh_token(&self, provider: &dyn HealthProvider, key: &SyncKey) -> SyncResult<String> {
        retry_with_backoff(&format!("get_resumption_token {}", key), &self.policy, || {
            provider.get_resumption_token(&key.record_type)
        })
        .await
        .map_err(SyncError::from)
    }
}
