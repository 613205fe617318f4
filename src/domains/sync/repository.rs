use async_trait::async_trait;
use sqlx::{FromRow, Sqlite, SqlitePool, Transaction};

use crate::domains::sync::types::{OutboxEntry, OutboxOperation, ProviderRecord, SyncKey, SyncState};
use crate::domains::sync::utils::parse_timestamp;
use crate::errors::{DbError, DomainError, DomainResult, ValidationError};

/// Repository for resumption checkpoints
#[async_trait]
pub trait SyncStateRepository: Send + Sync {
    /// Get the checkpoint for a key, if one was ever written
    async fn get_sync_state(&self, key: &SyncKey) -> DomainResult<Option<SyncState>>;

    /// Persist a checkpoint
    async fn save_sync_state(&self, state: &SyncState) -> DomainResult<()>;

    /// Persist a checkpoint within a transaction
    async fn save_sync_state_with_tx<'t>(
        &self,
        state: &SyncState,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;
}

/// Repository for the durable outbox
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Stage operations; a later operation for the same record supersedes the earlier one
    async fn enqueue(&self, entries: &[OutboxEntry]) -> DomainResult<()>;

    /// Stage operations within a transaction
    async fn enqueue_with_tx<'t>(
        &self,
        entries: &[OutboxEntry],
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;

    /// Pending entries of one partition, oldest first
    async fn find_pending(&self, key: &SyncKey, limit: u32) -> DomainResult<Vec<OutboxEntry>>;

    /// Pending entries queued after `after` in the same order as `find_pending`
    async fn find_pending_after(
        &self,
        key: &SyncKey,
        after: &OutboxEntry,
        limit: u32,
    ) -> DomainResult<Vec<OutboxEntry>>;

    /// Partitions that currently hold pending entries
    async fn find_pending_partitions(&self) -> DomainResult<Vec<SyncKey>>;

    /// Remove an entry after a confirmed push. Returns false when the entry was
    /// superseded since it was read, in which case it stays queued.
    async fn remove_if_unchanged(&self, entry: &OutboxEntry) -> DomainResult<bool>;

    /// Record a failed push attempt against the entry
    async fn record_failure(&self, entry: &OutboxEntry, error_message: &str) -> DomainResult<()>;

    /// Number of pending entries in one partition
    async fn count_pending(&self, key: &SyncKey) -> DomainResult<i64>;
}

#[derive(Debug, FromRow)]
struct SyncStateRow {
    provider_id: String,
    record_type: String,
    resumption_token: Option<String>,
    last_run_at: String,
}

impl TryFrom<SyncStateRow> for SyncState {
    type Error = DomainError;
    fn try_from(row: SyncStateRow) -> Result<Self, Self::Error> {
        Ok(SyncState {
            key: SyncKey::new(&row.provider_id, &row.record_type),
            resumption_token: row.resumption_token,
            last_run_at: parse_timestamp("last_run_at", &row.last_run_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct OutboxRow {
    partition_key: String,
    provider_record_id: String,
    operation: String,
    payload: Option<String>,
    revision: i64,
    attempts: i64,
    last_error: Option<String>,
    created_at: String,
}

impl TryFrom<OutboxRow> for OutboxEntry {
    type Error = DomainError;
    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        let operation: OutboxOperation = row.operation.parse()?;
        let record = match row.payload {
            Some(json) => Some(serde_json::from_str::<ProviderRecord>(&json).map_err(|e| {
                DomainError::Validation(ValidationError::format("payload", &e.to_string()))
            })?),
            None => None,
        };
        if operation == OutboxOperation::Upsert && record.is_none() {
            return Err(DomainError::Validation(ValidationError::required("payload")));
        }
        Ok(OutboxEntry {
            key: row.partition_key.parse()?,
            provider_record_id: row.provider_record_id,
            operation,
            record,
            revision: row.revision,
            attempts: row.attempts,
            last_error: row.last_error,
            created_at: parse_timestamp("created_at", &row.created_at)?,
        })
    }
}

/// SQLite implementation of the SyncStateRepository
pub struct SqliteSyncStateRepository {
    pool: SqlitePool,
}

impl SqliteSyncStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const UPSERT_SYNC_STATE_SQL: &str = "INSERT INTO sync_states (provider_id, record_type, resumption_token, last_run_at)
     VALUES (?, ?, ?, ?)
     ON CONFLICT(provider_id, record_type) DO UPDATE SET
        resumption_token = excluded.resumption_token,
        last_run_at = excluded.last_run_at";

#[async_trait]
impl SyncStateRepository for SqliteSyncStateRepository {
    async fn get_sync_state(&self, key: &SyncKey) -> DomainResult<Option<SyncState>> {
        let row = sqlx::query_as::<_, SyncStateRow>(
            "SELECT provider_id, record_type, resumption_token, last_run_at
             FROM sync_states WHERE provider_id = ? AND record_type = ?",
        )
        .bind(&key.provider_id)
        .bind(&key.record_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;

        row.map(SyncState::try_from).transpose()
    }

    async fn save_sync_state(&self, state: &SyncState) -> DomainResult<()> {
        sqlx::query(UPSERT_SYNC_STATE_SQL)
            .bind(&state.key.provider_id)
            .bind(&state.key.record_type)
            .bind(&state.resumption_token)
            .bind(state.last_run_at.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    async fn save_sync_state_with_tx<'t>(
        &self,
        state: &SyncState,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        sqlx::query(UPSERT_SYNC_STATE_SQL)
            .bind(&state.key.provider_id)
            .bind(&state.key.record_type)
            .bind(&state.resumption_token)
            .bind(state.last_run_at.to_rfc3339())
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }
}

/// SQLite implementation of the OutboxRepository
pub struct SqliteOutboxRepository {
    pool: SqlitePool,
}

impl SqliteOutboxRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

// A superseding write resets the attempt counter and bumps the revision so an
// in-flight push of the older operation cannot delete it.
const ENQUEUE_SQL: &str = "INSERT INTO sync_outbox
        (partition_key, provider_record_id, operation, payload, revision, attempts, last_error, created_at)
     VALUES (?, ?, ?, ?, 1, 0, NULL, ?)
     ON CONFLICT(partition_key, provider_record_id) DO UPDATE SET
        operation = excluded.operation,
        payload = excluded.payload,
        revision = sync_outbox.revision + 1,
        attempts = 0,
        last_error = NULL,
        created_at = excluded.created_at";

fn encode_payload(entry: &OutboxEntry) -> DomainResult<Option<String>> {
    entry
        .record
        .as_ref()
        .map(|record| {
            serde_json::to_string(record)
                .map_err(|e| DomainError::Internal(format!("Failed to encode outbox payload: {}", e)))
        })
        .transpose()
}

impl SqliteOutboxRepository {
    async fn enqueue_on<'t>(
        entries: &[OutboxEntry],
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        for entry in entries {
            let payload = encode_payload(entry)?;
            sqlx::query(ENQUEUE_SQL)
                .bind(entry.key.partition())
                .bind(&entry.provider_record_id)
                .bind(entry.operation.as_str())
                .bind(payload)
                .bind(entry.created_at.to_rfc3339())
                .execute(&mut **tx)
                .await
                .map_err(DbError::from)?;
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxRepository for SqliteOutboxRepository {
    async fn enqueue(&self, entries: &[OutboxEntry]) -> DomainResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        Self::enqueue_on(entries, &mut tx).await?;
        tx.commit().await.map_err(DbError::from)?;
        Ok(())
    }

    async fn enqueue_with_tx<'t>(
        &self,
        entries: &[OutboxEntry],
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        Self::enqueue_on(entries, tx).await
    }

    async fn find_pending(&self, key: &SyncKey, limit: u32) -> DomainResult<Vec<OutboxEntry>> {
        let rows = sqlx::query_as::<_, OutboxRow>(
            "SELECT partition_key, provider_record_id, operation, payload, revision, attempts, last_error, created_at
             FROM sync_outbox
             WHERE partition_key = ?
             ORDER BY created_at ASC, provider_record_id ASC
             LIMIT ?",
        )
        .bind(key.partition())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(decode_outbox_rows(key, rows))
    }

    async fn find_pending_after(
        &self,
        key: &SyncKey,
        after: &OutboxEntry,
        limit: u32,
    ) -> DomainResult<Vec<OutboxEntry>> {
        let after_created_at = after.created_at.to_rfc3339();
        let rows = sqlx::query_as::<_, OutboxRow>(
            "SELECT partition_key, provider_record_id, operation, payload, revision, attempts, last_error, created_at
             FROM sync_outbox
             WHERE partition_key = ?
               AND (created_at > ? OR (created_at = ? AND provider_record_id > ?))
             ORDER BY created_at ASC, provider_record_id ASC
             LIMIT ?",
        )
        .bind(key.partition())
        .bind(&after_created_at)
        .bind(&after_created_at)
        .bind(&after.provider_record_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(decode_outbox_rows(key, rows))
    }

    async fn find_pending_partitions(&self) -> DomainResult<Vec<SyncKey>> {
        let partitions: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT partition_key FROM sync_outbox ORDER BY partition_key",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        partitions.iter().map(|p| p.parse::<SyncKey>()).collect()
    }

    async fn remove_if_unchanged(&self, entry: &OutboxEntry) -> DomainResult<bool> {
        let result = sqlx::query(
            "DELETE FROM sync_outbox
             WHERE partition_key = ? AND provider_record_id = ? AND revision = ?",
        )
        .bind(entry.key.partition())
        .bind(&entry.provider_record_id)
        .bind(entry.revision)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_failure(&self, entry: &OutboxEntry, error_message: &str) -> DomainResult<()> {
        sqlx::query(
            "UPDATE sync_outbox
             SET attempts = attempts + 1, last_error = ?
             WHERE partition_key = ? AND provider_record_id = ? AND revision = ?",
        )
        .bind(error_message)
        .bind(entry.key.partition())
        .bind(&entry.provider_record_id)
        .bind(entry.revision)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(())
    }

    async fn count_pending(&self, key: &SyncKey) -> DomainResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sync_outbox WHERE partition_key = ?",
        )
        .bind(key.partition())
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(count)
    }
}

fn decode_outbox_rows(key: &SyncKey, rows: Vec<OutboxRow>) -> Vec<OutboxEntry> {
    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let record_id = row.provider_record_id.clone();
        match OutboxEntry::try_from(row) {
            Ok(entry) => entries.push(entry),
            // A corrupt row must not wedge the partition; it stays for inspection.
            Err(e) => log::error!("Skipping unreadable outbox row {}/{}: {}", key, record_id, e),
        }
    }
    entries
}

/// Checkpoint helper shared by the syncer: stage a page of operations and
/// advance the token in one transaction.
pub async fn commit_page(
    pool: &SqlitePool,
    outbox: &dyn OutboxRepository,
    states: &dyn SyncStateRepository,
    entries: &[OutboxEntry],
    state: &SyncState,
) -> DomainResult<()> {
    let mut tx = pool.begin().await.map_err(DbError::from)?;
    outbox.enqueue_with_tx(entries, &mut tx).await?;
    states.save_sync_state_with_tx(state, &mut tx).await?;
    tx.commit().await.map_err(DbError::from)?;
    Ok(())
}
