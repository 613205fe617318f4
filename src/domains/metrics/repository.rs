use async_trait::async_trait;
use sqlx::{FromRow, SqlitePool};

use crate::domains::metrics::types::MetricTransition;
use crate::domains::sync::utils::parse_timestamp;
use crate::errors::{DbError, DomainError, DomainResult};

/// Local diagnostic log of metric transitions
#[async_trait]
pub trait TransitionRepository: Send + Sync {
    async fn record(&self, transition: &MetricTransition) -> DomainResult<()>;

    /// Most recent transitions of one metric, newest first
    async fn find_by_metric(&self, metric: &str, limit: u32) -> DomainResult<Vec<MetricTransition>>;
}

#[derive(Debug, FromRow)]
struct TransitionRow {
    metric: String,
    from_state: String,
    to_state: String,
    cause: String,
    detail: Option<String>,
    occurred_at: String,
}

impl TryFrom<TransitionRow> for MetricTransition {
    type Error = DomainError;
    fn try_from(row: TransitionRow) -> Result<Self, Self::Error> {
        Ok(MetricTransition {
            metric: row.metric,
            from: row.from_state.parse()?,
            to: row.to_state.parse()?,
            cause: row.cause.parse()?,
            detail: row.detail,
            occurred_at: parse_timestamp("occurred_at", &row.occurred_at)?,
        })
    }
}

pub struct SqliteTransitionRepository {
    pool: SqlitePool,
}

impl SqliteTransitionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TransitionRepository for SqliteTransitionRepository {
    async fn record(&self, transition: &MetricTransition) -> DomainResult<()> {
        sqlx::query(
            "INSERT INTO metric_transitions (metric, from_state, to_state, cause, detail, occurred_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&transition.metric)
        .bind(transition.from.as_str())
        .bind(transition.to.as_str())
        .bind(transition.cause.as_str())
        .bind(&transition.detail)
        .bind(transition.occurred_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(())
    }

    async fn find_by_metric(&self, metric: &str, limit: u32) -> DomainResult<Vec<MetricTransition>> {
        let rows = sqlx::query_as::<_, TransitionRow>(
            "SELECT metric, from_state, to_state, cause, detail, occurred_at
             FROM metric_transitions
             WHERE metric = ?
             ORDER BY id DESC
             LIMIT ?",
        )
        .bind(metric)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        rows.into_iter().map(MetricTransition::try_from).collect()
    }
}
