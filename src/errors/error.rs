use std::fmt;
use serde::Serialize;
use thiserror::Error;

/// Database errors
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Database error: {0}")]
    Other(String),
}

impl serde::Serialize for DbError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("DbError", 2)?;
        match self {
            DbError::Sqlx(err) => {
                state.serialize_field("type", "Sqlx")?;
                state.serialize_field("message", &err.to_string())?;
            }
            DbError::Transaction(s) => {
                state.serialize_field("type", "Transaction")?;
                state.serialize_field("message", s)?;
            }
            DbError::Migration(s) => {
                state.serialize_field("type", "Migration")?;
                state.serialize_field("message", s)?;
            }
            DbError::Other(s) => {
                state.serialize_field("type", "Other")?;
                state.serialize_field("message", s)?;
            }
        }
        state.end()
    }
}

/// Manual Clone implementation for DbError (sqlx::Error is not Clone)
impl Clone for DbError {
    fn clone(&self) -> Self {
        match self {
            DbError::Sqlx(err) => DbError::Other(format!("SQLx error: {}", err)),
            DbError::Transaction(s) => DbError::Transaction(s.clone()),
            DbError::Migration(s) => DbError::Migration(s.clone()),
            DbError::Other(s) => DbError::Other(s.clone()),
        }
    }
}

/// Errors raised by a health data provider.
#[derive(Debug, Error, Clone, Serialize, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Provider unreachable: {0}")]
    Unreachable(String),

    #[error("Provider permission revoked: {0}")]
    PermissionRevoked(String),

    #[error("Resumption token expired")]
    TokenExpired,

    #[error("Provider call timed out after {0}s")]
    Timeout(u64),

    #[error("Provider rejected request: {0}")]
    Rejected(String),

    #[error("Malformed provider response: {0}")]
    Decode(String),
}

/// Errors raised by the remote record store.
#[derive(Debug, Error, Clone, Serialize, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Remote call timed out after {0}s")]
    Timeout(u64),

    #[error("Remote server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Remote store rejected request {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Remote row not found: {0}")]
    NotFound(String),

    #[error("Malformed remote response: {0}")]
    Decode(String),
}

/// Classifies errors that a retry with backoff can recover from.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for ProviderError {
    fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Unreachable(_) | ProviderError::Timeout(_))
    }
}

impl Retryable for RemoteError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteError::Transport(_) | RemoteError::Timeout(_) | RemoteError::Server { .. }
        )
    }
}

impl RemoteError {
    /// True when the failure says nothing about the request itself, only that
    /// the remote store could not be reached.
    pub fn is_transport(&self) -> bool {
        matches!(self, RemoteError::Transport(_) | RemoteError::Timeout(_))
    }
}

/// Domain-level errors
#[derive(Debug, Error, Clone, Serialize)]
pub enum DomainError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Remote store error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Sync-specific errors
#[derive(Debug, Error, Clone, Serialize)]
pub enum SyncError {
    #[error("Transient transport failure: {0}")]
    TransientTransport(String),

    #[error("Resumption token expired")]
    TokenExpired,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("Local database error: {0}")]
    LocalDatabase(#[from] DbError),

    #[error("No provider registered with id {0}")]
    UnknownProvider(String),

    #[error("Sync error: {0}")]
    Other(String),
}

impl SyncError {
    /// Every sync failure resolves to "retry later"; this tells the scheduler
    /// whether an immediate backoff retry is worthwhile.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::TransientTransport(_)
                | SyncError::PermissionDenied(_)
                | SyncError::LocalDatabase(_)
        )
    }
}

impl From<ProviderError> for SyncError {
    fn from(error: ProviderError) -> Self {
        match error {
            ProviderError::Unreachable(msg) => SyncError::TransientTransport(msg),
            ProviderError::Timeout(secs) => {
                SyncError::TransientTransport(format!("provider call timed out after {}s", secs))
            }
            ProviderError::PermissionRevoked(msg) => SyncError::PermissionDenied(msg),
            ProviderError::TokenExpired => SyncError::TokenExpired,
            other => SyncError::Other(other.to_string()),
        }
    }
}

impl From<DomainError> for SyncError {
    fn from(error: DomainError) -> Self {
        match error {
            DomainError::Database(db) => SyncError::LocalDatabase(db),
            DomainError::Provider(provider) => SyncError::from(provider),
            other => SyncError::Persistence(other.to_string()),
        }
    }
}

/// Outbox push errors. Individual entry failures are never reported here.
#[derive(Debug, Error, Clone, Serialize)]
pub enum PushError {
    #[error("Remote store unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Local database error: {0}")]
    LocalDatabase(#[from] DbError),
}

impl From<DomainError> for PushError {
    fn from(error: DomainError) -> Self {
        match error {
            DomainError::Database(db) => PushError::LocalDatabase(db),
            other => PushError::LocalDatabase(DbError::Other(other.to_string())),
        }
    }
}

/// Service-level errors
#[derive(Debug, Error, Clone, Serialize)]
pub enum ServiceError {
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Push error: {0}")]
    Push(#[from] PushError),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Unknown metric: {0}")]
    UnknownMetric(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl From<DbError> for ServiceError {
    fn from(error: DbError) -> Self {
        ServiceError::Domain(DomainError::Database(error))
    }
}

impl From<RemoteError> for ServiceError {
    fn from(error: RemoteError) -> Self {
        ServiceError::Domain(DomainError::Remote(error))
    }
}

impl From<ValidationError> for ServiceError {
    fn from(error: ValidationError) -> Self {
        ServiceError::Domain(DomainError::Validation(error))
    }
}

/// Validation errors
#[derive(Debug, Error, Clone, Serialize)]
pub enum ValidationError {
    #[error("Field '{field}' is required")]
    Required {
        field: String,
    },

    #[error("Field '{field}' must be between {min} and {max}")]
    Range {
        field: String,
        min: String,
        max: String,
    },

    #[error("Field '{field}' contains invalid format: {reason}")]
    Format {
        field: String,
        reason: String,
    },

    #[error("Field '{field}' contains an invalid value: {reason}")]
    InvalidValue {
        field: String,
        reason: String,
    },

    #[error("Validation error: {0}")]
    Custom(String),
}

impl ValidationError {
    pub fn required(field: &str) -> Self {
        Self::Required {
            field: field.to_string(),
        }
    }

    pub fn range<T: fmt::Display>(field: &str, min: T, max: T) -> Self {
        Self::Range {
            field: field.to_string(),
            min: min.to_string(),
            max: max.to_string(),
        }
    }

    pub fn format(field: &str, reason: &str) -> Self {
        Self::Format {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid_value(field: &str, reason: &str) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn custom(message: &str) -> Self {
        Self::Custom(message.to_string())
    }
}
