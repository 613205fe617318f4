mod error;

pub use error::{
    DbError, DomainError, ProviderError, PushError, RemoteError, Retryable, ServiceError,
    SyncError, ValidationError,
};

/// Result type for database operations
pub type DbResult<T> = Result<T, DbError>;

/// Result type for domain operations
pub type DomainResult<T> = Result<T, DomainError>;

/// Result type for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type for outbox push operations
pub type PushResult<T> = Result<T, PushError>;

/// Result type for provider calls
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Result type for remote store calls
pub type RemoteResult<T> = Result<T, RemoteError>;
