use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{
    DbError, DomainError, ProviderError, PushError, RemoteError, ServiceError, SyncError, ValidationError,
};

/// Error codes for FFI boundary
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Success (no error)
    Success = 0,

    // General errors (1-99)
    InvalidArgument = 2,
    NullPointer = 3,
    InvalidUtf8 = 4,
    InternalError = 6,

    // Database errors (100-199)
    DatabaseGeneral = 100,
    DatabaseTransaction = 105,
    DatabaseMigration = 106,

    // Domain errors (200-299)
    EntityNotFound = 201,
    ValidationFailed = 204,

    // Service errors (300-399)
    UnknownMetric = 301,
    SchedulerError = 302,
    ServiceUnavailable = 309,

    // Sync errors (400-499)
    SyncGeneral = 400,
    SyncNetworkError = 401,
    SyncPermissionDenied = 402,
    SyncTokenExpired = 403,
    SyncPersistence = 404,
    SyncUnknownProvider = 405,
    SyncTimeout = 411,

    // Remote store and provider errors (500-599)
    RemoteTransport = 500,
    RemoteRejected = 501,
    RemoteServerError = 502,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, *self as i32)
    }
}

/// Error type for FFI boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FFIError {
    /// Error code for programmatic handling
    pub code: ErrorCode,

    /// Human-readable error message
    pub message: String,

    /// Optional additional details (JSON string)
    pub details: Option<String>,
}

impl fmt::Display for FFIError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(details) = &self.details {
            write!(f, "{}: {} ({})", self.code, self.message, details)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl std::error::Error for FFIError {}

impl FFIError {
    pub fn new(code: ErrorCode, message: &str) -> Self {
        Self {
            code,
            message: message.to_string(),
            details: None,
        }
    }

    pub fn with_details(code: ErrorCode, message: &str, details: &str) -> Self {
        Self {
            code,
            message: message.to_string(),
            details: Some(details.to_string()),
        }
    }

    pub fn invalid_argument(message: &str) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    pub fn internal(message: String) -> Self {
        Self::new(ErrorCode::InternalError, &message)
    }
}

impl From<DbError> for FFIError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Sqlx(sqlx_err) => Self::new(ErrorCode::DatabaseGeneral, &sqlx_err.to_string()),
            DbError::Transaction(msg) => Self::new(ErrorCode::DatabaseTransaction, &msg),
            DbError::Migration(msg) => Self::new(ErrorCode::DatabaseMigration, &msg),
            DbError::Other(msg) => Self::new(ErrorCode::DatabaseGeneral, &msg),
        }
    }
}

impl From<RemoteError> for FFIError {
    fn from(err: RemoteError) -> Self {
        let message = err.to_string();
        match err {
            RemoteError::Transport(_) => Self::new(ErrorCode::RemoteTransport, &message),
            RemoteError::Timeout(_) => Self::new(ErrorCode::SyncTimeout, &message),
            RemoteError::Server { status, .. } => Self::with_details(
                ErrorCode::RemoteServerError,
                &message,
                &format!("{{\"status\":{}}}", status),
            ),
            RemoteError::Rejected { status, .. } => Self::with_details(
                ErrorCode::RemoteRejected,
                &message,
                &format!("{{\"status\":{}}}", status),
            ),
            RemoteError::NotFound(_) => Self::new(ErrorCode::EntityNotFound, &message),
            RemoteError::Decode(_) => Self::new(ErrorCode::RemoteServerError, &message),
        }
    }
}

impl From<ProviderError> for FFIError {
    fn from(err: ProviderError) -> Self {
        Self::from(SyncError::from(err))
    }
}

impl From<DomainError> for FFIError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Database(db_err) => db_err.into(),
            DomainError::Validation(val_err) => val_err.into(),
            DomainError::Remote(remote_err) => remote_err.into(),
            DomainError::Provider(provider_err) => provider_err.into(),
            DomainError::Internal(msg) => Self::new(ErrorCode::InternalError, &msg),
        }
    }
}

impl From<SyncError> for FFIError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::TransientTransport(msg) => Self::new(ErrorCode::SyncNetworkError, &msg),
            SyncError::TokenExpired => Self::new(ErrorCode::SyncTokenExpired, "Resumption token expired"),
            SyncError::PermissionDenied(msg) => Self::new(ErrorCode::SyncPermissionDenied, &msg),
            SyncError::Persistence(msg) => Self::new(ErrorCode::SyncPersistence, &msg),
            SyncError::LocalDatabase(db_err) => db_err.into(),
            SyncError::UnknownProvider(id) => Self::with_details(
                ErrorCode::SyncUnknownProvider,
                &format!("No provider registered with id {}", id),
                &format!("{{\"provider_id\":\"{}\"}}", id),
            ),
            SyncError::Other(msg) => Self::new(ErrorCode::SyncGeneral, &msg),
        }
    }
}

impl From<PushError> for FFIError {
    fn from(err: PushError) -> Self {
        match err {
            PushError::TransportUnavailable(msg) => Self::new(ErrorCode::RemoteTransport, &msg),
            PushError::LocalDatabase(db_err) => db_err.into(),
        }
    }
}

impl From<ServiceError> for FFIError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Domain(domain_err) => domain_err.into(),
            ServiceError::Sync(sync_err) => sync_err.into(),
            ServiceError::Push(push_err) => push_err.into(),
            ServiceError::Scheduler(msg) => Self::new(ErrorCode::SchedulerError, &msg),
            ServiceError::UnknownMetric(metric) => Self::with_details(
                ErrorCode::UnknownMetric,
                &format!("Unknown metric: {}", metric),
                &format!("{{\"metric\":\"{}\"}}", metric),
            ),
            ServiceError::ServiceUnavailable(msg) => Self::new(ErrorCode::ServiceUnavailable, &msg),
        }
    }
}

impl From<ValidationError> for FFIError {
    fn from(err: ValidationError) -> Self {
        let message = err.to_string();
        let details = match &err {
            ValidationError::Required { field } => format!("{{\"field\":\"{}\",\"type\":\"required\"}}", field),
            ValidationError::Range { field, min, max } => format!(
                "{{\"field\":\"{}\",\"type\":\"range\",\"min\":\"{}\",\"max\":\"{}\"}}",
                field, min, max
            ),
            ValidationError::Format { field, .. } => format!("{{\"field\":\"{}\",\"type\":\"format\"}}", field),
            ValidationError::InvalidValue { field, .. } => {
                format!("{{\"field\":\"{}\",\"type\":\"invalid_value\"}}", field)
            }
            ValidationError::Custom(_) => "{\"type\":\"custom\"}".to_string(),
        };
        Self::with_details(ErrorCode::ValidationFailed, &message, &details)
    }
}

impl From<std::ffi::NulError> for FFIError {
    fn from(_: std::ffi::NulError) -> Self {
        Self::new(ErrorCode::InvalidUtf8, "String contains null bytes, cannot create CString")
    }
}

/// Result type alias for FFI functions
pub type FFIResult<T> = Result<T, FFIError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_errors_keep_specific_codes() {
        let err: FFIError = ServiceError::Domain(DomainError::Remote(RemoteError::Transport("down".into()))).into();
        assert_eq!(err.code, ErrorCode::RemoteTransport);

        let err: FFIError = ServiceError::UnknownMetric("gps".into()).into();
        assert_eq!(err.code, ErrorCode::UnknownMetric);
        assert_eq!(err.details.as_deref(), Some("{\"metric\":\"gps\"}"));

        let err: FFIError = ProviderError::PermissionRevoked("steps".into()).into();
        assert_eq!(err.code, ErrorCode::SyncPermissionDenied);
    }

    #[test]
    fn test_validation_error_serializes_for_host() {
        let err: FFIError = ValidationError::required("user_id").into();
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "ValidationFailed");
        assert_eq!(json["message"], "Field 'user_id' is required");
    }
}
