use chrono::{DateTime, Utc};

use crate::errors::{DomainError, ValidationError};

/// Utility function to sanitize identifiers used in remote table paths
pub fn sanitize_identifier(identifier: &str) -> String {
    // Only allow alphanumerics and underscores in identifiers
    let safe_id: String = identifier.chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect();

    if safe_id.is_empty() {
        return "_invalid".to_string();
    }

    // Prevent numeric-only identifiers
    if safe_id.chars().all(|c| c.is_numeric()) {
        return format!("_{}", safe_id);
    }

    safe_id
}

/// Reject table or column names that would change once sanitized
pub fn validate_identifier(field: &str, identifier: &str) -> Result<(), ValidationError> {
    if sanitize_identifier(identifier) != identifier {
        return Err(ValidationError::format(
            field,
            &format!("'{}' contains characters not allowed in identifiers", identifier),
        ));
    }
    Ok(())
}

/// Parse an RFC 3339 column value
pub fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>, DomainError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DomainError::Validation(ValidationError::format(field, &e.to_string())))
}

/// One-line description of an outbox operation for logs
pub fn format_sync_operation(
    operation: &str,
    partition: &str,
    record_id: &str,
    status: &str,
    error: Option<&str>,
) -> String {
    if let Some(err) = error {
        format!("{} {}/{} - {} - Error: {}", operation, partition, record_id, status, err)
    } else {
        format!("{} {}/{} - {}", operation, partition, record_id, status)
    }
}
