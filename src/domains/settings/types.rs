use crate::errors::{DomainError, DomainResult, ValidationError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;

/// Per-metric configuration, stored remotely for each user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSetting {
    pub metric: String,
    pub enabled: bool,
    #[serde(default)]
    pub preferred_source: Option<String>,
    /// Empty means any source is acceptable.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub allowed_sources: BTreeSet<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl MetricSetting {
    /// The state of a metric that has never been configured
    pub fn disabled(metric: &str) -> Self {
        Self {
            metric: metric.to_string(),
            enabled: false,
            preferred_source: None,
            allowed_sources: BTreeSet::new(),
            updated_at: None,
        }
    }

    pub fn allows_source(&self, source: &str) -> bool {
        self.allowed_sources.is_empty() || self.allowed_sources.contains(source)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.metric.trim().is_empty() {
            return Err(ValidationError::required("metric"));
        }
        if let Some(source) = &self.preferred_source {
            if source.trim().is_empty() {
                return Err(ValidationError::invalid_value("preferred_source", "must not be blank"));
            }
            if !self.allows_source(source) {
                return Err(ValidationError::invalid_value(
                    "preferred_source",
                    &format!("'{}' is not one of the allowed sources", source),
                ));
            }
        }
        Ok(())
    }

    /// Copy with a new enabled flag and timestamp
    pub fn with_enabled(&self, enabled: bool, now: DateTime<Utc>) -> Self {
        Self {
            enabled,
            updated_at: Some(now),
            ..self.clone()
        }
    }

    /// Row for the remote settings table
    pub fn to_remote_row(&self, user_id: &str) -> Value {
        json!({
            "user_id": user_id,
            "metric": self.metric,
            "enabled": self.enabled,
            "preferred_source": self.preferred_source,
            "allowed_sources": self.allowed_sources,
            "updated_at": self.updated_at.map(|t| t.to_rfc3339()),
        })
    }

    pub fn from_remote_row(row: &Value) -> DomainResult<Self> {
        // Remote rows carry user_id and may carry columns this build does not know.
        serde_json::from_value(row.clone()).map_err(|e| {
            DomainError::Validation(ValidationError::format("metric_settings row", &e.to_string()))
        })
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<BTreeSet<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Lifecycle state of a metric as seen by the toggle coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricState {
    Disabled,
    PermissionPending,
    Enabled,
}

impl MetricState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricState::Disabled => "disabled",
            MetricState::PermissionPending => "permission_pending",
            MetricState::Enabled => "enabled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preferred_source_must_be_allowed() {
        let mut setting = MetricSetting::disabled("steps");
        setting.preferred_source = Some("fitbit".into());
        assert!(setting.validate().is_ok());

        setting.allowed_sources = ["health_connect".to_string()].into_iter().collect();
        assert!(matches!(setting.validate(), Err(ValidationError::InvalidValue { .. })));

        setting.preferred_source = Some("health_connect".into());
        assert!(setting.validate().is_ok());
    }

    #[test]
    fn test_remote_row_tolerates_extra_and_null_columns() {
        let row = serde_json::json!({
            "user_id": "u1",
            "metric": "sleep",
            "enabled": true,
            "preferred_source": null,
            "allowed_sources": ["health_connect"],
            "inserted_at": "2024-01-01T00:00:00Z"
        });
        let setting = MetricSetting::from_remote_row(&row).unwrap();
        assert!(setting.enabled);
        assert!(setting.allows_source("health_connect"));
        assert!(!setting.allows_source("fitbit"));

        let round = MetricSetting::from_remote_row(&setting.to_remote_row("u1")).unwrap();
        assert_eq!(round, setting);

        let row = serde_json::json!({ "metric": "gps", "enabled": false, "allowed_sources": null });
        assert!(MetricSetting::from_remote_row(&row).unwrap().allowed_sources.is_empty());
    }
}
