//! Engine configuration supplied by the host app at initialisation.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domains::sync::backoff::BackoffPolicy;
use crate::errors::ValidationError;

/// Platforms refuse periodic work more frequent than this.
pub const MIN_PERIODIC_INTERVAL_MINUTES: u64 = 15;

fn default_backfill_days() -> i64 { 30 }
fn default_max_pages_per_run() -> u32 { 50 }
fn default_sync_period_minutes() -> u64 { 60 }
fn default_watchdog_period_minutes() -> u64 { MIN_PERIODIC_INTERVAL_MINUTES }
fn default_foreground_debounce_seconds() -> i64 { 5 * 60 }
fn default_push_batch_limit() -> u32 { 500 }
fn default_max_consecutive_transport_failures() -> u32 { 5 }
fn default_records_table() -> String { "passive_metric_records".to_string() }
fn default_settings_table() -> String { "metric_settings".to_string() }

/// Remote REST store connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteStoreConfig {
    pub base_url: String,
    pub api_key: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_records_table")]
    pub records_table: String,
    #[serde(default = "default_settings_table")]
    pub settings_table: String,
}

/// One HTTP health provider exposing the change-token API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Record types this provider feeds, e.g. "steps" or "sleep"
    #[serde(default)]
    pub record_types: Vec<String>,
}

/// One metric of the catalogue the host app exposes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricConfig {
    pub name: String,
    /// Capabilities in prompt order, e.g. "location" or "health_data:steps"
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Feeds read by this metric as "provider:record_type"
    #[serde(default)]
    pub sync_keys: Vec<String>,
    /// Switching to one of these sources triggers a resync
    #[serde(default)]
    pub resync_sources: Vec<String>,
}

/// Retry tuning for provider and remote-store calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub max_retries: u32,
    pub call_timeout_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            max_retries: 3,
            call_timeout_secs: 30,
        }
    }
}

impl BackoffConfig {
    pub fn to_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            max_retries: self.max_retries,
            call_timeout: Duration::from_secs(self.call_timeout_secs),
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEngineConfig {
    pub db_url: String,
    pub user_id: String,
    pub remote: RemoteStoreConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub metrics: Vec<MetricConfig>,
    #[serde(default = "default_backfill_days")]
    pub backfill_days: i64,
    #[serde(default = "default_max_pages_per_run")]
    pub max_pages_per_run: u32,
    #[serde(default = "default_sync_period_minutes")]
    pub sync_period_minutes: u64,
    #[serde(default = "default_watchdog_period_minutes")]
    pub watchdog_period_minutes: u64,
    #[serde(default = "default_foreground_debounce_seconds")]
    pub foreground_debounce_seconds: i64,
    #[serde(default = "default_push_batch_limit")]
    pub push_batch_limit: u32,
    #[serde(default = "default_max_consecutive_transport_failures")]
    pub max_consecutive_transport_failures: u32,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl SyncEngineConfig {
    /// Parse the JSON document handed over by the host app, then apply
    /// environment overrides.
    pub fn from_json(json: &str) -> Result<Self, ValidationError> {
        let mut config: SyncEngineConfig = serde_json::from_str(json)
            .map_err(|e| ValidationError::format("config", &e.to_string()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Development builds may keep secrets in a local `.env` file.
    fn apply_env_overrides(&mut self) {
        #[cfg(debug_assertions)]
        {
            let _ = dotenv::dotenv();
        }

        if let Ok(url) = std::env::var("METRIC_SYNC_REMOTE_URL") {
            log::debug!("Remote URL overridden from environment");
            self.remote.base_url = url;
        }
        if let Ok(key) = std::env::var("METRIC_SYNC_API_KEY") {
            self.remote.api_key = key;
        }
        if let Ok(days) = std::env::var("METRIC_SYNC_BACKFILL_DAYS") {
            match days.parse::<i64>() {
                Ok(days) => self.backfill_days = days,
                Err(_) => log::warn!("Ignoring non-numeric METRIC_SYNC_BACKFILL_DAYS={}", days),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.db_url.trim().is_empty() {
            return Err(ValidationError::required("db_url"));
        }
        if !self.db_url.starts_with("sqlite:") {
            return Err(ValidationError::format("db_url", "must be a sqlite: URL"));
        }
        if self.user_id.trim().is_empty() {
            return Err(ValidationError::required("user_id"));
        }
        if self.remote.base_url.trim().is_empty() {
            return Err(ValidationError::required("remote.base_url"));
        }
        if !(1..=3650).contains(&self.backfill_days) {
            return Err(ValidationError::range("backfill_days", 1, 3650));
        }
        if self.max_pages_per_run == 0 {
            return Err(ValidationError::invalid_value("max_pages_per_run", "must be positive"));
        }
        if self.backoff.multiplier < 1.0 {
            return Err(ValidationError::invalid_value("backoff.multiplier", "must be >= 1.0"));
        }
        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.id.as_str()) {
                return Err(ValidationError::invalid_value("providers", &format!("duplicate provider id {}", provider.id)));
            }
        }
        let mut names = std::collections::HashSet::new();
        for metric in &self.metrics {
            if !names.insert(metric.name.as_str()) {
                return Err(ValidationError::invalid_value("metrics", &format!("duplicate metric {}", metric.name)));
            }
            for key in &metric.sync_keys {
                let provider = key.split_once(':').map(|(provider, _)| provider).unwrap_or_default();
                if !self.providers.iter().any(|p| p.id == provider) {
                    return Err(ValidationError::invalid_value(
                        "metrics.sync_keys",
                        &format!("{} reads {} from an unconfigured provider", metric.name, key),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn backfill_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.backfill_days)
    }

    pub fn sync_period(&self) -> Duration {
        Duration::from_secs(self.sync_period_minutes.max(MIN_PERIODIC_INTERVAL_MINUTES) * 60)
    }

    pub fn watchdog_period(&self) -> Duration {
        Duration::from_secs(self.watchdog_period_minutes.max(MIN_PERIODIC_INTERVAL_MINUTES) * 60)
    }

    pub fn foreground_debounce(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.foreground_debounce_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "db_url": "sqlite::memory:",
        "user_id": "user-1",
        "remote": { "base_url": "https://store.example.com", "api_key": "anon" }
    }"#;

    #[test]
    fn test_defaults_applied() {
        let config: SyncEngineConfig = serde_json::from_str(MINIMAL).unwrap();
        assert_eq!(config.backfill_days, 30);
        assert_eq!(config.max_pages_per_run, 50);
        assert_eq!(config.foreground_debounce_seconds, 300);
        assert_eq!(config.remote.records_table, "passive_metric_records");
        assert_eq!(config.backoff.max_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_periods_clamped_to_platform_minimum() {
        let mut config: SyncEngineConfig = serde_json::from_str(MINIMAL).unwrap();
        config.watchdog_period_minutes = 1;
        config.sync_period_minutes = 5;
        assert_eq!(config.watchdog_period(), Duration::from_secs(15 * 60));
        assert_eq!(config.sync_period(), Duration::from_secs(15 * 60));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config: SyncEngineConfig = serde_json::from_str(MINIMAL).unwrap();
        config.db_url = "/tmp/file.db".to_string();
        assert!(matches!(config.validate(), Err(ValidationError::Format { .. })));

        let mut config: SyncEngineConfig = serde_json::from_str(MINIMAL).unwrap();
        config.backfill_days = 0;
        assert!(matches!(config.validate(), Err(ValidationError::Range { .. })));

        let mut config: SyncEngineConfig = serde_json::from_str(MINIMAL).unwrap();
        config.providers = vec![
            ProviderConfig { id: "fit".into(), base_url: "https://a".into(), api_key: None, record_types: vec![] },
            ProviderConfig { id: "fit".into(), base_url: "https://b".into(), api_key: None, record_types: vec![] },
        ];
        assert!(matches!(config.validate(), Err(ValidationError::InvalidValue { .. })));
    }

    #[test]
    fn test_metric_must_read_configured_provider() {
        let mut config: SyncEngineConfig = serde_json::from_str(MINIMAL).unwrap();
        config.metrics = vec![MetricConfig {
            name: "steps".into(),
            permissions: vec!["health_data:steps".into()],
            depends_on: vec![],
            sync_keys: vec!["health_connect:steps".into()],
            resync_sources: vec![],
        }];
        assert!(matches!(config.validate(), Err(ValidationError::InvalidValue { .. })));

        config.providers = vec![ProviderConfig {
            id: "health_connect".into(),
            base_url: "https://hc.example.com".into(),
            api_key: None,
            record_types: vec!["steps".into()],
        }];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_malformed_json_is_format_error() {
        let err = SyncEngineConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, ValidationError::Format { .. }));
    }
}
