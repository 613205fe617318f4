use async_trait::async_trait;
use log::warn;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::domains::remote::{RemoteFilter, RemoteStore};
use crate::domains::settings::types::MetricSetting;
use crate::domains::sync::backoff::{retry_with_backoff, BackoffPolicy};
use crate::errors::{DomainError, DomainResult};

/// Key/value store of per-metric settings
#[async_trait]
pub trait MetricSettingsStore: Send + Sync {
    /// Setting for one metric; a metric never written reads as disabled
    async fn get(&self, metric: &str) -> DomainResult<MetricSetting>;

    /// Every stored setting, keyed by metric name
    async fn get_all(&self) -> DomainResult<HashMap<String, MetricSetting>>;

    async fn put(&self, setting: &MetricSetting) -> DomainResult<()>;

    /// Write several settings in one request
    async fn put_many(&self, settings: &[MetricSetting]) -> DomainResult<()>;
}

pub const SETTINGS_CONFLICT_KEY: [&str; 2] = ["user_id", "metric"];

/// MetricSettingsStore backed by the remote settings table. Reads fall back
/// to the last snapshot when the store is unreachable; writes never do.
pub struct RemoteMetricSettingsStore {
    remote: Arc<dyn RemoteStore>,
    user_id: String,
    table: String,
    policy: BackoffPolicy,
    cache: RwLock<HashMap<String, MetricSetting>>,
}

impl RemoteMetricSettingsStore {
    pub fn new(remote: Arc<dyn RemoteStore>, user_id: &str, table: &str, policy: BackoffPolicy) -> Self {
        Self {
            remote,
            user_id: user_id.to_string(),
            table: table.to_string(),
            policy,
            cache: RwLock::new(HashMap::new()),
        }
    }

    async fn fetch(&self, filter: RemoteFilter) -> DomainResult<Vec<MetricSetting>> {
        let rows = retry_with_backoff("read metric settings", &self.policy, || {
            self.remote.read(&self.table, &filter)
        })
        .await?;

        let mut settings = Vec::with_capacity(rows.len());
        for row in &rows {
            match MetricSetting::from_remote_row(row) {
                Ok(setting) => settings.push(setting),
                Err(e) => warn!("Ignoring unreadable metric setting row: {}", e),
            }
        }
        Ok(settings)
    }
}

#[async_trait]
impl MetricSettingsStore for RemoteMetricSettingsStore {
    async fn get(&self, metric: &str) -> DomainResult<MetricSetting> {
        let filter = RemoteFilter::new().eq("user_id", &self.user_id).eq("metric", metric);
        match self.fetch(filter).await {
            Ok(mut settings) => {
                let setting = settings.pop().unwrap_or_else(|| MetricSetting::disabled(metric));
                self.cache.write().await.insert(metric.to_string(), setting.clone());
                Ok(setting)
            }
            Err(DomainError::Remote(e)) if e.is_transport() => {
                let cache = self.cache.read().await;
                match cache.get(metric) {
                    Some(cached) => {
                        warn!("Settings store unreachable, using cached {} setting: {}", metric, e);
                        Ok(cached.clone())
                    }
                    None => Err(DomainError::Remote(e)),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn get_all(&self) -> DomainResult<HashMap<String, MetricSetting>> {
        let filter = RemoteFilter::new().eq("user_id", &self.user_id);
        match self.fetch(filter).await {
            Ok(settings) => {
                let map: HashMap<String, MetricSetting> =
                    settings.into_iter().map(|s| (s.metric.clone(), s)).collect();
                *self.cache.write().await = map.clone();
                Ok(map)
            }
            Err(DomainError::Remote(e)) if e.is_transport() => {
                let cache = self.cache.read().await;
                if cache.is_empty() {
                    return Err(DomainError::Remote(e));
                }
                warn!("Settings store unreachable, using cached snapshot: {}", e);
                Ok(cache.clone())
            }
            Err(e) => Err(e),
        }
    }

    async fn put(&self, setting: &MetricSetting) -> DomainResult<()> {
        self.put_many(std::slice::from_ref(setting)).await
    }

    async fn put_many(&self, settings: &[MetricSetting]) -> DomainResult<()> {
        if settings.is_empty() {
            return Ok(());
        }
        for setting in settings {
            setting.validate()?;
        }
        let rows: Vec<_> = settings.iter().map(|s| s.to_remote_row(&self.user_id)).collect();
        retry_with_backoff("write metric settings", &self.policy, || {
            self.remote.upsert(&self.table, &rows, &SETTINGS_CONFLICT_KEY)
        })
        .await?;

        let mut cache = self.cache.write().await;
        for setting in settings {
            cache.insert(setting.metric.clone(), setting.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeRemoteStore;

    fn store(remote: Arc<FakeRemoteStore>) -> RemoteMetricSettingsStore {
        RemoteMetricSettingsStore::new(remote, "user-1", "metric_settings", BackoffPolicy::immediate(0))
    }

    #[tokio::test]
    async fn test_unknown_metric_reads_disabled() {
        let settings = store(Arc::new(FakeRemoteStore::new()));
        let setting = settings.get("steps").await.unwrap();
        assert_eq!(setting, MetricSetting::disabled("steps"));
    }

    #[tokio::test]
    async fn test_put_merges_on_user_and_metric() {
        let remote = Arc::new(FakeRemoteStore::new());
        let settings = store(remote.clone());

        let mut steps = MetricSetting::disabled("steps");
        steps.enabled = true;
        settings.put(&steps).await.unwrap();
        steps.preferred_source = Some("health_connect".into());
        settings.put(&steps).await.unwrap();

        assert_eq!(remote.rows("metric_settings").len(), 1);
        let all = settings.get_all().await.unwrap();
        assert_eq!(all["steps"].preferred_source.as_deref(), Some("health_connect"));
    }

    #[tokio::test]
    async fn test_reads_fall_back_to_cache_but_writes_fail() {
        let remote = Arc::new(FakeRemoteStore::new());
        let settings = store(remote.clone());
        let mut sleep = MetricSetting::disabled("sleep");
        sleep.enabled = true;
        settings.put(&sleep).await.unwrap();

        remote.set_transport_down(true);
        assert!(settings.get("sleep").await.unwrap().enabled);
        assert!(settings.get_all().await.unwrap()["sleep"].enabled);

        let err = settings.put(&MetricSetting::disabled("sleep")).await.unwrap_err();
        assert!(matches!(err, DomainError::Remote(_)));
    }

    #[tokio::test]
    async fn test_invalid_setting_is_not_written() {
        let remote = Arc::new(FakeRemoteStore::new());
        let settings = store(remote.clone());
        let mut bad = MetricSetting::disabled("gps");
        bad.allowed_sources = ["device".to_string()].into_iter().collect();
        bad.preferred_source = Some("watch".into());

        assert!(matches!(settings.put(&bad).await, Err(DomainError::Validation(_))));
        assert!(remote.rows("metric_settings").is_empty());
    }
}
