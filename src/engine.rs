//! Wires the sync domains into one engine instance.

use async_trait::async_trait;
use log::{error, info};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::config::{MetricConfig, SyncEngineConfig};
use crate::domains::metrics::{
    MetricDefinition, MetricRegistry, MetricToggleCoordinator, MetricTransition, SqliteTransitionRepository,
    ToggleResult, TransitionRepository,
};
use crate::domains::permission::{Capability, HostPermissionGate};
use crate::domains::provider::{ProviderRegistry, RestHealthProvider};
use crate::domains::remote::{RemoteStore, RestRemoteStore};
use crate::domains::scheduler::{
    BackgroundTask, TaskOutcome, TaskScheduler, TokioTaskScheduler, WatchdogReport, WatchdogScheduler,
};
use crate::domains::settings::{MetricSetting, MetricSettingsStore, MetricState, RemoteMetricSettingsStore};
use crate::domains::sync::{
    ChangeTokenSyncer, OutboxPusher, SqliteOutboxRepository, SqliteSyncStateRepository, SyncActivationHandler,
    SyncKey, SyncRunReport, SyncService,
};
use crate::errors::{ServiceError, ServiceResult, ValidationError};

/// External collaborators of the engine
pub struct EngineParts {
    pub remote: Arc<dyn RemoteStore>,
    pub providers: ProviderRegistry,
    pub scheduler: Arc<dyn TaskScheduler>,
}

impl EngineParts {
    /// REST remote store, HTTP providers and the in-process scheduler.
    /// Must be called from within a tokio runtime.
    pub fn from_config(config: &SyncEngineConfig) -> Self {
        let policy = config.backoff.to_policy();
        let mut providers = ProviderRegistry::new();
        for provider in &config.providers {
            providers.register(Arc::new(RestHealthProvider::new(provider, policy.call_timeout)));
        }
        Self {
            remote: Arc::new(RestRemoteStore::new(&config.remote, policy.call_timeout)),
            providers,
            scheduler: Arc::new(TokioTaskScheduler::new(policy)),
        }
    }
}

pub struct SyncEngine {
    coordinator: MetricToggleCoordinator,
    sync: Arc<SyncService>,
    watchdog: Arc<WatchdogScheduler>,
    permissions: Arc<HostPermissionGate>,
    transitions: Arc<dyn TransitionRepository>,
}

fn build_registry(
    metrics: &[MetricConfig],
    handler: Arc<SyncActivationHandler>,
) -> Result<MetricRegistry, ValidationError> {
    let mut registry = MetricRegistry::new();
    for metric in metrics {
        let mut definition = MetricDefinition::new(&metric.name).with_handler(handler.clone());
        for permission in &metric.permissions {
            definition = definition.requires(permission.parse::<Capability>()?);
        }
        for prerequisite in &metric.depends_on {
            definition = definition.depends_on(prerequisite);
        }
        for key in &metric.sync_keys {
            let key = key
                .parse::<SyncKey>()
                .map_err(|e| ValidationError::format("metrics.sync_keys", &e.to_string()))?;
            definition = definition.syncs(key);
        }
        for source in &metric.resync_sources {
            definition = definition.resync_on(source);
        }
        registry.register(definition)?;
    }
    registry.validate()?;
    Ok(registry)
}

impl SyncEngine {
    pub fn assemble(config: &SyncEngineConfig, pool: SqlitePool, parts: EngineParts) -> ServiceResult<Arc<Self>> {
        let policy = config.backoff.to_policy();
        let handler = Arc::new(SyncActivationHandler::new());
        let registry = Arc::new(build_registry(&config.metrics, handler.clone())?);

        let settings: Arc<dyn MetricSettingsStore> = Arc::new(RemoteMetricSettingsStore::new(
            parts.remote.clone(),
            &config.user_id,
            &config.remote.settings_table,
            policy.clone(),
        ));
        let permissions = Arc::new(HostPermissionGate::new());
        let transitions: Arc<dyn TransitionRepository> = Arc::new(SqliteTransitionRepository::new(pool.clone()));
        let states = Arc::new(SqliteSyncStateRepository::new(pool.clone()));
        let outbox = Arc::new(SqliteOutboxRepository::new(pool.clone()));

        let syncer = Arc::new(ChangeTokenSyncer::new(
            pool,
            states,
            outbox.clone(),
            policy.clone(),
            config.backfill_window(),
            config.max_pages_per_run,
        ));
        let pusher = Arc::new(OutboxPusher::new(
            outbox,
            parts.remote,
            &config.user_id,
            &config.remote.records_table,
            policy,
            config.push_batch_limit,
            config.max_consecutive_transport_failures,
        ));
        let watchdog = Arc::new(WatchdogScheduler::new(
            parts.scheduler.clone(),
            settings.clone(),
            config.watchdog_period(),
        ));
        let sync = Arc::new(SyncService::new(
            parts.providers,
            registry.clone(),
            settings.clone(),
            syncer,
            pusher,
            parts.scheduler,
            watchdog.clone(),
            config.foreground_debounce(),
            config.sync_period(),
        ));
        handler.bind(&sync);

        let coordinator = MetricToggleCoordinator::new(registry, settings, permissions.clone(), transitions.clone());
        info!("Sync engine assembled with metrics {:?}", coordinator.registry().names());

        Ok(Arc::new(Self {
            coordinator,
            sync,
            watchdog,
            permissions,
            transitions,
        }))
    }

    /// Re-arm the watchdog and every enabled metric's periodic sync
    pub async fn on_boot(self: &Arc<Self>) -> ServiceResult<Vec<String>> {
        let tick: Arc<dyn BackgroundTask> = Arc::new(WatchdogTickTask {
            engine: Arc::downgrade(self),
        });
        self.sync.on_boot(tick).await
    }

    /// Dependency reconciliation followed by one watchdog verification pass
    pub async fn watchdog_tick(&self) -> ServiceResult<WatchdogReport> {
        let reconciled = self.coordinator.reconcile().await?;
        let mut report = self.watchdog.tick().await?;
        report.reconciled = reconciled;
        Ok(report)
    }

    pub async fn toggle_on(&self, metric: &str, preferred_source: Option<String>) -> ToggleResult {
        self.coordinator.toggle_on(metric, preferred_source).await
    }

    pub async fn toggle_off(&self, metric: &str) -> ToggleResult {
        self.coordinator.toggle_off(metric).await
    }

    pub async fn change_source(&self, metric: &str, source: Option<String>, current_enabled: bool) -> ToggleResult {
        self.coordinator.change_source(metric, source, current_enabled).await
    }

    pub async fn on_permission_result(&self, metric: &str, granted: bool) -> ToggleResult {
        self.coordinator.on_permission_result(metric, granted).await
    }

    pub async fn set_permission(&self, capability: Capability, granted: bool) {
        self.permissions.set_status(capability, granted).await;
    }

    pub async fn metric_state(&self, metric: &str) -> ServiceResult<MetricState> {
        if self.coordinator.registry().get(metric).is_none() {
            return Err(ServiceError::UnknownMetric(metric.to_string()));
        }
        self.coordinator.metric_state(metric).await
    }

    pub async fn settings_snapshot(&self) -> ServiceResult<HashMap<String, MetricSetting>> {
        self.coordinator.settings_snapshot().await
    }

    pub async fn transitions(&self, metric: &str, limit: u32) -> ServiceResult<Vec<MetricTransition>> {
        Ok(self.transitions.find_by_metric(metric, limit).await?)
    }

    pub async fn on_push_wake(&self, keys: Vec<SyncKey>) -> ServiceResult<Vec<SyncRunReport>> {
        self.sync.on_push_wake(keys).await
    }

    pub async fn on_app_foreground(&self) -> ServiceResult<Vec<String>> {
        self.sync.on_app_foreground().await
    }

    pub async fn run_sync_job(&self, key: &SyncKey) -> SyncRunReport {
        self.sync.run_sync_job(key).await
    }
}

/// Periodic body of the watchdog task
struct WatchdogTickTask {
    engine: Weak<SyncEngine>,
}

#[async_trait]
impl BackgroundTask for WatchdogTickTask {
    async fn run(&self) -> TaskOutcome {
        let Some(engine) = self.engine.upgrade() else {
            return TaskOutcome::Failure;
        };
        match engine.watchdog_tick().await {
            Ok(_) => TaskOutcome::Success,
            Err(e) => {
                error!("Watchdog tick failed: {}", e);
                TaskOutcome::Retry
            }
        }
    }
}
