use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, error, info, warn};
use once_cell::sync::OnceCell;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use uuid::Uuid;

use crate::domains::metrics::{ActivationHandler, MetricDefinition, MetricRegistry};
use crate::domains::provider::ProviderRegistry;
use crate::domains::scheduler::{
    BackgroundTask, ExistingTaskPolicy, TaskOutcome, TaskRequest, TaskScheduler, WatchdogScheduler,
};
use crate::domains::settings::{MetricSetting, MetricSettingsStore};
use crate::domains::sync::pusher::OutboxPusher;
use crate::domains::sync::syncer::ChangeTokenSyncer;
use crate::domains::sync::types::{SyncJobStatus, SyncKey, SyncRunReport};
use crate::errors::{PushError, ServiceError, ServiceResult, SyncError};

/// Runs sync jobs and answers the external triggers: push wake-ups,
/// app-foreground events and boot.
pub struct SyncService {
    providers: ProviderRegistry,
    registry: Arc<MetricRegistry>,
    settings: Arc<dyn MetricSettingsStore>,
    syncer: Arc<ChangeTokenSyncer>,
    pusher: Arc<OutboxPusher>,
    scheduler: Arc<dyn TaskScheduler>,
    watchdog: Arc<WatchdogScheduler>,
    key_locks: Mutex<HashMap<SyncKey, Arc<tokio::sync::Mutex<()>>>>,
    last_foreground: Mutex<Option<DateTime<Utc>>>,
    foreground_debounce: chrono::Duration,
    sync_period: Duration,
}

impl SyncService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        providers: ProviderRegistry,
        registry: Arc<MetricRegistry>,
        settings: Arc<dyn MetricSettingsStore>,
        syncer: Arc<ChangeTokenSyncer>,
        pusher: Arc<OutboxPusher>,
        scheduler: Arc<dyn TaskScheduler>,
        watchdog: Arc<WatchdogScheduler>,
        foreground_debounce: chrono::Duration,
        sync_period: Duration,
    ) -> Self {
        Self {
            providers,
            registry,
            settings,
            syncer,
            pusher,
            scheduler,
            watchdog,
            key_locks: Mutex::new(HashMap::new()),
            last_foreground: Mutex::new(None),
            foreground_debounce,
            sync_period,
        }
    }

    fn key_lock(&self, key: &SyncKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.key_locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(key.clone()).or_default().clone()
    }

    /// Keys read by at least one enabled metric
    pub async fn enabled_keys(&self) -> ServiceResult<Vec<SyncKey>> {
        let settings = self.settings.get_all().await?;
        Ok(self.enabled_keys_in(&settings))
    }

    fn enabled_keys_in(&self, settings: &HashMap<String, MetricSetting>) -> Vec<SyncKey> {
        self.registry
            .all_sync_keys()
            .into_iter()
            .filter(|key| self.registry.key_enabled(key, settings))
            .collect()
    }

    /// One sync pass followed by an outbox flush for `key`. Jobs for the same
    /// key never overlap; a second caller waits for the first to finish.
    pub async fn run_sync_job(&self, key: &SyncKey) -> SyncRunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        debug!("[{}] Sync job {} started", key, run_id);

        let status = self.execute(key).await;
        match &status {
            SyncJobStatus::Completed { outcome, push } => {
                info!("[{}] Sync job {} completed: {:?}, pushed {}", key, run_id, outcome, push.succeeded)
            }
            SyncJobStatus::PushDeferred { reason, .. } => {
                warn!("[{}] Sync job {} deferred push: {}", key, run_id, reason)
            }
            SyncJobStatus::SkippedDisabled => debug!("[{}] Sync job {} skipped, metric disabled", key, run_id),
            SyncJobStatus::Failed { error, retryable } => {
                error!("[{}] Sync job {} failed (retryable: {}): {}", key, run_id, retryable, error)
            }
        }

        SyncRunReport {
            run_id,
            key: key.clone(),
            status,
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn execute(&self, key: &SyncKey) -> SyncJobStatus {
        let settings = match self.settings.get_all().await {
            Ok(settings) => settings,
            Err(e) => return SyncJobStatus::Failed { error: e.to_string(), retryable: true },
        };
        if !self.registry.key_enabled(key, &settings) {
            return SyncJobStatus::SkippedDisabled;
        }
        let Some(provider) = self.providers.get(&key.provider_id) else {
            let error = SyncError::UnknownProvider(key.provider_id.clone());
            return SyncJobStatus::Failed { error: error.to_string(), retryable: false };
        };

        let outcome = match self.syncer.sync(provider.as_ref(), &key.record_type).await {
            Ok(outcome) => outcome,
            Err(e) => return SyncJobStatus::Failed { error: e.to_string(), retryable: e.is_retryable() },
        };

        match self.pusher.flush(key).await {
            Ok(push) => SyncJobStatus::Completed { outcome, push },
            Err(PushError::TransportUnavailable(reason)) => SyncJobStatus::PushDeferred { outcome, reason },
            Err(e) => SyncJobStatus::PushDeferred { outcome, reason: e.to_string() },
        }
    }

    /// A push wake-up fans out to every listed key concurrently. An empty
    /// list means every enabled key.
    pub async fn on_push_wake(self: &Arc<Self>, keys: Vec<SyncKey>) -> ServiceResult<Vec<SyncRunReport>> {
        let keys: BTreeSet<SyncKey> = if keys.is_empty() {
            self.enabled_keys().await?.into_iter().collect()
        } else {
            keys.into_iter().collect()
        };
        info!("Push wake-up for {} sync keys", keys.len());

        let jobs = keys.into_iter().map(|key| {
            let service = Arc::clone(self);
            tokio::spawn(async move { service.run_sync_job(&key).await })
        });

        let mut reports = Vec::new();
        for joined in join_all(jobs).await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!("Sync job task aborted: {}", e),
            }
        }
        Ok(reports)
    }

    pub async fn on_app_foreground(self: &Arc<Self>) -> ServiceResult<Vec<String>> {
        self.on_app_foreground_at(Utc::now()).await
    }

    /// Enqueue one sync pass per enabled key, at most once per debounce
    /// window. Returns the task names enqueued.
    pub async fn on_app_foreground_at(self: &Arc<Self>, now: DateTime<Utc>) -> ServiceResult<Vec<String>> {
        if let Some(previous) = self.last_foreground_at()? {
            if now - previous < self.foreground_debounce {
                debug!("App foreground ignored; last trigger at {}", previous);
                return Ok(Vec::new());
            }
        }

        let mut names = Vec::new();
        for key in self.enabled_keys().await? {
            names.push(self.enqueue_one_shot(&key).await?);
        }

        // Only a trigger that enqueued everything opens a new window
        *self.foreground_state()? = Some(now);
        Ok(names)
    }

    fn foreground_state(&self) -> ServiceResult<std::sync::MutexGuard<'_, Option<DateTime<Utc>>>> {
        self.last_foreground
            .lock()
            .map_err(|_| ServiceError::ServiceUnavailable("foreground state poisoned".to_string()))
    }

    fn last_foreground_at(&self) -> ServiceResult<Option<DateTime<Utc>>> {
        Ok(*self.foreground_state()?)
    }

    /// Re-arm the watchdog and the periodic task of every enabled key
    pub async fn on_boot(self: &Arc<Self>, watchdog_tick: Arc<dyn BackgroundTask>) -> ServiceResult<Vec<String>> {
        self.watchdog.arm(watchdog_tick).await?;

        let settings = self.settings.get_all().await?;
        let mut armed = Vec::new();
        for key in self.enabled_keys_in(&settings) {
            let Some(metric) = self
                .registry
                .metrics_for_key(&key)
                .into_iter()
                .find(|m| settings.get(m).map_or(false, |s| s.enabled))
            else {
                continue;
            };
            self.arm_key(&metric, &key).await?;
            armed.push(key.periodic_task_name());
        }
        info!("Boot re-armed {} periodic sync tasks", armed.len());
        Ok(armed)
    }

    fn job(self: &Arc<Self>, key: &SyncKey) -> Arc<dyn BackgroundTask> {
        Arc::new(SyncJobTask {
            service: Arc::downgrade(self),
            key: key.clone(),
        })
    }

    pub fn periodic_request(self: &Arc<Self>, key: &SyncKey) -> TaskRequest {
        TaskRequest::periodic(&key.periodic_task_name(), self.sync_period, self.job(key))
    }

    /// Schedule the periodic task of `key` and put it under watchdog guard
    pub async fn arm_key(self: &Arc<Self>, metric: &str, key: &SyncKey) -> ServiceResult<()> {
        let request = self.periodic_request(key);
        self.scheduler
            .ensure_scheduled(request.clone(), ExistingTaskPolicy::Keep)
            .await?;
        self.watchdog.guard(metric, request).await;
        Ok(())
    }

    /// Replace any queued one-off pass of `key` with a fresh one
    pub async fn enqueue_one_shot(self: &Arc<Self>, key: &SyncKey) -> ServiceResult<String> {
        let name = key.one_shot_task_name();
        self.scheduler
            .ensure_scheduled(TaskRequest::one_shot(&name, Duration::ZERO, self.job(key)), ExistingTaskPolicy::Replace)
            .await?;
        Ok(name)
    }

    /// Cancel the workers of `key`
    pub async fn disarm_key(&self, key: &SyncKey) {
        self.scheduler.cancel(&key.periodic_task_name()).await;
        self.scheduler.cancel(&key.one_shot_task_name()).await;
    }
}

/// Scheduled unit of work running one sync job
struct SyncJobTask {
    service: Weak<SyncService>,
    key: SyncKey,
}

#[async_trait]
impl BackgroundTask for SyncJobTask {
    async fn run(&self) -> TaskOutcome {
        let Some(service) = self.service.upgrade() else {
            return TaskOutcome::Failure;
        };
        match service.run_sync_job(&self.key).await.status {
            SyncJobStatus::Completed { .. } | SyncJobStatus::SkippedDisabled => TaskOutcome::Success,
            SyncJobStatus::PushDeferred { .. } => TaskOutcome::Retry,
            SyncJobStatus::Failed { retryable: true, .. } => TaskOutcome::Retry,
            SyncJobStatus::Failed { retryable: false, .. } => TaskOutcome::Failure,
        }
    }
}

/// Arms and disarms sync workers as metrics are switched on and off.
/// Bound to the service after construction, since the service's registry
/// holds this handler.
#[derive(Default)]
pub struct SyncActivationHandler {
    service: OnceCell<Weak<SyncService>>,
}

impl SyncActivationHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, service: &Arc<SyncService>) {
        if self.service.set(Arc::downgrade(service)).is_err() {
            warn!("Sync activation handler was already bound");
        }
    }

    fn service(&self) -> ServiceResult<Arc<SyncService>> {
        self.service
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| ServiceError::ServiceUnavailable("sync service not running".to_string()))
    }
}

#[async_trait]
impl ActivationHandler for SyncActivationHandler {
    async fn activate(&self, metric: &MetricDefinition, _setting: &MetricSetting) -> ServiceResult<()> {
        let service = self.service()?;
        for key in &metric.sync_keys {
            service.arm_key(&metric.name, key).await?;
            service.enqueue_one_shot(key).await?;
        }
        Ok(())
    }

    async fn deactivate(&self, metric: &MetricDefinition) -> ServiceResult<()> {
        let service = self.service()?;
        service.watchdog.release_metric(&metric.name).await;

        let settings = service.settings.get_all().await?;
        for key in &metric.sync_keys {
            let still_reading = service
                .registry
                .metrics_for_key(key)
                .into_iter()
                .find(|m| m != &metric.name && settings.get(m).map_or(false, |s| s.enabled));
            match still_reading {
                Some(other) => {
                    debug!("[{}] Still read by {}; keeping workers", key, other);
                    service.watchdog.guard(&other, service.periodic_request(key)).await;
                }
                None => service.disarm_key(key).await,
            }
        }
        Ok(())
    }

    async fn resync(&self, metric: &MetricDefinition, _setting: &MetricSetting) -> ServiceResult<()> {
        let service = self.service()?;
        for key in &metric.sync_keys {
            service.enqueue_one_shot(key).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::sync::backoff::BackoffPolicy;
    use crate::domains::sync::repository::{SqliteOutboxRepository, SqliteSyncStateRepository};
    use crate::domains::sync::types::SyncOutcome;
    use crate::domains::scheduler::TaskState;
    use crate::test_support::{
        memory_pool, record_at, FakeProvider, FakeRemoteStore, FakeTaskScheduler, InMemorySettingsStore, NoopTask,
    };
    use chrono::TimeZone;

    struct Fixture {
        service: Arc<SyncService>,
        handler: Arc<SyncActivationHandler>,
        settings: Arc<InMemorySettingsStore>,
        scheduler: Arc<FakeTaskScheduler>,
        remote: Arc<FakeRemoteStore>,
        watchdog: Arc<WatchdogScheduler>,
    }

    fn steps() -> SyncKey {
        SyncKey::new("health_connect", "steps")
    }

    fn sleep() -> SyncKey {
        SyncKey::new("health_connect", "sleep")
    }

    async fn fixture() -> Fixture {
        let pool = memory_pool().await;
        let states = Arc::new(SqliteSyncStateRepository::new(pool.clone()));
        let outbox = Arc::new(SqliteOutboxRepository::new(pool.clone()));
        let remote = Arc::new(FakeRemoteStore::new());
        let settings = Arc::new(InMemorySettingsStore::new());
        let scheduler = Arc::new(FakeTaskScheduler::new());
        let handler = Arc::new(SyncActivationHandler::new());

        let now = Utc::now();
        let provider = FakeProvider::new("health_connect").with_records(vec![
            record_at("s1", now - chrono::Duration::days(1)),
            record_at("s2", now - chrono::Duration::days(2)),
        ]);
        let mut providers = ProviderRegistry::new();
        providers.register(Arc::new(provider));

        let mut registry = MetricRegistry::new();
        registry.register(MetricDefinition::new("steps").syncs(steps()).with_handler(handler.clone())).unwrap();
        registry.register(MetricDefinition::new("sleep").syncs(sleep()).with_handler(handler.clone())).unwrap();
        let registry = Arc::new(registry);

        let syncer = Arc::new(ChangeTokenSyncer::new(
            pool,
            states,
            outbox.clone(),
            BackoffPolicy::immediate(0),
            chrono::Duration::days(30),
            50,
        ));
        let pusher = Arc::new(OutboxPusher::new(
            outbox,
            remote.clone(),
            "user-1",
            "passive_metric_records",
            BackoffPolicy::immediate(0),
            500,
            3,
        ));
        let watchdog = Arc::new(WatchdogScheduler::new(
            scheduler.clone(),
            settings.clone(),
            Duration::from_secs(900),
        ));
        let service = Arc::new(SyncService::new(
            providers,
            registry,
            settings.clone(),
            syncer,
            pusher,
            scheduler.clone(),
            watchdog.clone(),
            chrono::Duration::minutes(5),
            Duration::from_secs(3600),
        ));
        handler.bind(&service);

        Fixture { service, handler, settings, scheduler, remote, watchdog }
    }

    async fn enable(f: &Fixture, metric: &str) {
        let mut setting = MetricSetting::disabled(metric);
        setting.enabled = true;
        f.settings.put(&setting).await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_metric_skips_job() {
        let f = fixture().await;
        let report = f.service.run_sync_job(&steps()).await;
        assert_eq!(report.status, SyncJobStatus::SkippedDisabled);
        assert!(f.remote.rows("passive_metric_records").is_empty());
    }

    #[tokio::test]
    async fn test_job_syncs_then_pushes() {
        let f = fixture().await;
        enable(&f, "steps").await;

        let report = f.service.run_sync_job(&steps()).await;
        match report.status {
            SyncJobStatus::Completed { outcome, push } => {
                assert_eq!(outcome, SyncOutcome::Backfilled { records_enqueued: 2, records_outside_window: 0 });
                assert_eq!(push.succeeded, 2);
            }
            other => panic!("unexpected status {:?}", other),
        }
        assert_eq!(f.remote.rows("passive_metric_records").len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_store_defers_push() {
        let f = fixture().await;
        enable(&f, "steps").await;
        f.remote.set_transport_down(true);

        let report = f.service.run_sync_job(&steps()).await;
        assert!(matches!(report.status, SyncJobStatus::PushDeferred { .. }));
    }

    #[tokio::test]
    async fn test_same_key_jobs_never_overlap() {
        let f = fixture().await;
        enable(&f, "steps").await;

        let (k1, k2) = (steps(), steps());
        let (first, second) = tokio::join!(f.service.run_sync_job(&k1), f.service.run_sync_job(&k2));
        let outcomes: Vec<_> = [first, second]
            .into_iter()
            .map(|r| match r.status {
                SyncJobStatus::Completed { outcome, .. } => outcome,
                other => panic!("unexpected status {:?}", other),
            })
            .collect();
        // Only one of the two may backfill; the other resumes from its token
        let backfills = outcomes.iter().filter(|o| matches!(o, SyncOutcome::Backfilled { .. })).count();
        assert_eq!(backfills, 1);
    }

    #[tokio::test]
    async fn test_push_wake_runs_every_enabled_key() {
        let f = fixture().await;
        enable(&f, "steps").await;
        enable(&f, "sleep").await;

        let reports = f.service.on_push_wake(Vec::new()).await.unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| matches!(r.status, SyncJobStatus::Completed { .. })));
    }

    #[tokio::test]
    async fn test_foreground_is_debounced() {
        let f = fixture().await;
        enable(&f, "steps").await;
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();

        let names = f.service.on_app_foreground_at(t0).await.unwrap();
        assert_eq!(names, vec![steps().one_shot_task_name()]);
        assert!(f.service.on_app_foreground_at(t0 + chrono::Duration::minutes(2)).await.unwrap().is_empty());
        assert_eq!(f.service.on_app_foreground_at(t0 + chrono::Duration::minutes(6)).await.unwrap().len(), 1);
        assert_eq!(f.scheduler.enqueue_count(&steps().one_shot_task_name()), 2);
    }

    #[tokio::test]
    async fn test_failed_foreground_does_not_start_debounce_window() {
        let f = fixture().await;
        enable(&f, "steps").await;
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();

        f.settings.set_failing(true);
        assert!(f.service.on_app_foreground_at(t0).await.is_err());

        f.settings.set_failing(false);
        let names = f.service.on_app_foreground_at(t0 + chrono::Duration::minutes(1)).await.unwrap();
        assert_eq!(names, vec![steps().one_shot_task_name()]);
    }

    #[tokio::test]
    async fn test_boot_arms_watchdog_and_enabled_keys() {
        let f = fixture().await;
        enable(&f, "sleep").await;

        let armed = f.service.on_boot(NoopTask::arc()).await.unwrap();
        assert_eq!(armed, vec![sleep().periodic_task_name()]);
        assert_eq!(f.scheduler.task_state(crate::domains::scheduler::WATCHDOG_TASK_NAME).await, TaskState::Enqueued);
        assert_eq!(f.scheduler.task_state(&steps().periodic_task_name()).await, TaskState::Absent);
        assert_eq!(f.watchdog.guarded_tasks("sleep").await, vec![sleep().periodic_task_name()]);
    }

    #[tokio::test]
    async fn test_activation_arms_and_deactivation_disarms() {
        let f = fixture().await;
        let registry = f.service.registry.clone();
        let definition = registry.get("steps").unwrap();
        enable(&f, "steps").await;

        f.handler.activate(definition, &MetricSetting::disabled("steps")).await.unwrap();
        assert_eq!(f.scheduler.task_state(&steps().periodic_task_name()).await, TaskState::Enqueued);
        assert_eq!(f.scheduler.enqueue_count(&steps().one_shot_task_name()), 1);
        assert_eq!(f.watchdog.guarded_tasks("steps").await.len(), 1);

        f.settings.put(&MetricSetting::disabled("steps")).await.unwrap();
        f.handler.deactivate(definition).await.unwrap();
        assert_eq!(f.scheduler.task_state(&steps().periodic_task_name()).await, TaskState::Absent);
        assert!(f.watchdog.guarded_tasks("steps").await.is_empty());
    }
}
