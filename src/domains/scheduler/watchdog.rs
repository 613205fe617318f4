use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::domains::scheduler::task_scheduler::TaskScheduler;
use crate::domains::scheduler::types::{
    BackgroundTask, ExistingTaskPolicy, TaskRequest, TaskState, WatchdogReport,
};
use crate::domains::settings::MetricSettingsStore;
use crate::errors::ServiceResult;

pub const WATCHDOG_TASK_NAME: &str = "metric-sync-watchdog";

/// A recurring task kept alive on behalf of one metric
#[derive(Debug, Clone)]
struct Guard {
    metric: String,
    request: TaskRequest,
}

/// Re-enqueues guarded tasks that the platform dropped while their metric
/// is still enabled.
pub struct WatchdogScheduler {
    scheduler: Arc<dyn TaskScheduler>,
    settings: Arc<dyn MetricSettingsStore>,
    guards: RwLock<BTreeMap<String, Guard>>,
    period: Duration,
}

impl WatchdogScheduler {
    pub fn new(
        scheduler: Arc<dyn TaskScheduler>,
        settings: Arc<dyn MetricSettingsStore>,
        period: Duration,
    ) -> Self {
        Self {
            scheduler,
            settings,
            guards: RwLock::new(BTreeMap::new()),
            period,
        }
    }

    /// Keep `request` scheduled for as long as `metric` stays enabled
    pub async fn guard(&self, metric: &str, request: TaskRequest) {
        debug!("Watchdog now guards {} for {}", request.name, metric);
        self.guards.write().await.insert(
            request.name.clone(),
            Guard { metric: metric.to_string(), request },
        );
    }

    /// Stop guarding every task of `metric`. Returns the task names released.
    pub async fn release_metric(&self, metric: &str) -> Vec<String> {
        let mut guards = self.guards.write().await;
        let names: Vec<String> = guards
            .iter()
            .filter(|(_, g)| g.metric == metric)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &names {
            guards.remove(name);
        }
        names
    }

    pub async fn guarded_tasks(&self, metric: &str) -> Vec<String> {
        self.guards
            .read()
            .await
            .iter()
            .filter(|(_, g)| g.metric == metric)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Enqueue a task unless one with the same name is already present
    pub async fn ensure_scheduled(&self, request: TaskRequest) -> ServiceResult<bool> {
        self.scheduler.ensure_scheduled(request, ExistingTaskPolicy::Keep).await
    }

    /// Schedule the watchdog itself. Safe to call on every boot.
    pub async fn arm(&self, tick_task: Arc<dyn BackgroundTask>) -> ServiceResult<bool> {
        let armed = self
            .ensure_scheduled(TaskRequest::periodic(WATCHDOG_TASK_NAME, self.period, tick_task))
            .await?;
        if armed {
            info!("Watchdog armed with period {:?}", self.period);
        }
        Ok(armed)
    }

    /// One verification pass over every guarded task
    pub async fn tick(&self) -> ServiceResult<WatchdogReport> {
        let settings = self.settings.get_all().await?;
        let guards: Vec<Guard> = self.guards.read().await.values().cloned().collect();
        let mut report = WatchdogReport::default();

        for guard in guards {
            let name = guard.request.name.clone();
            let enabled = settings.get(&guard.metric).map_or(false, |s| s.enabled);
            if !enabled {
                report.skipped_disabled.push(name);
                continue;
            }

            match self.scheduler.task_state(&name).await {
                TaskState::Absent => {
                    warn!("Task {} for enabled metric {} is missing; re-enqueueing", name, guard.metric);
                    self.ensure_scheduled(guard.request).await?;
                    report.rearmed.push(name);
                }
                TaskState::Enqueued | TaskState::Running => report.healthy.push(name),
            }
        }

        debug!(
            "Watchdog tick: {} healthy, {} rearmed, {} disabled",
            report.healthy.len(),
            report.rearmed.len(),
            report.skipped_disabled.len()
        );
        Ok(report)
    }
}
