use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::config::MIN_PERIODIC_INTERVAL_MINUTES;
use crate::domains::scheduler::types::{
    BackgroundTask, ExistingTaskPolicy, TaskKind, TaskOutcome, TaskRequest, TaskState,
};
use crate::domains::sync::backoff::BackoffPolicy;
use crate::errors::{ServiceError, ServiceResult};

/// Platform task scheduler capability
#[async_trait]
pub trait TaskScheduler: Send + Sync {
    async fn task_state(&self, name: &str) -> TaskState;

    /// Enqueue a uniquely named task. Returns true when a new task was
    /// enqueued, false when `Keep` left an existing one in place.
    async fn ensure_scheduled(&self, request: TaskRequest, policy: ExistingTaskPolicy) -> ServiceResult<bool>;

    /// Cancel by name. Returns whether a live task was cancelled.
    async fn cancel(&self, name: &str) -> bool;
}

struct ScheduledTask {
    generation: u64,
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }
}

type TaskTable = Arc<Mutex<HashMap<String, ScheduledTask>>>;

/// TaskScheduler running tasks on the tokio runtime
pub struct TokioTaskScheduler {
    runtime: Handle,
    tasks: TaskTable,
    generation: AtomicU64,
    retry_policy: BackoffPolicy,
    min_period: Duration,
}

impl TokioTaskScheduler {
    /// Must be called from within a tokio runtime.
    pub fn new(retry_policy: BackoffPolicy) -> Self {
        Self::with_runtime(Handle::current(), retry_policy)
    }

    pub fn with_runtime(runtime: Handle, retry_policy: BackoffPolicy) -> Self {
        Self {
            runtime,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            retry_policy,
            min_period: Duration::from_secs(MIN_PERIODIC_INTERVAL_MINUTES * 60),
        }
    }

    fn lock(&self) -> ServiceResult<std::sync::MutexGuard<'_, HashMap<String, ScheduledTask>>> {
        self.tasks
            .lock()
            .map_err(|_| ServiceError::Scheduler("task table lock poisoned".to_string()))
    }

    async fn run_periodic(
        name: String,
        period: Duration,
        task: Arc<dyn BackgroundTask>,
        running: Arc<AtomicBool>,
    ) {
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            running.store(true, Ordering::SeqCst);
            let outcome = task.run().await;
            running.store(false, Ordering::SeqCst);
            if outcome != TaskOutcome::Success {
                warn!("Periodic task {} finished with {:?}; next run in {:?}", name, outcome, period);
            }
        }
    }

    async fn run_one_shot(
        name: String,
        delay: Duration,
        task: Arc<dyn BackgroundTask>,
        running: Arc<AtomicBool>,
        policy: BackoffPolicy,
    ) {
        if !delay.is_zero() {
            time::sleep(delay).await;
        }
        let mut attempt = 0u32;
        loop {
            running.store(true, Ordering::SeqCst);
            let outcome = task.run().await;
            running.store(false, Ordering::SeqCst);
            match outcome {
                TaskOutcome::Retry if attempt < policy.max_retries => {
                    let wait = policy.delay_for(attempt);
                    debug!("One-shot task {} asked for retry {} in {:?}", name, attempt + 1, wait);
                    time::sleep(wait).await;
                    attempt += 1;
                }
                TaskOutcome::Retry => {
                    warn!("One-shot task {} gave up after {} retries", name, attempt);
                    break;
                }
                TaskOutcome::Failure => {
                    error!("One-shot task {} failed", name);
                    break;
                }
                TaskOutcome::Success => break,
            }
        }
    }
}

fn forget_finished(tasks: &TaskTable, name: &str, generation: u64) {
    if let Ok(mut table) = tasks.lock() {
        if table.get(name).map_or(false, |t| t.generation == generation) {
            table.remove(name);
        }
    }
}

#[async_trait]
impl TaskScheduler for TokioTaskScheduler {
    async fn task_state(&self, name: &str) -> TaskState {
        let table = match self.tasks.lock() {
            Ok(table) => table,
            Err(_) => return TaskState::Absent,
        };
        match table.get(name) {
            Some(task) if task.is_alive() => {
                if task.running.load(Ordering::SeqCst) {
                    TaskState::Running
                } else {
                    TaskState::Enqueued
                }
            }
            _ => TaskState::Absent,
        }
    }

    async fn ensure_scheduled(&self, request: TaskRequest, policy: ExistingTaskPolicy) -> ServiceResult<bool> {
        if request.name.trim().is_empty() {
            return Err(ServiceError::Scheduler("task name must not be empty".to_string()));
        }

        let mut table = self.lock()?;
        if let Some(existing) = table.get(&request.name) {
            if existing.is_alive() {
                match policy {
                    ExistingTaskPolicy::Keep => return Ok(false),
                    ExistingTaskPolicy::Replace => {
                        debug!("Replacing scheduled task {}", request.name);
                        existing.handle.abort();
                    }
                }
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let running = Arc::new(AtomicBool::new(false));
        let name = request.name.clone();
        let handle = match request.kind {
            TaskKind::Periodic { period } => {
                let period = period.max(self.min_period);
                info!("Scheduling periodic task {} every {:?}", name, period);
                self.runtime.spawn(Self::run_periodic(name.clone(), period, request.task, running.clone()))
            }
            TaskKind::OneShot { delay } => {
                let tasks = self.tasks.clone();
                let policy = self.retry_policy.clone();
                let task_name = name.clone();
                let flag = running.clone();
                self.runtime.spawn(async move {
                    Self::run_one_shot(task_name.clone(), delay, request.task, flag, policy).await;
                    forget_finished(&tasks, &task_name, generation);
                })
            }
        };

        table.insert(name, ScheduledTask { generation, running, handle });
        Ok(true)
    }

    async fn cancel(&self, name: &str) -> bool {
        let removed = match self.tasks.lock() {
            Ok(mut table) => table.remove(name),
            Err(_) => None,
        };
        match removed {
            Some(task) => {
                let alive = task.is_alive();
                task.handle.abort();
                if alive {
                    info!("Cancelled task {}", name);
                }
                alive
            }
            None => false,
        }
    }
}
