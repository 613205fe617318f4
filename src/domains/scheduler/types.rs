use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Scheduler-side state of a uniquely named task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Enqueued,
    Running,
    Absent,
}

/// What to do when a task with the same name already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistingTaskPolicy {
    Keep,
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Periodic { period: Duration },
    OneShot { delay: Duration },
}

/// Result of one task execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    /// Transient failure; one-shot tasks are retried with backoff.
    Retry,
    Failure,
}

/// Work executed by the scheduler
#[async_trait]
pub trait BackgroundTask: Send + Sync {
    async fn run(&self) -> TaskOutcome;
}

/// A uniquely named unit of background work
#[derive(Clone)]
pub struct TaskRequest {
    pub name: String,
    pub kind: TaskKind,
    pub task: Arc<dyn BackgroundTask>,
}

impl TaskRequest {
    pub fn periodic(name: &str, period: Duration, task: Arc<dyn BackgroundTask>) -> Self {
        Self { name: name.to_string(), kind: TaskKind::Periodic { period }, task }
    }

    pub fn one_shot(name: &str, delay: Duration, task: Arc<dyn BackgroundTask>) -> Self {
        Self { name: name.to_string(), kind: TaskKind::OneShot { delay }, task }
    }
}

impl fmt::Debug for TaskRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRequest")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Result of one watchdog pass, by task name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogReport {
    pub rearmed: Vec<String>,
    pub healthy: Vec<String>,
    pub skipped_disabled: Vec<String>,
    /// Metrics force-disabled by dependency reconciliation during this pass
    #[serde(default)]
    pub reconciled: Vec<String>,
}
