pub mod task_scheduler;
pub mod types;
pub mod watchdog;

pub use task_scheduler::{TaskScheduler, TokioTaskScheduler};
pub use types::{
    BackgroundTask, ExistingTaskPolicy, TaskKind, TaskOutcome, TaskRequest, TaskState, WatchdogReport,
};
pub use watchdog::{WatchdogScheduler, WATCHDOG_TASK_NAME};
