pub mod metrics;
pub mod permission;
pub mod provider;
pub mod remote;
pub mod scheduler;
pub mod settings;
pub mod sync;

pub use metrics::{MetricToggleCoordinator, ToggleResult};
pub use sync::{SyncKey, SyncService};
