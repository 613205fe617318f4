pub mod repository;
pub mod types;

pub use repository::{MetricSettingsStore, RemoteMetricSettingsStore};
pub use types::{MetricSetting, MetricState};
