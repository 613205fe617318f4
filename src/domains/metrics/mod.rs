pub mod coordinator;
pub mod registry;
pub mod repository;
pub mod types;

pub use coordinator::MetricToggleCoordinator;
pub use registry::MetricRegistry;
pub use repository::{SqliteTransitionRepository, TransitionRepository};
pub use types::{
    ActivationHandler, MetricDefinition, MetricTransition, ToggleResult, TransitionCause,
};
