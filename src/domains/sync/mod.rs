pub mod backoff;
pub mod pusher;
pub mod repository;
pub mod service;
pub mod syncer;
pub mod types;
pub mod utils;

pub use types::*;

pub use backoff::{retry_with_backoff, BackoffPolicy};
pub use pusher::OutboxPusher;
pub use repository::{OutboxRepository, SqliteOutboxRepository, SqliteSyncStateRepository, SyncStateRepository};
pub use service::{SyncActivationHandler, SyncService};
pub use syncer::ChangeTokenSyncer;
