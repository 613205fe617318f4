// Public modules
pub mod config;
pub mod domains;
pub mod engine;
pub mod errors;
pub mod ffi;
pub mod globals;

// Private modules
mod db_migration;

#[cfg(test)]
mod test_support;

pub use config::SyncEngineConfig;
pub use engine::{EngineParts, SyncEngine};

/// Initialize the library from the host's JSON configuration.
/// This function must be called before any other function in the library.
pub async fn initialize(config_json: &str) -> ffi::FFIResult<()> {
    globals::initialize(config_json).await
}

/// Get the running engine
pub fn get_engine() -> ffi::FFIResult<std::sync::Arc<SyncEngine>> {
    globals::get_engine()
}

/// Get a reference to the SQLite connection pool
/// This is primarily for internal use
pub fn get_db_pool() -> ffi::FFIResult<sqlx::SqlitePool> {
    globals::get_db_pool()
}
