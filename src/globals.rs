use lazy_static::lazy_static;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::SyncEngineConfig;
use crate::db_migration::run_migrations;
use crate::engine::{EngineParts, SyncEngine};
use crate::ffi::error::{FFIError, FFIResult};

// Global state definitions
lazy_static! {
    static ref INIT_MUTEX: tokio::sync::Mutex<()> = tokio::sync::Mutex::new(());
    static ref INITIALIZED: AtomicBool = AtomicBool::new(false);

    static ref DB_POOL: Mutex<Option<SqlitePool>> = Mutex::new(None);
    static ref ENGINE: Mutex<Option<Arc<SyncEngine>>> = Mutex::new(None);
}

pub fn get_db_pool() -> FFIResult<SqlitePool> {
    DB_POOL
        .lock()
        .map_err(|_| FFIError::internal("DB_POOL lock poisoned".to_string()))?
        .clone()
        .ok_or_else(|| FFIError::internal("Database pool not initialized".to_string()))
}

pub fn get_engine() -> FFIResult<Arc<SyncEngine>> {
    ENGINE
        .lock()
        .map_err(|_| FFIError::internal("ENGINE lock poisoned".to_string()))?
        .clone()
        .ok_or_else(|| FFIError::internal("Sync engine not initialized".to_string()))
}

pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

/// Initialize the engine from the host's JSON configuration. Repeated calls
/// after a successful initialisation are no-ops.
pub async fn initialize(config_json: &str) -> FFIResult<()> {
    let _guard = INIT_MUTEX.lock().await;

    if INITIALIZED.load(Ordering::Acquire) {
        return Ok(());
    }

    let result = initialize_internal(config_json).await;

    if result.is_ok() {
        INITIALIZED.store(true, Ordering::Release);
    }

    result
}

async fn initialize_internal(config_json: &str) -> FFIResult<()> {
    if std::env::var("RUST_LOG").is_err() {
        #[cfg(debug_assertions)]
        std::env::set_var("RUST_LOG", "debug");
        #[cfg(not(debug_assertions))]
        std::env::set_var("RUST_LOG", "info");
    }
    let _ = env_logger::try_init();

    let config = SyncEngineConfig::from_json(config_json)?;
    log::info!("Starting sync engine initialization for user {}", config.user_id);
    log::debug!("Database URL: {}", config.db_url);

    let options = SqliteConnectOptions::from_str(&config.db_url)
        .map_err(|e| FFIError::invalid_argument(&format!("Invalid db_url: {}", e)))?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(|e| {
            log::error!("Database connection failed: {}", e);
            FFIError::internal(format!("Database connection failed: {}", e))
        })?;

    run_migrations(&pool).await?;
    log::debug!("Migrations applied");

    *DB_POOL
        .lock()
        .map_err(|_| FFIError::internal("DB_POOL lock poisoned".to_string()))? = Some(pool.clone());

    let parts = EngineParts::from_config(&config);
    let engine = SyncEngine::assemble(&config, pool, parts)?;

    *ENGINE
        .lock()
        .map_err(|_| FFIError::internal("ENGINE lock poisoned".to_string()))? = Some(engine);

    log::info!("Sync engine initialized");
    Ok(())
}
