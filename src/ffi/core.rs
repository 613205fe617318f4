//! Library initialization, boot and memory management

use std::ffi::{c_char, CString};
use std::os::raw::c_int;

use crate::ffi::error::FFIError;
use crate::ffi::{block_on_async, c_str_arg, handle_json_result, handle_status_result};
use crate::globals;

/// Initialize the library from a JSON `SyncEngineConfig` document.
/// Returns 0 on success, non-zero on error.
///
/// # Safety
/// `config_json` must be a valid null-terminated UTF-8 string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn initialize_library(config_json: *const c_char) -> c_int {
    let result = std::panic::catch_unwind(|| {
        let config = unsafe { c_str_arg(config_json, "config_json") }?;
        block_on_async(async { globals::initialize(&config).await })
    });

    match result {
        Ok(ffi_result) => handle_status_result(|| ffi_result),
        Err(panic_payload) => {
            let panic_msg = if let Some(s) = panic_payload.downcast_ref::<String>() {
                s.clone()
            } else if let Some(s) = panic_payload.downcast_ref::<&str>() {
                s.to_string()
            } else {
                "Panicked during FFI call, but panic message is not a string".to_string()
            };
            log::error!("[FFI] Panic in initialize_library: {}", panic_msg);
            handle_status_result(|| Err(FFIError::internal(format!("Panic during initialization: {}", panic_msg))))
        }
    }
}

/// Device boot or app launch: re-arm the watchdog and every enabled
/// metric's periodic sync. Returns the JSON list of armed task names.
#[unsafe(no_mangle)]
pub extern "C" fn engine_on_boot() -> *mut c_char {
    handle_json_result(|| {
        let engine = globals::get_engine()?;
        block_on_async(async move { Ok(engine.on_boot().await?) })
    })
}

/// One watchdog pass. Returns the JSON `WatchdogReport`.
#[unsafe(no_mangle)]
pub extern "C" fn watchdog_tick() -> *mut c_char {
    handle_json_result(|| {
        let engine = globals::get_engine()?;
        block_on_async(async move { Ok(engine.watchdog_tick().await?) })
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn is_initialized() -> bool {
    globals::is_initialized()
}

/// Release a string returned by any function of this library.
///
/// # Safety
/// `ptr` must come from this library and must not be freed twice.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        unsafe {
            let _ = CString::from_raw(ptr);
        }
    }
}
