//! FFI bindings for the external sync triggers.

use serde::Deserialize;
use std::os::raw::c_char;

use crate::domains::sync::SyncKey;
use crate::ffi::error::FFIError;
use crate::ffi::{block_on_async, handle_json_result, json_arg};
use crate::globals;

#[derive(Deserialize)]
struct PushWakePayload {
    /// "provider:record_type" keys; empty means every enabled key
    #[serde(default)]
    keys: Vec<String>,
}

/// A server push asked for fresh data.
/// Expected JSON payload: `{"keys": ["health_connect:steps"]}`.
/// Returns the JSON list of `SyncRunReport`s.
///
/// # Safety
/// `payload_json` must be null or a valid null-terminated UTF-8 string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sync_on_push_wake(payload_json: *const c_char) -> *mut c_char {
    handle_json_result(|| {
        let p = if payload_json.is_null() {
            PushWakePayload { keys: Vec::new() }
        } else {
            unsafe { json_arg::<PushWakePayload>(payload_json, "payload") }?
        };
        let keys = p
            .keys
            .iter()
            .map(|k| k.parse::<SyncKey>().map_err(|e| FFIError::invalid_argument(&e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        let engine = globals::get_engine()?;
        block_on_async(async move { Ok(engine.on_push_wake(keys).await?) })
    })
}

/// The app came to the foreground. Returns the JSON list of enqueued task
/// names; empty when debounced.
#[unsafe(no_mangle)]
pub extern "C" fn sync_on_app_foreground() -> *mut c_char {
    handle_json_result(|| {
        let engine = globals::get_engine()?;
        block_on_async(async move { Ok(engine.on_app_foreground().await?) })
    })
}
