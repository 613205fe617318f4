//! FFI bindings for metric toggles and permission callbacks.
//! Every function takes JSON (or a plain metric name) and returns JSON that
//! must be released with `free_string`.

use serde::Deserialize;
use std::os::raw::c_char;

use crate::domains::permission::Capability;
use crate::ffi::error::FFIError;
use crate::ffi::{block_on_async, c_str_arg, handle_json_result, json_arg};
use crate::globals;

#[derive(Deserialize)]
struct ToggleOnPayload {
    metric: String,
    #[serde(default)]
    preferred_source: Option<String>,
}

#[derive(Deserialize)]
struct ChangeSourcePayload {
    metric: String,
    #[serde(default)]
    source: Option<String>,
    current_enabled: bool,
}

#[derive(Deserialize)]
struct PermissionResultPayload {
    metric: String,
    granted: bool,
}

#[derive(Deserialize)]
struct PermissionStatusPayload {
    capability: String,
    granted: bool,
}

#[derive(Deserialize)]
struct TransitionsPayload {
    metric: String,
    #[serde(default = "default_transition_limit")]
    limit: u32,
}

fn default_transition_limit() -> u32 {
    50
}

/// Expected JSON payload: `{"metric": "steps", "preferred_source": "health_connect"}`
///
/// # Safety
/// `payload_json` must be a valid null-terminated UTF-8 string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn metric_toggle_on(payload_json: *const c_char) -> *mut c_char {
    handle_json_result(|| {
        let p: ToggleOnPayload = unsafe { json_arg(payload_json, "payload") }?;
        let engine = globals::get_engine()?;
        block_on_async(async move { Ok(engine.toggle_on(&p.metric, p.preferred_source).await) })
    })
}

/// # Safety
/// `metric` must be a valid null-terminated UTF-8 string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn metric_toggle_off(metric: *const c_char) -> *mut c_char {
    handle_json_result(|| {
        let metric = unsafe { c_str_arg(metric, "metric") }?;
        let engine = globals::get_engine()?;
        block_on_async(async move { Ok(engine.toggle_off(&metric).await) })
    })
}

/// Expected JSON payload: `{"metric": "steps", "source": "fitbit", "current_enabled": true}`
///
/// # Safety
/// `payload_json` must be a valid null-terminated UTF-8 string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn metric_change_source(payload_json: *const c_char) -> *mut c_char {
    handle_json_result(|| {
        let p: ChangeSourcePayload = unsafe { json_arg(payload_json, "payload") }?;
        let engine = globals::get_engine()?;
        block_on_async(async move { Ok(engine.change_source(&p.metric, p.source, p.current_enabled).await) })
    })
}

/// Outcome of the OS permission prompt raised after `NeedsPermission`.
/// Expected JSON payload: `{"metric": "gps", "granted": true}`
///
/// # Safety
/// `payload_json` must be a valid null-terminated UTF-8 string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn metric_permission_result(payload_json: *const c_char) -> *mut c_char {
    handle_json_result(|| {
        let p: PermissionResultPayload = unsafe { json_arg(payload_json, "payload") }?;
        let engine = globals::get_engine()?;
        block_on_async(async move { Ok(engine.on_permission_result(&p.metric, p.granted).await) })
    })
}

/// Current grant state of one capability as seen by the host.
/// Expected JSON payload: `{"capability": "health_data:steps", "granted": true}`
///
/// # Safety
/// `payload_json` must be a valid null-terminated UTF-8 string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn permission_set_status(payload_json: *const c_char) -> *mut c_char {
    handle_json_result(|| {
        let p: PermissionStatusPayload = unsafe { json_arg(payload_json, "payload") }?;
        let capability: Capability = p.capability.parse().map_err(FFIError::from)?;
        let engine = globals::get_engine()?;
        block_on_async(async move {
            engine.set_permission(capability, p.granted).await;
            Ok(true)
        })
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn metric_settings_snapshot() -> *mut c_char {
    handle_json_result(|| {
        let engine = globals::get_engine()?;
        block_on_async(async move { Ok(engine.settings_snapshot().await?) })
    })
}

/// # Safety
/// `metric` must be a valid null-terminated UTF-8 string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn metric_state(metric: *const c_char) -> *mut c_char {
    handle_json_result(|| {
        let metric = unsafe { c_str_arg(metric, "metric") }?;
        let engine = globals::get_engine()?;
        block_on_async(async move { Ok(engine.metric_state(&metric).await?) })
    })
}

/// Expected JSON payload: `{"metric": "steps", "limit": 20}`
///
/// # Safety
/// `payload_json` must be a valid null-terminated UTF-8 string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn metric_transitions(payload_json: *const c_char) -> *mut c_char {
    handle_json_result(|| {
        let p: TransitionsPayload = unsafe { json_arg(payload_json, "payload") }?;
        let engine = globals::get_engine()?;
        block_on_async(async move { Ok(engine.transitions(&p.metric, p.limit).await?) })
    })
}
