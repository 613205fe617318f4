//! C ABI surface. Arguments and results cross as JSON strings.

use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use tokio::runtime::Runtime;

use crate::ffi::error::{ErrorCode, FFIError};

pub mod core;
pub mod error;
pub mod metrics;
pub mod sync;

pub use error::FFIResult;

/// Runtime shared by every FFI call. Background sync tasks are spawned on it
/// and keep running between calls.
static RUNTIME: Lazy<Option<Runtime>> = Lazy::new(|| match Runtime::new() {
    Ok(runtime) => Some(runtime),
    Err(e) => {
        eprintln!("[Rust FFI Error] Failed to create tokio runtime: {}", e);
        None
    }
});

/// Run an async FFI operation to completion on the shared runtime.
pub fn block_on_async<F, T>(future: F) -> FFIResult<T>
where
    F: std::future::Future<Output = FFIResult<T>>,
{
    match RUNTIME.as_ref() {
        Some(runtime) => runtime.block_on(future),
        None => Err(FFIError::internal("Tokio runtime unavailable".to_string())),
    }
}

/// Error handling helper for FFI boundaries (returns error code)
pub fn handle_status_result<F>(func: F) -> c_int
where
    F: FnOnce() -> FFIResult<()>,
{
    match func() {
        Ok(_) => ErrorCode::Success as c_int,
        Err(e) => {
            log::error!("[FFI] {}: {} ({:?})", e.code, e.message, e.details);
            e.code as c_int
        }
    }
}

/// Handles results for FFI functions that return data, serializing Ok(T) or Err(FFIError) to JSON.
/// Returns a pointer to a C string that must be released with `free_string`.
pub fn handle_json_result<F, T>(func: F) -> *mut c_char
where
    F: FnOnce() -> FFIResult<T>,
    T: Serialize,
{
    let json_string = match func() {
        Ok(value) => serde_json::to_string(&value),
        Err(ffi_error) => serde_json::to_string(&ffi_error),
    };

    let final_json = match json_string {
        Ok(s) => s,
        Err(e) => {
            // The caller must always receive parseable JSON
            log::error!("[FFI] Serialization failed: {}", e);
            format!(
                "{{\"code\":\"{:?}\",\"message\":\"Failed to serialize result\",\"details\":null}}",
                ErrorCode::InternalError
            )
        }
    };

    match CString::new(final_json) {
        Ok(c_string) => c_string.into_raw(),
        Err(e) => {
            log::error!("[FFI] Failed to create CString: {}", e);
            let error_json = format!(
                "{{\"code\":\"{:?}\",\"message\":\"Result contained a null byte\",\"details\":null}}",
                ErrorCode::InternalError
            );
            CString::new(error_json).map_or(std::ptr::null_mut(), |cs| cs.into_raw())
        }
    }
}

/// Copy a C string argument into an owned String.
///
/// # Safety
/// `ptr` must be null or point to a valid null-terminated string.
pub unsafe fn c_str_arg(ptr: *const c_char, name: &str) -> FFIResult<String> {
    if ptr.is_null() {
        return Err(FFIError::new(ErrorCode::NullPointer, &format!("{} is null", name)));
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map(str::to_string)
        .map_err(|_| FFIError::new(ErrorCode::InvalidUtf8, &format!("{} is not valid UTF-8", name)))
}

/// Decode a JSON payload argument.
///
/// # Safety
/// Same contract as [`c_str_arg`].
pub unsafe fn json_arg<T: DeserializeOwned>(ptr: *const c_char, name: &str) -> FFIResult<T> {
    let raw = unsafe { c_str_arg(ptr, name) }?;
    serde_json::from_str(&raw).map_err(|e| FFIError::invalid_argument(&format!("Invalid {} JSON: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_result_serializes_errors() {
        let ptr = handle_json_result::<_, ()>(|| Err(FFIError::invalid_argument("bad payload")));
        let json = unsafe { CString::from_raw(ptr) }.into_string().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["code"], "InvalidArgument");
        assert_eq!(value["message"], "bad payload");
    }

    #[test]
    fn test_null_argument_is_rejected() {
        let err = unsafe { c_str_arg(std::ptr::null(), "metric") }.unwrap_err();
        assert_eq!(err.code, ErrorCode::NullPointer);
        assert_eq!(handle_status_result(|| Err(err)), ErrorCode::NullPointer as c_int);
    }

    #[test]
    fn test_json_arg_reports_malformed_payload() {
        let raw = CString::new("{ nope").unwrap();
        let err = unsafe { json_arg::<serde_json::Value>(raw.as_ptr(), "payload") }.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgument);
    }
}
