//! FFI bindings for Haven Core
//!
//! This module provides C-compatible functions for driving the safety engine
//! from the mobile shells. All functions use C strings (null-terminated) and
//! return allocated memory that must be freed by the caller using
//! `haven_free_string`.
//!
//! The engine handle owns a private tokio runtime; every call blocks on it,
//! so the shell can treat the whole surface as synchronous. Alert and journey
//! state is polled through the `_json` accessors.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;
use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;

use crate::engine::SafetyEngine;
use crate::error::CoreError;
use crate::gateway::NoopGateway;
use crate::location::HostLocationProvider;
use crate::types::{AlertId, Destination, GeoPoint, PositionFix, ResponseAction, UserId, UserProfile};

// Thread-local storage for the last error message
thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

/// Set the last error message
fn set_last_error(msg: &str) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

/// Clear the last error message
fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

/// Helper to convert C string to Rust string
unsafe fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

/// Helper to convert Rust string to C string (caller must free)
fn string_to_cstr(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cstr) => cstr.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

fn parse_json<T: DeserializeOwned>(json: &str) -> Result<T, CoreError> {
    Ok(serde_json::from_str(json)?)
}

fn parse_alert_id(value: &str) -> Result<AlertId, CoreError> {
    value
        .parse()
        .map_err(|e| CoreError::InvalidAlert(format!("bad alert id: {e}")))
}

fn parse_action(value: &str) -> Result<ResponseAction, CoreError> {
    Ok(serde_json::from_value(serde_json::Value::String(
        value.to_string(),
    ))?)
}

// ============================================================================
// Engine Lifecycle
// ============================================================================

/// Opaque handle to a running safety engine
pub struct HavenEngineHandle {
    runtime: tokio::runtime::Runtime,
    engine: SafetyEngine,
    location: HostLocationProvider,
}

/// Create a new safety engine for the given user.
///
/// `user_json` is a JSON object: `{"id": "...", "role": "seeker"|"responder",
/// "primary_contact": "..."}` with `primary_contact` optional.
///
/// # Safety
/// - `user_json` must be a valid null-terminated C string.
/// - Returns a pointer to a newly allocated engine handle.
/// - Must be freed with `haven_engine_free`.
/// - Returns NULL on error; call `haven_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn haven_engine_new(user_json: *const c_char) -> *mut HavenEngineHandle {
    clear_last_error();

    let user_str = match cstr_to_string(user_json) {
        Some(s) => s,
        None => {
            set_last_error("Invalid user JSON string pointer");
            return ptr::null_mut();
        }
    };

    let user: UserProfile = match parse_json(&user_str) {
        Ok(user) => user,
        Err(e) => {
            set_last_error(&e.to_string());
            return ptr::null_mut();
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            set_last_error(&format!("Failed to start runtime: {e}"));
            return ptr::null_mut();
        }
    };

    let location = HostLocationProvider::new();
    let engine = SafetyEngine::new(user, Arc::new(location.clone()), Arc::new(NoopGateway));

    let handle = Box::new(HavenEngineHandle {
        runtime,
        engine,
        location,
    });
    Box::into_raw(handle)
}

/// Free a safety engine, stopping any journey monitor and escalation chains.
///
/// # Safety
/// - `engine` must be a valid pointer returned by `haven_engine_new`.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn haven_engine_free(engine: *mut HavenEngineHandle) {
    if !engine.is_null() {
        let handle = Box::from_raw(engine);
        handle.runtime.block_on(handle.engine.shutdown());
        drop(handle);
    }
}

// ============================================================================
// Location Feed
// ============================================================================

/// Grant or revoke location permission (1 grants, 0 revokes).
///
/// # Safety
/// - `engine` must be a valid pointer returned by `haven_engine_new`.
/// - Returns 0 on success, non-zero on error.
#[no_mangle]
pub unsafe extern "C" fn haven_set_location_permission(
    engine: *mut HavenEngineHandle,
    granted: i32,
) -> i32 {
    clear_last_error();

    if engine.is_null() {
        set_last_error("Null engine pointer");
        return -1;
    }
    let handle = &*engine;

    handle
        .runtime
        .block_on(handle.location.set_permission(granted != 0));
    0
}

/// Feed a position fix from the platform location callback.
///
/// Pass a negative `speed_mps` when the platform did not report a speed.
///
/// # Safety
/// - `engine` must be a valid pointer returned by `haven_engine_new`.
/// - Returns 0 on success, non-zero on error.
#[no_mangle]
pub unsafe extern "C" fn haven_push_position(
    engine: *mut HavenEngineHandle,
    latitude: f64,
    longitude: f64,
    accuracy: f64,
    speed_mps: f64,
) -> i32 {
    clear_last_error();

    if engine.is_null() {
        set_last_error("Null engine pointer");
        return -1;
    }
    let handle = &*engine;

    let fix = PositionFix {
        latitude,
        longitude,
        accuracy,
        speed: (speed_mps >= 0.0).then_some(speed_mps),
        timestamp: Utc::now(),
    };
    handle.runtime.block_on(handle.location.push_fix(fix));
    0
}

// ============================================================================
// Alerts
// ============================================================================

/// Raise a distress alert at the current position and return it as JSON.
///
/// # Safety
/// - `engine` must be a valid pointer returned by `haven_engine_new`.
/// - Returns a newly allocated string that must be freed with `haven_free_string`.
/// - Returns NULL on error; call `haven_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn haven_trigger_alert(engine: *mut HavenEngineHandle) -> *mut c_char {
    clear_last_error();

    if engine.is_null() {
        set_last_error("Null engine pointer");
        return ptr::null_mut();
    }
    let handle = &*engine;

    let result = handle
        .runtime
        .block_on(handle.engine.trigger_alert())
        .and_then(|alert| Ok(serde_json::to_string(&alert)?));
    match result {
        Ok(json) => string_to_cstr(&json),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

/// Raise a distress alert at an explicit position and return it as JSON.
///
/// Used when the shell has a fix the engine has not seen yet, such as a
/// trigger from a home-screen widget with its own location snapshot.
///
/// # Safety
/// - `engine` must be a valid pointer returned by `haven_engine_new`.
/// - Returns a newly allocated string that must be freed with `haven_free_string`.
/// - Returns NULL on error; call `haven_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn haven_trigger_alert_at(
    engine: *mut HavenEngineHandle,
    latitude: f64,
    longitude: f64,
) -> *mut c_char {
    clear_last_error();

    if engine.is_null() {
        set_last_error("Null engine pointer");
        return ptr::null_mut();
    }
    let handle = &*engine;

    let result = handle
        .runtime
        .block_on(handle.engine.trigger_alert_at(GeoPoint::new(latitude, longitude)))
        .and_then(|alert| Ok(serde_json::to_string(&alert)?));
    match result {
        Ok(json) => string_to_cstr(&json),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

/// Record a responder action on an alert and return the ledger entry as JSON.
///
/// `action` is `"acknowledge"` or `"respond"`.
///
/// # Safety
/// - `engine` must be a valid pointer returned by `haven_engine_new`.
/// - `alert_id`, `responder_id`, and `action` must be valid null-terminated C strings.
/// - Returns a newly allocated string that must be freed with `haven_free_string`.
/// - Returns NULL on error; call `haven_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn haven_respond_to_alert(
    engine: *mut HavenEngineHandle,
    alert_id: *const c_char,
    responder_id: *const c_char,
    action: *const c_char,
) -> *mut c_char {
    clear_last_error();

    if engine.is_null() {
        set_last_error("Null engine pointer");
        return ptr::null_mut();
    }
    let handle = &*engine;

    let id_str = match cstr_to_string(alert_id) {
        Some(s) => s,
        None => {
            set_last_error("Invalid alert_id string pointer");
            return ptr::null_mut();
        }
    };
    let responder_str = match cstr_to_string(responder_id) {
        Some(s) => s,
        None => {
            set_last_error("Invalid responder_id string pointer");
            return ptr::null_mut();
        }
    };
    let action_str = match cstr_to_string(action) {
        Some(s) => s,
        None => {
            set_last_error("Invalid action string pointer");
            return ptr::null_mut();
        }
    };

    let result = parse_alert_id(&id_str)
        .and_then(|id| Ok((id, parse_action(&action_str)?)))
        .and_then(|(id, action)| {
            let entry = handle.runtime.block_on(handle.engine.respond_to_alert(
                id,
                UserId::new(responder_str),
                action,
            ))?;
            Ok(serde_json::to_string(&entry)?)
        });
    match result {
        Ok(json) => string_to_cstr(&json),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

/// Resolve (close) an alert.
///
/// # Safety
/// - `engine` must be a valid pointer returned by `haven_engine_new`.
/// - `alert_id` must be a valid null-terminated C string.
/// - Returns 0 on success, non-zero on error.
/// - On error, call `haven_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn haven_resolve_alert(
    engine: *mut HavenEngineHandle,
    alert_id: *const c_char,
) -> i32 {
    clear_last_error();

    if engine.is_null() {
        set_last_error("Null engine pointer");
        return -1;
    }
    let handle = &*engine;

    let id_str = match cstr_to_string(alert_id) {
        Some(s) => s,
        None => {
            set_last_error("Invalid alert_id string pointer");
            return -1;
        }
    };

    let result = parse_alert_id(&id_str)
        .and_then(|id| handle.runtime.block_on(handle.engine.resolve_alert(id)));
    match result {
        Ok(_) => 0,
        Err(e) => {
            set_last_error(&e.to_string());
            -1
        }
    }
}

/// Get all alerts as a JSON array, newest first.
///
/// # Safety
/// - `engine` must be a valid pointer returned by `haven_engine_new`.
/// - Returns a newly allocated string that must be freed with `haven_free_string`.
/// - Returns NULL on error; call `haven_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn haven_alerts_json(engine: *mut HavenEngineHandle) -> *mut c_char {
    clear_last_error();

    if engine.is_null() {
        set_last_error("Null engine pointer");
        return ptr::null_mut();
    }
    let handle = &*engine;

    let alerts = handle.runtime.block_on(handle.engine.alerts());
    match serde_json::to_string(&alerts) {
        Ok(json) => string_to_cstr(&json),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

// ============================================================================
// Journey Monitoring
// ============================================================================

/// Start monitoring a journey.
///
/// `destination_json` is a JSON object: `{"name": "...", "latitude": ...,
/// "longitude": ..., "mode": "walk"|"bike"|"car"|"public"}`.
///
/// # Safety
/// - `engine` must be a valid pointer returned by `haven_engine_new`.
/// - `destination_json` must be a valid null-terminated C string.
/// - Returns 0 on success, non-zero on error.
/// - On error, call `haven_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn haven_start_journey(
    engine: *mut HavenEngineHandle,
    destination_json: *const c_char,
) -> i32 {
    clear_last_error();

    if engine.is_null() {
        set_last_error("Null engine pointer");
        return -1;
    }
    let handle = &*engine;

    let destination_str = match cstr_to_string(destination_json) {
        Some(s) => s,
        None => {
            set_last_error("Invalid destination JSON string pointer");
            return -1;
        }
    };

    let result = parse_json::<Destination>(&destination_str).and_then(|destination| {
        handle
            .runtime
            .block_on(handle.engine.start_journey(destination))
    });
    match result {
        Ok(()) => 0,
        Err(e) => {
            set_last_error(&e.to_string());
            -1
        }
    }
}

/// Stop the active journey.
///
/// # Safety
/// - `engine` must be a valid pointer returned by `haven_engine_new`.
/// - Returns 0 on success, non-zero on error.
#[no_mangle]
pub unsafe extern "C" fn haven_stop_journey(engine: *mut HavenEngineHandle) -> i32 {
    clear_last_error();

    if engine.is_null() {
        set_last_error("Null engine pointer");
        return -1;
    }
    let handle = &*engine;

    match handle.runtime.block_on(handle.engine.stop_journey()) {
        Ok(()) => 0,
        Err(e) => {
            set_last_error(&e.to_string());
            -1
        }
    }
}

/// Manual movement signal for the active journey (1 moving, 0 forces an
/// inactivity evaluation).
///
/// # Safety
/// - `engine` must be a valid pointer returned by `haven_engine_new`.
/// - Returns 0 on success, non-zero on error.
#[no_mangle]
pub unsafe extern "C" fn haven_update_movement(
    engine: *mut HavenEngineHandle,
    has_movement: i32,
) -> i32 {
    clear_last_error();

    if engine.is_null() {
        set_last_error("Null engine pointer");
        return -1;
    }
    let handle = &*engine;

    match handle
        .runtime
        .block_on(handle.engine.update_movement(has_movement != 0))
    {
        Ok(()) => 0,
        Err(e) => {
            set_last_error(&e.to_string());
            -1
        }
    }
}

/// Get the journey status snapshot as JSON.
///
/// # Safety
/// - `engine` must be a valid pointer returned by `haven_engine_new`.
/// - Returns a newly allocated string that must be freed with `haven_free_string`.
/// - Returns NULL on error; call `haven_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn haven_journey_status_json(engine: *mut HavenEngineHandle) -> *mut c_char {
    clear_last_error();

    if engine.is_null() {
        set_last_error("Null engine pointer");
        return ptr::null_mut();
    }
    let handle = &*engine;

    let status = handle.runtime.block_on(handle.engine.journey_status());
    match serde_json::to_string(&status) {
        Ok(json) => string_to_cstr(&json),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

// ============================================================================
// Memory Management
// ============================================================================

/// Free a string returned by Haven functions.
///
/// # Safety
/// - `ptr` must be a valid pointer returned by a Haven function, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn haven_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

// ============================================================================
// Error Handling
// ============================================================================

/// Get the last error message.
///
/// # Safety
/// - Returns a pointer to a thread-local error string.
/// - The returned pointer is valid until the next Haven function call on this thread.
/// - Do NOT free the returned pointer.
/// - Returns NULL if no error occurred.
#[no_mangle]
pub unsafe extern "C" fn haven_last_error() -> *const c_char {
    LAST_ERROR.with(|e| match &*e.borrow() {
        Some(cstr) => cstr.as_ptr(),
        None => ptr::null(),
    })
}

// ============================================================================
// Version Information
// ============================================================================

/// Get the Haven Core library version.
///
/// # Safety
/// - Returns a pointer to a static string. Do NOT free.
#[no_mangle]
pub unsafe extern "C" fn haven_version() -> *const c_char {
    // Use a static CString to avoid allocation
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeker_json() -> CString {
        CString::new(r#"{"id": "seeker-1", "role": "seeker", "primary_contact": "+49 151 555 0100"}"#)
            .unwrap()
    }

    fn destination_json() -> CString {
        CString::new(r#"{"name": "Cafe Kotti", "latitude": 52.4990, "longitude": 13.4180, "mode": "walk"}"#)
            .unwrap()
    }

    unsafe fn take_string(ptr: *mut c_char) -> String {
        assert!(!ptr.is_null());
        let s = CStr::from_ptr(ptr).to_str().unwrap().to_string();
        haven_free_string(ptr);
        s
    }

    #[test]
    fn test_ffi_alert_lifecycle() {
        unsafe {
            let user = seeker_json();
            let engine = haven_engine_new(user.as_ptr());
            assert!(!engine.is_null());

            assert_eq!(haven_push_position(engine, 52.520008, 13.404954, 5.0, 1.2), 0);

            let alert_json = take_string(haven_trigger_alert(engine));
            assert!(alert_json.contains("\"active\""));
            assert!(alert_json.contains("Distress alert"));
            let alert: serde_json::Value = serde_json::from_str(&alert_json).unwrap();
            let id = CString::new(alert["id"].as_str().unwrap()).unwrap();

            let responder = CString::new("responder-7").unwrap();
            let action = CString::new("respond").unwrap();
            let entry_json = take_string(haven_respond_to_alert(
                engine,
                id.as_ptr(),
                responder.as_ptr(),
                action.as_ptr(),
            ));
            assert!(entry_json.contains("\"respond\""));

            assert_eq!(haven_resolve_alert(engine, id.as_ptr()), 0);

            let alerts_json = take_string(haven_alerts_json(engine));
            assert!(alerts_json.starts_with('['));
            assert!(alerts_json.contains("\"resolved\""));

            haven_engine_free(engine);
        }
    }

    #[test]
    fn test_ffi_trigger_at_explicit_position() {
        unsafe {
            let user = seeker_json();
            let engine = haven_engine_new(user.as_ptr());
            assert!(!engine.is_null());

            // No position was ever pushed; the explicit variant still works
            let alert_json = take_string(haven_trigger_alert_at(engine, 48.8566, 2.3522));
            assert!(alert_json.contains("48.8566"));

            haven_engine_free(engine);
        }
    }

    #[test]
    fn test_ffi_journey_flow() {
        unsafe {
            let user = seeker_json();
            let engine = haven_engine_new(user.as_ptr());
            assert!(!engine.is_null());

            let destination = destination_json();
            assert_eq!(haven_start_journey(engine, destination.as_ptr()), 0);

            let status = take_string(haven_journey_status_json(engine));
            assert!(status.contains("\"moving\""));
            assert!(status.contains("Cafe Kotti"));

            assert_eq!(haven_update_movement(engine, 1), 0);
            assert_eq!(haven_stop_journey(engine), 0);

            // No journey left to stop
            assert_eq!(haven_stop_journey(engine), -1);
            let error = CStr::from_ptr(haven_last_error()).to_str().unwrap();
            assert!(!error.is_empty());

            haven_engine_free(engine);
        }
    }

    #[test]
    fn test_ffi_error_handling() {
        unsafe {
            // Malformed user JSON
            let bad_user = CString::new("not json").unwrap();
            let engine = haven_engine_new(bad_user.as_ptr());
            assert!(engine.is_null());
            let error = CStr::from_ptr(haven_last_error()).to_str().unwrap();
            assert!(!error.is_empty());

            let user = seeker_json();
            let engine = haven_engine_new(user.as_ptr());
            assert!(!engine.is_null());

            // Triggering with no position available fails cleanly
            let result = haven_trigger_alert(engine);
            assert!(result.is_null());
            let error = CStr::from_ptr(haven_last_error()).to_str().unwrap();
            assert!(error.contains("Location unavailable"));

            // Unknown alert id
            let missing = CString::new("00000000-0000-4000-8000-000000000000").unwrap();
            assert_eq!(haven_resolve_alert(engine, missing.as_ptr()), -1);

            // Garbage alert id and unknown action
            let garbage = CString::new("not-a-uuid").unwrap();
            let responder = CString::new("responder-7").unwrap();
            let action = CString::new("wave").unwrap();
            assert!(haven_respond_to_alert(
                engine,
                garbage.as_ptr(),
                responder.as_ptr(),
                action.as_ptr(),
            )
            .is_null());

            haven_engine_free(engine);
        }
    }

    #[test]
    fn test_ffi_null_pointers_are_rejected() {
        unsafe {
            assert!(haven_engine_new(ptr::null()).is_null());
            assert!(haven_trigger_alert(ptr::null_mut()).is_null());
            assert!(haven_alerts_json(ptr::null_mut()).is_null());
            assert_eq!(haven_set_location_permission(ptr::null_mut(), 1), -1);
            assert_eq!(haven_push_position(ptr::null_mut(), 0.0, 0.0, 0.0, -1.0), -1);
            assert_eq!(haven_start_journey(ptr::null_mut(), ptr::null()), -1);

            // Freeing NULL is a no-op
            haven_free_string(ptr::null_mut());
            haven_engine_free(ptr::null_mut());
        }
    }

    #[test]
    fn test_ffi_permission_revocation() {
        unsafe {
            let user = seeker_json();
            let engine = haven_engine_new(user.as_ptr());
            assert!(!engine.is_null());

            assert_eq!(haven_push_position(engine, 52.52, 13.405, 5.0, -1.0), 0);
            assert_eq!(haven_set_location_permission(engine, 0), 0);

            let result = haven_trigger_alert(engine);
            assert!(result.is_null());
            let error = CStr::from_ptr(haven_last_error()).to_str().unwrap();
            assert!(error.contains("permission"));

            haven_engine_free(engine);
        }
    }

    #[test]
    fn test_ffi_version() {
        unsafe {
            let version = haven_version();
            assert!(!version.is_null());

            let version_str = CStr::from_ptr(version).to_str().unwrap();
            assert!(!version_str.is_empty());
        }
    }
}
