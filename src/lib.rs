//! # Health Sync Core
//!
//! Offline-first submission pipeline for health data collection clients. A host application
//! (typically a Flutter or other cross-platform data-entry app) hands completed form records to
//! this library, which delivers them to the collection endpoint when online, keeps them in a
//! durable LMDB-backed queue when not, and resyncs them when connectivity comes back. It also
//! bridges records into DHIS2, resolving free-text facility names to org unit identifiers.
//!
//! ## Features
//!
//! - **Offline-first queue**: records are never lost across offline periods or restarts
//! - **Ordered resync**: one delivery at a time, in insertion order, continuing past failures
//! - **Facility resolution**: case- and padding-insensitive matching against the DHIS2 registry
//! - **FFI-friendly**: JSON in, JSON out, over a C ABI
//! - **Safe error handling**: No `unwrap()` calls in production code
//!
//! ## Quick Start
//!
//! ```no_run
//! use health_sync_core::{create_collector, submit_record, connectivity_restored};
//! use std::ffi::CString;
//!
//! let config = CString::new(r#"{
//!     "storage_path": "collector",
//!     "submission_url": "https://script.example.org/exec",
//!     "dhis2": {"server_url": "https://dhis2.example.org", "username": "u",
//!               "password": "p", "data_set_id": "GlBr79yV3OB"}
//! }"#).unwrap();
//! let state = create_collector(config.as_ptr());
//!
//! let record = CString::new(r#"{"timestamp":"2025-03-01T10:00:00.000Z","formType":"general",
//!     "year":"2025","month":"March","region":"Southern","district":"Bo","chiefdom":"Kakua",
//!     "healthFacility":"Bo MCHP","fever_cases_gen":"4"}"#).unwrap();
//! let result = submit_record(state, record.as_ptr());
//!
//! // later, when the platform reports connectivity
//! let sync = connectivity_restored(state);
//! ```
//!
//! ## FFI Functions
//!
//! - [`create_collector`] - Build a collector from a JSON configuration
//! - [`submit_record`] - Submit one record (delivered or queued)
//! - [`flush_pending`] - Retry every queued record now
//! - [`connectivity_restored`] / [`connectivity_lost`] - Platform connectivity signals
//! - [`pending_count`] - Current queue length
//! - [`resolve_facility`] - Facility name to DHIS2 org unit id
//! - [`push_record_to_dhis2`] - Push one record to DHIS2
//! - [`submit_and_push_record`] - Submit one record, then push it to DHIS2
//! - [`test_dhis2_connection`] - DHIS2 connection check
//! - [`close_collector`] - Release the collector
//! - [`free_response`] - Release a string returned by any of the above

pub mod collector;
pub mod config;
pub mod data_value_set;
pub mod dhis2_client;
pub mod error;
pub mod facility_resolver;
pub mod queue_store;
pub mod record;
pub mod submission_queue;
pub mod submission_sink;
mod app_response;

use std::ffi::{CStr, CString};
use std::future::Future;
use std::os::raw::c_char;

use log::{info, warn};
use serde::Serialize;
use tokio::runtime::{Builder, Runtime};

pub use crate::app_response::AppResponse;
use crate::collector::Collector;
use crate::config::CoreConfig;
use crate::record::Record;

/// Collector plus the single-threaded runtime its async work is driven on.
pub struct CollectorState {
    runtime: Runtime,
    collector: Collector,
}

impl CollectorState {
    pub fn new(collector: Collector) -> std::io::Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        Ok(Self { runtime, collector })
    }

    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

/// Creates a collector from a JSON configuration.
///
/// Opens (or creates) the LMDB queue at `<storage_path>.lmdb`, rehydrates any submissions left
/// from a previous session and, if the configuration starts online, flushes them once.
///
/// # Parameters
///
/// * `config_json` - A null-terminated C string containing the [`CoreConfig`] JSON
///
/// # Returns
///
/// Returns a pointer to the [`CollectorState`] on success, or a null pointer on failure.
/// Release it with [`close_collector`].
///
/// # Errors
///
/// Returns null pointer if:
/// - Input pointer is null
/// - Input string contains invalid UTF-8
/// - The configuration is malformed or fails validation
/// - The storage directory cannot be opened
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn create_collector(config_json: *const c_char) -> *mut CollectorState {
    if config_json.is_null() {
        warn!("Null config pointer passed to create_collector");
        return std::ptr::null_mut();
    }

    let json = match unsafe { CStr::from_ptr(config_json).to_str() } {
        Ok(s) => s,
        Err(e) => {
            warn!("Invalid UTF-8 in config parameter: {e}");
            return std::ptr::null_mut();
        }
    };

    let config = match CoreConfig::from_json(json) {
        Ok(config) => config,
        Err(e) => {
            warn!("❌ Invalid collector configuration: {e}");
            return std::ptr::null_mut();
        }
    };

    let collector = match Collector::from_config(&config) {
        Ok(collector) => collector,
        Err(e) => {
            warn!("❌ Failed to initialize collector: {e}");
            warn!("Attempted storage path: {}.lmdb", config.storage_path);
            return std::ptr::null_mut();
        }
    };

    let state = match CollectorState::new(collector) {
        Ok(state) => state,
        Err(e) => {
            warn!("❌ Failed to start collector runtime: {e}");
            return std::ptr::null_mut();
        }
    };

    if let Some(report) = state.block_on(state.collector.startup_sync()) {
        info!(
            "Startup sync delivered {} of {} pending submission(s)",
            report.delivered, report.attempted
        );
    }

    info!("✅ Collector initialized successfully");
    Box::into_raw(Box::new(state))
}

/// Submits one record.
///
/// Online, the record is sent straight to the collection endpoint (behind any backlog, which is
/// flushed first); offline or on failure it is queued. A record missing a required field is
/// rejected with `ValidationError` and not queued.
///
/// # Returns
///
/// `Ok` carrying the [`SubmitOutcome`](crate::collector::SubmitOutcome) JSON, for example
/// `{"outcome":"queued","pending":3,"persistence":{"status":"persisted"}}`.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn submit_record(state: *mut CollectorState, json_ptr: *const c_char) -> *const c_char {
    let state = match state_ref(state, "submit_record") {
        Ok(state) => state,
        Err(err) => return err,
    };

    let json_str = match c_ptr_to_string(json_ptr, "JSON") {
        Ok(json) => json,
        Err(err) => return err,
    };

    let record = match Record::from_json(&json_str) {
        Ok(record) => record,
        Err(e) => {
            let error = AppResponse::SerializationError(format!("Invalid record JSON: {e}"));
            return response_to_c_string(&error);
        }
    };

    result_to_c_string(state.block_on(state.collector.submit(record)))
}

/// Attempts delivery of every queued record now.
///
/// Returns `Ok` carrying the [`FlushReport`](crate::submission_queue::FlushReport) JSON.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn flush_pending(state: *mut CollectorState) -> *const c_char {
    let state = match state_ref(state, "flush_pending") {
        Ok(state) => state,
        Err(err) => return err,
    };

    let report = state.block_on(state.collector.flush());
    response_to_c_string(&AppResponse::json(&report))
}

/// Platform "became online" signal.
///
/// Returns `Ok` carrying the flush report JSON, or `Ok("null")` when the collector already
/// considered itself online.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn connectivity_restored(state: *mut CollectorState) -> *const c_char {
    let state = match state_ref(state, "connectivity_restored") {
        Ok(state) => state,
        Err(err) => return err,
    };

    let report = state.block_on(state.collector.connectivity_restored());
    response_to_c_string(&AppResponse::json(&report))
}

/// Platform "became offline" signal.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn connectivity_lost(state: *mut CollectorState) -> *const c_char {
    let state = match state_ref(state, "connectivity_lost") {
        Ok(state) => state,
        Err(err) => return err,
    };

    state.collector.connectivity_lost();
    response_to_c_string(&AppResponse::success("Offline - data will be saved locally"))
}

/// Current number of queued records, as `Ok("<n>")`.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn pending_count(state: *mut CollectorState) -> *const c_char {
    let state = match state_ref(state, "pending_count") {
        Ok(state) => state,
        Err(err) => return err,
    };

    response_to_c_string(&AppResponse::success(state.collector.pending_count().to_string()))
}

/// Resolves a facility name to its DHIS2 org unit id.
///
/// Returns `Ok("<id>")`, or `NotFound` when the facility is not registered in DHIS2.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn resolve_facility(state: *mut CollectorState, name_ptr: *const c_char) -> *const c_char {
    let state = match state_ref(state, "resolve_facility") {
        Ok(state) => state,
        Err(err) => return err,
    };

    let name = match c_ptr_to_string(name_ptr, "name") {
        Ok(name) => name,
        Err(err) => return err,
    };

    match state.block_on(state.collector.resolve_facility(&name)) {
        Some(id) => response_to_c_string(&AppResponse::Ok(id)),
        None => {
            let not_found = AppResponse::NotFound(format!("Facility \"{name}\" not found in DHIS2"));
            response_to_c_string(&not_found)
        }
    }
}

/// Pushes one record to DHIS2.
///
/// Returns `Ok` carrying the [`Dhis2PushReport`](crate::collector::Dhis2PushReport) JSON,
/// `NotFound` for an unregistered facility, `ValidationError` when the record cannot be turned
/// into a payload, or `NetworkError`.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn push_record_to_dhis2(state: *mut CollectorState, json_ptr: *const c_char) -> *const c_char {
    let state = match state_ref(state, "push_record_to_dhis2") {
        Ok(state) => state,
        Err(err) => return err,
    };

    let json_str = match c_ptr_to_string(json_ptr, "JSON") {
        Ok(json) => json,
        Err(err) => return err,
    };

    let record = match Record::from_json(&json_str) {
        Ok(record) => record,
        Err(e) => {
            let error = AppResponse::SerializationError(format!("Invalid record JSON: {e}"));
            return response_to_c_string(&error);
        }
    };

    result_to_c_string(state.block_on(state.collector.push_to_dhis2(&record)))
}

/// Submits one record to the collection endpoint and then pushes it to DHIS2.
///
/// Returns `Ok` carrying the [`CombinedSubmitReport`](crate::collector::CombinedSubmitReport)
/// JSON. Its `success` flag is true only when both sides took the record; a failed push is
/// reported in `dhis2Error` rather than as an error response.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn submit_and_push_record(state: *mut CollectorState, json_ptr: *const c_char) -> *const c_char {
    let state = match state_ref(state, "submit_and_push_record") {
        Ok(state) => state,
        Err(err) => return err,
    };

    let json_str = match c_ptr_to_string(json_ptr, "JSON") {
        Ok(json) => json,
        Err(err) => return err,
    };

    let record = match Record::from_json(&json_str) {
        Ok(record) => record,
        Err(e) => {
            let error = AppResponse::SerializationError(format!("Invalid record JSON: {e}"));
            return response_to_c_string(&error);
        }
    };

    result_to_c_string(state.block_on(state.collector.submit_and_push(record)))
}

/// Checks the DHIS2 connection. Returns `Ok` carrying the server's system info JSON.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn test_dhis2_connection(state: *mut CollectorState) -> *const c_char {
    let state = match state_ref(state, "test_dhis2_connection") {
        Ok(state) => state,
        Err(err) => return err,
    };

    result_to_c_string(state.block_on(state.collector.test_connection()))
}

/// Releases a collector created by [`create_collector`].
///
/// Anything still queued stays in LMDB and is picked up by the next [`create_collector`] on the
/// same storage path. The pointer must not be used afterwards.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn close_collector(state: *mut CollectorState) -> *const c_char {
    if state.is_null() {
        let error = AppResponse::BadRequest("Null state pointer passed to close_collector".to_string());
        return response_to_c_string(&error);
    }

    let state = unsafe { Box::from_raw(state) };
    let pending = state.collector.pending_count();
    drop(state);

    info!("Collector closed with {pending} submission(s) pending");
    response_to_c_string(&AppResponse::success(format!(
        "Collector closed with {pending} pending submission(s)"
    )))
}

/// Releases a string returned by one of the functions above.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn free_response(ptr: *const c_char) {
    if ptr.is_null() {
        return;
    }
    unsafe {
        drop(CString::from_raw(ptr as *mut c_char));
    }
}

fn state_ref<'a>(state: *mut CollectorState, caller: &str) -> Result<&'a CollectorState, *const c_char> {
    match unsafe { state.as_ref() } {
        Some(state) => Ok(state),
        None => {
            let error = AppResponse::BadRequest(format!("Null state pointer passed to {caller}"));
            Err(response_to_c_string(&error))
        }
    }
}

fn result_to_c_string<T: Serialize>(result: error::Result<T>) -> *const c_char {
    match result {
        Ok(value) => response_to_c_string(&AppResponse::json(&value)),
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

/// Converts an [`AppResponse`] to a C-compatible string.
///
/// Returns a null pointer if serialization or C string creation fails. The caller owns the
/// returned string and releases it with [`free_response`].
fn response_to_c_string(response: &AppResponse) -> *const c_char {
    let json = match serde_json::to_string(response) {
        Ok(j) => j,
        Err(e) => {
            warn!("Error serializing response: {e}");
            return std::ptr::null();
        }
    };

    match CString::new(json) {
        Ok(c_str) => c_str.into_raw(),
        Err(e) => {
            warn!("Error creating CString: {e}");
            std::ptr::null()
        }
    }
}

/// Converts a C string pointer to a Rust String.
///
/// On a null pointer or invalid UTF-8 the error side carries a ready-made `BadRequest`
/// response naming `field_name`.
fn c_ptr_to_string(ptr: *const c_char, field_name: &str) -> Result<String, *const c_char> {
    if ptr.is_null() {
        let error = AppResponse::BadRequest(format!("Null {field_name} pointer"));
        return Err(response_to_c_string(&error));
    }

    match unsafe { CStr::from_ptr(ptr).to_str() } {
        Ok(s) => Ok(s.to_string()),
        Err(e) => {
            let error = AppResponse::BadRequest(format!("Invalid UTF-8 in {field_name}: {e}"));
            Err(response_to_c_string(&error))
        }
    }
}
