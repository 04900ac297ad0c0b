//! Engine log forwarding
//!
//! SQLite's error log (`SQLITE_CONFIG_LOG`) is process-wide, so the sink is
//! installed at most once per process. Each line is emitted as a `tracing`
//! event and handed to [`Host::log`] as `"(code) message"`.

use crate::error::{BridgeError, Result};
use crate::host::Host;
use libsqlite3_sys as ffi;
use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

static INSTALLED: AtomicBool = AtomicBool::new(false);

type LogCallback = unsafe extern "C" fn(*mut c_void, c_int, *const c_char);

/// Route SQLite's log stream to `host`.
///
/// Returns `Ok(false)` if a sink was already installed; the first one stays.
pub fn install(host: Arc<dyn Host>) -> Result<bool> {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(false);
    }

    // Owned by SQLite's global config for the rest of the process
    let sink = Box::into_raw(Box::new(host));
    let rc = unsafe {
        ffi::sqlite3_config(
            ffi::SQLITE_CONFIG_LOG,
            forward_log as LogCallback,
            sink as *mut c_void,
        )
    };

    if rc != ffi::SQLITE_OK {
        // SAFETY: SQLite rejected the pointer, so it is still ours.
        drop(unsafe { Box::from_raw(sink) });
        INSTALLED.store(false, Ordering::SeqCst);
        let message = unsafe { CStr::from_ptr(ffi::sqlite3_errstr(rc)) }
            .to_string_lossy()
            .into_owned();
        return Err(BridgeError::Engine { code: rc, message });
    }

    info!("engine log forwarding installed");
    Ok(true)
}

pub fn is_installed() -> bool {
    INSTALLED.load(Ordering::SeqCst)
}

unsafe extern "C" fn forward_log(p_arg: *mut c_void, code: c_int, msg: *const c_char) {
    if p_arg.is_null() {
        return;
    }
    let host = &*(p_arg as *const Arc<dyn Host>);
    let text = if msg.is_null() {
        String::new()
    } else {
        CStr::from_ptr(msg).to_string_lossy().into_owned()
    };
    debug!(target: "sqlite", code, "{}", text);

    let line = format!("({}) {}", code, text);
    let _ = panic::catch_unwind(AssertUnwindSafe(|| host.log(&line)));
}
