//! Ad-hoc execution with host row delivery
//!
//! Runs SQL through `sqlite3_exec` and hands every result row to
//! [`Host::exec_callback`] together with the caller's [`ExecutionId`].

use crate::error::{BridgeError, Result};
use crate::host::{ExecutionId, Host};
use libsqlite3_sys as ffi;
use rusqlite::Connection;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use tracing::{debug, error, trace};

/// One result row as delivered by the engine
///
/// Values are the engine's text rendering; SQL NULL is `None`.
pub struct Row<'a> {
    values: &'a [*mut c_char],
    names: &'a [*mut c_char],
}

impl<'a> Row<'a> {
    pub fn column_count(&self) -> usize {
        self.values.len()
    }

    pub fn value(&self, index: usize) -> Option<&'a CStr> {
        let ptr = *self.values.get(index)?;
        // SAFETY: the engine keeps column strings alive for the callback.
        (!ptr.is_null()).then(|| unsafe { CStr::from_ptr(ptr) })
    }

    pub fn name(&self, index: usize) -> Option<&'a CStr> {
        let ptr = *self.names.get(index)?;
        (!ptr.is_null()).then(|| unsafe { CStr::from_ptr(ptr) })
    }

    /// `(name, value)` pairs converted to owned strings.
    pub fn to_pairs(&self) -> Vec<(String, Option<String>)> {
        (0..self.column_count())
            .map(|i| {
                let name = self
                    .name(i)
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let value = self.value(i).map(|v| v.to_string_lossy().into_owned());
                (name, value)
            })
            .collect()
    }
}

/// Correlates one execution with its row consumer; lives on the stack of
/// [`execute_raw`].
struct ExecutionContext<'h> {
    id: ExecutionId,
    host: &'h dyn Host,
}

unsafe extern "C" fn exec_row(
    p_arg: *mut c_void,
    n_cols: c_int,
    az_cols: *mut *mut c_char,
    az_col_names: *mut *mut c_char,
) -> c_int {
    let ctx = &*(p_arg as *const ExecutionContext<'_>);
    let count = n_cols.max(0) as usize;
    let values: &[*mut c_char] = if az_cols.is_null() {
        &[]
    } else {
        std::slice::from_raw_parts(az_cols, count)
    };
    let names: &[*mut c_char] = if az_col_names.is_null() {
        &[]
    } else {
        std::slice::from_raw_parts(az_col_names, count)
    };
    let row = Row { values, names };
    trace!(execution = ctx.id.0, columns = count, "row");

    panic::catch_unwind(AssertUnwindSafe(|| ctx.host.exec_callback(ctx.id, &row))).unwrap_or_else(
        |_| {
            error!(execution = ctx.id.0, "host panicked in row callback");
            1
        },
    )
}

/// Execute `sql` on `db`, delivering rows to `host`.
///
/// On failure `errmsg` (if non-null) receives a message allocated by SQLite;
/// the caller must release it with `sqlite3_free`.
///
/// # Safety
/// `db` must be an open connection and `errmsg` null or writable.
pub unsafe fn execute_raw(
    db: *mut ffi::sqlite3,
    sql: &CStr,
    host: &dyn Host,
    id: ExecutionId,
    errmsg: *mut *mut c_char,
) -> c_int {
    let ctx = ExecutionContext { id, host };
    ffi::sqlite3_exec(
        db,
        sql.as_ptr(),
        Some(exec_row),
        &ctx as *const ExecutionContext<'_> as *mut c_void,
        errmsg,
    )
}

/// Execute `sql` on `conn`, delivering rows to `host`.
///
/// An engine failure (including a row callback asking to abort, reported as
/// `SQLITE_ABORT`) comes back as [`BridgeError::Engine`] with the engine's
/// message.
pub fn execute(conn: &Connection, host: &dyn Host, sql: &str, id: ExecutionId) -> Result<()> {
    let sql = CString::new(sql).map_err(|_| BridgeError::misuse("SQL text contains NUL"))?;
    let mut errmsg: *mut c_char = ptr::null_mut();

    // SAFETY: the handle is valid for the borrow of `conn`.
    let rc = unsafe { execute_raw(conn.handle(), &sql, host, id, &mut errmsg) };
    let message = unsafe { take_engine_message(errmsg) };

    if rc == ffi::SQLITE_OK {
        return Ok(());
    }
    let message = message.unwrap_or_else(|| unsafe {
        CStr::from_ptr(ffi::sqlite3_errstr(rc))
            .to_string_lossy()
            .into_owned()
    });
    debug!(execution = id.0, code = rc, %message, "execution failed");
    Err(BridgeError::Engine { code: rc, message })
}

/// Copy and free a message allocated by SQLite.
unsafe fn take_engine_message(msg: *mut c_char) -> Option<String> {
    if msg.is_null() {
        return None;
    }
    let text = CStr::from_ptr(msg).to_string_lossy().into_owned();
    ffi::sqlite3_free(msg as *mut c_void);
    Some(text)
}
