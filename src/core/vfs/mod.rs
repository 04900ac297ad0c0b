//! SQLite VFS adapter
//!
//! Registers a `sqlite3_vfs` whose every method forwards to a [`Host`]:
//!
//! - VFS-level calls (delete, access, full pathname, randomness, sleep,
//!   clock, last error) are keyed by the instance's [`VfsId`]
//! - file-level calls are keyed by the host file identifier bound at open
//!   time in the instance's [`FileTable`]
//! - dynamic library loading is stubbed out
//!
//! The adapter keeps no caches. Host status codes pass through unchanged
//! except where a success status comes with an unusable output, which is
//! escalated to `SQLITE_MISUSE`.
//!
//! [`Host`]: crate::host::Host
//! [`VfsId`]: crate::host::VfsId
//! [`FileTable`]: crate::handle::FileTable

mod file;
#[allow(clippy::module_inception)]
mod vfs;

#[cfg(test)]
mod tests;

pub use file::{io_methods, HostFile};
pub use vfs::DLERROR_MESSAGE;
pub(crate) use vfs::{method_table, HostVfs};

use crate::error::Result;
use libsqlite3_sys as ffi;
use std::os::raw::c_int;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, error, warn};

/// Default `mxPathname` for registered instances
pub const DEFAULT_MAX_PATHNAME: c_int = 256;

/// Run `f`, turning a panic into `fallback` so it never unwinds into SQLite.
pub(crate) fn trap<T>(op: &'static str, fallback: T, f: impl FnOnce() -> T) -> T {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(_) => {
            error!(op, "host panicked during VFS call");
            fallback
        }
    }
}

/// Run a forwarding closure and produce the status handed to SQLite.
pub(crate) fn status(op: &'static str, f: impl FnOnce() -> Result<()>) -> c_int {
    trap(op, ffi::SQLITE_INTERNAL, || match f() {
        Ok(()) => ffi::SQLITE_OK,
        Err(e) => {
            if e.is_misuse() {
                warn!(op, error = %e, "protocol violation");
            } else {
                debug!(op, code = e.code(), "host reported failure");
            }
            e.code()
        }
    })
}

/// View an engine-owned buffer. Null or non-positive lengths give an empty slice.
pub(crate) unsafe fn buffer_mut<'a>(ptr: *mut u8, len: c_int) -> &'a mut [u8] {
    if ptr.is_null() || len <= 0 {
        &mut []
    } else {
        std::slice::from_raw_parts_mut(ptr, len as usize)
    }
}

pub(crate) unsafe fn buffer<'a>(ptr: *const u8, len: c_int) -> &'a [u8] {
    if ptr.is_null() || len <= 0 {
        &[]
    } else {
        std::slice::from_raw_parts(ptr, len as usize)
    }
}
