//! The host boundary
//!
//! [`Host`] is the import table the adapters call into. Every method mirrors
//! one flat import: integers, byte buffers and C strings in, an integer
//! status out, with outputs written through `&mut` parameters. An isolated
//! embedder (a WebAssembly runtime, a sandboxed process) implements it as a
//! thin shim over its own call table.
//!
//! Status codes are SQLite's. The adapters validate them but never reinterpret
//! them, see [`crate::error::BridgeError::check`].

pub mod memory;

use crate::exec::Row;
use crate::function::Invocation;
use crate::handle::HandleKey;
use libsqlite3_sys as ffi;
use std::ffi::CStr;
use std::fmt;
use std::os::raw::{c_int, c_void};

pub use crate::handle::HostFileId;
pub use memory::{HostCall, MemoryHost, OpenReply};

/// Opaque identifier of a registered VFS instance, as seen by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VfsId(HandleKey);

impl VfsId {
    pub(crate) fn new(key: HandleKey) -> Self {
        VfsId(key)
    }

    pub(crate) fn key(self) -> HandleKey {
        self.0
    }
}

impl fmt::Display for VfsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vfs#{}", self.0)
    }
}

/// Host-allocated identifier of a user-defined function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub i32);

/// Host-allocated identifier correlating one `execute` call with its row consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutionId(pub i32);

/// Host side of the bridge
///
/// Implementations must be callable from whichever thread SQLite runs on and
/// must return in bounded time. They must not call back into the connection
/// that is currently invoking them.
pub trait Host: Send + Sync {
    // Process lifecycle

    fn os_init(&self) -> c_int {
        ffi::SQLITE_OK
    }

    fn os_end(&self) -> c_int {
        ffi::SQLITE_OK
    }

    /// Text-logging sink
    fn log(&self, message: &str) {
        let _ = message;
    }

    // VFS-level primitives

    /// Open `name` (`None` for an engine temp file).
    ///
    /// Must store a non-zero identifier in `file_id` on success. `out_flags`
    /// starts out equal to `flags`.
    fn vfs_open(
        &self,
        vfs: VfsId,
        name: Option<&CStr>,
        flags: c_int,
        file_id: &mut u32,
        out_flags: &mut c_int,
    ) -> c_int;

    fn vfs_delete(&self, vfs: VfsId, name: &CStr, sync_dir: bool) -> c_int;

    fn vfs_access(&self, vfs: VfsId, name: &CStr, flags: c_int, res_out: &mut c_int) -> c_int;

    /// Write the NUL-terminated canonical path into `out`.
    fn vfs_full_pathname(&self, vfs: VfsId, name: &CStr, out: &mut [u8]) -> c_int;

    fn vfs_randomness(&self, vfs: VfsId, out: &mut [u8]) -> c_int;

    fn vfs_sleep(&self, vfs: VfsId, microseconds: c_int) -> c_int;

    /// Current time as a Julian day number.
    fn vfs_current_time(&self, vfs: VfsId, time_out: &mut f64) -> c_int;

    fn vfs_get_last_error(&self, vfs: VfsId, out: &mut [u8]) -> c_int;

    // File-level primitives

    fn io_close(&self, vfs: VfsId, file: HostFileId) -> c_int;

    /// Fill `buf` from `offset`. `buf` is zeroed before the call, so on
    /// `SQLITE_IOERR_SHORT_READ` the host only writes the bytes it has.
    fn io_read(&self, vfs: VfsId, file: HostFileId, buf: &mut [u8], offset: i64) -> c_int;

    fn io_write(&self, vfs: VfsId, file: HostFileId, buf: &[u8], offset: i64) -> c_int;

    fn io_truncate(&self, vfs: VfsId, file: HostFileId, size: i64) -> c_int;

    fn io_sync(&self, vfs: VfsId, file: HostFileId, flags: c_int) -> c_int;

    fn io_file_size(&self, vfs: VfsId, file: HostFileId, size_out: &mut i64) -> c_int;

    fn io_lock(&self, vfs: VfsId, file: HostFileId, level: c_int) -> c_int;

    fn io_unlock(&self, vfs: VfsId, file: HostFileId, level: c_int) -> c_int;

    fn io_check_reserved_lock(&self, vfs: VfsId, file: HostFileId, res_out: &mut c_int) -> c_int;

    /// `arg` is the engine's untyped argument for `op`.
    fn io_file_control(&self, vfs: VfsId, file: HostFileId, op: c_int, arg: *mut c_void)
        -> c_int;

    fn io_sector_size(&self, vfs: VfsId, file: HostFileId) -> c_int;

    fn io_device_characteristics(&self, vfs: VfsId, file: HostFileId) -> c_int;

    // User-defined functions

    fn function_func(&self, id: FunctionId, call: &mut Invocation<'_>) {
        call.set_error(&format!("no scalar body for function {}", id.0));
    }

    fn function_step(&self, id: FunctionId, call: &mut Invocation<'_>) {
        call.set_error(&format!("no step body for function {}", id.0));
    }

    fn function_final(&self, id: FunctionId, call: &mut Invocation<'_>) {
        call.set_error(&format!("no final body for function {}", id.0));
    }

    fn function_value(&self, id: FunctionId, call: &mut Invocation<'_>) {
        call.set_error(&format!("no value body for function {}", id.0));
    }

    fn function_inverse(&self, id: FunctionId, call: &mut Invocation<'_>) {
        call.set_error(&format!("no inverse body for function {}", id.0));
    }

    /// The engine dropped the registration carrying `id`.
    fn function_destroy(&self, id: FunctionId) {
        let _ = id;
    }

    // Ad-hoc execution

    /// Receive one result row; non-zero aborts the remaining rows.
    fn exec_callback(&self, id: ExecutionId, row: &Row<'_>) -> c_int {
        let _ = (id, row);
        0
    }
}

/// Copy `text` into a C string buffer, truncating so the terminator fits.
///
/// Returns the number of text bytes written. Nothing is written to an
/// empty buffer.
pub fn write_c_string(out: &mut [u8], text: &[u8]) -> usize {
    let Some(room) = out.len().checked_sub(1) else {
        return 0;
    };
    let n = text.len().min(room);
    out[..n].copy_from_slice(&text[..n]);
    out[n] = 0;
    n
}
