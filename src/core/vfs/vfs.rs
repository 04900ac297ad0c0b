//! VFS-level methods
//!
//! Implements the path-level half of the sqlite3_vfs interface by forwarding
//! to the host. The per-file half lives in `file.rs`.

use super::{buffer_mut, status, trap};
use crate::error::{BridgeError, Result};
use crate::handle::FileTable;
use crate::host::{write_c_string, Host, VfsId};
use libsqlite3_sys as ffi;
use parking_lot::Mutex;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;
use std::sync::Arc;
use tracing::trace;

/// Diagnostic written by `xDlError`
pub const DLERROR_MESSAGE: &str = "Dynamic linking not supported";

/// State behind `sqlite3_vfs::pAppData`
pub(crate) struct HostVfs {
    pub(crate) id: VfsId,
    pub(crate) name: CString,
    pub(crate) host: Arc<dyn Host>,
    pub(crate) files: Mutex<FileTable>,
}

impl HostVfs {
    pub(crate) fn new(id: VfsId, name: CString, host: Arc<dyn Host>) -> Self {
        Self {
            id,
            name,
            host,
            files: Mutex::new(FileTable::new()),
        }
    }

    /// Recover the state from the engine's VFS pointer.
    ///
    /// # Safety
    /// `vfs` must be null or a VFS built by [`method_table`] that is still
    /// registered.
    pub(crate) unsafe fn from_raw<'a>(vfs: *mut ffi::sqlite3_vfs) -> Result<&'a HostVfs> {
        if vfs.is_null() {
            return Err(BridgeError::misuse("null VFS pointer"));
        }
        let state = (*vfs).pAppData as *const HostVfs;
        if state.is_null() {
            return Err(BridgeError::misuse("VFS has no adapter state"));
        }
        Ok(&*state)
    }

    pub(crate) fn open_files(&self) -> usize {
        self.files.lock().len()
    }
}

/// Build the method table for one instance.
///
/// `state` must outlive the registration; the name pointer is borrowed from
/// the state.
pub(crate) fn method_table(state: *mut HostVfs, max_pathname: c_int) -> ffi::sqlite3_vfs {
    // SAFETY: the caller hands over a freshly boxed state.
    let name = unsafe { (*state).name.as_ptr() };

    ffi::sqlite3_vfs {
        iVersion: 1,
        szOsFile: std::mem::size_of::<super::file::HostFile>() as c_int,
        mxPathname: max_pathname,
        pNext: ptr::null_mut(),
        zName: name,
        pAppData: state as *mut c_void,
        xOpen: Some(super::file::file_open),
        xDelete: Some(vfs_delete),
        xAccess: Some(vfs_access),
        xFullPathname: Some(vfs_full_pathname),
        xDlOpen: Some(vfs_dlopen),
        xDlError: Some(vfs_dlerror),
        xDlSym: None,
        xDlClose: None,
        xRandomness: Some(vfs_randomness),
        xSleep: Some(vfs_sleep),
        xCurrentTime: Some(vfs_current_time),
        xGetLastError: Some(vfs_get_last_error),
        xCurrentTimeInt64: None,
        xSetSystemCall: None,
        xGetSystemCall: None,
        xNextSystemCall: None,
    }
}

unsafe fn path<'a>(z_name: *const c_char) -> Result<&'a CStr> {
    if z_name.is_null() {
        return Err(BridgeError::misuse("null path"));
    }
    Ok(CStr::from_ptr(z_name))
}

// VFS callback functions

unsafe extern "C" fn vfs_delete(
    vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    sync_dir: c_int,
) -> c_int {
    status("xDelete", || {
        let state = HostVfs::from_raw(vfs)?;
        let name = path(z_name)?;
        trace!(vfs = %state.id, path = ?name, sync_dir, "delete");
        BridgeError::check(state.host.vfs_delete(state.id, name, sync_dir != 0))
    })
}

unsafe extern "C" fn vfs_access(
    vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    flags: c_int,
    p_res_out: *mut c_int,
) -> c_int {
    status("xAccess", || {
        let state = HostVfs::from_raw(vfs)?;
        let name = path(z_name)?;
        if p_res_out.is_null() {
            return Err(BridgeError::misuse("null access result pointer"));
        }
        trace!(vfs = %state.id, path = ?name, flags, "access");
        BridgeError::check(state.host.vfs_access(state.id, name, flags, &mut *p_res_out))
    })
}

unsafe extern "C" fn vfs_full_pathname(
    vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    n_out: c_int,
    z_out: *mut c_char,
) -> c_int {
    status("xFullPathname", || {
        let state = HostVfs::from_raw(vfs)?;
        let name = path(z_name)?;
        let out = buffer_mut(z_out as *mut u8, n_out);
        trace!(vfs = %state.id, path = ?name, n_out, "full pathname");
        BridgeError::check(state.host.vfs_full_pathname(state.id, name, out))?;
        if !out.contains(&0) {
            return Err(BridgeError::misuse(
                "host reported success without a terminated pathname",
            ));
        }
        Ok(())
    })
}

unsafe extern "C" fn vfs_dlopen(_vfs: *mut ffi::sqlite3_vfs, _z_filename: *const c_char) -> *mut c_void {
    ptr::null_mut()
}

unsafe extern "C" fn vfs_dlerror(_vfs: *mut ffi::sqlite3_vfs, n_byte: c_int, z_err_msg: *mut c_char) {
    let out = buffer_mut(z_err_msg as *mut u8, n_byte);
    write_c_string(out, DLERROR_MESSAGE.as_bytes());
}

unsafe extern "C" fn vfs_randomness(
    vfs: *mut ffi::sqlite3_vfs,
    n_byte: c_int,
    z_out: *mut c_char,
) -> c_int {
    trap("xRandomness", 0, || match HostVfs::from_raw(vfs) {
        Ok(state) => {
            let out = buffer_mut(z_out as *mut u8, n_byte);
            state.host.vfs_randomness(state.id, out)
        }
        Err(_) => 0,
    })
}

unsafe extern "C" fn vfs_sleep(vfs: *mut ffi::sqlite3_vfs, microseconds: c_int) -> c_int {
    trap("xSleep", 0, || match HostVfs::from_raw(vfs) {
        Ok(state) => state.host.vfs_sleep(state.id, microseconds),
        Err(_) => 0,
    })
}

unsafe extern "C" fn vfs_current_time(vfs: *mut ffi::sqlite3_vfs, p_time_out: *mut f64) -> c_int {
    status("xCurrentTime", || {
        let state = HostVfs::from_raw(vfs)?;
        if p_time_out.is_null() {
            return Err(BridgeError::misuse("null time pointer"));
        }
        BridgeError::check(state.host.vfs_current_time(state.id, &mut *p_time_out))
    })
}

unsafe extern "C" fn vfs_get_last_error(
    vfs: *mut ffi::sqlite3_vfs,
    n_byte: c_int,
    z_err_msg: *mut c_char,
) -> c_int {
    trap("xGetLastError", 0, || match HostVfs::from_raw(vfs) {
        Ok(state) => {
            let out = buffer_mut(z_err_msg as *mut u8, n_byte);
            state.host.vfs_get_last_error(state.id, out)
        }
        Err(_) => 0,
    })
}
