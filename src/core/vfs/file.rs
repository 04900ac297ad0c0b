//! SQLite file I/O methods implementation
//!
//! Implements sqlite3_io_methods by forwarding each call to the host,
//! keyed by the host file identifier bound at open time.

use super::vfs::HostVfs;
use super::{buffer, buffer_mut, status, trap};
use crate::error::{BridgeError, Result};
use crate::handle::{HandleKey, HostFileId};
use libsqlite3_sys as ffi;
use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;
use tracing::{trace, warn};

/// Host-backed SQLite file
///
/// SQLite allocates `szOsFile` bytes for this and zeroes nothing; only
/// `base.pMethods` is inspected before a successful open.
#[repr(C)]
pub struct HostFile {
    /// Base sqlite3_file structure (MUST be first field)
    base: ffi::sqlite3_file,
    /// Owning instance (non-owning back-reference)
    vfs: *const HostVfs,
    /// Adapter-local handle table key
    key: HandleKey,
    /// Identifier the host assigned at open; 0 while not open
    file_id: u32,
}

impl HostFile {
    /// Host identifier bound to this file, if it is open.
    pub fn host_file_id(&self) -> Option<HostFileId> {
        if self.is_open() {
            HostFileId::new(self.file_id)
        } else {
            None
        }
    }

    pub fn is_open(&self) -> bool {
        !self.base.pMethods.is_null()
    }

    /// Method table the engine will call through.
    pub fn methods(&self) -> *const ffi::sqlite3_io_methods {
        self.base.pMethods
    }

    /// Resolve the owning instance and the live host identifier.
    unsafe fn resolve<'a>(file: *mut ffi::sqlite3_file) -> Result<(&'a HostVfs, HostFileId)> {
        if file.is_null() {
            return Err(BridgeError::misuse("null file pointer"));
        }
        let this = &*(file as *const HostFile);
        if this.vfs.is_null() {
            return Err(BridgeError::misuse("file was never opened"));
        }
        let state = &*this.vfs;
        let id = state.files.lock().resolve(this.key)?;
        if id.get() != this.file_id {
            return Err(BridgeError::Misuse(format!(
                "file handle {} is bound to host id {} but carries {}",
                this.key, id, this.file_id
            )));
        }
        Ok((state, id))
    }
}

/// Method table shared by every open file
static IO_METHODS: ffi::sqlite3_io_methods = ffi::sqlite3_io_methods {
    iVersion: 1,
    xClose: Some(file_close),
    xRead: Some(file_read),
    xWrite: Some(file_write),
    xTruncate: Some(file_truncate),
    xSync: Some(file_sync),
    xFileSize: Some(file_file_size),
    xLock: Some(file_lock),
    xUnlock: Some(file_unlock),
    xCheckReservedLock: Some(file_check_reserved_lock),
    xFileControl: Some(file_file_control),
    xSectorSize: Some(file_sector_size),
    xDeviceCharacteristics: Some(file_device_characteristics),
    xShmMap: None,
    xShmLock: None,
    xShmBarrier: None,
    xShmUnmap: None,
    xFetch: None,
    xUnfetch: None,
};

/// The fixed method table installed into every successfully opened file.
pub fn io_methods() -> *const ffi::sqlite3_io_methods {
    &IO_METHODS
}

// File I/O method implementations

unsafe extern "C" fn file_close(file: *mut ffi::sqlite3_file) -> c_int {
    status("xClose", || {
        let (state, id) = HostFile::resolve(file)?;
        let this = &mut *(file as *mut HostFile);

        state.files.lock().release(this.key)?;
        this.base.pMethods = ptr::null();
        this.file_id = 0;

        trace!(vfs = %state.id, file = %id, "close");
        BridgeError::check(state.host.io_close(state.id, id))
    })
}

unsafe extern "C" fn file_read(
    file: *mut ffi::sqlite3_file,
    buf: *mut c_void,
    amt: c_int,
    offset: ffi::sqlite3_int64,
) -> c_int {
    status("xRead", || {
        let (state, id) = HostFile::resolve(file)?;
        let data = buffer_mut(buf as *mut u8, amt);
        // A short read leaves the unread tail zeroed, as SQLite requires.
        data.fill(0);
        trace!(vfs = %state.id, file = %id, amt, offset, "read");
        BridgeError::check(state.host.io_read(state.id, id, data, offset))
    })
}

unsafe extern "C" fn file_write(
    file: *mut ffi::sqlite3_file,
    buf: *const c_void,
    amt: c_int,
    offset: ffi::sqlite3_int64,
) -> c_int {
    status("xWrite", || {
        let (state, id) = HostFile::resolve(file)?;
        let data = buffer(buf as *const u8, amt);
        trace!(vfs = %state.id, file = %id, amt, offset, "write");
        BridgeError::check(state.host.io_write(state.id, id, data, offset))
    })
}

unsafe extern "C" fn file_truncate(file: *mut ffi::sqlite3_file, size: ffi::sqlite3_int64) -> c_int {
    status("xTruncate", || {
        let (state, id) = HostFile::resolve(file)?;
        BridgeError::check(state.host.io_truncate(state.id, id, size))
    })
}

unsafe extern "C" fn file_sync(file: *mut ffi::sqlite3_file, flags: c_int) -> c_int {
    status("xSync", || {
        let (state, id) = HostFile::resolve(file)?;
        BridgeError::check(state.host.io_sync(state.id, id, flags))
    })
}

unsafe extern "C" fn file_file_size(
    file: *mut ffi::sqlite3_file,
    p_size: *mut ffi::sqlite3_int64,
) -> c_int {
    status("xFileSize", || {
        let (state, id) = HostFile::resolve(file)?;
        if p_size.is_null() {
            return Err(BridgeError::misuse("null size pointer"));
        }
        BridgeError::check(state.host.io_file_size(state.id, id, &mut *p_size))
    })
}

unsafe extern "C" fn file_lock(file: *mut ffi::sqlite3_file, lock_type: c_int) -> c_int {
    status("xLock", || {
        let (state, id) = HostFile::resolve(file)?;
        BridgeError::check(state.host.io_lock(state.id, id, lock_type))
    })
}

unsafe extern "C" fn file_unlock(file: *mut ffi::sqlite3_file, lock_type: c_int) -> c_int {
    status("xUnlock", || {
        let (state, id) = HostFile::resolve(file)?;
        BridgeError::check(state.host.io_unlock(state.id, id, lock_type))
    })
}

unsafe extern "C" fn file_check_reserved_lock(
    file: *mut ffi::sqlite3_file,
    p_res_out: *mut c_int,
) -> c_int {
    status("xCheckReservedLock", || {
        let (state, id) = HostFile::resolve(file)?;
        if p_res_out.is_null() {
            return Err(BridgeError::misuse("null reserved-lock result pointer"));
        }
        BridgeError::check(state.host.io_check_reserved_lock(state.id, id, &mut *p_res_out))
    })
}

unsafe extern "C" fn file_file_control(
    file: *mut ffi::sqlite3_file,
    op: c_int,
    p_arg: *mut c_void,
) -> c_int {
    status("xFileControl", || {
        let (state, id) = HostFile::resolve(file)?;
        BridgeError::check(state.host.io_file_control(state.id, id, op, p_arg))
    })
}

unsafe extern "C" fn file_sector_size(file: *mut ffi::sqlite3_file) -> c_int {
    trap("xSectorSize", 0, || match HostFile::resolve(file) {
        Ok((state, id)) => state.host.io_sector_size(state.id, id),
        Err(e) => {
            warn!(error = %e, "sector size on a file that is not open");
            0
        }
    })
}

unsafe extern "C" fn file_device_characteristics(file: *mut ffi::sqlite3_file) -> c_int {
    trap("xDeviceCharacteristics", 0, || match HostFile::resolve(file) {
        Ok((state, id)) => state.host.io_device_characteristics(state.id, id),
        Err(e) => {
            warn!(error = %e, "device characteristics on a file that is not open");
            0
        }
    })
}

// VFS open callback

pub(crate) unsafe extern "C" fn file_open(
    vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    file: *mut ffi::sqlite3_file,
    flags: c_int,
    p_out_flags: *mut c_int,
) -> c_int {
    status("xOpen", || {
        let state = HostVfs::from_raw(vfs)?;
        if file.is_null() {
            return Err(BridgeError::misuse("null file pointer"));
        }

        // Nothing is bound until the host has answered
        let this = &mut *(file as *mut HostFile);
        this.base.pMethods = ptr::null();
        this.vfs = ptr::null();
        this.key = HandleKey::default();
        this.file_id = 0;

        let name = if z_name.is_null() {
            None
        } else {
            Some(CStr::from_ptr(z_name))
        };

        let mut raw_id = 0u32;
        let mut out_flags = flags;
        let rc = state
            .host
            .vfs_open(state.id, name, flags, &mut raw_id, &mut out_flags);
        trace!(vfs = %state.id, path = ?name, flags, rc, file = raw_id, "open");

        if raw_id == 0 {
            return Err(BridgeError::Misuse(format!(
                "host answered open with file id 0 (status {})",
                rc
            )));
        }
        BridgeError::check(rc)?;

        let (key, id) = state.files.lock().bind(raw_id)?;
        this.vfs = state;
        this.key = key;
        this.file_id = id.get();
        this.base.pMethods = &IO_METHODS;

        if !p_out_flags.is_null() {
            *p_out_flags = out_flags;
        }
        Ok(())
    })
}
