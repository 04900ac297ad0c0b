//! FFI-level tests for the host VFS

use super::file::HostFile;
use super::vfs::{method_table, HostVfs};
use super::{io_methods, DEFAULT_MAX_PATHNAME, DLERROR_MESSAGE};
use crate::handle::HandleKey;
use crate::host::{Host, HostCall, HostFileId, MemoryHost, OpenReply, VfsId};
use crate::registrar::Registrar;
use libsqlite3_sys as ffi;
use rusqlite::{params, Connection, OpenFlags};
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::sync::Arc;

const CREATE: c_int = ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE | ffi::SQLITE_OPEN_MAIN_DB;

/// An unregistered instance driven through its method table directly
struct Fixture {
    host: Arc<MemoryHost>,
    state: *mut HostVfs,
    vfs: Box<ffi::sqlite3_vfs>,
}

impl Fixture {
    fn new() -> Self {
        let host = Arc::new(MemoryHost::new());
        let dyn_host: Arc<dyn Host> = host.clone();
        let state = Box::into_raw(Box::new(HostVfs::new(
            VfsId::new(HandleKey::default()),
            CString::new("unit").unwrap(),
            dyn_host,
        )));
        let vfs = Box::new(method_table(state, DEFAULT_MAX_PATHNAME));
        Self { host, state, vfs }
    }

    fn id(&self) -> VfsId {
        unsafe { (*self.state).id }
    }

    fn open_files(&self) -> usize {
        unsafe { (*self.state).open_files() }
    }

    fn raw(&mut self) -> *mut ffi::sqlite3_vfs {
        &mut *self.vfs
    }

    fn open(&mut self, name: &str, flags: c_int) -> (c_int, Box<HostFile>) {
        let mut file: Box<HostFile> = Box::new(unsafe { std::mem::zeroed() });
        let name = CString::new(name).unwrap();
        let mut out_flags = 0;
        let x_open = self.vfs.xOpen.unwrap();
        let rc = unsafe {
            x_open(
                self.raw(),
                name.as_ptr(),
                file_ptr(&mut file),
                flags,
                &mut out_flags,
            )
        };
        (rc, file)
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        unsafe { drop(Box::from_raw(self.state)) };
    }
}

fn file_ptr(file: &mut HostFile) -> *mut ffi::sqlite3_file {
    file as *mut HostFile as *mut ffi::sqlite3_file
}

fn close(file: &mut HostFile) -> c_int {
    let x_close = unsafe { (*io_methods()).xClose.unwrap() };
    unsafe { x_close(file_ptr(file)) }
}

fn read(file: &mut HostFile, buf: &mut [u8], offset: i64) -> c_int {
    let x_read = unsafe { (*io_methods()).xRead.unwrap() };
    unsafe {
        x_read(
            file_ptr(file),
            buf.as_mut_ptr() as *mut c_void,
            buf.len() as c_int,
            offset,
        )
    }
}

fn write(file: &mut HostFile, buf: &[u8], offset: i64) -> c_int {
    let x_write = unsafe { (*io_methods()).xWrite.unwrap() };
    unsafe {
        x_write(
            file_ptr(file),
            buf.as_ptr() as *const c_void,
            buf.len() as c_int,
            offset,
        )
    }
}

#[test]
fn test_open_binds_host_id() {
    let mut fx = Fixture::new();
    fx.host.script_open(OpenReply::id(7));

    let (rc, mut file) = fx.open("/x.db", CREATE);
    assert_eq!(rc, ffi::SQLITE_OK);
    assert!(file.is_open());
    assert_eq!(file.host_file_id().map(|id| id.get()), Some(7));
    assert_eq!(file.methods(), io_methods());
    assert_eq!(fx.open_files(), 1);

    assert_eq!(close(&mut file), ffi::SQLITE_OK);
    assert!(!file.is_open());
    assert_eq!(file.host_file_id(), None);
    assert_eq!(fx.open_files(), 0);

    let last = fx.host.calls().pop().unwrap();
    assert_eq!(last, HostCall::Close { vfs: fx.id(), file: 7 });
}

#[test]
fn test_open_zero_id_is_misuse() {
    let mut fx = Fixture::new();
    fx.host.script_open(OpenReply {
        file_id: 0,
        status: ffi::SQLITE_OK,
    });

    let (rc, file) = fx.open("/x.db", CREATE);
    assert_eq!(rc, ffi::SQLITE_MISUSE);
    assert!(!file.is_open());
    assert!(file.methods().is_null());
    assert_eq!(fx.open_files(), 0);
}

#[test]
fn test_open_zero_id_with_host_error_is_misuse() {
    let mut fx = Fixture::new();
    fx.host.script_open(OpenReply::fail(ffi::SQLITE_CANTOPEN));

    let (rc, file) = fx.open("/x.db", CREATE);
    assert_eq!(rc, ffi::SQLITE_MISUSE);
    assert!(!file.is_open());
}

#[test]
fn test_open_passes_host_error_with_id() {
    let mut fx = Fixture::new();
    fx.host.script_open(OpenReply {
        file_id: 3,
        status: ffi::SQLITE_PERM,
    });

    let (rc, file) = fx.open("/x.db", CREATE);
    assert_eq!(rc, ffi::SQLITE_PERM);
    assert!(!file.is_open());
    assert_eq!(fx.open_files(), 0);
}

#[test]
fn test_duplicate_live_id_is_misuse() {
    let mut fx = Fixture::new();
    fx.host.script_open(OpenReply::id(5));
    fx.host.script_open(OpenReply::id(5));

    let (rc, mut first) = fx.open("/a.db", CREATE);
    assert_eq!(rc, ffi::SQLITE_OK);
    let (rc, second) = fx.open("/b.db", CREATE);
    assert_eq!(rc, ffi::SQLITE_MISUSE);
    assert!(!second.is_open());

    // The first binding is untouched
    assert_eq!(first.host_file_id().map(|id| id.get()), Some(5));
    assert_eq!(close(&mut first), ffi::SQLITE_OK);
}

#[test]
fn test_read_zero_fills_short_read() {
    let mut fx = Fixture::new();
    let (rc, mut file) = fx.open("/data", CREATE);
    assert_eq!(rc, ffi::SQLITE_OK);

    assert_eq!(write(&mut file, b"abc", 0), ffi::SQLITE_OK);

    let mut buf = [0xffu8; 8];
    assert_eq!(read(&mut file, &mut buf, 0), ffi::SQLITE_IOERR_SHORT_READ);
    assert_eq!(&buf, b"abc\0\0\0\0\0");

    let mut buf = [0xffu8; 4];
    assert_eq!(read(&mut file, &mut buf, 100), ffi::SQLITE_IOERR_SHORT_READ);
    assert_eq!(buf, [0u8; 4]);

    close(&mut file);
}

#[test]
fn test_closed_handle_rejects_io() {
    let mut fx = Fixture::new();
    let (_, mut file) = fx.open("/data", CREATE);
    close(&mut file);
    fx.host.clear_calls();

    let mut buf = [0u8; 4];
    assert_eq!(read(&mut file, &mut buf, 0), ffi::SQLITE_MISUSE);
    assert_eq!(close(&mut file), ffi::SQLITE_MISUSE);
    assert!(fx.host.calls().is_empty());
}

#[test]
fn test_file_level_calls_carry_ids() {
    let mut fx = Fixture::new();
    let (_, mut file) = fx.open("/data", CREATE);
    let id = file.host_file_id().unwrap().get();
    fx.host.clear_calls();

    let methods = unsafe { &*file.methods() };
    unsafe {
        let mut size = -1;
        assert_eq!(
            (methods.xFileSize.unwrap())(file_ptr(&mut file), &mut size),
            ffi::SQLITE_OK
        );
        assert_eq!(size, 0);
        assert_eq!(
            (methods.xLock.unwrap())(file_ptr(&mut file), ffi::SQLITE_LOCK_SHARED),
            ffi::SQLITE_OK
        );
        assert_eq!((methods.xSectorSize.unwrap())(file_ptr(&mut file)), 4096);
        assert_eq!(
            (methods.xFileControl.unwrap())(file_ptr(&mut file), 0, std::ptr::null_mut()),
            ffi::SQLITE_NOTFOUND
        );
    }

    let calls = fx.host.calls();
    let vfs = fx.id();
    assert_eq!(
        calls,
        vec![
            HostCall::FileSize { vfs, file: id },
            HostCall::Lock {
                vfs,
                file: id,
                level: ffi::SQLITE_LOCK_SHARED
            },
            HostCall::SectorSize { vfs, file: id },
            HostCall::FileControl { vfs, file: id, op: 0 },
        ]
    );
    close(&mut file);
}

#[test]
fn test_sector_size_on_unopened_file() {
    let mut file: HostFile = unsafe { std::mem::zeroed() };
    let x_sector_size = unsafe { (*io_methods()).xSectorSize.unwrap() };
    assert_eq!(unsafe { x_sector_size(file_ptr(&mut file)) }, 0);
}

#[test]
fn test_dlopen_is_stubbed() {
    let mut fx = Fixture::new();
    let name = CString::new("libfoo.so").unwrap();
    let x_dlopen = fx.vfs.xDlOpen.unwrap();
    assert!(unsafe { x_dlopen(fx.raw(), name.as_ptr()) }.is_null());

    let x_dlerror = fx.vfs.xDlError.unwrap();
    let mut out = [0xffu8; 64];
    unsafe { x_dlerror(fx.raw(), out.len() as c_int, out.as_mut_ptr() as *mut c_char) };
    let message = CStr::from_bytes_until_nul(&out).unwrap();
    assert_eq!(message.to_str().unwrap(), DLERROR_MESSAGE);
}

#[test]
fn test_dlerror_truncates() {
    let mut fx = Fixture::new();
    let x_dlerror = fx.vfs.xDlError.unwrap();
    let mut out = [0xffu8; 10];
    unsafe { x_dlerror(fx.raw(), out.len() as c_int, out.as_mut_ptr() as *mut c_char) };
    assert_eq!(&out, b"Dynamic l\0");
}

#[test]
fn test_full_pathname_and_last_error() {
    let mut fx = Fixture::new();
    let x_full = fx.vfs.xFullPathname.unwrap();
    let name = CString::new("rel.db").unwrap();

    let mut out = [0u8; 64];
    let rc = unsafe { x_full(fx.raw(), name.as_ptr(), out.len() as c_int, out.as_mut_ptr() as *mut c_char) };
    assert_eq!(rc, ffi::SQLITE_OK);
    assert_eq!(CStr::from_bytes_until_nul(&out).unwrap().to_bytes(), b"/rel.db");

    let mut tiny = [0u8; 4];
    let rc = unsafe { x_full(fx.raw(), name.as_ptr(), tiny.len() as c_int, tiny.as_mut_ptr() as *mut c_char) };
    assert_eq!(rc, ffi::SQLITE_CANTOPEN);

    let x_last = fx.vfs.xGetLastError.unwrap();
    let mut message = [0u8; 64];
    let code = unsafe { x_last(fx.raw(), message.len() as c_int, message.as_mut_ptr() as *mut c_char) };
    assert_eq!(code, ffi::SQLITE_CANTOPEN);
    assert!(CStr::from_bytes_until_nul(&message).unwrap().to_bytes().starts_with(b"path longer"));
}

#[test]
fn test_randomness_sleep_and_clock() {
    let mut fx = Fixture::new();

    let x_random = fx.vfs.xRandomness.unwrap();
    let mut out = [0u8; 32];
    let n = unsafe { x_random(fx.raw(), out.len() as c_int, out.as_mut_ptr() as *mut c_char) };
    assert_eq!(n, 32);

    let x_sleep = fx.vfs.xSleep.unwrap();
    assert_eq!(unsafe { x_sleep(fx.raw(), 1500) }, 1500);

    let x_time = fx.vfs.xCurrentTime.unwrap();
    let mut now = 0.0;
    assert_eq!(unsafe { x_time(fx.raw(), &mut now) }, ffi::SQLITE_OK);
    assert!(now > 2_458_849.5);

    let vfs = fx.id();
    let calls = fx.host.calls();
    assert_eq!(calls[0], HostCall::Randomness { vfs, len: 32 });
    assert_eq!(calls[1], HostCall::Sleep { vfs, microseconds: 1500 });
    assert_eq!(calls[2], HostCall::CurrentTime { vfs });
}

#[test]
fn test_method_table_shape() {
    let fx = Fixture::new();
    assert_eq!(fx.vfs.iVersion, 1);
    assert_eq!(fx.vfs.mxPathname, DEFAULT_MAX_PATHNAME);
    assert_eq!(fx.vfs.szOsFile as usize, std::mem::size_of::<HostFile>());
    assert_eq!(unsafe { CStr::from_ptr(fx.vfs.zName) }.to_bytes(), b"unit");
    assert!(fx.vfs.xDlSym.is_none());
    assert!(fx.vfs.xDlClose.is_none());
}

#[test]
fn test_sql_through_host_vfs() {
    let host = Arc::new(MemoryHost::new());
    let registrar = Registrar::with_defaults(host.clone());
    let vfs = registrar.register_vfs(Some("unit-sql"), false).unwrap();

    {
        let conn = Connection::open_with_flags_and_vfs(
            "/unit.db",
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
            vfs.name(),
        )
        .unwrap();
        conn.execute("CREATE TABLE kv (k TEXT PRIMARY KEY, v INTEGER)", [])
            .unwrap();
        conn.execute("INSERT INTO kv VALUES (?1, ?2)", params!["a", 1])
            .unwrap();
        let v: i64 = conn
            .query_row("SELECT v FROM kv WHERE k = 'a'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(v, 1);
    }

    let image = host.file_contents("/unit.db").unwrap();
    assert!(image.starts_with(b"SQLite format 3\0"));
    assert_eq!(host.open_file_count(), 0);

    registrar.unregister_vfs(&vfs).unwrap();
}

/// Panics in `vfs_access` and `io_sync`, claims success in
/// `vfs_full_pathname` without a terminator, forwards everything else
struct MisbehavingHost(MemoryHost);

macro_rules! forward {
    ($($name:ident($($arg:ident: $ty:ty),*);)*) => {
        $(fn $name(&self, $($arg: $ty),*) -> c_int { self.0.$name($($arg),*) })*
    };
}

impl Host for MisbehavingHost {
    fn vfs_access(&self, _vfs: VfsId, _name: &CStr, _flags: c_int, _res_out: &mut c_int) -> c_int {
        panic!("access exploded");
    }

    fn vfs_full_pathname(&self, _vfs: VfsId, _name: &CStr, out: &mut [u8]) -> c_int {
        out.fill(b'x');
        ffi::SQLITE_OK
    }

    fn io_sync(&self, _vfs: VfsId, _file: HostFileId, _flags: c_int) -> c_int {
        panic!("sync exploded");
    }

    forward! {
        vfs_open(vfs: VfsId, name: Option<&CStr>, flags: c_int, file_id: &mut u32, out_flags: &mut c_int);
        vfs_delete(vfs: VfsId, name: &CStr, sync_dir: bool);
        vfs_randomness(vfs: VfsId, out: &mut [u8]);
        vfs_sleep(vfs: VfsId, microseconds: c_int);
        vfs_current_time(vfs: VfsId, time_out: &mut f64);
        vfs_get_last_error(vfs: VfsId, out: &mut [u8]);
        io_close(vfs: VfsId, file: HostFileId);
        io_read(vfs: VfsId, file: HostFileId, buf: &mut [u8], offset: i64);
        io_write(vfs: VfsId, file: HostFileId, buf: &[u8], offset: i64);
        io_truncate(vfs: VfsId, file: HostFileId, size: i64);
        io_file_size(vfs: VfsId, file: HostFileId, size_out: &mut i64);
        io_lock(vfs: VfsId, file: HostFileId, level: c_int);
        io_unlock(vfs: VfsId, file: HostFileId, level: c_int);
        io_check_reserved_lock(vfs: VfsId, file: HostFileId, res_out: &mut c_int);
        io_file_control(vfs: VfsId, file: HostFileId, op: c_int, arg: *mut c_void);
        io_sector_size(vfs: VfsId, file: HostFileId);
        io_device_characteristics(vfs: VfsId, file: HostFileId);
    }
}

/// Unregistered instance over [`MisbehavingHost`]
struct MisbehavingVfs {
    state: *mut HostVfs,
    vfs: Box<ffi::sqlite3_vfs>,
}

impl MisbehavingVfs {
    fn new() -> Self {
        let host: Arc<dyn Host> = Arc::new(MisbehavingHost(MemoryHost::new()));
        let state = Box::into_raw(Box::new(HostVfs::new(
            VfsId::new(HandleKey::default()),
            CString::new("misbehaving").unwrap(),
            host,
        )));
        let vfs = Box::new(method_table(state, DEFAULT_MAX_PATHNAME));
        Self { state, vfs }
    }

    fn raw(&mut self) -> *mut ffi::sqlite3_vfs {
        &mut *self.vfs
    }
}

impl Drop for MisbehavingVfs {
    fn drop(&mut self) {
        unsafe { drop(Box::from_raw(self.state)) };
    }
}

#[test]
fn test_host_panic_becomes_internal_error() {
    let mut bare = MisbehavingVfs::new();
    let name = CString::new("/x.db").unwrap();

    let x_access = bare.vfs.xAccess.unwrap();
    let mut res = -1;
    let rc = unsafe { x_access(bare.raw(), name.as_ptr(), ffi::SQLITE_ACCESS_EXISTS, &mut res) };
    assert_eq!(rc, ffi::SQLITE_INTERNAL);

    let x_open = bare.vfs.xOpen.unwrap();
    let mut file: Box<HostFile> = Box::new(unsafe { std::mem::zeroed() });
    let mut out_flags = 0;
    let rc = unsafe { x_open(bare.raw(), name.as_ptr(), file_ptr(&mut file), CREATE, &mut out_flags) };
    assert_eq!(rc, ffi::SQLITE_OK);

    let x_sync = unsafe { (*io_methods()).xSync.unwrap() };
    assert_eq!(unsafe { x_sync(file_ptr(&mut file), ffi::SQLITE_SYNC_NORMAL) }, ffi::SQLITE_INTERNAL);

    // The file is still usable after the host recovered
    assert_eq!(write(&mut file, b"abc", 0), ffi::SQLITE_OK);
    assert_eq!(close(&mut file), ffi::SQLITE_OK);
}

#[test]
fn test_unterminated_full_pathname_is_misuse() {
    let mut bare = MisbehavingVfs::new();
    let x_full = bare.vfs.xFullPathname.unwrap();
    let name = CString::new("rel.db").unwrap();

    let mut out = [0u8; 32];
    let rc = unsafe { x_full(bare.raw(), name.as_ptr(), out.len() as c_int, out.as_mut_ptr() as *mut c_char) };
    assert_eq!(rc, ffi::SQLITE_MISUSE);
}
