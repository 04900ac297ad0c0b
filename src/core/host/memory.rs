//! In-memory reference host
//!
//! [`MemoryHost`] keeps files as byte vectors keyed by path, hands out file
//! ids starting at 1 and journals every call it receives as a [`HostCall`].
//! Function bodies and row consumers are registered on it directly, so a
//! test can drive the whole bridge without another process.

use super::{write_c_string, ExecutionId, FunctionId, Host, HostFileId, VfsId};
use crate::exec::Row;
use crate::function::Invocation;
use ahash::AHashMap;
use chrono::Utc;
use libsqlite3_sys as ffi;
use parking_lot::Mutex;
use rand::RngCore;
use rusqlite::types::Value;
use std::collections::VecDeque;
use std::ffi::CStr;
use std::os::raw::{c_int, c_void};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

const SECTOR_SIZE: c_int = 4096;

/// Julian day number of the Unix epoch
const UNIX_EPOCH_JULIAN_DAY: f64 = 2440587.5;

/// One call received by a [`MemoryHost`]
#[derive(Debug, Clone, PartialEq)]
pub enum HostCall {
    OsInit,
    OsEnd,
    Log(String),
    Open {
        vfs: VfsId,
        name: Option<String>,
        flags: c_int,
        file_id: u32,
    },
    Delete {
        vfs: VfsId,
        name: String,
        sync_dir: bool,
    },
    Access {
        vfs: VfsId,
        name: String,
        flags: c_int,
    },
    FullPathname {
        vfs: VfsId,
        name: String,
    },
    Randomness {
        vfs: VfsId,
        len: usize,
    },
    Sleep {
        vfs: VfsId,
        microseconds: c_int,
    },
    CurrentTime {
        vfs: VfsId,
    },
    GetLastError {
        vfs: VfsId,
    },
    Close {
        vfs: VfsId,
        file: u32,
    },
    Read {
        vfs: VfsId,
        file: u32,
        len: usize,
        offset: i64,
    },
    Write {
        vfs: VfsId,
        file: u32,
        len: usize,
        offset: i64,
    },
    Truncate {
        vfs: VfsId,
        file: u32,
        size: i64,
    },
    Sync {
        vfs: VfsId,
        file: u32,
        flags: c_int,
    },
    FileSize {
        vfs: VfsId,
        file: u32,
    },
    Lock {
        vfs: VfsId,
        file: u32,
        level: c_int,
    },
    Unlock {
        vfs: VfsId,
        file: u32,
        level: c_int,
    },
    CheckReservedLock {
        vfs: VfsId,
        file: u32,
    },
    FileControl {
        vfs: VfsId,
        file: u32,
        op: c_int,
    },
    SectorSize {
        vfs: VfsId,
        file: u32,
    },
    DeviceCharacteristics {
        vfs: VfsId,
        file: u32,
    },
    FunctionFunc {
        id: FunctionId,
        args: Vec<Value>,
    },
    FunctionStep {
        id: FunctionId,
        args: Vec<Value>,
    },
    FunctionFinal {
        id: FunctionId,
    },
    FunctionValue {
        id: FunctionId,
    },
    FunctionInverse {
        id: FunctionId,
        args: Vec<Value>,
    },
    FunctionDestroy {
        id: FunctionId,
    },
    ExecRow {
        id: ExecutionId,
        columns: Vec<(String, Option<String>)>,
    },
}

impl HostCall {
    /// Whether this is one of the file-level `io_*` calls.
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            HostCall::Close { .. }
                | HostCall::Read { .. }
                | HostCall::Write { .. }
                | HostCall::Truncate { .. }
                | HostCall::Sync { .. }
                | HostCall::FileSize { .. }
                | HostCall::Lock { .. }
                | HostCall::Unlock { .. }
                | HostCall::CheckReservedLock { .. }
                | HostCall::FileControl { .. }
                | HostCall::SectorSize { .. }
                | HostCall::DeviceCharacteristics { .. }
        )
    }
}

/// Forced answer for the next `vfs_open`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenReply {
    pub file_id: u32,
    pub status: c_int,
}

impl OpenReply {
    /// Succeed with `file_id`.
    pub fn id(file_id: u32) -> Self {
        Self {
            file_id,
            status: ffi::SQLITE_OK,
        }
    }

    /// Fail with `status`, leaving the id unassigned.
    pub fn fail(status: c_int) -> Self {
        Self { file_id: 0, status }
    }
}

/// A captured result row
pub type CapturedRow = Vec<(String, Option<String>)>;

type ScalarFn = dyn Fn(&[Value]) -> std::result::Result<Value, String> + Send + Sync;
type FoldFn = dyn Fn(&mut Value, &[Value]) + Send + Sync;
type FinishFn = dyn Fn(&Value) -> Value + Send + Sync;

enum Body {
    Scalar(Box<ScalarFn>),
    Accumulate {
        init: Value,
        step: Box<FoldFn>,
        inverse: Option<Box<FoldFn>>,
        finish: Box<FinishFn>,
    },
}

struct OpenFile {
    path: String,
    lock: c_int,
    delete_on_close: bool,
}

#[derive(Default)]
struct Filesystem {
    files: AHashMap<String, Vec<u8>>,
    open: AHashMap<u32, OpenFile>,
    next_id: u32,
    next_temp: u64,
    scripted: VecDeque<OpenReply>,
    last_error: AHashMap<VfsId, (c_int, String)>,
}

impl Filesystem {
    fn allocate_id(&mut self) -> u32 {
        self.next_id = self.next_id.max(1);
        while self.open.contains_key(&self.next_id) {
            self.next_id = self.next_id.wrapping_add(1).max(1);
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }

    /// Highest lock held on `path` by handles other than `except`.
    fn strongest_other_lock(&self, path: &str, except: u32) -> c_int {
        self.open
            .iter()
            .filter(|(id, f)| **id != except && f.path == path)
            .map(|(_, f)| f.lock)
            .max()
            .unwrap_or(ffi::SQLITE_LOCK_NONE)
    }

    fn fail(&mut self, vfs: VfsId, code: c_int, message: String) -> c_int {
        self.last_error.insert(vfs, (code, message));
        code
    }
}

#[derive(Default)]
struct Executions {
    rows: AHashMap<ExecutionId, Vec<CapturedRow>>,
    abort_after: AHashMap<ExecutionId, usize>,
}

/// In-memory [`Host`] with a call journal
pub struct MemoryHost {
    fs: Mutex<Filesystem>,
    bodies: Mutex<AHashMap<FunctionId, Arc<Body>>>,
    accumulators: Mutex<AHashMap<u64, Value>>,
    next_accumulator: AtomicU64,
    executions: Mutex<Executions>,
    logs: Mutex<Vec<String>>,
    journal: Mutex<Vec<HostCall>>,
    journaling: AtomicBool,
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHost {
    pub fn new() -> Self {
        Self {
            fs: Mutex::new(Filesystem::default()),
            bodies: Mutex::new(AHashMap::new()),
            accumulators: Mutex::new(AHashMap::new()),
            next_accumulator: AtomicU64::new(1),
            executions: Mutex::new(Executions::default()),
            logs: Mutex::new(Vec::new()),
            journal: Mutex::new(Vec::new()),
            journaling: AtomicBool::new(true),
        }
    }

    /// Stop recording calls. Useful for benches that do a lot of I/O.
    pub fn without_journal(self) -> Self {
        self.journaling.store(false, Ordering::SeqCst);
        self
    }

    fn record(&self, call: HostCall) {
        if self.journaling.load(Ordering::Relaxed) {
            self.journal.lock().push(call);
        }
    }

    /// Every call received so far, oldest first.
    pub fn calls(&self) -> Vec<HostCall> {
        self.journal.lock().clone()
    }

    pub fn take_calls(&self) -> Vec<HostCall> {
        std::mem::take(&mut *self.journal.lock())
    }

    pub fn clear_calls(&self) {
        self.journal.lock().clear();
    }

    /// Answer the next `vfs_open` with `reply` instead of the filesystem.
    ///
    /// A successful reply with a non-zero id opens an empty file under a
    /// synthetic path so the handle works for later I/O.
    pub fn script_open(&self, reply: OpenReply) {
        self.fs.lock().scripted.push_back(reply);
    }

    pub fn put_file(&self, path: &str, bytes: Vec<u8>) {
        self.fs.lock().files.insert(path.to_string(), bytes);
    }

    pub fn file_contents(&self, path: &str) -> Option<Vec<u8>> {
        self.fs.lock().files.get(path).cloned()
    }

    pub fn file_exists(&self, path: &str) -> bool {
        self.fs.lock().files.contains_key(path)
    }

    pub fn open_file_count(&self) -> usize {
        self.fs.lock().open.len()
    }

    /// Lock level currently held through host file `file`.
    pub fn lock_level(&self, file: u32) -> Option<c_int> {
        self.fs.lock().open.get(&file).map(|f| f.lock)
    }

    /// Register a scalar body for `id`.
    pub fn define_scalar<F>(&self, id: FunctionId, body: F)
    where
        F: Fn(&[Value]) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        self.bodies
            .lock()
            .insert(id, Arc::new(Body::Scalar(Box::new(body))));
    }

    /// Register an aggregate body: `step` folds each row into the
    /// accumulator, `finish` turns it into the result.
    pub fn define_aggregate<S, F>(&self, id: FunctionId, init: Value, step: S, finish: F)
    where
        S: Fn(&mut Value, &[Value]) + Send + Sync + 'static,
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.bodies.lock().insert(
            id,
            Arc::new(Body::Accumulate {
                init,
                step: Box::new(step),
                inverse: None,
                finish: Box::new(finish),
            }),
        );
    }

    /// Register a window body; `inverse` removes a row leaving the frame.
    pub fn define_window<S, I, F>(&self, id: FunctionId, init: Value, step: S, inverse: I, finish: F)
    where
        S: Fn(&mut Value, &[Value]) + Send + Sync + 'static,
        I: Fn(&mut Value, &[Value]) + Send + Sync + 'static,
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.bodies.lock().insert(
            id,
            Arc::new(Body::Accumulate {
                init,
                step: Box::new(step),
                inverse: Some(Box::new(inverse)),
                finish: Box::new(finish),
            }),
        );
    }

    /// Number of accumulators not yet finalized.
    pub fn live_accumulators(&self) -> usize {
        self.accumulators.lock().len()
    }

    /// Make the row consumer for `id` abort once it holds `rows` rows.
    pub fn abort_after(&self, id: ExecutionId, rows: usize) {
        self.executions.lock().abort_after.insert(id, rows);
    }

    /// Rows delivered for execution `id`.
    pub fn rows(&self, id: ExecutionId) -> Vec<CapturedRow> {
        self.executions
            .lock()
            .rows
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn logs(&self) -> Vec<String> {
        self.logs.lock().clone()
    }

    fn body(&self, id: FunctionId) -> Option<Arc<Body>> {
        self.bodies.lock().get(&id).cloned()
    }

    /// Accumulator token for the current aggregate group, creating it on
    /// first use.
    fn accumulator(&self, call: &mut Invocation<'_>, init: &Value) -> Option<u64> {
        let slot = call.aggregate_slot()?;
        if *slot == 0 {
            *slot = self.next_accumulator.fetch_add(1, Ordering::Relaxed);
            self.accumulators.lock().insert(*slot, init.clone());
        }
        Some(*slot)
    }

    fn fold(&self, id: FunctionId, call: &mut Invocation<'_>, removing: bool) {
        let Some(body) = self.body(id) else {
            call.set_error(&format!("function {} has no body", id.0));
            return;
        };
        let Body::Accumulate {
            init,
            step,
            inverse,
            ..
        } = body.as_ref()
        else {
            call.set_error(&format!("function {} is not an aggregate", id.0));
            return;
        };
        let fold = if removing {
            match inverse {
                Some(inverse) => inverse,
                None => {
                    call.set_error(&format!("function {} has no inverse", id.0));
                    return;
                }
            }
        } else {
            step
        };

        let Some(token) = self.accumulator(call, init) else {
            call.set_error_code(ffi::SQLITE_NOMEM);
            return;
        };
        let args = call.values();
        let mut accumulators = self.accumulators.lock();
        if let Some(acc) = accumulators.get_mut(&token) {
            fold(acc, &args);
        }
    }

    fn finish(&self, id: FunctionId, call: &mut Invocation<'_>, last: bool) {
        let Some(body) = self.body(id) else {
            call.set_error(&format!("function {} has no body", id.0));
            return;
        };
        let Body::Accumulate { init, finish, .. } = body.as_ref() else {
            call.set_error(&format!("function {} is not an aggregate", id.0));
            return;
        };

        let token = call.aggregate_slot().map(|slot| *slot).unwrap_or(0);
        let acc = {
            let mut accumulators = self.accumulators.lock();
            if last {
                accumulators.remove(&token)
            } else {
                accumulators.get(&token).cloned()
            }
        };
        // No rows stepped: the group is empty
        let acc = acc.unwrap_or_else(|| init.clone());
        call.set_result(&finish(&acc));
    }
}

fn lossy(name: &CStr) -> String {
    name.to_string_lossy().into_owned()
}

impl Host for MemoryHost {
    fn os_init(&self) -> c_int {
        self.record(HostCall::OsInit);
        ffi::SQLITE_OK
    }

    fn os_end(&self) -> c_int {
        self.record(HostCall::OsEnd);
        ffi::SQLITE_OK
    }

    fn log(&self, message: &str) {
        self.record(HostCall::Log(message.to_string()));
        self.logs.lock().push(message.to_string());
    }

    fn vfs_open(
        &self,
        vfs: VfsId,
        name: Option<&CStr>,
        flags: c_int,
        file_id: &mut u32,
        out_flags: &mut c_int,
    ) -> c_int {
        let mut fs = self.fs.lock();
        let rc = if let Some(reply) = fs.scripted.pop_front() {
            *file_id = reply.file_id;
            if reply.status == ffi::SQLITE_OK && reply.file_id != 0 {
                let path = format!("scripted-{}", reply.file_id);
                fs.files.entry(path.clone()).or_default();
                fs.open.insert(
                    reply.file_id,
                    OpenFile {
                        path,
                        lock: ffi::SQLITE_LOCK_NONE,
                        delete_on_close: false,
                    },
                );
                fs.next_id = fs.next_id.max(reply.file_id.saturating_add(1));
            }
            reply.status
        } else {
            let path = match name {
                Some(name) => lossy(name),
                None => {
                    fs.next_temp += 1;
                    format!("temp-{}", fs.next_temp)
                }
            };
            let exists = fs.files.contains_key(&path);

            if !exists && flags & ffi::SQLITE_OPEN_CREATE == 0 {
                fs.fail(vfs, ffi::SQLITE_CANTOPEN, format!("{}: no such file", path))
            } else if exists && flags & ffi::SQLITE_OPEN_EXCLUSIVE != 0 {
                fs.fail(vfs, ffi::SQLITE_CANTOPEN, format!("{}: already exists", path))
            } else {
                fs.files.entry(path.clone()).or_default();
                let id = fs.allocate_id();
                fs.open.insert(
                    id,
                    OpenFile {
                        path,
                        lock: ffi::SQLITE_LOCK_NONE,
                        delete_on_close: name.is_none()
                            || flags & ffi::SQLITE_OPEN_DELETEONCLOSE != 0,
                    },
                );
                *file_id = id;
                *out_flags = flags;
                ffi::SQLITE_OK
            }
        };
        drop(fs);

        self.record(HostCall::Open {
            vfs,
            name: name.map(lossy),
            flags,
            file_id: *file_id,
        });
        rc
    }

    fn vfs_delete(&self, vfs: VfsId, name: &CStr, sync_dir: bool) -> c_int {
        self.record(HostCall::Delete {
            vfs,
            name: lossy(name),
            sync_dir,
        });
        self.fs.lock().files.remove(&lossy(name));
        ffi::SQLITE_OK
    }

    fn vfs_access(&self, vfs: VfsId, name: &CStr, flags: c_int, res_out: &mut c_int) -> c_int {
        self.record(HostCall::Access {
            vfs,
            name: lossy(name),
            flags,
        });
        *res_out = self.fs.lock().files.contains_key(&lossy(name)) as c_int;
        ffi::SQLITE_OK
    }

    fn vfs_full_pathname(&self, vfs: VfsId, name: &CStr, out: &mut [u8]) -> c_int {
        self.record(HostCall::FullPathname {
            vfs,
            name: lossy(name),
        });
        let name = name.to_bytes();
        let full: Vec<u8> = if name.starts_with(b"/") {
            name.to_vec()
        } else {
            [b"/".as_slice(), name].concat()
        };
        if full.len() >= out.len() {
            let mut fs = self.fs.lock();
            return fs.fail(
                vfs,
                ffi::SQLITE_CANTOPEN,
                format!("path longer than {} bytes", out.len()),
            );
        }
        write_c_string(out, &full);
        ffi::SQLITE_OK
    }

    fn vfs_randomness(&self, vfs: VfsId, out: &mut [u8]) -> c_int {
        self.record(HostCall::Randomness {
            vfs,
            len: out.len(),
        });
        rand::thread_rng().fill_bytes(out);
        out.len().min(c_int::MAX as usize) as c_int
    }

    /// Does not block; reports the full interval as slept.
    fn vfs_sleep(&self, vfs: VfsId, microseconds: c_int) -> c_int {
        self.record(HostCall::Sleep { vfs, microseconds });
        microseconds
    }

    fn vfs_current_time(&self, vfs: VfsId, time_out: &mut f64) -> c_int {
        self.record(HostCall::CurrentTime { vfs });
        let millis = Utc::now().timestamp_millis() as f64;
        *time_out = UNIX_EPOCH_JULIAN_DAY + millis / 86_400_000.0;
        ffi::SQLITE_OK
    }

    fn vfs_get_last_error(&self, vfs: VfsId, out: &mut [u8]) -> c_int {
        self.record(HostCall::GetLastError { vfs });
        match self.fs.lock().last_error.get(&vfs) {
            Some((code, message)) => {
                write_c_string(out, message.as_bytes());
                *code
            }
            None => {
                write_c_string(out, b"");
                0
            }
        }
    }

    fn io_close(&self, vfs: VfsId, file: HostFileId) -> c_int {
        self.record(HostCall::Close {
            vfs,
            file: file.get(),
        });
        let mut fs = self.fs.lock();
        match fs.open.remove(&file.get()) {
            Some(closed) => {
                if closed.delete_on_close {
                    fs.files.remove(&closed.path);
                }
                ffi::SQLITE_OK
            }
            None => ffi::SQLITE_IOERR_CLOSE,
        }
    }

    fn io_read(&self, vfs: VfsId, file: HostFileId, buf: &mut [u8], offset: i64) -> c_int {
        self.record(HostCall::Read {
            vfs,
            file: file.get(),
            len: buf.len(),
            offset,
        });
        let fs = self.fs.lock();
        let Some(data) = fs
            .open
            .get(&file.get())
            .and_then(|f| fs.files.get(&f.path))
        else {
            return ffi::SQLITE_IOERR_READ;
        };

        let start = offset.max(0) as usize;
        if start >= data.len() {
            return ffi::SQLITE_IOERR_SHORT_READ;
        }
        let available = (data.len() - start).min(buf.len());
        buf[..available].copy_from_slice(&data[start..start + available]);
        if available < buf.len() {
            ffi::SQLITE_IOERR_SHORT_READ
        } else {
            ffi::SQLITE_OK
        }
    }

    fn io_write(&self, vfs: VfsId, file: HostFileId, buf: &[u8], offset: i64) -> c_int {
        self.record(HostCall::Write {
            vfs,
            file: file.get(),
            len: buf.len(),
            offset,
        });
        let mut fs = self.fs.lock();
        let Some(path) = fs.open.get(&file.get()).map(|f| f.path.clone()) else {
            return ffi::SQLITE_IOERR_WRITE;
        };
        let data = fs.files.entry(path).or_default();
        let start = offset.max(0) as usize;
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        ffi::SQLITE_OK
    }

    fn io_truncate(&self, vfs: VfsId, file: HostFileId, size: i64) -> c_int {
        self.record(HostCall::Truncate {
            vfs,
            file: file.get(),
            size,
        });
        let mut fs = self.fs.lock();
        let Some(path) = fs.open.get(&file.get()).map(|f| f.path.clone()) else {
            return ffi::SQLITE_IOERR_TRUNCATE;
        };
        if let Some(data) = fs.files.get_mut(&path) {
            data.resize(size.max(0) as usize, 0);
        }
        ffi::SQLITE_OK
    }

    fn io_sync(&self, vfs: VfsId, file: HostFileId, flags: c_int) -> c_int {
        self.record(HostCall::Sync {
            vfs,
            file: file.get(),
            flags,
        });
        ffi::SQLITE_OK
    }

    fn io_file_size(&self, vfs: VfsId, file: HostFileId, size_out: &mut i64) -> c_int {
        self.record(HostCall::FileSize {
            vfs,
            file: file.get(),
        });
        let fs = self.fs.lock();
        match fs
            .open
            .get(&file.get())
            .and_then(|f| fs.files.get(&f.path))
        {
            Some(data) => {
                *size_out = data.len() as i64;
                ffi::SQLITE_OK
            }
            None => ffi::SQLITE_IOERR_FSTAT,
        }
    }

    fn io_lock(&self, vfs: VfsId, file: HostFileId, level: c_int) -> c_int {
        self.record(HostCall::Lock {
            vfs,
            file: file.get(),
            level,
        });
        let mut fs = self.fs.lock();
        let Some(path) = fs.open.get(&file.get()).map(|f| f.path.clone()) else {
            return ffi::SQLITE_IOERR_LOCK;
        };
        let other = fs.strongest_other_lock(&path, file.get());
        let blocked = match level {
            ffi::SQLITE_LOCK_SHARED => other >= ffi::SQLITE_LOCK_PENDING,
            ffi::SQLITE_LOCK_RESERVED => other >= ffi::SQLITE_LOCK_RESERVED,
            _ => other >= ffi::SQLITE_LOCK_SHARED,
        };
        if blocked {
            return ffi::SQLITE_BUSY;
        }
        if let Some(f) = fs.open.get_mut(&file.get()) {
            f.lock = f.lock.max(level);
        }
        ffi::SQLITE_OK
    }

    fn io_unlock(&self, vfs: VfsId, file: HostFileId, level: c_int) -> c_int {
        self.record(HostCall::Unlock {
            vfs,
            file: file.get(),
            level,
        });
        match self.fs.lock().open.get_mut(&file.get()) {
            Some(f) => {
                f.lock = f.lock.min(level);
                ffi::SQLITE_OK
            }
            None => ffi::SQLITE_IOERR_UNLOCK,
        }
    }

    fn io_check_reserved_lock(&self, vfs: VfsId, file: HostFileId, res_out: &mut c_int) -> c_int {
        self.record(HostCall::CheckReservedLock {
            vfs,
            file: file.get(),
        });
        let fs = self.fs.lock();
        let Some(path) = fs.open.get(&file.get()).map(|f| f.path.as_str()) else {
            return ffi::SQLITE_IOERR_CHECKRESERVEDLOCK;
        };
        let strongest = fs
            .open
            .values()
            .filter(|f| f.path == path)
            .map(|f| f.lock)
            .max()
            .unwrap_or(ffi::SQLITE_LOCK_NONE);
        *res_out = (strongest >= ffi::SQLITE_LOCK_RESERVED) as c_int;
        ffi::SQLITE_OK
    }

    fn io_file_control(
        &self,
        vfs: VfsId,
        file: HostFileId,
        op: c_int,
        _arg: *mut c_void,
    ) -> c_int {
        self.record(HostCall::FileControl {
            vfs,
            file: file.get(),
            op,
        });
        ffi::SQLITE_NOTFOUND
    }

    fn io_sector_size(&self, vfs: VfsId, file: HostFileId) -> c_int {
        self.record(HostCall::SectorSize {
            vfs,
            file: file.get(),
        });
        SECTOR_SIZE
    }

    fn io_device_characteristics(&self, vfs: VfsId, file: HostFileId) -> c_int {
        self.record(HostCall::DeviceCharacteristics {
            vfs,
            file: file.get(),
        });
        ffi::SQLITE_IOCAP_ATOMIC4K | ffi::SQLITE_IOCAP_SAFE_APPEND
    }

    fn function_func(&self, id: FunctionId, call: &mut Invocation<'_>) {
        let args = call.values();
        self.record(HostCall::FunctionFunc {
            id,
            args: args.clone(),
        });
        match self.body(id).as_deref() {
            Some(Body::Scalar(body)) => match body(&args) {
                Ok(value) => call.set_result(&value),
                Err(message) => call.set_error(&message),
            },
            Some(Body::Accumulate { .. }) => {
                call.set_error(&format!("function {} is not a scalar", id.0))
            }
            None => call.set_error(&format!("function {} has no body", id.0)),
        }
    }

    fn function_step(&self, id: FunctionId, call: &mut Invocation<'_>) {
        self.record(HostCall::FunctionStep {
            id,
            args: call.values(),
        });
        self.fold(id, call, false);
    }

    fn function_final(&self, id: FunctionId, call: &mut Invocation<'_>) {
        self.record(HostCall::FunctionFinal { id });
        self.finish(id, call, true);
    }

    fn function_value(&self, id: FunctionId, call: &mut Invocation<'_>) {
        self.record(HostCall::FunctionValue { id });
        self.finish(id, call, false);
    }

    fn function_inverse(&self, id: FunctionId, call: &mut Invocation<'_>) {
        self.record(HostCall::FunctionInverse {
            id,
            args: call.values(),
        });
        self.fold(id, call, true);
    }

    fn function_destroy(&self, id: FunctionId) {
        self.record(HostCall::FunctionDestroy { id });
    }

    fn exec_callback(&self, id: ExecutionId, row: &Row<'_>) -> c_int {
        let columns = row.to_pairs();
        self.record(HostCall::ExecRow {
            id,
            columns: columns.clone(),
        });
        let mut executions = self.executions.lock();
        let limit = executions.abort_after.get(&id).copied();
        let rows = executions.rows.entry(id).or_default();
        rows.push(columns);
        match limit {
            Some(limit) if rows.len() >= limit => 1,
            _ => 0,
        }
    }
}
