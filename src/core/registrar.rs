//! Registrar: the bridge's context object
//!
//! A [`Registrar`] owns the host handle and configuration and is the only
//! way to create VFS instances, register host functions and run ad-hoc
//! SQL. Components get the host from it at construction time; there is no
//! global routines table.
//!
//! Lifecycle:
//!
//! 1. [`Registrar::new`] validates the config and stores it with the host
//! 2. [`Registrar::initialize`] installs the engine log sink (if configured)
//!    and calls the host's `os_init`, once
//! 3. instances move `Unregistered → Registered → Unregistered` through
//!    [`Registrar::register_vfs`] / [`Registrar::unregister_vfs`]
//! 4. [`Registrar::shutdown`] calls `os_end`; dropping the registrar
//!    unregisters what is left and shuts down
//!
//! Every connection opened on an instance must be closed before that
//! instance is unregistered. An instance that still has open files when the
//! registrar is dropped stays registered and is leaked.

use crate::config::BridgeConfig;
use crate::engine_log;
use crate::error::{BridgeError, Result};
use crate::exec;
use crate::function::{self, FunctionSpec};
use crate::handle::HandleTable;
use crate::host::{ExecutionId, FunctionId, Host, VfsId};
use crate::vfs::{method_table, HostFile, HostVfs};
use libsqlite3_sys as ffi;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::ffi::{CStr, CString};
use std::os::raw::c_int;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A registered VFS, as handed back to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfsInstance {
    id: VfsId,
    name: String,
    is_default: bool,
    max_pathname: c_int,
}

impl VfsInstance {
    pub fn id(&self) -> VfsId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether it was registered as the engine's default
    pub fn is_default(&self) -> bool {
        self.is_default
    }

    pub fn max_pathname(&self) -> c_int {
        self.max_pathname
    }

    /// Bytes the engine allocates per open file
    pub fn file_handle_size(&self) -> usize {
        std::mem::size_of::<HostFile>()
    }
}

/// Allocations behind one registered instance
struct Registration {
    name: String,
    vfs: NonNull<ffi::sqlite3_vfs>,
    state: NonNull<HostVfs>,
}

// SAFETY: both pointers come from boxes owned by the registration; SQLite
// only reads them (and pNext under its own mutex).
unsafe impl Send for Registration {}

impl Registration {
    /// Free both allocations.
    ///
    /// # Safety
    /// The VFS must no longer be registered with SQLite.
    unsafe fn release(self) {
        drop(Box::from_raw(self.vfs.as_ptr()));
        drop(Box::from_raw(self.state.as_ptr()));
    }
}

pub struct Registrar {
    host: Arc<dyn Host>,
    config: BridgeConfig,
    instances: Mutex<HandleTable<Registration>>,
    initialized: AtomicBool,
}

impl Registrar {
    /// Fails with [`BridgeError::Config`] if `config` breaks its field constraints.
    pub fn new(host: Arc<dyn Host>, config: BridgeConfig) -> Result<Self> {
        Ok(Self::from_parts(host, config.validated()?))
    }

    pub fn with_defaults(host: Arc<dyn Host>) -> Self {
        Self::from_parts(host, BridgeConfig::default())
    }

    fn from_parts(host: Arc<dyn Host>, config: BridgeConfig) -> Self {
        Self {
            host,
            config,
            instances: Mutex::new(HandleTable::new()),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Run the host's `os_init` once. Later calls are no-ops.
    pub fn initialize(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if self.config.forward_engine_log {
            if let Err(e) = engine_log::install(Arc::clone(&self.host)) {
                self.initialized.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }

        if let Err(e) = BridgeError::check(self.host.os_init()) {
            self.initialized.store(false, Ordering::SeqCst);
            return Err(e);
        }
        info!("bridge initialized");
        Ok(())
    }

    /// Run the host's `os_end` if initialized.
    pub fn shutdown(&self) -> Result<()> {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        BridgeError::check(self.host.os_end())?;
        info!("bridge shut down");
        Ok(())
    }

    /// Create a VFS instance and register it with SQLite.
    ///
    /// An absent or empty `name` falls back to `config.default_vfs_name`.
    /// Only the name copy reports [`BridgeError::OutOfMemory`]; the instance
    /// state and method table come from the global allocator, which aborts.
    pub fn register_vfs(&self, name: Option<&str>, make_default: bool) -> Result<VfsInstance> {
        let name = match name {
            Some(n) if !n.is_empty() => n,
            _ => self.config.default_vfs_name.as_str(),
        };
        let name_copy = copy_name(name)?;

        let mut instances = self.instances.lock();
        if instances.iter().any(|(_, r)| r.name == name) {
            return Err(BridgeError::Misuse(format!(
                "VFS '{}' is already registered",
                name
            )));
        }

        let max_pathname = self.config.max_pathname;
        let host = Arc::clone(&self.host);
        let mut registered = Err(BridgeError::misuse("registration did not run"));

        let key = instances.insert_with(|key| {
            let state = Box::into_raw(Box::new(HostVfs::new(VfsId::new(key), name_copy, host)));
            let vfs = Box::into_raw(Box::new(method_table(state, max_pathname)));

            // SAFETY: `vfs` is fully initialised and stays allocated until
            // unregistered.
            let rc = unsafe { ffi::sqlite3_vfs_register(vfs, make_default as c_int) };
            registered = if rc == ffi::SQLITE_OK {
                Ok(())
            } else {
                Err(BridgeError::Engine {
                    code: rc,
                    message: format!("sqlite3_vfs_register failed for '{}'", name),
                })
            };

            // SAFETY: non-null, straight from Box::into_raw
            unsafe {
                Registration {
                    name: name.to_string(),
                    vfs: NonNull::new_unchecked(vfs),
                    state: NonNull::new_unchecked(state),
                }
            }
        });

        if let Err(e) = registered {
            if let Some(registration) = instances.remove(key) {
                // SAFETY: SQLite refused the VFS, it holds no reference.
                unsafe { registration.release() };
            }
            warn!(name, error = %e, "VFS registration failed");
            return Err(e);
        }

        let instance = VfsInstance {
            id: VfsId::new(key),
            name: name.to_string(),
            is_default: make_default,
            max_pathname,
        };
        info!(name, id = %instance.id, make_default, "registered VFS");
        Ok(instance)
    }

    /// Remove an instance from SQLite and free it.
    ///
    /// Stale instances and instances with open files are rejected without
    /// touching the engine. A failed engine unregister leaves the instance
    /// fully registered.
    pub fn unregister_vfs(&self, instance: &VfsInstance) -> Result<()> {
        let key = instance.id.key();
        let mut instances = self.instances.lock();

        let registration = instances.get(key).ok_or_else(|| {
            BridgeError::Misuse(format!(
                "VFS '{}' ({}) is not registered here",
                instance.name, instance.id
            ))
        })?;

        // SAFETY: the state lives as long as the registration.
        let open = unsafe { registration.state.as_ref() }.open_files();
        if open > 0 {
            return Err(BridgeError::Misuse(format!(
                "VFS '{}' still has {} open file(s)",
                instance.name, open
            )));
        }

        let rc = unsafe { ffi::sqlite3_vfs_unregister(registration.vfs.as_ptr()) };
        if rc != ffi::SQLITE_OK {
            return Err(BridgeError::Engine {
                code: rc,
                message: format!("sqlite3_vfs_unregister failed for '{}'", instance.name),
            });
        }

        if let Some(registration) = instances.remove(key) {
            // SAFETY: no longer registered.
            unsafe { registration.release() };
        }
        info!(name = %instance.name, id = %instance.id, "unregistered VFS");
        Ok(())
    }

    /// Number of instances currently registered through this registrar.
    pub fn instance_count(&self) -> usize {
        self.instances.lock().len()
    }

    /// Raw engine VFS pointer for a live instance.
    pub fn vfs_ptr(&self, instance: &VfsInstance) -> Option<*mut ffi::sqlite3_vfs> {
        self.instances
            .lock()
            .get(instance.id.key())
            .map(|r| r.vfs.as_ptr())
    }

    /// Register a host function on `conn`.
    pub fn create_function(&self, conn: &Connection, spec: &FunctionSpec<'_>) -> Result<()> {
        function::register(conn, &self.host, spec)
    }

    /// Register a host function with the raw boundary arguments.
    pub fn create_function_raw(
        &self,
        conn: &Connection,
        name: &str,
        arity: c_int,
        text_rep: c_int,
        id: FunctionId,
        mode: c_int,
    ) -> Result<()> {
        function::register_raw(conn, &self.host, name, arity, text_rep, id, mode)
    }

    /// Run `sql` on `conn`, delivering rows to the host under `id`.
    pub fn execute(&self, conn: &Connection, sql: &str, id: ExecutionId) -> Result<()> {
        exec::execute(conn, self.host.as_ref(), sql, id)
    }
}

impl Drop for Registrar {
    fn drop(&mut self) {
        let mut instances = self.instances.lock();
        for key in instances.keys() {
            let Some(registration) = instances.get(key) else {
                continue;
            };
            // SAFETY: the state lives as long as the registration.
            let open = unsafe { registration.state.as_ref() }.open_files();
            if open > 0 {
                // Open files still point at the state; leak rather than free.
                warn!(name = %registration.name, open, "VFS still has open files on drop");
                continue;
            }
            let rc = unsafe { ffi::sqlite3_vfs_unregister(registration.vfs.as_ptr()) };
            if rc != ffi::SQLITE_OK {
                // Still reachable from the engine; leak rather than free.
                warn!(name = %registration.name, code = rc, "could not unregister VFS on drop");
                continue;
            }
            if let Some(registration) = instances.remove(key) {
                debug!(name = %registration.name, "unregistered VFS on drop");
                unsafe { registration.release() };
            }
        }
        drop(instances);

        if let Err(e) = self.shutdown() {
            warn!(error = %e, "host os_end failed during drop");
        }
    }
}

/// Copy a VFS name into adapter-owned storage.
fn copy_name(name: &str) -> Result<CString> {
    if name.contains('\0') {
        return Err(BridgeError::Misuse(format!(
            "VFS name {:?} contains NUL",
            name
        )));
    }
    let mut bytes = Vec::new();
    bytes
        .try_reserve_exact(name.len() + 1)
        .map_err(|_| BridgeError::OutOfMemory(format!("copying VFS name '{}'", name)))?;
    bytes.extend_from_slice(name.as_bytes());
    // Interior NULs were ruled out above
    CString::new(bytes).map_err(|e| BridgeError::Misuse(e.to_string()))
}

/// Whether SQLite currently knows a VFS called `name`.
pub fn engine_has_vfs(name: &str) -> bool {
    let Ok(name) = CString::new(name) else {
        return false;
    };
    unsafe { !ffi::sqlite3_vfs_find(name.as_ptr()).is_null() }
}

/// Name of SQLite's current default VFS.
pub fn engine_default_vfs() -> Option<String> {
    unsafe {
        let vfs = ffi::sqlite3_vfs_find(std::ptr::null());
        if vfs.is_null() || (*vfs).zName.is_null() {
            return None;
        }
        Some(CStr::from_ptr((*vfs).zName).to_string_lossy().into_owned())
    }
}
