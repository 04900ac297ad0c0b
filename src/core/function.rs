//! User-defined function dispatch
//!
//! Registers SQLite functions whose bodies live in the host. Each
//! registration carries a host [`FunctionId`]; the trampolines installed
//! with SQLite recover it from the function's user data and forward the
//! invocation to the matching [`Host`] method. Nothing is kept between
//! calls: aggregate accumulators belong to the host.
//!
//! Which trampolines a registration installs depends on its
//! [`FunctionMode`]:
//!
//! | mode      | entry points                            | host destroy |
//! |-----------|-----------------------------------------|--------------|
//! | Scalar    | func                                    | yes          |
//! | Aggregate | step, final                             | no           |
//! | Window    | step, final, value, inverse             | yes          |

use crate::error::{BridgeError, Result};
use crate::host::{FunctionId, Host};
use libsqlite3_sys as ffi;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::{Value, ValueRef};
use rusqlite::Connection;
use std::ffi::{CStr, CString};
use std::os::raw::{c_int, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;
use tracing::{debug, error, trace};

/// How a function is invoked by the engine
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionMode {
    Scalar = 0,
    Aggregate = 1,
    Window = 2,
}

impl TryFrom<c_int> for FunctionMode {
    type Error = BridgeError;

    fn try_from(mode: c_int) -> Result<Self> {
        match mode {
            0 => Ok(FunctionMode::Scalar),
            1 => Ok(FunctionMode::Aggregate),
            2 => Ok(FunctionMode::Window),
            other => Err(BridgeError::Misuse(format!(
                "unknown function mode {}",
                other
            ))),
        }
    }
}

/// Everything needed to register one host function
#[derive(Debug, Clone)]
pub struct FunctionSpec<'a> {
    pub name: &'a str,
    /// Number of arguments, -1 for any
    pub arity: c_int,
    pub flags: FunctionFlags,
    pub id: FunctionId,
    pub mode: FunctionMode,
}

impl<'a> FunctionSpec<'a> {
    pub fn new(name: &'a str, arity: c_int, id: FunctionId, mode: FunctionMode) -> Self {
        Self {
            name,
            arity,
            flags: FunctionFlags::SQLITE_UTF8,
            id,
            mode,
        }
    }

    pub fn flags(mut self, flags: FunctionFlags) -> Self {
        self.flags = flags;
        self
    }
}

type ArgsFn = unsafe extern "C" fn(*mut ffi::sqlite3_context, c_int, *mut *mut ffi::sqlite3_value);
type ResultFn = unsafe extern "C" fn(*mut ffi::sqlite3_context);
type DestroyFn = unsafe extern "C" fn(*mut c_void);

/// Entry points installed for one mode, and only those
enum Trampolines {
    Scalar {
        func: ArgsFn,
        destroy: DestroyFn,
    },
    Aggregate {
        step: ArgsFn,
        finalize: ResultFn,
    },
    Window {
        step: ArgsFn,
        finalize: ResultFn,
        value: ResultFn,
        inverse: ArgsFn,
        destroy: DestroyFn,
    },
}

impl Trampolines {
    fn for_mode(mode: FunctionMode) -> Self {
        match mode {
            FunctionMode::Scalar => Trampolines::Scalar {
                func: call_func,
                destroy: destroy_binding,
            },
            FunctionMode::Aggregate => Trampolines::Aggregate {
                step: call_step,
                finalize: call_final,
            },
            FunctionMode::Window => Trampolines::Window {
                step: call_step,
                finalize: call_final,
                value: call_value,
                inverse: call_inverse,
                destroy: destroy_binding,
            },
        }
    }
}

/// User data attached to a registration
struct Binding {
    id: FunctionId,
    host: Arc<dyn Host>,
}

/// Register a host function on `conn`.
///
/// On failure nothing stays registered. SQLite runs the destroy
/// trampoline for a registration it rejects, so for scalar and window
/// modes the host sees `function_destroy` in that case too.
pub fn register(conn: &Connection, host: &Arc<dyn Host>, spec: &FunctionSpec<'_>) -> Result<()> {
    let name = CString::new(spec.name).map_err(|_| {
        BridgeError::Misuse(format!("function name {:?} contains NUL", spec.name))
    })?;
    let binding = Box::into_raw(Box::new(Binding {
        id: spec.id,
        host: Arc::clone(host),
    })) as *mut c_void;
    let flags = spec.flags.bits();

    // SAFETY: the handle stays valid for the borrow of `conn`; ownership of
    // `binding` passes to SQLite, which releases it through the destroy
    // callback on both success and failure.
    let rc = unsafe {
        let db = conn.handle();
        match Trampolines::for_mode(spec.mode) {
            Trampolines::Scalar { func, destroy } => ffi::sqlite3_create_function_v2(
                db,
                name.as_ptr(),
                spec.arity,
                flags,
                binding,
                Some(func),
                None,
                None,
                Some(destroy),
            ),
            Trampolines::Aggregate { step, finalize } => ffi::sqlite3_create_function_v2(
                db,
                name.as_ptr(),
                spec.arity,
                flags,
                binding,
                None,
                Some(step),
                Some(finalize),
                // Frees the binding without telling the host
                Some(release_binding),
            ),
            Trampolines::Window {
                step,
                finalize,
                value,
                inverse,
                destroy,
            } => ffi::sqlite3_create_window_function(
                db,
                name.as_ptr(),
                spec.arity,
                flags,
                binding,
                Some(step),
                Some(finalize),
                Some(value),
                Some(inverse),
                Some(destroy),
            ),
        }
    };

    if rc != ffi::SQLITE_OK {
        let message = unsafe { engine_message(conn.handle()) };
        debug!(name = spec.name, code = rc, %message, "function registration rejected");
        return Err(BridgeError::Engine { code: rc, message });
    }
    debug!(name = spec.name, id = spec.id.0, mode = ?spec.mode, arity = spec.arity, "registered function");
    Ok(())
}

/// Register with a raw mode value as it arrives over the boundary.
///
/// Unknown modes are rejected before anything is allocated or registered.
pub fn register_raw(
    conn: &Connection,
    host: &Arc<dyn Host>,
    name: &str,
    arity: c_int,
    text_rep: c_int,
    id: FunctionId,
    mode: c_int,
) -> Result<()> {
    let mode = FunctionMode::try_from(mode)?;
    let spec = FunctionSpec {
        name,
        arity,
        flags: FunctionFlags::from_bits_truncate(text_rep),
        id,
        mode,
    };
    register(conn, host, &spec)
}

unsafe fn engine_message(db: *mut ffi::sqlite3) -> String {
    let msg = ffi::sqlite3_errmsg(db);
    if msg.is_null() {
        String::new()
    } else {
        CStr::from_ptr(msg).to_string_lossy().into_owned()
    }
}

/// One engine invocation of a host function
///
/// Wraps the engine's result context and argument vector for the duration
/// of a single trampoline call.
pub struct Invocation<'a> {
    ctx: *mut ffi::sqlite3_context,
    args: &'a [*mut ffi::sqlite3_value],
}

impl<'a> Invocation<'a> {
    fn new(ctx: *mut ffi::sqlite3_context, args: &'a [*mut ffi::sqlite3_value]) -> Self {
        Self { ctx, args }
    }

    pub fn argc(&self) -> usize {
        self.args.len()
    }

    /// The argument vector exactly as the engine passed it.
    pub fn raw_args(&self) -> &'a [*mut ffi::sqlite3_value] {
        self.args
    }

    pub fn arg(&self, index: usize) -> Option<ValueRef<'a>> {
        let value = *self.args.get(index)?;
        // SAFETY: argv entries stay valid for the whole invocation.
        Some(unsafe { value_ref(value) })
    }

    pub fn args(&self) -> impl Iterator<Item = ValueRef<'a>> + '_ {
        (0..self.argc()).filter_map(move |i| self.arg(i))
    }

    /// Owned copies of all arguments.
    pub fn values(&self) -> Vec<Value> {
        self.args().map(Value::from).collect()
    }

    pub fn set_result(&mut self, value: &Value) {
        // SAFETY: ctx is the live context of this invocation; SQLITE_TRANSIENT
        // makes the engine copy text and blobs.
        unsafe {
            match value {
                Value::Null => ffi::sqlite3_result_null(self.ctx),
                Value::Integer(i) => ffi::sqlite3_result_int64(self.ctx, *i),
                Value::Real(r) => ffi::sqlite3_result_double(self.ctx, *r),
                Value::Text(s) => ffi::sqlite3_result_text64(
                    self.ctx,
                    s.as_ptr() as *const _,
                    s.len() as ffi::sqlite3_uint64,
                    ffi::SQLITE_TRANSIENT(),
                    ffi::SQLITE_UTF8 as u8,
                ),
                Value::Blob(b) => ffi::sqlite3_result_blob64(
                    self.ctx,
                    b.as_ptr() as *const c_void,
                    b.len() as ffi::sqlite3_uint64,
                    ffi::SQLITE_TRANSIENT(),
                ),
            }
        }
    }

    pub fn set_error(&mut self, message: &str) {
        let len = message.len().min(c_int::MAX as usize) as c_int;
        unsafe { ffi::sqlite3_result_error(self.ctx, message.as_ptr() as *const _, len) }
    }

    pub fn set_error_code(&mut self, code: c_int) {
        unsafe { ffi::sqlite3_result_error_code(self.ctx, code) }
    }

    /// Engine-owned slot shared by every call for the current aggregate
    /// group, zero on first use.
    ///
    /// Only meaningful in step/final/value/inverse calls. `None` if the
    /// engine could not allocate it.
    pub fn aggregate_slot(&mut self) -> Option<&mut u64> {
        unsafe {
            let slot = ffi::sqlite3_aggregate_context(self.ctx, std::mem::size_of::<u64>() as c_int)
                as *mut u64;
            slot.as_mut()
        }
    }
}

unsafe fn value_ref<'a>(value: *mut ffi::sqlite3_value) -> ValueRef<'a> {
    match ffi::sqlite3_value_type(value) {
        ffi::SQLITE_INTEGER => ValueRef::Integer(ffi::sqlite3_value_int64(value)),
        ffi::SQLITE_FLOAT => ValueRef::Real(ffi::sqlite3_value_double(value)),
        ffi::SQLITE_TEXT => {
            let text = ffi::sqlite3_value_text(value);
            let len = ffi::sqlite3_value_bytes(value);
            if text.is_null() || len <= 0 {
                ValueRef::Text(&[])
            } else {
                ValueRef::Text(std::slice::from_raw_parts(text, len as usize))
            }
        }
        ffi::SQLITE_BLOB => {
            let blob = ffi::sqlite3_value_blob(value) as *const u8;
            let len = ffi::sqlite3_value_bytes(value);
            if blob.is_null() || len <= 0 {
                ValueRef::Blob(&[])
            } else {
                ValueRef::Blob(std::slice::from_raw_parts(blob, len as usize))
            }
        }
        _ => ValueRef::Null,
    }
}

// Trampolines

unsafe fn dispatch(
    kind: &'static str,
    ctx: *mut ffi::sqlite3_context,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
    forward: impl FnOnce(&dyn Host, FunctionId, &mut Invocation<'_>),
) {
    let binding = ffi::sqlite3_user_data(ctx) as *const Binding;
    if binding.is_null() {
        ffi::sqlite3_result_error_code(ctx, ffi::SQLITE_MISUSE);
        return;
    }
    let binding = &*binding;

    let args: &[*mut ffi::sqlite3_value] = if argv.is_null() || argc <= 0 {
        &[]
    } else {
        std::slice::from_raw_parts(argv, argc as usize)
    };
    let mut call = Invocation::new(ctx, args);
    trace!(function = binding.id.0, kind, argc, "forwarding invocation");

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        forward(binding.host.as_ref(), binding.id, &mut call)
    }));
    if outcome.is_err() {
        error!(function = binding.id.0, kind, "host panicked during function call");
        call.set_error("host function panicked");
    }
}

unsafe extern "C" fn call_func(
    ctx: *mut ffi::sqlite3_context,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) {
    dispatch("func", ctx, argc, argv, |host, id, call| host.function_func(id, call))
}

unsafe extern "C" fn call_step(
    ctx: *mut ffi::sqlite3_context,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) {
    dispatch("step", ctx, argc, argv, |host, id, call| host.function_step(id, call))
}

unsafe extern "C" fn call_inverse(
    ctx: *mut ffi::sqlite3_context,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) {
    dispatch("inverse", ctx, argc, argv, |host, id, call| host.function_inverse(id, call))
}

unsafe extern "C" fn call_final(ctx: *mut ffi::sqlite3_context) {
    dispatch("final", ctx, 0, ptr::null_mut(), |host, id, call| host.function_final(id, call))
}

unsafe extern "C" fn call_value(ctx: *mut ffi::sqlite3_context) {
    dispatch("value", ctx, 0, ptr::null_mut(), |host, id, call| host.function_value(id, call))
}

unsafe extern "C" fn destroy_binding(p: *mut c_void) {
    if p.is_null() {
        return;
    }
    let binding = Box::from_raw(p as *mut Binding);
    trace!(function = binding.id.0, "destroy");
    let id = binding.id;
    let host = Arc::clone(&binding.host);
    drop(binding);
    if panic::catch_unwind(AssertUnwindSafe(|| host.function_destroy(id))).is_err() {
        error!(function = id.0, "host panicked during function destroy");
    }
}

unsafe extern "C" fn release_binding(p: *mut c_void) {
    if !p.is_null() {
        drop(Box::from_raw(p as *mut Binding));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_from_raw() {
        assert_eq!(FunctionMode::try_from(0).unwrap(), FunctionMode::Scalar);
        assert_eq!(FunctionMode::try_from(1).unwrap(), FunctionMode::Aggregate);
        assert_eq!(FunctionMode::try_from(2).unwrap(), FunctionMode::Window);
        assert!(FunctionMode::try_from(3).unwrap_err().is_misuse());
        assert!(FunctionMode::try_from(-1).unwrap_err().is_misuse());
    }

    #[test]
    fn test_trampoline_shapes() {
        assert!(matches!(
            Trampolines::for_mode(FunctionMode::Scalar),
            Trampolines::Scalar { .. }
        ));
        assert!(matches!(
            Trampolines::for_mode(FunctionMode::Aggregate),
            Trampolines::Aggregate { .. }
        ));
        assert!(matches!(
            Trampolines::for_mode(FunctionMode::Window),
            Trampolines::Window { .. }
        ));
    }

    #[test]
    fn test_spec_defaults_to_utf8() {
        let spec = FunctionSpec::new("f", 1, FunctionId(1), FunctionMode::Scalar);
        assert_eq!(spec.flags, FunctionFlags::SQLITE_UTF8);

        let spec = spec.flags(FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC);
        assert!(spec.flags.contains(FunctionFlags::SQLITE_DETERMINISTIC));
    }
}
