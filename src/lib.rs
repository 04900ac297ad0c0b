//! # sqlite-host-bridge - SQLite Adapters for an External Host
//!
//! `sqlite-host-bridge` plugs SQLite into a host that lives across a flat
//! call boundary (a WebAssembly embedder, a sandbox supervisor, a test
//! harness). SQLite only sees its usual extension points:
//!
//! - **VFS**: a `sqlite3_vfs` whose file and OS primitives are forwarded to the host
//! - **Functions**: scalar, aggregate and window functions with host bodies
//! - **Exec**: ad-hoc SQL whose result rows are delivered to a host callback
//! - **Engine log**: SQLite's diagnostic stream forwarded to the host logger
//!
//! The host implements [`Host`]; opaque integer identifiers, never native
//! pointers, cross the boundary.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rusqlite::{Connection, OpenFlags};
//! use sqlite_host_bridge::{MemoryHost, Registrar, Result};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<()> {
//! let host = Arc::new(MemoryHost::new());
//! let registrar = Registrar::with_defaults(host.clone());
//! registrar.initialize()?;
//!
//! let vfs = registrar.register_vfs(Some("memhost"), false)?;
//! let conn = Connection::open_with_flags_and_vfs(
//!     "/app.db",
//!     OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
//!     vfs.name(),
//! )
//! .expect("open");
//! conn.execute_batch("CREATE TABLE t(x); INSERT INTO t VALUES (1);")
//!     .expect("sql");
//! drop(conn);
//!
//! assert!(host.file_exists("/app.db"));
//! registrar.unregister_vfs(&vfs)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Host Functions
//!
//! ```rust,no_run
//! use rusqlite::types::Value;
//! use rusqlite::Connection;
//! use sqlite_host_bridge::{FunctionId, FunctionMode, FunctionSpec, MemoryHost, Registrar, Result};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<()> {
//! let host = Arc::new(MemoryHost::new());
//! host.define_scalar(FunctionId(1), |args| match args {
//!     [Value::Integer(i)] => Ok(Value::Integer(i * 2)),
//!     _ => Err("expected an integer".to_string()),
//! });
//!
//! let registrar = Registrar::with_defaults(host.clone());
//! let conn = Connection::open_in_memory().expect("open");
//! registrar.create_function(
//!     &conn,
//!     &FunctionSpec::new("double", 1, FunctionId(1), FunctionMode::Scalar),
//! )?;
//! # Ok(())
//! # }
//! ```

pub mod core;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use core::{config, engine_log, error, exec, function, handle, host, registrar, vfs};

pub use crate::core::{
    config::BridgeConfig,
    error::{BridgeError, Result},
    exec::Row,
    function::{FunctionMode, FunctionSpec, Invocation},
    handle::{HandleKey, HandleTable},
    host::{
        write_c_string, ExecutionId, FunctionId, Host, HostCall, HostFileId, MemoryHost,
        OpenReply, VfsId,
    },
    registrar::{Registrar, VfsInstance},
    vfs::{HostFile, DEFAULT_MAX_PATHNAME},
};
