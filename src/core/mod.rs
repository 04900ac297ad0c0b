//! Bridge internals
//!
//! - [`error`] - Error type and SQLite status mapping
//! - [`handle`] - Generation-counted handle tables for opaque identifiers
//! - [`host`] - The [`host::Host`] import table and the in-memory reference host
//! - [`vfs`] - `sqlite3_vfs` / `sqlite3_io_methods` forwarding to the host
//! - [`function`] - Scalar, aggregate and window function trampolines
//! - [`exec`] - `sqlite3_exec` with host row delivery
//! - [`engine_log`] - Forwarding of SQLite's error log
//! - [`config`] - TOML configuration
//! - [`registrar`] - Lifecycle and registration entry points

pub mod config;
pub mod engine_log;
pub mod error;
pub mod exec;
pub mod function;
pub mod handle;
pub mod host;
pub mod registrar;
pub mod vfs;

pub use registrar::{Registrar, VfsInstance};
