//! Error types for the adapter layer
//!
//! Every failure is eventually reported to SQLite as an integer status code.
//! `BridgeError` keeps the category around while the error travels through
//! Rust code, and [`BridgeError::code`] turns it back into the engine's
//! vocabulary at the FFI edge.

use libsqlite3_sys as ffi;
use std::os::raw::c_int;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    /// Protocol violation on either side of the boundary
    #[error("Misuse: {0}")]
    Misuse(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// Status returned verbatim by the host
    #[error("Host reported status {0}")]
    HostReported(c_int),

    /// Host status in the SQLITE_IOERR family
    #[error("I/O failure reported by host: {0}")]
    IoFailure(c_int),

    /// Status produced by SQLite itself
    #[error("Engine error {code}: {message}")]
    Engine { code: c_int, message: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    pub(crate) fn misuse(reason: impl Into<String>) -> Self {
        BridgeError::Misuse(reason.into())
    }

    /// Classify a status code returned by the host.
    ///
    /// `SQLITE_OK` is success. Codes whose primary code is `SQLITE_IOERR`
    /// (including extended codes such as `SQLITE_IOERR_SHORT_READ`) become
    /// [`BridgeError::IoFailure`]; anything else is carried verbatim as
    /// [`BridgeError::HostReported`].
    pub fn check(rc: c_int) -> Result<()> {
        match rc {
            ffi::SQLITE_OK => Ok(()),
            rc if rc & 0xff == ffi::SQLITE_IOERR => Err(BridgeError::IoFailure(rc)),
            rc => Err(BridgeError::HostReported(rc)),
        }
    }

    /// The engine status code this error is reported as.
    ///
    /// Host statuses round-trip unchanged.
    pub fn code(&self) -> c_int {
        match self {
            BridgeError::Misuse(_) | BridgeError::Config(_) => ffi::SQLITE_MISUSE,
            BridgeError::OutOfMemory(_) => ffi::SQLITE_NOMEM,
            BridgeError::HostReported(rc) | BridgeError::IoFailure(rc) => *rc,
            BridgeError::Engine { code, .. } => *code,
            BridgeError::Io(_) => ffi::SQLITE_IOERR,
        }
    }

    pub fn is_misuse(&self) -> bool {
        self.code() == ffi::SQLITE_MISUSE
    }
}

/// Collapse a result into the status code handed back to SQLite.
pub(crate) fn status_code(result: Result<()>) -> c_int {
    match result {
        Ok(()) => ffi::SQLITE_OK,
        Err(e) => e.code(),
    }
}
