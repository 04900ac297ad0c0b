//! Engine log forwarding
//!
//! The log sink is process-wide, so this binary holds a single test.

use rusqlite::ffi;
use sqlite_host_bridge::{BridgeConfig, MemoryHost, Registrar};
use std::ffi::CString;
use std::sync::Arc;

#[test]
fn test_engine_log_reaches_host() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let host = Arc::new(MemoryHost::new());
    let config = BridgeConfig::from_toml_str("forward_engine_log = true").unwrap();
    let registrar = Registrar::new(host.clone(), config).unwrap();
    registrar.initialize().unwrap();
    assert!(sqlite_host_bridge::core::engine_log::is_installed());

    let format = CString::new("%s").unwrap();
    let message = CString::new("hello from the engine").unwrap();
    unsafe { ffi::sqlite3_log(ffi::SQLITE_WARNING, format.as_ptr(), message.as_ptr()) };

    let logs = host.logs();
    assert!(logs
        .iter()
        .any(|line| line == &format!("({}) hello from the engine", ffi::SQLITE_WARNING)));

    // A second registrar keeps the first sink
    let other = Arc::new(MemoryHost::new());
    let config = BridgeConfig::from_toml_str("forward_engine_log = true").unwrap();
    let second = Registrar::new(other.clone(), config).unwrap();
    second.initialize().unwrap();
    unsafe { ffi::sqlite3_log(ffi::SQLITE_NOTICE, format.as_ptr(), message.as_ptr()) };
    assert!(other.logs().is_empty());
    assert_eq!(host.logs().len(), logs.len() + 1);
}
