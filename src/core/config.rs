//! Bridge configuration
//!
//! Loaded from TOML:
//!
//! ```toml
//! default_vfs_name = "ext"
//! max_pathname = 256
//! forward_engine_log = false
//! ```
//!
//! Every field is optional; missing fields take the defaults above.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::os::raw::c_int;
use std::path::Path;
use validator::Validate;

/// Name used when a VFS is registered without one
pub const DEFAULT_VFS_NAME: &str = "ext";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Fallback name for `register_vfs(None, ..)`
    #[validate(length(min = 1, max = 64))]
    pub default_vfs_name: String,

    /// `mxPathname` advertised by every registered instance
    #[validate(range(min = 64, max = 4096))]
    pub max_pathname: c_int,

    /// Forward SQLite's log stream to the host on initialize
    pub forward_engine_log: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            default_vfs_name: DEFAULT_VFS_NAME.to_string(),
            max_pathname: crate::vfs::DEFAULT_MAX_PATHNAME,
            forward_engine_log: false,
        }
    }
}

impl BridgeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: BridgeConfig =
            toml::from_str(text).map_err(|e| BridgeError::Config(e.to_string()))?;
        config.validated()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Check field constraints, returning the config unchanged if they hold.
    pub fn validated(self) -> Result<Self> {
        self.validate()
            .map_err(|e| BridgeError::Config(e.to_string()))?;
        if self.default_vfs_name.contains('\0') {
            return Err(BridgeError::Config(
                "default_vfs_name cannot contain NUL".to_string(),
            ));
        }
        Ok(self)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| BridgeError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.default_vfs_name, "ext");
        assert_eq!(config.max_pathname, 256);
        assert!(!config.forward_engine_log);
        assert!(config.validated().is_ok());
    }

    #[test]
    fn test_partial_toml_takes_defaults() {
        let config = BridgeConfig::from_toml_str("max_pathname = 1024").unwrap();
        assert_eq!(config.max_pathname, 1024);
        assert_eq!(config.default_vfs_name, "ext");
    }

    #[test]
    fn test_empty_toml() {
        assert_eq!(BridgeConfig::from_toml_str("").unwrap(), BridgeConfig::default());
    }

    #[test]
    fn test_rejects_out_of_range_pathname() {
        let err = BridgeConfig::from_toml_str("max_pathname = 8").unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));

        let err = BridgeConfig::from_toml_str("max_pathname = 100000").unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn test_rejects_empty_name() {
        let err = BridgeConfig::from_toml_str("default_vfs_name = \"\"").unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn test_rejects_unknown_field() {
        let err = BridgeConfig::from_toml_str("page_size = 4096").unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn test_round_trip_through_file() {
        let config = BridgeConfig {
            default_vfs_name: "hostfs".to_string(),
            max_pathname: 512,
            forward_engine_log: true,
        };

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_toml_string().unwrap().as_bytes())
            .unwrap();

        let loaded = BridgeConfig::load(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file() {
        let err = BridgeConfig::load("/nonexistent/bridge.toml").unwrap_err();
        assert!(matches!(err, BridgeError::Io(_)));
    }
}
