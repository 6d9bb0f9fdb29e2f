//! Runtime configuration
//!
//! Loaded from JSON; every field has a default so an empty object is a
//! valid config.

use crate::error::InitError;
use bindhost_abi::Limits;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Import module the host functions are registered under.
    pub import_module: String,
    /// Upper bound on guest linear memory, in bytes.
    pub max_memory_bytes: Option<u64>,
    /// Fuel granted to each top-level guest call.
    pub fuel: Option<u64>,
    pub fetch_timeout_secs: u64,
    pub cache_modules: bool,
    pub limits: Limits,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            import_module: "wbg".to_string(),
            max_memory_bytes: None,
            fuel: None,
            fetch_timeout_secs: 30,
            cache_modules: true,
            limits: Limits::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_json_str(json: &str) -> Result<Self, InitError> {
        let config: Self = serde_json::from_str(json).map_err(|e| InitError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, InitError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), InitError> {
        if self.import_module.is_empty() {
            return Err(InitError::Config("import_module must not be empty".into()));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(InitError::Config("fetch_timeout_secs must be positive".into()));
        }
        if self.limits.max_slice_len == 0 || self.limits.max_buffer_len == 0 {
            return Err(InitError::Config("limits must be positive".into()));
        }
        if self.fuel == Some(0) {
            return Err(InitError::Config("fuel must be positive when set".into()));
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_uses_defaults() {
        let config = RuntimeConfig::from_json_str("{}").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.import_module, "wbg");
        assert_eq!(config.fetch_timeout(), Duration::from_secs(30));
        assert!(config.cache_modules);
    }

    #[test]
    fn json_roundtrip_keeps_values() {
        let config = RuntimeConfig {
            fuel: Some(10_000),
            max_memory_bytes: Some(4 << 20),
            ..RuntimeConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(RuntimeConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn partial_limits() {
        let config = RuntimeConfig::from_json_str(r#"{"limits": {"max_slice_len": 8}}"#).unwrap();
        assert_eq!(config.limits.max_slice_len, 8);
        assert_eq!(config.limits.max_buffer_len, Limits::default().max_buffer_len);
    }

    #[test]
    fn rejects_invalid_values() {
        for json in [
            r#"{"fetch_timeout_secs": 0}"#,
            r#"{"import_module": ""}"#,
            r#"{"limits": {"max_slice_len": 0}}"#,
            r#"{"fuel": 0}"#,
            r#"{"fetch_timeout_secs": "soon"}"#,
        ] {
            assert!(
                matches!(RuntimeConfig::from_json_str(json), Err(InitError::Config(_))),
                "{json} should be rejected"
            );
        }
    }
}
