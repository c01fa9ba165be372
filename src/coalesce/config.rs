//! Coalescing Stream Configuration
//!
//! Buffer capacity and sink behaviour. Loadable from environment variables
//! or a TOML document; every field has a default.

use crate::coalesce::error::CoalesceError;
use serde::{Deserialize, Serialize};

/// Configuration for a coalescing stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoalesceConfig {
    /// Byte capacity of the packet buffer before producers are paused
    /// (0 = unbounded, default: 16MB). Size it around
    /// expected concurrent producers x average packet size.
    pub memory_cap_bytes: u64,
    /// Issue fsync on file sinks as part of `flush()` (default: false)
    pub sync_on_flush: bool,
    /// Write buffer in front of file sinks (0 = unbuffered, default: 64KB)
    pub file_buffer_bytes: usize,
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        CoalesceConfig {
            memory_cap_bytes: 16 * 1024 * 1024, // 16MB
            sync_on_flush: false,
            file_buffer_bytes: 64 * 1024, // 64KB
        }
    }
}

impl CoalesceConfig {
    /// Configuration for testing (tiny cap so backpressure kicks in)
    pub fn test() -> Self {
        CoalesceConfig {
            memory_cap_bytes: 64,
            sync_on_flush: false,
            file_buffer_bytes: 0,
        }
    }

    /// Producers are never paused
    pub fn unbounded() -> Self {
        CoalesceConfig {
            memory_cap_bytes: 0,
            ..Default::default()
        }
    }

    pub fn with_memory_cap(memory_cap_bytes: u64) -> Self {
        CoalesceConfig {
            memory_cap_bytes,
            ..Default::default()
        }
    }

    /// Load configuration from environment variables, falling back to defaults
    ///
    /// - `COALESCE_MEMORY_CAP_BYTES`
    /// - `COALESCE_SYNC_ON_FLUSH` (`true`/`1`)
    /// - `COALESCE_FILE_BUFFER_BYTES`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        CoalesceConfig {
            memory_cap_bytes: std::env::var("COALESCE_MEMORY_CAP_BYTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.memory_cap_bytes),
            sync_on_flush: std::env::var("COALESCE_SYNC_ON_FLUSH")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.sync_on_flush),
            file_buffer_bytes: std::env::var("COALESCE_FILE_BUFFER_BYTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.file_buffer_bytes),
        }
    }

    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(doc: &str) -> Result<Self, CoalesceError> {
        toml::from_str(doc).map_err(|e| CoalesceError::InvalidConfig(e.to_string()))
    }

    pub fn is_bounded(&self) -> bool {
        self.memory_cap_bytes > 0
    }
}
