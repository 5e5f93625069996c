//! Trace runtime configuration
//!
//! Loaded once per runtime instance; the C ABI reads it from the file named
//! by `PMTRACE_CONFIG` and falls back to the defaults.

use super::buffer::BufferPolicy;
use super::filter::{FilterMode, USER_SPACE_LIMIT};
use super::record::MAX_RECORD_LEN;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Largest stored value recorded, 100 MiB
pub const MAX_VALUE_LEN: u64 = 104_857_600;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read runtime config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse runtime config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid runtime config: {0}")]
    Invalid(String),
}

/// Runtime configuration
///
/// # Example
/// ```
/// use pmtrace::runtime::RuntimeConfig;
///
/// let config: RuntimeConfig = toml::from_str(r#"
///     event_path = "/tmp/t.func.trace"
///     address_filter = "persistent_only"
///
///     [buffer]
///     kind = "bounded"
///     capacity = 4096
/// "#).unwrap();
/// assert!(config.validate().is_ok());
/// assert_eq!(config.max_record_len, 512);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Text event stream
    pub event_path: PathBuf,

    /// Binary stored-value stream
    pub value_path: PathBuf,

    /// Values longer than this are dropped with a warning
    pub max_value_len: u64,

    /// Event lines are cut to this many bytes
    pub max_record_len: usize,

    pub address_filter: FilterMode,

    /// Addresses below this are never dereferenced
    pub user_space_limit: u64,

    /// Policy of both pending buffers
    pub buffer: BufferPolicy,

    /// Emit a `file/line/col/code` line after events that carry one
    pub emit_source_locations: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            event_path: PathBuf::from("/tmp/pmtrace.func.trace"),
            value_path: PathBuf::from("/tmp/pmtrace.storevalue.trace"),
            max_value_len: MAX_VALUE_LEN,
            max_record_len: MAX_RECORD_LEN,
            address_filter: FilterMode::All,
            user_space_limit: USER_SPACE_LIMIT,
            buffer: BufferPolicy::Unbounded,
            emit_source_locations: false,
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    /// Both streams written to `dir` under the default file names
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            event_path: dir.join("pmtrace.func.trace"),
            value_path: dir.join("pmtrace.storevalue.trace"),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.event_path == self.value_path {
            return Err(format!(
                "event and value streams share the path {}",
                self.event_path.display()
            ));
        }
        if self.max_value_len > MAX_VALUE_LEN {
            return Err(format!(
                "max_value_len {} exceeds the {MAX_VALUE_LEN} byte limit",
                self.max_value_len
            ));
        }
        if self.max_record_len < 2 {
            return Err("max_record_len must hold at least one character and a newline".into());
        }
        if let BufferPolicy::Bounded { capacity: 0 } = self.buffer {
            return Err("bounded buffer capacity must be positive".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_value_len, 104_857_600);
        assert_eq!(config.user_space_limit, 0x8000_0000_0000_0000);
        assert_eq!(config.address_filter, FilterMode::All);
        assert_eq!(config.buffer, BufferPolicy::Unbounded);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "value_path = \"/tmp/v\"\nuser_space_limit = 0\nemit_source_locations = true\n\n\
             [buffer]\nkind = \"bounded\"\ncapacity = 10\n"
        )
        .unwrap();
        let config = RuntimeConfig::from_toml(file.path()).unwrap();
        assert_eq!(config.value_path, PathBuf::from("/tmp/v"));
        assert_eq!(config.user_space_limit, 0);
        assert!(config.emit_source_locations);
        assert_eq!(config.buffer, BufferPolicy::Bounded { capacity: 10 });
    }

    #[test]
    fn test_invalid_configs() {
        let same = RuntimeConfig {
            value_path: PathBuf::from("/tmp/pmtrace.func.trace"),
            ..Default::default()
        };
        assert!(same.validate().is_err());

        let zero = RuntimeConfig {
            buffer: BufferPolicy::Bounded { capacity: 0 },
            ..Default::default()
        };
        assert!(zero.validate().is_err());

        let huge = RuntimeConfig {
            max_value_len: MAX_VALUE_LEN + 1,
            ..Default::default()
        };
        assert!(huge.validate().unwrap_err().contains("max_value_len"));
    }

    #[test]
    fn test_from_toml_rejects_huge_value_len() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_value_len = 104857601").unwrap();
        let err = RuntimeConfig::from_toml(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_missing_file_error() {
        let err = RuntimeConfig::from_toml("/nonexistent/pmtrace.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
