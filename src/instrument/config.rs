// Configuration for the instrumentation engine
//
// Everything kernel-specific the engine needs to know by name lives here, so a
// new file system can be traced by editing a TOML file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Instrumentation engine configuration
///
/// # Example
/// ```
/// use pmtrace::instrument::InstrumentConfig;
///
/// let config = InstrumentConfig::default();
/// assert_eq!(config.module_init_symbol, "init_module");
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    /// Files listing runtime tracing functions (never instrumented)
    pub runtime_function_lists: Vec<PathBuf>,

    /// Files listing file-system entry points of interest
    pub function_lists: Vec<PathBuf>,

    /// Files listing struct types whose pointers are tracked
    pub struct_lists: Vec<PathBuf>,

    /// Struct layout dump produced by the source analyzer
    pub struct_layout: Option<PathBuf>,

    /// Function wrapped with `trace_init_all` / `trace_destroy_all(ret)`
    pub module_init_symbol: String,

    /// Function wrapped with `trace_destroy_all(1)`
    pub module_exit_symbol: String,

    pub centralized_flush: CentralizedFlushConfig,
}

/// Helpers that flush a whole buffer at once
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CentralizedFlushConfig {
    pub helpers: Vec<String>,

    /// Flush length by caller, for helpers called without a length argument
    pub size_by_caller: BTreeMap<String, u32>,
}

impl Default for CentralizedFlushConfig {
    fn default() -> Self {
        let size_by_caller = [
            ("pmfs_mkdir", 32),
            ("nova_rebuild_inode_finish", 120),
            ("nova_rebuild_file_inode_tree", 120),
            ("memcpy_to_pmem_nocache", 120),
            ("pmfs_ioctl", 128),
        ]
        .into_iter()
        .map(|(caller, size)| (caller.to_string(), size))
        .collect();

        Self {
            helpers: vec![
                "nova_flush_buffer".to_string(),
                "pmfs_flush_buffer".to_string(),
            ],
            size_by_caller,
        }
    }
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            runtime_function_lists: Vec::new(),
            function_lists: Vec::new(),
            struct_lists: Vec::new(),
            struct_layout: None,
            module_init_symbol: "init_module".to_string(),
            module_exit_symbol: "cleanup_module".to_string(),
            centralized_flush: CentralizedFlushConfig::default(),
        }
    }
}

impl InstrumentConfig {
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).with_context(|| {
            format!(
                "Failed to read instrumentation config: {}",
                path.as_ref().display()
            )
        })?;
        let config: Self =
            toml::from_str(&content).context("Failed to parse instrumentation config")?;
        config.validate().map_err(anyhow::Error::msg)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.module_init_symbol.is_empty() || self.module_exit_symbol.is_empty() {
            return Err("module init/exit symbols must not be empty".to_string());
        }
        if self.module_init_symbol == self.module_exit_symbol {
            return Err(format!(
                "module init and exit symbol are both `{}`",
                self.module_init_symbol
            ));
        }
        if let Some((caller, _)) = self
            .centralized_flush
            .size_by_caller
            .iter()
            .find(|(_, size)| **size == 0)
        {
            return Err(format!("flush size for caller `{caller}` must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_flush_table() {
        let config = InstrumentConfig::default();
        assert_eq!(config.centralized_flush.helpers.len(), 2);
        assert_eq!(
            config.centralized_flush.size_by_caller.get("pmfs_ioctl"),
            Some(&128)
        );
    }

    #[test]
    fn test_from_toml_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "struct_lists = [\"structs.txt\"]\nmodule_init_symbol = \"nova_init\"\n\n\
             [centralized_flush]\nhelpers = [\"winefs_flush_buffer\"]\n"
        )
        .unwrap();

        let config = InstrumentConfig::from_toml(file.path()).unwrap();
        assert_eq!(config.struct_lists, vec![PathBuf::from("structs.txt")]);
        assert_eq!(config.module_init_symbol, "nova_init");
        assert_eq!(config.module_exit_symbol, "cleanup_module");
        assert_eq!(config.centralized_flush.helpers, vec!["winefs_flush_buffer"]);
        assert!(config.centralized_flush.size_by_caller.contains_key("pmfs_mkdir"));
    }

    #[test]
    fn test_validate_rejects_same_symbols() {
        let config = InstrumentConfig {
            module_exit_symbol: "init_module".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
