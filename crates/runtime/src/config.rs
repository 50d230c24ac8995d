// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Executor configuration loaded from TOML files or constructed
//! programmatically.
//!
//! # TOML Format
//! ```toml
//! funcall_pipelining = true
//! dump_dir = "/tmp/subgraph-io"
//! enable_profiling = true
//! ```

use std::path::{Path, PathBuf};

/// Configuration for one inference request.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExecutorConfig {
    /// Double-buffer function bodies so closure unpacking for the next
    /// call overlaps execution of the current one. Costs a second
    /// subrequest per body.
    #[serde(default)]
    pub funcall_pipelining: bool,
    /// When set, input tensors are dumped here once per execution attempt
    /// and output tensors after success.
    pub dump_dir: Option<PathBuf>,
    /// Whether subrequest profiling records are collected.
    #[serde(default = "default_true")]
    pub enable_profiling: bool,
}

fn default_true() -> bool {
    true
}

impl ExecutorConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, super::RuntimeError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            super::RuntimeError::Config(format!("cannot read config '{}': {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, super::RuntimeError> {
        toml::from_str(toml_str)
            .map_err(|e| super::RuntimeError::Config(format!("TOML parse error: {e}")))
    }

    /// Serialises configuration to TOML.
    pub fn to_toml(&self) -> Result<String, super::RuntimeError> {
        toml::to_string_pretty(self)
            .map_err(|e| super::RuntimeError::Config(format!("TOML serialise error: {e}")))
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            funcall_pipelining: false,
            dump_dir: None,
            enable_profiling: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default() {
        let c = ExecutorConfig::default();
        assert!(!c.funcall_pipelining);
        assert!(c.dump_dir.is_none());
        assert!(c.enable_profiling);
    }

    #[test]
    fn test_from_toml() {
        let toml = r#"
funcall_pipelining = true
dump_dir = "/tmp/io"
enable_profiling = false
"#;
        let c = ExecutorConfig::from_toml(toml).unwrap();
        assert!(c.funcall_pipelining);
        assert_eq!(c.dump_dir, Some(PathBuf::from("/tmp/io")));
        assert!(!c.enable_profiling);
    }

    #[test]
    fn test_toml_roundtrip() {
        let c = ExecutorConfig {
            funcall_pipelining: true,
            dump_dir: None,
            enable_profiling: true,
        };
        let toml = c.to_toml().unwrap();
        let back = ExecutorConfig::from_toml(&toml).unwrap();
        assert_eq!(back.funcall_pipelining, c.funcall_pipelining);
        assert_eq!(back.enable_profiling, c.enable_profiling);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let c = ExecutorConfig::from_toml("").unwrap();
        assert!(!c.funcall_pipelining);
        assert!(c.enable_profiling);
    }
}
