use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Code generation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateConfig {
    /// Run the tail optimizer after every emitted instruction.
    pub peephole: bool,
    /// Report instructions and statement anchors to the debug sink.
    pub debug_symbols: bool,
    pub max_instructions: usize,
    pub max_locals: usize,
    pub max_statics: usize,
    /// Size limit of the instance and global namespaces, each.
    pub max_variables: usize,
    /// Worker threads for project compilation.
    pub jobs: usize,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        GenerateConfig {
            peephole: true,
            debug_symbols: false,
            max_instructions: 1 << 20,
            max_locals: 4096,
            max_statics: 4096,
            max_variables: 1 << 16,
            jobs: 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl GenerateConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
