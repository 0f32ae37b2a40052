use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{CdssError, Result};

/// Top-level configuration loaded from a TOML file, mirroring how the rest
/// of the stack configures itself (a `CdssConfig::load` falling back to
/// defaults when the file is absent).
#[derive(Debug, Clone, Deserialize)]
pub struct CdssConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_tak_dir")]
    pub tak_dir: PathBuf,
    #[serde(default = "default_rules_dir")]
    pub rules_dir: PathBuf,
    #[serde(default = "default_relevance_hours")]
    pub default_relevance_hours: u32,
}

impl Default for CdssConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            tak_dir: default_tak_dir(),
            rules_dir: default_rules_dir(),
            default_relevance_hours: default_relevance_hours(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/cdss.db")
}

fn default_tak_dir() -> PathBuf {
    PathBuf::from("data/tak")
}

fn default_rules_dir() -> PathBuf {
    PathBuf::from("data/rules")
}

fn default_relevance_hours() -> u32 {
    24
}

impl CdssConfig {
    /// Load config from a TOML file. Returns defaults if the file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| CdssError::Config(format!("reading {}: {e}", path.display())))?;
        let config: CdssConfig = toml::from_str(&contents)
            .map_err(|e| CdssError::Config(format!("parsing {}: {e}", path.display())))?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }
}
