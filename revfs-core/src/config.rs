//! Repository configuration stored at `<repo>/config.json`.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const CONFIG_FILE: &str = "config.json";

/// Administrator-controlled repository settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Whether revision properties may be changed after commit. Such changes
    /// overwrite the old value without keeping any history of it.
    #[serde(default)]
    pub allow_revprop_changes: bool,
    /// Longest delta chain allowed before a full text is stored again.
    /// Zero stores every text in full.
    #[serde(default = "default_max_delta_chain")]
    pub max_delta_chain: u32,
    /// zstd level for persisted representations
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

fn default_max_delta_chain() -> u32 {
    16
}

fn default_compression_level() -> i32 {
    3
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            allow_revprop_changes: false,
            max_delta_chain: default_max_delta_chain(),
            compression_level: default_compression_level(),
        }
    }
}

impl RepositoryConfig {
    /// Load the config of the repository at `repo_path`, falling back to
    /// defaults when none was written.
    pub fn load(repo_path: &Path) -> Result<Self> {
        let config_path = repo_path.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&config_path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Save the config into the repository at `repo_path`.
    pub fn save(&self, repo_path: &Path) -> Result<()> {
        let config_path = repo_path.join(CONFIG_FILE);
        let tmp_path = config_path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &config_path)?;
        Ok(())
    }
}
