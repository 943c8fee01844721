//! Optional `charter.toml` loaded from the store root.

use crate::core::error::CharterError;
use crate::core::registry::Visibility;
use serde::Deserialize;
use std::fs;
use std::path::Path;

pub const CONFIG_FILE_NAME: &str = "charter.toml";

/// What the kernel does when two modules declare the same operation tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationConflicts {
    /// Later registration silently replaces the earlier entry.
    #[default]
    Overwrite,
    /// Initialization fails with `OperationCollision`.
    Reject,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub operation_conflicts: OperationConflicts,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub default_visibility: Visibility,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CharterConfig {
    pub kernel: KernelConfig,
    pub registry: RegistryConfig,
}

impl CharterConfig {
    pub fn parse(content: &str) -> Result<Self, CharterError> {
        toml::from_str(content).map_err(|e| CharterError::ConfigError(e.to_string()))
    }
}

/// Load `<root>/charter.toml`. No file means defaults, not an error.
pub fn load_config(root: &Path) -> Result<CharterConfig, CharterError> {
    let path = root.join(CONFIG_FILE_NAME);
    if !path.exists() {
        return Ok(CharterConfig::default());
    }
    let content = fs::read_to_string(&path).map_err(CharterError::IoError)?;
    CharterConfig::parse(&content)
}
