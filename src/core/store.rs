//! Store abstraction for Charter's on-disk state.
//!
//! A store root holds the registry database, one database per instance and the
//! broker audit trail. Everything Charter persists lives under a single root.

use crate::core::error::CharterError;
use crate::core::schemas;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable consulted when no `--root` flag is given.
pub const ROOT_ENV_VAR: &str = "CHARTER_ROOT";
/// Root used when neither the flag nor the environment names one.
pub const DEFAULT_ROOT_DIR: &str = ".charter";

/// Store handle representing one Charter workspace.
#[derive(Debug, Clone)]
pub struct Store {
    /// Absolute or working-directory-relative path to the store root
    pub root: PathBuf,
}

impl Store {
    /// Open a store at `root`, creating the directory layout if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CharterError> {
        let root = root.into();
        fs::create_dir_all(root.join(schemas::INSTANCES_DIR_NAME))
            .map_err(CharterError::IoError)?;
        Ok(Self { root })
    }

    pub fn registry_db_path(&self) -> PathBuf {
        self.root.join(schemas::REGISTRY_DB_NAME)
    }

    pub fn instance_db_path(&self, instance_id: &str) -> PathBuf {
        self.root
            .join(schemas::INSTANCES_DIR_NAME)
            .join(format!("{}.db", instance_id))
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.root.join(schemas::AUDIT_LOG_NAME)
    }
}

/// Resolve the store root: explicit flag, then `CHARTER_ROOT`, then `./.charter`.
pub fn resolve_root(flag: Option<&Path>) -> PathBuf {
    if let Some(dir) = flag {
        return dir.to_path_buf();
    }
    match std::env::var(ROOT_ENV_VAR) {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ => PathBuf::from(DEFAULT_ROOT_DIR),
    }
}
