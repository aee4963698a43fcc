//! Configuration module for the kext manager.
//!
//! # Module Structure
//!
//! - `loader`: Handles loading configurations from JSON or TOML files
//!
//! # Configuration Flow
//!
//! 1. `ManagerConfig` is loaded from a file or built with defaults
//! 2. `validate` rejects empty or duplicate repository paths
//! 3. `KextManager::from_config` applies the flags and registers repositories

pub mod loader;

use crate::error::ConfigError;
use crate::kext::{AuthenticationPolicy, CheckPolicy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One repository to register at startup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub scans_for_kexts: bool,
    #[serde(default = "default_true")]
    pub use_cache: bool,
}

impl RepositoryConfig {
    pub fn scanning(path: impl Into<PathBuf>) -> Self {
        RepositoryConfig {
            path: path.into(),
            scans_for_kexts: true,
            use_cache: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Global manager settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Only kexts eligible during safe boot take part in relationships.
    pub safe_boot: bool,
    /// Run every check and collect every failure instead of stopping at the
    /// first. Also disables repository caches.
    pub performs_full_tests: bool,
    /// Authenticate the info file, executable and ancestor directories, not
    /// just the bundle directory.
    pub performs_strict_authentication: bool,
    /// Ask the kernel link to load in-task rather than through the daemon.
    pub performs_loads_in_task: bool,
    pub use_repository_caches: bool,
    /// Required owner of authenticated files.
    pub owner_uid: u32,
    pub owner_gid: u32,
    pub repositories: Vec<RepositoryConfig>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            safe_boot: false,
            performs_full_tests: false,
            performs_strict_authentication: true,
            performs_loads_in_task: false,
            use_repository_caches: true,
            owner_uid: 0,
            owner_gid: 0,
            repositories: Vec::new(),
        }
    }
}

impl ManagerConfig {
    pub fn check_policy(&self) -> CheckPolicy {
        CheckPolicy::from_full_tests(self.performs_full_tests)
    }

    pub fn authentication_policy(&self) -> AuthenticationPolicy {
        AuthenticationPolicy {
            strict: self.performs_strict_authentication,
            owner_uid: self.owner_uid,
            owner_gid: self.owner_gid,
        }
    }

    /// Caches are never trusted in full-test mode.
    pub fn caches_enabled(&self) -> bool {
        self.use_repository_caches && !self.performs_full_tests
    }

    /// Reject empty and duplicate repository paths.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = Vec::new();
        for repository in &self.repositories {
            if repository.path.as_os_str().is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "Repository path cannot be empty".to_string(),
                ));
            }
            if seen.contains(&&repository.path) {
                return Err(ConfigError::ValidationFailed(format!(
                    "Repository listed twice: {}",
                    repository.path.display()
                )));
            }
            seen.push(&repository.path);
        }
        Ok(())
    }
}
