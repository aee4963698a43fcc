//! Unified error type hierarchy for kextkit
//!
//! Provides structured error handling with KextError, CacheError, ConfigError
//! and VersionError.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Version string parsing errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("Malformed version string: {0:?}")]
    Malformed(String),

    #[error("Version string too long ({len} bytes, max {max}): {value:?}")]
    TooLong { value: String, len: usize, max: usize },
}

/// Repository cache file errors.
///
/// Every variant makes the cache unusable; the repository falls back to
/// scanning the real directory.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u64, supported: u64 },

    #[error("Cache was written for repository {cached} but read for {expected}")]
    PathMismatch { cached: String, expected: String },

    #[error("Cache file is stale: {0}")]
    Stale(PathBuf),

    #[error("Invalid cache contents: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("IO error during cache operations: {0}")]
    IoError(#[from] io::Error),
}

/// Configuration file parsing and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Invalid JSON in config: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Invalid TOML in config: {0}")]
    InvalidToml(String),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error during config operations: {0}")]
    IoError(#[from] io::Error),
}

/// Errors returned by kext, repository and manager operations.
///
/// The variants follow the error taxonomy of the management core:
/// structural errors abort instantiation, validation/authentication/dependency
/// errors are recorded on the kext as well as returned, and IO errors always
/// abort the current operation.
#[derive(Error, Debug)]
pub enum KextError {
    // Structural
    #[error("Not a bundle: {0}")]
    NotABundle(PathBuf),

    #[error("Not a kext bundle (expected .kext extension): {0}")]
    NotAKextBundle(PathBuf),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Path {path} is not inside repository {repository}")]
    NotInRepository { path: PathBuf, repository: PathBuf },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("No such kext or repository handle")]
    StaleHandle,

    // Recorded on the kext
    #[error("Extension {0} failed validation")]
    Validation(String),

    #[error("Extension {0} failed authentication")]
    Authentication(String),

    #[error("Extension {0} has unresolvable dependencies")]
    DependenciesUnresolvable(String),

    #[error("Possible dependency loop detected while resolving {0}")]
    DependencyLoop(String),

    #[error("Extension {0} cannot resolve dependencies until its validation problems are fixed")]
    ValidationBlocksResolution(String),

    // Load path
    #[error("Extension {0} is a kernel resource and cannot be loaded")]
    KernelResource(String),

    #[error("Extension {0} has no executable code for the host architecture")]
    ArchNotFound(String),

    #[error("Extension {0} is disabled")]
    Disabled(String),

    #[error("Extension {0} is not eligible during safe boot")]
    NotEligibleDuringSafeBoot(String),

    #[error("Extension {0} is already loaded")]
    AlreadyLoaded(String),

    #[error("A different version of {0} is already loaded")]
    LoadedVersionDiffers(String),

    #[error("Loading {0} failed: {1}")]
    LoadFailed(String, String),

    #[error("Operation on {0} cancelled by user")]
    UserAbort(String),

    // Cache
    #[error("Cached information for {0} does not match the bundle on disk")]
    CacheInconsistency(String),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    // Resource
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl KextError {
    /// Structural errors mean the kext could not be instantiated at all, so
    /// nothing is retained in a repository.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            KextError::NotABundle(_)
                | KextError::NotAKextBundle(_)
                | KextError::FileNotFound(_)
                | KextError::NotInRepository { .. }
        )
    }

    /// Resource errors are never collected and continued, regardless of the
    /// full-tests setting.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KextError::Io(_) | KextError::Cache(_) | KextError::Config(_)
        )
    }

    /// True for the dependency-resolution class of errors.
    pub fn is_dependency_error(&self) -> bool {
        matches!(
            self,
            KextError::DependenciesUnresolvable(_)
                | KextError::DependencyLoop(_)
                | KextError::ValidationBlocksResolution(_)
        )
    }
}

/// Top-level result type for kextkit operations.
pub type Result<T> = std::result::Result<T, KextError>;
