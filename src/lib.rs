//! kextkit: kernel extension management core
//!
//! This crate discovers kernel extension bundles in repository directories,
//! validates and authenticates them, links versions of the same identifier
//! into chains, resolves dependencies, and hands dependency graphs to a
//! kernel link for loading.
//!
//! The system is organized into functional modules:
//! - **error**: Unified error type hierarchy
//! - **models**: Core data structures and types
//! - **arena**: Generational arena and typed handles
//! - **version**: Version string codec
//! - **plist**: Property-list values and JSON plist files
//! - **system**: OS abstraction (stat, ownership, mtimes) and logging macros
//! - **log_collector**: Log capture through the `log` facade
//! - **config**: Manager configuration and file loader
//! - **kext**: Kext entity, validation, authentication, cache records
//! - **repository**: Repository directories and their caches
//! - **manager**: The kext manager: relationships, resolution, loading
//! - **dgraph**: Dependency graphs handed to the kernel link

// Core foundational modules
pub mod error;
pub mod models;

pub mod arena;
pub mod plist;
pub mod version;

// System abstraction module (filesystem status, logging macros)
pub mod system;

// Robust, decoupled logging system
pub mod log_collector;

// Configuration management module
pub mod config;

pub mod dgraph;
pub mod kext;
pub mod manager;
pub mod repository;

// Re-export the log crate for macro usage
pub use log;

// Re-export log collector for use throughout the system
pub use log_collector::{initialize_logging, LogCollector, LogLine};

// ============================================================================
// PUBLIC RE-EXPORTS FOR CONVENIENCE
// ============================================================================

// Re-export error types for easy access
pub use error::{CacheError, ConfigError, KextError, Result, VersionError};

// Re-export model types for easy access
pub use models::{BootRequirement, KernelResourceKind, KextId, LoadedKextInfo, RepositoryId};

pub use config::{ManagerConfig, RepositoryConfig};
pub use dgraph::{DependencyGraph, GraphEntry};
pub use kext::{
    AuthenticationPolicy, CheckPolicy, DiagnosticKey, Diagnostics, ExecutableInspector, Kext,
    MissingDependency,
};
pub use manager::{
    DefaultCallbacks, DetachedKernelLink, KernelLink, KextCallbacks, KextManager, LoadOptions,
    LoadOutcome, RelationshipState,
};
pub use repository::{Repository, ScanOutcome};
pub use version::Version;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
