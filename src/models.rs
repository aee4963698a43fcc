//! Core data types shared across kextkit modules.

use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use crate::arena::{KextId, RepositoryId};

/// What kind of kernel resource a kext is.
///
/// Kernel resources are pseudo-extensions describing interfaces the kernel
/// itself provides. They always satisfy dependencies and are never loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KernelResourceKind {
    /// An ordinary, loadable kext.
    #[default]
    NotKernelResource,
    /// Kernel resource with no executable of its own.
    Pseudo,
    /// Kernel resource whose declared executable is shared with the kernel.
    SharedExecutable,
}

impl KernelResourceKind {
    pub fn is_kernel_resource(&self) -> bool {
        !matches!(self, KernelResourceKind::NotKernelResource)
    }
}

/// Legal values of the `OSBundleRequired` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootRequirement {
    Root,
    LocalRoot,
    NetworkRoot,
    Console,
    SafeBoot,
}

impl BootRequirement {
    pub const ALL: [BootRequirement; 5] = [
        BootRequirement::Root,
        BootRequirement::LocalRoot,
        BootRequirement::NetworkRoot,
        BootRequirement::Console,
        BootRequirement::SafeBoot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BootRequirement::Root => "Root",
            BootRequirement::LocalRoot => "Local-Root",
            BootRequirement::NetworkRoot => "Network-Root",
            BootRequirement::Console => "Console",
            BootRequirement::SafeBoot => "Safe Boot",
        }
    }

    /// Every legal boot requirement names an early-boot context, so all of
    /// them make a kext eligible during safe boot.
    pub fn is_early_boot(&self) -> bool {
        true
    }
}

impl fmt::Display for BootRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BootRequirement {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BootRequirement::ALL
            .iter()
            .copied()
            .find(|requirement| requirement.as_str() == s)
            .ok_or_else(|| format!("Unknown OSBundleRequired value: {}", s))
    }
}

/// One entry of the running kernel's loaded-module snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedKextInfo {
    pub name: String,
    pub version: String,
    pub load_address: u64,
}

impl LoadedKextInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>, load_address: u64) -> Self {
        LoadedKextInfo {
            name: name.into(),
            version: version.into(),
            load_address,
        }
    }

    pub fn parsed_version(&self) -> Option<Version> {
        Version::parse(&self.version).ok()
    }
}
