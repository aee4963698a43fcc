//! Shared fixtures: kext bundles written into temporary repositories.

#![allow(dead_code)]

use kextkit::kext::keys;
use kextkit::plist::{self, Dictionary, Value};
use kextkit::{KextManager, ManagerConfig};
use std::fs;
use std::path::{Path, PathBuf};

/// Builder for one kext bundle on disk.
pub struct BundleBuilder {
    name: String,
    info: Dictionary,
    executable: Option<(String, Vec<u8>)>,
    plugins: Vec<BundleBuilder>,
}

impl BundleBuilder {
    /// A valid, codeless kext.
    pub fn new(name: &str, identifier: &str, version: &str) -> Self {
        let mut info = Dictionary::new();
        info.insert(keys::BUNDLE_IDENTIFIER.into(), identifier.into());
        info.insert(keys::BUNDLE_VERSION.into(), version.into());
        info.insert(keys::INFO_DICTIONARY_VERSION.into(), "6.0".into());
        info.insert(keys::PACKAGE_TYPE.into(), keys::KEXT_PACKAGE_TYPE.into());
        BundleBuilder {
            name: name.to_string(),
            info,
            executable: None,
            plugins: Vec::new(),
        }
    }

    /// A kext with no identifier, which fails validation.
    pub fn malformed(name: &str) -> Self {
        let mut builder = BundleBuilder::new(name, "unused", "1.0");
        builder.info.shift_remove(keys::BUNDLE_IDENTIFIER);
        builder
    }

    pub fn compatible(self, version: &str) -> Self {
        self.property(keys::COMPATIBLE_VERSION, version.into())
    }

    pub fn required(self, requirement: &str) -> Self {
        self.property(keys::BUNDLE_REQUIRED, requirement.into())
    }

    pub fn kernel_resource(self) -> Self {
        self.property(keys::KERNEL_RESOURCE, true.into())
    }

    pub fn library(mut self, identifier: &str, version: &str) -> Self {
        let libraries = self
            .info
            .entry(keys::LIBRARIES.to_string())
            .or_insert_with(|| Value::Dictionary(Dictionary::new()));
        if let Value::Dictionary(libraries) = libraries {
            libraries.insert(identifier.to_string(), version.into());
        }
        self
    }

    pub fn personality(mut self, name: &str, class: &str, provider: &str) -> Self {
        let mut personality = Dictionary::new();
        personality.insert(keys::IO_CLASS.into(), class.into());
        personality.insert(keys::IO_PROVIDER_CLASS.into(), provider.into());
        let personalities = self
            .info
            .entry(keys::PERSONALITIES.to_string())
            .or_insert_with(|| Value::Dictionary(Dictionary::new()));
        if let Value::Dictionary(personalities) = personalities {
            personalities.insert(name.to_string(), Value::Dictionary(personality));
        }
        self
    }

    /// Declare an executable and write it with the given bytes.
    pub fn executable(mut self, name: &str, bytes: Vec<u8>) -> Self {
        self.info.insert(keys::EXECUTABLE.into(), name.into());
        self.executable = Some((name.to_string(), bytes));
        self
    }

    pub fn property(mut self, key: &str, value: Value) -> Self {
        self.info.insert(key.to_string(), value);
        self
    }

    pub fn plugin(mut self, plugin: BundleBuilder) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Write the bundle into `dir` and return its path.
    pub fn write(&self, dir: &Path) -> PathBuf {
        let bundle = dir.join(&self.name);
        let contents = bundle.join("Contents");
        fs::create_dir_all(&contents).unwrap();
        plist::write_to_path(&Value::Dictionary(self.info.clone()), &contents.join("Info.plist")).unwrap();
        if let Some((name, bytes)) = &self.executable {
            let macos = contents.join("MacOS");
            fs::create_dir_all(&macos).unwrap();
            fs::write(macos.join(name), bytes).unwrap();
        }
        if !self.plugins.is_empty() {
            let plugins = contents.join("PlugIns");
            fs::create_dir_all(&plugins).unwrap();
            for plugin in &self.plugins {
                plugin.write(&plugins);
            }
        }
        bundle
    }
}

/// 64-bit Mach-O header for the host cpu, if the host has one.
pub fn host_executable() -> Vec<u8> {
    let cpu_type = kextkit::kext::bundle::host_cpu_type().unwrap_or(0);
    let mut bytes = 0xfeed_facf_u32.to_be_bytes().to_vec();
    bytes.extend_from_slice(&(cpu_type as u32).to_be_bytes());
    bytes.extend_from_slice(&[0u8; 24]);
    bytes
}

/// Manager configuration for unprivileged tests: caches off, files owned by
/// the current user count as authentic.
pub fn test_config() -> ManagerConfig {
    let (uid, gid) = kextkit::system::current_owner();
    ManagerConfig {
        use_repository_caches: false,
        owner_uid: uid,
        owner_gid: gid,
        ..ManagerConfig::default()
    }
}

pub fn test_manager() -> KextManager {
    KextManager::new(test_config())
}

/// Clear group and other write bits below `root`, so authentication does not
/// depend on the umask the tests run under.
pub fn secure(root: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let mode = if root.is_dir() { 0o755 } else { 0o644 };
    fs::set_permissions(root, fs::Permissions::from_mode(mode)).unwrap();
    if root.is_dir() {
        for entry in fs::read_dir(root).unwrap() {
            secure(&entry.unwrap().path());
        }
    }
}
