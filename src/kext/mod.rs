//! Kext entity.
//!
//! A `Kext` is one bundle known to a repository, either read from disk or
//! rebuilt from a repository cache. It carries the bundle's metadata, the
//! outcome of validation and authentication, and its links into the
//! manager's object graph. Links are arena handles: the repository and
//! container are back-references, plugins are owned through the repository.
//!
//! Submodules:
//! - `diagnostics`: failure/warning collections and the check policy
//! - `bundle`: on-disk layout and executable inspection
//! - `validator`: metadata validation
//! - `auth`: ownership/permission authentication
//! - `cache_record`: cache serialization and realization

pub mod auth;
pub mod bundle;
pub mod cache_record;
pub mod diagnostics;
pub mod validator;

use crate::arena::{KextId, RepositoryId};
use crate::error::{KextError, Result};
use crate::models::KernelResourceKind;
use crate::plist::{Dictionary, Value};
use crate::version::Version;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub use auth::AuthenticationPolicy;
pub use bundle::{BundleLayout, ExecutableInspector, KmodInfo, KmodLookup, MachHeaderInspector};
pub use cache_record::{KextRecord, CACHED_INFO_KEYS};
pub use diagnostics::{CheckPolicy, DiagnosticKey, DiagnosticValue, Diagnostics, MissingDependency};

/// Info dictionary property names.
pub mod keys {
    pub const INFO_DICTIONARY_VERSION: &str = "CFBundleInfoDictionaryVersion";
    pub const BUNDLE_IDENTIFIER: &str = "CFBundleIdentifier";
    pub const BUNDLE_VERSION: &str = "CFBundleVersion";
    pub const BUNDLE_NAME: &str = "CFBundleName";
    pub const SHORT_VERSION: &str = "CFBundleShortVersionString";
    pub const GET_INFO_STRING: &str = "CFBundleGetInfoString";
    pub const COPYRIGHT: &str = "NSHumanReadableCopyright";
    pub const PACKAGE_TYPE: &str = "CFBundlePackageType";
    pub const EXECUTABLE: &str = "CFBundleExecutable";
    pub const COMPATIBLE_VERSION: &str = "OSBundleCompatibleVersion";
    pub const BUNDLE_REQUIRED: &str = "OSBundleRequired";
    pub const LIBRARIES: &str = "OSBundleLibraries";
    pub const KERNEL_RESOURCE: &str = "OSKernelResource";
    pub const DEBUG_LEVEL: &str = "OSBundleDebugLevel";
    pub const HELPER: &str = "OSBundleHelper";
    pub const PERSONALITIES: &str = "IOKitPersonalities";
    pub const IO_CLASS: &str = "IOClass";
    pub const IO_PROVIDER_CLASS: &str = "IOProviderClass";
    pub const IO_MATCH_CATEGORY: &str = "IOMatchCategory";
    pub const IOKIT_DEBUG: &str = "IOKitDebug";

    pub const KEXT_PACKAGE_TYPE: &str = "KEXT";
    pub const IO_RESOURCES: &str = "IOResources";
}

/// Prefix of legacy kernel-component library identifiers.
pub const KERNEL_LIBRARY_PREFIX: &str = "com.apple.kernel";
/// Prefix of KPI library identifiers.
pub const KPI_LIBRARY_PREFIX: &str = "com.apple.kpi.";

/// Whether `identifier` names a legacy kernel component library.
pub fn is_kernel_library(identifier: &str) -> bool {
    identifier == KERNEL_LIBRARY_PREFIX
        || identifier
            .strip_prefix(KERNEL_LIBRARY_PREFIX)
            .map(|rest| rest.starts_with('.'))
            .unwrap_or(false)
}

/// Whether `identifier` names a KPI library.
pub fn is_kpi_library(identifier: &str) -> bool {
    identifier.starts_with(KPI_LIBRARY_PREFIX)
}

/// State flags of a kext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KextFlags {
    pub is_valid: bool,
    pub declares_executable: bool,
    pub is_eligible_during_safe_boot: bool,
    pub is_enabled: bool,
    pub can_authenticate: bool,
    pub has_been_authenticated: bool,
    pub is_authentic: bool,
    pub can_resolve_dependencies: bool,
    pub has_all_dependencies: bool,
    pub is_loaded: bool,
    pub other_version_is_loaded: bool,
    pub load_failed: bool,
    pub has_iokit_debug_property: bool,
}

impl Default for KextFlags {
    fn default() -> Self {
        KextFlags {
            is_valid: false,
            declares_executable: false,
            is_eligible_during_safe_boot: false,
            is_enabled: true,
            can_authenticate: false,
            has_been_authenticated: false,
            is_authentic: false,
            can_resolve_dependencies: false,
            has_all_dependencies: false,
            is_loaded: false,
            other_version_is_loaded: false,
            load_failed: false,
            has_iokit_debug_property: false,
        }
    }
}

/// Policy and collaborators for validation.
#[derive(Clone, Copy)]
pub struct CheckContext<'a> {
    pub policy: CheckPolicy,
    pub inspector: &'a dyn ExecutableInspector,
}

impl<'a> CheckContext<'a> {
    pub fn new(policy: CheckPolicy, inspector: &'a dyn ExecutableInspector) -> Self {
        CheckContext { policy, inspector }
    }
}

/// A kernel extension bundle.
#[derive(Debug, Clone)]
pub struct Kext {
    pub(crate) repository: RepositoryId,
    pub(crate) bundle_path_in_repository: PathBuf,
    pub(crate) bundle_path: PathBuf,
    pub(crate) info: Option<Dictionary>,
    pub(crate) from_cache: bool,

    pub(crate) container: Option<KextId>,
    pub(crate) plugins: Vec<KextId>,

    pub(crate) bundle_identifier: Option<String>,
    pub(crate) version: Option<Version>,
    pub(crate) compatible_version: Option<Version>,
    pub(crate) kernel_resource: KernelResourceKind,
    pub(crate) flags: KextFlags,

    pub(crate) validation_failures: Diagnostics,
    pub(crate) authentication_failures: Diagnostics,
    pub(crate) warnings: Diagnostics,
    pub(crate) missing_dependencies: BTreeMap<String, MissingDependency>,

    pub(crate) prior_version: Option<KextId>,
    pub(crate) next_duplicate: Option<KextId>,
    pub(crate) direct_dependencies: Vec<KextId>,
    pub(crate) load_address: Option<u64>,
}

impl Kext {
    fn blank(
        repository: RepositoryId,
        bundle_path_in_repository: PathBuf,
        bundle_path: PathBuf,
        container: Option<KextId>,
    ) -> Self {
        Kext {
            repository,
            bundle_path_in_repository,
            bundle_path,
            info: None,
            from_cache: false,
            container,
            plugins: Vec::new(),
            bundle_identifier: None,
            version: None,
            compatible_version: None,
            kernel_resource: KernelResourceKind::NotKernelResource,
            flags: KextFlags::default(),
            validation_failures: Diagnostics::new(),
            authentication_failures: Diagnostics::new(),
            warnings: Diagnostics::new(),
            missing_dependencies: BTreeMap::new(),
            prior_version: None,
            next_duplicate: None,
            direct_dependencies: Vec::new(),
            load_address: None,
        }
    }

    /// Instantiate a kext from a bundle directory inside `repository_path`.
    ///
    /// Fails with a structural error when the path does not exist, is not a
    /// directory, lacks the `.kext` extension or lies outside the repository.
    /// The kext is not validated.
    pub fn from_bundle(
        repository: RepositoryId,
        repository_path: &Path,
        bundle_path: &Path,
        container: Option<KextId>,
    ) -> Result<Kext> {
        let metadata = match std::fs::metadata(bundle_path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(KextError::FileNotFound(bundle_path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        if !metadata.is_dir() {
            return Err(KextError::NotABundle(bundle_path.to_path_buf()));
        }
        if !bundle::has_kext_extension(bundle_path) {
            return Err(KextError::NotAKextBundle(bundle_path.to_path_buf()));
        }
        let relative = bundle_path
            .strip_prefix(repository_path)
            .map_err(|_| KextError::NotInRepository {
                path: bundle_path.to_path_buf(),
                repository: repository_path.to_path_buf(),
            })?
            .to_path_buf();
        if relative.as_os_str().is_empty() {
            return Err(KextError::NotInRepository {
                path: bundle_path.to_path_buf(),
                repository: repository_path.to_path_buf(),
            });
        }

        let mut kext = Kext::blank(repository, relative, bundle_path.to_path_buf(), container);
        kext.info = BundleLayout::new(bundle_path).read_info_dictionary()?;
        Ok(kext)
    }

    /// Build a kext directly from an info dictionary, without touching disk.
    pub fn from_info_dictionary(
        repository: RepositoryId,
        repository_path: &Path,
        bundle_path_in_repository: impl Into<PathBuf>,
        info: Dictionary,
    ) -> Kext {
        let relative = bundle_path_in_repository.into();
        let absolute = repository_path.join(&relative);
        let mut kext = Kext::blank(repository, relative, absolute, None);
        kext.info = Some(info);
        kext
    }

    // ----------------------------------------------------------------------
    // Identity
    // ----------------------------------------------------------------------

    pub fn bundle_identifier(&self) -> Option<&str> {
        self.bundle_identifier.as_deref()
    }

    /// Identifier if known, else the bundle path, for messages.
    pub fn display_name(&self) -> String {
        match &self.bundle_identifier {
            Some(identifier) => identifier.clone(),
            None => self.bundle_path.display().to_string(),
        }
    }

    pub fn version(&self) -> Option<Version> {
        self.version
    }

    pub fn compatible_version(&self) -> Option<Version> {
        self.compatible_version
    }

    /// Canonical version string, or empty if the version is unknown.
    pub fn version_string(&self) -> String {
        self.version.map(|v| v.to_string()).unwrap_or_default()
    }

    /// Whether this kext's `[compatible_version, version]` range covers
    /// `requested`.
    pub fn is_compatible_with(&self, requested: Version) -> bool {
        match (self.compatible_version, self.version) {
            (Some(compatible), Some(version)) => compatible <= requested && requested <= version,
            _ => false,
        }
    }

    pub fn declares_compatible_version(&self) -> bool {
        self.compatible_version.is_some()
    }

    // ----------------------------------------------------------------------
    // Location and structure
    // ----------------------------------------------------------------------

    pub fn repository(&self) -> RepositoryId {
        self.repository
    }

    pub fn bundle_path_in_repository(&self) -> &Path {
        &self.bundle_path_in_repository
    }

    pub fn bundle_path(&self) -> &Path {
        &self.bundle_path
    }

    pub fn layout(&self) -> BundleLayout {
        BundleLayout::new(&self.bundle_path)
    }

    pub fn is_from_cache(&self) -> bool {
        self.from_cache
    }

    pub fn container(&self) -> Option<KextId> {
        self.container
    }

    pub fn is_plugin(&self) -> bool {
        self.container.is_some()
    }

    pub fn plugins(&self) -> &[KextId] {
        &self.plugins
    }

    // ----------------------------------------------------------------------
    // Metadata
    // ----------------------------------------------------------------------

    pub fn info_dictionary(&self) -> Option<&Dictionary> {
        self.info.as_ref()
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.info.as_ref().and_then(|info| info.get(key))
    }

    pub fn executable_name(&self) -> Option<&str> {
        self.property(keys::EXECUTABLE)
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
    }

    pub fn executable_path(&self) -> Option<PathBuf> {
        self.executable_name().map(|name| self.layout().executable(name))
    }

    /// Declared libraries as (identifier, version string) pairs, in
    /// declaration order. Entries with non-string values are skipped.
    pub fn declared_libraries(&self) -> Vec<(String, String)> {
        self.property(keys::LIBRARIES)
            .and_then(Value::as_dictionary)
            .map(|libraries| {
                libraries
                    .iter()
                    .filter_map(|(identifier, version)| {
                        version.as_str().map(|v| (identifier.clone(), v.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Personalities from the live info dictionary. Cached kexts only know
    /// whether personalities exist and return `None` until realized.
    pub fn personalities(&self) -> Option<&Dictionary> {
        if self.from_cache {
            return None;
        }
        self.property(keys::PERSONALITIES).and_then(Value::as_dictionary)
    }

    pub fn has_personalities(&self) -> bool {
        match self.property(keys::PERSONALITIES) {
            Some(Value::Boolean(present)) => *present,
            Some(Value::Dictionary(personalities)) => !personalities.is_empty(),
            _ => false,
        }
    }

    pub fn kernel_resource_kind(&self) -> KernelResourceKind {
        self.kernel_resource
    }

    pub fn is_kernel_resource(&self) -> bool {
        self.kernel_resource.is_kernel_resource()
    }

    // ----------------------------------------------------------------------
    // State
    // ----------------------------------------------------------------------

    pub fn flags(&self) -> &KextFlags {
        &self.flags
    }

    pub fn is_valid(&self) -> bool {
        self.flags.is_valid
    }

    pub fn declares_executable(&self) -> bool {
        self.flags.declares_executable
    }

    pub fn is_eligible_during_safe_boot(&self) -> bool {
        self.flags.is_eligible_during_safe_boot
    }

    pub fn is_enabled(&self) -> bool {
        self.flags.is_enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.flags.is_enabled = enabled;
    }

    pub fn has_been_authenticated(&self) -> bool {
        self.flags.has_been_authenticated
    }

    pub fn is_authentic(&self) -> bool {
        self.flags.is_authentic
    }

    pub fn can_resolve_dependencies(&self) -> bool {
        self.flags.can_resolve_dependencies
    }

    pub fn has_all_dependencies(&self) -> bool {
        self.flags.has_all_dependencies
    }

    pub fn is_loaded(&self) -> bool {
        self.flags.is_loaded
    }

    pub fn other_version_is_loaded(&self) -> bool {
        self.flags.other_version_is_loaded
    }

    pub fn load_failed(&self) -> bool {
        self.flags.load_failed
    }

    pub fn has_iokit_debug_property(&self) -> bool {
        self.flags.has_iokit_debug_property
    }

    pub fn load_address(&self) -> Option<u64> {
        self.load_address
    }

    // ----------------------------------------------------------------------
    // Diagnostics
    // ----------------------------------------------------------------------

    pub fn validation_failures(&self) -> &Diagnostics {
        &self.validation_failures
    }

    pub fn authentication_failures(&self) -> &Diagnostics {
        &self.authentication_failures
    }

    pub fn warnings(&self) -> &Diagnostics {
        &self.warnings
    }

    pub fn missing_dependencies(&self) -> &BTreeMap<String, MissingDependency> {
        &self.missing_dependencies
    }

    // ----------------------------------------------------------------------
    // Relationships
    // ----------------------------------------------------------------------

    pub fn prior_version(&self) -> Option<KextId> {
        self.prior_version
    }

    pub fn next_duplicate(&self) -> Option<KextId> {
        self.next_duplicate
    }

    pub fn direct_dependencies(&self) -> &[KextId] {
        &self.direct_dependencies
    }

    /// Skip authentication for a trusted caller.
    pub fn mark_authentic(&mut self) {
        self.authentication_failures.clear();
        self.flags.has_been_authenticated = true;
        self.flags.is_authentic = true;
    }

    /// Forget resolved dependencies so they are recomputed on next use.
    pub(crate) fn clear_dependency_state(&mut self) {
        self.direct_dependencies.clear();
        self.missing_dependencies.clear();
        self.flags.has_all_dependencies = false;
        self.validation_failures.remove(DiagnosticKey::DependencyLoop);
        self.warnings.remove(DiagnosticKey::NoExplicitKernelDependency);
    }

    /// Drop version-chain links and dependency state.
    pub(crate) fn clear_relationships(&mut self) {
        self.prior_version = None;
        self.next_duplicate = None;
        self.clear_dependency_state();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;

    fn repo_id() -> RepositoryId {
        let mut arena: Arena<RepositoryId, ()> = Arena::new();
        arena.insert(())
    }

    fn info(pairs: &[(&str, Value)]) -> Dictionary {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn test_library_classification() {
        assert!(is_kernel_library("com.apple.kernel"));
        assert!(is_kernel_library("com.apple.kernel.bsd"));
        assert!(!is_kernel_library("com.apple.kernelish"));
        assert!(is_kpi_library("com.apple.kpi.libkern"));
        assert!(!is_kpi_library("com.apple.kernel.iokit"));
    }

    #[test]
    fn test_from_bundle_structural_errors() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path();
        std::fs::create_dir_all(repo.join("Foo.bundle")).unwrap();
        std::fs::write(repo.join("File.kext"), b"").unwrap();

        let missing = Kext::from_bundle(repo_id(), repo, &repo.join("Missing.kext"), None);
        assert!(matches!(missing, Err(KextError::FileNotFound(_))));

        let file = Kext::from_bundle(repo_id(), repo, &repo.join("File.kext"), None);
        assert!(matches!(file, Err(KextError::NotABundle(_))));

        let wrong = Kext::from_bundle(repo_id(), repo, &repo.join("Foo.bundle"), None);
        assert!(matches!(wrong, Err(KextError::NotAKextBundle(_))));

        let other = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(other.path().join("Out.kext")).unwrap();
        let outside = Kext::from_bundle(repo_id(), repo, &other.path().join("Out.kext"), None);
        assert!(matches!(outside, Err(KextError::NotInRepository { .. })));
    }

    #[test]
    fn test_from_bundle_without_info_plist() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("Bare.kext")).unwrap();
        let kext = Kext::from_bundle(repo_id(), dir.path(), &dir.path().join("Bare.kext"), None)
            .unwrap();
        assert!(kext.info_dictionary().is_none());
        assert_eq!(kext.bundle_path_in_repository(), Path::new("Bare.kext"));
    }

    #[test]
    fn test_declared_libraries_and_executable() {
        let mut libraries = Dictionary::new();
        libraries.insert("com.apple.kpi.bsd".into(), "8.0".into());
        libraries.insert("com.example.bad".into(), Value::Integer(1));
        let kext = Kext::from_info_dictionary(
            repo_id(),
            Path::new("/repo"),
            "A.kext",
            info(&[
                (keys::EXECUTABLE, "A".into()),
                (keys::LIBRARIES, Value::Dictionary(libraries)),
            ]),
        );
        assert_eq!(
            kext.declared_libraries(),
            vec![("com.apple.kpi.bsd".to_string(), "8.0".to_string())]
        );
        assert_eq!(kext.executable_path(), Some(PathBuf::from("/repo/A.kext/Contents/MacOS/A")));
    }

    #[test]
    fn test_compatibility_range() {
        let mut kext = Kext::from_info_dictionary(repo_id(), Path::new("/r"), "A.kext", Dictionary::new());
        kext.version = Version::parse("2.0").ok();
        assert!(!kext.is_compatible_with(Version::parse("2.0").unwrap()));
        kext.compatible_version = Version::parse("1.0").ok();
        assert!(kext.is_compatible_with(Version::parse("1.0").unwrap()));
        assert!(kext.is_compatible_with(Version::parse("1.5").unwrap()));
        assert!(!kext.is_compatible_with(Version::parse("2.0.1").unwrap()));
        assert!(!kext.is_compatible_with(Version::parse("0.9").unwrap()));
    }

    #[test]
    fn test_mark_authentic_sets_both_flags() {
        let mut kext = Kext::from_info_dictionary(repo_id(), Path::new("/r"), "A.kext", Dictionary::new());
        kext.authentication_failures.record(DiagnosticKey::OwnerPermissions, Some("/r/A.kext"));
        kext.mark_authentic();
        assert!(kext.has_been_authenticated());
        assert!(kext.is_authentic());
        assert!(kext.authentication_failures().is_empty());
    }
}
