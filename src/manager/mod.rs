/// Kext Manager module: owns every repository and kext
///
/// This module handles:
/// - Registering repositories (from caches or by scanning) and single kexts
/// - Lookups by identifier, compatible version and bundle path
/// - Authentication of candidates and candidate/bad transitions
/// - Version relationships (`relationships`), dependency resolution
///   (`resolver`) and loading (`loader`)
///
/// Kexts and repositories live in arenas and are addressed by handles. Any
/// change to the set of usable kexts clears version relationships; they are
/// rebuilt on next use.

pub mod callbacks;
pub mod loader;
pub mod relationships;
pub mod resolver;

use crate::arena::{Arena, KextId, RepositoryId};
use crate::config::ManagerConfig;
use crate::error::{CacheError, KextError, Result};
use crate::kext::{CheckContext, CheckPolicy, ExecutableInspector, Kext, MachHeaderInspector};
use crate::log_info;
use crate::repository::{cache, Repository, ScanOutcome};
use crate::system;
use crate::version::Version;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub use callbacks::{DefaultCallbacks, DetachedKernelLink, KernelLink, KextCallbacks, LoadOutcome};
pub use loader::LoadOptions;
pub use relationships::RelationshipState;

/// Central registry of repositories and kexts.
pub struct KextManager {
    pub(crate) config: ManagerConfig,
    pub(crate) repositories: Arena<RepositoryId, Repository>,
    pub(crate) repository_order: Vec<RepositoryId>,
    pub(crate) kexts: Arena<KextId, Kext>,
    /// Chain head per bundle identifier.
    pub(crate) candidate_index: BTreeMap<String, KextId>,
    pub(crate) kexts_with_missing_dependencies: Vec<KextId>,
    pub(crate) relationships: RelationshipState,
    pub(crate) callbacks: Box<dyn KextCallbacks>,
    pub(crate) kernel: Box<dyn KernelLink>,
    pub(crate) inspector: Box<dyn ExecutableInspector>,
}

impl Default for KextManager {
    fn default() -> Self {
        KextManager::new(ManagerConfig::default())
    }
}

impl KextManager {
    /// Create an empty manager. Repositories listed in `config` are not
    /// registered; use [`KextManager::from_config`] for that.
    pub fn new(config: ManagerConfig) -> Self {
        KextManager {
            config,
            repositories: Arena::new(),
            repository_order: Vec::new(),
            kexts: Arena::new(),
            candidate_index: BTreeMap::new(),
            kexts_with_missing_dependencies: Vec::new(),
            relationships: RelationshipState::default(),
            callbacks: Box::new(DefaultCallbacks),
            kernel: Box::new(DetachedKernelLink),
            inspector: Box::new(MachHeaderInspector::new()),
        }
    }

    /// Create a manager and register every configured repository, clearing
    /// relationships once at the end.
    pub fn from_config(config: ManagerConfig) -> Result<Self> {
        config.validate()?;
        let repositories = config.repositories.clone();
        let mut manager = KextManager::new(config);

        manager.disable_clear_relationships();
        let result = repositories.iter().try_for_each(|repository| {
            manager
                .add_repository(&repository.path, repository.scans_for_kexts, repository.use_cache)
                .map(|_| ())
        });
        manager.enable_clear_relationships();
        result?;

        log_info!(
            "[KextManager] Initialized with {} repositories and {} kexts",
            manager.repository_order.len(),
            manager.kexts.len()
        );
        Ok(manager)
    }

    pub fn with_callbacks(mut self, callbacks: Box<dyn KextCallbacks>) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn with_kernel_link(mut self, kernel: Box<dyn KernelLink>) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn with_inspector(mut self, inspector: Box<dyn ExecutableInspector>) -> Self {
        self.inspector = inspector;
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn check_policy(&self) -> CheckPolicy {
        self.config.check_policy()
    }

    // ----------------------------------------------------------------------
    // Settings
    // ----------------------------------------------------------------------

    pub fn set_safe_boot(&mut self, safe_boot: bool) {
        if self.config.safe_boot != safe_boot {
            self.config.safe_boot = safe_boot;
            self.clear_relationships();
        }
    }

    pub fn set_performs_full_tests(&mut self, full_tests: bool) {
        if self.config.performs_full_tests != full_tests {
            self.config.performs_full_tests = full_tests;
            self.clear_relationships();
        }
    }

    pub fn set_performs_strict_authentication(&mut self, strict: bool) {
        self.config.performs_strict_authentication = strict;
    }

    pub fn set_performs_loads_in_task(&mut self, in_task: bool) {
        self.config.performs_loads_in_task = in_task;
    }

    pub fn set_use_repository_caches(&mut self, use_caches: bool) {
        self.config.use_repository_caches = use_caches;
    }

    /// Required owner of authenticated files.
    pub fn set_required_owner(&mut self, uid: u32, gid: u32) {
        self.config.owner_uid = uid;
        self.config.owner_gid = gid;
    }

    pub fn set_kext_enabled(&mut self, id: KextId, enabled: bool) -> Result<()> {
        let kext = self.kexts.get_mut(id).ok_or(KextError::StaleHandle)?;
        if kext.is_enabled() != enabled {
            kext.set_enabled(enabled);
            self.clear_relationships();
        }
        Ok(())
    }

    /// Treat a kext as authentic without checking its files.
    pub fn mark_kext_authentic(&mut self, id: KextId) -> Result<()> {
        self.kexts.get_mut(id).ok_or(KextError::StaleHandle)?.mark_authentic();
        Ok(())
    }

    // ----------------------------------------------------------------------
    // Repositories
    // ----------------------------------------------------------------------

    /// Register the repository at `path`, or return the existing one.
    ///
    /// A fresh cache is used when caches are enabled; otherwise, or when the
    /// cache cannot be used, the directory is scanned. A cache that was
    /// stale is scheduled for rewrite if its directory is writable.
    pub fn add_repository(&mut self, path: &Path, scans_for_kexts: bool, use_cache: bool) -> Result<RepositoryId> {
        let repository = Repository::new(path, scans_for_kexts)?;
        if let Some(existing) = self.repository_with_path(repository.path()) {
            return Ok(existing);
        }
        let repository_path = repository.path().to_path_buf();
        let id = self.repositories.insert(repository);
        self.repository_order.push(id);

        if let Err(e) = self.populate_repository(id, use_cache) {
            self.discard_repository(id);
            return Err(e);
        }

        let count = self.repositories.get(id).map_or(0, |r| r.all_kexts().len());
        log_info!(
            "[KextManager] Added repository {} ({} kexts)",
            repository_path.display(),
            count
        );
        self.clear_relationships();
        Ok(id)
    }

    fn populate_repository(&mut self, id: RepositoryId, use_cache: bool) -> Result<()> {
        let ctx = CheckContext::new(self.config.check_policy(), self.inspector.as_ref());
        let repository = self.repositories.get_mut(id).ok_or(KextError::StaleHandle)?;

        if use_cache && self.config.caches_enabled() {
            let cache_path = cache::cache_path_for(repository.path());
            match load_from_cache(repository, id, &mut self.kexts, &ctx, &cache_path) {
                Ok(count) => {
                    debug!(
                        "[KextManager] Loaded {} kexts from {}",
                        count,
                        cache_path.display()
                    );
                    return Ok(());
                }
                Err(e @ KextError::Cache(_)) | Err(e @ KextError::InvalidArgument(_)) => {
                    debug!("[KextManager] Not using {}: {}", cache_path.display(), e);
                    repository.clear(&mut self.kexts);
                    let writable = cache_path.parent().map_or(false, system::is_writable);
                    repository.set_needs_cache_update(writable);
                }
                Err(e) => return Err(e),
            }
        }

        repository.scan(id, &mut self.kexts, &ctx)?;
        Ok(())
    }

    fn discard_repository(&mut self, id: RepositoryId) {
        if let Some(mut repository) = self.repositories.remove(id) {
            repository.clear(&mut self.kexts);
        }
        self.repository_order.retain(|r| *r != id);
    }

    /// Remove a repository and all of its kexts.
    pub fn remove_repository(&mut self, id: RepositoryId) -> Result<()> {
        let path = self
            .repositories
            .get(id)
            .map(|r| r.path().to_path_buf())
            .ok_or(KextError::StaleHandle)?;
        self.discard_repository(id);
        log_info!("[KextManager] Removed repository {}", path.display());
        self.clear_relationships();
        Ok(())
    }

    /// Empty a repository and rebuild it from disk.
    pub fn reset_repository(&mut self, id: RepositoryId) -> Result<ScanOutcome> {
        let outcome = {
            let ctx = CheckContext::new(self.config.check_policy(), self.inspector.as_ref());
            let repository = self.repositories.get_mut(id).ok_or(KextError::StaleHandle)?;
            repository.reset(id, &mut self.kexts, &ctx)?
        };
        self.clear_relationships();
        Ok(outcome)
    }

    /// Bring a repository in line with its directory.
    pub fn rescan_repository(&mut self, id: RepositoryId) -> Result<ScanOutcome> {
        let outcome = {
            let ctx = CheckContext::new(self.config.check_policy(), self.inspector.as_ref());
            let repository = self.repositories.get_mut(id).ok_or(KextError::StaleHandle)?;
            repository.scan(id, &mut self.kexts, &ctx)?
        };
        if outcome.changed() {
            self.clear_relationships();
        }
        Ok(outcome)
    }

    /// Rescan every repository.
    pub fn rescan_all_repositories(&mut self) -> Result<()> {
        self.disable_clear_relationships();
        let result = self
            .repository_order
            .clone()
            .into_iter()
            .try_for_each(|id| self.rescan_repository(id).map(|_| ()));
        self.enable_clear_relationships();
        result
    }

    /// Rewrite the caches of repositories scheduled for it. Returns how many
    /// were written.
    pub fn update_repository_caches(&mut self) -> Result<usize> {
        let mut written = 0;
        for id in self.repository_order.clone() {
            let repository = match self.repositories.get_mut(id) {
                Some(repository) if repository.needs_cache_update() => repository,
                _ => continue,
            };
            repository.write_cache(&self.kexts, None)?;
            debug!("[KextManager] Updated cache for {}", repository.path().display());
            written += 1;
        }
        Ok(written)
    }

    /// Write one repository's cache to `cache_path`, or next to it.
    pub fn write_repository_cache(&mut self, id: RepositoryId, cache_path: Option<&Path>) -> Result<()> {
        let repository = self.repositories.get_mut(id).ok_or(KextError::StaleHandle)?;
        repository.write_cache(&self.kexts, cache_path)
    }

    pub fn repositories(&self) -> &[RepositoryId] {
        &self.repository_order
    }

    pub fn repository(&self, id: RepositoryId) -> Option<&Repository> {
        self.repositories.get(id)
    }

    pub fn repository_with_path(&self, path: &Path) -> Option<RepositoryId> {
        let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        self.repository_order
            .iter()
            .copied()
            .find(|id| self.repositories.get(*id).map_or(false, |r| r.path() == canonical))
    }

    // ----------------------------------------------------------------------
    // Kexts
    // ----------------------------------------------------------------------

    /// Add one bundle, registering an explicit-add repository for its parent
    /// directory if none exists.
    pub fn add_kext(&mut self, path: &Path, include_plugins: bool) -> Result<KextId> {
        let bundle_path = match fs::canonicalize(path) {
            Ok(bundle_path) => bundle_path,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(KextError::FileNotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        let parent = bundle_path
            .parent()
            .ok_or_else(|| KextError::NotInRepository {
                path: bundle_path.clone(),
                repository: PathBuf::new(),
            })?
            .to_path_buf();
        let (repository_id, created) = match self.repository_with_path(&parent) {
            Some(id) => (id, false),
            None => (self.add_repository(&parent, false, false)?, true),
        };

        let added = {
            let ctx = CheckContext::new(self.config.check_policy(), self.inspector.as_ref());
            let repository = self
                .repositories
                .get_mut(repository_id)
                .ok_or(KextError::StaleHandle)?;
            repository.add_kext(repository_id, &mut self.kexts, &ctx, &bundle_path, include_plugins)
        };
        let (id, outcome) = match added {
            Ok(added) => added,
            Err(e) => {
                if created {
                    debug!("[KextManager] Dropping repository {} after failed add", parent.display());
                    self.discard_repository(repository_id);
                }
                return Err(e);
            }
        };
        if outcome.changed() {
            debug!(
                "[KextManager] Added {} ({} kexts)",
                bundle_path.display(),
                outcome.added.len()
            );
            self.clear_relationships();
        }
        Ok(id)
    }

    /// Remove a kext and its plugins.
    pub fn remove_kext(&mut self, id: KextId) -> Result<()> {
        let repository_id = self.kexts.get(id).ok_or(KextError::StaleHandle)?.repository();
        let repository = self
            .repositories
            .get_mut(repository_id)
            .ok_or(KextError::StaleHandle)?;
        let removed = repository.remove_kext(&mut self.kexts, id);
        self.kexts_with_missing_dependencies.retain(|k| !removed.contains(k));
        self.clear_relationships();
        Ok(())
    }

    pub fn kext(&self, id: KextId) -> Option<&Kext> {
        self.kexts.get(id)
    }

    /// Every kext, repository by repository, candidates before bad ones.
    pub fn all_kexts(&self) -> Vec<KextId> {
        self.repository_order
            .iter()
            .filter_map(|id| self.repositories.get(*id))
            .flat_map(|repository| repository.all_kexts())
            .collect()
    }

    pub fn kext_with_bundle_path(&self, path: &Path) -> Option<KextId> {
        let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        self.repository_order
            .iter()
            .filter_map(|id| self.repositories.get(*id))
            .find_map(|repository| repository.kext_with_bundle_path(&self.kexts, &canonical))
    }

    /// Newest usable kext with `identifier`.
    pub fn kext_with_identifier(&mut self, identifier: &str) -> Result<Option<KextId>> {
        self.ensure_relationships()?;
        Ok(self.candidate_index.get(identifier).copied())
    }

    /// Usable kext with `identifier` whose compatible range covers
    /// `version`, preferring a loaded one.
    pub fn compatible_kext_with_identifier(&mut self, identifier: &str, version: Version) -> Result<Option<KextId>> {
        self.ensure_relationships()?;
        Ok(self.find_compatible(identifier, version).ok())
    }

    /// Every usable version of `identifier`, newest first.
    pub fn kexts_with_identifier(&mut self, identifier: &str) -> Result<Vec<KextId>> {
        self.ensure_relationships()?;
        Ok(self
            .candidate_index
            .get(identifier)
            .map(|head| relationships::chain_members(&self.kexts, *head))
            .unwrap_or_default())
    }

    /// Kexts excised from their chains by the last batch resolution.
    pub fn kexts_with_missing_dependencies(&self) -> &[KextId] {
        &self.kexts_with_missing_dependencies
    }

    // ----------------------------------------------------------------------
    // Cache realization
    // ----------------------------------------------------------------------

    /// Replace a cached kext's metadata with the bundle on disk and
    /// revalidate it.
    ///
    /// On a mismatch the owning repository is flagged for reset and
    /// `CacheInconsistency` is returned.
    pub fn realize_kext(&mut self, id: KextId) -> Result<()> {
        let (repository_id, was_valid, is_valid) = {
            let ctx = CheckContext::new(self.config.check_policy(), self.inspector.as_ref());
            let kext = self.kexts.get_mut(id).ok_or(KextError::StaleHandle)?;
            if !kext.is_from_cache() {
                return Ok(());
            }
            let repository_id = kext.repository();
            match kext.realize() {
                Ok(()) => {}
                Err(e @ KextError::CacheInconsistency(_)) => {
                    warn!("[KextManager] {}", e);
                    if let Some(repository) = self.repositories.get_mut(repository_id) {
                        repository.set_needs_reset(true);
                    }
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
            let was_valid = kext.is_valid();
            match kext.validate(&ctx) {
                Ok(()) | Err(KextError::Validation(_)) => {}
                Err(e) => return Err(e),
            }
            (repository_id, was_valid, kext.is_valid())
        };

        if was_valid != is_valid {
            let repository = self
                .repositories
                .get_mut(repository_id)
                .ok_or(KextError::StaleHandle)?;
            if is_valid {
                repository.requalify(&mut self.kexts, id);
            } else {
                repository.disqualify(id);
            }
            self.clear_relationships();
        }
        Ok(())
    }

    // ----------------------------------------------------------------------
    // Authentication
    // ----------------------------------------------------------------------

    /// Authenticate every candidate of every repository, disqualifying the
    /// ones that fail. Returns the failed kexts.
    pub fn authenticate_kexts(&mut self) -> Result<Vec<KextId>> {
        self.disable_clear_relationships();
        let result = self.authenticate_all_candidates();
        self.enable_clear_relationships();
        result
    }

    fn authenticate_all_candidates(&mut self) -> Result<Vec<KextId>> {
        let mut failed = Vec::new();
        for repository_id in self.repository_order.clone() {
            let candidates = match self.repositories.get(repository_id) {
                Some(repository) => repository.candidate_kexts().to_vec(),
                None => continue,
            };
            for id in candidates {
                if !self.authenticate_kext(id)? {
                    self.disqualify_kext(id)?;
                    failed.push(id);
                }
            }
            if let Some(repository) = self.repositories.get_mut(repository_id) {
                repository.set_has_authenticated(true);
            }
        }
        log_info!(
            "[KextManager] Authenticated kexts: {} failed",
            failed.len()
        );
        Ok(failed)
    }

    /// Check one kext's files. Returns whether it is authentic; only IO
    /// problems other than missing files are errors.
    pub(crate) fn authenticate_kext(&mut self, id: KextId) -> Result<bool> {
        let policy = self.config.check_policy();
        let auth = self.config.authentication_policy();
        let kext = self.kexts.get_mut(id).ok_or(KextError::StaleHandle)?;
        let repository_path = self
            .repositories
            .get(kext.repository())
            .map(|r| r.path().to_path_buf())
            .ok_or(KextError::StaleHandle)?;

        match kext.authenticate(&repository_path, policy, &auth) {
            Ok(()) => Ok(true),
            Err(KextError::Authentication(name)) => {
                self.callbacks.log(&format!("Extension {} failed authentication", name));
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Move a candidate to its repository's bad kexts.
    pub fn disqualify_kext(&mut self, id: KextId) -> Result<()> {
        let kext = self.kexts.get(id).ok_or(KextError::StaleHandle)?;
        let name = kext.display_name();
        let repository = self
            .repositories
            .get_mut(kext.repository())
            .ok_or(KextError::StaleHandle)?;
        if repository.disqualify(id) {
            self.callbacks.log(&format!("Extension {} disqualified", name));
            self.clear_relationships();
        }
        Ok(())
    }

    /// Move a bad kext back to the candidates. Its authentication is
    /// forgotten.
    pub fn requalify_kext(&mut self, id: KextId) -> Result<()> {
        let repository_id = self.kexts.get(id).ok_or(KextError::StaleHandle)?.repository();
        let repository = self
            .repositories
            .get_mut(repository_id)
            .ok_or(KextError::StaleHandle)?;
        if repository.requalify(&mut self.kexts, id) {
            self.clear_relationships();
        }
        Ok(())
    }
}

fn load_from_cache(
    repository: &mut Repository,
    id: RepositoryId,
    kexts: &mut Arena<KextId, Kext>,
    ctx: &CheckContext<'_>,
    cache_path: &Path,
) -> Result<usize> {
    let cache = cache::read_cache(repository.path(), cache_path)?;
    if cache.scans_for_kexts != repository.scans_for_kexts() {
        return Err(CacheError::Stale(cache_path.to_path_buf()).into());
    }
    for record in &cache.kexts {
        repository.add_cached_kext(id, kexts, ctx, record)?;
    }
    Ok(cache.kexts.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kext::keys;
    use crate::plist::{self, Dictionary, Value};
    use tempfile::TempDir;

    fn write_bundle(dir: &Path, name: &str, identifier: &str, version: &str) -> PathBuf {
        let bundle = dir.join(name);
        fs::create_dir_all(bundle.join("Contents")).unwrap();
        let mut info = Dictionary::new();
        info.insert(keys::BUNDLE_IDENTIFIER.into(), identifier.into());
        info.insert(keys::BUNDLE_VERSION.into(), version.into());
        info.insert(keys::INFO_DICTIONARY_VERSION.into(), "6.0".into());
        info.insert(keys::PACKAGE_TYPE.into(), keys::KEXT_PACKAGE_TYPE.into());
        plist::write_to_path(&Value::Dictionary(info), &bundle.join("Contents/Info.plist")).unwrap();
        bundle
    }

    fn manager() -> KextManager {
        KextManager::new(ManagerConfig {
            use_repository_caches: false,
            ..ManagerConfig::default()
        })
    }

    #[test]
    fn test_add_repository_is_idempotent() {
        let dir = TempDir::new().unwrap();
        write_bundle(dir.path(), "A.kext", "com.example.a", "1.0");
        let mut manager = manager();
        let first = manager.add_repository(dir.path(), true, false).unwrap();
        let second = manager.add_repository(dir.path(), true, false).unwrap();
        assert_eq!(first, second);
        assert_eq!(manager.repositories().len(), 1);
        assert_eq!(manager.all_kexts().len(), 1);
    }

    #[test]
    fn test_add_repository_missing_directory() {
        let dir = TempDir::new().unwrap();
        let mut manager = manager();
        let result = manager.add_repository(&dir.path().join("nope"), true, false);
        assert!(matches!(result, Err(KextError::FileNotFound(_))));
        assert!(manager.repositories().is_empty());
    }

    #[test]
    fn test_add_kext_creates_explicit_repository() {
        let dir = TempDir::new().unwrap();
        let bundle = write_bundle(dir.path(), "A.kext", "com.example.a", "1.0");
        write_bundle(dir.path(), "B.kext", "com.example.b", "1.0");
        let mut manager = manager();

        let id = manager.add_kext(&bundle, false).unwrap();
        assert_eq!(manager.repositories().len(), 1);
        let repository = manager.repository(manager.repositories()[0]).unwrap();
        assert!(!repository.scans_for_kexts());
        assert_eq!(manager.all_kexts(), vec![id]);
        assert_eq!(manager.kext_with_bundle_path(&bundle), Some(id));
        assert_eq!(manager.add_kext(&bundle, false).unwrap(), id);
    }

    #[test]
    fn test_add_kext_rejects_wrong_extension() {
        let dir = TempDir::new().unwrap();
        let bundle = dir.path().join("A.bundle");
        fs::create_dir_all(&bundle).unwrap();
        let mut manager = manager();
        assert!(matches!(manager.add_kext(&bundle, false), Err(KextError::NotAKextBundle(_))));
        assert!(manager.all_kexts().is_empty());
    }

    #[test]
    fn test_lookup_by_identifier_rebuilds_relationships() {
        let dir = TempDir::new().unwrap();
        write_bundle(dir.path(), "A.kext", "com.example.a", "1.0");
        let mut manager = manager();
        manager.add_repository(dir.path(), true, false).unwrap();
        assert_eq!(manager.relationship_state(), RelationshipState::Dirty);

        let head = manager.kext_with_identifier("com.example.a").unwrap();
        assert!(head.is_some());
        assert_eq!(manager.relationship_state(), RelationshipState::Clean);
        assert_eq!(manager.kext_with_identifier("com.example.none").unwrap(), None);
    }

    #[test]
    fn test_disabled_kext_leaves_index() {
        let dir = TempDir::new().unwrap();
        write_bundle(dir.path(), "A.kext", "com.example.a", "1.0");
        let mut manager = manager();
        manager.add_repository(dir.path(), true, false).unwrap();
        let id = manager.kext_with_identifier("com.example.a").unwrap().unwrap();

        manager.set_kext_enabled(id, false).unwrap();
        assert_eq!(manager.relationship_state(), RelationshipState::Dirty);
        assert_eq!(manager.kext_with_identifier("com.example.a").unwrap(), None);
    }

    #[test]
    fn test_remove_repository_drops_kexts() {
        let dir = TempDir::new().unwrap();
        write_bundle(dir.path(), "A.kext", "com.example.a", "1.0");
        let mut manager = manager();
        let id = manager.add_repository(dir.path(), true, false).unwrap();
        manager.remove_repository(id).unwrap();
        assert!(manager.all_kexts().is_empty());
        assert!(manager.repository(id).is_none());
        assert!(matches!(manager.remove_repository(id), Err(KextError::StaleHandle)));
    }

    #[test]
    fn test_rescan_picks_up_new_bundle() {
        let dir = TempDir::new().unwrap();
        write_bundle(dir.path(), "A.kext", "com.example.a", "1.0");
        let mut manager = manager();
        let id = manager.add_repository(dir.path(), true, false).unwrap();
        manager.kext_with_identifier("com.example.a").unwrap();

        write_bundle(dir.path(), "B.kext", "com.example.b", "1.0");
        let outcome = manager.rescan_repository(id).unwrap();
        assert_eq!(outcome.added.len(), 1);
        assert!(manager.kext_with_identifier("com.example.b").unwrap().is_some());
    }

    #[test]
    fn test_stale_cache_schedules_update() {
        let parent = TempDir::new().unwrap();
        let repo = parent.path().join("Extensions");
        fs::create_dir(&repo).unwrap();
        write_bundle(&repo, "A.kext", "com.example.a", "1.0");

        let mut manager = KextManager::default();
        let id = manager.add_repository(&repo, true, true).unwrap();
        assert!(manager.repository(id).unwrap().needs_cache_update());
        assert_eq!(manager.update_repository_caches().unwrap(), 1);
        assert!(!manager.repository(id).unwrap().needs_cache_update());

        let mut cached = KextManager::default();
        let cached_id = cached.add_repository(&repo, true, true).unwrap();
        assert!(!cached.repository(cached_id).unwrap().needs_cache_update());
        let kext = cached.all_kexts()[0];
        assert!(cached.kext(kext).unwrap().is_from_cache());
    }

    #[test]
    fn test_from_config_registers_repositories() {
        let dir = TempDir::new().unwrap();
        write_bundle(dir.path(), "A.kext", "com.example.a", "1.0");
        let mut config = ManagerConfig {
            use_repository_caches: false,
            ..ManagerConfig::default()
        };
        config
            .repositories
            .push(crate::config::RepositoryConfig::scanning(dir.path()));
        let manager = KextManager::from_config(config).unwrap();
        assert_eq!(manager.repositories().len(), 1);
        assert_eq!(manager.relationship_state(), RelationshipState::Dirty);
    }
}
