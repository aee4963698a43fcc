//! Dependency resolution.
//!
//! Each declared library is matched against the version chains: the first
//! loaded member whose compatible range covers the requested version wins,
//! else the newest compatible member. Matches are resolved recursively and
//! the result is memoized on the kext until relationships are cleared.
//! A depth ceiling turns dependency cycles into a `DependencyLoop` error.

use super::relationships::chain_members;
use super::KextManager;
use crate::arena::KextId;
use crate::error::{KextError, Result};
use crate::kext::{DiagnosticKey, MissingDependency};
use crate::version::Version;
use log::debug;
use std::collections::BTreeMap;

/// Resolution deeper than this is taken as a dependency loop.
pub const MAX_DEPENDENCY_DEPTH: u32 = 255;

/// Library implied for kexts with code that declare no kernel component.
pub const IMPLICIT_KERNEL_DEPENDENCY: &str = "com.apple.kernel.libkern";
pub const IMPLICIT_KERNEL_DEPENDENCY_VERSION: &str = "1.1";

/// How one library lookup ended.
enum Lookup {
    Resolved(KextId),
    Missing(MissingDependency),
}

impl KextManager {
    /// Find the chain member of `identifier` compatible with `requested`.
    pub(crate) fn find_compatible(
        &self,
        identifier: &str,
        requested: Version,
    ) -> std::result::Result<KextId, MissingDependency> {
        let head = self
            .candidate_index
            .get(identifier)
            .ok_or(MissingDependency::NoVersionAvailable)?;
        let members = chain_members(&self.kexts, *head);
        let compatible: Vec<KextId> = members
            .iter()
            .copied()
            .filter(|id| self.kexts.get(*id).map_or(false, |k| k.is_compatible_with(requested)))
            .collect();

        let loaded = compatible
            .iter()
            .copied()
            .find(|id| self.kexts.get(*id).map_or(false, |k| k.is_loaded()));
        if let Some(id) = loaded.or_else(|| compatible.first().copied()) {
            return Ok(id);
        }

        let any_declared = members
            .iter()
            .any(|id| self.kexts.get(*id).map_or(false, |k| k.declares_compatible_version()));
        if any_declared {
            Err(MissingDependency::NoCompatibleVersionInRange)
        } else {
            Err(MissingDependency::NoCompatibleVersionDeclared)
        }
    }

    /// Resolve the dependencies of one kext, rebuilding relationships first
    /// if needed.
    pub fn resolve_dependencies(&mut self, id: KextId) -> Result<()> {
        self.ensure_relationships()?;
        self.resolve_at_depth(id, 0)
    }

    fn resolve_at_depth(&mut self, id: KextId, depth: u32) -> Result<()> {
        let policy = self.config.check_policy();
        let kext = self.kexts.get_mut(id).ok_or(KextError::StaleHandle)?;
        let name = kext.display_name();

        if !kext.can_resolve_dependencies() {
            return Err(KextError::ValidationBlocksResolution(name));
        }
        if kext.is_kernel_resource() {
            kext.flags.has_all_dependencies = true;
            return Ok(());
        }
        if kext.has_all_dependencies() {
            return Ok(());
        }
        if depth > MAX_DEPENDENCY_DEPTH {
            kext.validation_failures.record(DiagnosticKey::DependencyLoop, None);
            return Err(KextError::DependencyLoop(name));
        }

        kext.direct_dependencies.clear();
        kext.missing_dependencies.clear();
        kext.warnings.remove(DiagnosticKey::NoExplicitKernelDependency);
        let libraries = kext.declared_libraries();
        let declares_executable = kext.declares_executable();

        let mut direct: Vec<KextId> = Vec::new();
        let mut missing = BTreeMap::new();
        let mut unresolved = false;

        for (identifier, version) in libraries {
            let requested =
                Version::parse(&version).map_err(|_| KextError::ValidationBlocksResolution(name.clone()))?;
            match self.lookup_and_resolve(&identifier, requested, depth) {
                Ok(Lookup::Resolved(dependency)) => {
                    if !direct.contains(&dependency) {
                        direct.push(dependency);
                    }
                }
                Ok(Lookup::Missing(cause)) => {
                    debug!("[KextManager] {} dependency {}: {}", name, identifier, cause);
                    missing.insert(identifier, cause);
                    unresolved = true;
                    if !policy.is_exhaustive() {
                        break;
                    }
                }
                Err(e) => return self.abandon(id, direct, missing, e),
            }
        }

        let mut implicit = false;
        let has_kernel_component = direct
            .iter()
            .any(|d| self.kexts.get(*d).map_or(false, |k| k.is_kernel_resource()));
        if (!unresolved || policy.is_exhaustive()) && declares_executable && !has_kernel_component {
            if let Ok(requested) = Version::parse(IMPLICIT_KERNEL_DEPENDENCY_VERSION) {
                implicit = true;
                match self.lookup_and_resolve(IMPLICIT_KERNEL_DEPENDENCY, requested, depth) {
                    Ok(Lookup::Resolved(dependency)) => {
                        if !direct.contains(&dependency) {
                            direct.push(dependency);
                        }
                    }
                    Ok(Lookup::Missing(cause)) => {
                        missing.insert(IMPLICIT_KERNEL_DEPENDENCY.to_string(), cause);
                        unresolved = true;
                    }
                    Err(e) => return self.abandon(id, direct, missing, e),
                }
            }
        }

        let kext = self.kexts.get_mut(id).ok_or(KextError::StaleHandle)?;
        if implicit {
            kext.warnings.record(DiagnosticKey::NoExplicitKernelDependency, None);
        }
        kext.direct_dependencies = direct;
        kext.missing_dependencies = missing;
        kext.flags.has_all_dependencies = !unresolved;
        if unresolved {
            Err(KextError::DependenciesUnresolvable(name))
        } else {
            Ok(())
        }
    }

    /// Look up one library and resolve it. Only loops and fatal errors are
    /// returned as errors; every other failure becomes a missing cause.
    fn lookup_and_resolve(&mut self, identifier: &str, requested: Version, depth: u32) -> Result<Lookup> {
        let dependency = match self.find_compatible(identifier, requested) {
            Ok(dependency) => dependency,
            Err(cause) => return Ok(Lookup::Missing(cause)),
        };
        match self.resolve_at_depth(dependency, depth + 1) {
            Ok(()) => Ok(Lookup::Resolved(dependency)),
            Err(e @ KextError::DependencyLoop(_)) => Err(e),
            Err(e @ KextError::StaleHandle) => Err(e),
            Err(e) if e.is_fatal() => Err(e),
            Err(_) => Ok(Lookup::Missing(MissingDependency::IndirectDependencyUnresolvable)),
        }
    }

    /// Store partial results and pass a loop or fatal error up.
    fn abandon(
        &mut self,
        id: KextId,
        direct: Vec<KextId>,
        missing: BTreeMap<String, MissingDependency>,
        error: KextError,
    ) -> Result<()> {
        let kext = self.kexts.get_mut(id).ok_or(KextError::StaleHandle)?;
        kext.direct_dependencies = direct;
        kext.missing_dependencies = missing;
        kext.flags.has_all_dependencies = false;
        match error {
            KextError::DependencyLoop(_) => {
                kext.validation_failures.record(DiagnosticKey::DependencyLoop, None);
                Err(KextError::DependencyLoop(kext.display_name()))
            }
            other => Err(other),
        }
    }

    /// Resolve every kext in every version chain, then move the ones that
    /// failed out of their chains. Returns the failed kexts.
    ///
    /// Loops and other per-kext failures are collected; only fatal errors
    /// abort.
    pub fn resolve_all_dependencies(&mut self) -> Result<Vec<KextId>> {
        self.ensure_relationships()?;

        let mut members = Vec::new();
        for head in self.candidate_index.values() {
            members.extend(chain_members(&self.kexts, *head));
        }

        let mut failed = Vec::new();
        for id in members {
            match self.resolve_at_depth(id, 0) {
                Ok(()) => {}
                Err(e) if e.is_fatal() || matches!(e, KextError::StaleHandle) => return Err(e),
                Err(e) => {
                    debug!("[KextManager] {}", e);
                    failed.push(id);
                }
            }
        }

        self.excise_from_chains(&failed)?;
        debug!(
            "[KextManager] Resolved dependencies: {} kexts with missing dependencies",
            failed.len()
        );
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::RepositoryId;
    use crate::config::ManagerConfig;
    use crate::kext::{keys, Kext};
    use crate::plist::{Dictionary, Value};
    use crate::repository::Repository;
    use tempfile::TempDir;

    /// Manager with one explicit repository whose kexts are built in memory.
    struct Harness {
        _dir: TempDir,
        manager: KextManager,
        repository: RepositoryId,
    }

    impl Harness {
        fn new(full_tests: bool) -> Self {
            let dir = TempDir::new().unwrap();
            let mut manager = KextManager::new(ManagerConfig {
                performs_full_tests: full_tests,
                use_repository_caches: false,
                ..ManagerConfig::default()
            });
            let repository = manager
                .repositories
                .insert(Repository::new(dir.path(), false).unwrap());
            manager.repository_order.push(repository);
            Harness {
                _dir: dir,
                manager,
                repository,
            }
        }

        fn add(&mut self, identifier: &str, version: &str, libraries: &[(&str, &str)]) -> KextId {
            let mut info = Dictionary::new();
            info.insert(keys::BUNDLE_IDENTIFIER.into(), identifier.into());
            info.insert(keys::BUNDLE_VERSION.into(), version.into());
            info.insert(keys::COMPATIBLE_VERSION.into(), "1.0".into());
            info.insert(keys::PACKAGE_TYPE.into(), keys::KEXT_PACKAGE_TYPE.into());
            if !libraries.is_empty() {
                let libs: Dictionary = libraries
                    .iter()
                    .map(|(id, v)| (id.to_string(), Value::from(*v)))
                    .collect();
                info.insert(keys::LIBRARIES.into(), Value::Dictionary(libs));
            }
            self.insert(identifier, info)
        }

        fn add_kernel_resource(&mut self, identifier: &str, version: &str) -> KextId {
            let mut info = Dictionary::new();
            info.insert(keys::BUNDLE_IDENTIFIER.into(), identifier.into());
            info.insert(keys::BUNDLE_VERSION.into(), version.into());
            info.insert(keys::COMPATIBLE_VERSION.into(), "1.0".into());
            info.insert(keys::KERNEL_RESOURCE.into(), true.into());
            self.insert(identifier, info)
        }

        fn insert(&mut self, identifier: &str, mut info: Dictionary) -> KextId {
            info.entry(keys::PACKAGE_TYPE.to_string())
                .or_insert_with(|| keys::KEXT_PACKAGE_TYPE.into());
            let path = self
                .manager
                .repositories
                .get(self.repository)
                .unwrap()
                .path()
                .to_path_buf();
            let mut kext = Kext::from_info_dictionary(self.repository, &path, format!("{}.kext", identifier), info);
            let inspector = crate::kext::MachHeaderInspector::new();
            let ctx = crate::kext::CheckContext::new(self.manager.check_policy(), &inspector);
            kext.validate(&ctx).unwrap();
            let repository = self.manager.repositories.get_mut(self.repository).unwrap();
            let id = repository.adopt(&mut self.manager.kexts, kext);
            self.manager.clear_relationships();
            id
        }

        fn kext(&self, id: KextId) -> &Kext {
            self.manager.kexts.get(id).unwrap()
        }
    }

    #[test]
    fn test_resolves_in_declaration_order() {
        let mut h = Harness::new(false);
        let kernel = h.add_kernel_resource("com.apple.kernel.bsd", "6.0");
        let lib = h.add("com.example.lib", "2.0", &[("com.apple.kernel.bsd", "6.0")]);
        let root = h.add(
            "com.example.root",
            "1.0",
            &[("com.apple.kernel.bsd", "6.0"), ("com.example.lib", "1.5")],
        );

        h.manager.resolve_dependencies(root).unwrap();
        assert!(h.kext(root).has_all_dependencies());
        assert_eq!(h.kext(root).direct_dependencies(), &[kernel, lib]);
        assert!(h.kext(lib).has_all_dependencies());
    }

    #[test]
    fn test_declaration_order_is_not_alphabetical() {
        let mut h = Harness::new(false);
        h.add_kernel_resource("com.apple.kernel.bsd", "6.0");
        let first = h.add("com.zzz.first", "1.0", &[("com.apple.kernel.bsd", "6.0")]);
        let second = h.add("com.aaa.second", "1.0", &[("com.apple.kernel.bsd", "6.0")]);
        let root = h.add(
            "com.example.root",
            "1.0",
            &[("com.zzz.first", "1.0"), ("com.aaa.second", "1.0")],
        );

        h.manager.resolve_dependencies(root).unwrap();
        assert_eq!(h.kext(root).direct_dependencies(), &[first, second]);
    }

    #[test]
    fn test_fail_fast_follows_declaration_order() {
        let mut h = Harness::new(false);
        h.add_kernel_resource("com.apple.kernel.bsd", "6.0");
        let good = h.add("com.zzz.good", "1.0", &[("com.apple.kernel.bsd", "6.0")]);
        let root = h.add(
            "com.example.root",
            "1.0",
            &[("com.zzz.good", "1.0"), ("com.aaa.missing", "1.0")],
        );

        assert!(h.manager.resolve_dependencies(root).is_err());
        let kext = h.kext(root);
        assert_eq!(kext.direct_dependencies(), &[good]);
        assert_eq!(
            kext.missing_dependencies().get("com.aaa.missing"),
            Some(&MissingDependency::NoVersionAvailable)
        );
    }

    #[test]
    fn test_fail_fast_stops_at_first_missing() {
        let mut h = Harness::new(false);
        h.add_kernel_resource("com.apple.kernel.bsd", "6.0");
        let root = h.add(
            "com.example.root",
            "1.0",
            &[("com.apple.kernel.bsd", "6.0"), ("com.example.missing", "1.0"), ("com.example.other", "1.0")],
        );

        let result = h.manager.resolve_dependencies(root);
        assert!(matches!(result, Err(KextError::DependenciesUnresolvable(_))));
        let kext = h.kext(root);
        assert!(!kext.has_all_dependencies());
        assert_eq!(kext.direct_dependencies().len(), 1);
        assert_eq!(
            kext.missing_dependencies().get("com.example.missing"),
            Some(&MissingDependency::NoVersionAvailable)
        );
        assert!(kext.missing_dependencies().get("com.example.other").is_none());
    }

    #[test]
    fn test_exhaustive_collects_every_missing() {
        let mut h = Harness::new(true);
        let root = h.add(
            "com.example.root",
            "1.0",
            &[("com.example.missing", "1.0"), ("com.example.other", "1.0")],
        );
        assert!(h.manager.resolve_dependencies(root).is_err());
        assert_eq!(h.kext(root).missing_dependencies().len(), 2);
    }

    #[test]
    fn test_missing_causes_are_distinguished() {
        let mut h = Harness::new(true);
        h.add("com.example.ranged", "2.0", &[]);
        let mut info = Dictionary::new();
        info.insert(keys::BUNDLE_IDENTIFIER.into(), "com.example.undeclared".into());
        info.insert(keys::BUNDLE_VERSION.into(), "1.0".into());
        h.insert("com.example.undeclared", info);
        let root = h.add(
            "com.example.root",
            "1.0",
            &[("com.example.ranged", "3.0"), ("com.example.undeclared", "1.0")],
        );

        assert!(h.manager.resolve_dependencies(root).is_err());
        let missing = h.kext(root).missing_dependencies();
        assert_eq!(
            missing.get("com.example.ranged"),
            Some(&MissingDependency::NoCompatibleVersionInRange)
        );
        assert_eq!(
            missing.get("com.example.undeclared"),
            Some(&MissingDependency::NoCompatibleVersionDeclared)
        );
    }

    #[test]
    fn test_indirect_failure_is_recorded() {
        let mut h = Harness::new(false);
        h.add("com.example.lib", "1.0", &[("com.example.missing", "1.0")]);
        let root = h.add("com.example.root", "1.0", &[("com.example.lib", "1.0")]);
        assert!(h.manager.resolve_dependencies(root).is_err());
        assert_eq!(
            h.kext(root).missing_dependencies().get("com.example.lib"),
            Some(&MissingDependency::IndirectDependencyUnresolvable)
        );
    }

    #[test]
    fn test_three_kext_cycle_is_a_loop() {
        let mut h = Harness::new(false);
        let a = h.add("com.example.a", "1.0", &[("com.example.b", "1.0")]);
        h.add("com.example.b", "1.0", &[("com.example.c", "1.0")]);
        h.add("com.example.c", "1.0", &[("com.example.a", "1.0")]);

        let result = h.manager.resolve_dependencies(a);
        assert!(matches!(result, Err(KextError::DependencyLoop(_))));
        assert!(h.kext(a).validation_failures().contains(DiagnosticKey::DependencyLoop));
        assert!(!h.kext(a).has_all_dependencies());
    }

    #[test]
    fn test_implicit_kernel_dependency() {
        let mut h = Harness::new(false);
        let libkern = h.add_kernel_resource(IMPLICIT_KERNEL_DEPENDENCY, "6.0");
        let mut info = Dictionary::new();
        info.insert(keys::BUNDLE_IDENTIFIER.into(), "com.example.code".into());
        info.insert(keys::BUNDLE_VERSION.into(), "1.0".into());
        info.insert(keys::EXECUTABLE.into(), "code".into());
        let mut libs = Dictionary::new();
        libs.insert("com.example.lib".into(), "1.0".into());
        info.insert(keys::LIBRARIES.into(), Value::Dictionary(libs));
        let lib = h.add("com.example.lib", "1.0", &[]);
        let code = h.insert("com.example.code", info);

        h.manager.resolve_dependencies(code).unwrap();
        assert_eq!(h.kext(code).direct_dependencies(), &[lib, libkern]);
        assert!(h
            .kext(code)
            .warnings()
            .contains(DiagnosticKey::NoExplicitKernelDependency));
    }

    #[test]
    fn test_prefers_loaded_compatible_version() {
        let mut h = Harness::new(false);
        let old = h.add("com.example.lib", "1.0", &[]);
        let new = h.add("com.example.lib", "2.0", &[]);
        h.manager.kexts.get_mut(old).unwrap().flags.is_loaded = true;
        h.manager.ensure_relationships().unwrap();
        assert_eq!(
            h.manager.find_compatible("com.example.lib", Version::parse("1.0").unwrap()),
            Ok(old)
        );
        h.manager.kexts.get_mut(old).unwrap().flags.is_loaded = false;
        assert_eq!(
            h.manager.find_compatible("com.example.lib", Version::parse("1.0").unwrap()),
            Ok(new)
        );
    }

    #[test]
    fn test_batch_resolution_excises_failures() {
        let mut h = Harness::new(false);
        let good = h.add("com.example.lib", "1.0", &[]);
        let bad = h.add("com.example.lib", "2.0", &[("com.example.missing", "1.0")]);

        let failed = h.manager.resolve_all_dependencies().unwrap();
        assert_eq!(failed, vec![bad]);
        assert_eq!(h.manager.kexts_with_missing_dependencies(), &[bad]);
        assert_eq!(h.manager.candidate_index.get("com.example.lib"), Some(&good));
        assert_eq!(h.kext(good).prior_version(), None);
    }

    #[test]
    fn test_batch_resolution_removes_empty_chain() {
        let mut h = Harness::new(false);
        let bad = h.add("com.example.a", "1.0", &[("com.example.missing", "1.0")]);
        let failed = h.manager.resolve_all_dependencies().unwrap();
        assert_eq!(failed, vec![bad]);
        assert!(h.manager.candidate_index.get("com.example.a").is_none());
    }
}
