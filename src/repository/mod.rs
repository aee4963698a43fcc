//! Repository: a directory of kexts.
//!
//! A repository either scans its directory for `.kext` bundles or only holds
//! kexts added explicitly. Every kext it knows sits in exactly one of two
//! buckets: candidates (usable) or bad (failed validation or authentication,
//! kept so it can be requalified). Kexts themselves live in the manager's
//! arena; a repository holds their handles.

pub mod cache;

use crate::arena::{Arena, KextId, RepositoryId};
use crate::error::{KextError, Result};
use crate::kext::bundle::has_kext_extension;
use crate::kext::{CheckContext, DiagnosticKey, Kext, KextRecord};
use log::{debug, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub use cache::{RepositoryCache, KEXT_CACHE_VERSION};

/// Kexts added and removed by one scan.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    pub added: Vec<KextId>,
    pub removed: Vec<KextId>,
}

impl ScanOutcome {
    pub fn changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }

    fn absorb(&mut self, other: ScanOutcome) {
        self.added.extend(other.added);
        self.removed.extend(other.removed);
    }
}

/// A directory of kexts.
#[derive(Debug, Clone)]
pub struct Repository {
    path: PathBuf,
    scans_for_kexts: bool,
    candidates: Vec<KextId>,
    bad: Vec<KextId>,
    has_authenticated: bool,
    needs_reset: bool,
    needs_cache_update: bool,
}

impl Repository {
    /// Create an empty repository for `path`, which is canonicalized.
    pub fn new(path: &Path, scans_for_kexts: bool) -> Result<Repository> {
        let canonical = match fs::canonicalize(path) {
            Ok(canonical) => canonical,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(KextError::FileNotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        if !canonical.is_dir() {
            return Err(KextError::InvalidArgument(format!(
                "Repository path is not a directory: {}",
                canonical.display()
            )));
        }
        Ok(Repository {
            path: canonical,
            scans_for_kexts,
            candidates: Vec::new(),
            bad: Vec::new(),
            has_authenticated: false,
            needs_reset: false,
            needs_cache_update: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn scans_for_kexts(&self) -> bool {
        self.scans_for_kexts
    }

    pub fn candidate_kexts(&self) -> &[KextId] {
        &self.candidates
    }

    pub fn bad_kexts(&self) -> &[KextId] {
        &self.bad
    }

    /// Candidates followed by bad kexts.
    pub fn all_kexts(&self) -> Vec<KextId> {
        self.candidates.iter().chain(self.bad.iter()).copied().collect()
    }

    pub fn contains(&self, kext: KextId) -> bool {
        self.candidates.contains(&kext) || self.bad.contains(&kext)
    }

    pub fn is_candidate(&self, kext: KextId) -> bool {
        self.candidates.contains(&kext)
    }

    pub fn has_authenticated(&self) -> bool {
        self.has_authenticated
    }

    pub(crate) fn set_has_authenticated(&mut self, authenticated: bool) {
        self.has_authenticated = authenticated;
    }

    /// Set when cached metadata turned out to differ from disk.
    pub fn needs_reset(&self) -> bool {
        self.needs_reset
    }

    pub(crate) fn set_needs_reset(&mut self, needs_reset: bool) {
        self.needs_reset = needs_reset;
    }

    /// Set when the repository was scanned because its cache was stale.
    pub fn needs_cache_update(&self) -> bool {
        self.needs_cache_update
    }

    pub(crate) fn set_needs_cache_update(&mut self, needs_update: bool) {
        self.needs_cache_update = needs_update;
    }

    /// Find a kext by absolute bundle path.
    pub fn kext_with_bundle_path(&self, kexts: &Arena<KextId, Kext>, path: &Path) -> Option<KextId> {
        self.all_kexts()
            .into_iter()
            .find(|id| kexts.get(*id).map_or(false, |kext| kext.bundle_path() == path))
    }

    // ----------------------------------------------------------------------
    // Bucket transitions
    // ----------------------------------------------------------------------

    fn file(&mut self, id: KextId, valid: bool) {
        if valid {
            self.candidates.push(id);
        } else {
            self.bad.push(id);
        }
    }

    fn forget(&mut self, id: KextId) {
        self.candidates.retain(|k| *k != id);
        self.bad.retain(|k| *k != id);
    }

    /// Move a candidate to the bad bucket. Returns false if it was not a
    /// candidate.
    pub fn disqualify(&mut self, id: KextId) -> bool {
        match self.candidates.iter().position(|k| *k == id) {
            Some(index) => {
                self.candidates.remove(index);
                self.bad.push(id);
                true
            }
            None => false,
        }
    }

    /// Move a bad kext back to the candidates and forget its authentication.
    pub fn requalify(&mut self, kexts: &mut Arena<KextId, Kext>, id: KextId) -> bool {
        match self.bad.iter().position(|k| *k == id) {
            Some(index) => {
                self.bad.remove(index);
                self.candidates.push(id);
                if let Some(kext) = kexts.get_mut(id) {
                    kext.flags.has_been_authenticated = false;
                    kext.flags.is_authentic = false;
                    kext.authentication_failures.clear();
                }
                self.has_authenticated = false;
                true
            }
            None => false,
        }
    }

    // ----------------------------------------------------------------------
    // Instantiation
    // ----------------------------------------------------------------------

    /// Instantiate, validate and file one bundle. Structural failures leave
    /// nothing behind.
    fn instantiate(
        &mut self,
        self_id: RepositoryId,
        kexts: &mut Arena<KextId, Kext>,
        ctx: &CheckContext<'_>,
        bundle_path: &Path,
        container: Option<KextId>,
    ) -> Result<KextId> {
        let mut kext = Kext::from_bundle(self_id, &self.path, bundle_path, container)?;

        match kext.validate(ctx) {
            Ok(()) | Err(KextError::Validation(_)) => {}
            Err(e) => return Err(e),
        }
        if container.is_some() && has_nested_plugins(&kext)? {
            warn!("[Repository] Plugin {} contains plugins; ignoring them", kext.display_name());
            kext.validation_failures.record(
                DiagnosticKey::PluginContainsPlugins,
                Some(&kext.bundle_path_in_repository.to_string_lossy()),
            );
            kext.flags.is_valid = false;
        }

        Ok(self.adopt(kexts, kext))
    }

    /// File an already validated kext by its validity.
    pub(crate) fn adopt(&mut self, kexts: &mut Arena<KextId, Kext>, kext: Kext) -> KextId {
        let valid = kext.is_valid();
        let id = kexts.insert(kext);
        self.file(id, valid);
        id
    }

    /// Like `instantiate`, but structural failures are logged and skipped.
    fn instantiate_scanned(
        &mut self,
        self_id: RepositoryId,
        kexts: &mut Arena<KextId, Kext>,
        ctx: &CheckContext<'_>,
        bundle_path: &Path,
        container: Option<KextId>,
    ) -> Result<Option<KextId>> {
        match self.instantiate(self_id, kexts, ctx, bundle_path, container) {
            Ok(id) => Ok(Some(id)),
            Err(e) if e.is_structural() => {
                debug!("[Repository] Skipping {}: {}", bundle_path.display(), e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Add one bundle and, if asked, its plugins. An already known bundle
    /// is returned as is.
    pub fn add_kext(
        &mut self,
        self_id: RepositoryId,
        kexts: &mut Arena<KextId, Kext>,
        ctx: &CheckContext<'_>,
        bundle_path: &Path,
        include_plugins: bool,
    ) -> Result<(KextId, ScanOutcome)> {
        if let Some(existing) = self.kext_with_bundle_path(kexts, bundle_path) {
            return Ok((existing, ScanOutcome::default()));
        }
        let id = self.instantiate(self_id, kexts, ctx, bundle_path, None)?;
        let mut outcome = ScanOutcome {
            added: vec![id],
            removed: Vec::new(),
        };
        if include_plugins {
            outcome.absorb(self.scan_plugins(self_id, kexts, ctx, id)?);
        }
        Ok((id, outcome))
    }

    /// Insert a kext rebuilt from a cache record, with its plugins.
    pub fn add_cached_kext(
        &mut self,
        self_id: RepositoryId,
        kexts: &mut Arena<KextId, Kext>,
        ctx: &CheckContext<'_>,
        record: &KextRecord,
    ) -> Result<KextId> {
        let id = self.insert_cached(self_id, kexts, ctx, record, None)?;
        for plugin in &record.plugins {
            let plugin_id = self.insert_cached(self_id, kexts, ctx, plugin, Some(id))?;
            if let Some(container) = kexts.get_mut(id) {
                container.plugins.push(plugin_id);
            }
        }
        Ok(id)
    }

    fn insert_cached(
        &mut self,
        self_id: RepositoryId,
        kexts: &mut Arena<KextId, Kext>,
        ctx: &CheckContext<'_>,
        record: &KextRecord,
        container: Option<KextId>,
    ) -> Result<KextId> {
        let mut kext = Kext::from_cache_record(self_id, &self.path, record, container)?;
        match kext.validate(ctx) {
            Ok(()) | Err(KextError::Validation(_)) => {}
            Err(e) => return Err(e),
        }
        Ok(self.adopt(kexts, kext))
    }

    // ----------------------------------------------------------------------
    // Scanning
    // ----------------------------------------------------------------------

    /// Bring the repository in line with the filesystem.
    ///
    /// Scanning repositories diff their directory listing: new bundles are
    /// added with their plugins, vanished ones removed with their plugins,
    /// survivors left alone. Explicit-add repositories only drop kexts whose
    /// bundles no longer exist.
    pub fn scan(
        &mut self,
        self_id: RepositoryId,
        kexts: &mut Arena<KextId, Kext>,
        ctx: &CheckContext<'_>,
    ) -> Result<ScanOutcome> {
        let mut outcome = ScanOutcome::default();

        let top_level: Vec<KextId> = self
            .all_kexts()
            .into_iter()
            .filter(|id| kexts.get(*id).map_or(false, |kext| !kext.is_plugin()))
            .collect();

        let listing = if self.scans_for_kexts {
            Some(list_bundles(&self.path)?)
        } else {
            None
        };

        for id in top_level.iter().copied() {
            let path = match kexts.get(id) {
                Some(kext) => kext.bundle_path().to_path_buf(),
                None => continue,
            };
            let still_there = match &listing {
                Some(listing) => listing.contains(&path),
                None => path.is_dir(),
            };
            if !still_there {
                debug!("[Repository] {} vanished", path.display());
                outcome.removed.extend(self.remove_kext(kexts, id));
            }
        }

        if let Some(listing) = listing {
            for path in listing {
                if self.kext_with_bundle_path(kexts, &path).is_some() {
                    continue;
                }
                if let Some(id) = self.instantiate_scanned(self_id, kexts, ctx, &path, None)? {
                    outcome.added.push(id);
                    outcome.absorb(self.scan_plugins(self_id, kexts, ctx, id)?);
                }
            }
        }

        debug!(
            "[Repository] Scanned {}: {} added, {} removed",
            self.path.display(),
            outcome.added.len(),
            outcome.removed.len()
        );
        Ok(outcome)
    }

    /// Diff the plugin directory of `container` against its known plugins.
    fn scan_plugins(
        &mut self,
        self_id: RepositoryId,
        kexts: &mut Arena<KextId, Kext>,
        ctx: &CheckContext<'_>,
        container: KextId,
    ) -> Result<ScanOutcome> {
        let mut outcome = ScanOutcome::default();
        let (plugins_dir, known) = match kexts.get(container) {
            Some(kext) => (kext.layout().plugins_dir(), kext.plugins.clone()),
            None => return Ok(outcome),
        };
        let listing = if plugins_dir.is_dir() {
            list_bundles(&plugins_dir)?
        } else {
            Vec::new()
        };

        for plugin in known {
            let gone = kexts
                .get(plugin)
                .map_or(true, |kext| !listing.iter().any(|p| p == kext.bundle_path()));
            if gone {
                outcome.removed.extend(self.remove_kext(kexts, plugin));
            }
        }

        for path in listing {
            if self.kext_with_bundle_path(kexts, &path).is_some() {
                continue;
            }
            if let Some(id) = self.instantiate_scanned(self_id, kexts, ctx, &path, Some(container))? {
                if let Some(container) = kexts.get_mut(container) {
                    container.plugins.push(id);
                }
                outcome.added.push(id);
            }
        }
        Ok(outcome)
    }

    // ----------------------------------------------------------------------
    // Removal and reset
    // ----------------------------------------------------------------------

    /// Remove a kext and its plugins, returning every removed handle.
    pub fn remove_kext(&mut self, kexts: &mut Arena<KextId, Kext>, id: KextId) -> Vec<KextId> {
        let mut removed = Vec::new();
        let kext = match kexts.remove(id) {
            Some(kext) => kext,
            None => return removed,
        };
        self.forget(id);
        removed.push(id);

        for plugin in &kext.plugins {
            if kexts.remove(*plugin).is_some() {
                self.forget(*plugin);
                removed.push(*plugin);
            }
        }
        if let Some(container) = kext.container.and_then(|c| kexts.get_mut(c)) {
            container.plugins.retain(|p| *p != id);
        }
        removed
    }

    /// Remove every kext.
    pub fn clear(&mut self, kexts: &mut Arena<KextId, Kext>) -> Vec<KextId> {
        let mut removed = Vec::new();
        for id in self.all_kexts() {
            removed.push(id);
            kexts.remove(id);
        }
        self.candidates.clear();
        self.bad.clear();
        self.has_authenticated = false;
        removed
    }

    /// Empty the repository and rebuild it from disk.
    ///
    /// Scanning repositories rescan; explicit-add repositories re-instantiate
    /// every previously known top-level bundle, with plugins if it had any.
    pub fn reset(
        &mut self,
        self_id: RepositoryId,
        kexts: &mut Arena<KextId, Kext>,
        ctx: &CheckContext<'_>,
    ) -> Result<ScanOutcome> {
        let known: Vec<(PathBuf, bool)> = self
            .all_kexts()
            .into_iter()
            .filter_map(|id| kexts.get(id))
            .filter(|kext| !kext.is_plugin())
            .map(|kext| (kext.bundle_path().to_path_buf(), !kext.plugins.is_empty()))
            .collect();

        let mut outcome = ScanOutcome {
            added: Vec::new(),
            removed: self.clear(kexts),
        };
        self.needs_reset = false;

        if self.scans_for_kexts {
            outcome.absorb(self.scan(self_id, kexts, ctx)?);
            return Ok(outcome);
        }
        for (path, with_plugins) in known {
            match self.add_kext(self_id, kexts, ctx, &path, with_plugins) {
                Ok((_, added)) => outcome.absorb(added),
                Err(e) if e.is_structural() => {
                    debug!("[Repository] {} no longer loadable: {}", path.display(), e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(outcome)
    }

    // ----------------------------------------------------------------------
    // Cache
    // ----------------------------------------------------------------------

    /// Cache document for every top-level kext, plugins inline.
    pub fn to_cache(&self, kexts: &Arena<KextId, Kext>) -> RepositoryCache {
        let records = self
            .all_kexts()
            .into_iter()
            .filter_map(|id| kexts.get(id))
            .filter(|kext| !kext.is_plugin())
            .map(|kext| {
                let mut record = kext.to_cache_record();
                record.plugins = kext
                    .plugins
                    .iter()
                    .filter_map(|plugin| kexts.get(*plugin))
                    .map(Kext::to_cache_record)
                    .collect();
                record
            })
            .collect();
        RepositoryCache::new(&self.path, self.scans_for_kexts, records)
    }

    /// Write the cache to `cache_path`, or to the default sibling location.
    pub fn write_cache(&mut self, kexts: &Arena<KextId, Kext>, cache_path: Option<&Path>) -> Result<()> {
        let default_path = cache::cache_path_for(&self.path);
        let cache_path = cache_path.unwrap_or(&default_path);
        cache::write_cache(&self.to_cache(kexts), &self.path, cache_path)?;
        self.needs_cache_update = false;
        Ok(())
    }
}

/// `.kext` entries of a directory, sorted by path.
fn list_bundles(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut bundles = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if has_kext_extension(&path) && path.is_dir() {
            bundles.push(path);
        }
    }
    bundles.sort();
    Ok(bundles)
}

fn has_nested_plugins(plugin: &Kext) -> Result<bool> {
    let dir = plugin.layout().plugins_dir();
    if !dir.is_dir() {
        return Ok(false);
    }
    Ok(!list_bundles(&dir)?.is_empty())
}
