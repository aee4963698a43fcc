//! Kext cache records and realization of cached kexts.

use super::diagnostics::DiagnosticKey;
use super::{keys, BundleLayout, Kext};
use crate::arena::{KextId, RepositoryId};
use crate::error::{KextError, Result};
use crate::plist::{Dictionary, Value};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Info dictionary keys kept in repository caches. Personalities are reduced
/// to a presence flag.
pub const CACHED_INFO_KEYS: [&str; 15] = [
    keys::INFO_DICTIONARY_VERSION,
    keys::BUNDLE_VERSION,
    keys::BUNDLE_IDENTIFIER,
    keys::EXECUTABLE,
    keys::BUNDLE_NAME,
    keys::SHORT_VERSION,
    keys::GET_INFO_STRING,
    keys::COPYRIGHT,
    keys::COMPATIBLE_VERSION,
    keys::BUNDLE_REQUIRED,
    keys::PERSONALITIES,
    keys::LIBRARIES,
    keys::KERNEL_RESOURCE,
    keys::DEBUG_LEVEL,
    keys::HELPER,
];

/// One kext in a repository cache file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KextRecord {
    #[serde(rename = "bundlePathInRepository")]
    pub bundle_path_in_repository: String,
    #[serde(rename = "infoDictionary")]
    pub info_dictionary: Dictionary,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugins: Vec<KextRecord>,
}

/// Reduce an info dictionary to the cached subset.
pub fn cached_subset(info: &Dictionary) -> Dictionary {
    let mut subset = Dictionary::new();
    for key in CACHED_INFO_KEYS {
        let value = match info.get(key) {
            Some(value) => value,
            None => continue,
        };
        let cached = if key == keys::PERSONALITIES {
            let present = match value {
                Value::Dictionary(personalities) => !personalities.is_empty(),
                Value::Boolean(present) => *present,
                _ => false,
            };
            Value::Boolean(present)
        } else {
            value.clone()
        };
        subset.insert(key.to_string(), cached);
    }
    subset
}

impl Kext {
    /// Cache record for this kext. Plugin records are filled in by the
    /// owning repository.
    pub fn to_cache_record(&self) -> KextRecord {
        KextRecord {
            bundle_path_in_repository: self.bundle_path_in_repository.to_string_lossy().into_owned(),
            info_dictionary: self.info.as_ref().map(cached_subset).unwrap_or_default(),
            plugins: Vec::new(),
        }
    }

    /// Rebuild a kext from a cache record without reading the bundle.
    ///
    /// The kext is not validated. Plugin records are not expanded.
    pub fn from_cache_record(
        repository: RepositoryId,
        repository_path: &Path,
        record: &KextRecord,
        container: Option<KextId>,
    ) -> Result<Kext> {
        let relative = PathBuf::from(&record.bundle_path_in_repository);
        if relative.as_os_str().is_empty() || relative.is_absolute() {
            return Err(KextError::InvalidArgument(format!(
                "Cache record has an invalid bundle path: {:?}",
                record.bundle_path_in_repository
            )));
        }
        let absolute = repository_path.join(&relative);
        let mut kext = Kext::blank(repository, relative, absolute, container);
        kext.info = Some(record.info_dictionary.clone());
        kext.from_cache = true;
        Ok(kext)
    }

    /// Replace cached metadata with the live info dictionary.
    ///
    /// Every cached key must still match the bundle on disk; otherwise a
    /// `CacheInconsistency` warning is recorded and the kext stays cached.
    /// The caller revalidates after success.
    pub fn realize(&mut self) -> Result<()> {
        if !self.from_cache {
            return Ok(());
        }
        let live = match BundleLayout::new(&self.bundle_path).read_info_dictionary()? {
            Some(live) => live,
            None => {
                self.warnings
                    .record(DiagnosticKey::CacheInconsistency, Some(super::bundle::INFO_PLIST));
                return Err(KextError::CacheInconsistency(self.display_name()));
            }
        };

        let live_subset = cached_subset(&live);
        let cached = self.info.clone().unwrap_or_default();
        let mut consistent = true;
        for key in CACHED_INFO_KEYS {
            if cached.get(key) != live_subset.get(key) {
                self.warnings.record(DiagnosticKey::CacheInconsistency, Some(key));
                consistent = false;
            }
        }
        if !consistent {
            return Err(KextError::CacheInconsistency(self.display_name()));
        }

        self.info = Some(live);
        self.from_cache = false;
        self.warnings.remove(DiagnosticKey::CacheInconsistency);
        Ok(())
    }
}
