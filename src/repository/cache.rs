//! Repository cache files.
//!
//! A cache lives next to its repository as `<repository>.kextcache`: a
//! gzip-compressed JSON document holding the cache version, the repository
//! path, its scan mode and one record per top-level kext. A cache is fresh
//! only when its mtime is exactly one second past the directory's.

use crate::error::CacheError;
use crate::kext::KextRecord;
use crate::system;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub const KEXT_CACHE_VERSION: u64 = 1;
pub const CACHE_EXTENSION: &str = "kextcache";

/// On-disk cache document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryCache {
    #[serde(rename = "KextCacheVersion")]
    pub version: u64,
    #[serde(rename = "RepositoryPath")]
    pub repository_path: String,
    #[serde(rename = "ScansForKexts")]
    pub scans_for_kexts: bool,
    #[serde(rename = "Kexts")]
    pub kexts: Vec<KextRecord>,
}

impl RepositoryCache {
    pub fn new(repository_path: &Path, scans_for_kexts: bool, kexts: Vec<KextRecord>) -> Self {
        RepositoryCache {
            version: KEXT_CACHE_VERSION,
            repository_path: repository_path.to_string_lossy().into_owned(),
            scans_for_kexts,
            kexts,
        }
    }
}

/// Default cache location for a repository: a sibling file named after it.
pub fn cache_path_for(repository: &Path) -> PathBuf {
    let mut name = repository
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(CACHE_EXTENSION);
    repository.with_file_name(name)
}

/// Whether `cache` was written for the current contents of `repository`.
pub fn is_cache_fresh(repository: &Path, cache: &Path) -> io::Result<bool> {
    let cache_mtime = match system::mtime_secs(cache) {
        Ok(mtime) => mtime,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    Ok(cache_mtime == system::mtime_secs(repository)? + 1)
}

/// Read and check a cache for `repository`.
///
/// Fails on a stale file, a cache version newer than the supported one, or a
/// cache written for a different repository path.
pub fn read_cache(repository: &Path, cache_path: &Path) -> Result<RepositoryCache, CacheError> {
    if !is_cache_fresh(repository, cache_path)? {
        return Err(CacheError::Stale(cache_path.to_path_buf()));
    }

    let reader = BufReader::new(GzDecoder::new(File::open(cache_path)?));
    let cache: RepositoryCache = serde_json::from_reader(reader)?;

    if cache.version > KEXT_CACHE_VERSION {
        return Err(CacheError::UnsupportedVersion {
            found: cache.version,
            supported: KEXT_CACHE_VERSION,
        });
    }
    let expected = repository.to_string_lossy();
    if cache.repository_path != expected {
        return Err(CacheError::PathMismatch {
            cached: cache.repository_path,
            expected: expected.into_owned(),
        });
    }
    Ok(cache)
}

/// Write `cache` atomically and stamp it fresh relative to `repository`.
pub fn write_cache(
    cache: &RepositoryCache,
    repository: &Path,
    cache_path: &Path,
) -> Result<(), CacheError> {
    let parent = cache_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let temp = tempfile::NamedTempFile::new_in(parent)?;
    {
        let mut encoder = GzEncoder::new(BufWriter::new(temp.as_file()), Compression::default());
        serde_json::to_writer(&mut encoder, cache)?;
        encoder.finish()?.flush()?;
    }
    temp.persist(cache_path).map_err(|e| CacheError::IoError(e.error))?;

    system::set_mtime_secs(cache_path, system::mtime_secs(repository)? + 1)?;
    log::debug!("[RepositoryCache] Wrote {}", cache_path.display());
    Ok(())
}
