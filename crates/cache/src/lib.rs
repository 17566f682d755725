#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `cache` is the process-wide store of [`FileFingerprint`]s the sync engine
//! has observed, split into a *local* view (what the client last saw on disk)
//! and a *remote* view (what the client last heard the server report). It is
//! loaded once at client start, mutated in memory during operations, and
//! flushed back atomically.
//!
//! # Design
//!
//! The mtime recorded on each cached local fingerprint is used purely as an
//! accelerator: [`MetadataCache::refresh_local`] only re-reads and re-digests
//! a file when its on-disk mtime is newer than the cached one. The digest
//! itself remains the authority for equality; nothing here ever treats a
//! matching mtime as proof of matching content.
//!
//! # Invariants
//!
//! - A cache persisted with one [`fingerprint::BLOCK_SIZE`] is never trusted
//!   under a different one; [`MetadataCache::load`] discards (treats as
//!   empty) a file whose recorded block size disagrees with the compiled-in
//!   constant.
//! - [`MetadataCache::flush`] never leaves a half-written cache file behind:
//!   it writes to a temporary file in the same directory and renames it into
//!   place.
//!
//! # Errors
//!
//! [`Error::Io`] covers filesystem failures; [`Error::Decode`] covers a
//! present-but-unparseable cache file (callers may choose to start from an
//! empty cache rather than propagate this, depending on policy).
//!
//! # See also
//!
//! - [`fingerprint`] for the digests this crate persists.
//! - [`delta`] for how a local/remote fingerprint pair becomes a transport
//!   plan.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use fingerprint::{FileFingerprint, BLOCK_SIZE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while loading or flushing a [`MetadataCache`].
#[derive(Debug, Error)]
pub enum Error {
    /// Failure reading or writing the cache file.
    #[error("I/O error on cache file {path}: {source}")]
    Io {
        /// Path of the cache file involved.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },
    /// The cache file exists but could not be parsed as JSON.
    #[error("failed to decode cache file {path}: {source}")]
    Decode {
        /// Path of the cache file involved.
        path: PathBuf,
        /// Underlying decode failure.
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct OnDiskCache {
    block_size: usize,
    local: BTreeMap<String, FileFingerprint>,
    remote: BTreeMap<String, FileFingerprint>,
}

impl Default for OnDiskCache {
    fn default() -> Self {
        Self {
            block_size: BLOCK_SIZE,
            local: BTreeMap::new(),
            remote: BTreeMap::new(),
        }
    }
}

/// Two parallel `path -> FileFingerprint` views, backed by a single JSON file.
#[derive(Debug)]
pub struct MetadataCache {
    cache_file: PathBuf,
    local: BTreeMap<String, FileFingerprint>,
    remote: BTreeMap<String, FileFingerprint>,
}

impl MetadataCache {
    /// Loads a cache from `cache_file`, or starts empty if the file is
    /// absent or was written under a different block size.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file exists but cannot be read, or
    /// [`Error::Decode`] if its contents are not valid cache JSON.
    pub fn load(cache_file: impl Into<PathBuf>) -> Result<Self, Error> {
        let cache_file = cache_file.into();

        if !cache_file.exists() {
            return Ok(Self {
                cache_file,
                local: BTreeMap::new(),
                remote: BTreeMap::new(),
            });
        }

        let raw = fs::read_to_string(&cache_file).map_err(|source| Error::Io {
            path: cache_file.clone(),
            source,
        })?;

        let on_disk: OnDiskCache = serde_json::from_str(&raw).map_err(|source| Error::Decode {
            path: cache_file.clone(),
            source,
        })?;

        if on_disk.block_size != BLOCK_SIZE {
            tracing::warn!(
                cached_block_size = on_disk.block_size,
                current_block_size = BLOCK_SIZE,
                "discarding fingerprint cache written under a different block size"
            );
            return Ok(Self {
                cache_file,
                local: BTreeMap::new(),
                remote: BTreeMap::new(),
            });
        }

        Ok(Self {
            cache_file,
            local: on_disk.local,
            remote: on_disk.remote,
        })
    }

    /// Returns the cached local fingerprint for `path`, if any.
    #[must_use]
    pub fn get_local(&self, path: &str) -> Option<&FileFingerprint> {
        self.local.get(path)
    }

    /// Returns the cached remote fingerprint for `path`, if any.
    #[must_use]
    pub fn get_remote(&self, path: &str) -> Option<&FileFingerprint> {
        self.remote.get(path)
    }

    /// Returns the cached local fingerprint for `path`, recomputing it first
    /// if the on-disk mtime is newer than what is cached (or nothing is
    /// cached yet, or the file was removed from the cache view).
    ///
    /// # Errors
    ///
    /// Propagates [`fingerprint::Error`] from re-fingerprinting.
    pub fn refresh_local(&mut self, path: &str) -> Result<&FileFingerprint, fingerprint::Error> {
        let needs_refresh = match self.local.get(path) {
            Some(cached) => disk_mtime_is_newer(path, cached.mtime),
            None => true,
        };

        if needs_refresh {
            let fresh = fingerprint::fingerprint_file(path)?;
            self.local.insert(path.to_owned(), fresh);
        }

        Ok(self
            .local
            .get(path)
            .expect("just inserted or already present"))
    }

    /// Unconditionally inserts or overwrites the remote view for
    /// `fingerprint.path`.
    pub fn update_remote(&mut self, fingerprint: FileFingerprint) {
        self.remote.insert(fingerprint.path.clone(), fingerprint);
    }

    /// Unconditionally inserts or overwrites the local view for
    /// `fingerprint.path`.
    pub fn update_local(&mut self, fingerprint: FileFingerprint) {
        self.local.insert(fingerprint.path.clone(), fingerprint);
    }

    /// Drops cached entries under the given prefixes.
    ///
    /// Local entries are removed only if the file no longer exists on disk
    /// (the cache must never forget a file that is still there just because
    /// it is under a pruned prefix). Remote entries are removed by prefix
    /// match alone, since the client cannot cheaply probe remote existence.
    ///
    /// Returns the number of entries removed.
    pub fn prune(&mut self, local_prefix: Option<&str>, remote_prefix: Option<&str>) -> usize {
        let mut removed = 0;

        if let Some(prefix) = local_prefix {
            let stale: Vec<String> = self
                .local
                .keys()
                .filter(|p| p.starts_with(prefix) && !Path::new(p).exists())
                .cloned()
                .collect();
            for path in stale {
                self.local.remove(&path);
                removed += 1;
            }
        }

        if let Some(prefix) = remote_prefix {
            let stale: Vec<String> = self
                .remote
                .keys()
                .filter(|p| p.starts_with(prefix))
                .cloned()
                .collect();
            for path in stale {
                self.remote.remove(&path);
                removed += 1;
            }
        }

        removed
    }

    /// Atomically rewrites the cache file: writes to a temporary file in the
    /// same directory, then renames it into place.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if either the write or the rename fails.
    pub fn flush(&self) -> Result<(), Error> {
        let on_disk = OnDiskCache {
            block_size: BLOCK_SIZE,
            local: self.local.clone(),
            remote: self.remote.clone(),
        };

        let serialized = serde_json::to_string_pretty(&on_disk).expect("cache is always encodable");

        let parent = self
            .cache_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let tmp_path = parent.join(format!(
            ".{}.tmp",
            self.cache_file
                .file_name()
                .map_or_else(|| "cache".to_owned(), |n| n.to_string_lossy().into_owned())
        ));

        fs::write(&tmp_path, serialized).map_err(|source| Error::Io {
            path: tmp_path.clone(),
            source,
        })?;

        fs::rename(&tmp_path, &self.cache_file).map_err(|source| Error::Io {
            path: self.cache_file.clone(),
            source,
        })?;

        tracing::debug!(path = %self.cache_file.display(), "flushed metadata cache");
        Ok(())
    }

    /// Discards every cached entry, local and remote, in memory. Callers who
    /// want the cache file itself cleared must also call
    /// [`MetadataCache::flush`].
    pub fn clear(&mut self) {
        self.local.clear();
        self.remote.clear();
    }

    /// Number of entries currently held in the local view.
    #[must_use]
    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    /// Number of entries currently held in the remote view.
    #[must_use]
    pub fn remote_len(&self) -> usize {
        self.remote.len()
    }
}

fn disk_mtime_is_newer(path: &str, cached_mtime: f64) -> bool {
    let Ok(metadata) = fs::metadata(path) else {
        return true;
    };
    let Ok(modified) = metadata.modified() else {
        return true;
    };
    let Ok(elapsed) = modified.duration_since(std::time::UNIX_EPOCH) else {
        return true;
    };
    elapsed.as_secs_f64() > cached_mtime
}

#[cfg(test)]
mod tests {
    use super::*;
    use fingerprint::fingerprint_bytes;
    use std::io::Write as _;

    #[test]
    fn missing_cache_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MetadataCache::load(dir.path().join("nope.json")).unwrap();
        assert_eq!(cache.local_len(), 0);
        assert_eq!(cache.remote_len(), 0);
    }

    #[test]
    fn flush_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join(".cache.json");

        let mut cache = MetadataCache::load(&cache_path).unwrap();
        cache.update_remote(fingerprint_bytes("remote/a.txt", b"hello"));
        cache.update_local(fingerprint_bytes("local/a.txt", b"hello"));
        cache.flush().unwrap();

        let reloaded = MetadataCache::load(&cache_path).unwrap();
        assert_eq!(reloaded.local_len(), 1);
        assert_eq!(reloaded.remote_len(), 1);
        assert_eq!(
            reloaded.get_remote("remote/a.txt").unwrap().whole_digest,
            fingerprint_bytes("x", b"hello").whole_digest
        );
    }

    #[test]
    fn cache_with_mismatched_block_size_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join(".cache.json");

        let stale = OnDiskCache {
            block_size: BLOCK_SIZE + 1,
            local: BTreeMap::new(),
            remote: BTreeMap::from([(
                "remote/a.txt".to_owned(),
                fingerprint_bytes("remote/a.txt", b"hello"),
            )]),
        };
        fs::write(&cache_path, serde_json::to_string(&stale).unwrap()).unwrap();

        let cache = MetadataCache::load(&cache_path).unwrap();
        assert_eq!(cache.remote_len(), 0);
    }

    #[test]
    fn refresh_local_reuses_cache_when_mtime_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("f.txt");
        fs::File::create(&file_path)
            .unwrap()
            .write_all(b"v1")
            .unwrap();

        let mut cache = MetadataCache::load(dir.path().join(".cache.json")).unwrap();
        let first = cache
            .refresh_local(&file_path.to_string_lossy())
            .unwrap()
            .clone();

        // Second refresh without touching the file should return identical data.
        let second = cache
            .refresh_local(&file_path.to_string_lossy())
            .unwrap()
            .clone();
        assert_eq!(first.whole_digest, second.whole_digest);
    }

    #[test]
    fn prune_local_keeps_entries_whose_file_still_exists() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("still_here.txt");
        fs::File::create(&file_path).unwrap();

        let mut cache = MetadataCache::load(dir.path().join(".cache.json")).unwrap();
        cache.update_local(fingerprint::fingerprint_file(&file_path).unwrap());
        cache.update_local(fingerprint_bytes(
            &dir.path().join("gone.txt").to_string_lossy(),
            b"x",
        ));

        let removed = cache.prune(Some(&dir.path().to_string_lossy()), None);
        assert_eq!(removed, 1);
        assert_eq!(cache.local_len(), 1);
        assert!(cache.get_local(&file_path.to_string_lossy()).is_some());
    }

    #[test]
    fn clear_empties_both_views() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = MetadataCache::load(dir.path().join(".cache.json")).unwrap();
        cache.update_remote(fingerprint_bytes("/ws/a.txt", b"1"));
        cache.update_local(fingerprint_bytes("/ws/a.txt", b"1"));

        cache.clear();

        assert_eq!(cache.local_len(), 0);
        assert_eq!(cache.remote_len(), 0);
    }

    #[test]
    fn prune_remote_removes_by_prefix_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = MetadataCache::load(dir.path().join(".cache.json")).unwrap();
        cache.update_remote(fingerprint_bytes("/ws/a.txt", b"1"));
        cache.update_remote(fingerprint_bytes("/ws/b.txt", b"2"));
        cache.update_remote(fingerprint_bytes("/other/c.txt", b"3"));

        let removed = cache.prune(None, Some("/ws/"));
        assert_eq!(removed, 2);
        assert_eq!(cache.remote_len(), 1);
    }
}
