#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `fileservice` is the remote side of the sync protocol: a workspace-rooted
//! set of operations — list, read, write, delta application, batch sync,
//! mkdir — shared by both the block-delta and patch-sync modes.
//!
//! # Design
//!
//! Every mutating operation funnels through [`FileService::write_full`] or
//! [`FileService::apply_delta`], both of which recompute the file's
//! [`FileFingerprint`] after writing, store it in the server-side fingerprint
//! cache, and emit a `file_changed` notification. Fingerprinting is CPU-bound
//! relative to the async runtime, so it always runs on
//! [`tokio::task::spawn_blocking`] rather than inline.
//!
//! # Invariants
//!
//! - A `delta` plan is only accepted against a file that already exists
//!   ([`Error::NoBase`] otherwise); its block overlay never produces a file
//!   shorter than the plan's advertised size.
//! - [`FileService::batch_sync`] applies items in submission order and
//!   reports a result for every item, independent of earlier failures.
//!
//! # Errors
//!
//! See [`Error`] for the taxonomy; every variant maps to one HTTP status in
//! the `api` crate.
//!
//! # See also
//!
//! - [`delta`] for the plan this crate applies.
//! - [`patchsync`] for the git-backed alternative mode sharing these
//!   primitives.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use cache::MetadataCache;
use chrono::{DateTime, Utc};
use delta::DeltaPlan;
use fingerprint::{FileFingerprint, BLOCK_SIZE};
use notify_bus::{Message, NotifyBus};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors produced by remote file operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No entry exists at the given path.
    #[error("not found: {0}")]
    NotFound(String),
    /// The path exists but is not a directory where one was required.
    #[error("not a directory: {0}")]
    NotADirectory(String),
    /// The path exists but is a directory where a file was required.
    #[error("is a directory: {0}")]
    IsDirectory(String),
    /// The caller's expected digest disagreed with the computed one.
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Path being written.
        path: String,
        /// Digest the caller expected.
        expected: String,
        /// Digest actually computed from the bytes written.
        actual: String,
    },
    /// A `delta` plan targeted a path with no existing base file.
    #[error("no base file to apply delta to: {0}")]
    NoBase(String),
    /// A `delta` plan's block overlay would leave the file shorter than its
    /// advertised size — the block-overlay format cannot express shrinkage.
    #[error("delta for {0} would shrink the file below its advertised size")]
    ShrinkingDelta(String),
    /// Underlying I/O failure.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path being operated on.
        path: String,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },
    /// Failure computing or loading a fingerprint.
    #[error(transparent)]
    Fingerprint(#[from] fingerprint::Error),
    /// Failure reading or flushing the server-side fingerprint cache.
    #[error(transparent)]
    Cache(#[from] cache::Error),
    /// A blocking fingerprint task panicked instead of returning.
    #[error("background task panicked: {0}")]
    Join(String),
}

/// Kind of a directory entry returned by [`FileService::list`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// A regular file.
    File,
    /// A directory.
    Directory,
}

/// One entry returned by [`FileService::list`].
#[derive(Debug, Clone, Serialize)]
pub struct DirEntry {
    /// File or directory name (final path component).
    pub name: String,
    /// Path relative to the workspace root.
    pub path: String,
    /// Whether this entry is a file or a directory.
    pub kind: EntryKind,
    /// Size in bytes, for files.
    pub size: Option<u64>,
    /// Last-modified timestamp, for files.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Result of [`FileService::read`].
#[derive(Debug, Clone)]
pub struct ReadOutcome {
    /// Raw file content.
    pub bytes: Vec<u8>,
    /// Last-modified timestamp.
    pub last_modified: DateTime<Utc>,
    /// Whole-file digest.
    pub whole_digest: String,
    /// Full fingerprint.
    pub fingerprint: FileFingerprint,
}

/// Per-item outcome of [`FileService::batch_sync`].
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    /// Path this item targeted.
    pub path: String,
    /// The resulting fingerprint, on success.
    pub fingerprint: Option<FileFingerprint>,
    /// A human-readable failure description, on failure.
    pub error: Option<String>,
}

/// The workspace-rooted remote file service.
pub struct FileService {
    root: PathBuf,
    bus: NotifyBus,
    fingerprints: Mutex<MetadataCache>,
}

impl FileService {
    /// Opens a file service rooted at `root`, loading its fingerprint cache
    /// from `cache_file` (created empty if absent).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cache`] if `cache_file` exists but cannot be parsed.
    pub fn new(
        root: impl Into<PathBuf>,
        bus: NotifyBus,
        cache_file: impl Into<PathBuf>,
    ) -> Result<Self, Error> {
        let fingerprints = MetadataCache::load(cache_file)?;
        Ok(Self {
            root: root.into(),
            bus,
            fingerprints: Mutex::new(fingerprints),
        })
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    /// Lists the direct children of `dir`.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if `dir` does not exist, [`Error::NotADirectory`]
    /// if it exists but is not a directory.
    pub async fn list(&self, dir: &str) -> Result<Vec<DirEntry>, Error> {
        let full = self.resolve(dir);
        let metadata = tokio::fs::metadata(&full).await.map_err(|source| io_err(&full, source))?;
        if !metadata.is_dir() {
            return Err(Error::NotADirectory(dir.to_owned()));
        }

        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&full).await.map_err(|source| io_err(&full, source))?;
        while let Some(child) = read_dir.next_entry().await.map_err(|source| io_err(&full, source))? {
            let child_metadata = child.metadata().await.map_err(|source| io_err(&full, source))?;
            let name = child.file_name().to_string_lossy().into_owned();
            let rel_path = format!("{}/{name}", dir.trim_end_matches('/'));
            if child_metadata.is_dir() {
                entries.push(DirEntry {
                    name,
                    path: rel_path,
                    kind: EntryKind::Directory,
                    size: None,
                    last_modified: None,
                });
            } else {
                entries.push(DirEntry {
                    name,
                    path: rel_path,
                    kind: EntryKind::File,
                    size: Some(child_metadata.len()),
                    last_modified: modified_time(&child_metadata),
                });
            }
        }

        Ok(entries)
    }

    /// Reads the whole content of `path` plus its fingerprint.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if absent, [`Error::IsDirectory`] if `path` names
    /// a directory.
    pub async fn read(&self, path: &str) -> Result<ReadOutcome, Error> {
        let full = self.resolve(path);
        let metadata = tokio::fs::metadata(&full).await.map_err(|source| io_err(&full, source))?;
        if metadata.is_dir() {
            return Err(Error::IsDirectory(path.to_owned()));
        }

        let bytes = tokio::fs::read(&full).await.map_err(|source| io_err(&full, source))?;
        let fingerprint = compute_fingerprint(full.clone()).await?;
        let last_modified = modified_time(&metadata).unwrap_or_else(Utc::now);

        self.fingerprints.lock().await.update_local(fingerprint.clone());

        Ok(ReadOutcome {
            bytes,
            last_modified,
            whole_digest: fingerprint.whole_digest.clone(),
            fingerprint,
        })
    }

    /// Writes `bytes` as the full content of `path`, creating parent
    /// directories as needed, and returns the resulting fingerprint.
    ///
    /// # Errors
    ///
    /// [`Error::ChecksumMismatch`] if `expected_digest` is supplied and
    /// disagrees with the digest of `bytes`.
    pub async fn write_full(
        &self,
        path: &str,
        bytes: Vec<u8>,
        expected_digest: Option<&str>,
    ) -> Result<FileFingerprint, Error> {
        if let Some(expected) = expected_digest {
            let provisional = fingerprint::fingerprint_bytes(path, &bytes);
            if provisional.whole_digest != expected {
                return Err(Error::ChecksumMismatch {
                    path: path.to_owned(),
                    expected: expected.to_owned(),
                    actual: provisional.whole_digest,
                });
            }
        }

        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|source| io_err(parent, source))?;
        }
        tokio::fs::write(&full, &bytes).await.map_err(|source| io_err(&full, source))?;

        let fingerprint = compute_fingerprint(full).await?;
        self.fingerprints.lock().await.update_local(fingerprint.clone());
        self.flush_cache_quietly().await;

        self.bus.publish(Message::FileChanged {
            path: path.to_owned(),
            action: "write".to_owned(),
        });

        Ok(fingerprint)
    }

    /// Applies one delta plan to `path`.
    ///
    /// # Errors
    ///
    /// [`Error::NoBase`] if `plan` is a `delta` variant and `path` does not
    /// exist; [`Error::ShrinkingDelta`] if the overlay would shrink the file
    /// below its advertised size.
    pub async fn apply_delta(&self, path: &str, plan: DeltaPlan) -> Result<FileFingerprint, Error> {
        match plan {
            DeltaPlan::None { .. } => {
                let full = self.resolve(path);
                let fingerprint = compute_fingerprint(full).await?;
                self.fingerprints.lock().await.update_local(fingerprint.clone());
                Ok(fingerprint)
            }
            DeltaPlan::Full { bytes, .. } => self.write_full(path, bytes, None).await,
            DeltaPlan::Delta { size, blocks, .. } => {
                let full = self.resolve(path);
                if !tokio::fs::try_exists(&full).await.unwrap_or(false) {
                    return Err(Error::NoBase(path.to_owned()));
                }

                let mut content = tokio::fs::read(&full).await.map_err(|source| io_err(&full, source))?;
                overlay_blocks(&mut content, &blocks);

                if (content.len() as u64) < size {
                    return Err(Error::ShrinkingDelta(path.to_owned()));
                }
                content.truncate(size as usize);

                tokio::fs::write(&full, &content).await.map_err(|source| io_err(&full, source))?;

                let fingerprint = compute_fingerprint(full).await?;
                self.fingerprints.lock().await.update_local(fingerprint.clone());
                self.flush_cache_quietly().await;

                self.bus.publish(Message::FileChanged {
                    path: path.to_owned(),
                    action: "delta".to_owned(),
                });

                Ok(fingerprint)
            }
        }
    }

    /// Applies a sequence of `(path, plan)` items in order, reporting a
    /// result for every item regardless of earlier failures.
    pub async fn batch_sync(&self, items: Vec<(String, DeltaPlan)>) -> Vec<BatchOutcome> {
        let mut results = Vec::with_capacity(items.len());
        for (path, plan) in items {
            match self.apply_delta(&path, plan).await {
                Ok(fingerprint) => results.push(BatchOutcome {
                    path,
                    fingerprint: Some(fingerprint),
                    error: None,
                }),
                Err(source) => results.push(BatchOutcome {
                    path,
                    fingerprint: None,
                    error: Some(source.to_string()),
                }),
            }
        }
        results
    }

    /// Creates `path` (and its parents) if it does not already exist.
    ///
    /// # Errors
    ///
    /// [`Error::NotADirectory`] if a non-directory entry already occupies
    /// `path`.
    pub async fn mkdir(&self, path: &str) -> Result<(), Error> {
        let full = self.resolve(path);
        match tokio::fs::metadata(&full).await {
            Ok(metadata) if metadata.is_dir() => Ok(()),
            Ok(_) => Err(Error::NotADirectory(path.to_owned())),
            Err(source) if source.kind() == io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(&full).await.map_err(|source| io_err(&full, source))
            }
            Err(source) => Err(io_err(&full, source)),
        }
    }

    async fn flush_cache_quietly(&self) {
        if let Err(source) = self.fingerprints.lock().await.flush() {
            tracing::warn!(%source, "failed to flush server-side fingerprint cache");
        }
    }
}

fn overlay_blocks(content: &mut Vec<u8>, blocks: &BTreeMap<usize, Vec<u8>>) {
    for (&index, bytes) in blocks {
        let start = index * BLOCK_SIZE;
        let end = start + bytes.len();
        if content.len() < end {
            content.resize(end, 0);
        }
        content[start..end].copy_from_slice(bytes);
    }
}

async fn compute_fingerprint(path: PathBuf) -> Result<FileFingerprint, Error> {
    tokio::task::spawn_blocking(move || fingerprint::fingerprint_file(&path))
        .await
        .map_err(|source| Error::Join(source.to_string()))?
        .map_err(Error::from)
}

fn modified_time(metadata: &std::fs::Metadata) -> Option<DateTime<Utc>> {
    metadata.modified().ok().map(DateTime::<Utc>::from)
}

fn io_err(path: &Path, source: io::Error) -> Error {
    if source.kind() == io::ErrorKind::NotFound {
        Error::NotFound(path.to_string_lossy().into_owned())
    } else {
        Error::Io {
            path: path.to_string_lossy().into_owned(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(dir: &Path) -> FileService {
        FileService::new(dir, NotifyBus::new(), dir.join(".fp_cache.json")).unwrap()
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());

        let fp = svc.write_full("a.txt", b"hello".to_vec(), None).await.unwrap();
        assert_eq!(fp.size, 5);

        let read = svc.read("a.txt").await.unwrap();
        assert_eq!(read.bytes, b"hello");
        assert_eq!(read.whole_digest, fp.whole_digest);
    }

    #[tokio::test]
    async fn write_with_wrong_checksum_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());

        let err = svc
            .write_full("a.txt", b"hello".to_vec(), Some("deadbeef"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
        assert!(!dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn delta_without_base_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());

        let plan = DeltaPlan::Delta {
            size: 4,
            whole_digest: "x".to_owned(),
            blocks: BTreeMap::from([(0, b"data".to_vec())]),
        };
        let err = svc.apply_delta("missing.txt", plan).await.unwrap_err();
        assert!(matches!(err, Error::NoBase(_)));
    }

    #[tokio::test]
    async fn delta_overlays_single_block() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());

        let mut data = vec![b'a'; 10_000];
        svc.write_full("f.bin", data.clone(), None).await.unwrap();
        let remote_fp = fingerprint::fingerprint_bytes("f.bin", &data);

        data[5000] = b'b';
        let local_fp = fingerprint::fingerprint_bytes("f.bin", &data);
        let kind = delta::classify(&local_fp, Some(&remote_fp));
        let plan = DeltaPlan::build_from_bytes(kind, &data, &local_fp);

        let fp = svc.apply_delta("f.bin", plan).await.unwrap();
        assert_eq!(fp.whole_digest, local_fp.whole_digest);

        let read_back = svc.read("f.bin").await.unwrap();
        assert_eq!(read_back.bytes, data);
    }

    #[tokio::test]
    async fn list_reports_direct_children_only() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        svc.write_full("a.txt", b"1".to_vec(), None).await.unwrap();
        svc.mkdir("sub").await.unwrap();
        svc.write_full("sub/b.txt", b"2".to_vec(), None).await.unwrap();

        let entries = svc.list("").await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert!(names.contains(&"a.txt"));
        assert!(names.contains(&"sub"));
        assert!(!names.contains(&"b.txt"));
    }

    #[tokio::test]
    async fn mkdir_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        svc.mkdir("sub/dir").await.unwrap();
        svc.mkdir("sub/dir").await.unwrap();
        assert!(dir.path().join("sub/dir").is_dir());
    }

    #[tokio::test]
    async fn mkdir_over_existing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        svc.write_full("occupied", b"x".to_vec(), None).await.unwrap();
        let err = svc.mkdir("occupied").await.unwrap_err();
        assert!(matches!(err, Error::NotADirectory(_)));
    }

    #[tokio::test]
    async fn batch_sync_reports_independent_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());

        let ok_plan = DeltaPlan::Full {
            size: 2,
            whole_digest: "x".to_owned(),
            bytes: b"ok".to_vec(),
        };
        let bad_plan = DeltaPlan::Delta {
            size: 4,
            whole_digest: "y".to_owned(),
            blocks: BTreeMap::from([(0, b"data".to_vec())]),
        };

        let results = svc
            .batch_sync(vec![
                ("good.txt".to_owned(), ok_plan),
                ("missing.txt".to_owned(), bad_plan),
            ])
            .await;

        assert!(results[0].fingerprint.is_some());
        assert!(results[1].error.is_some());
    }
}
