#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `fingerprint` is the content-addressed store view of the sync engine: given
//! a file path it produces a [`FileFingerprint`] — a whole-file digest plus an
//! ordered list of fixed-size block digests — with no I/O state beyond reading
//! the file once.
//!
//! # Design
//!
//! [`fingerprint_file`] streams the file through [`checksums::strong::Md5`]
//! once, feeding both a whole-file hasher and a per-block hasher from the same
//! read loop so a file is never read twice. [`BLOCK_SIZE`] is a protocol
//! constant: changing it invalidates every previously persisted fingerprint,
//! so callers that cache fingerprints must record the block size alongside
//! them (see the `cache` crate).
//!
//! # Invariants
//!
//! - `blocks.len()` equals `ceil(size / BLOCK_SIZE)` for any fingerprinted
//!   file, and concatenating the bytes of each block in index order
//!   reproduces the content whose digest is `whole_digest`.
//! - Fingerprinting the same bytes twice, on any platform, yields bit-identical
//!   output: no endianness or locale dependence.
//!
//! # Errors
//!
//! [`Error::NotFound`] and [`Error::NotRegular`] cover the path-shape failures
//! a caller should expect; [`Error::Io`] covers everything else the filesystem
//! can raise mid-read.
//!
//! # See also
//!
//! - [`cache`] for the on-disk store of fingerprints keyed by path.
//! - [`delta`] for turning two fingerprints into a transport plan.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::time::UNIX_EPOCH;

use checksums::strong::{Md5, StrongDigest};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed block size, in bytes, used to chunk files for block-delta sync.
///
/// This is a protocol constant, not a tuning knob: two ends must agree on it
/// for delta plans to be meaningful.
pub const BLOCK_SIZE: usize = 4096;

/// Errors produced while computing a fingerprint.
#[derive(Debug, Error)]
pub enum Error {
    /// The path does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The path exists but is not a regular file (directory, socket, etc.).
    #[error("not a regular file: {0}")]
    NotRegular(String),
    /// An I/O error occurred while reading the file.
    #[error("I/O error reading {path}: {source}")]
    Io {
        /// Path being read when the error occurred.
        path: String,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },
}

/// The content fingerprint of a single file: whole-file digest plus per-block
/// digests, alongside the stat metadata observed at read time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    /// Path this fingerprint describes, as given to [`fingerprint_file`].
    pub path: String,
    /// Seconds since the epoch at the moment of read. Advisory only — never
    /// trusted for content equivalence; the digest is authoritative.
    pub mtime: f64,
    /// File size in bytes at the moment of read.
    pub size: u64,
    /// Hex-encoded MD5 digest of the full file content.
    pub whole_digest: String,
    /// Ordered block digests, keyed by `byte_offset / BLOCK_SIZE`.
    pub blocks: Vec<String>,
}

impl FileFingerprint {
    /// Returns the hex digest of block `index`, if present.
    #[must_use]
    pub fn block(&self, index: usize) -> Option<&str> {
        self.blocks.get(index).map(String::as_str)
    }

    /// Number of blocks in this fingerprint.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

/// Reads `path` once and computes its [`FileFingerprint`].
///
/// # Errors
///
/// Returns [`Error::NotFound`] if `path` does not exist, [`Error::NotRegular`]
/// if it exists but is not a regular file, or [`Error::Io`] for any other
/// failure encountered while reading.
pub fn fingerprint_file(path: impl AsRef<Path>) -> Result<FileFingerprint, Error> {
    let path = path.as_ref();
    let path_str = path.to_string_lossy().into_owned();

    let metadata = std::fs::symlink_metadata(path).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            Error::NotFound(path_str.clone())
        } else {
            Error::Io {
                path: path_str.clone(),
                source,
            }
        }
    })?;

    if !metadata.is_file() {
        return Err(Error::NotRegular(path_str));
    }

    let mut file = File::open(path).map_err(|source| Error::Io {
        path: path_str.clone(),
        source,
    })?;

    let stat = file.metadata().map_err(|source| Error::Io {
        path: path_str.clone(),
        source,
    })?;
    let mtime = stat
        .modified()
        .ok()
        .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
        .map_or(0.0, |d| d.as_secs_f64());

    let mut whole_hasher = Md5::new();
    let mut blocks = Vec::new();
    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut size: u64 = 0;

    loop {
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..]).map_err(|source| Error::Io {
                path: path_str.clone(),
                source,
            })?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }

        let chunk = &buf[..filled];
        whole_hasher.update(chunk);
        let block_digest = Md5::digest(chunk);
        blocks.push(hex_encode(&block_digest));
        size += filled as u64;

        if filled < buf.len() {
            break;
        }
    }

    let whole_digest = hex_encode(&whole_hasher.finalize());

    Ok(FileFingerprint {
        path: path_str,
        mtime,
        size,
        whole_digest,
        blocks,
    })
}

/// Computes a [`FileFingerprint`] for an in-memory byte string as if it had
/// been read from `logical_path`, without touching the filesystem.
///
/// Used by the remote file service to fingerprint content it just wrote, and
/// by tests exercising the planner without scratch files.
#[must_use]
pub fn fingerprint_bytes(logical_path: &str, data: &[u8]) -> FileFingerprint {
    let mut whole_hasher = Md5::new();
    let mut blocks = Vec::with_capacity(data.len().div_ceil(BLOCK_SIZE));

    for chunk in data.chunks(BLOCK_SIZE) {
        whole_hasher.update(chunk);
        blocks.push(hex_encode(&Md5::digest(chunk)));
    }

    FileFingerprint {
        path: logical_path.to_owned(),
        mtime: 0.0,
        size: data.len() as u64,
        whole_digest: hex_encode(&whole_hasher.finalize()),
        blocks,
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(&mut out, "{byte:02x}").expect("write! to String cannot fail");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn empty_file_has_zero_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.txt");
        File::create(&path).unwrap();

        let fp = fingerprint_file(&path).unwrap();
        assert_eq!(fp.size, 0);
        assert!(fp.blocks.is_empty());
        assert_eq!(fp.whole_digest, "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn block_count_matches_ceil_division() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ten_thousand.bin");
        let data = vec![b'a'; 10_000];
        File::create(&path).unwrap().write_all(&data).unwrap();

        let fp = fingerprint_file(&path).unwrap();
        assert_eq!(fp.size, 10_000);
        assert_eq!(fp.block_count(), 3);
    }

    #[test]
    fn short_last_block_digest_covers_only_its_bytes() {
        let data = vec![b'x'; 4_200];
        let fp = fingerprint_bytes("mem://x", &data);
        assert_eq!(fp.block_count(), 2);
        assert_eq!(fp.block(1).unwrap(), &hex_encode(&Md5::digest(&data[4096..])));
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let data = b"The quick brown fox jumps over the lazy dog".repeat(200);
        let a = fingerprint_bytes("mem://a", &data);
        let b = fingerprint_bytes("mem://a", &data);
        assert_eq!(a.whole_digest, b.whole_digest);
        assert_eq!(a.blocks, b.blocks);
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = fingerprint_file("/nonexistent/path/for/fingerprint/test").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn directory_is_not_regular() {
        let dir = tempfile::tempdir().unwrap();
        let err = fingerprint_file(dir.path()).unwrap_err();
        assert!(matches!(err, Error::NotRegular(_)));
    }

    #[test]
    fn on_disk_and_in_memory_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agree.bin");
        let data = vec![7u8; 9_001];
        File::create(&path).unwrap().write_all(&data).unwrap();

        let from_disk = fingerprint_file(&path).unwrap();
        let from_memory = fingerprint_bytes(&path.to_string_lossy(), &data);

        assert_eq!(from_disk.whole_digest, from_memory.whole_digest);
        assert_eq!(from_disk.blocks, from_memory.blocks);
        assert_eq!(from_disk.size, from_memory.size);
    }
}
