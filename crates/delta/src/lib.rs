#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `delta` diffs a local [`fingerprint::FileFingerprint`] against a cached
//! remote one and produces a [`DeltaPlan`] describing the minimal bytes that
//! must cross the wire, plus a [`codec`] for turning that plan into the JSON
//! payload the remote file service understands.
//!
//! # Design
//!
//! Planning is split into two steps: [`classify`] is a pure function over two
//! fingerprints that decides `none` / `full` / `delta(indices)` without
//! touching the filesystem, and [`DeltaPlan::build`] extracts the actual bytes
//! for whichever indices the classification names. Keeping the classification
//! pure makes the planner's minimality directly testable without scratch
//! files.
//!
//! # Invariants
//!
//! - When the local and remote whole digests match, the plan is `none`.
//! - When exactly one block differs and sizes match, the plan is `delta` with
//!   exactly that one index.
//! - A shrinking file (fewer blocks than the remote fingerprint) always
//!   escalates to `full`: the block-overlay wire format cannot express
//!   truncation, so the planner must never emit a `delta` that implies one.
//!
//! # Errors
//!
//! [`Error::ExtractBlocks`] wraps I/O failures reading the blocks a
//! classification named for transport.
//!
//! # See also
//!
//! - [`fingerprint`] for the digests being compared.
//! - [`fileservice`] for the server-side application of a decoded plan.

pub mod codec;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use fingerprint::{FileFingerprint, BLOCK_SIZE};
use thiserror::Error;

/// Errors produced while building a [`DeltaPlan`] from a classification.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to read the local file while extracting block or full content.
    #[error("failed to read {path} while extracting blocks: {source}")]
    ExtractBlocks {
        /// Path being read.
        path: String,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },
}

/// Pure classification of how a file must be transported, without payload
/// bytes attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanKind {
    /// Remote fingerprint matches local; nothing to transfer.
    None,
    /// Remote fingerprint absent or the block-overlay format could not
    /// safely express the change (e.g. shrinkage); transfer the whole file.
    Full,
    /// Remote fingerprint known and differs; transfer only these block
    /// indices, in ascending order.
    Delta(Vec<usize>),
}

/// A delta plan with the transport payload resolved: the bytes (for `full`
/// and `delta`) alongside the classification metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaPlan {
    /// No bytes need to cross the wire.
    None {
        /// Size of the (unchanged) file.
        size: u64,
        /// Whole-file digest, shared by both ends.
        whole_digest: String,
    },
    /// The entire file content is transferred.
    Full {
        /// Size of the new content.
        size: u64,
        /// Whole-file digest of the new content.
        whole_digest: String,
        /// Raw file bytes.
        bytes: Vec<u8>,
    },
    /// Only the listed blocks are transferred; all other indices are
    /// implicitly unchanged on the receiving end.
    Delta {
        /// Size of the new content.
        size: u64,
        /// Whole-file digest of the new content.
        whole_digest: String,
        /// Changed block bytes, keyed by index.
        blocks: BTreeMap<usize, Vec<u8>>,
    },
}

/// Classifies how `local` must be transported relative to `remote`, per the
/// planner formula: absent remote is `full`; matching whole digests are
/// `none`; otherwise the set of indices whose block digest differs (or that
/// exist only locally) forms a `delta`, unless the file shrank, in which case
/// the plan escalates to `full`.
#[must_use]
pub fn classify(local: &FileFingerprint, remote: Option<&FileFingerprint>) -> PlanKind {
    let Some(remote) = remote else {
        return PlanKind::Full;
    };

    if remote.whole_digest == local.whole_digest {
        return PlanKind::None;
    }

    if local.block_count() < remote.block_count() {
        // The block-overlay applier can extend a file with zero-fill but can
        // never truncate it; a shrink can only be represented correctly as a
        // full replacement.
        return PlanKind::Full;
    }

    let changed: Vec<usize> = (0..local.block_count())
        .filter(|&i| {
            let local_digest = local.block(i);
            let remote_digest = remote.block(i);
            local_digest != remote_digest
        })
        .collect();

    PlanKind::Delta(changed)
}

impl DeltaPlan {
    /// Resolves a [`PlanKind`] into a full [`DeltaPlan`] by reading whichever
    /// bytes from `path` the classification requires.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExtractBlocks`] if reading the file fails.
    pub fn build(
        kind: PlanKind,
        path: impl AsRef<Path>,
        local: &FileFingerprint,
    ) -> Result<Self, Error> {
        match kind {
            PlanKind::None => Ok(DeltaPlan::None {
                size: local.size,
                whole_digest: local.whole_digest.clone(),
            }),
            PlanKind::Full => {
                let bytes = read_whole(path.as_ref())?;
                Ok(DeltaPlan::Full {
                    size: local.size,
                    whole_digest: local.whole_digest.clone(),
                    bytes,
                })
            }
            PlanKind::Delta(indices) => {
                let blocks = extract_blocks(path.as_ref(), &indices)?;
                Ok(DeltaPlan::Delta {
                    size: local.size,
                    whole_digest: local.whole_digest.clone(),
                    blocks,
                })
            }
        }
    }

    /// Builds a [`DeltaPlan`] directly from in-memory bytes rather than a
    /// path, for tests and for the server side, which already holds the new
    /// content in memory.
    #[must_use]
    pub fn build_from_bytes(kind: PlanKind, data: &[u8], local: &FileFingerprint) -> Self {
        match kind {
            PlanKind::None => DeltaPlan::None {
                size: local.size,
                whole_digest: local.whole_digest.clone(),
            },
            PlanKind::Full => DeltaPlan::Full {
                size: local.size,
                whole_digest: local.whole_digest.clone(),
                bytes: data.to_vec(),
            },
            PlanKind::Delta(indices) => {
                let mut blocks = BTreeMap::new();
                for index in indices {
                    let start = index * BLOCK_SIZE;
                    if start >= data.len() {
                        continue;
                    }
                    let end = (start + BLOCK_SIZE).min(data.len());
                    blocks.insert(index, data[start..end].to_vec());
                }
                DeltaPlan::Delta {
                    size: local.size,
                    whole_digest: local.whole_digest.clone(),
                    blocks,
                }
            }
        }
    }
}

fn read_whole(path: &Path) -> Result<Vec<u8>, Error> {
    std::fs::read(path).map_err(|source| Error::ExtractBlocks {
        path: path.to_string_lossy().into_owned(),
        source,
    })
}

fn extract_blocks(path: &Path, indices: &[usize]) -> Result<BTreeMap<usize, Vec<u8>>, Error> {
    let mut file = File::open(path).map_err(|source| Error::ExtractBlocks {
        path: path.to_string_lossy().into_owned(),
        source,
    })?;

    let mut blocks = BTreeMap::new();
    for &index in indices {
        file.seek(SeekFrom::Start((index * BLOCK_SIZE) as u64))
            .map_err(|source| Error::ExtractBlocks {
                path: path.to_string_lossy().into_owned(),
                source,
            })?;

        let mut buf = vec![0u8; BLOCK_SIZE];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..]).map_err(|source| Error::ExtractBlocks {
                path: path.to_string_lossy().into_owned(),
                source,
            })?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        if !buf.is_empty() {
            blocks.insert(index, buf);
        }
    }

    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fingerprint::fingerprint_bytes;

    #[test]
    fn absent_remote_is_full() {
        let local = fingerprint_bytes("p", b"hello");
        assert_eq!(classify(&local, None), PlanKind::Full);
    }

    #[test]
    fn matching_digests_is_none() {
        let local = fingerprint_bytes("p", b"hello");
        let remote = fingerprint_bytes("p", b"hello");
        assert_eq!(classify(&local, Some(&remote)), PlanKind::None);
    }

    #[test]
    fn single_block_edit_is_minimal_delta() {
        let mut data = vec![b'a'; 10_000];
        let remote_fp = fingerprint_bytes("p", &data);
        // Flip one byte in the middle block (index 1: bytes 4096..8192).
        data[5000] = b'b';
        let local_fp = fingerprint_bytes("p", &data);

        match classify(&local_fp, Some(&remote_fp)) {
            PlanKind::Delta(indices) => assert_eq!(indices, vec![1]),
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[test]
    fn growth_within_same_block_is_delta_of_that_block() {
        let data = vec![b'x'; 4_000];
        let remote_fp = fingerprint_bytes("p", &data);
        let mut grown = data;
        grown.extend(std::iter::repeat(b'y').take(200));
        let local_fp = fingerprint_bytes("p", &grown);

        match classify(&local_fp, Some(&remote_fp)) {
            PlanKind::Delta(indices) => assert_eq!(indices, vec![0]),
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[test]
    fn growth_beyond_block_boundary_adds_tail_index() {
        let data = vec![b'x'; 4_096];
        let remote_fp = fingerprint_bytes("p", &data);
        let mut grown = data;
        grown.extend(std::iter::repeat(b'y').take(10));
        let local_fp = fingerprint_bytes("p", &grown);

        match classify(&local_fp, Some(&remote_fp)) {
            PlanKind::Delta(indices) => assert_eq!(indices, vec![1]),
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[test]
    fn shrinkage_escalates_to_full() {
        let data = vec![b'x'; 9_000];
        let remote_fp = fingerprint_bytes("p", &data);
        let shrunk = &data[..100];
        let local_fp = fingerprint_bytes("p", shrunk);

        assert_eq!(classify(&local_fp, Some(&remote_fp)), PlanKind::Full);
    }

    #[test]
    fn build_from_bytes_extracts_only_named_blocks() {
        let mut data = vec![b'a'; 10_000];
        let remote_fp = fingerprint_bytes("p", &data);
        data[5000] = b'b';
        let local_fp = fingerprint_bytes("p", &data);

        let kind = classify(&local_fp, Some(&remote_fp));
        let plan = DeltaPlan::build_from_bytes(kind, &data, &local_fp);

        match plan {
            DeltaPlan::Delta { blocks, .. } => {
                assert_eq!(blocks.len(), 1);
                assert_eq!(blocks[&1], data[4096..8192]);
            }
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[test]
    fn build_reads_file_for_full_plan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, b"hello world").unwrap();
        let local_fp = fingerprint::fingerprint_file(&path).unwrap();

        let plan = DeltaPlan::build(PlanKind::Full, &path, &local_fp).unwrap();
        match plan {
            DeltaPlan::Full { bytes, .. } => assert_eq!(bytes, b"hello world"),
            other => panic!("expected full, got {other:?}"),
        }
    }
}
