#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `checksums` provides the strong content-hashing primitive used to fingerprint
//! files and fixed-size blocks for the delta-sync engine. It exposes a single
//! streaming MD5 implementation behind the [`strong::StrongDigest`] trait so
//! higher layers never depend on a concrete hasher type.
//!
//! # Design
//!
//! The crate offers one module, [`strong`], which wraps the `md-5` crate in a
//! small streaming API: callers feed bytes incrementally via `update` and read
//! back the final digest via `finalize`. MD5 was chosen for parity with the
//! synchronisation protocol this workspace implements, not for cryptographic
//! strength; digests here identify content for change detection, not for
//! tamper resistance.
//!
//! # Invariants
//!
//! - Digests never panic; failures are not representable because hashing a
//!   byte slice cannot fail.
//! - Digest output is always 16 bytes (`Md5::DIGEST_LEN`).
//!
//! # Examples
//!
//! ```
//! use checksums::strong::Md5;
//!
//! let mut md5 = Md5::new();
//! md5.update(b"hello");
//! let digest = md5.finalize();
//! assert_eq!(
//!     digest,
//!     [
//!         0x5d, 0x41, 0x40, 0x2a, 0xbc, 0x4b, 0x2a, 0x76,
//!         0xb9, 0x71, 0x9d, 0x91, 0x10, 0x17, 0xc5, 0x92,
//!     ]
//! );
//! ```
//!
//! # See also
//!
//! - [`fingerprint`] for the per-file and per-block digest types built on top
//!   of this crate.

pub mod strong;
