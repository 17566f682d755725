//! Strong checksum implementation used to fingerprint files and blocks.
//!
//! The sync engine only ever needs one algorithm: MD5, kept for wire
//! compatibility with the protocol's existing digest format. This module
//! exposes a streaming wrapper plus the [`StrongDigest`] trait so the rest of
//! the workspace can depend on the trait rather than the concrete hasher.

mod md5;

pub use md5::Md5;

/// Trait implemented by strong checksum algorithms used for fingerprinting.
///
/// Implementors provide a streaming interface: callers feed data
/// incrementally via [`Self::update`] and then obtain the final digest
/// through [`Self::finalize`]. The associated [`DIGEST_LEN`](Self::DIGEST_LEN)
/// constant exposes the byte width of the resulting hash so higher layers can
/// size buffers without hard-coding algorithm-specific knowledge.
///
/// # Examples
///
/// Compute an MD5 digest through the trait without depending on the concrete
/// hasher type.
///
/// ```
/// use checksums::strong::{Md5, StrongDigest};
///
/// let mut hasher = Md5::new();
/// hasher.update(b"example");
/// let digest = hasher.finalize();
/// assert_eq!(digest.as_ref().len(), Md5::DIGEST_LEN);
/// ```
pub trait StrongDigest: Sized {
    /// Type used to parameterise a new digest instance.
    type Seed: Default;

    /// Type returned when finalising the digest.
    type Digest: AsRef<[u8]> + Copy;

    /// Length of the final digest in bytes.
    const DIGEST_LEN: usize;

    /// Creates a new hasher with an empty state.
    fn new() -> Self {
        Self::with_seed(Default::default())
    }

    /// Creates a new hasher using the provided seed value.
    fn with_seed(seed: Self::Seed) -> Self;

    /// Feeds additional bytes into the digest state.
    fn update(&mut self, data: &[u8]);

    /// Finalises the digest and returns the resulting hash.
    fn finalize(self) -> Self::Digest;

    /// Convenience helper that hashes `data` in a single call.
    fn digest(data: &[u8]) -> Self::Digest {
        Self::digest_with_seed(Default::default(), data)
    }

    /// Convenience helper that hashes `data` using an explicit seed value.
    fn digest_with_seed(seed: Self::Seed, data: &[u8]) -> Self::Digest {
        let mut hasher = Self::with_seed(seed);
        hasher.update(data);
        hasher.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::{Md5, StrongDigest};

    #[test]
    fn md5_trait_round_trip_matches_inherent_api() {
        let input = b"trait-check";

        let mut via_trait = Md5::new();
        via_trait.update(input);
        let trait_digest = via_trait.finalize();

        assert_eq!(trait_digest.as_ref(), Md5::digest(input).as_ref());
    }
}
