#![forbid(unsafe_code)]

//! Checksums over record bytes and payload blocks.

use xxhash_rust::xxh64;

/// Streaming checksum over byte slices.
pub trait Checksum {
    /// Digest produced by [`Checksum::finalize`].
    type Digest;

    /// Starts over as if nothing had been hashed.
    fn reset(&mut self);
    /// Feeds `bytes`.
    fn update(&mut self, bytes: &[u8]);
    /// Digest of everything fed since the last reset.
    fn finalize(&self) -> Self::Digest;
}

/// crc32 used for snapshot container trailers.
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    type Digest = u32;

    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// xxh64 used for whole-graph integrity hashes carried by payloads.
pub struct Xxh64 {
    seed: u64,
    inner: xxh64::Xxh64,
}

impl Xxh64 {
    /// A hasher starting from `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed,
            inner: xxh64::Xxh64::new(seed),
        }
    }
}

impl Default for Xxh64 {
    fn default() -> Self {
        Self::with_seed(0)
    }
}

impl Checksum for Xxh64 {
    type Digest = u64;

    fn reset(&mut self) {
        self.inner.reset(self.seed);
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u64 {
        self.inner.digest()
    }
}

/// Hashes a contiguous run of blob bytes in one call.
pub fn blob_range_hash(bytes: &[u8]) -> u64 {
    xxh64::xxh64(bytes, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_matches_oneshot() {
        let data = b"blob bytes split across updates";
        let mut hasher = Xxh64::default();
        hasher.update(&data[..10]);
        hasher.update(&data[10..]);
        assert_eq!(hasher.finalize(), blob_range_hash(data));
        hasher.reset();
        hasher.update(data);
        assert_eq!(hasher.finalize(), blob_range_hash(data));
    }

    #[test]
    fn crc_changes_with_content() {
        let mut a = Crc32Fast::default();
        a.update(b"uid");
        let first = a.finalize();
        a.update(b"more");
        assert_ne!(first, a.finalize());
    }
}
