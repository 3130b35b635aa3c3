//! The three hash families used across the store.
//!
//! All of them are incremental and safe to checkpoint mid-stream:
//!
//! - [`RollingChecksum`]: crc32c, used for chunk identification.
//! - [`SmallHash`]: adler32 over a 4 KiB sub-chunk of a transfer block.
//! - [`BigHash`]: 128-bit md5 identifying one 512 KiB transfer block.
//! - [`StrongHash`]: 512-bit sha512 identifying whole file content across
//!   backups. Sparse extents are folded into the digest as `(offset, len)`
//!   tuples so that two files with identical data bytes but different hole
//!   layouts hash differently.

use md5::{Digest as _, Md5};
use sha2::{Digest as _, Sha512};

/// Length of a finalized [`StrongHash`] digest.
pub const STRONG_HASH_LEN: usize = 64;
/// Length of a finalized [`BigHash`] digest.
pub const BIG_HASH_LEN: usize = 16;
/// Length of a serialized [`SmallHash`] digest.
pub const SMALL_HASH_LEN: usize = 4;

/// Incremental crc32c.
#[derive(Debug, Clone, Copy, Default)]
pub struct RollingChecksum(u32);

impl RollingChecksum {
    pub fn new() -> Self {
        RollingChecksum(0)
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.0 = crc32c::crc32c_append(self.0, bytes);
    }

    pub fn finalize(self) -> u32 {
        self.0
    }
}

/// Incremental adler32 for transfer sub-chunks.
#[derive(Debug, Clone, Default)]
pub struct SmallHash(adler2::Adler32);

impl SmallHash {
    pub fn new() -> Self {
        SmallHash(adler2::Adler32::new())
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.0.write_slice(bytes);
    }

    pub fn finalize(self) -> u32 {
        self.0.checksum()
    }
}

/// One-shot adler32 over a sub-chunk.
pub fn small_hash(bytes: &[u8]) -> u32 {
    let mut h = SmallHash::new();
    h.update(bytes);
    h.finalize()
}

/// Incremental 128-bit block hash.
#[derive(Clone, Default)]
pub struct BigHash(Md5);

impl BigHash {
    pub fn new() -> Self {
        BigHash(Md5::new())
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    pub fn finalize(self) -> [u8; BIG_HASH_LEN] {
        let mut out = [0u8; BIG_HASH_LEN];
        out.copy_from_slice(&self.0.finalize());
        out
    }
}

/// One-shot 128-bit block hash.
pub fn big_hash(bytes: &[u8]) -> [u8; BIG_HASH_LEN] {
    let mut h = BigHash::new();
    h.update(bytes);
    h.finalize()
}

/// Incremental 512-bit content hash with sparse-extent folding.
///
/// Data bytes feed the main digest. Skipped sparse regions feed their
/// `(offset, len)` coordinates into a secondary digest whose result is
/// folded into the main one at finalization, exactly once, and only if any
/// extent was recorded.
#[derive(Clone)]
pub struct StrongHash {
    data: Sha512,
    sparse: Sha512,
    has_sparse: bool,
}

impl Default for StrongHash {
    fn default() -> Self {
        Self::new()
    }
}

impl StrongHash {
    pub fn new() -> Self {
        StrongHash {
            data: Sha512::new(),
            sparse: Sha512::new(),
            has_sparse: false,
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.data.update(bytes);
    }

    /// Record a skipped sparse region. The bytes themselves are not hashed.
    pub fn sparse_extent(&mut self, offset: i64, len: i64) {
        self.has_sparse = true;
        self.sparse.update(offset.to_le_bytes());
        self.sparse.update(len.to_le_bytes());
    }

    pub fn finalize(self) -> [u8; STRONG_HASH_LEN] {
        let mut data = self.data;
        if self.has_sparse {
            data.update(self.sparse.finalize());
        }
        let mut out = [0u8; STRONG_HASH_LEN];
        out.copy_from_slice(&data.finalize());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_checksum_is_incremental() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let mut split = RollingChecksum::new();
        split.update(&data[..10]);
        split.update(&data[10..]);
        let mut whole = RollingChecksum::new();
        whole.update(data);
        assert_eq!(split.finalize(), whole.finalize());
    }

    #[test]
    fn big_hash_matches_md5() {
        // md5("abc") is a fixed reference value.
        assert_eq!(
            hex::encode(big_hash(b"abc")),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    #[test]
    fn small_hash_matches_adler32() {
        // adler32("Wikipedia") reference value.
        assert_eq!(small_hash(b"Wikipedia"), 0x11E60398);
    }

    #[test]
    fn strong_hash_without_extents_is_plain_sha512() {
        let mut h = StrongHash::new();
        h.update(b"hello");
        let mut plain = [0u8; STRONG_HASH_LEN];
        plain.copy_from_slice(&Sha512::digest(b"hello"));
        assert_eq!(h.finalize(), plain);
    }

    #[test]
    fn strong_hash_covers_extent_shape() {
        let mut a = StrongHash::new();
        a.update(b"data");
        a.sparse_extent(4096, 8192);

        let mut b = StrongHash::new();
        b.update(b"data");
        b.sparse_extent(4096, 4096);

        let mut c = StrongHash::new();
        c.update(b"data");
        c.sparse_extent(4096, 8192);

        assert_ne!(a.clone().finalize(), b.finalize());
        assert_eq!(a.finalize(), c.finalize());
    }

    #[test]
    fn extent_order_matters() {
        let mut a = StrongHash::new();
        a.sparse_extent(0, 10);
        a.sparse_extent(20, 10);
        let mut b = StrongHash::new();
        b.sparse_extent(20, 10);
        b.sparse_extent(0, 10);
        assert_ne!(a.finalize(), b.finalize());
    }
}
