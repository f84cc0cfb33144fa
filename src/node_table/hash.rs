use md5::{Digest, Md5};

pub const CONTENT_HASH_LEN: usize = 16;

pub type ContentHash = [u8; CONTENT_HASH_LEN];

/// Digest of a term's encoded bytes. Equal terms hash equally; unequal terms
/// may collide, so a hash match is only ever a candidate.
pub trait ContentHasher: Clone + Send {
    fn hash(&self, encoded: &[u8]) -> ContentHash;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Md5ContentHasher;

impl ContentHasher for Md5ContentHasher {
    fn hash(&self, encoded: &[u8]) -> ContentHash {
        Md5::digest(encoded).into()
    }
}

/// Maps every term to the same few hashes. Only useful to exercise collision handling.
#[derive(Debug, Clone, Copy)]
pub struct BucketHasher {
    pub buckets: u8,
}

impl ContentHasher for BucketHasher {
    fn hash(&self, encoded: &[u8]) -> ContentHash {
        let bucket = encoded.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)) % self.buckets.max(1);
        let mut hash = [0; CONTENT_HASH_LEN];
        hash[CONTENT_HASH_LEN - 1] = bucket;
        hash
    }
}
