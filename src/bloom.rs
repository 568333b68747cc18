//! A basic bloom filter over key prefixes and/or whole keys.
//!
//! Unlike a file-backed filter, this one is written to while readers probe
//! it, so the bit field is a slab of atomic words touched with relaxed
//! ordering. A probe that races with an add may miss the key; the caller
//! double-checks the index anyway, so this only costs a wasted lookup,
//! never a wrong result for previously published entries.

use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

const K: usize = 7;

#[derive(Debug)]
pub(crate) struct ConcurrentBloom {
    /// Raw bits as atomic words
    words: Box<[AtomicU64]>,

    /// Bit count
    m: usize,
}

impl ConcurrentBloom {
    /// Constructs a filter with the given bit budget, rounded up to whole
    /// words.
    pub fn with_bits(bits: usize) -> Self {
        let word_count = bits.max(64).div_ceil(64);

        Self {
            words: (0..word_count).map(|_| AtomicU64::new(0)).collect(),
            m: word_count * 64,
        }
    }

    fn split_hash(hash: u128) -> (usize, usize) {
        let h1 = (hash & 0xFFFF_FFFF_FFFF_FFFF) as usize;
        let h2 = ((hash >> 64) & 0xFFFF_FFFF_FFFF_FFFF) as usize;
        (h1, h2)
    }

    /// Adds the key to the filter
    pub fn add(&self, key: &[u8]) {
        let (h1, h2) = Self::split_hash(Self::get_hash(key));

        let mut hash = h1;
        for _ in 0..K {
            hash = hash.wrapping_add(K.wrapping_mul(h2));
            let idx = hash % self.m;

            self.words[idx / 64].fetch_or(1 << (idx % 64), Relaxed);
        }
    }

    /// Returns `true` if the item may be contained.
    ///
    /// Never a false negative for keys whose insertion happened-before
    /// this probe.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = Self::split_hash(Self::get_hash(key));

        let mut hash = h1;
        for _ in 0..K {
            hash = hash.wrapping_add(K.wrapping_mul(h2));
            let idx = hash % self.m;

            if self.words[idx / 64].load(Relaxed) & (1 << (idx % 64)) == 0 {
                return false;
            }
        }

        true
    }

    /// Gets the hash of a key
    fn get_hash(key: &[u8]) -> u128 {
        let mut hasher = seahash::SeaHasher::default();
        hasher.write(key);
        let h1 = hasher.finish();

        hasher.write(key);
        let h2 = hasher.finish();

        u128::from(h1) << 64 | u128::from(h2)
    }
}
