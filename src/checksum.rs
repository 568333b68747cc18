//! Per-entry protection bytes.
//!
//! The checksum covers everything that identifies a record: user key, the
//! packed seqno+kind word and the value. It is truncated to the configured
//! width when stored, so wider settings detect more corruption.

use std::hash::Hasher;

/// Widths accepted for `protection_bytes_per_key`
pub(crate) const VALID_PROTECTION_WIDTHS: [usize; 5] = [0, 1, 2, 4, 8];

pub(crate) fn entry_checksum(user_key: &[u8], packed: u64, value: &[u8]) -> u64 {
    let mut hasher = seahash::SeaHasher::default();
    hasher.write(user_key);
    hasher.write(&packed.to_le_bytes());
    hasher.write(value);
    hasher.finish()
}

/// Compares stored protection bytes against a freshly computed checksum
pub(crate) fn verify(stored: &[u8], user_key: &[u8], packed: u64, value: &[u8]) -> bool {
    let expected = entry_checksum(user_key, packed, value).to_le_bytes();
    stored == &expected[..stored.len()]
}
