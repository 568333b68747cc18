use crate::coding::{get_fixed64, put_fixed64, put_varint32, read_varint32_raw, varint32_len};
use crate::{Error, Result};
use std::cmp::Ordering;
use std::sync::Arc;

/// User defined key
pub type UserKey = Arc<[u8]>;

/// User defined data (blob of bytes)
pub type UserValue = Arc<[u8]>;

/// Sequence number, a monotonically increasing counter
///
/// A value with a higher sequence number shadows an item with the
/// same key and lower sequence number. This enables MVCC.
///
/// Only the lower 56 bits are usable; the remaining byte of the packed
/// on-arena word carries the value kind.
pub type SeqNo = u64;

/// Largest usable sequence number (56 bits)
pub const MAX_SEQNO: SeqNo = (1 << 56) - 1;

/// Kind tag used when encoding seek targets, ordered before every real
/// kind of the same sequence number
const SEEK_KIND_TAG: u8 = u8::MAX;

/// Value kind (regular value, point/range tombstone or merge operand)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ValueKind {
    /// Deleted value (point tombstone)
    Deletion,

    /// Existing value
    Value,

    /// Delta to be combined with earlier values by the merge operator
    Merge,

    /// Tombstone covering the user-key range `[key, value)`
    RangeDeletion,
}

impl ValueKind {
    pub(crate) fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Deletion),
            1 => Some(Self::Value),
            2 => Some(Self::Merge),
            3 => Some(Self::RangeDeletion),
            _ => None,
        }
    }
}

impl From<ValueKind> for u8 {
    fn from(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Deletion => 0,
            ValueKind::Value => 1,
            ValueKind::Merge => 2,
            ValueKind::RangeDeletion => 3,
        }
    }
}

/// Packs a sequence number and a kind tag into the 8-byte trailer word.
///
/// Low byte = kind, upper 7 bytes = sequence number.
///
/// # Panics
///
/// Panics if `seqno` exceeds [`MAX_SEQNO`].
pub(crate) fn pack_seqno_and_kind(seqno: SeqNo, kind: u8) -> u64 {
    assert!(seqno <= MAX_SEQNO, "sequence number overflows 56 bits");
    (seqno << 8) | u64::from(kind)
}

pub(crate) fn unpack_seqno_and_kind(packed: u64) -> (SeqNo, u8) {
    (packed >> 8, (packed & 0xFF) as u8)
}

/// A decoded view of an entry stored in the arena
///
/// Borrows from the arena, so it is valid for as long as the owning
/// memtable is alive.
#[derive(Clone, Copy, Debug)]
pub struct ParsedEntry<'a> {
    /// User key bytes
    pub user_key: &'a [u8],

    /// Sequence number the entry was written at
    pub seqno: SeqNo,

    /// Entry kind
    pub kind: ValueKind,

    /// Value bytes (the end key for range deletions)
    pub value: &'a [u8],

    /// Per-entry protection bytes (empty if disabled)
    pub protection: &'a [u8],
}

impl<'a> ParsedEntry<'a> {
    /// Whether this entry logically removes data
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        matches!(self.kind, ValueKind::Deletion | ValueKind::RangeDeletion)
    }
}

/// Total encoded size of an entry in the arena
pub(crate) fn encoded_entry_len(key_len: usize, value_len: usize, protection: usize) -> usize {
    let ikey_len = key_len + 8;

    varint32_len(ikey_len as u32)
        + ikey_len
        + varint32_len(value_len as u32)
        + value_len
        + protection
}

/// Encodes an entry into `buf`, which must be exactly
/// [`encoded_entry_len`] bytes.
///
/// Layout: `varint32 ikey_len | user_key | packed seqno+kind (8B LE) |
/// varint32 value_len | value | protection bytes`
pub(crate) fn encode_entry_into(
    buf: &mut [u8],
    user_key: &[u8],
    seqno: SeqNo,
    kind: ValueKind,
    value: &[u8],
    protection: usize,
) {
    let packed = pack_seqno_and_kind(seqno, u8::from(kind));
    let mut pos = put_varint32(buf, (user_key.len() + 8) as u32);

    buf[pos..pos + user_key.len()].copy_from_slice(user_key);
    pos += user_key.len();

    put_fixed64(&mut buf[pos..], packed);
    pos += 8;

    pos += put_varint32(&mut buf[pos..], value.len() as u32);
    buf[pos..pos + value.len()].copy_from_slice(value);
    pos += value.len();

    if protection > 0 {
        let checksum = crate::checksum::entry_checksum(user_key, packed, value);
        buf[pos..pos + protection].copy_from_slice(&checksum.to_le_bytes()[..protection]);
        pos += protection;
    }

    debug_assert_eq!(pos, buf.len());
}

/// Returns the internal key portion (user key + packed trailer) of the
/// encoded entry at `ptr`.
///
/// # Safety
///
/// `ptr` must point at an entry encoded by [`encode_entry_into`] that
/// outlives `'a`.
pub(crate) unsafe fn decode_internal_key<'a>(ptr: *const u8) -> &'a [u8] {
    let (ikey_len, prefix) = unsafe { read_varint32_raw(ptr) };
    unsafe { std::slice::from_raw_parts(ptr.add(prefix), ikey_len as usize) }
}

/// Decodes the full entry at `ptr`.
///
/// # Safety
///
/// `ptr` must point at an entry encoded by [`encode_entry_into`] with the
/// same `protection` width, outliving `'a`.
pub(crate) unsafe fn decode_entry<'a>(ptr: *const u8, protection: usize) -> Result<ParsedEntry<'a>> {
    let ikey = unsafe { decode_internal_key(ptr) };
    let (user_key, trailer) = ikey.split_at(ikey.len() - 8);
    let (seqno, tag) = unpack_seqno_and_kind(get_fixed64(trailer));

    let kind = ValueKind::from_u8(tag).ok_or(Error::InvalidTag(tag))?;

    let value_ptr = unsafe { ikey.as_ptr().add(ikey.len()) };
    let (value_len, value_prefix) = unsafe { read_varint32_raw(value_ptr) };
    let value = unsafe { std::slice::from_raw_parts(value_ptr.add(value_prefix), value_len as usize) };

    let protection = unsafe {
        std::slice::from_raw_parts(value.as_ptr().add(value.len()), protection)
    };

    Ok(ParsedEntry {
        user_key,
        seqno,
        kind,
        value,
        protection,
    })
}

/// Compares two internal keys: user key ascending, then the packed
/// seqno+kind word descending (higher sequence numbers order first).
///
/// This ordering is load-bearing for every lookup in the crate.
pub(crate) fn compare_internal_keys(a: &[u8], b: &[u8]) -> Ordering {
    let (a_user, a_trailer) = a.split_at(a.len() - 8);
    let (b_user, b_trailer) = b.split_at(b.len() - 8);

    a_user
        .cmp(b_user)
        .then_with(|| get_fixed64(b_trailer).cmp(&get_fixed64(a_trailer)))
}

/// A point-lookup target: a user key plus the snapshot sequence number the
/// read may observe.
///
/// Encodes to the same representation the index traverses, positioned
/// before every visible entry of the user key and after every invisible
/// one.
pub struct LookupKey {
    data: Vec<u8>,
    key_offset: usize,
}

impl LookupKey {
    /// Creates a lookup key for `user_key` at the given snapshot.
    ///
    /// Pass [`MAX_SEQNO`] to observe the newest state.
    #[must_use]
    pub fn new(user_key: &[u8], snapshot: SeqNo) -> Self {
        let ikey_len = user_key.len() + 8;
        let prefix = varint32_len(ikey_len as u32);
        let mut data = vec![0; prefix + ikey_len];

        let key_offset = put_varint32(&mut data, ikey_len as u32);
        data[key_offset..key_offset + user_key.len()].copy_from_slice(user_key);
        put_fixed64(
            &mut data[key_offset + user_key.len()..],
            pack_seqno_and_kind(snapshot, SEEK_KIND_TAG),
        );

        Self { data, key_offset }
    }

    /// The user key this lookup targets
    #[must_use]
    pub fn user_key(&self) -> &[u8] {
        &self.data[self.key_offset..self.data.len() - 8]
    }

    /// The snapshot sequence number of this lookup
    #[must_use]
    pub fn snapshot(&self) -> SeqNo {
        let trailer = &self.data[self.data.len() - 8..];
        unpack_seqno_and_kind(get_fixed64(trailer)).0
    }

    pub(crate) fn internal_key(&self) -> &[u8] {
        &self.data[self.key_offset..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn encode(user_key: &[u8], seqno: SeqNo, kind: ValueKind, value: &[u8]) -> Vec<u8> {
        let mut buf = vec![0; encoded_entry_len(user_key.len(), value.len(), 0)];
        encode_entry_into(&mut buf, user_key, seqno, kind, value, 0);
        buf
    }

    #[test]
    fn entry_roundtrip() -> crate::Result<()> {
        let buf = encode(b"planet", 42, ValueKind::Value, b"fjord");

        let parsed = unsafe { decode_entry(buf.as_ptr(), 0)? };
        assert_eq!(b"planet", parsed.user_key);
        assert_eq!(42, parsed.seqno);
        assert_eq!(ValueKind::Value, parsed.kind);
        assert_eq!(b"fjord", parsed.value);
        assert!(parsed.protection.is_empty());

        Ok(())
    }

    #[test]
    fn entry_roundtrip_protected() -> crate::Result<()> {
        let mut buf = vec![0; encoded_entry_len(3, 3, 8)];
        encode_entry_into(&mut buf, b"abc", 7, ValueKind::Merge, b"xyz", 8);

        let parsed = unsafe { decode_entry(buf.as_ptr(), 8)? };
        assert_eq!(8, parsed.protection.len());
        assert_eq!(
            crate::checksum::entry_checksum(b"abc", pack_seqno_and_kind(7, 2), b"xyz").to_le_bytes(),
            parsed.protection
        );

        Ok(())
    }

    #[test]
    fn internal_key_ordering() {
        let a = encode(b"abc", 5, ValueKind::Value, b"");
        let b = encode(b"abc", 4, ValueKind::Value, b"");
        let c = encode(b"abd", 9, ValueKind::Value, b"");

        let (a, b, c) = unsafe {
            (
                decode_internal_key(a.as_ptr()),
                decode_internal_key(b.as_ptr()),
                decode_internal_key(c.as_ptr()),
            )
        };

        // Same user key: higher seqno orders first
        assert_eq!(Ordering::Less, compare_internal_keys(a, b));

        // Different user key: lexicographic
        assert_eq!(Ordering::Less, compare_internal_keys(b, c));
        assert_eq!(Ordering::Equal, compare_internal_keys(a, a));
    }

    #[test]
    fn lookup_key_orders_before_visible_entries() {
        let lookup = LookupKey::new(b"abc", 5);

        let visible = encode(b"abc", 5, ValueKind::Value, b"");
        let invisible = encode(b"abc", 6, ValueKind::Value, b"");

        let visible = unsafe { decode_internal_key(visible.as_ptr()) };
        let invisible = unsafe { decode_internal_key(invisible.as_ptr()) };

        assert_eq!(
            Ordering::Less,
            compare_internal_keys(lookup.internal_key(), visible)
        );
        assert_eq!(
            Ordering::Greater,
            compare_internal_keys(lookup.internal_key(), invisible)
        );
    }
}
