use crate::index;
use crate::value::{decode_entry, LookupKey, ParsedEntry};
use crate::Result;

/// Forward/backward cursor over a memtable's entries in internal-key
/// order.
///
/// Freshly created cursors are not positioned; call one of the seek
/// methods before reading. The cursor borrows the memtable, so yielded
/// entries stay valid for the memtable's lifetime.
pub struct MemTableIter<'a> {
    inner: index::Iter<'a>,
    protection: usize,
}

impl<'a> MemTableIter<'a> {
    pub(crate) fn new(inner: index::Iter<'a>, protection: usize) -> Self {
        Self { inner, protection }
    }

    /// Whether the cursor points at an entry
    #[must_use]
    pub fn valid(&self) -> bool {
        self.inner.valid()
    }

    /// Decodes the entry at the current position.
    ///
    /// # Errors
    ///
    /// [`crate::Error::InvalidTag`] on a malformed entry.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if the cursor is not valid.
    pub fn entry(&self) -> Result<ParsedEntry<'a>> {
        unsafe { decode_entry(self.inner.entry(), self.protection) }
    }

    /// Advances to the first entry at or after `key`
    pub fn seek(&mut self, key: &LookupKey) {
        self.inner.seek(key.internal_key());
    }

    /// Retreats to the last entry at or before `key`
    pub fn seek_for_prev(&mut self, key: &LookupKey) {
        self.inner.seek_for_prev(key.internal_key());
    }

    /// Positions at the first entry; valid iff the memtable is non-empty
    pub fn seek_to_first(&mut self) {
        self.inner.seek_to_first();
    }

    /// Positions at the last entry; valid iff the memtable is non-empty
    pub fn seek_to_last(&mut self) {
        self.inner.seek_to_last();
    }

    /// Advances to the next entry
    pub fn next(&mut self) {
        self.inner.next();
    }

    /// Retreats to the previous entry
    pub fn prev(&mut self) {
        self.inner.prev();
    }

    /// Jumps to a random entry
    pub fn random_seek(&mut self) {
        self.inner.random_seek();
    }
}
