//! The memtable: write and read façade over the ordered index.
//!
//! Thread-safety is explicit per operation. Mutating calls require either
//! external synchronization (the single-writer protocol) or
//! `allow_concurrent`, which switches the index to CAS insertion and moves
//! counter updates into a caller-owned [`PostWriteInfo`] that is merged
//! once the batch quiesces.

mod iterator;

pub use iterator::MemTableIter;

use crate::arena::Arena;
use crate::bloom::ConcurrentBloom;
use crate::coding::varint32_len;
use crate::index::{SkipIndex, Splice};
use crate::merge::MergeContext;
use crate::options::{InplaceDecision, Options};
use crate::range_tombstone::{
    FragmentedRangeTombstoneIterator, FragmentedRangeTombstoneList, RangeTombstone,
};
use crate::value::{
    decode_entry, encode_entry_into, encoded_entry_len, pack_seqno_and_kind, LookupKey, SeqNo,
    UserKey, UserValue, ValueKind, MAX_SEQNO,
};
use crate::{Error, Result};
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::atomic::{
    AtomicBool, AtomicI32, AtomicU64, AtomicU8, AtomicUsize,
    Ordering::{Acquire, Relaxed, Release},
};
use std::sync::{Arc, Mutex, RwLock};

const FLUSH_NOT_REQUESTED: u8 = 0;
const FLUSH_REQUESTED: u8 = 1;
const FLUSH_SCHEDULED: u8 = 2;

/// Batched counter deltas collected while inserting one write batch
/// concurrently; merged with [`MemTable::batch_post_process`] afterwards.
#[derive(Debug, Default)]
pub struct PostWriteInfo {
    /// Encoded bytes added
    pub data_size: u64,

    /// Entries added
    pub num_entries: u64,

    /// Point and range tombstones added
    pub num_deletes: u64,
}

/// Per-read options
#[derive(Clone, Debug)]
pub struct ReadOptions {
    /// When `false`, merge operands are collected into the merge context
    /// but never combined; the base value is recorded separately.
    pub do_merge: bool,

    /// Whether the caller knows this memtable to be immutable, allowing
    /// the cached fragmented tombstone list to be used. `false` is always
    /// correct, just slower.
    pub immutable: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            do_merge: true,
            immutable: false,
        }
    }
}

/// Outcome of a point lookup
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LookupResult {
    /// The key has no entry in this memtable; consult older data
    NotPresent,

    /// A value was found (possibly the result of combining merge operands)
    Found {
        /// The value bytes
        value: UserValue,

        /// Sequence number of the newest visible entry
        seqno: SeqNo,
    },

    /// The key is deleted at this snapshot
    Deleted {
        /// Sequence number of the deletion
        seqno: SeqNo,
    },

    /// Merge operands were collected but no base value was reached
    MergeInProgress,
}

/// Outcome of [`MemTable::update_callback`]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpdateOutcome {
    /// The existing value was rewritten in place
    UpdatedInPlace,

    /// A new entry was added instead
    Added,

    /// No plain value exists for the key, or the callback declined
    NotFound,
}

/// One key of a batched lookup
pub struct MultiGetEntry {
    /// The lookup target
    pub key: LookupKey,

    /// Collected merge operands for this key
    pub merge_context: MergeContext,

    /// Highest covering range-tombstone sequence seen so far
    pub max_covering_tombstone_seq: SeqNo,

    /// Set once any memtable resolves the key
    pub result: Option<LookupResult>,
}

impl MultiGetEntry {
    /// Creates an unresolved batch entry
    #[must_use]
    pub fn new(key: LookupKey) -> Self {
        Self {
            key,
            merge_context: MergeContext::default(),
            max_covering_tombstone_seq: 0,
            result: None,
        }
    }
}

/// Approximate entry statistics for a key range
#[derive(Clone, Copy, Debug, Default)]
pub struct TableStats {
    /// Approximate entry count
    pub count: u64,

    /// Approximate encoded size in bytes
    pub size: u64,
}

/// In-memory write buffer holding recently written records in key order
pub struct MemTable {
    options: Options,

    arena: Arc<Arena>,
    table: SkipIndex,

    /// Separate index for range tombstones, scanned only when non-empty
    range_del_table: SkipIndex,
    is_range_del_table_empty: AtomicBool,

    data_size: AtomicU64,
    num_entries: AtomicU64,
    num_deletes: AtomicU64,

    /// Flush target; dynamically adjustable
    write_buffer_size: AtomicUsize,

    flush_state: AtomicU8,
    flush_in_progress: AtomicBool,
    flush_completed: AtomicBool,

    /// Sequence number of the first inserted entry, 0 while empty
    first_seqno: AtomicU64,

    /// Lower bound for every sequence number this memtable may receive
    earliest_seqno: AtomicU64,

    creation_seqno: AtomicU64,

    /// Identifier assigned by the owning list, used to track flushes
    id: AtomicU64,

    refs: AtomicI32,

    bloom: Option<ConcurrentBloom>,

    /// Striped locks guarding in-place value rewrites; empty unless
    /// `inplace_update_support` is on
    inplace_locks: Vec<RwLock<()>>,

    /// Cached insert positions grouped by key prefix, single-writer only
    insert_hints: Mutex<HashMap<Box<[u8]>, Box<Splice>>>,

    /// Built at the immutability transition when range tombstones exist
    fragmented_tombstones: Mutex<Option<Arc<FragmentedRangeTombstoneList>>>,

    /// Refreshed by `approximate_memory_usage`
    approximate_memory_usage: AtomicUsize,
}

impl MemTable {
    /// Creates an empty memtable.
    ///
    /// `earliest_seqno` must be a lower bound for every sequence number
    /// that will be written here; when unknown, [`MAX_SEQNO`] may be used
    /// at the cost of blocking some callers until the first insert.
    #[must_use]
    pub fn new(options: Options, earliest_seqno: SeqNo) -> Self {
        let arena = Arc::new(Arena::new(
            options.arena_block_size,
            options.memtable_huge_page_size,
        ));

        let table = SkipIndex::new(
            Arc::clone(&arena),
            options.index_max_height,
            options.index_branching_factor,
        );
        let range_del_table = SkipIndex::new(
            Arc::clone(&arena),
            options.index_max_height,
            options.index_branching_factor,
        );

        let bloom = (options.memtable_prefix_bloom_bits > 0)
            .then(|| ConcurrentBloom::with_bits(options.memtable_prefix_bloom_bits));

        let inplace_locks = if options.inplace_update_support {
            (0..options.inplace_update_num_locks)
                .map(|_| RwLock::new(()))
                .collect()
        } else {
            Vec::new()
        };

        Self {
            write_buffer_size: AtomicUsize::new(options.write_buffer_size),
            arena,
            table,
            range_del_table,
            is_range_del_table_empty: AtomicBool::new(true),
            data_size: AtomicU64::new(0),
            num_entries: AtomicU64::new(0),
            num_deletes: AtomicU64::new(0),
            flush_state: AtomicU8::new(FLUSH_NOT_REQUESTED),
            flush_in_progress: AtomicBool::new(false),
            flush_completed: AtomicBool::new(false),
            first_seqno: AtomicU64::new(0),
            earliest_seqno: AtomicU64::new(earliest_seqno),
            creation_seqno: AtomicU64::new(earliest_seqno),
            id: AtomicU64::new(0),
            refs: AtomicI32::new(0),
            bloom,
            inplace_locks,
            insert_hints: Mutex::new(HashMap::new()),
            fragmented_tombstones: Mutex::new(None),
            approximate_memory_usage: AtomicUsize::new(0),
            options,
        }
    }

    /// Adds an entry mapping `user_key` to `value` at `seqno` with the
    /// given kind. For range deletions, `value` is the exclusive end key.
    ///
    /// Without `allow_concurrent`, callers must hold the single-writer
    /// protocol. With it, any number of writers may add simultaneously and
    /// should pass a `post` accumulator, merged later via
    /// [`MemTable::batch_post_process`].
    ///
    /// # Errors
    ///
    /// - [`Error::TryAgain`] if the `(seqno, user_key)` combination
    ///   already exists; retry with a larger sequence number
    /// - [`Error::ArenaExhausted`] if allocation fails
    pub fn add(
        &self,
        seqno: SeqNo,
        kind: ValueKind,
        user_key: &[u8],
        value: &[u8],
        allow_concurrent: bool,
        mut post: Option<&mut PostWriteInfo>,
    ) -> Result<()> {
        let protection = self.options.protection_bytes_per_key;
        let encoded_len = encoded_entry_len(user_key.len(), value.len(), protection);

        let is_range_del = kind == ValueKind::RangeDeletion;
        let index = if is_range_del {
            &self.range_del_table
        } else {
            &self.table
        };

        let (handle, buf) = index.allocate_entry(encoded_len)?;
        encode_entry_into(buf, user_key, seqno, kind, value, protection);

        let inserted = if allow_concurrent {
            index.insert(handle, true)
        } else if is_range_del {
            index.insert(handle, false)
        } else {
            self.insert_sequential(index, handle, user_key)
        };

        if !inserted {
            return Err(Error::TryAgain);
        }

        if is_range_del {
            self.is_range_del_table_empty.store(false, Release);
        } else if let Some(bloom) = &self.bloom {
            if let Some(prefix) = self
                .options
                .prefix_extractor
                .as_ref()
                .and_then(|extractor| extractor.prefix(user_key))
            {
                bloom.add(prefix);
            }

            if self.options.memtable_whole_key_filtering {
                bloom.add(user_key);
            }
        }

        let is_delete = matches!(kind, ValueKind::Deletion | ValueKind::RangeDeletion);

        if let Some(post) = post.as_deref_mut() {
            post.data_size += encoded_len as u64;
            post.num_entries += 1;
            if is_delete {
                post.num_deletes += 1;
            }
        } else {
            self.data_size.fetch_add(encoded_len as u64, Relaxed);
            self.num_entries.fetch_add(1, Relaxed);
            if is_delete {
                self.num_deletes.fetch_add(1, Relaxed);
            }
            self.update_flush_state();
        }

        // The first accepted write claims first_seqno exactly once
        let mut first = self.first_seqno.load(Relaxed);
        while first == 0 || seqno < first {
            match self
                .first_seqno
                .compare_exchange_weak(first, seqno, Relaxed, Relaxed)
            {
                Ok(_) => break,
                Err(now) => first = now,
            }
        }

        // An unknown floor collapses to the first observed sequence
        let _ = self.earliest_seqno.compare_exchange(
            MAX_SEQNO,
            self.first_seqno.load(Relaxed),
            Relaxed,
            Relaxed,
        );
        debug_assert!(
            seqno >= self.earliest_seqno.load(Relaxed),
            "sequence number below the memtable's floor"
        );

        Ok(())
    }

    fn insert_sequential(
        &self,
        index: &SkipIndex,
        handle: crate::index::EntryHandle,
        user_key: &[u8],
    ) -> bool {
        if let Some(prefix) = self
            .options
            .insert_hint_prefix_extractor
            .as_ref()
            .and_then(|extractor| extractor.prefix(user_key))
        {
            let mut hints = self.insert_hints.lock().expect("lock is poisoned");
            let splice = hints
                .entry(prefix.into())
                .or_insert_with(|| Box::new(Splice::new()));

            return index.insert_with_hint(handle, splice);
        }

        index.insert(handle, false)
    }

    /// Merges counters collected by concurrent writers and refreshes the
    /// flush decision.
    pub fn batch_post_process(&self, post: &PostWriteInfo) {
        self.num_entries.fetch_add(post.num_entries, Relaxed);
        self.data_size.fetch_add(post.data_size, Relaxed);
        if post.num_deletes != 0 {
            self.num_deletes.fetch_add(post.num_deletes, Relaxed);
        }

        self.update_flush_state();
    }

    /// Point lookup at the snapshot carried by `key`.
    ///
    /// Walks the key's history from newest visible entry towards older
    /// ones, collecting merge operands until a base value or tombstone is
    /// reached. `max_covering_tombstone_seq` is raised to the highest
    /// range-tombstone sequence covering the key, which also shadows any
    /// older entries here and in older tables.
    ///
    /// # Errors
    ///
    /// [`Error::Corruption`] if an entry fails checksum verification.
    pub fn get(
        &self,
        key: &LookupKey,
        merge_context: &mut MergeContext,
        max_covering_tombstone_seq: &mut SeqNo,
        read_opts: &ReadOptions,
    ) -> Result<LookupResult> {
        if !self.is_range_del_table_empty.load(Acquire) {
            let list = self.fragmented_list(read_opts.immutable)?;
            let covering = list.max_covering_seqno(key.user_key(), key.snapshot());

            if covering > *max_covering_tombstone_seq {
                *max_covering_tombstone_seq = covering;
            }
        }

        if !self.may_contain(key.user_key()) {
            return Ok(LookupResult::NotPresent);
        }

        let _inplace_guard = self.inplace_lock(key.user_key()).map(|lock| {
            lock.read().expect("lock is poisoned")
        });

        let protection = self.options.protection_bytes_per_key;
        let mut iter = self.table.iter();
        iter.seek(key.internal_key());

        while iter.valid() {
            let entry = unsafe { decode_entry(iter.entry(), protection)? };

            if entry.user_key != key.user_key() {
                break;
            }

            self.verify_entry_checksum(&entry)?;

            let seqno = entry.seqno;

            // Entries at or below a covering range tombstone are deleted,
            // which ends the walk just like a point tombstone would
            if seqno <= *max_covering_tombstone_seq {
                return Ok(self.resolve_tombstone(
                    merge_context,
                    entry.user_key,
                    seqno,
                    read_opts.do_merge,
                ));
            }

            match entry.kind {
                ValueKind::Value => {
                    if !read_opts.do_merge {
                        merge_context.set_base(entry.value);
                        return Ok(LookupResult::Found {
                            value: entry.value.into(),
                            seqno,
                        });
                    }

                    if merge_context.is_empty() {
                        return Ok(LookupResult::Found {
                            value: entry.value.into(),
                            seqno,
                        });
                    }

                    let Some(operator) = &self.options.merge_operator else {
                        return Ok(LookupResult::MergeInProgress);
                    };

                    return match merge_context.full_merge(
                        operator.as_ref(),
                        entry.user_key,
                        Some(entry.value),
                    ) {
                        Some(merged) => Ok(LookupResult::Found {
                            value: merged.into(),
                            seqno,
                        }),
                        None => Ok(LookupResult::MergeInProgress),
                    };
                }
                ValueKind::Deletion => {
                    return Ok(self.resolve_tombstone(
                        merge_context,
                        entry.user_key,
                        seqno,
                        read_opts.do_merge,
                    ));
                }
                ValueKind::Merge => {
                    merge_context.push_operand(entry.value);
                    iter.next();
                }
                ValueKind::RangeDeletion => {
                    debug_assert!(false, "range tombstone in the point index");
                    break;
                }
            }
        }

        if merge_context.is_empty() {
            Ok(LookupResult::NotPresent)
        } else {
            Ok(LookupResult::MergeInProgress)
        }
    }

    /// Batched point lookups. Per-key ordering is not guaranteed; keys
    /// already resolved by a newer memtable are skipped.
    ///
    /// # Errors
    ///
    /// [`Error::Corruption`] if an entry fails checksum verification.
    pub fn multi_get(&self, entries: &mut [MultiGetEntry], read_opts: &ReadOptions) -> Result<()> {
        for entry in entries.iter_mut() {
            if entry.result.is_some() {
                continue;
            }

            let mut merge_context = std::mem::take(&mut entry.merge_context);
            let result = self.get(
                &entry.key,
                &mut merge_context,
                &mut entry.max_covering_tombstone_seq,
                read_opts,
            )?;
            entry.merge_context = merge_context;

            // Only a value or deletion settles a key. A merge still in
            // progress must stay open so older tables can supply its base;
            // the collected operands travel in the entry's merge context.
            if matches!(
                result,
                LookupResult::Found { .. } | LookupResult::Deleted { .. }
            ) {
                entry.result = Some(result);
            }
        }

        Ok(())
    }

    /// Rewrites `user_key`'s newest value in place when it has the same
    /// kind and enough room, otherwise adds a fresh entry at `seqno`.
    ///
    /// Requires external synchronization.
    ///
    /// # Panics
    ///
    /// Panics unless `inplace_update_support` is enabled.
    ///
    /// # Errors
    ///
    /// See [`MemTable::add`].
    pub fn update(&self, seqno: SeqNo, user_key: &[u8], value: &[u8]) -> Result<()> {
        assert!(
            self.options.inplace_update_support,
            "in-place updates are disabled"
        );

        let lookup = LookupKey::new(user_key, MAX_SEQNO);
        let protection = self.options.protection_bytes_per_key;

        let mut iter = self.table.iter();
        iter.seek(lookup.internal_key());

        if iter.valid() {
            let entry = unsafe { decode_entry(iter.entry(), protection)? };

            if entry.user_key == user_key
                && entry.kind == ValueKind::Value
                && entry.value.len() >= value.len()
                && varint32_len(entry.value.len() as u32) == varint32_len(value.len() as u32)
            {
                let lock = self
                    .inplace_lock(user_key)
                    .expect("inplace locks exist when the feature is on");
                let _guard = lock.write().expect("lock is poisoned");

                unsafe { self.overwrite_value(&entry, value) };
                self.update_flush_state();
                return Ok(());
            }
        }

        self.add(seqno, ValueKind::Value, user_key, value, false, None)
    }

    /// Merges `delta` into `user_key`'s newest plain value using the
    /// configured in-place callback.
    ///
    /// Requires external synchronization.
    ///
    /// # Panics
    ///
    /// Panics unless `inplace_update_support` is enabled and an
    /// `inplace_callback` is configured.
    ///
    /// # Errors
    ///
    /// See [`MemTable::add`].
    pub fn update_callback(
        &self,
        seqno: SeqNo,
        user_key: &[u8],
        delta: &[u8],
    ) -> Result<UpdateOutcome> {
        assert!(
            self.options.inplace_update_support,
            "in-place updates are disabled"
        );
        let callback = self
            .options
            .inplace_callback
            .clone()
            .expect("no inplace callback configured");

        let lookup = LookupKey::new(user_key, MAX_SEQNO);
        let protection = self.options.protection_bytes_per_key;

        let mut iter = self.table.iter();
        iter.seek(lookup.internal_key());

        if !iter.valid() {
            return Ok(UpdateOutcome::NotFound);
        }

        let entry = unsafe { decode_entry(iter.entry(), protection)? };
        if entry.user_key != user_key || entry.kind != ValueKind::Value {
            return Ok(UpdateOutcome::NotFound);
        }

        let prev_len = entry.value.len();

        let decision = {
            let lock = self
                .inplace_lock(user_key)
                .expect("inplace locks exist when the feature is on");
            let _guard = lock.write().expect("lock is poisoned");

            // The callback mutates the value bytes directly in the arena,
            // guarded by the striped write lock that readers also take.
            let value_buf = unsafe {
                std::slice::from_raw_parts_mut(entry.value.as_ptr().cast_mut(), prev_len)
            };

            match callback(value_buf, prev_len, delta) {
                InplaceDecision::UpdatedInplace { new_len } => {
                    assert!(new_len <= prev_len, "callback grew the value");

                    // Copy out before rewriting: the rewrite must not read
                    // from the bytes it overwrites
                    let rewritten = value_buf[..new_len].to_vec();

                    if varint32_len(new_len as u32) == varint32_len(prev_len as u32) {
                        unsafe { self.overwrite_value(&entry, &rewritten) };

                        self.update_flush_state();
                        return Ok(UpdateOutcome::UpdatedInPlace);
                    }

                    // The shorter length needs a narrower varint; fall
                    // through to an out-of-place add of the rewritten value
                    InplaceDecision::Updated(rewritten)
                }
                other => other,
            }
        };

        match decision {
            InplaceDecision::Failed => Ok(UpdateOutcome::NotFound),
            InplaceDecision::Updated(new_value) => {
                self.add(seqno, ValueKind::Value, user_key, &new_value, false, None)?;
                Ok(UpdateOutcome::Added)
            }
            InplaceDecision::UpdatedInplace { .. } => {
                unreachable!("handled under the lock")
            }
        }
    }

    /// Rewrites the value (and protection bytes) of an existing entry.
    ///
    /// # Safety
    ///
    /// The caller must hold the in-place write lock for the entry's key,
    /// and the new value's varint width must equal the old one.
    unsafe fn overwrite_value(&self, entry: &crate::value::ParsedEntry<'_>, new_value: &[u8]) {
        let old_width = varint32_len(entry.value.len() as u32);
        debug_assert_eq!(old_width, varint32_len(new_value.len() as u32));

        let base = entry.value.as_ptr().cast_mut();

        let mut width_buf = [0u8; crate::coding::MAX_VARINT32_LEN];
        let width = crate::coding::put_varint32(&mut width_buf, new_value.len() as u32);

        unsafe {
            std::ptr::copy_nonoverlapping(width_buf.as_ptr(), base.sub(old_width), width);
            std::ptr::copy_nonoverlapping(new_value.as_ptr(), base, new_value.len());
        }

        let protection = self.options.protection_bytes_per_key;
        if protection > 0 {
            let packed = pack_seqno_and_kind(entry.seqno, u8::from(entry.kind));
            let checksum =
                crate::checksum::entry_checksum(entry.user_key, packed, new_value).to_le_bytes();

            // Protection bytes sit right after the (possibly shortened)
            // value, where decoding will look for them
            unsafe {
                std::ptr::copy_nonoverlapping(
                    checksum.as_ptr(),
                    base.add(new_value.len()),
                    protection,
                );
            }
        }
    }

    /// Counts consecutive merge operands from the newest entry of the key
    /// towards older ones, stopping at the first non-merge entry.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTag`] on a malformed entry.
    pub fn count_successive_merges(&self, key: &LookupKey) -> Result<usize> {
        let protection = self.options.protection_bytes_per_key;
        let mut iter = self.table.iter();
        iter.seek(key.internal_key());

        let mut count = 0;
        while iter.valid() {
            let entry = unsafe { decode_entry(iter.entry(), protection)? };

            if entry.user_key != key.user_key() || entry.kind != ValueKind::Merge {
                break;
            }

            count += 1;
            iter.next();
        }

        Ok(count)
    }

    /// Cursor over all entries in internal-key order
    #[must_use]
    pub fn iter(&self) -> MemTableIter<'_> {
        MemTableIter::new(self.table.iter(), self.options.protection_bytes_per_key)
    }

    /// Iterator over fragmented range tombstones visible at `read_seq`,
    /// or `None` when no range tombstones exist.
    ///
    /// With `immutable`, a list cached at the immutability transition is
    /// reused; otherwise a fresh list is fragmented per call.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTag`] on a malformed tombstone entry.
    pub fn range_tombstone_iterator(
        &self,
        read_seq: SeqNo,
        immutable: bool,
    ) -> Result<Option<FragmentedRangeTombstoneIterator>> {
        if self.is_range_del_table_empty.load(Acquire) {
            return Ok(None);
        }

        Ok(Some(self.fragmented_list(immutable)?.iter_at(read_seq)))
    }

    /// Builds and caches the fragmented tombstone list; called at the
    /// immutability transition.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTag`] on a malformed tombstone entry.
    pub fn construct_fragmented_range_tombstones(&self) -> Result<()> {
        if self.is_range_del_table_empty.load(Acquire) {
            return Ok(());
        }

        let list = Arc::new(self.build_fragmented()?);
        *self.fragmented_tombstones.lock().expect("lock is poisoned") = Some(list);

        Ok(())
    }

    fn fragmented_list(&self, immutable: bool) -> Result<Arc<FragmentedRangeTombstoneList>> {
        if immutable {
            let mut cache = self.fragmented_tombstones.lock().expect("lock is poisoned");

            if let Some(list) = cache.as_ref() {
                return Ok(Arc::clone(list));
            }

            let list = Arc::new(self.build_fragmented()?);
            *cache = Some(Arc::clone(&list));
            return Ok(list);
        }

        Ok(Arc::new(self.build_fragmented()?))
    }

    fn build_fragmented(&self) -> Result<FragmentedRangeTombstoneList> {
        let protection = self.options.protection_bytes_per_key;
        let mut iter = self.range_del_table.iter();
        iter.seek_to_first();

        let mut tombstones = Vec::new();
        while iter.valid() {
            let entry = unsafe { decode_entry(iter.entry(), protection)? };
            self.verify_entry_checksum(&entry)?;

            tombstones.push(RangeTombstone {
                start_key: entry.user_key.into(),
                end_key: entry.value.into(),
                seqno: entry.seqno,
            });
            iter.next();
        }

        Ok(FragmentedRangeTombstoneList::from_tombstones(tombstones))
    }

    /// A tombstone (point or covering range) ends a key's walk: pending
    /// merge operands are combined over an empty base; without any, the
    /// deletion itself is the result.
    fn resolve_tombstone(
        &self,
        merge_context: &MergeContext,
        user_key: &[u8],
        seqno: SeqNo,
        do_merge: bool,
    ) -> LookupResult {
        if do_merge && !merge_context.is_empty() {
            if let Some(operator) = &self.options.merge_operator {
                return match merge_context.full_merge(operator.as_ref(), user_key, None) {
                    Some(merged) => LookupResult::Found {
                        value: merged.into(),
                        seqno,
                    },
                    None => LookupResult::MergeInProgress,
                };
            }
        }

        LookupResult::Deleted { seqno }
    }

    fn verify_entry_checksum(&self, entry: &crate::value::ParsedEntry<'_>) -> Result<()> {
        if entry.protection.is_empty() {
            return Ok(());
        }

        let packed = pack_seqno_and_kind(entry.seqno, u8::from(entry.kind));
        if crate::checksum::verify(entry.protection, entry.user_key, packed, entry.value) {
            Ok(())
        } else {
            log::warn!("checksum mismatch for key of {}B", entry.user_key.len());
            Err(Error::Corruption(format!(
                "entry checksum mismatch at seqno {}",
                entry.seqno
            )))
        }
    }

    fn may_contain(&self, user_key: &[u8]) -> bool {
        let Some(bloom) = &self.bloom else {
            return true;
        };

        if self.options.memtable_whole_key_filtering {
            return bloom.may_contain(user_key);
        }

        self.options
            .prefix_extractor
            .as_ref()
            .and_then(|extractor| extractor.prefix(user_key))
            .map_or(true, |prefix| bloom.may_contain(prefix))
    }

    fn inplace_lock(&self, user_key: &[u8]) -> Option<&RwLock<()>> {
        if self.inplace_locks.is_empty() {
            return None;
        }

        let mut hasher = seahash::SeaHasher::default();
        hasher.write(user_key);
        let idx = hasher.finish() as usize % self.inplace_locks.len();

        Some(&self.inplace_locks[idx])
    }

    /// Approximate entry count and size between two lookup targets
    #[must_use]
    pub fn approximate_stats(&self, start: &LookupKey, end: &LookupKey) -> TableStats {
        let lo = self.table.estimate_count(start.internal_key());
        let hi = self.table.estimate_count(end.internal_key());
        let count = hi.saturating_sub(lo);

        let entries = self.num_entries();
        let size = if entries > 0 {
            count * self.data_size() / entries
        } else {
            0
        };

        TableStats { count, size }
    }

    /// Collects roughly `target_sample_size` distinct random entries,
    /// returned as `(user_key, seqno)` pairs. The result size may deviate
    /// slightly from the target.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTag`] on a malformed entry.
    pub fn unique_random_sample(
        &self,
        target_sample_size: usize,
    ) -> Result<Vec<(UserKey, SeqNo)>> {
        let mut seen = std::collections::HashSet::new();
        let mut sample = Vec::new();
        let protection = self.options.protection_bytes_per_key;

        let mut iter = self.table.iter();

        for _ in 0..target_sample_size.saturating_mul(2) {
            if sample.len() >= target_sample_size {
                break;
            }

            iter.random_seek();
            if !iter.valid() {
                break;
            }

            if seen.insert(iter.entry() as usize) {
                let entry = unsafe { decode_entry(iter.entry(), protection)? };
                sample.push((entry.user_key.into(), entry.seqno));
            }
        }

        Ok(sample)
    }

    /// Bytes reserved by this memtable, refreshed into the fast counter
    #[must_use]
    pub fn approximate_memory_usage(&self) -> usize {
        let usage = self.arena.memory_usage();
        self.approximate_memory_usage.store(usage, Relaxed);
        usage
    }

    /// Cheap, possibly stale variant of
    /// [`MemTable::approximate_memory_usage`]
    #[must_use]
    pub fn approximate_memory_usage_fast(&self) -> usize {
        self.approximate_memory_usage.load(Relaxed)
    }

    /// Total entries added
    #[must_use]
    pub fn num_entries(&self) -> u64 {
        self.num_entries.load(Relaxed)
    }

    /// Total point and range tombstones added
    #[must_use]
    pub fn num_deletes(&self) -> u64 {
        self.num_deletes.load(Relaxed)
    }

    /// Total encoded bytes added
    #[must_use]
    pub fn data_size(&self) -> u64 {
        self.data_size.load(Relaxed)
    }

    /// Whether nothing was inserted yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.first_seqno.load(Relaxed) == 0
    }

    /// Sequence number of the first inserted entry, 0 while empty
    #[must_use]
    pub fn first_seqno(&self) -> SeqNo {
        self.first_seqno.load(Relaxed)
    }

    /// Lower bound for sequence numbers this memtable may receive
    #[must_use]
    pub fn earliest_seqno(&self) -> SeqNo {
        self.earliest_seqno.load(Relaxed)
    }

    /// Lowers or raises the sequence floor; used when recycling a
    /// memtable for an in-memory purge.
    pub fn set_earliest_seqno(&self, seqno: SeqNo) {
        self.earliest_seqno.store(seqno, Relaxed);
    }

    /// The owning database's sequence number when this memtable was
    /// created
    #[must_use]
    pub fn creation_seqno(&self) -> SeqNo {
        self.creation_seqno.load(Relaxed)
    }

    /// Overrides the creation sequence number before first use
    pub fn set_creation_seqno(&self, seqno: SeqNo) {
        self.creation_seqno.store(seqno, Relaxed);
    }

    /// Identifier assigned by the owning memtable list
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id.load(Relaxed)
    }

    /// Assigns the memtable's identifier
    pub fn set_id(&self, id: u64) {
        self.id.store(id, Relaxed);
    }

    /// Changes the flush target. Growing is refused while a bloom filter
    /// exists, since its bit budget was sized at construction.
    pub fn update_write_buffer_size(&self, new_size: usize) {
        if self.bloom.is_none() || new_size < self.write_buffer_size.load(Relaxed) {
            self.write_buffer_size.store(new_size, Relaxed);
        }
    }

    /// Snapshots cannot be honored once values mutate in place
    #[must_use]
    pub fn is_snapshot_supported(&self) -> bool {
        !self.options.inplace_update_support
    }

    /// Heuristic flush decision based on arena usage vs. the buffer target
    #[must_use]
    pub fn should_flush_now(&self) -> bool {
        self.approximate_memory_usage() >= self.write_buffer_size.load(Relaxed)
    }

    fn update_flush_state(&self) {
        if self.flush_state.load(Relaxed) == FLUSH_NOT_REQUESTED && self.should_flush_now() {
            // Only NOT_REQUESTED -> REQUESTED; the state never regresses
            let requested = self
                .flush_state
                .compare_exchange(
                    FLUSH_NOT_REQUESTED,
                    FLUSH_REQUESTED,
                    Relaxed,
                    Relaxed,
                )
                .is_ok();

            if requested {
                log::debug!(
                    "memtable {} requests flush at {}B",
                    self.id(),
                    self.approximate_memory_usage_fast()
                );
            }
        }
    }

    /// Whether this memtable asks to be flushed
    #[must_use]
    pub fn should_schedule_flush(&self) -> bool {
        self.flush_state.load(Relaxed) == FLUSH_REQUESTED
    }

    /// Claims flush scheduling; exactly one caller wins.
    pub fn mark_flush_scheduled(&self) -> bool {
        self.flush_state
            .compare_exchange(FLUSH_REQUESTED, FLUSH_SCHEDULED, Relaxed, Relaxed)
            .is_ok()
    }

    /// Marks that a flush has started
    pub fn set_flush_in_progress(&self, in_progress: bool) {
        self.flush_in_progress.store(in_progress, Relaxed);
    }

    /// Whether a flush has started
    #[must_use]
    pub fn flush_in_progress(&self) -> bool {
        self.flush_in_progress.load(Relaxed)
    }

    /// Freezes the memtable: no further inserts are allowed, and the
    /// fragmented range tombstone list is cached for readers.
    pub fn mark_immutable(&self) {
        self.table.mark_read_only();
        self.range_del_table.mark_read_only();

        if let Err(e) = self.construct_fragmented_range_tombstones() {
            // Readers will re-derive the list and surface this themselves
            log::warn!("could not cache fragmented range tombstones: {e}");
        }
    }

    /// Marks that all contained data has been persisted
    pub fn mark_flushed(&self) {
        self.flush_completed.store(true, Relaxed);
        log::debug!("memtable {} flushed", self.id());
    }

    /// Whether the memtable's data has been persisted
    #[must_use]
    pub fn is_flush_completed(&self) -> bool {
        self.flush_completed.load(Relaxed)
    }

    /// Increments the reference count.
    ///
    /// Requires external synchronization against [`MemTable::unref`] on
    /// the same memtable.
    pub fn acquire_ref(&self) {
        self.refs.fetch_add(1, Relaxed);
    }

    /// Decrements the reference count; returns `true` when the caller
    /// holds the last reference and must destroy the memtable.
    pub fn unref(&self) -> bool {
        let before = self.refs.fetch_sub(1, Relaxed);
        debug_assert!(before >= 1);
        before <= 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::FixedPrefixExtractor;
    use test_log::test;

    fn simple_get(memtable: &MemTable, key: &[u8], snapshot: SeqNo) -> LookupResult {
        let mut ctx = MergeContext::default();
        let mut tombstone_seq = 0;

        memtable
            .get(
                &LookupKey::new(key, snapshot),
                &mut ctx,
                &mut tombstone_seq,
                &ReadOptions::default(),
            )
            .expect("get should not fail")
    }

    #[test]
    fn add_and_get() -> crate::Result<()> {
        let memtable = MemTable::new(Options::default(), 0);

        memtable.add(1, ValueKind::Value, b"abc", b"xyz", false, None)?;

        assert_eq!(
            LookupResult::Found {
                value: b"xyz".as_slice().into(),
                seqno: 1
            },
            simple_get(&memtable, b"abc", MAX_SEQNO)
        );
        assert_eq!(
            LookupResult::NotPresent,
            simple_get(&memtable, b"abd", MAX_SEQNO)
        );

        assert_eq!(1, memtable.num_entries());
        assert_eq!(0, memtable.num_deletes());
        assert_eq!(1, memtable.first_seqno());
        assert!(!memtable.is_empty());

        Ok(())
    }

    #[test]
    fn duplicate_seqno_key_is_try_again() -> crate::Result<()> {
        let memtable = MemTable::new(Options::default(), 0);

        memtable.add(7, ValueKind::Value, b"k", b"a", false, None)?;

        assert!(matches!(
            memtable.add(7, ValueKind::Value, b"k", b"b", false, None),
            Err(Error::TryAgain)
        ));

        // A larger seqno succeeds
        memtable.add(8, ValueKind::Value, b"k", b"b", false, None)?;
        assert_eq!(2, memtable.num_entries());

        Ok(())
    }

    #[test]
    fn range_tombstone_covers_point_reads() -> crate::Result<()> {
        let memtable = MemTable::new(Options::default(), 0);

        memtable.add(1, ValueKind::Value, b"b", b"1", false, None)?;
        memtable.add(2, ValueKind::Value, b"x", b"2", false, None)?;
        memtable.add(5, ValueKind::RangeDeletion, b"a", b"c", false, None)?;

        assert_eq!(
            LookupResult::Deleted { seqno: 1 },
            simple_get(&memtable, b"b", MAX_SEQNO)
        );
        assert_eq!(
            LookupResult::Found {
                value: b"2".as_slice().into(),
                seqno: 2
            },
            simple_get(&memtable, b"x", MAX_SEQNO)
        );

        // Below the tombstone's sequence the value is visible again
        assert_eq!(
            LookupResult::Found {
                value: b"1".as_slice().into(),
                seqno: 1
            },
            simple_get(&memtable, b"b", 4)
        );

        assert_eq!(1, memtable.num_deletes());

        let tombstones: Vec<_> = memtable
            .range_tombstone_iterator(MAX_SEQNO, false)?
            .expect("should have tombstones")
            .collect();
        assert_eq!(1, tombstones.len());
        assert_eq!(5, tombstones[0].seqno);

        Ok(())
    }

    #[test]
    fn bloom_filters_misses() -> crate::Result<()> {
        let options = Options::default()
            .memtable_prefix_bloom_bits(8_192)
            .memtable_whole_key_filtering(true);
        let memtable = MemTable::new(options, 0);

        for i in 0..100u32 {
            memtable.add(
                SeqNo::from(i) + 1,
                ValueKind::Value,
                format!("key{i}").as_bytes(),
                b"v",
                false,
                None,
            )?;
        }

        for i in 0..100u32 {
            assert!(matches!(
                simple_get(&memtable, format!("key{i}").as_bytes(), MAX_SEQNO),
                LookupResult::Found { .. }
            ));
        }
        assert_eq!(
            LookupResult::NotPresent,
            simple_get(&memtable, b"missing", MAX_SEQNO)
        );

        Ok(())
    }

    #[test]
    fn insert_hints_with_prefix_extractor() -> crate::Result<()> {
        let options = Options::default()
            .insert_hint_prefix_extractor(Arc::new(FixedPrefixExtractor::new(4)));
        let memtable = MemTable::new(options, 0);

        // Two interleaved prefix streams, each ascending
        for i in 0..200u32 {
            memtable.add(
                u64::from(i) * 2 + 1,
                ValueKind::Value,
                format!("aaaa{i:05}").as_bytes(),
                b"1",
                false,
                None,
            )?;
            memtable.add(
                u64::from(i) * 2 + 2,
                ValueKind::Value,
                format!("bbbb{i:05}").as_bytes(),
                b"2",
                false,
                None,
            )?;
        }

        let mut iter = memtable.iter();
        iter.seek_to_first();

        let mut keys = Vec::new();
        while iter.valid() {
            keys.push(iter.entry()?.user_key.to_vec());
            iter.next();
        }

        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(sorted, keys);
        assert_eq!(400, keys.len());

        Ok(())
    }

    #[test]
    fn inplace_update_rewrites_value() -> crate::Result<()> {
        let options = Options::default()
            .inplace_update_support(true)
            .protection_bytes_per_key(8);
        let memtable = MemTable::new(options, 0);

        memtable.add(1, ValueKind::Value, b"k", b"longvalue", false, None)?;

        // Same length: rewritten in place, entry count unchanged
        memtable.update(2, b"k", b"LONGVALUE")?;
        assert_eq!(1, memtable.num_entries());
        assert_eq!(
            LookupResult::Found {
                value: b"LONGVALUE".as_slice().into(),
                seqno: 1
            },
            simple_get(&memtable, b"k", MAX_SEQNO)
        );

        // Shorter: still in place (same varint width), checksum rewritten
        memtable.update(3, b"k", b"tiny")?;
        assert_eq!(1, memtable.num_entries());
        assert_eq!(
            LookupResult::Found {
                value: b"tiny".as_slice().into(),
                seqno: 1
            },
            simple_get(&memtable, b"k", MAX_SEQNO)
        );

        // Longer: falls through to a fresh add
        memtable.update(4, b"k", b"muchlongervalue")?;
        assert_eq!(2, memtable.num_entries());
        assert_eq!(
            LookupResult::Found {
                value: b"muchlongervalue".as_slice().into(),
                seqno: 4
            },
            simple_get(&memtable, b"k", MAX_SEQNO)
        );

        assert!(!memtable.is_snapshot_supported());

        Ok(())
    }

    #[test]
    fn update_callback_merges_in_place() -> crate::Result<()> {
        // Callback interprets the value as a decimal counter and adds the
        // delta to it, keeping the width
        let callback = Arc::new(
            |existing: &mut [u8], len: usize, delta: &[u8]| -> InplaceDecision {
                let current: u64 = std::str::from_utf8(&existing[..len])
                    .expect("utf8")
                    .parse()
                    .expect("number");
                let delta: u64 = std::str::from_utf8(delta)
                    .expect("utf8")
                    .parse()
                    .expect("number");

                let new = format!("{:0width$}", current + delta, width = len);
                existing[..len].copy_from_slice(new.as_bytes());
                InplaceDecision::UpdatedInplace { new_len: len }
            },
        );

        let options = Options::default()
            .inplace_update_support(true)
            .inplace_callback(callback);
        let memtable = MemTable::new(options, 0);

        assert_eq!(
            UpdateOutcome::NotFound,
            memtable.update_callback(1, b"counter", b"5")?
        );

        memtable.add(1, ValueKind::Value, b"counter", b"0000000010", false, None)?;

        assert_eq!(
            UpdateOutcome::UpdatedInPlace,
            memtable.update_callback(2, b"counter", b"32")?
        );
        assert_eq!(
            LookupResult::Found {
                value: b"0000000042".as_slice().into(),
                seqno: 1
            },
            simple_get(&memtable, b"counter", MAX_SEQNO)
        );
        assert_eq!(1, memtable.num_entries());

        Ok(())
    }

    #[test]
    fn corruption_is_detected() -> crate::Result<()> {
        let options = Options::default().protection_bytes_per_key(8);
        let memtable = MemTable::new(options, 0);

        memtable.add(1, ValueKind::Value, b"key", b"value", false, None)?;

        // Sanity: intact entry reads fine
        assert!(matches!(
            simple_get(&memtable, b"key", MAX_SEQNO),
            LookupResult::Found { .. }
        ));

        // Flip a value byte behind the checksum's back
        {
            let mut iter = memtable.iter();
            iter.seek_to_first();
            let entry = iter.entry()?;
            let p = entry.value.as_ptr().cast_mut();
            unsafe { *p ^= 0xFF };
        }

        let mut ctx = MergeContext::default();
        let mut tombstone_seq = 0;
        let result = memtable.get(
            &LookupKey::new(b"key", MAX_SEQNO),
            &mut ctx,
            &mut tombstone_seq,
            &ReadOptions::default(),
        );

        assert!(matches!(result, Err(Error::Corruption(_))));

        Ok(())
    }

    #[test]
    fn flush_state_machine() -> crate::Result<()> {
        let options = Options::default()
            .arena_block_size(4_096)
            .write_buffer_size(8_192);
        let memtable = MemTable::new(options, 0);

        assert!(!memtable.should_schedule_flush());

        // Only transitions through REQUESTED may claim scheduling
        assert!(!memtable.mark_flush_scheduled());

        let mut seqno = 1;
        while !memtable.should_schedule_flush() {
            memtable.add(
                seqno,
                ValueKind::Value,
                format!("key{seqno:08}").as_bytes(),
                &[0u8; 128],
                false,
                None,
            )?;
            seqno += 1;
        }

        assert!(memtable.mark_flush_scheduled());

        // Exactly one caller wins, and the state never regresses
        assert!(!memtable.mark_flush_scheduled());
        assert!(!memtable.should_schedule_flush());

        Ok(())
    }

    #[test]
    fn refcount_lifecycle() {
        let memtable = MemTable::new(Options::default(), 0);

        memtable.acquire_ref();
        memtable.acquire_ref();

        assert!(!memtable.unref());
        assert!(memtable.unref());
    }

    #[test]
    fn multi_get_short_circuits_resolved_keys() -> crate::Result<()> {
        let memtable = MemTable::new(Options::default(), 0);
        memtable.add(1, ValueKind::Value, b"a", b"1", false, None)?;
        memtable.add(2, ValueKind::Deletion, b"b", b"", false, None)?;

        let mut entries = vec![
            MultiGetEntry::new(LookupKey::new(b"a", MAX_SEQNO)),
            MultiGetEntry::new(LookupKey::new(b"b", MAX_SEQNO)),
            MultiGetEntry::new(LookupKey::new(b"c", MAX_SEQNO)),
        ];

        // Pretend a newer memtable already resolved "a"
        entries[0].result = Some(LookupResult::Deleted { seqno: 9 });

        memtable.multi_get(&mut entries, &ReadOptions::default())?;

        assert_eq!(Some(LookupResult::Deleted { seqno: 9 }), entries[0].result);
        assert_eq!(Some(LookupResult::Deleted { seqno: 2 }), entries[1].result);
        assert_eq!(None, entries[2].result);

        Ok(())
    }

    #[test]
    fn multi_get_leaves_pending_merges_open() -> crate::Result<()> {
        let memtable = MemTable::new(Options::default(), 0);
        memtable.add(4, ValueKind::Merge, b"k", b"X", false, None)?;

        let mut entries = vec![MultiGetEntry::new(LookupKey::new(b"k", MAX_SEQNO))];
        memtable.multi_get(&mut entries, &ReadOptions::default())?;

        // The merge is not final; an older table must supply the base, so
        // the key stays unresolved while its operands travel along
        assert_eq!(None, entries[0].result);
        assert_eq!(1, entries[0].merge_context.len());

        Ok(())
    }

    #[test]
    fn approximate_stats_scale_with_range() -> crate::Result<()> {
        let memtable = MemTable::new(Options::default(), 0);

        for i in 0..1_000u32 {
            memtable.add(
                u64::from(i) + 1,
                ValueKind::Value,
                format!("key{i:05}").as_bytes(),
                b"value",
                false,
                None,
            )?;
        }

        let all = memtable.approximate_stats(
            &LookupKey::new(b"key00000", MAX_SEQNO),
            &LookupKey::new(b"key99999", MAX_SEQNO),
        );
        let half = memtable.approximate_stats(
            &LookupKey::new(b"key00000", MAX_SEQNO),
            &LookupKey::new(b"key00500", MAX_SEQNO),
        );

        assert!(all.count > half.count);
        assert!(all.size > 0);

        Ok(())
    }

    #[test]
    fn unique_random_sample_returns_live_entries() -> crate::Result<()> {
        let memtable = MemTable::new(Options::default(), 0);

        for i in 0..500u32 {
            memtable.add(
                u64::from(i) + 1,
                ValueKind::Value,
                format!("key{i:05}").as_bytes(),
                b"v",
                false,
                None,
            )?;
        }

        let sample = memtable.unique_random_sample(50)?;
        assert!(!sample.is_empty());

        for (key, seqno) in &sample {
            assert!(key.starts_with(b"key"));
            assert!(*seqno >= 1 && *seqno <= 500);
        }

        let mut keys: Vec<_> = sample.iter().map(|(k, _)| k.clone()).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(sample.len(), keys.len(), "sample must be unique");

        Ok(())
    }
}
