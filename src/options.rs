use crate::checksum::VALID_PROTECTION_WIDTHS;
use crate::merge::MergeOperator;
use std::sync::Arc;

/// Extracts the prefix of a user key used for bloom filtering and insert
/// hints.
///
/// Returning `None` declares the key out of the extractor's domain; such
/// keys skip prefix-based optimizations entirely.
pub trait PrefixExtractor: Send + Sync {
    /// The prefix of `key`, or `None` if `key` is out of domain
    fn prefix<'a>(&self, key: &'a [u8]) -> Option<&'a [u8]>;
}

/// Prefix extractor taking the first `len` bytes of a key
pub struct FixedPrefixExtractor {
    len: usize,
}

impl FixedPrefixExtractor {
    /// Creates an extractor over the first `len` bytes
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self { len }
    }
}

impl PrefixExtractor for FixedPrefixExtractor {
    fn prefix<'a>(&self, key: &'a [u8]) -> Option<&'a [u8]> {
        key.get(..self.len)
    }
}

/// Decision returned by an in-place update callback
pub enum InplaceDecision {
    /// Nothing was or should be changed
    Failed,

    /// The existing buffer was rewritten in place to `new_len` bytes
    UpdatedInplace {
        /// Length of the rewritten value
        new_len: usize,
    },

    /// The merged value could not fit; add it as a fresh entry instead
    Updated(Vec<u8>),
}

/// Callback merging a delta into an existing value buffer.
///
/// Receives the existing value buffer (at its full current capacity), the
/// currently used length, and the delta.
pub type InplaceCallback = dyn Fn(&mut [u8], usize, &[u8]) -> InplaceDecision + Send + Sync;

/// Memtable configuration
#[derive(Clone)]
pub struct Options {
    /// Arena chunk granularity in bytes
    pub arena_block_size: usize,

    /// Flush target: once arena usage reaches this, a flush is requested
    pub write_buffer_size: usize,

    /// Size of the optional bloom filter in bits; 0 disables it
    pub memtable_prefix_bloom_bits: usize,

    /// Huge page preference handed to the arena as a block-size rounding
    /// hint; 0 disables
    pub memtable_huge_page_size: usize,

    /// Also add whole keys to the bloom filter, not only prefixes
    pub memtable_whole_key_filtering: bool,

    /// Enables `update`/`update_callback`. Memtables with this enabled do
    /// not support snapshots.
    pub inplace_update_support: bool,

    /// Size of the striped lock array guarding in-place value rewrites
    pub inplace_update_num_locks: usize,

    /// Cap on consecutive merge operands before the write path is expected
    /// to force a full combine; 0 disables the cap
    pub max_successive_merges: usize,

    /// Per-entry checksum width; one of 0 (disabled), 1, 2, 4 or 8
    pub protection_bytes_per_key: usize,

    /// Tower height cap of the ordered index
    pub index_max_height: usize,

    /// Branching factor of the ordered index
    pub index_branching_factor: u32,

    pub(crate) merge_operator: Option<Arc<dyn MergeOperator>>,
    pub(crate) prefix_extractor: Option<Arc<dyn PrefixExtractor>>,
    pub(crate) insert_hint_prefix_extractor: Option<Arc<dyn PrefixExtractor>>,
    pub(crate) inplace_callback: Option<Arc<InplaceCallback>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            arena_block_size: 65_536,
            write_buffer_size: 64 * 1_024 * 1_024,
            memtable_prefix_bloom_bits: 0,
            memtable_huge_page_size: 0,
            memtable_whole_key_filtering: false,
            inplace_update_support: false,
            inplace_update_num_locks: 10_000,
            max_successive_merges: 0,
            protection_bytes_per_key: 0,
            index_max_height: 12,
            index_branching_factor: 4,
            merge_operator: None,
            prefix_extractor: None,
            insert_hint_prefix_extractor: None,
            inplace_callback: None,
        }
    }
}

impl Options {
    /// Sets the arena chunk granularity.
    ///
    /// Defaults to 64 KiB.
    #[must_use]
    pub fn arena_block_size(mut self, n: usize) -> Self {
        self.arena_block_size = n;
        self
    }

    /// Sets the flush target in bytes.
    ///
    /// Defaults to 64 MiB.
    ///
    /// # Panics
    ///
    /// Panics if `n` is 0.
    #[must_use]
    pub fn write_buffer_size(mut self, n: usize) -> Self {
        assert!(n > 0);

        self.write_buffer_size = n;
        self
    }

    /// Sets the bloom filter size in bits; 0 disables the filter.
    #[must_use]
    pub fn memtable_prefix_bloom_bits(mut self, bits: usize) -> Self {
        self.memtable_prefix_bloom_bits = bits;
        self
    }

    /// Prefers huge pages of the given size for arena blocks; 0 disables.
    #[must_use]
    pub fn memtable_huge_page_size(mut self, n: usize) -> Self {
        self.memtable_huge_page_size = n;
        self
    }

    /// Also adds whole keys to the bloom filter.
    #[must_use]
    pub fn memtable_whole_key_filtering(mut self, enabled: bool) -> Self {
        self.memtable_whole_key_filtering = enabled;
        self
    }

    /// Enables in-place value updates, which disables snapshot support.
    #[must_use]
    pub fn inplace_update_support(mut self, enabled: bool) -> Self {
        self.inplace_update_support = enabled;
        self
    }

    /// Sets the size of the in-place update lock array.
    ///
    /// # Panics
    ///
    /// Panics if `n` is 0.
    #[must_use]
    pub fn inplace_update_num_locks(mut self, n: usize) -> Self {
        assert!(n > 0);

        self.inplace_update_num_locks = n;
        self
    }

    /// Caps consecutive merge operands; 0 disables the cap.
    #[must_use]
    pub fn max_successive_merges(mut self, n: usize) -> Self {
        self.max_successive_merges = n;
        self
    }

    /// Sets the per-entry checksum width.
    ///
    /// # Panics
    ///
    /// Panics if `n` is not one of 0, 1, 2, 4 or 8.
    #[must_use]
    pub fn protection_bytes_per_key(mut self, n: usize) -> Self {
        assert!(VALID_PROTECTION_WIDTHS.contains(&n));

        self.protection_bytes_per_key = n;
        self
    }

    /// Sets the index tower height cap.
    ///
    /// Defaults to 12.
    ///
    /// # Panics
    ///
    /// Panics if `n` is not in `1..=32`.
    #[must_use]
    pub fn index_max_height(mut self, n: usize) -> Self {
        assert!(n >= 1 && n <= crate::index::MAX_POSSIBLE_HEIGHT);

        self.index_max_height = n;
        self
    }

    /// Sets the index branching factor.
    ///
    /// Defaults to 4.
    ///
    /// # Panics
    ///
    /// Panics if `n` is less than 2.
    #[must_use]
    pub fn index_branching_factor(mut self, n: u32) -> Self {
        assert!(n > 1);

        self.index_branching_factor = n;
        self
    }

    /// Sets the merge operator combining merge operands with base values.
    #[must_use]
    pub fn merge_operator(mut self, operator: Arc<dyn MergeOperator>) -> Self {
        self.merge_operator = Some(operator);
        self
    }

    /// Sets the prefix extractor used by the bloom filter.
    #[must_use]
    pub fn prefix_extractor(mut self, extractor: Arc<dyn PrefixExtractor>) -> Self {
        self.prefix_extractor = Some(extractor);
        self
    }

    /// Sets the prefix extractor grouping sequential inserts into cached
    /// insert positions.
    #[must_use]
    pub fn insert_hint_prefix_extractor(mut self, extractor: Arc<dyn PrefixExtractor>) -> Self {
        self.insert_hint_prefix_extractor = Some(extractor);
        self
    }

    /// Sets the callback used by `update_callback` to merge deltas into
    /// existing values.
    #[must_use]
    pub fn inplace_callback(mut self, callback: Arc<InplaceCallback>) -> Self {
        self.inplace_callback = Some(callback);
        self
    }
}
