//! Concurrent probabilistic ordered list over arena-allocated entries.
//!
//! The index holds encoded entries in internal-key order. Every node lives
//! in the arena as one allocation: a small header, a tower of `height`
//! atomic forward pointers and the entry bytes. Keys and heights are
//! immutable once a node is published; only forward pointers ever change.
//!
//! Readers traverse with acquire loads and never block. The single-writer
//! insert path publishes with release stores; the concurrent path links
//! levels bottom-up with compare-and-swap, so a reader may briefly miss a
//! node at upper levels — it will still find it at level 0.

use crate::arena::Arena;
use crate::value::{compare_internal_keys, decode_internal_key};
use crate::{Error, Result};
use rand::Rng;
use std::cmp::Ordering;
use std::ptr::null_mut;
use std::sync::atomic::{
    AtomicBool, AtomicPtr, AtomicUsize,
    Ordering::{Acquire, Relaxed, Release, SeqCst},
};
use std::sync::{Arc, Mutex};

/// Hard ceiling on tower heights, independent of configuration
pub(crate) const MAX_POSSIBLE_HEIGHT: usize = 32;

#[repr(C, align(8))]
struct Node {
    height: u32,
    _pad: u32,
}

const HEADER_SIZE: usize = std::mem::size_of::<Node>();
const PTR_SIZE: usize = std::mem::size_of::<AtomicPtr<Node>>();

/// # Safety
///
/// `node` must be a live node with `level < height`.
unsafe fn tower<'a>(node: *mut Node, level: usize) -> &'a AtomicPtr<Node> {
    debug_assert!(!node.is_null());
    debug_assert!(level < unsafe { (*node).height as usize });

    unsafe {
        &*node
            .cast::<u8>()
            .add(HEADER_SIZE + level * PTR_SIZE)
            .cast::<AtomicPtr<Node>>()
    }
}

/// Acquire-load of the forward pointer, so the returned node is observed
/// fully initialized.
unsafe fn next(node: *mut Node, level: usize) -> *mut Node {
    unsafe { tower(node, level) }.load(Acquire)
}

/// Release-store publishing `x` through this pointer
unsafe fn set_next(node: *mut Node, level: usize, x: *mut Node) {
    unsafe { tower(node, level) }.store(x, Release);
}

/// Pre-publication store; a barrier follows when the node itself is linked
unsafe fn no_barrier_set_next(node: *mut Node, level: usize, x: *mut Node) {
    unsafe { tower(node, level) }.store(x, Relaxed);
}

unsafe fn no_barrier_next(node: *mut Node, level: usize) -> *mut Node {
    unsafe { tower(node, level) }.load(Relaxed)
}

unsafe fn cas_next(node: *mut Node, level: usize, expected: *mut Node, x: *mut Node) -> bool {
    unsafe { tower(node, level) }
        .compare_exchange(expected, x, SeqCst, SeqCst)
        .is_ok()
}

/// # Safety
///
/// `node` must be a live non-head node.
unsafe fn entry_ptr(node: *mut Node) -> *const u8 {
    let height = unsafe { (*node).height as usize };
    unsafe { node.cast::<u8>().add(HEADER_SIZE + height * PTR_SIZE) }
}

/// Internal key of a live non-head node
unsafe fn node_key<'a>(node: *mut Node) -> &'a [u8] {
    unsafe { decode_internal_key(entry_ptr(node)) }
}

/// Caches, per level, the `(prev, next)` pair bracketing the most recent
/// insertion, letting sequential inserts finish in amortized O(1).
///
/// Invariant: `prev[i+1].key <= prev[i].key < next[i].key <= next[i+1].key`
/// for all `i` below `height`. It is *not* required that
/// `prev[i].next(i) == next[i]`; intervening inserts may have squeezed
/// nodes in between.
pub(crate) struct Splice {
    height: usize,
    prev: [*mut Node; MAX_POSSIBLE_HEIGHT + 1],
    next: [*mut Node; MAX_POSSIBLE_HEIGHT + 1],
}

impl Splice {
    pub fn new() -> Self {
        Self {
            height: 0,
            prev: [null_mut(); MAX_POSSIBLE_HEIGHT + 1],
            next: [null_mut(); MAX_POSSIBLE_HEIGHT + 1],
        }
    }
}

impl Default for Splice {
    fn default() -> Self {
        Self::new()
    }
}

// A splice only caches positions of nodes that live as long as the arena.
unsafe impl Send for Splice {}

/// A node reserved in the arena whose entry bytes have been filled in but
/// which has not been linked yet. The height travels out-of-band here
/// instead of being stashed in the level-0 pointer slot.
pub(crate) struct EntryHandle {
    node: *mut Node,
    height: usize,
}

unsafe impl Send for EntryHandle {}

/// Lock-free multi-level probabilistic ordered list
pub(crate) struct SkipIndex {
    max_height_cap: usize,
    branching: u64,
    scaled_inverse_branching: u32,

    arena: Arc<Arena>,
    head: *mut Node,

    /// Height of the entire list. Read racily by readers; stale values only
    /// cost extra comparisons.
    max_height: AtomicUsize,

    /// Splice for the single-writer insert path. The mutex is uncontended
    /// under the documented single-writer protocol.
    seq_splice: Mutex<Splice>,

    read_only: AtomicBool,
}

unsafe impl Send for SkipIndex {}
unsafe impl Sync for SkipIndex {}

impl SkipIndex {
    /// # Panics
    ///
    /// Panics if `branching < 2`, the height cap is out of `1..=32`, or
    /// the head node cannot be allocated.
    pub fn new(arena: Arc<Arena>, max_height: usize, branching: u32) -> Self {
        assert!(branching > 1);
        assert!(max_height >= 1 && max_height <= MAX_POSSIBLE_HEIGHT);

        let head = {
            let size = HEADER_SIZE + max_height * PTR_SIZE;
            let raw = arena.allocate(size).expect("arena allocation failed");
            let head = raw.as_ptr().cast::<Node>();

            unsafe {
                (*head).height = max_height as u32;
                (*head)._pad = 0;

                for level in 0..max_height {
                    no_barrier_set_next(head, level, null_mut());
                }
            }

            head
        };

        Self {
            max_height_cap: max_height,
            branching: u64::from(branching),
            scaled_inverse_branching: ((1u64 << 32) / u64::from(branching)) as u32,
            arena,
            head,
            max_height: AtomicUsize::new(1),
            seq_splice: Mutex::new(Splice::new()),
            read_only: AtomicBool::new(false),
        }
    }

    fn current_max_height(&self) -> usize {
        self.max_height.load(Relaxed)
    }

    /// Samples a tower height from the geometric distribution with the
    /// configured branching factor.
    fn random_height(&self) -> usize {
        let mut rng = rand::thread_rng();
        let mut height = 1;

        while height < self.max_height_cap
            && height < MAX_POSSIBLE_HEIGHT
            && rng.gen::<u32>() < self.scaled_inverse_branching
        {
            height += 1;
        }

        height
    }

    /// Reserves a node able to hold `entry_len` encoded bytes.
    ///
    /// The buffer must be fully written before the handle is passed to
    /// [`SkipIndex::insert`].
    pub fn allocate_entry(&self, entry_len: usize) -> Result<(EntryHandle, &mut [u8])> {
        let height = self.random_height();
        let size = HEADER_SIZE + height * PTR_SIZE + entry_len;

        let raw = self.arena.allocate(size).ok_or(Error::ArenaExhausted)?;
        let node = raw.as_ptr().cast::<Node>();

        // The tower is left uninitialized; insert writes every slot below
        // `height` before the node becomes reachable.
        unsafe {
            (*node).height = height as u32;
            (*node)._pad = 0;
        }

        let buf = unsafe {
            std::slice::from_raw_parts_mut(
                raw.as_ptr().add(HEADER_SIZE + height * PTR_SIZE),
                entry_len,
            )
        };

        Ok((EntryHandle { node, height }, buf))
    }

    /// Links a filled-in entry into the list.
    ///
    /// Returns `false` without linking anything if an equal key is already
    /// present. With `concurrent`, linking uses compare-and-swap against an
    /// on-stack splice; otherwise the shared sequential splice is used and
    /// the caller must hold the single-writer protocol.
    pub fn insert(&self, handle: EntryHandle, concurrent: bool) -> bool {
        debug_assert!(
            !self.read_only.load(Relaxed),
            "insert into read-only index"
        );

        if concurrent {
            let mut splice = Splice::new();
            unsafe { self.insert_inner::<true>(&handle, &mut splice, false) }
        } else {
            let mut splice = self.seq_splice.lock().expect("lock is poisoned");
            unsafe { self.insert_inner::<false>(&handle, &mut splice, false) }
        }
    }

    /// Single-writer insert with a caller-owned splice, allowing partial
    /// splice repair. Used for insert hints grouped by key prefix.
    pub fn insert_with_hint(&self, handle: EntryHandle, splice: &mut Splice) -> bool {
        debug_assert!(
            !self.read_only.load(Relaxed),
            "insert into read-only index"
        );

        unsafe { self.insert_inner::<false>(&handle, splice, true) }
    }

    /// No further inserts are allowed once this returns
    pub fn mark_read_only(&self) {
        self.read_only.store(true, Release);
    }

    /// Approximate count of entries ordered before `ikey`.
    ///
    /// Each forward step counts one node; each level drop multiplies by the
    /// branching factor. Off by O(log n) in expectation, used only for
    /// planning.
    pub fn estimate_count(&self, ikey: &[u8]) -> u64 {
        let mut count = 0u64;
        let mut x = self.head;
        let mut level = self.current_max_height() - 1;

        loop {
            let nxt = unsafe { next(x, level) };

            if nxt.is_null() || compare_internal_keys(unsafe { node_key(nxt) }, ikey) != Ordering::Less
            {
                if level == 0 {
                    return count;
                }

                count *= self.branching;
                level -= 1;
            } else {
                x = nxt;
                count += 1;
            }
        }
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            node: null_mut(),
        }
    }

    /// True if `ikey` orders after node `n`; a null node is infinite
    unsafe fn key_is_after_node(&self, ikey: &[u8], n: *mut Node) -> bool {
        debug_assert!(n != self.head);
        !n.is_null() && compare_internal_keys(unsafe { node_key(n) }, ikey) == Ordering::Less
    }

    /// Earliest node with `key >= ikey`, or null
    unsafe fn find_greater_or_equal(&self, ikey: &[u8]) -> *mut Node {
        // A concurrent insert may slip in between a hypothetical
        // find_less_than and its next(0), so the search keeps its own
        // last-bigger witness instead of composing those two calls.
        let mut x = self.head;
        let mut level = self.current_max_height() - 1;
        let mut last_bigger: *mut Node = null_mut();

        loop {
            let nxt = unsafe { next(x, level) };

            let cmp = if nxt.is_null() || nxt == last_bigger {
                Ordering::Greater
            } else {
                compare_internal_keys(unsafe { node_key(nxt) }, ikey)
            };

            if cmp == Ordering::Equal || (cmp == Ordering::Greater && level == 0) {
                return nxt;
            } else if cmp == Ordering::Less {
                x = nxt;
            } else {
                last_bigger = nxt;
                level -= 1;
            }
        }
    }

    /// Latest node with `key < ikey`, or head
    unsafe fn find_less_than(&self, ikey: &[u8]) -> *mut Node {
        let mut x = self.head;
        let mut level = self.current_max_height() - 1;
        let mut last_not_after: *mut Node = null_mut();

        loop {
            let nxt = unsafe { next(x, level) };

            if nxt != last_not_after && unsafe { self.key_is_after_node(ikey, nxt) } {
                x = nxt;
            } else {
                if level == 0 {
                    return x;
                }

                last_not_after = nxt;
                level -= 1;
            }
        }
    }

    /// Last node in the list, or head if empty
    unsafe fn find_last(&self) -> *mut Node {
        let mut x = self.head;
        let mut level = self.current_max_height() - 1;

        loop {
            let nxt = unsafe { next(x, level) };

            if nxt.is_null() {
                if level == 0 {
                    return x;
                }

                level -= 1;
            } else {
                x = nxt;
            }
        }
    }

    /// Uniform-ish random node by top-down descent.
    ///
    /// At each level the nodes between the current position and the limit
    /// are enumerated and one is picked uniformly; the limit narrows to the
    /// pick's successor before descending.
    unsafe fn find_random_entry(&self) -> *mut Node {
        let mut rng = rand::thread_rng();
        let mut x = self.head;
        let mut limit: *mut Node = null_mut();
        let mut lvl_nodes: Vec<*mut Node> = Vec::new();

        let mut level = self.current_max_height() as isize - 1;

        while level >= 0 {
            lvl_nodes.clear();

            let mut scan = x;
            while scan != limit {
                lvl_nodes.push(scan);
                scan = unsafe { next(scan, level as usize) };
            }

            let idx = rng.gen_range(0..lvl_nodes.len());
            x = lvl_nodes[idx];

            if idx + 1 < lvl_nodes.len() {
                limit = lvl_nodes[idx + 1];
            }

            level -= 1;
        }

        if x == self.head {
            unsafe { next(self.head, 0) }
        } else {
            x
        }
    }

    /// Walks one level forward until `(out_prev, out_next)` brackets
    /// `ikey`. `before` must order before the key; `after` is a hint for
    /// early exit and may be null.
    unsafe fn find_splice_for_level(
        &self,
        ikey: &[u8],
        mut before: *mut Node,
        after: *mut Node,
        level: usize,
        out_prev: &mut *mut Node,
        out_next: &mut *mut Node,
    ) {
        loop {
            let nxt = unsafe { next(before, level) };

            if nxt == after || !unsafe { self.key_is_after_node(ikey, nxt) } {
                *out_prev = before;
                *out_next = nxt;
                return;
            }

            before = nxt;
        }
    }

    /// Recomputes splice levels `[0, recompute_level)`, walking each level
    /// forward from the bracketing pair one level up.
    unsafe fn recompute_splice_levels(
        &self,
        ikey: &[u8],
        splice: &mut Splice,
        recompute_level: usize,
    ) {
        debug_assert!(recompute_level > 0);
        debug_assert!(recompute_level <= splice.height);

        for i in (0..recompute_level).rev() {
            let (before, after) = (splice.prev[i + 1], splice.next[i + 1]);
            let (mut prev, mut nxt) = (null_mut(), null_mut());

            unsafe { self.find_splice_for_level(ikey, before, after, i, &mut prev, &mut nxt) };

            splice.prev[i] = prev;
            splice.next[i] = nxt;
        }
    }

    unsafe fn insert_inner<const USE_CAS: bool>(
        &self,
        handle: &EntryHandle,
        splice: &mut Splice,
        allow_partial_splice_fix: bool,
    ) -> bool {
        let x = handle.node;
        let height = handle.height;
        let ikey = unsafe { node_key(x) };

        let mut max_height = self.max_height.load(Relaxed);
        while height > max_height {
            match self
                .max_height
                .compare_exchange_weak(max_height, height, SeqCst, SeqCst)
            {
                Ok(_) => {
                    max_height = height;
                    break;
                }
                // Somebody else may have raised it past us
                Err(h) => max_height = h,
            }
        }
        debug_assert!(max_height <= MAX_POSSIBLE_HEIGHT);

        let mut recompute_height = 0;

        if splice.height < max_height {
            // Splice never used, or the list has grown since: recompute all
            splice.prev[max_height] = self.head;
            splice.next[max_height] = null_mut();
            splice.height = max_height;
            recompute_height = max_height;
        } else {
            // The splice brackets *some* key; walk up until we find a level
            // that brackets this one. Every level below that is recomputed,
            // turning nearby inserts into O(log distance) instead of
            // O(log n). With partial fix disabled we fall back to a full
            // recompute as soon as one level disagrees.
            while recompute_height < max_height {
                if unsafe { no_barrier_next(splice.prev[recompute_height], recompute_height) }
                    != splice.next[recompute_height]
                {
                    // Splice isn't tight at this level; cheap to move up
                    recompute_height += 1;
                } else if splice.prev[recompute_height] != self.head
                    && !unsafe { self.key_is_after_node(ikey, splice.prev[recompute_height]) }
                {
                    // Key is before the splice
                    if allow_partial_splice_fix {
                        let bad = splice.prev[recompute_height];
                        while splice.prev[recompute_height] == bad {
                            recompute_height += 1;
                        }
                    } else {
                        recompute_height = max_height;
                    }
                } else if unsafe { self.key_is_after_node(ikey, splice.next[recompute_height]) } {
                    // Key is after the splice
                    if allow_partial_splice_fix {
                        let bad = splice.next[recompute_height];
                        while splice.next[recompute_height] == bad {
                            recompute_height += 1;
                        }
                    } else {
                        recompute_height = max_height;
                    }
                } else {
                    break;
                }
            }
        }

        debug_assert!(recompute_height <= max_height);
        if recompute_height > 0 {
            unsafe { self.recompute_splice_levels(ikey, splice, recompute_height) };
        }

        let mut splice_is_valid = true;

        if USE_CAS {
            for i in 0..height {
                loop {
                    // Duplicate detection on level 0 is sufficient
                    if i == 0
                        && !splice.next[0].is_null()
                        && compare_internal_keys(ikey, unsafe { node_key(splice.next[0]) })
                            != Ordering::Less
                    {
                        return false;
                    }
                    if i == 0
                        && splice.prev[0] != self.head
                        && compare_internal_keys(unsafe { node_key(splice.prev[0]) }, ikey)
                            != Ordering::Less
                    {
                        return false;
                    }

                    unsafe { no_barrier_set_next(x, i, splice.next[i]) };

                    if unsafe { cas_next(splice.prev[i], i, splice.next[i], x) } {
                        break;
                    }

                    // CAS failed: somebody linked here first. Re-bracket this
                    // level starting from our stale prev; next[i] is known
                    // stale so it is no use as an early-exit hint.
                    let (mut prev, mut nxt) = (null_mut(), null_mut());
                    unsafe {
                        self.find_splice_for_level(
                            ikey,
                            splice.prev[i],
                            null_mut(),
                            i,
                            &mut prev,
                            &mut nxt,
                        );
                    }
                    splice.prev[i] = prev;
                    splice.next[i] = nxt;

                    // Narrowing level i may have broken the splice invariant
                    // against level i-1; force a full recompute next time.
                    if i > 0 {
                        splice_is_valid = false;
                    }
                }
            }
        } else {
            for i in 0..height {
                if i >= recompute_height
                    && unsafe { no_barrier_next(splice.prev[i], i) } != splice.next[i]
                {
                    let (mut prev, mut nxt) = (null_mut(), null_mut());
                    unsafe {
                        self.find_splice_for_level(
                            ikey,
                            splice.prev[i],
                            null_mut(),
                            i,
                            &mut prev,
                            &mut nxt,
                        );
                    }
                    splice.prev[i] = prev;
                    splice.next[i] = nxt;
                }

                if i == 0
                    && !splice.next[0].is_null()
                    && compare_internal_keys(ikey, unsafe { node_key(splice.next[0]) })
                        != Ordering::Less
                {
                    return false;
                }
                if i == 0
                    && splice.prev[0] != self.head
                    && compare_internal_keys(unsafe { node_key(splice.prev[0]) }, ikey)
                        != Ordering::Less
                {
                    return false;
                }

                debug_assert!(unsafe { no_barrier_next(splice.prev[i], i) } == splice.next[i]);
                unsafe {
                    no_barrier_set_next(x, i, splice.next[i]);
                    set_next(splice.prev[i], i, x);
                }
            }
        }

        if splice_is_valid {
            for i in 0..height {
                splice.prev[i] = x;
            }
        } else {
            splice.height = 0;
        }

        true
    }
}

/// Cursor over the contents of a [`SkipIndex`].
///
/// Freshly created iterators are not valid; position them with one of the
/// seek methods first.
pub(crate) struct Iter<'a> {
    list: &'a SkipIndex,
    node: *mut Node,
}

impl<'a> Iter<'a> {
    pub fn valid(&self) -> bool {
        !self.node.is_null()
    }

    /// Pointer to the encoded entry at the current position.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if the iterator is not valid.
    pub fn entry(&self) -> *const u8 {
        debug_assert!(self.valid());
        unsafe { entry_ptr(self.node) }
    }

    /// Internal key at the current position
    pub fn key(&self) -> &'a [u8] {
        debug_assert!(self.valid());
        unsafe { node_key(self.node) }
    }

    pub fn next(&mut self) {
        debug_assert!(self.valid());
        self.node = unsafe { next(self.node, 0) };
    }

    /// Retreats to the previous entry by searching for the last node before
    /// the current key; there are no back links.
    pub fn prev(&mut self) {
        debug_assert!(self.valid());

        let node = unsafe { self.list.find_less_than(node_key(self.node)) };
        self.node = if node == self.list.head {
            null_mut()
        } else {
            node
        };
    }

    /// Advances to the first entry with `key >= ikey`
    pub fn seek(&mut self, ikey: &[u8]) {
        self.node = unsafe { self.list.find_greater_or_equal(ikey) };
    }

    /// Retreats to the last entry with `key <= ikey`
    pub fn seek_for_prev(&mut self, ikey: &[u8]) {
        self.seek(ikey);

        if !self.valid() {
            self.seek_to_last();
        }

        while self.valid() && compare_internal_keys(ikey, self.key()) == Ordering::Less {
            self.prev();
        }
    }

    pub fn seek_to_first(&mut self) {
        self.node = unsafe { next(self.list.head, 0) };
    }

    pub fn seek_to_last(&mut self) {
        let node = unsafe { self.list.find_last() };
        self.node = if node == self.list.head {
            null_mut()
        } else {
            node
        };
    }

    /// Advances to a random entry in the list
    pub fn random_seek(&mut self) {
        self.node = unsafe { self.list.find_random_entry() };
    }
}
