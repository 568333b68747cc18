//! Bump allocator backing a memtable.
//!
//! Memory is carved out of fixed-size blocks. Blocks are never freed or
//! moved until the arena itself is dropped, so handed-out pointers stay
//! valid for the arena's whole lifetime. Nodes allocated here are immutable
//! once published, except for their forward-pointer towers.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
use std::sync::Mutex;

/// All allocations are rounded up to this alignment so that atomic pointer
/// towers can live at the start of an allocation.
const ALIGN: usize = 8;

/// Allocations larger than a quarter block get a dedicated block so the
/// common-case block is not wasted on one outlier.
const OVERSIZE_DENOMINATOR: usize = 4;

struct Block {
    ptr: NonNull<u8>,
    layout: Layout,
}

struct Inner {
    blocks: Vec<Block>,

    /// Start of the active bump block; oversize blocks never become the
    /// bump target
    bump: *mut u8,

    /// Bump cursor into the active block
    pos: usize,

    /// Capacity of the active block
    end: usize,
}

/// Internally synchronized bump allocator
pub(crate) struct Arena {
    block_size: usize,
    inner: Mutex<Inner>,

    /// Total bytes reserved from the system allocator
    allocated: AtomicUsize,
}

// Handed-out pointers are raw; the arena itself only mutates under its lock.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// `huge_page_size` is a rounding hint: when non-zero, blocks are sized
    /// to a multiple of it so the allocator below can back them with huge
    /// pages.
    pub fn new(block_size: usize, huge_page_size: usize) -> Self {
        let mut block_size = block_size.max(4_096).next_multiple_of(ALIGN);

        if huge_page_size > 0 {
            block_size = block_size.next_multiple_of(huge_page_size);
        }

        Self {
            block_size,
            inner: Mutex::new(Inner {
                blocks: Vec::new(),
                bump: std::ptr::null_mut(),
                pos: 0,
                end: 0,
            }),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Allocates `size` bytes aligned to 8, or `None` if the system
    /// allocator fails.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let size = size.next_multiple_of(ALIGN).max(ALIGN);
        let mut inner = self.inner.lock().expect("lock is poisoned");

        if size > self.block_size / OVERSIZE_DENOMINATOR {
            // Dedicated block, current block stays the bump target
            let block = self.new_block(size)?;
            let ptr = block.ptr;
            inner.blocks.push(block);
            return Some(ptr);
        }

        if inner.pos + size > inner.end {
            let block = self.new_block(self.block_size)?;
            inner.bump = block.ptr.as_ptr();
            inner.pos = 0;
            inner.end = self.block_size;
            inner.blocks.push(block);
        }

        let offset = inner.pos;
        inner.pos += size;

        // SAFETY: offset + size <= block capacity, checked above
        Some(unsafe { NonNull::new_unchecked(inner.bump.add(offset)) })
    }

    fn new_block(&self, size: usize) -> Option<Block> {
        let layout = Layout::from_size_align(size, ALIGN).ok()?;

        // SAFETY: layout has non-zero size
        let raw = unsafe { alloc(layout) };
        let ptr = NonNull::new(raw)?;

        self.allocated.fetch_add(size, Relaxed);
        Some(Block { ptr, layout })
    }

    /// Bytes reserved from the system allocator, including block slack
    pub fn memory_usage(&self) -> usize {
        self.allocated.load(Relaxed)
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().expect("lock is poisoned");

        for block in inner.blocks.drain(..) {
            // SAFETY: allocated with this exact layout in new_block
            unsafe { dealloc(block.ptr.as_ptr(), block.layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn arena_allocates_aligned() {
        let arena = Arena::new(4_096, 0);

        for size in [1, 7, 8, 63, 100] {
            let ptr = arena.allocate(size).expect("should allocate");
            assert_eq!(0, ptr.as_ptr() as usize % ALIGN);
        }

        assert!(arena.memory_usage() >= 4_096);
    }

    #[test]
    fn arena_oversize_allocation() {
        let arena = Arena::new(4_096, 0);

        let small = arena.allocate(16).expect("should allocate");
        let big = arena.allocate(8_192).expect("should allocate");
        let small2 = arena.allocate(16).expect("should allocate");

        // The oversize block must not displace the bump block
        assert_eq!(
            small.as_ptr() as usize + 16,
            small2.as_ptr() as usize,
            "bump cursor should continue in the original block"
        );
        assert_ne!(small.as_ptr(), big.as_ptr());
    }

    #[test]
    fn arena_grows_in_blocks() {
        let arena = Arena::new(4_096, 0);
        let before = {
            arena.allocate(8).expect("should allocate");
            arena.memory_usage()
        };

        // Exhaust the first block
        for _ in 0..4_096 / 8 {
            arena.allocate(8).expect("should allocate");
        }

        assert!(arena.memory_usage() > before);
    }

    #[test]
    fn concurrent_allocation() {
        use std::sync::Arc;

        let arena = Arc::new(Arena::new(16_384, 0));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let arena = arena.clone();

            handles.push(std::thread::spawn(move || {
                let mut ptrs = Vec::new();

                for _ in 0..1_000 {
                    ptrs.push(arena.allocate(24).expect("should allocate").as_ptr() as usize);
                }

                ptrs
            }));
        }

        let mut all: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("thread should not panic"))
            .collect();

        all.sort_unstable();
        all.dedup();

        assert_eq!(4_000, all.len(), "allocations must never overlap");
    }
}
