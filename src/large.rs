//! The Large Allocator: serves requests bigger than one page (or with an
//! alignment the chunked/bump engines can't satisfy) directly from the
//! system allocator, registered individually in the Block Registry.
//!
//! Grounded on `nxt_mp_alloc_large` in `nxt_mp.c`: a power-of-two `size`
//! gets a block allocated *apart* from the payload (`Discrete`), because
//! some allocators round a large-enough request up to the next power of
//! two alignment boundary -- appending bookkeeping to the payload would
//! double that rounding. Any other size embeds the bookkeeping right
//! after the (word-aligned) payload in one allocation (`Embedded`).
//!
//! This crate's real bookkeeping for a large block already lives in the
//! Block Registry's `BTreeMap` entry, not in raw bytes next to the
//! payload -- so `Discrete`'s "separate descriptor" is a small fixed-size
//! placeholder allocation, kept only to preserve the two-allocations-vs-
//! one-allocation behavior this layout is meant to model (and that an
//! instrumented allocator can observe in tests), not because anything is
//! actually stored in it.
use std::alloc::Layout;
use std::ptr::NonNull;

use crate::registry::{Block, LargeBlock, LargeKind};
use crate::Pool;

/// Allocation larger than this is rejected outright ("size too large" once
/// `size >= 2^32 - 1`).
const MAX_LARGE_SIZE: u64 = u32::MAX as u64;

/// Stand-in for `nxt_mp_block_t`'s bookkeeping footprint when a discrete
/// block needs a descriptor allocation apart from its payload. Nothing is
/// ever read from or written to this type; it only exists to make the
/// discrete path cost a second, small allocation, matching the C
/// original's allocation-count behavior.
#[repr(C)]
struct DiscreteDescriptor {
    _reserved: [usize; 4],
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

impl Pool {
    /// Allocates `size` bytes aligned to `alignment` outside of any
    /// cluster, registering the resulting block so `free` can find it
    /// again. Reached whenever `size > page_size` or `alignment` exceeds
    /// what the chunked/bump engines can promise.
    pub(crate) fn alloc_large(&mut self, alignment: usize, size: usize) -> Option<*mut u8> {
        if size as u64 >= MAX_LARGE_SIZE {
            return None;
        }

        let block = if size.is_power_of_two() {
            self.alloc_discrete(alignment, size)?
        } else {
            self.alloc_embedded(alignment, size)?
        };

        let start = block.start;
        self.registry.insert(Block::Large(block));
        Some(start.as_ptr())
    }

    fn alloc_discrete(&mut self, alignment: usize, size: usize) -> Option<LargeBlock> {
        let descriptor_layout = Layout::new::<DiscreteDescriptor>();
        // SAFETY: `descriptor_layout` has nonzero size and a valid alignment.
        let descriptor = NonNull::new(unsafe { std::alloc::alloc(descriptor_layout) })?;

        let payload_layout = Layout::from_size_align(size, alignment).ok().or_else(|| {
            unsafe { std::alloc::dealloc(descriptor.as_ptr(), descriptor_layout) };
            None
        })?;
        // SAFETY: `payload_layout` has nonzero size (size is a power of two, hence >= 1).
        let start = match NonNull::new(unsafe { std::alloc::alloc(payload_layout) }) {
            Some(start) => start,
            None => {
                unsafe { std::alloc::dealloc(descriptor.as_ptr(), descriptor_layout) };
                return None;
            }
        };

        Some(LargeBlock {
            start,
            size: size as u32,
            kind: LargeKind::Discrete { payload_layout, descriptor, descriptor_layout },
        })
    }

    fn alloc_embedded(&mut self, alignment: usize, size: usize) -> Option<LargeBlock> {
        let word = std::mem::size_of::<usize>();
        let aligned_size = align_up(size, word);
        let buffer_layout =
            Layout::from_size_align(aligned_size + std::mem::size_of::<DiscreteDescriptor>(), alignment).ok()?;
        // SAFETY: `buffer_layout` has nonzero size.
        let start = NonNull::new(unsafe { std::alloc::alloc(buffer_layout) })?;

        Some(LargeBlock { start, size: size as u32, kind: LargeKind::Embedded { buffer_layout } })
    }
}

#[cfg(test)]
mod test {
    use crate::Pool;

    fn pool() -> Pool {
        Pool::create(4096, 16, 128, 16).expect("valid sizes")
    }

    #[test]
    fn discrete_for_power_of_two_size() {
        let mut pool = pool();
        let p = pool.alloc_large(16, 1024).expect("allocation should succeed");
        assert_eq!(p as usize % 16, 0);
        pool.free(std::ptr::NonNull::new(p).unwrap());
        assert!(pool.is_empty());
    }

    #[test]
    fn embedded_for_non_power_of_two_size() {
        let mut pool = pool();
        let p = pool.alloc_large(16, 1000).expect("allocation should succeed");
        assert_eq!(p as usize % 16, 0);
        pool.free(std::ptr::NonNull::new(p).unwrap());
        assert!(pool.is_empty());
    }

    #[test]
    fn rejects_sizes_at_the_4gib_boundary() {
        let mut pool = pool();
        assert!(pool.alloc_large(16, u32::MAX as usize).is_none(), "u32::MAX must be rejected as too large");

        // One byte under the boundary is legal and must not be
        // rejected by the size check (the underlying allocator is free to
        // fail it for its own reasons, e.g. lack of address space, but it
        // must at least be attempted -- typically via overcommit rather
        // than materializing 4 GiB of resident memory).
        if let Some(p) = pool.alloc_large(16, (u32::MAX as usize) - 1) {
            pool.free(std::ptr::NonNull::new(p).unwrap());
        }
    }
}
