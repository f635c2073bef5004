//! A single-owner, region-style memory pool allocator.
//!
//! A [`Pool`] owns a graph of backing allocations -- page-aligned
//! *clusters*, sliced into fixed-size *pages* and optionally further into
//! power-of-two *chunks*, plus individually registered *large*
//! allocations -- and hands out arbitrarily sized blocks through three
//! disciplines that all share the same page supply: freeable chunked
//! allocations ([`Pool::alloc`]/[`Pool::align`]), non-freeable bump
//! allocations ([`Pool::get`]/[`Pool::nget`]), and large out-of-pool
//! allocations for anything bigger than a page. Destroying the pool (or
//! letting the last [`Pool::release`] bring its retain count to zero, or
//! simply dropping it) releases everything it owns in one sweep.
//!
//! Grounded on NGINX Unit's `nxt_mp` pool allocator (`nxt_mp.c`); see
//! `DESIGN.md` for the module-by-module ledger. The pool has a single
//! owner and performs no internal synchronization -- it is neither
//! [`Send`] nor [`Sync`] (both page lists and the cluster back-pointer
//! are raw pointers, which already rules out both auto traits).
mod bump;
mod chunk;
mod cluster;
mod error;
mod large;
mod page;
mod registry;

use std::ptr::NonNull;

use bump::BumpList;
use page::PageList;
use registry::{Block, BlockRegistry};

pub use error::FreePathViolation;

/// Minimum alignment the pool guarantees for `alloc`/`get`/`nget`'s
/// default large-allocation alignment and for `get`'s bump list, mirroring
/// `NXT_MAX_ALIGNMENT` (two pointer widths on the platforms `nxt_mp.c`
/// targets).
pub const MAX_ALIGNMENT: usize = 2 * std::mem::size_of::<usize>();

static_assertions::const_assert!(MAX_ALIGNMENT.is_power_of_two());

/// The sizing parameters a [`Pool`] was created with.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ClusterParams {
    pub(crate) page_size: usize,
    pub(crate) page_alignment: usize,
    pub(crate) min_chunk_size: usize,
    pub(crate) cluster_size: usize,
}

impl ClusterParams {
    pub(crate) fn page_size_shift(&self) -> u32 {
        self.page_size.trailing_zeros()
    }

    pub(crate) fn chunk_size_shift(&self) -> u32 {
        self.min_chunk_size.trailing_zeros()
    }

    /// Number of distinct chunk size classes: `log2(page_size /
    /// min_chunk_size)`. Zero is valid -- it just means no chunking is
    /// possible and every small allocation takes a whole page.
    pub(crate) fn chunk_class_count(&self) -> usize {
        (self.page_size_shift() - self.chunk_size_shift()) as usize
    }
}

/// Validates pool sizing parameters.
///
/// `page_alignment` is clamped to at least [`MAX_ALIGNMENT`] *before* the
/// rest of the checks run, matching `nxt_mp_test_sizes`'s `page_alignment
/// = nxt_max(page_alignment, NXT_MAX_ALIGNMENT)`. [`Pool::create`] applies
/// the identical clamp before storing the value it actually uses.
pub fn test_sizes(cluster_size: usize, page_alignment: usize, page_size: usize, min_chunk_size: usize) -> bool {
    if !(page_alignment.is_power_of_two() && page_size.is_power_of_two() && min_chunk_size.is_power_of_two()) {
        return false;
    }

    let page_alignment = page_alignment.max(MAX_ALIGNMENT);

    page_size >= 64
        && page_size >= page_alignment
        && page_size >= min_chunk_size
        && min_chunk_size.saturating_mul(32) >= page_size
        && cluster_size >= page_size
        && cluster_size / page_size <= 256
        && cluster_size % page_size == 0
}

/// A single-owner region/pool allocator.
///
/// See the module documentation for the allocation disciplines a `Pool`
/// offers. Every allocating method returns `None` on underlying allocator
/// failure or on a rejected request; there is no panic path for ordinary
/// allocation failure.
pub struct Pool {
    pub(crate) params: ClusterParams,
    retain: u32,
    pub(crate) registry: BlockRegistry,
    pub(crate) free_pages: PageList,
    pub(crate) nget_pages: PageList,
    pub(crate) get_pages: PageList,
    pub(crate) chunk_pages: Vec<PageList>,
}

impl Pool {
    /// Creates a pool, validating `cluster_size`/`page_alignment`/
    /// `page_size`/`min_chunk_size` with [`test_sizes`] first. Returns
    /// `None` if the sizes are invalid.
    pub fn create(cluster_size: usize, page_alignment: usize, page_size: usize, min_chunk_size: usize) -> Option<Pool> {
        if !test_sizes(cluster_size, page_alignment, page_size, min_chunk_size) {
            return None;
        }
        Some(Self::create_unchecked(cluster_size, page_alignment, page_size, min_chunk_size))
    }

    /// Creates a pool without validating its sizing parameters. Calling
    /// this with invalid sizes is undefined behavior for the pool's own
    /// invariants (out-of-range bitmap indices, zero-page clusters, ...);
    /// callers that haven't already validated elsewhere should use
    /// [`Pool::create`] instead.
    pub fn create_unchecked(cluster_size: usize, page_alignment: usize, page_size: usize, min_chunk_size: usize) -> Pool {
        let params =
            ClusterParams { page_size, page_alignment: page_alignment.max(MAX_ALIGNMENT), min_chunk_size, cluster_size };
        let chunk_pages = (0..params.chunk_class_count()).map(|_| PageList::new()).collect();

        Pool {
            params,
            retain: 1,
            registry: BlockRegistry::new(),
            free_pages: PageList::new(),
            nget_pages: PageList::new(),
            get_pages: PageList::new(),
            chunk_pages,
        }
    }

    /// Allocates `size` freeable bytes. Routes to the chunked engine when
    /// `size <= page_size`, otherwise to the large allocator.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        let raw = if size <= self.params.page_size {
            self.alloc_chunked(size)
        } else {
            self.alloc_large(MAX_ALIGNMENT, size)
        };
        raw.and_then(NonNull::new)
    }

    /// Like [`Pool::alloc`], but zero-fills the returned memory.
    pub fn zalloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        let p = self.alloc(size)?;
        unsafe { std::ptr::write_bytes(p.as_ptr(), 0, size) };
        Some(p)
    }

    /// Allocates `size` freeable bytes aligned to `alignment`, which must
    /// be a power of two (otherwise this is a rejected request -- `None`,
    /// no logging). When both `size` and `alignment` fit within the
    /// chunked engine's reach, `size` is bumped up to `alignment` first;
    /// otherwise the request goes to the large allocator.
    pub fn align(&mut self, alignment: usize, size: usize) -> Option<NonNull<u8>> {
        if !alignment.is_power_of_two() {
            return None;
        }

        if size <= self.params.page_size && alignment <= self.params.page_alignment {
            let size = size.max(alignment);
            if size <= self.params.page_size {
                return self.alloc_chunked(size).and_then(NonNull::new);
            }
        }

        self.alloc_large(alignment, size).and_then(NonNull::new)
    }

    /// Like [`Pool::align`], but zero-fills the returned memory.
    pub fn zalign(&mut self, alignment: usize, size: usize) -> Option<NonNull<u8>> {
        let p = self.align(alignment, size)?;
        unsafe { std::ptr::write_bytes(p.as_ptr(), 0, size) };
        Some(p)
    }

    /// Allocates `size` non-freeable bytes aligned to at least
    /// [`MAX_ALIGNMENT`]. Never returned to the pool by `free`; reclaimed
    /// only when the whole pool is destroyed.
    pub fn get(&mut self, size: usize) -> Option<NonNull<u8>> {
        let raw = if size <= self.params.page_size {
            let size = size.max(MAX_ALIGNMENT);
            self.get_small(BumpList::Get, size)
        } else {
            self.alloc_large(MAX_ALIGNMENT, size)
        };
        raw.and_then(NonNull::new)
    }

    /// Like [`Pool::get`], but without any alignment guarantee beyond a
    /// single byte.
    pub fn nget(&mut self, size: usize) -> Option<NonNull<u8>> {
        let raw = if size <= self.params.page_size {
            self.get_small(BumpList::Nget, size)
        } else {
            self.alloc_large(MAX_ALIGNMENT, size)
        };
        raw.and_then(NonNull::new)
    }

    /// Like [`Pool::get`], but zero-fills the returned memory.
    pub fn zget(&mut self, size: usize) -> Option<NonNull<u8>> {
        let p = self.get(size)?;
        unsafe { std::ptr::write_bytes(p.as_ptr(), 0, size) };
        Some(p)
    }

    /// Frees `p`, which must be a pointer previously returned by
    /// `alloc`/`zalloc`/`align`/`zalign` from this same pool (bump
    /// allocations from `get`/`nget`/`zget` are not freeable; large
    /// allocations must be freed at their exact starting address).
    ///
    /// Any violation of those preconditions -- an out-of-pool pointer, an
    /// interior pointer, a double free, a free on a non-freeable page --
    /// does not corrupt the pool: it is logged at error severity and
    /// otherwise ignored.
    pub fn free(&mut self, p: NonNull<u8>) {
        let ptr = p.as_ptr();
        let addr = ptr as usize;

        let page_ptr = match self.registry.find(addr) {
            None => {
                error::log_free_violation(FreePathViolation::OutOfPool, ptr);
                return;
            }
            Some((_, Block::Cluster(cluster))) => {
                let shift = self.params.page_size_shift();
                let n = (addr - cluster.start.as_ptr() as usize) >> shift;
                cluster.page_ptr(n as u8)
            }
            Some((start, Block::Large(_))) => {
                if addr != start {
                    error::log_free_violation(FreePathViolation::MiddleOfBlock, ptr);
                    return;
                }
                // Dropping the removed `Block` deallocates its backing
                // memory (see `registry::LargeBlock`'s `Drop` impl).
                self.registry.remove_at(start);
                return;
            }
        };

        self.free_chunked(page_ptr, ptr);
    }

    /// Allocates `size` bytes and bumps the pool's retain count. A
    /// matching [`Pool::release`] (or enough of them) is needed to bring
    /// the count back down; it reaches zero only once every `retain` and
    /// the pool's initial implicit reference have been released, at
    /// which point the pool destroys itself.
    pub fn retain(&mut self, size: usize) -> Option<NonNull<u8>> {
        let p = self.alloc(size)?;
        self.retain += 1;
        Some(p)
    }

    /// Frees `p`, decrements the retain count, and destroys the pool if
    /// the count reaches zero. See [`Pool::retain`].
    pub fn release(&mut self, p: NonNull<u8>) {
        self.free(p);
        self.retain -= 1;
        if self.retain == 0 {
            self.destroy_sweep();
        }
    }

    /// True iff the pool holds no registered block (cluster or large
    /// allocation) *and* no free page. A pool with only free pages inside
    /// a live cluster is deliberately not considered empty -- it still
    /// holds backing memory.
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty() && self.free_pages.is_empty()
    }

    /// Releases every block this pool owns -- every cluster's backing
    /// bytes, every large allocation -- in one sweep. Safe to call more
    /// than once (a second call simply sweeps nothing); dropping a `Pool`
    /// without calling `destroy` runs the same sweep.
    pub fn destroy(mut self) {
        self.destroy_sweep();
    }

    /// The Destroy Sweep: drains the Block Registry, letting each
    /// `Block`'s own `Drop` release its backing memory (a cluster's boxed
    /// buffer, or a large block's payload/descriptor), then resets the
    /// page lists. Mirrors `nxt_mp_destroy`'s rbtree walk, minus the
    /// manual tree surgery a `BTreeMap` doesn't need.
    fn destroy_sweep(&mut self) {
        let registry = std::mem::take(&mut self.registry);
        for block in registry.destroy_walk() {
            drop(block);
        }

        self.free_pages = PageList::new();
        self.nget_pages = PageList::new();
        self.get_pages = PageList::new();
        for list in self.chunk_pages.iter_mut() {
            *list = PageList::new();
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.destroy_sweep();
    }
}
