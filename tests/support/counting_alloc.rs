//! An instrumented global allocator that counts live allocations, used to
//! assert that clusters and large blocks are actually released back to
//! the system allocator rather than merely forgotten about by the pool's
//! own bookkeeping.
//!
//! Grounded on `slitter`'s `debug_arange_map.rs`, which tracks reserved
//! address ranges in a global `Mutex<BTreeMap<..>>` to assert that a
//! `Mapper` releases what it reserves. This module keeps the same "ask a
//! global tracker how much is still live" shape but swaps the backing
//! structure for a plain atomic counter: installed as the process's
//! `#[global_allocator]`, this type sees every allocation the test binary
//! makes (not just the pool's), so bookkeeping with its own heap-allocated
//! structure (a `BTreeSet`, say, behind a `lazy_static`-initialized
//! `Mutex`) would recurse back into itself through the same lock --
//! `AtomicUsize::new` is `const`, so a plain `static` needs no lazy
//! initialization at all, and a fetch-add/fetch-sub has no such hazard.
use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicUsize, Ordering};

static LIVE: AtomicUsize = AtomicUsize::new(0);

/// A `GlobalAlloc` that delegates to `System` but counts live allocations,
/// so tests can assert on `live_count()` before and after an operation
/// that is supposed to release memory.
pub struct CountingAlloc;

unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            LIVE.fetch_add(1, Ordering::SeqCst);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        LIVE.fetch_sub(1, Ordering::SeqCst);
        System.dealloc(ptr, layout)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc_zeroed(layout);
        if !ptr.is_null() {
            LIVE.fetch_add(1, Ordering::SeqCst);
        }
        ptr
    }
}

/// Number of allocations this process has made and not yet freed, across
/// every allocation the test binary has made since start-up (the pool's
/// clusters and large blocks, plus proptest's and the standard library's
/// own bookkeeping). Callers compare deltas around an operation, not the
/// absolute value.
pub fn live_count() -> usize {
    LIVE.load(Ordering::SeqCst)
}
