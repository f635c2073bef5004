//! The Chunked Page Engine: services freeable small allocations by
//! slicing a page into power-of-two chunks and tracking occupancy with a
//! 32-bit bitmap.
//!
//! Grounded on `nxt_mp_chunk_pages_index` / `nxt_mp_alloc_small` /
//! `nxt_mp_chunk_free` in `nxt_mp.c`, including the bit-twiddling (lowest
//! free bit via `trailing_zeros`, mirroring `__builtin_ffs`) and the
//! "phantom bits" trick: a freshly-claimed page's bitmap always starts at
//! `0xFFFF_FFFE` regardless of how many real chunks actually fit, because
//! the unused high bits are numerically greater than every real chunk
//! index and so are never selected by `trailing_zeros` before the page's
//! `chunks_free` counter reaches zero and the page leaves its list.
#[cfg(any(all(test, feature = "check_contracts_in_tests"), feature = "check_contracts"))]
use contracts::*;
#[cfg(not(any(all(test, feature = "check_contracts_in_tests"), feature = "check_contracts")))]
use disabled_contracts::*;

use crate::error::{self, FreePathViolation};
use crate::page::{Page, PageState};
use crate::Pool;

/// Free-junk byte written into chunks (and whole pages) as they're freed.
const FREE_JUNK: u8 = 0x5A;

/// Size-class index for a chunked request, mirroring
/// `nxt_mp_chunk_pages_index`: `index = max(0, lg2(size - 1) + 1 -
/// chunk_size_shift)`, with `size <= 1` pinned to index 0.
#[ensures(size <= 1 -> ret == 0, "the smallest request always ties to class 0")]
#[ensures(ret < 32, "the bitmap is 32 bits wide; a class index can never exceed that")]
pub(crate) fn class_index(size: usize, chunk_size_shift: u32) -> u8 {
    if size <= 1 {
        return 0;
    }

    let lg2 = (usize::BITS - 1 - (size - 1).leading_zeros()) as i64;
    let n = lg2 + 1 - chunk_size_shift as i64;
    if n > 0 {
        n as u8
    } else {
        0
    }
}

impl Pool {
    /// Serves a freeable small request (`size <= page_size`) from the
    /// chunked engine.
    pub(crate) fn alloc_chunked(&mut self, size: usize) -> Option<*mut u8> {
        let page_size = self.params.page_size;

        // Whole-page allocation: either the request doesn't fit a chunk
        // class at all, or the pool has zero chunk-size classes (e.g.
        // `min_chunk_size == page_size`, a degenerate but legal
        // configuration) so every small allocation takes a whole page.
        if size > page_size / 2 || self.chunk_pages.is_empty() {
            let page_ptr = self.take_free_page()?;
            unsafe {
                (*page_ptr).state = PageState::WholePage;
                return Some((*page_ptr).base(page_size));
            }
        }

        let shift = self.params.chunk_size_shift();
        let index = class_index(size, shift);
        let chunk_bytes = self.params.min_chunk_size << index;

        if let Some(page_ptr) = self.chunk_pages[index as usize].first() {
            return Some(self.take_chunk_from(page_ptr, index, shift));
        }

        let page_ptr = self.take_free_page()?;
        let chunks_per_page = page_size / chunk_bytes;
        unsafe {
            (*page_ptr).state = PageState::Chunked {
                index,
                chunks_free: (chunks_per_page - 1) as u8,
                // Bit 0 handed out below; every other bit (including any
                // phantom ones beyond `chunks_per_page`) starts free.
                map: 0xFFFF_FFFE,
            };
        }
        self.chunk_pages[index as usize].insert_head(page_ptr);
        unsafe { Some((*page_ptr).base(page_size)) }
    }

    /// Claims the lowest free chunk of an already-listed partially-full
    /// page, detaching it from its size class's list if that empties it.
    fn take_chunk_from(&mut self, page_ptr: *mut Page, index: u8, shift: u32) -> *mut u8 {
        let page_size = self.params.page_size;
        let (base, offset, exhausted) = unsafe {
            let page = &mut *page_ptr;
            let (n, exhausted) = match &mut page.state {
                PageState::Chunked { map, chunks_free, .. } => {
                    let n = map.trailing_zeros();
                    *map &= !(1 << n);
                    *chunks_free -= 1;
                    (n, *chunks_free == 0)
                }
                _ => unreachable!("page on a chunk-pages list must be Chunked"),
            };
            (page.base(page_size), (n as usize) << (index as usize + shift as usize), exhausted)
        };

        if exhausted {
            self.chunk_pages[index as usize].remove(page_ptr);
        }
        unsafe { base.add(offset) }
    }

    /// Frees a chunk (or a whole-page allocation) belonging to `page_ptr`,
    /// dispatched from `Pool::free` once the owning cluster page has been
    /// located via the Block Registry. Mirrors `nxt_mp_chunk_free`.
    pub(crate) fn free_chunked(&mut self, page_ptr: *mut Page, p: *mut u8) {
        let page_size = self.params.page_size;
        let page_start = unsafe { (*page_ptr).base(page_size) };
        let state = unsafe { (*page_ptr).state };

        match state {
            PageState::Free => {
                error::log_free_violation(FreePathViolation::AlreadyFreePage, p);
            }
            PageState::Bump { .. } => {
                error::log_free_violation(FreePathViolation::NonFreeablePage, p);
            }
            PageState::WholePage => {
                if p != page_start {
                    error::log_free_violation(FreePathViolation::InvalidChunkPointer, p);
                    return;
                }
                self.retire_page(page_ptr, page_start, page_size);
            }
            PageState::Chunked { index, .. } => {
                self.free_chunk(page_ptr, page_start, index, p);
            }
        }
    }

    fn free_chunk(&mut self, page_ptr: *mut Page, page_start: *mut u8, index: u8, p: *mut u8) {
        let page_size = self.params.page_size;
        let chunk_bytes = self.params.min_chunk_size << index;

        let offset = (p as usize).wrapping_sub(page_start as usize) % page_size;
        let chunk = offset / chunk_bytes;
        if offset != chunk * chunk_bytes {
            error::log_free_violation(FreePathViolation::WrongChunk, p);
            return;
        }

        let bit = 1u32 << chunk;
        let (already_free, became_free, all_free) = unsafe {
            match &mut (*page_ptr).state {
                PageState::Chunked { map, chunks_free, .. } => {
                    if *map & bit != 0 {
                        (true, false, false)
                    } else {
                        *map |= bit;
                        *chunks_free += 1;
                        (false, *chunks_free == 1, *map == 0xFFFF_FFFF)
                    }
                }
                _ => unreachable!(),
            }
        };

        if already_free {
            error::log_free_violation(FreePathViolation::AlreadyFreeChunk, p);
            return;
        }

        if became_free {
            self.chunk_pages[index as usize].insert_head(page_ptr);
        }

        unsafe { std::ptr::write_bytes(p, FREE_JUNK, chunk_bytes) };

        if !all_free {
            return;
        }

        self.chunk_pages[index as usize].remove(page_ptr);
        self.retire_page(page_ptr, page_start, page_size);
    }

    /// Common tail of every page-level free: junk-fill, return to
    /// `free_pages`, and give the Cluster Manager a chance to release the
    /// whole cluster if every page in it is now free.
    fn retire_page(&mut self, page_ptr: *mut Page, page_start: *mut u8, fill_size: usize) {
        unsafe { std::ptr::write_bytes(page_start, FREE_JUNK, fill_size) };
        self.return_free_page(page_ptr);
        self.maybe_release_cluster(page_ptr);
    }
}

#[cfg(test)]
mod test {
    use super::class_index;

    #[test]
    fn class_index_tie_break() {
        // min_chunk_size = 16 (shift 4), page_size = 128.
        assert_eq!(class_index(1, 4), 0);
        assert_eq!(class_index(16, 4), 0);
        assert_eq!(class_index(17, 4), 1);
        assert_eq!(class_index(32, 4), 1);
        assert_eq!(class_index(33, 4), 2);
        assert_eq!(class_index(64, 4), 2);
    }
}
