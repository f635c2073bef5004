//! The Bump Page Engine: serves non-freeable small allocations
//! (`get`/`nget`) by advancing a high-water mark across two page lists.
//!
//! Grounded on `nxt_mp_get_small` in `nxt_mp.c`. A page's `fails` counter
//! is incremented, then compared against a threshold, with saturating
//! `u8` arithmetic so the counter can never wrap past 100 in an
//! adversarial workload (see DESIGN.md).
use crate::page::PageState;
use crate::Pool;

#[cfg(not(feature = "test_only_small_constants"))]
const FAILS_EVICT_THRESHOLD: u8 = 100;

/// Shrunk so proptest traces can drive a page past eviction without
/// thousands of failed bump attempts first.
#[cfg(feature = "test_only_small_constants")]
const FAILS_EVICT_THRESHOLD: u8 = 4;

/// Which bump list a request routes to: `get` guarantees at least
/// `MAX_ALIGNMENT`-byte alignment, `nget` guarantees only byte alignment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BumpList {
    Get,
    Nget,
}

impl Pool {
    /// Serves `size` bytes from the bump list `list`. Callers are
    /// responsible for any size adjustment (`get` rounds up to
    /// `MAX_ALIGNMENT` before calling this).
    pub(crate) fn get_small(&mut self, list: BumpList, size: usize) -> Option<*mut u8> {
        let page_size = self.params.page_size;

        let mut cursor = self.bump_list(list).first();
        while let Some(page_ptr) = cursor {
            let next = self.bump_list(list).next(page_ptr);

            let taken = match unsafe { (*page_ptr).state } {
                PageState::Bump { taken } => taken as usize,
                _ => unreachable!("page on a bump list must be Bump"),
            };
            let available = page_size - taken;

            if size <= available {
                let p = unsafe { (*page_ptr).base(page_size).add(taken) };
                if let PageState::Bump { taken } = unsafe { &mut (*page_ptr).state } {
                    *taken += size as u32;
                }
                return Some(p);
            }

            // `available == 0` evicts unconditionally; otherwise the page
            // is evicted only once its `fails` counter saturates past the
            // threshold (mirrors `available == 0 || page->fails++ > 100`,
            // whose short-circuit means `fails` is untouched when the
            // page is already fully exhausted).
            let evict = if available == 0 {
                true
            } else {
                let page = unsafe { &mut *page_ptr };
                page.fails = page.fails.saturating_add(1);
                page.fails >= FAILS_EVICT_THRESHOLD
            };
            if evict {
                self.bump_list(list).remove(page_ptr);
            }

            cursor = next;
        }

        let page_ptr = self.take_free_page()?;
        unsafe { (*page_ptr).state = PageState::Bump { taken: size as u32 } };
        self.bump_list(list).insert_head(page_ptr);
        unsafe { Some((*page_ptr).base(page_size)) }
    }

    fn bump_list(&mut self, list: BumpList) -> &mut crate::page::PageList {
        match list {
            BumpList::Get => &mut self.get_pages,
            BumpList::Nget => &mut self.nget_pages,
        }
    }
}
