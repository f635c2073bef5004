//! A `Page` describes one page-sized slice of a `Cluster`, and the
//! intrusive list machinery used to track which pages are free, chunked
//! (and by which size class), or serving bump allocations.
//!
//! Pages never move once a cluster is allocated (they live in a
//! fixed-size boxed slice owned by the `Cluster`), so list nodes can hold
//! raw pointers directly into that slice instead of an index + generation
//! scheme. This mirrors the intrusive-list technique `slitter` uses for
//! its magazine stack (`magazine_stack.rs`), adapted to a plain
//! (non-atomic) doubly-linked list since this pool has a single owner.
use crate::cluster::Cluster;

/// State of one page, tagged by how it is currently being used.
///
/// `nxt_mp_page_t` packs this into a single `size` byte (0 = free, 0xFF =
/// bump, otherwise a chunk-size encoding) plus a `u.map`/`u.taken` union.
/// Representing the tag as a real Rust enum is an internal-representation
/// choice only: no externally observable behavior (bitmap semantics, free
/// junk, list membership) depends on the literal byte encoding, so there's
/// nothing to preserve bit-for-bit here.
#[derive(Debug, Clone, Copy)]
pub(crate) enum PageState {
    /// On the pool's `free_pages` list; not otherwise in use.
    Free,
    /// Sliced into `1 << index` chunks of `min_chunk_size << index` bytes
    /// each. `map` bit *i* set means chunk *i* is free.
    Chunked { index: u8, chunks_free: u8, map: u32 },
    /// A single allocation spanning the whole page (the `size >
    /// page_size/2` case). Freed through the same path as a one-chunk
    /// `Chunked` page, but never linked into a chunk-pages list.
    WholePage,
    /// Serving non-freeable bump allocations (`get`/`nget`).
    Bump { taken: u32 },
}

/// One page's worth of bookkeeping. Lives inline in a `Cluster`'s boxed
/// page array; `cluster` points back at the owning `Cluster` so free/
/// destroy paths can recover cluster-level state without walking the
/// Block Registry a second time or relying on reverse pointer arithmetic
/// from the page's address -- either approach works, and this one avoids
/// the pointer subtraction.
pub(crate) struct Page {
    pub(crate) link: Link,
    pub(crate) cluster: *mut Cluster,
    pub(crate) number: u8,
    pub(crate) state: PageState,
    pub(crate) fails: u8,
}

/// Doubly-linked intrusive list node embedded in every `Page`.
///
/// A page belongs to at most one list at a time (free / one chunk-size
/// class / `nget` / `get` / none) -- that invariant is the caller's
/// responsibility, exactly as for `nxt_queue_link_t`.
pub(crate) struct Link {
    prev: *mut Page,
    next: *mut Page,
    linked: bool,
}

impl Default for Link {
    fn default() -> Self {
        Link { prev: std::ptr::null_mut(), next: std::ptr::null_mut(), linked: false }
    }
}

impl Page {
    pub(crate) fn new(number: u8, cluster: *mut Cluster) -> Page {
        Page { link: Link::default(), cluster, number, state: PageState::Free, fails: 0 }
    }

    /// Byte address of this page's backing storage.
    pub(crate) fn base(&self, page_size: usize) -> *mut u8 {
        unsafe {
            let cluster = &*self.cluster;
            cluster.start.as_ptr().add(self.number as usize * page_size)
        }
    }
}

/// An intrusive FIFO/LIFO doubly-linked list of `Page`s, always
/// manipulated at the head (matches `nxt_queue_insert_head` /
/// `nxt_queue_first` / `nxt_queue_remove` usage throughout `nxt_mp.c`).
pub(crate) struct PageList {
    head: *mut Page,
    tail: *mut Page,
}

impl PageList {
    pub(crate) fn new() -> PageList {
        PageList { head: std::ptr::null_mut(), tail: std::ptr::null_mut() }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Inserts `page` at the head of the list. `page` must not currently
    /// belong to any list.
    pub(crate) fn insert_head(&mut self, page: *mut Page) {
        unsafe {
            debug_assert!(!(*page).link.linked, "page already belongs to a list");

            (*page).link.prev = std::ptr::null_mut();
            (*page).link.next = self.head;
            (*page).link.linked = true;

            if !self.head.is_null() {
                (*self.head).link.prev = page;
            } else {
                self.tail = page;
            }
            self.head = page;
        }
    }

    /// Returns and detaches the head of the list, if any.
    pub(crate) fn pop_front(&mut self) -> Option<*mut Page> {
        if self.head.is_null() {
            return None;
        }
        let page = self.head;
        self.remove(page);
        Some(page)
    }

    /// Returns the head of the list without detaching it.
    pub(crate) fn first(&self) -> Option<*mut Page> {
        if self.head.is_null() {
            None
        } else {
            Some(self.head)
        }
    }

    /// Detaches `page` from the list. `page` must currently belong to
    /// this list.
    pub(crate) fn remove(&mut self, page: *mut Page) {
        unsafe {
            debug_assert!((*page).link.linked, "page does not belong to a list");

            let prev = (*page).link.prev;
            let next = (*page).link.next;

            if !prev.is_null() {
                (*prev).link.next = next;
            } else {
                self.head = next;
            }

            if !next.is_null() {
                (*next).link.prev = prev;
            } else {
                self.tail = prev;
            }

            (*page).link.prev = std::ptr::null_mut();
            (*page).link.next = std::ptr::null_mut();
            (*page).link.linked = false;
        }
    }

    /// Returns the page following `page` in the list, for traversals
    /// that may remove the current node (the bump engine's scan).
    pub(crate) fn next(&self, page: *mut Page) -> Option<*mut Page> {
        unsafe {
            let next = (*page).link.next;
            if next.is_null() {
                None
            } else {
                Some(next)
            }
        }
    }
}
