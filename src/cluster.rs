//! The Cluster Manager: backs the pool with page-aligned clusters and
//! hands `Page`s to the chunked and bump engines.
//!
//! Grounded on `nxt_mp_alloc_cluster` / `nxt_mp_alloc_page` in
//! `nxt_mp.c`: when `free_pages` runs dry, allocate a whole new cluster,
//! register it, and feed its pages into `free_pages` in forward
//! (page-0-first) order. Backing memory comes from `std::alloc` with an
//! explicit `Layout`, following the same "system allocator behind a
//! `Layout`" idiom as `slitter`'s `press.rs`, rather than `slitter`'s own
//! mmap-based `Mill`/`Mapper` (dropped -- see DESIGN.md).
use std::alloc::Layout;
use std::ptr::NonNull;

use crate::page::{Page, PageList};
use crate::registry::{Block, BlockRegistry};
use crate::ClusterParams;

pub(crate) struct Cluster {
    pub(crate) start: NonNull<u8>,
    pub(crate) size: usize,
    pub(crate) layout: Layout,
    pub(crate) pages: Box<[Page]>,
}

impl Cluster {
    /// Allocates a fresh cluster's backing bytes and page array. Returns
    /// `None` on allocator failure, exactly like any other pool
    /// operation; the caller must propagate the `None`.
    fn allocate(params: &ClusterParams) -> Option<Box<Cluster>> {
        let layout = Layout::from_size_align(params.cluster_size, params.page_alignment).ok()?;
        // SAFETY: layout has nonzero size (validated by ClusterParams).
        let raw = unsafe { std::alloc::alloc(layout) };
        let start = NonNull::new(raw)?;

        let page_count = params.cluster_size / params.page_size;
        let mut pages: Vec<Page> = Vec::with_capacity(page_count);
        for number in 0..page_count {
            pages.push(Page::new(number as u8, std::ptr::null_mut()));
        }

        let mut cluster =
            Box::new(Cluster { start, size: params.cluster_size, layout, pages: pages.into_boxed_slice() });

        // Pages need a stable back-pointer to their owning cluster; that
        // address only exists once `cluster` is boxed, so wire it up in
        // a second pass rather than trying to construct it up front.
        let cluster_ptr: *mut Cluster = &mut *cluster;
        for page in cluster.pages.iter_mut() {
            page.cluster = cluster_ptr;
        }

        Some(cluster)
    }

    /// Address of the `number`th page's record. Returns a raw pointer
    /// from a shared reference: callers (the free path, in particular)
    /// need to recover a page while the Block Registry only hands out
    /// `&Block`, and the pages never move once a cluster is allocated.
    pub(crate) fn page_ptr(&self, number: u8) -> *mut Page {
        &self.pages[number as usize] as *const Page as *mut Page
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        // SAFETY: `start`/`layout` describe the allocation made in
        // `Cluster::allocate`, and this is the only place that frees it.
        unsafe { std::alloc::dealloc(self.start.as_ptr(), self.layout) };
    }
}

impl crate::Pool {
    /// Returns a free page, allocating a new cluster if none is
    /// available. Newly created clusters are registered and their pages
    /// pushed onto `free_pages` in forward page-number order (page 0
    /// ends up at the head), matching `nxt_mp_alloc_cluster`.
    pub(crate) fn take_free_page(&mut self) -> Option<*mut Page> {
        if let Some(page) = self.free_pages.pop_front() {
            return Some(page);
        }

        let mut cluster = Cluster::allocate(&self.params)?;
        let page_count = cluster.pages.len();

        // Insert in forward order with `insert_head`, so walking from the
        // tail backward yields page 0 first: equivalent to looping from
        // the last page down to 0 and always inserting before the
        // previous head, as `nxt_mp_alloc_cluster` does.
        for number in (0..page_count).rev() {
            let page_ptr = cluster.page_ptr(number as u8);
            self.free_pages.insert_head(page_ptr);
        }

        self.registry.insert(Block::Cluster(cluster));
        self.free_pages.pop_front()
    }

    /// Returns `page` to the free-pages list. The caller is responsible
    /// for having already detached it from whatever list it used to
    /// belong to.
    pub(crate) fn return_free_page(&mut self, page: *mut Page) {
        unsafe {
            (*page).state = crate::page::PageState::Free;
        }
        self.free_pages.insert_head(page);
    }

    /// After a page returns to the free state, checks whether every page
    /// in its cluster is now free; if so, detaches them all and releases
    /// the cluster back to the system allocator.
    pub(crate) fn maybe_release_cluster(&mut self, page: *mut Page) {
        let cluster_ptr = unsafe { (*page).cluster };
        let cluster_start = unsafe { (*cluster_ptr).start.as_ptr() as usize };

        let all_free = unsafe {
            (*cluster_ptr)
                .pages
                .iter()
                .all(|p| matches!(p.state, crate::page::PageState::Free))
        };
        if !all_free {
            return;
        }

        let page_count = unsafe { (*cluster_ptr).pages.len() };
        for number in 0..page_count {
            let p = unsafe { (*cluster_ptr).page_ptr(number as u8) };
            self.free_pages.remove(p);
        }

        self.registry.remove_at(cluster_start);
    }
}
