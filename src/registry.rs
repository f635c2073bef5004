//! The Block Registry: an ordered map of `Block`s keyed by starting
//! address, supporting point-in-interval lookup so `free` can map any
//! pointer the pool handed out back to the block that owns it.
//!
//! `nxt_mp.c` keeps this as an rbtree of `nxt_mp_block_t` compared by
//! `start`. `slitter`'s debug instrumentation (`debug_arange_map.rs`,
//! `debug_type_map.rs`) independently reinvents the same "ordered map
//! keyed by start address, look up by predecessor + containment check"
//! shape using a `BTreeMap`; that's the idiomatic Rust analogue of the
//! rbtree, and the one this module follows.
#[cfg(any(all(test, feature = "check_contracts_in_tests"), feature = "check_contracts"))]
use contracts::*;
#[cfg(not(any(all(test, feature = "check_contracts_in_tests"), feature = "check_contracts")))]
use disabled_contracts::*;

use std::alloc::Layout;
use std::collections::BTreeMap;
use std::ptr::NonNull;

use crate::cluster::Cluster;

/// A registered allocation: either a whole cluster, or a standalone
/// large allocation.
pub(crate) enum Block {
    Cluster(Box<Cluster>),
    Large(LargeBlock),
}

pub(crate) struct LargeBlock {
    pub(crate) start: NonNull<u8>,
    pub(crate) size: u32,
    pub(crate) kind: LargeKind,
}

pub(crate) enum LargeKind {
    /// Descriptor and payload are two separate allocations.
    Discrete { payload_layout: Layout, descriptor: NonNull<u8>, descriptor_layout: Layout },
    /// A single allocation holds the payload followed by the block's
    /// bookkeeping; releasing `buffer_layout` at `start` frees both.
    Embedded { buffer_layout: Layout },
}

impl Drop for LargeBlock {
    /// Releases the backing bytes for both `LargeKind` shapes. Dropping a
    /// `Block::Large` (whether via an explicit `free`, the destroy sweep,
    /// or `BTreeMap`'s own drop glue) is therefore enough on its own --
    /// no separate free-path code needs to know about discrete vs.
    /// embedded layout.
    fn drop(&mut self) {
        match &self.kind {
            LargeKind::Discrete { payload_layout, descriptor, descriptor_layout } => unsafe {
                std::alloc::dealloc(self.start.as_ptr(), *payload_layout);
                std::alloc::dealloc(descriptor.as_ptr(), *descriptor_layout);
            },
            LargeKind::Embedded { buffer_layout } => unsafe {
                std::alloc::dealloc(self.start.as_ptr(), *buffer_layout);
            },
        }
    }
}

impl Block {
    fn start(&self) -> usize {
        match self {
            Block::Cluster(cluster) => cluster.start.as_ptr() as usize,
            Block::Large(large) => large.start.as_ptr() as usize,
        }
    }

    fn size(&self) -> usize {
        match self {
            Block::Cluster(cluster) => cluster.size,
            Block::Large(large) => large.size as usize,
        }
    }

    fn contains(&self, ptr: usize) -> bool {
        let start = self.start();
        ptr >= start && ptr < start + self.size()
    }
}

#[derive(Default)]
pub(crate) struct BlockRegistry {
    blocks: BTreeMap<usize, Block>,
}

impl BlockRegistry {
    pub(crate) fn new() -> BlockRegistry {
        BlockRegistry { blocks: BTreeMap::new() }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    #[ensures(self.blocks.len() == old(self.blocks.len()) + 1, "insert always adds exactly one entry")]
    pub(crate) fn insert(&mut self, block: Block) {
        let start = block.start();
        let prior = self.blocks.insert(start, block);
        debug_assert!(prior.is_none(), "block start addresses must be unique");
    }

    /// Removes the block that starts at `start`, if registered.
    pub(crate) fn remove_at(&mut self, start: usize) -> Option<Block> {
        self.blocks.remove(&start)
    }

    /// Finds the block containing `ptr`, via point-in-interval
    /// containment: the candidate is the block with the greatest start
    /// address `<= ptr`. Returns the block's start address alongside it,
    /// since callers that mutate (`free`) need it to re-locate the entry.
    #[ensures(ret.is_some() -> ret.as_ref().unwrap().1.contains(ptr), "a hit must actually contain ptr")]
    pub(crate) fn find(&self, ptr: usize) -> Option<(usize, &Block)> {
        let (start, block) = self.blocks.range(..=ptr).next_back()?;
        if block.contains(ptr) {
            Some((*start, block))
        } else {
            None
        }
    }

    /// Consumes the registry, yielding every block once, in ascending
    /// start-address order. `BTreeMap::into_iter` already hands out owned
    /// entries without requiring any tree surgery from the caller, unlike
    /// the rbtree `destroy_next` dance `nxt_mp_destroy` performs.
    pub(crate) fn destroy_walk(self) -> impl Iterator<Item = Block> {
        self.blocks.into_values()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Allocates a real `size`-byte buffer so the registered block's
    /// `Drop` (a genuine `dealloc`) stays sound when the test registry
    /// goes out of scope, instead of faking up an address that was never
    /// actually allocated.
    fn fake_large(size: usize) -> Block {
        let layout = Layout::from_size_align(size, 1).unwrap();
        let start = NonNull::new(unsafe { std::alloc::alloc(layout) }).unwrap();
        Block::Large(LargeBlock { start, size: size as u32, kind: LargeKind::Embedded { buffer_layout: layout } })
    }

    #[test]
    fn find_is_point_in_interval() {
        let mut registry = BlockRegistry::new();
        let a = fake_large(0x100);
        let b = fake_large(0x100);
        let (a_start, b_start) = (a.start(), b.start());
        registry.insert(a);
        registry.insert(b);

        assert!(registry.find(a_start - 1).is_none());
        assert!(registry.find(a_start).is_some());
        assert!(registry.find(a_start + 0x80).is_some());
        assert!(registry.find(a_start + 0x100).is_none());
        assert!(registry.find(b_start - 1).is_none());
        assert!(registry.find(b_start).is_some());
        assert!(registry.find(b_start + 0xff).is_some());
        assert!(registry.find(b_start + 0x100).is_none());
    }

    #[test]
    fn empty_registry_finds_nothing() {
        let registry = BlockRegistry::new();
        assert!(registry.find(0x1234).is_none());
        assert!(registry.is_empty());
    }
}
