use crate::error::{Result, RivenError};
use std::alloc::{Layout, alloc, dealloc};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Sentinel for "no block" in block links and tag heads.
pub(crate) const NO_BLOCK: u32 = u32::MAX;

/// Alignment of every slab handed out by the arena.
pub const SLAB_ALIGN: usize = 4096;

const INDEX_MASK: u64 = 0xFFFF_FFFF;

/// One chunk of raw memory owned by at most one tag at a time.
///
/// `used` only grows while the block is owned; releasing the owning tag
/// resets it to zero and returns the block to the free list.
pub(crate) struct HeapBlock {
    base: AtomicPtr<u8>,
    capacity: AtomicUsize,
    align: AtomicUsize,
    used: AtomicUsize,
    /// Tag key of the owner, zero while pooled.
    owner: AtomicU64,
    /// Next block in the owner's chain, or in the free list while pooled.
    pub(crate) next: AtomicU32,
    dedicated: AtomicBool,
}

impl HeapBlock {
    fn empty() -> Self {
        HeapBlock {
            base: AtomicPtr::new(ptr::null_mut()),
            capacity: AtomicUsize::new(0),
            align: AtomicUsize::new(SLAB_ALIGN),
            used: AtomicUsize::new(0),
            owner: AtomicU64::new(0),
            next: AtomicU32::new(NO_BLOCK),
            dedicated: AtomicBool::new(false),
        }
    }

    /// Carves `size` bytes aligned to `align` out of the unused tail.
    ///
    /// Several threads may bump the same block; the offset advances with a
    /// CAS so every caller gets a disjoint region.
    pub(crate) fn bump(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let base = self.base.load(Ordering::Acquire);
        if base.is_null() {
            return None;
        }
        let capacity = self.capacity.load(Ordering::Relaxed);
        let mut used = self.used.load(Ordering::Acquire);
        loop {
            let addr = (base as usize).checked_add(used)?;
            let aligned = addr.checked_add(align - 1)? & !(align - 1);
            let start = aligned - base as usize;
            let end = start.checked_add(size)?;
            if end > capacity {
                return None;
            }
            match self
                .used
                .compare_exchange_weak(used, end, Ordering::AcqRel, Ordering::Acquire)
            {
                // SAFETY: start + size <= capacity, so the result stays inside the block.
                Ok(_) => return NonNull::new(unsafe { base.add(start) }),
                Err(actual) => used = actual,
            }
        }
    }

    pub(crate) fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    pub(crate) fn owner(&self) -> u64 {
        self.owner.load(Ordering::Acquire)
    }
}

/// Fixed arena of block descriptors indexed by `u32` handles.
///
/// Memory behind a descriptor is requested from the system the first time the
/// descriptor is claimed and kept across tag lifetimes. Pooled descriptors sit
/// on a versioned Treiber stack; `fresh` hands out never-used descriptors.
pub(crate) struct BlockArena {
    blocks: Box<[HeapBlock]>,
    /// `(version << 32) | (index + 1)`; zero index means empty.
    free_head: AtomicU64,
    fresh: AtomicU32,
    slab_size: usize,
    slabs_live: AtomicUsize,
    dedicated_live: AtomicUsize,
}

impl BlockArena {
    pub(crate) fn new(slab_size: usize, max_blocks: u32) -> Self {
        let blocks = (0..max_blocks).map(|_| HeapBlock::empty()).collect();
        BlockArena {
            blocks,
            free_head: AtomicU64::new(0),
            fresh: AtomicU32::new(0),
            slab_size,
            slabs_live: AtomicUsize::new(0),
            dedicated_live: AtomicUsize::new(0),
        }
    }

    pub(crate) fn block(&self, index: u32) -> &HeapBlock {
        &self.blocks[index as usize]
    }

    pub(crate) fn slab_size(&self) -> usize {
        self.slab_size
    }

    pub(crate) fn slabs_live(&self) -> usize {
        self.slabs_live.load(Ordering::Relaxed)
    }

    pub(crate) fn dedicated_live(&self) -> usize {
        self.dedicated_live.load(Ordering::Relaxed)
    }

    pub(crate) fn descriptors_used(&self) -> usize {
        self.fresh.load(Ordering::Relaxed) as usize
    }

    /// Claims a standard slab for `owner`, allocating its memory on first use.
    pub(crate) fn claim(&self, owner: u64) -> Result<u32> {
        let index = self.take_descriptor()?;
        let block = self.block(index);
        if block.base.load(Ordering::Acquire).is_null() {
            let layout = Layout::from_size_align(self.slab_size, SLAB_ALIGN)
                .map_err(|e| RivenError::invalid(e.to_string()))?;
            // SAFETY: layout has a non-zero size.
            let memory = unsafe { alloc(layout) };
            if memory.is_null() {
                self.push_free(index);
                return Err(RivenError::OutOfMemory {
                    what: "tagged heap slab",
                    requested: self.slab_size,
                });
            }
            block.capacity.store(self.slab_size, Ordering::Relaxed);
            block.align.store(SLAB_ALIGN, Ordering::Relaxed);
            block.base.store(memory, Ordering::Release);
            self.slabs_live.fetch_add(1, Ordering::Relaxed);
            log::trace!("tagged heap: slab {index} obtained from the system");
        }
        block.dedicated.store(false, Ordering::Relaxed);
        block.used.store(0, Ordering::Release);
        block.next.store(NO_BLOCK, Ordering::Relaxed);
        block.owner.store(owner, Ordering::Release);
        Ok(index)
    }

    /// Claims a descriptor backed by its own allocation of at least `size` bytes.
    ///
    /// The block is filled on return; nothing else is ever bumped out of it.
    pub(crate) fn claim_dedicated(
        &self,
        owner: u64,
        size: usize,
        align: usize,
    ) -> Result<(u32, NonNull<u8>)> {
        let rounded = size
            .checked_next_multiple_of(self.slab_size)
            .ok_or_else(|| RivenError::invalid(format!("allocation of {size} bytes overflows")))?;
        let align = align.max(SLAB_ALIGN);
        let layout = Layout::from_size_align(rounded, align)
            .map_err(|e| RivenError::invalid(e.to_string()))?;

        let index = self.take_descriptor()?;
        let block = self.block(index);
        // A pooled descriptor may still hold a standard slab; give it back first.
        let old = block.base.swap(ptr::null_mut(), Ordering::AcqRel);
        if !old.is_null() {
            self.free_memory(old, block.capacity(), block.align.load(Ordering::Relaxed));
            self.slabs_live.fetch_sub(1, Ordering::Relaxed);
        }

        // SAFETY: layout has a non-zero size.
        let memory = unsafe { alloc(layout) };
        let Some(memory) = NonNull::new(memory) else {
            block.capacity.store(0, Ordering::Relaxed);
            self.push_free(index);
            return Err(RivenError::OutOfMemory {
                what: "dedicated tagged heap block",
                requested: rounded,
            });
        };
        block.capacity.store(rounded, Ordering::Relaxed);
        block.align.store(align, Ordering::Relaxed);
        block.used.store(rounded, Ordering::Release);
        block.dedicated.store(true, Ordering::Relaxed);
        block.next.store(NO_BLOCK, Ordering::Relaxed);
        block.base.store(memory.as_ptr(), Ordering::Release);
        block.owner.store(owner, Ordering::Release);
        self.dedicated_live.fetch_add(1, Ordering::Relaxed);
        log::debug!("tagged heap: dedicated block {index} of {rounded} bytes");
        Ok((index, memory))
    }

    /// Returns a block to the pool. Dedicated memory goes back to the system.
    pub(crate) fn release(&self, index: u32) {
        let block = self.block(index);
        if block.dedicated.swap(false, Ordering::AcqRel) {
            let memory = block.base.swap(ptr::null_mut(), Ordering::AcqRel);
            if !memory.is_null() {
                self.free_memory(memory, block.capacity(), block.align.load(Ordering::Relaxed));
            }
            block.capacity.store(0, Ordering::Relaxed);
            self.dedicated_live.fetch_sub(1, Ordering::Relaxed);
        }
        block.used.store(0, Ordering::Release);
        block.owner.store(0, Ordering::Release);
        self.push_free(index);
    }

    fn free_memory(&self, memory: *mut u8, capacity: usize, align: usize) {
        if let Ok(layout) = Layout::from_size_align(capacity, align) {
            // SAFETY: memory was allocated with exactly this layout.
            unsafe { dealloc(memory, layout) };
        }
    }

    fn take_descriptor(&self) -> Result<u32> {
        if let Some(index) = self.pop_free() {
            return Ok(index);
        }
        // Never bumps past the arena, so repeated exhaustion cannot wrap.
        let mut index = self.fresh.load(Ordering::Acquire);
        loop {
            if index as usize >= self.blocks.len() {
                return Err(RivenError::OutOfMemory {
                    what: "tagged heap block descriptors",
                    requested: self.slab_size,
                });
            }
            match self.fresh.compare_exchange_weak(
                index,
                index + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(index),
                Err(current) => index = current,
            }
        }
    }

    fn pop_free(&self) -> Option<u32> {
        let mut head = self.free_head.load(Ordering::Acquire);
        loop {
            let top = (head & INDEX_MASK) as u32;
            if top == 0 {
                return None;
            }
            let index = top - 1;
            let next = self.block(index).next.load(Ordering::Acquire);
            let next_enc = if next == NO_BLOCK { 0 } else { next as u64 + 1 };
            let version = (head >> 32).wrapping_add(1);
            match self.free_head.compare_exchange_weak(
                head,
                (version << 32) | next_enc,
                Ordering::SeqCst,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(index),
                Err(actual) => head = actual,
            }
        }
    }

    fn push_free(&self, index: u32) {
        let mut head = self.free_head.load(Ordering::Acquire);
        loop {
            let top = (head & INDEX_MASK) as u32;
            let next = if top == 0 { NO_BLOCK } else { top - 1 };
            self.block(index).next.store(next, Ordering::Release);
            let version = (head >> 32).wrapping_add(1);
            match self.free_head.compare_exchange_weak(
                head,
                (version << 32) | (index as u64 + 1),
                Ordering::SeqCst,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }
}

impl Drop for BlockArena {
    fn drop(&mut self) {
        for block in self.blocks.iter().take(self.descriptors_used()) {
            let memory = block.base.swap(ptr::null_mut(), Ordering::AcqRel);
            if !memory.is_null() {
                self.free_memory(memory, block.capacity(), block.align.load(Ordering::Relaxed));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_respects_alignment_and_capacity() {
        let arena = BlockArena::new(SLAB_ALIGN, 4);
        let index = arena.claim(1).unwrap();
        let block = arena.block(index);

        let a = block.bump(3, 1).unwrap();
        let b = block.bump(8, 64).unwrap();
        assert_eq!(b.as_ptr() as usize % 64, 0);
        assert!(b.as_ptr() as usize >= a.as_ptr() as usize + 3);

        assert!(block.bump(SLAB_ALIGN, 1).is_none());
        assert!(block.used() <= block.capacity());
    }

    #[test]
    fn test_release_recycles_descriptor() {
        let arena = BlockArena::new(SLAB_ALIGN, 2);
        let first = arena.claim(7).unwrap();
        arena.release(first);
        let again = arena.claim(9).unwrap();
        assert_eq!(first, again);
        assert_eq!(arena.slabs_live(), 1);
        assert_eq!(arena.block(again).owner(), 9);
        assert_eq!(arena.block(again).used(), 0);
    }

    #[test]
    fn test_descriptor_exhaustion() {
        let arena = BlockArena::new(SLAB_ALIGN, 1);
        arena.claim(1).unwrap();
        assert!(matches!(
            arena.claim(2),
            Err(RivenError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn test_repeated_exhaustion_keeps_fresh_counter_bounded() {
        let arena = BlockArena::new(SLAB_ALIGN, 2);
        let first = arena.claim(1).unwrap();
        arena.claim(1).unwrap();
        for _ in 0..1000 {
            assert!(arena.claim(2).is_err());
        }
        assert_eq!(arena.descriptors_used(), 2);
        assert_eq!(arena.fresh.load(Ordering::Relaxed), 2);

        arena.release(first);
        assert_eq!(arena.claim(3).unwrap(), first);
        assert!(arena.claim(3).is_err());
        assert_eq!(arena.descriptors_used(), 2);
    }

    #[test]
    fn test_dedicated_block_returns_to_system() {
        let arena = BlockArena::new(SLAB_ALIGN, 2);
        let (index, memory) = arena.claim_dedicated(3, SLAB_ALIGN * 3 + 1, 16).unwrap();
        assert_eq!(memory.as_ptr() as usize % SLAB_ALIGN, 0);
        assert_eq!(arena.block(index).capacity(), SLAB_ALIGN * 4);
        assert_eq!(arena.dedicated_live(), 1);
        arena.release(index);
        assert_eq!(arena.dedicated_live(), 0);

        // The recycled descriptor gets a fresh standard slab.
        let reused = arena.claim(4).unwrap();
        assert_eq!(reused, index);
        assert_eq!(arena.block(reused).capacity(), SLAB_ALIGN);
    }
}
