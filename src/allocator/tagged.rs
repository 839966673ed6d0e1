use super::block::{BlockArena, NO_BLOCK, SLAB_ALIGN};
use crate::error::{Result, RivenError};
use crate::tag::MemoryTag;
use serde::{Deserialize, Serialize};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Sizing of a [`TaggedHeap`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapConfig {
    /// Bytes per standard slab. Power of two, at least 4 KiB. Default: 2 MiB.
    pub slab_size: usize,
    /// Upper bound on block descriptors (standard plus dedicated). Default: 4096.
    pub max_blocks: u32,
    /// Distinct tags the heap can ever track. Power of two. Default: 4096.
    pub tag_capacity: usize,
    /// Slabs reserved up front. Zero reserves one per worker thread.
    pub initial_slabs: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            slab_size: 2 * 1024 * 1024,
            max_blocks: 4096,
            tag_capacity: 4096,
            initial_slabs: 0,
        }
    }
}

impl HeapConfig {
    fn validate(&self) -> Result<()> {
        if !self.slab_size.is_power_of_two() || self.slab_size < SLAB_ALIGN {
            return Err(RivenError::invalid(format!(
                "slab size {} must be a power of two of at least {SLAB_ALIGN}",
                self.slab_size
            )));
        }
        if !self.tag_capacity.is_power_of_two() {
            return Err(RivenError::invalid(format!(
                "tag capacity {} must be a power of two",
                self.tag_capacity
            )));
        }
        if self.max_blocks == 0 || self.max_blocks == NO_BLOCK {
            return Err(RivenError::invalid("max_blocks out of range"));
        }
        Ok(())
    }
}

/// Blocks and bytes currently held by one exact tag.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TagUsage {
    pub blocks: usize,
    pub dedicated_blocks: usize,
    pub bytes_used: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HeapStats {
    /// Standard slabs obtained from the system and still held (pooled or owned).
    pub slabs_live: usize,
    /// Dedicated oversized blocks currently owned by a tag.
    pub dedicated_live: usize,
    /// Block descriptors ever touched.
    pub descriptors_used: usize,
}

struct TagSlot {
    /// `tag + 1`, zero while the slot is unclaimed. Never cleared once set.
    key: AtomicU64,
    head: AtomicU32,
    dedicated: AtomicU32,
}

/// Open-addressed map from tag to the head of its block chains.
///
/// Keys are claimed with a CAS and stay in place for the life of the heap, so
/// lookups never race with removal; freeing a tag only empties its chains.
struct TagTable {
    slots: Box<[TagSlot]>,
    mask: usize,
}

impl TagTable {
    fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| TagSlot {
                key: AtomicU64::new(0),
                head: AtomicU32::new(NO_BLOCK),
                dedicated: AtomicU32::new(NO_BLOCK),
            })
            .collect();
        TagTable {
            slots,
            mask: capacity - 1,
        }
    }

    fn start(key: u64) -> usize {
        (key.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as usize
    }

    fn find(&self, key: u64) -> Option<&TagSlot> {
        let start = Self::start(key);
        for probe in 0..self.slots.len() {
            let slot = &self.slots[(start + probe) & self.mask];
            match slot.key.load(Ordering::Acquire) {
                k if k == key => return Some(slot),
                0 => return None,
                _ => {}
            }
        }
        None
    }

    fn find_or_insert(&self, key: u64) -> Result<&TagSlot> {
        let start = Self::start(key);
        for probe in 0..self.slots.len() {
            let slot = &self.slots[(start + probe) & self.mask];
            let current = slot.key.load(Ordering::Acquire);
            if current == key {
                return Ok(slot);
            }
            if current == 0 {
                match slot
                    .key
                    .compare_exchange(0, key, Ordering::SeqCst, Ordering::Acquire)
                {
                    Ok(_) => return Ok(slot),
                    Err(actual) if actual == key => return Ok(slot),
                    Err(_) => {}
                }
            }
        }
        Err(RivenError::OutOfMemory {
            what: "tag table slots",
            requested: 0,
        })
    }
}

/// Lifetime-oriented allocator: every allocation belongs to a [`MemoryTag`]
/// and freeing the tag releases all of them at once.
///
/// Allocation is lock-free. The common path is a CAS on the current head
/// block's offset; a full block is replaced by a claimed one pushed onto the
/// tag's chain. Memory handed out is uninitialized.
///
/// Using memory after its tag was freed is undefined behaviour the caller
/// avoids by lifetime discipline; the heap does not detect it.
///
/// # Example
///
/// ```
/// use riven::{MemoryTag, TaggedHeap};
///
/// let heap = TaggedHeap::new(1).unwrap();
/// let tag = MemoryTag::custom(7).unwrap();
/// let ptr = heap.alloc(256, 16, tag).unwrap();
/// assert_eq!(ptr.as_ptr() as usize % 16, 0);
/// heap.free(tag);
/// ```
pub struct TaggedHeap {
    arena: BlockArena,
    tags: TagTable,
    thread_count: usize,
}

impl TaggedHeap {
    /// Creates a heap with default sizing for `thread_count` workers.
    pub fn new(thread_count: usize) -> Result<Self> {
        Self::with_config(thread_count, HeapConfig::default())
    }

    pub fn with_config(thread_count: usize, config: HeapConfig) -> Result<Self> {
        config.validate()?;
        if thread_count == 0 || thread_count > crate::tag::MAX_LANES {
            return Err(RivenError::invalid(format!(
                "thread count {thread_count} out of range 1..={}",
                crate::tag::MAX_LANES
            )));
        }
        let heap = TaggedHeap {
            arena: BlockArena::new(config.slab_size, config.max_blocks),
            tags: TagTable::new(config.tag_capacity),
            thread_count,
        };

        let reserve = if config.initial_slabs == 0 {
            thread_count
        } else {
            config.initial_slabs
        };
        let mut reserved = Vec::with_capacity(reserve);
        for _ in 0..reserve {
            reserved.push(heap.arena.claim(u64::MAX)?);
        }
        for index in reserved {
            heap.arena.release(index);
        }
        log::debug!(
            "tagged heap ready: {} slabs of {} bytes reserved for {} threads",
            reserve,
            config.slab_size,
            thread_count
        );
        Ok(heap)
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    pub fn slab_size(&self) -> usize {
        self.arena.slab_size()
    }

    /// Allocates `size` bytes aligned to `align` under exactly `tag`.
    ///
    /// A zero-sized request allocates nothing and returns an aligned dangling
    /// pointer. Requests larger than a slab get a dedicated block that goes
    /// back to the system when the tag is freed.
    pub fn alloc(&self, size: usize, align: usize, tag: MemoryTag) -> Result<NonNull<u8>> {
        if !align.is_power_of_two() {
            return Err(RivenError::invalid(format!(
                "alignment {align} is not a power of two"
            )));
        }
        if size == 0 {
            // SAFETY: a power of two is never zero.
            return Ok(unsafe { NonNull::new_unchecked(align as *mut u8) });
        }

        let key = tag.raw() + 1;
        let slot = self.tags.find_or_insert(key)?;

        if size > self.arena.slab_size() || align > SLAB_ALIGN {
            let (index, memory) = self.arena.claim_dedicated(key, size, align)?;
            self.push_chain(&slot.dedicated, index);
            return Ok(memory);
        }

        let head = slot.head.load(Ordering::Acquire);
        if head != NO_BLOCK {
            if let Some(memory) = self.arena.block(head).bump(size, align) {
                return Ok(memory);
            }
        }

        let index = self.arena.claim(key)?;
        // The block is still private, so this cannot fail.
        let memory = self.arena.block(index).bump(size, align).ok_or(
            RivenError::OutOfMemory {
                what: "fresh slab",
                requested: size,
            },
        )?;
        self.push_chain(&slot.head, index);
        log::trace!("tagged heap: block {index} claimed for {tag:?}");
        Ok(memory)
    }

    /// Allocates under the calling worker's private sub-tag of `tag`.
    ///
    /// With a single worker this is the same as [`alloc`](Self::alloc).
    pub fn alloc_local(
        &self,
        worker: usize,
        size: usize,
        align: usize,
        tag: MemoryTag,
    ) -> Result<NonNull<u8>> {
        let tag = if self.thread_count > 1 {
            tag.for_worker(worker)
        } else {
            tag
        };
        self.alloc(size, align, tag)
    }

    /// Moves `value` into memory owned by `tag`.
    ///
    /// The value is never dropped; freeing the tag just releases its bytes.
    pub fn alloc_value<T>(&self, tag: MemoryTag, value: T) -> Result<NonNull<T>> {
        let ptr = self
            .alloc(
                std::mem::size_of::<T>(),
                std::mem::align_of::<T>(),
                tag,
            )?
            .cast::<T>();
        // SAFETY: freshly allocated, correctly sized and aligned.
        unsafe { ptr.as_ptr().write(value) };
        Ok(ptr)
    }

    /// Releases every block owned by `tag` and by all of its worker sub-tags.
    ///
    /// Freeing a tag with nothing outstanding is a no-op.
    pub fn free(&self, tag: MemoryTag) {
        let shared = tag.shared();
        self.free_exact(shared);
        for worker in 0..self.thread_count {
            self.free_exact(shared.for_worker(worker));
        }
    }

    /// Releases the blocks owned by exactly `tag`, leaving sub-tags alone.
    pub fn free_exact(&self, tag: MemoryTag) {
        let Some(slot) = self.tags.find(tag.raw() + 1) else {
            return;
        };
        let mut released = 0usize;
        for chain in [&slot.head, &slot.dedicated] {
            let mut index = chain.swap(NO_BLOCK, Ordering::SeqCst);
            while index != NO_BLOCK {
                let next = self.arena.block(index).next.load(Ordering::Acquire);
                self.arena.release(index);
                released += 1;
                index = next;
            }
        }
        if released > 0 {
            log::trace!("tagged heap: freed {tag:?} ({released} blocks)");
        }
    }

    /// Blocks and bytes held by exactly `tag`.
    pub fn usage(&self, tag: MemoryTag) -> TagUsage {
        let mut usage = TagUsage::default();
        let Some(slot) = self.tags.find(tag.raw() + 1) else {
            return usage;
        };
        for (chain, dedicated) in [(&slot.head, false), (&slot.dedicated, true)] {
            let mut index = chain.load(Ordering::Acquire);
            while index != NO_BLOCK {
                let block = self.arena.block(index);
                usage.blocks += 1;
                if dedicated {
                    usage.dedicated_blocks += 1;
                }
                usage.bytes_used += block.used();
                index = block.next.load(Ordering::Acquire);
            }
        }
        usage
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            slabs_live: self.arena.slabs_live(),
            dedicated_live: self.arena.dedicated_live(),
            descriptors_used: self.arena.descriptors_used(),
        }
    }

    fn push_chain(&self, head: &AtomicU32, index: u32) {
        let block = self.arena.block(index);
        let mut current = head.load(Ordering::Acquire);
        loop {
            block.next.store(current, Ordering::Release);
            match head.compare_exchange_weak(current, index, Ordering::SeqCst, Ordering::Acquire) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}
