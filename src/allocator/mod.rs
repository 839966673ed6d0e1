//! Tagged heap allocation.
//!
//! Memory is handed out from fixed-size slabs, each owned by one
//! [`MemoryTag`](crate::MemoryTag) at a time. Freeing a tag returns all of its
//! slabs to a shared pool in one step, which is what lets frame pipeline
//! stages drop their scratch data without per-allocation bookkeeping.

mod block;
mod tagged;

pub use block::SLAB_ALIGN;
pub use tagged::{HeapConfig, HeapStats, TagUsage, TaggedHeap};
