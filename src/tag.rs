//! Memory tags and frame-slot rotation.
//!
//! A [`MemoryTag`] names a lifetime class in the [`TaggedHeap`](crate::allocator::TaggedHeap).
//! The 64-bit value is split into fields:
//!
//! ```text
//!  63      56 55    48 47            32 31             0
//! +----------+--------+----------------+----------------+
//! | reserved |  lane  |     stage      |      slot      |
//! +----------+--------+----------------+----------------+
//! ```
//!
//! Bit 63 marks engine-internal tags. The lane holds `worker + 1` for
//! thread-private sub-tags and zero for the shared tag. Application tags may
//! only use the low 48 bits.

use crate::error::{Result, RivenError};
use serde::{Deserialize, Serialize};
use std::fmt;

const ENGINE_BIT: u64 = 1 << 63;
const LANE_SHIFT: u32 = 48;
const LANE_MASK: u64 = 0xFF << LANE_SHIFT;
const STAGE_SHIFT: u32 = 32;
const SLOT_MASK: u64 = 0xFFFF_FFFF;

/// Highest number of worker lanes a tag can carry.
pub const MAX_LANES: usize = 255;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemoryTag(u64);

impl MemoryTag {
    /// Bits an application tag must leave clear.
    pub const RESERVED_MASK: u64 = 0xFFFF_0000_0000_0000;

    /// Simulation output consumed by rendering.
    pub const SIMULATION: MemoryTag = MemoryTag::engine(1);
    /// Rendering output consumed by GPU execution.
    pub const RENDERING: MemoryTag = MemoryTag::engine(2);
    /// Scratch of the GPU execution stage, freed when its callback returns.
    pub const GPU_EXEC: MemoryTag = MemoryTag::engine(3);
    /// Data that lives from simulation to GPU execution of one frame.
    pub const FRAME_SHARED: MemoryTag = MemoryTag::engine(4);

    const fn engine(stage: u64) -> Self {
        MemoryTag(ENGINE_BIT | (stage << STAGE_SHIFT))
    }

    /// Creates an application tag. Fails if `value` touches the reserved range.
    pub fn custom(value: u64) -> Result<Self> {
        if value & Self::RESERVED_MASK != 0 {
            return Err(RivenError::invalid(format!(
                "custom tag {value:#x} overlaps the reserved bit range {:#x}",
                Self::RESERVED_MASK
            )));
        }
        Ok(MemoryTag(value))
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn is_engine(self) -> bool {
        self.0 & ENGINE_BIT != 0
    }

    /// The worker owning this sub-tag, or `None` for a shared tag.
    pub const fn lane(self) -> Option<usize> {
        let lane = ((self.0 & LANE_MASK) >> LANE_SHIFT) as usize;
        if lane == 0 { None } else { Some(lane - 1) }
    }

    /// The private sub-tag of `worker` under this logical tag.
    ///
    /// # Panics
    ///
    /// Panics if `worker >= MAX_LANES`; the rift never creates that many workers.
    pub fn for_worker(self, worker: usize) -> Self {
        assert!(worker < MAX_LANES, "worker lane {worker} out of range");
        MemoryTag((self.0 & !LANE_MASK) | (((worker as u64) + 1) << LANE_SHIFT))
    }

    /// The shared tag with any worker lane stripped.
    pub const fn shared(self) -> Self {
        MemoryTag(self.0 & !LANE_MASK)
    }

    /// `self + n` within the slot field.
    pub const fn offset(self, n: u32) -> Self {
        let slot = (self.0 & SLOT_MASK).wrapping_add(n as u64) & SLOT_MASK;
        MemoryTag((self.0 & !SLOT_MASK) | slot)
    }
}

impl fmt::Debug for MemoryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("MemoryTag");
        if self.is_engine() {
            d.field("stage", &((self.0 >> STAGE_SHIFT) & 0xFFFF));
            d.field("slot", &(self.0 & SLOT_MASK));
        } else {
            d.field("value", &(self.0 & !Self::RESERVED_MASK));
        }
        if let Some(lane) = self.lane() {
            d.field("worker", &lane);
        }
        d.finish()
    }
}

/// Ring of tags a pipeline stage rotates through, one per frame in flight.
///
/// Frame `i` maps to `base + (i % cycle)`, so a slot is reused only once the
/// frame `cycle` steps earlier has left the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameTagRing {
    base: MemoryTag,
    cycle: u32,
}

impl FrameTagRing {
    pub fn new(base: MemoryTag, cycle: u32) -> Result<Self> {
        if cycle == 0 {
            return Err(RivenError::invalid("frame tag ring needs at least one slot"));
        }
        Ok(FrameTagRing { base, cycle })
    }

    pub fn tag_for(&self, frame: u64) -> MemoryTag {
        self.base.offset((frame % self.cycle as u64) as u32)
    }

    pub fn cycle(&self) -> u32 {
        self.cycle
    }

    pub fn tags(&self) -> impl Iterator<Item = MemoryTag> + '_ {
        (0..self.cycle).map(|n| self.base.offset(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_tag_rejects_reserved_bits() {
        assert!(MemoryTag::custom(42).is_ok());
        assert!(MemoryTag::custom(1 << 47).is_ok());
        assert!(matches!(
            MemoryTag::custom(1 << 48),
            Err(RivenError::InvalidArgument(_))
        ));
        assert!(MemoryTag::custom(1 << 63).is_err());
    }

    #[test]
    fn test_engine_tags_never_collide_with_custom() {
        for stage in [
            MemoryTag::SIMULATION,
            MemoryTag::RENDERING,
            MemoryTag::GPU_EXEC,
            MemoryTag::FRAME_SHARED,
        ] {
            assert!(stage.is_engine());
            assert!(MemoryTag::custom(stage.raw()).is_err());
        }
    }

    #[test]
    fn test_worker_lanes() {
        let tag = MemoryTag::SIMULATION.offset(2);
        assert_eq!(tag.lane(), None);
        let private = tag.for_worker(3);
        assert_eq!(private.lane(), Some(3));
        assert_ne!(private, tag);
        assert_eq!(private.shared(), tag);
        assert_ne!(tag.for_worker(0), tag.for_worker(1));
    }

    #[test]
    fn test_ring_rotation() {
        let ring = FrameTagRing::new(MemoryTag::RENDERING, 3).unwrap();
        assert_eq!(ring.tag_for(0), MemoryTag::RENDERING);
        assert_eq!(ring.tag_for(1), MemoryTag::RENDERING.offset(1));
        assert_eq!(ring.tag_for(3), ring.tag_for(0));
        assert_eq!(ring.tag_for(128), ring.tag_for(2));
        assert_eq!(ring.tags().count(), 3);
        assert!(FrameTagRing::new(MemoryTag::RENDERING, 0).is_err());
    }

    #[test]
    fn test_offset_stays_in_stage() {
        let tag = MemoryTag::GPU_EXEC.offset(u32::MAX).offset(1);
        assert_eq!(tag, MemoryTag::GPU_EXEC);
    }
}
