use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use riven::{FrameTagRing, HeapConfig, MemoryTag, TaggedHeap};
use std::sync::Arc;
use std::thread;

fn small_heap(threads: usize) -> TaggedHeap {
    TaggedHeap::with_config(
        threads,
        HeapConfig {
            slab_size: 64 * 1024,
            ..Default::default()
        },
    )
    .unwrap()
}

#[test]
fn test_page_sized_allocations_fill_then_spill() {
    let heap = small_heap(1);
    let tag = MemoryTag::custom(0x42).unwrap();
    let per_block = heap.slab_size() / 4096;

    let mut regions = Vec::new();
    for _ in 0..per_block {
        let ptr = heap.alloc(4096, 16, tag).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 16, 0);
        regions.push(ptr.as_ptr() as usize);
    }
    assert_eq!(heap.usage(tag).blocks, 1);

    // The block is full; the next request claims a second one.
    regions.push(heap.alloc(4096, 16, tag).unwrap().as_ptr() as usize);
    assert_eq!(heap.usage(tag).blocks, 2);

    regions.sort_unstable();
    for pair in regions.windows(2) {
        assert!(pair[1] - pair[0] >= 4096, "regions overlap");
    }
    heap.free(tag);
}

#[test]
fn test_free_then_reuse() {
    let heap = small_heap(1);
    let first = MemoryTag::custom(1).unwrap();
    let second = MemoryTag::custom(2).unwrap();

    heap.alloc(1024, 8, first).unwrap();
    let live = heap.stats().slabs_live;
    heap.free(first);
    heap.free(first);
    assert_eq!(heap.usage(first).blocks, 0);

    // The pooled slab is handed to the next tag instead of a fresh one.
    heap.alloc(1024, 8, second).unwrap();
    assert_eq!(heap.stats().slabs_live, live);
    assert_eq!(heap.usage(second).bytes_used, 1024);
}

#[test]
fn test_random_sizes_respect_alignment() {
    let heap = small_heap(1);
    let tag = MemoryTag::custom(3).unwrap();
    let mut rng = StdRng::seed_from_u64(17);

    let mut total = 0;
    for _ in 0..1000 {
        let size = rng.random_range(1..=2048);
        let align = 1usize << rng.random_range(0..=7);
        let ptr = heap.alloc(size, align, tag).unwrap();
        assert_eq!(ptr.as_ptr() as usize % align, 0);
        // SAFETY: the region is `size` bytes and owned by this test.
        unsafe { ptr.as_ptr().write_bytes(0xAB, size) };
        total += size;
    }
    assert!(heap.usage(tag).bytes_used >= total);
    heap.free(tag);
    assert_eq!(heap.usage(tag).bytes_used, 0);
}

#[test]
fn test_oversized_block_returns_to_system() {
    let heap = small_heap(1);
    let tag = MemoryTag::custom(4).unwrap();

    heap.alloc(heap.slab_size() * 3, 64, tag).unwrap();
    assert_eq!(heap.usage(tag).dedicated_blocks, 1);
    assert_eq!(heap.stats().dedicated_live, 1);

    heap.free(tag);
    assert_eq!(heap.stats().dedicated_live, 0);
}

#[test]
fn test_workers_allocate_in_private_lanes() {
    let heap = Arc::new(small_heap(4));
    let tag = MemoryTag::SIMULATION;

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let heap = heap.clone();
            thread::spawn(move || {
                let mut addresses = Vec::new();
                for _ in 0..200 {
                    let ptr = heap.alloc_local(worker, 128, 16, tag).unwrap();
                    addresses.push(ptr.as_ptr() as usize);
                }
                addresses
            })
        })
        .collect();

    let mut all: Vec<usize> = handles
        .into_iter()
        .flat_map(|handle| handle.join().unwrap())
        .collect();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), 800);

    for worker in 0..4 {
        assert_eq!(heap.usage(tag.for_worker(worker)).bytes_used, 200 * 128);
    }

    // Freeing the shared tag releases every lane.
    heap.free(tag);
    for worker in 0..4 {
        assert_eq!(heap.usage(tag.for_worker(worker)).blocks, 0);
    }
}

#[test]
fn test_frame_ring_rotation_keeps_in_flight_frames_apart() {
    let heap = small_heap(1);
    let ring = FrameTagRing::new(MemoryTag::SIMULATION, 3).unwrap();

    for frame in 0..3 {
        heap.alloc(256, 8, ring.tag_for(frame)).unwrap();
    }
    // Frame 3 reuses frame 0's tag, which must have been freed first.
    heap.free(ring.tag_for(0));
    assert_eq!(ring.tag_for(3), ring.tag_for(0));
    heap.alloc(256, 8, ring.tag_for(3)).unwrap();

    assert_eq!(heap.usage(ring.tag_for(1)).bytes_used, 256);
    assert_eq!(heap.usage(ring.tag_for(2)).bytes_used, 256);
    assert_eq!(heap.usage(ring.tag_for(3)).bytes_used, 256);

    for tag in ring.tags() {
        heap.free(tag);
    }
    assert!(ring.tags().all(|tag| heap.usage(tag).blocks == 0));
}
