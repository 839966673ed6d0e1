//! # Riven - Fiber Scheduler for a Pipelined Frame Loop
//!
//! A fixed pool of worker threads multiplexes a fixed pool of stack-ful
//! fibers. Work is expressed as *tears*: `split` fans a batch of tears out
//! across the workers and returns a *chain*, and `unchain` suspends the
//! calling fiber (never its thread) until the chain completes. A tagged heap
//! gives frame-stage data a lifetime that ends with a single `free(tag)`.
//!
//! ## Architecture
//!
//! - **Rift**: two-phase bootstrap. Query the buffer size, hand over a buffer,
//!   and the calling thread becomes worker 0 until the entry tear returns.
//! - **Fibers**: corosensei coroutines on stacks carved from that buffer,
//!   created once and recycled.
//! - **Dispatch**: per-worker LIFO deques, a global injector, work stealing,
//!   and a ready ring for fibers whose chain completed.
//! - **Tagged heap**: lock-free slab allocator keyed by [`MemoryTag`].
//! - **Frame pipeline**: simulation, rendering and GPU execution of three
//!   consecutive frames run in parallel each iteration.
//!
//! ## Example
//!
//! ```no_run
//! use riven::{Rift, RiftConfig, RiftHints, Tear};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let config = RiftConfig::from_hints(&RiftHints { thread_count: 4, ..Default::default() }).unwrap();
//! let hits = Arc::new(AtomicUsize::new(0));
//! let seen = hits.clone();
//!
//! Rift::run(&config, move |ctx| {
//!     let tears = (0..100).map(|_| {
//!         let hits = seen.clone();
//!         Tear::new("hit", move |_| {
//!             hits.fetch_add(1, Ordering::Relaxed);
//!         })
//!     });
//!     ctx.split_and_unchain(tears).unwrap();
//! })
//! .unwrap();
//!
//! assert_eq!(hits.load(Ordering::Relaxed), 100);
//! ```

pub mod allocator;
pub mod backend;
pub mod c_api;
pub mod chain;
pub mod context;
pub mod error;
pub mod fiber;
mod fiber_pool;
pub mod metrics;
pub mod pipeline;
pub mod rift;
pub mod tag;
pub mod tear;
pub mod tracing;
mod worker;

use serde::{Deserialize, Serialize};

/// Strategy for pinning worker threads to CPU cores.
///
/// The bootstrapping thread is worker 0 and is never pinned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PinningStrategy {
    /// No pinning (standard OS scheduling).
    #[default]
    None,
    /// Linear pinning (worker i -> logical processor i).
    Linear,
    /// Pin to physical cores only (even-numbered logical processors), avoiding SMT contention.
    AvoidSMT,
}

pub use allocator::{HeapConfig, HeapStats, TagUsage, TaggedHeap};
pub use backend::{Backend, BackendKind, HeadlessBackend, select_backend};
pub use chain::{Chain, ExiledChain, unchain_exile};
pub use context::Context;
pub use error::{Result, RivenError};
pub use fiber::{FiberHandle, FiberState};
pub use fiber_pool::{MIN_FIBER_STACK, stack_region_size};
pub use metrics::StatsSnapshot;
pub use pipeline::{
    Engine, FramePipeline, FrameStage, PipelineControl, PipelineReport, PipelineState,
    StageCallbacks, StageKind,
};
pub use rift::{Rift, RiftConfig, RiftExit, RiftHints, RiftMemory};
pub use tag::{FrameTagRing, MemoryTag};
pub use tear::Tear;
pub use tracing::TraceEvent;
