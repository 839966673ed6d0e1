//! The rift: a fixed set of worker threads multiplexing a fixed set of fibers.
//!
//! Bootstrapping is two-phase. [`Rift::query_memory`] reports how many bytes
//! the caller must supply; [`Rift::bootstrap`] carves the fiber stacks out of
//! that buffer, turns the calling thread into worker 0, spawns the others and
//! runs the entry tear. It returns once the entry tear has returned and every
//! worker has joined, handing the buffer back.

use crate::PinningStrategy;
use crate::allocator::TaggedHeap;
use crate::context::Context;
use crate::error::{Result, RivenError};
use crate::fiber::FiberHandle;
use crate::fiber_pool::{FiberPool, MIN_FIBER_STACK, STACK_GRANULE, stack_region_size};
use crate::metrics::{Metrics, StatsSnapshot};
use crate::tag::MAX_LANES;
use crate::tear::Tear;
use crate::tracing::{TraceCollector, TraceEvent};
use crossbeam::deque::{Injector, Stealer, Worker as Deque};
use crossbeam::queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

pub const DEFAULT_FIBER_COUNT: usize = 128;
pub const DEFAULT_FIBER_STACK: usize = 64 * 1024;
pub const DEFAULT_QUEUE_LOG2: u32 = 12;
pub const DEFAULT_FRAMES_IN_FLIGHT: u32 = 3;

const QUEUE_LOG2_RANGE: std::ops::RangeInclusive<u32> = 4..=24;
const FRAMES_IN_FLIGHT_RANGE: std::ops::RangeInclusive<u32> = 3..=16;

/// How long an idle worker sleeps before looking for work again.
const PARK_TIMEOUT: Duration = Duration::from_millis(1);

/// Startup hints. Every zero field falls back to its default.
///
/// Deserializes from partial JSON; missing fields are zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiftHints {
    /// Worker threads including the bootstrapping thread. Default: logical CPUs.
    pub thread_count: usize,
    /// Fibers created at bootstrap. Default: 128.
    ///
    /// Every fiber blocked in `unchain` holds one. A waiting fiber first runs
    /// the tears of its own chain that are still on top of its worker's deque,
    /// so fan-outs wider than this do not starve the pool.
    pub fiber_count: usize,
    /// Stack bytes per fiber. Default: 64 KiB.
    pub fiber_stack_size: usize,
    /// Ready ring capacity exponent. Default: 12.
    pub queue_log2_size: u32,
    /// Frames the pipeline keeps in flight. Default: 3.
    pub frames_in_flight: u32,
    /// Stop the frame pipeline after this many frames. Zero runs unbounded.
    pub debug_frame_limit: u64,
    pub pinning: PinningStrategy,
    /// Record a trace span for every tear.
    pub trace: bool,
}

/// Validated rift configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RiftConfig {
    pub thread_count: usize,
    pub fiber_count: usize,
    /// Always a multiple of 4 KiB.
    pub fiber_stack_size: usize,
    pub queue_log2_size: u32,
    pub frames_in_flight: u32,
    pub debug_frame_limit: Option<u64>,
    pub pinning: PinningStrategy,
    pub trace: bool,
}

impl RiftConfig {
    /// Resolves defaults and validates every field.
    pub fn from_hints(hints: &RiftHints) -> Result<Self> {
        let thread_count = match hints.thread_count {
            0 => num_cpus::get().clamp(1, MAX_LANES),
            n if n > MAX_LANES => {
                return Err(RivenError::invalid(format!(
                    "thread count {n} exceeds {MAX_LANES}"
                )));
            }
            n => n,
        };
        let fiber_count = match hints.fiber_count {
            0 => DEFAULT_FIBER_COUNT,
            n if n > u32::MAX as usize / 2 => {
                return Err(RivenError::invalid(format!("fiber count {n} is too large")));
            }
            n => n,
        };
        let fiber_stack_size = match hints.fiber_stack_size {
            0 => DEFAULT_FIBER_STACK,
            n if n < MIN_FIBER_STACK => {
                return Err(RivenError::invalid(format!(
                    "fiber stack of {n} bytes is below the {MIN_FIBER_STACK}-byte minimum"
                )));
            }
            n => n.checked_next_multiple_of(STACK_GRANULE).ok_or_else(|| {
                RivenError::invalid(format!("fiber stack of {n} bytes is too large"))
            })?,
        };
        let queue_log2_size = match hints.queue_log2_size {
            0 => DEFAULT_QUEUE_LOG2,
            n if !QUEUE_LOG2_RANGE.contains(&n) => {
                return Err(RivenError::invalid(format!(
                    "queue size exponent {n} outside {QUEUE_LOG2_RANGE:?}"
                )));
            }
            n => n,
        };
        if (1usize << queue_log2_size) < fiber_count {
            return Err(RivenError::invalid(format!(
                "ready queue of 2^{queue_log2_size} cannot hold {fiber_count} fibers"
            )));
        }
        let frames_in_flight = match hints.frames_in_flight {
            0 => DEFAULT_FRAMES_IN_FLIGHT,
            n if !FRAMES_IN_FLIGHT_RANGE.contains(&n) => {
                return Err(RivenError::invalid(format!(
                    "frames in flight {n} outside {FRAMES_IN_FLIGHT_RANGE:?}"
                )));
            }
            n => n,
        };
        if stack_region_size(fiber_count, fiber_stack_size).is_none() {
            return Err(RivenError::invalid(format!(
                "{fiber_count} stacks of {fiber_stack_size} bytes overflow the address space"
            )));
        }

        Ok(RiftConfig {
            thread_count,
            fiber_count,
            fiber_stack_size,
            queue_log2_size,
            frames_in_flight,
            debug_frame_limit: (hints.debug_frame_limit > 0).then_some(hints.debug_frame_limit),
            pinning: hints.pinning,
            trace: hints.trace,
        })
    }

    pub fn ready_capacity(&self) -> usize {
        1 << self.queue_log2_size
    }
}

/// The bootstrap buffer backing every fiber stack.
pub struct RiftMemory {
    ptr: NonNull<u8>,
    len: usize,
    owned: bool,
}

// The buffer is plain bytes; the rift hands out disjoint stacks from it.
unsafe impl Send for RiftMemory {}

impl RiftMemory {
    /// Allocates a zeroed buffer of exactly the size `config` requires.
    pub fn allocate(config: &RiftConfig) -> Self {
        Self::from_box(vec![0u8; Rift::query_memory(config)].into_boxed_slice())
    }

    pub fn from_box(buffer: Box<[u8]>) -> Self {
        let len = buffer.len();
        let raw = Box::into_raw(buffer) as *mut u8;
        RiftMemory {
            // SAFETY: Box never hands out null, even for empty slices.
            ptr: unsafe { NonNull::new_unchecked(raw) },
            len,
            owned: true,
        }
    }

    /// Borrows a caller-owned buffer.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes, must not be
    /// accessed by anyone else, and must outlive this value.
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, len: usize) -> Self {
        RiftMemory {
            ptr,
            len,
            owned: false,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Returns the buffer if it was allocated by Rust.
    pub fn into_boxed_slice(self) -> Option<Box<[u8]>> {
        let this = std::mem::ManuallyDrop::new(self);
        this.owned.then(|| {
            // SAFETY: owned buffers come from `Box::into_raw` in `from_box`.
            unsafe {
                Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                    this.ptr.as_ptr(),
                    this.len,
                ))
            }
        })
    }
}

impl Drop for RiftMemory {
    fn drop(&mut self) {
        if self.owned {
            // SAFETY: see `into_boxed_slice`.
            drop(unsafe {
                Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                    self.ptr.as_ptr(),
                    self.len,
                ))
            });
        }
    }
}

impl std::fmt::Debug for RiftMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiftMemory")
            .field("len", &self.len)
            .field("owned", &self.owned)
            .finish()
    }
}

/// What [`Rift::bootstrap`] hands back once every worker has joined.
#[derive(Debug)]
pub struct RiftExit {
    /// The bootstrap buffer, now safe to free or reuse.
    pub memory: RiftMemory,
    pub stats: StatsSnapshot,
    /// Tear spans, when tracing was enabled.
    pub trace: Vec<TraceEvent>,
}

/// Idle-worker parking.
///
/// Producers only touch the lock when someone is asleep.
pub(crate) struct Sleep {
    lock: Mutex<()>,
    cvar: Condvar,
    sleepers: AtomicUsize,
}

impl Sleep {
    fn new() -> Self {
        Sleep {
            lock: Mutex::new(()),
            cvar: Condvar::new(),
            sleepers: AtomicUsize::new(0),
        }
    }

    pub(crate) fn notify(&self, count: usize) {
        std::sync::atomic::fence(Ordering::SeqCst);
        if self.sleepers.load(Ordering::SeqCst) == 0 {
            return;
        }
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        if count == 1 {
            self.cvar.notify_one();
        } else {
            self.cvar.notify_all();
        }
    }

    /// Sleeps until notified or the park timeout passes, unless `has_work`
    /// already reports something to do.
    pub(crate) fn park(&self, has_work: impl Fn() -> bool) {
        self.sleepers.fetch_add(1, Ordering::SeqCst);
        let guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        if !has_work() {
            let _ = self
                .cvar
                .wait_timeout(guard, PARK_TIMEOUT)
                .unwrap_or_else(PoisonError::into_inner);
        }
        self.sleepers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// State shared by every worker and fiber of one rift.
pub(crate) struct Shared {
    pub(crate) config: RiftConfig,
    pub(crate) pool: FiberPool,
    /// Fibers whose chain completed, waiting for a worker.
    pub(crate) ready: ArrayQueue<FiberHandle>,
    pub(crate) injector: Injector<Tear>,
    pub(crate) stealers: Vec<Stealer<Tear>>,
    pub(crate) sleep: Sleep,
    pub(crate) shutdown: AtomicBool,
    pub(crate) stats: Metrics,
    pub(crate) heap: Option<Arc<TaggedHeap>>,
    pub(crate) trace: TraceCollector,
}

impl Shared {
    /// Queues a fiber whose chain completed.
    pub(crate) fn make_ready(&self, handle: FiberHandle) {
        if self.ready.push(handle).is_err() {
            // Capacity is validated against the fiber count, so this means
            // a fiber was queued twice.
            log::error!("ready ring overflow while queueing fiber {}", handle.index());
            std::process::abort();
        }
        self.sleep.notify(1);
    }

    pub(crate) fn notify_work(&self, count: usize) {
        self.sleep.notify(count);
    }

    pub(crate) fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.sleep.notify(usize::MAX);
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Whether a worker that found nothing should look again instead of sleeping.
    pub(crate) fn has_work(&self) -> bool {
        if self.is_shutting_down() || !self.ready.is_empty() {
            return true;
        }
        self.pool.idle_count() > 0
            && (!self.injector.is_empty() || self.stealers.iter().any(|s| !s.is_empty()))
    }
}

/// Entry point of the scheduler.
pub struct Rift;

impl Rift {
    /// Bytes of bootstrap buffer `config` needs.
    pub fn query_memory(config: &RiftConfig) -> usize {
        stack_region_size(config.fiber_count, config.fiber_stack_size).unwrap_or(0)
    }

    /// Runs `entry` on a fiber with no tagged heap attached.
    pub fn bootstrap<F>(config: &RiftConfig, memory: RiftMemory, entry: F) -> Result<RiftExit>
    where
        F: FnOnce(&Context<'_>) + Send + 'static,
    {
        Self::bootstrap_with(config, memory, None, entry)
    }

    /// Allocates the bootstrap buffer itself, then bootstraps.
    pub fn run<F>(config: &RiftConfig, entry: F) -> Result<RiftExit>
    where
        F: FnOnce(&Context<'_>) + Send + 'static,
    {
        Self::bootstrap(config, RiftMemory::allocate(config), entry)
    }

    /// Bootstraps the rift and blocks until `entry` has returned and every
    /// worker has joined.
    ///
    /// The calling thread becomes worker 0. When the entry tear returns the
    /// rift shuts down: workers finish the fiber they are running and take no
    /// further work. Tears still queued at that point are dropped without
    /// running, and fibers still suspended are abandoned.
    pub fn bootstrap_with<F>(
        config: &RiftConfig,
        mut memory: RiftMemory,
        heap: Option<Arc<TaggedHeap>>,
        entry: F,
    ) -> Result<RiftExit>
    where
        F: FnOnce(&Context<'_>) + Send + 'static,
    {
        let required = Self::query_memory(config);
        if required == 0 || memory.len() < required {
            return Err(RivenError::InsufficientMemory {
                required,
                supplied: memory.len(),
            });
        }
        if let Some(heap) = &heap {
            if heap.thread_count() < config.thread_count {
                return Err(RivenError::invalid(format!(
                    "tagged heap has {} lanes but the rift runs {} threads",
                    heap.thread_count(),
                    config.thread_count
                )));
            }
        }

        // SAFETY: the buffer is exclusively ours until `shared` is dropped below.
        let pool = unsafe {
            FiberPool::new(
                memory.as_mut_ptr(),
                memory.len(),
                config.fiber_count,
                config.fiber_stack_size,
            )?
        };

        let deques: Vec<Deque<Tear>> = (0..config.thread_count).map(|_| Deque::new_lifo()).collect();
        let shared = Shared {
            config: config.clone(),
            pool,
            ready: ArrayQueue::new(config.ready_capacity()),
            injector: Injector::new(),
            stealers: deques.iter().map(Deque::stealer).collect(),
            sleep: Sleep::new(),
            shutdown: AtomicBool::new(false),
            stats: Metrics::new(),
            heap,
            trace: TraceCollector::new(),
        };

        shared.injector.push(Tear::new("rift_entry", move |ctx| {
            entry(ctx);
            ctx.shared.begin_shutdown();
        }));
        shared.stats.injector_pushes.fetch_add(1, Ordering::Relaxed);

        log::info!(
            "rift bootstrapped: {} threads, {} fibers of {} KiB, {} bytes of stack memory",
            config.thread_count,
            config.fiber_count,
            config.fiber_stack_size / 1024,
            memory.len()
        );

        let outcome = crate::worker::run_workers(&shared, deques);

        let stats = shared.stats.snapshot();
        let Shared { pool, trace, .. } = shared;
        drop(pool);
        outcome?;

        log::info!(
            "rift shut down after {} tears in {:.3}s",
            stats.tears_executed,
            stats.elapsed_seconds
        );
        Ok(RiftExit {
            memory,
            stats,
            trace: trace.into_events(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hints(threads: usize) -> RiftHints {
        RiftHints {
            thread_count: threads,
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_resolve() {
        let config = RiftConfig::from_hints(&RiftHints::default()).unwrap();
        assert!(config.thread_count >= 1);
        assert_eq!(config.fiber_count, DEFAULT_FIBER_COUNT);
        assert_eq!(config.fiber_stack_size, DEFAULT_FIBER_STACK);
        assert_eq!(config.queue_log2_size, DEFAULT_QUEUE_LOG2);
        assert_eq!(config.frames_in_flight, DEFAULT_FRAMES_IN_FLIGHT);
        assert_eq!(config.debug_frame_limit, None);
    }

    #[test]
    fn test_stack_rounds_up_to_granule() {
        let config = RiftConfig::from_hints(&RiftHints {
            fiber_stack_size: 20_000,
            ..hints(1)
        })
        .unwrap();
        assert_eq!(config.fiber_stack_size, 20_480);
    }

    #[test]
    fn test_invalid_hints_are_rejected() {
        for bad in [
            RiftHints {
                thread_count: 256,
                ..Default::default()
            },
            RiftHints {
                fiber_stack_size: 1024,
                ..hints(1)
            },
            RiftHints {
                queue_log2_size: 30,
                ..hints(1)
            },
            RiftHints {
                fiber_count: 64,
                queue_log2_size: 5,
                ..hints(1)
            },
            RiftHints {
                frames_in_flight: 2,
                ..hints(1)
            },
        ] {
            assert!(
                matches!(RiftConfig::from_hints(&bad), Err(RivenError::InvalidArgument(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_hints_from_partial_json() {
        let hints: RiftHints =
            serde_json::from_str(r#"{ "thread_count": 2, "pinning": "Linear" }"#).unwrap();
        assert_eq!(hints.thread_count, 2);
        assert_eq!(hints.fiber_count, 0);
        assert_eq!(hints.pinning, PinningStrategy::Linear);
    }

    #[test]
    fn test_query_memory_covers_all_stacks() {
        let config = RiftConfig::from_hints(&hints(4)).unwrap();
        let required = Rift::query_memory(&config);
        assert!(required >= config.fiber_count * config.fiber_stack_size);
    }

    #[test]
    fn test_short_buffer_fails_fast() {
        let config = RiftConfig::from_hints(&hints(2)).unwrap();
        let memory = RiftMemory::from_box(vec![0u8; 4096].into_boxed_slice());
        let result = Rift::bootstrap(&config, memory, |_| {});
        assert!(matches!(
            result,
            Err(RivenError::InsufficientMemory { supplied: 4096, .. })
        ));
    }

    #[test]
    fn test_memory_round_trips_through_bootstrap() {
        let config = RiftConfig::from_hints(&RiftHints {
            fiber_count: 8,
            fiber_stack_size: 32 * 1024,
            ..hints(2)
        })
        .unwrap();
        let exit = Rift::run(&config, |_| {}).unwrap();
        assert_eq!(exit.memory.len(), Rift::query_memory(&config));
        assert_eq!(exit.stats.tears_executed, 1);
        assert!(exit.memory.into_boxed_slice().is_some());
    }
}
