//! Context handed to every tear for access to the rift from inside a fiber.
//!
//! `split` pushes onto the deque of the worker currently running the fiber.
//! `unchain` is the only place a fiber ever suspends. It first runs inline any
//! tears of the awaited chain still on top of the worker's deque, spins
//! briefly, then switches back to the worker, which parks the fiber on the
//! chain.

use crate::allocator::TaggedHeap;
use crate::chain::{Chain, ChainInner, ExiledChain};
use crate::error::{Result, RivenError};
use crate::fiber::{FiberHandle, FiberInput, FiberYield, SharedPtr};
use crate::rift::Shared;
use crate::tag::MemoryTag;
use crate::tear::Tear;
use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Spin iterations before a waiting fiber is switched out.
const SPIN_LIMIT: usize = 1000;

thread_local! {
    static CURRENT: Cell<Option<(SharedPtr, FiberHandle)>> = const { Cell::new(None) };
}

pub(crate) fn set_current(current: Option<(SharedPtr, FiberHandle)>) {
    CURRENT.with(|cell| cell.set(current));
}

// Never inlined: a fiber can migrate between threads across `unchain`, so the
// thread-local address must be recomputed on every call.
#[inline(never)]
fn current() -> Option<(SharedPtr, FiberHandle)> {
    CURRENT.with(|cell| cell.get())
}

/// Access to the rift for the tear running on one fiber.
///
/// A context is bound to its fiber and cannot be sent to another thread.
pub struct Context<'a> {
    pub(crate) shared: &'a Shared,
    fiber: FiberHandle,
    _not_send: PhantomData<*const ()>,
}

impl<'a> Context<'a> {
    pub(crate) fn new(shared: &'a Shared, fiber: FiberHandle) -> Self {
        Context {
            shared,
            fiber,
            _not_send: PhantomData,
        }
    }

    /// Runs `f` with the context of the fiber executing on this thread.
    ///
    /// Returns `None` outside of a fiber. This is how code that was not handed
    /// a context, such as the C API, reaches the rift.
    pub fn with_current<R>(f: impl FnOnce(&Context<'_>) -> R) -> Option<R> {
        let (shared, fiber) = current()?;
        // SAFETY: the pointer is installed by the worker for exactly as long
        // as the fiber runs, and the shared state outlives every fiber.
        let shared = unsafe { &*shared.0 };
        Some(f(&Context::new(shared, fiber)))
    }

    /// Enqueues every tear and returns a chain that completes once all have run.
    ///
    /// All tears are checked before any is enqueued: a tear without a
    /// procedure rejects the whole split with `InvalidArgument`. An empty
    /// split returns a chain that is already complete.
    pub fn split<I>(&self, tears: I) -> Result<Chain>
    where
        I: IntoIterator<Item = Tear>,
    {
        let mut tears: Vec<Tear> = tears.into_iter().collect();
        if let Some(bad) = tears.iter().find(|tear| !tear.has_procedure()) {
            return Err(RivenError::invalid(format!(
                "tear '{}' has no procedure",
                bad.name()
            )));
        }

        let inner = ChainInner::new(tears.len());
        if tears.is_empty() {
            return Ok(Chain::new(inner));
        }

        let count = tears.len();
        let queue = self.shared.pool.slot(self.fiber).local_queue();
        for mut tear in tears.drain(..) {
            tear.completion = Some(Arc::clone(&inner));
            if queue.is_null() {
                self.shared.injector.push(tear);
            } else {
                // SAFETY: the queue belongs to the worker running this fiber,
                // which is the calling thread, and lives until that worker exits.
                unsafe { (*queue).push(tear) };
            }
        }
        let pushes = if queue.is_null() {
            &self.shared.stats.injector_pushes
        } else {
            &self.shared.stats.local_pushes
        };
        pushes.fetch_add(count as u64, Ordering::Relaxed);
        self.shared.notify_work(count);

        Ok(Chain::new(inner))
    }

    /// Suspends this fiber until `chain` completes.
    ///
    /// The worker thread keeps running other fibers meanwhile. The fiber may
    /// come back on a different worker.
    pub fn unchain(&self, chain: Chain) {
        self.wait(&chain.inner);
    }

    /// `split` followed by `unchain` on the result.
    pub fn split_and_unchain<I>(&self, tears: I) -> Result<()>
    where
        I: IntoIterator<Item = Tear>,
    {
        let chain = self.split(tears)?;
        self.unchain(chain);
        Ok(())
    }

    /// Cooperatively waits on a chain created by another fiber.
    pub fn unchain_exiled(&self, chain: &ExiledChain) {
        self.wait(&chain.inner);
    }

    fn wait(&self, inner: &Arc<ChainInner>) {
        self.help(inner);
        let mut spins = 0;
        while !inner.is_complete() {
            if spins == SPIN_LIMIT {
                self.suspend(inner);
                debug_assert!(inner.is_complete());
                return;
            }
            std::hint::spin_loop();
            spins += 1;
        }
    }

    /// Runs tears of `inner` popped from this worker's deque on this fiber.
    ///
    /// Stops at the first tear that belongs to another chain, which goes back
    /// on the deque. Whatever is left of `inner` afterwards was stolen, or
    /// sits on a deque this fiber moved away from during a nested unchain.
    fn help(&self, inner: &Arc<ChainInner>) {
        while !inner.is_complete() {
            // Re-read each round: a nested unchain may move the fiber.
            let queue = self.shared.pool.slot(self.fiber).local_queue();
            if queue.is_null() {
                return;
            }
            // SAFETY: the queue belongs to the worker running this fiber,
            // which is the calling thread.
            let Some(tear) = (unsafe { (*queue).pop() }) else {
                return;
            };
            if !tear.belongs_to(inner) {
                // SAFETY: as above.
                unsafe { (*queue).push(tear) };
                return;
            }
            self.shared.stats.tears_inlined.fetch_add(1, Ordering::Relaxed);
            tear.run(self.shared, self.fiber);
        }
    }

    fn suspend(&self, inner: &Arc<ChainInner>) {
        let yielder = self.shared.pool.slot(self.fiber).yielder();
        debug_assert!(!yielder.is_null(), "unchain outside of a started fiber");
        // SAFETY: the yielder was installed when this fiber started its tear
        // and stays valid while the coroutine lives. We are on that fiber.
        let input = unsafe { (*yielder).suspend(FiberYield::Unchain(Arc::clone(inner))) };
        debug_assert!(matches!(input, FiberInput::Resume));
    }

    /// Index of the worker currently running this fiber.
    ///
    /// Can change across `unchain`.
    pub fn worker_index(&self) -> usize {
        self.shared.pool.slot(self.fiber).worker()
    }

    pub fn thread_count(&self) -> usize {
        self.shared.config.thread_count
    }

    pub fn fiber(&self) -> FiberHandle {
        self.fiber
    }

    /// The tagged heap attached at bootstrap, if any.
    pub fn heap(&self) -> Option<&TaggedHeap> {
        self.shared.heap.as_deref()
    }

    fn require_heap(&self) -> Result<&TaggedHeap> {
        self.heap()
            .ok_or_else(|| RivenError::FeatureUnsupported("no tagged heap attached".into()))
    }

    /// Allocates under this worker's private lane of `tag`.
    pub fn alloc(&self, size: usize, align: usize, tag: MemoryTag) -> Result<NonNull<u8>> {
        self.require_heap()?
            .alloc_local(self.worker_index(), size, align, tag)
    }

    /// Allocates under exactly `tag`, visible to every worker.
    pub fn alloc_shared(&self, size: usize, align: usize, tag: MemoryTag) -> Result<NonNull<u8>> {
        self.require_heap()?.alloc(size, align, tag)
    }

    /// Releases `tag` and all of its worker lanes.
    pub fn free(&self, tag: MemoryTag) -> Result<()> {
        self.require_heap()?.free(tag);
        Ok(())
    }
}
