use crate::error::{Result, RivenError};
use crate::fiber::{Fiber, FiberHandle, FiberStack, FiberState, FiberYielder};
use crate::tear::Tear;
use crossbeam::deque::Worker as Deque;
use crossbeam::queue::ArrayQueue;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicU32, AtomicUsize, Ordering};
#[cfg(unix)]
use std::sync::OnceLock;

/// Granularity of fiber stacks where the page size is unknown.
pub const STACK_GRANULE: usize = 4096;

/// Smallest stack a fiber may be configured with.
pub const MIN_FIBER_STACK: usize = 16 * 1024;

/// Size of the pages that stacks are aligned to and guarded with.
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        static PAGE: OnceLock<usize> = OnceLock::new();
        *PAGE.get_or_init(|| {
            // SAFETY: sysconf has no preconditions.
            let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            usize::try_from(size)
                .ok()
                .filter(|size| size.is_power_of_two())
                .unwrap_or(STACK_GRANULE)
        })
    }
    #[cfg(not(unix))]
    {
        STACK_GRANULE
    }
}

/// Bytes of bootstrap buffer needed for `fiber_count` stacks of `stack_size`.
///
/// Every stack is rounded up to whole pages and preceded by one guard page.
/// One extra page lets the first stack start page-aligned whatever the
/// alignment of the buffer.
pub fn stack_region_size(fiber_count: usize, stack_size: usize) -> Option<usize> {
    let page = page_size();
    let stride = stack_size.checked_next_multiple_of(page)?.checked_add(page)?;
    stride.checked_mul(fiber_count)?.checked_add(page)
}

/// A fiber and the bookkeeping other threads read while it runs or waits.
pub(crate) struct FiberSlot {
    fiber: UnsafeCell<Fiber>,
    yielder: AtomicPtr<FiberYielder>,
    worker: AtomicUsize,
    local_queue: AtomicPtr<Deque<Tear>>,
    /// Link in a chain's intrusive waiter list: `handle + 1`, zero ends it.
    pub(crate) wait_next: AtomicU32,
    state: AtomicU8,
}

// The fiber itself is only touched by the worker that popped its handle from
// the free list or the ready ring; everything else is atomic.
unsafe impl Send for FiberSlot {}
unsafe impl Sync for FiberSlot {}

impl FiberSlot {
    pub(crate) fn set_yielder(&self, yielder: &FiberYielder) {
        self.yielder
            .store(yielder as *const FiberYielder as *mut FiberYielder, Ordering::Release);
    }

    pub(crate) fn yielder(&self) -> *const FiberYielder {
        self.yielder.load(Ordering::Acquire)
    }

    pub(crate) fn worker(&self) -> usize {
        self.worker.load(Ordering::Relaxed)
    }

    pub(crate) fn local_queue(&self) -> *const Deque<Tear> {
        self.local_queue.load(Ordering::Relaxed)
    }

    /// Records which worker is about to run the fiber.
    pub(crate) fn bind(&self, worker: usize, queue: *const Deque<Tear>) {
        self.worker.store(worker, Ordering::Relaxed);
        self.local_queue.store(queue as *mut _, Ordering::Relaxed);
        self.set_state(FiberState::Running);
    }

    pub(crate) fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// # Safety
    ///
    /// The caller must own the handle (popped from the free list or the ready
    /// ring) and must not hold another reference to this fiber.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn fiber_mut(&self) -> &mut Fiber {
        unsafe { &mut *self.fiber.get() }
    }
}

/// Fixed set of fibers created at bootstrap.
///
/// No fiber is created after startup. Free fibers sit in a bounded lock-free
/// queue; a tear waits in the dispatch queues while every fiber is busy.
pub(crate) struct FiberPool {
    slots: Box<[FiberSlot]>,
    free: ArrayQueue<FiberHandle>,
    // Dropped last: stacks become plain memory again only once every fiber is gone.
    #[cfg(unix)]
    _guards: GuardPages,
}

impl FiberPool {
    /// Builds `fiber_count` fibers whose stacks are carved from `region`.
    ///
    /// # Safety
    ///
    /// `region` must point to `len` writable bytes that outlive the pool and
    /// are not touched by anything else while it exists.
    pub(crate) unsafe fn new(
        region: *mut u8,
        len: usize,
        fiber_count: usize,
        stack_size: usize,
    ) -> Result<Self> {
        let required = stack_region_size(fiber_count, stack_size).ok_or_else(|| {
            RivenError::invalid(format!("{fiber_count} fibers of {stack_size} bytes overflow"))
        })?;
        if len < required {
            return Err(RivenError::InsufficientMemory {
                required,
                supplied: len,
            });
        }
        if fiber_count == 0 || fiber_count > u32::MAX as usize {
            return Err(RivenError::invalid(format!(
                "fiber count {fiber_count} out of range"
            )));
        }

        let page = page_size();
        let stride = stack_size.next_multiple_of(page) + page;
        let offset = (page - (region as usize % page)) % page;
        let free = ArrayQueue::new(fiber_count);
        let mut slots = Vec::with_capacity(fiber_count);
        #[cfg(unix)]
        let mut guards = GuardPages::new(page, fiber_count);

        for index in 0..fiber_count {
            // SAFETY: offset + (index + 1) * stride <= required <= len.
            let low = unsafe { region.add(offset + index * stride) };
            #[cfg(unix)]
            // SAFETY: the low page of each stride belongs to no stack.
            unsafe {
                guards.protect(low)?
            };
            // SAFETY: strides are disjoint and page-aligned.
            let stack = unsafe { make_stack(low.add(page), stride - page)? };
            slots.push(FiberSlot {
                fiber: UnsafeCell::new(Fiber::new(stack)),
                yielder: AtomicPtr::new(std::ptr::null_mut()),
                worker: AtomicUsize::new(0),
                local_queue: AtomicPtr::new(std::ptr::null_mut()),
                wait_next: AtomicU32::new(0),
                state: AtomicU8::new(FiberState::Idle as u8),
            });
            let _ = free.push(FiberHandle(index as u32));
        }

        log::debug!("fiber pool: {fiber_count} stacks of {} bytes behind guard pages", stride - page);
        Ok(FiberPool {
            slots: slots.into_boxed_slice(),
            free,
            #[cfg(unix)]
            _guards: guards,
        })
    }

    pub(crate) fn slot(&self, handle: FiberHandle) -> &FiberSlot {
        &self.slots[handle.index()]
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.free.len()
    }

    pub(crate) fn acquire(&self) -> Option<FiberHandle> {
        self.free.pop()
    }

    pub(crate) fn release(&self, handle: FiberHandle) {
        self.slot(handle).set_state(FiberState::Idle);
        // Capacity equals the number of fibers, so this never overflows.
        let _ = self.free.push(handle);
    }
}

impl Drop for FiberPool {
    fn drop(&mut self) {
        let mut abandoned = 0;
        for slot in self.slots.iter() {
            if slot.state() != FiberState::Idle {
                // SAFETY: every worker has joined; nothing else references the fiber.
                unsafe { slot.fiber_mut().abandon() };
                abandoned += 1;
            }
        }
        if abandoned > 0 {
            log::warn!("{abandoned} fiber(s) were still suspended at shutdown");
        }
    }
}

/// Inaccessible pages below each fiber stack, made accessible again on drop.
///
/// A fiber running past its stack faults on its guard page instead of
/// writing into the next stack.
#[cfg(unix)]
struct GuardPages {
    page: usize,
    addresses: Vec<usize>,
}

#[cfg(unix)]
impl GuardPages {
    fn new(page: usize, capacity: usize) -> Self {
        GuardPages {
            page,
            addresses: Vec::with_capacity(capacity),
        }
    }

    /// # Safety
    ///
    /// `low` must be page-aligned and start a page nothing else uses until
    /// this set is dropped.
    unsafe fn protect(&mut self, low: *mut u8) -> Result<()> {
        // SAFETY: upheld by the caller.
        if unsafe { libc::mprotect(low.cast(), self.page, libc::PROT_NONE) } != 0 {
            return Err(RivenError::FeatureUnsupported(format!(
                "cannot protect fiber stack guard page: {}",
                std::io::Error::last_os_error()
            )));
        }
        self.addresses.push(low as usize);
        Ok(())
    }
}

#[cfg(unix)]
impl Drop for GuardPages {
    fn drop(&mut self) {
        for &address in &self.addresses {
            let page = address as *mut libc::c_void;
            // SAFETY: the page was protected by `protect` and is still mapped.
            if unsafe { libc::mprotect(page, self.page, libc::PROT_READ | libc::PROT_WRITE) } != 0 {
                log::error!(
                    "failed to unprotect fiber guard page at {address:#x}: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }
}

#[cfg(not(windows))]
unsafe fn make_stack(low: *mut u8, stride: usize) -> Result<FiberStack> {
    use std::num::NonZeroUsize;
    let limit = NonZeroUsize::new(low as usize);
    let base = NonZeroUsize::new(low as usize + stride);
    match (limit, base) {
        // SAFETY: the caller hands out disjoint, page-aligned regions.
        (Some(limit), Some(base)) => Ok(unsafe { FiberStack::new(limit, base) }),
        _ => Err(RivenError::invalid("null fiber stack region")),
    }
}

#[cfg(windows)]
unsafe fn make_stack(_low: *mut u8, stride: usize) -> Result<FiberStack> {
    FiberStack::new(stride).map_err(|_| RivenError::OutOfMemory {
        what: "fiber stack",
        requested: stride,
    })
}
