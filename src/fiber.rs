//! Fiber management and execution context.
//!
//! A fiber is a stack-ful coroutine that runs one tear at a time. Fibers use a
//! trampoline: the coroutine loops forever, yielding `Complete` after every
//! tear, so a fiber is created once at bootstrap and recycled for the life of
//! the rift.

use crate::chain::ChainInner;
use crate::rift::Shared;
use crate::tear::Tear;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::sync::Arc;

/// Index of a fiber in the rift's fixed fiber arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FiberHandle(pub(crate) u32);

impl FiberHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Lifecycle of a fiber slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// On the free list, ready for a new tear.
    Idle = 0,
    /// Owned by a worker and executing.
    Running = 1,
    /// Switched out inside `unchain`, parked on a chain's waiter list.
    Waiting = 2,
    /// Tear returned; about to go back to the free list.
    Finished = 3,
}

impl FiberState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => FiberState::Running,
            2 => FiberState::Waiting,
            3 => FiberState::Finished,
            _ => FiberState::Idle,
        }
    }
}

#[derive(Clone, Copy)]
pub(crate) struct SharedPtr(pub(crate) *const Shared);

unsafe impl Send for SharedPtr {}
unsafe impl Sync for SharedPtr {}

pub(crate) enum FiberInput {
    Start {
        tear: Tear,
        shared: SharedPtr,
        handle: FiberHandle,
    },
    Resume,
}

pub(crate) enum FiberYield {
    /// The tear returned; the fiber can be recycled.
    Complete,
    /// The tear is waiting on a chain. The worker registers the fiber as a
    /// waiter only after the switch, so nobody can resume it while it still
    /// runs.
    Unchain(Arc<ChainInner>),
}

pub(crate) type FiberYielder = Yielder<FiberInput, FiberYield>;

#[cfg(not(windows))]
pub(crate) use slab::SlabStack as FiberStack;
#[cfg(windows)]
pub(crate) use corosensei::stack::DefaultStack as FiberStack;

#[cfg(not(windows))]
mod slab {
    use corosensei::stack::{Stack, StackPointer};

    /// A fiber stack carved out of the bootstrap buffer.
    ///
    /// On unix the page below `limit` is a guard page, so running off the end
    /// faults. A canary word at the low end is also checked every time the
    /// fiber switches out.
    pub(crate) struct SlabStack {
        base: StackPointer,
        limit: StackPointer,
    }

    impl SlabStack {
        /// # Safety
        ///
        /// `[limit, base)` must be writable, exclusively owned by this stack,
        /// outlive it, and `base` must be 16-byte aligned.
        pub(crate) unsafe fn new(limit: StackPointer, base: StackPointer) -> Self {
            SlabStack { base, limit }
        }

        pub(crate) fn limit_ptr(&self) -> *mut u64 {
            self.limit.get() as *mut u64
        }
    }

    unsafe impl Stack for SlabStack {
        fn base(&self) -> StackPointer {
            self.base
        }

        fn limit(&self) -> StackPointer {
            self.limit
        }
    }
}

const STACK_CANARY: u64 = 0x5249_5645_4E5F_5354;

/// A stack-ful execution context.
pub(crate) struct Fiber {
    coroutine: Option<Coroutine<FiberInput, FiberYield, (), FiberStack>>,
    canary: *mut u64,
}

impl Fiber {
    /// Wraps `stack` in the trampoline coroutine.
    pub(crate) fn new(stack: FiberStack) -> Self {
        #[cfg(not(windows))]
        let canary = {
            let canary = stack.limit_ptr();
            // SAFETY: the low word of the region belongs to this stack.
            unsafe { canary.write_volatile(STACK_CANARY) };
            canary
        };
        #[cfg(windows)]
        let canary = std::ptr::null_mut();

        let coroutine = Coroutine::with_stack(
            stack,
            |yielder: &FiberYielder, mut input: FiberInput| loop {
                if let FiberInput::Start {
                    tear,
                    shared,
                    handle,
                } = input
                {
                    // SAFETY: the shared rift state owns every fiber and
                    // outlives all of them.
                    let shared = unsafe { &*shared.0 };
                    shared.pool.slot(handle).set_yielder(yielder);
                    tear.run(shared, handle);
                }
                input = yielder.suspend(FiberYield::Complete);
            },
        );

        Fiber {
            coroutine: Some(coroutine),
            canary,
        }
    }

    /// Switches into the fiber until it completes its tear or waits on a chain.
    pub(crate) fn resume(&mut self, input: FiberInput) -> FiberYield {
        let Some(coroutine) = self.coroutine.as_mut() else {
            return FiberYield::Complete;
        };
        match coroutine.resume(input) {
            CoroutineResult::Yield(reason) => reason,
            CoroutineResult::Return(()) => FiberYield::Complete,
        }
    }

    /// False once something has scribbled over the bottom of the stack.
    pub(crate) fn stack_intact(&self) -> bool {
        if self.canary.is_null() {
            return true;
        }
        // SAFETY: the canary word lives as long as the stack region.
        unsafe { self.canary.read_volatile() == STACK_CANARY }
    }

    /// Leaks the coroutine instead of unwinding it. Used for fibers that are
    /// still suspended inside a tear when the rift shuts down.
    pub(crate) fn abandon(&mut self) {
        if let Some(coroutine) = self.coroutine.take() {
            std::mem::forget(coroutine);
        }
    }
}

unsafe impl Send for Fiber {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in [
            FiberState::Idle,
            FiberState::Running,
            FiberState::Waiting,
            FiberState::Finished,
        ] {
            assert_eq!(FiberState::from_u8(state as u8), state);
        }
    }
}
