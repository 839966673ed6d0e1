//! Chains: join handles for the tears produced by one `split`.
//!
//! A chain counts outstanding tears. The tear that brings the count to zero
//! closes the waiter list and hands every parked fiber back to the ready ring.
//! Threads outside the rift can block on an exiled chain through a condition
//! variable that is only touched while such a thread is actually waiting.

use crate::fiber::FiberHandle;
use crate::rift::Shared;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

const WAITERS_EMPTY: u32 = 0;
const WAITERS_CLOSED: u32 = u32::MAX;

pub(crate) struct ChainInner {
    pending: AtomicUsize,
    /// Intrusive list of parked fibers: `handle + 1`, or one of the sentinels.
    waiters: AtomicU32,
    blocked_threads: AtomicUsize,
    lock: Mutex<()>,
    cvar: Condvar,
}

impl ChainInner {
    pub(crate) fn new(pending: usize) -> Arc<Self> {
        Arc::new(ChainInner {
            pending: AtomicUsize::new(pending),
            waiters: AtomicU32::new(if pending == 0 {
                WAITERS_CLOSED
            } else {
                WAITERS_EMPTY
            }),
            blocked_threads: AtomicUsize::new(0),
            lock: Mutex::new(()),
            cvar: Condvar::new(),
        })
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.pending.load(Ordering::Acquire) == 0
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Called once by every tear of the chain after its procedure returned.
    pub(crate) fn finish_one(&self, shared: &Shared) {
        let previous = self.pending.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "chain finished more tears than it holds");
        if previous == 1 {
            self.close(shared);
        }
    }

    fn close(&self, shared: &Shared) {
        let mut head = self.waiters.swap(WAITERS_CLOSED, Ordering::AcqRel);
        while head != WAITERS_EMPTY && head != WAITERS_CLOSED {
            let handle = FiberHandle(head - 1);
            // Read the link before the fiber becomes runnable and can park again.
            head = shared.pool.slot(handle).wait_next.load(Ordering::Acquire);
            shared.make_ready(handle);
        }
        if self.blocked_threads.load(Ordering::SeqCst) > 0 {
            let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.cvar.notify_all();
        }
    }

    /// Parks `handle` on the waiter list.
    ///
    /// Returns false if the chain already completed; the caller must make the
    /// fiber ready itself.
    pub(crate) fn add_waiter(&self, shared: &Shared, handle: FiberHandle) -> bool {
        let link = &shared.pool.slot(handle).wait_next;
        let mut head = self.waiters.load(Ordering::Acquire);
        loop {
            if head == WAITERS_CLOSED {
                return false;
            }
            link.store(head, Ordering::Release);
            match self.waiters.compare_exchange_weak(
                head,
                handle.0 + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => head = actual,
            }
        }
    }

    /// Blocks the calling OS thread until the chain completes.
    pub(crate) fn block_thread(&self) {
        if self.is_complete() {
            return;
        }
        self.blocked_threads.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        while self.pending.load(Ordering::SeqCst) != 0 {
            guard = self
                .cvar
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(guard);
        self.blocked_threads.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Join handle for the tears of one `split`, owned by the fiber that split.
///
/// A chain cannot leave its fiber; call [`exile`](Chain::exile) to hand it to
/// another fiber or to a plain OS thread.
pub struct Chain {
    pub(crate) inner: Arc<ChainInner>,
    _not_send: PhantomData<*const ()>,
}

impl Chain {
    pub(crate) fn new(inner: Arc<ChainInner>) -> Self {
        Chain {
            inner,
            _not_send: PhantomData,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.inner.is_complete()
    }

    /// Tears not yet finished.
    pub fn pending(&self) -> usize {
        self.inner.pending()
    }

    /// Detaches the chain from its creating fiber.
    pub fn exile(self) -> ExiledChain {
        ExiledChain { inner: self.inner }
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("pending", &self.pending())
            .finish()
    }
}

/// A chain any fiber or thread may wait on.
#[derive(Clone)]
pub struct ExiledChain {
    pub(crate) inner: Arc<ChainInner>,
}

impl ExiledChain {
    pub fn is_complete(&self) -> bool {
        self.inner.is_complete()
    }

    pub fn pending(&self) -> usize {
        self.inner.pending()
    }
}

impl std::fmt::Debug for ExiledChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExiledChain")
            .field("pending", &self.pending())
            .finish()
    }
}

/// Blocks the calling OS thread until `chain` completes.
///
/// This is the wait for code running outside any fiber, such as a shutdown
/// path or a helper thread. Called on a fiber it stalls the whole worker.
pub fn unchain_exile(chain: &ExiledChain) {
    chain.inner.block_thread();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_chain_is_complete() {
        let chain = Chain::new(ChainInner::new(0));
        assert!(chain.is_complete());
        let exiled = chain.exile();
        assert!(exiled.is_complete());
        // Must return immediately.
        unchain_exile(&exiled);
    }

    #[test]
    fn test_pending_chain() {
        let chain = Chain::new(ChainInner::new(3));
        assert!(!chain.is_complete());
        assert_eq!(chain.pending(), 3);
    }

    #[test]
    fn test_exiled_chain_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync + Clone>() {}
        assert_send_sync::<ExiledChain>();
    }
}
