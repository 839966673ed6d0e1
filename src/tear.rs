//! Tear definitions and execution logic.
//!
//! A tear is one schedulable unit of work: a procedure, a name used in logs
//! and traces, and (once split) the chain it reports completion to.

use crate::chain::ChainInner;
use crate::context::Context;
use crate::fiber::FiberHandle;
use crate::rift::Shared;
use std::sync::Arc;
use std::time::Instant;

/// Boxed tear body.
pub type Procedure = Box<dyn FnOnce(&Context<'_>) + Send + 'static>;

/// Raw procedure taking an opaque argument, as handed over by C callers.
pub type RawProcedure = unsafe extern "C" fn(*mut std::ffi::c_void);

#[derive(Clone, Copy)]
pub(crate) struct SendPtr<T>(pub(crate) *mut T);

unsafe impl<T> Send for SendPtr<T> {}
unsafe impl<T> Sync for SendPtr<T> {}

/// A unit of work to be split across the rift.
pub struct Tear {
    name: &'static str,
    procedure: Option<Procedure>,
    pub(crate) completion: Option<Arc<ChainInner>>,
}

impl Tear {
    /// Creates a tear from a closure receiving the fiber's [`Context`].
    pub fn new<F>(name: &'static str, work: F) -> Self
    where
        F: FnOnce(&Context<'_>) + Send + 'static,
    {
        Tear {
            name,
            procedure: Some(Box::new(work)),
            completion: None,
        }
    }

    /// Creates a tear from a raw procedure and argument.
    ///
    /// A `None` procedure is accepted here and rejected by `split`.
    ///
    /// # Safety
    ///
    /// `procedure` must be safe to call with `argument` from any worker
    /// thread, and `argument` must stay valid until the tear has run.
    pub unsafe fn from_raw(
        name: &'static str,
        procedure: Option<RawProcedure>,
        argument: *mut std::ffi::c_void,
    ) -> Self {
        let argument = SendPtr(argument);
        Tear {
            name,
            procedure: procedure.map(|procedure| {
                Box::new(move |_: &Context<'_>| {
                    let argument = argument;
                    // SAFETY: upheld by the caller of `from_raw`.
                    unsafe { procedure(argument.0) }
                }) as Procedure
            }),
            completion: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn has_procedure(&self) -> bool {
        self.procedure.is_some()
    }

    /// Whether this tear reports to `chain` once run.
    pub(crate) fn belongs_to(&self, chain: &Arc<ChainInner>) -> bool {
        self.completion
            .as_ref()
            .is_some_and(|completion| Arc::ptr_eq(completion, chain))
    }

    /// Runs the procedure on the current fiber, then reports to the chain.
    ///
    /// A panic escaping the procedure aborts the process: fiber-pool state
    /// touched by a half-finished tear cannot be trusted afterwards.
    pub(crate) fn run(self, shared: &Shared, fiber: FiberHandle) {
        use std::panic::{AssertUnwindSafe, catch_unwind};

        let Tear {
            name,
            procedure,
            completion,
        } = self;

        let started = shared.config.trace.then(Instant::now);
        if let Some(procedure) = procedure {
            let ctx = Context::new(shared, fiber);
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| procedure(&ctx))) {
                let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                    *s
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.as_str()
                } else {
                    "unknown panic"
                };
                log::error!("tear '{name}' panicked on fiber {}: {msg}", fiber.index());
                std::process::abort();
            }
        }
        if let Some(started) = started {
            let worker = shared.pool.slot(fiber).worker();
            crate::tracing::record_event(name, worker, started, started.elapsed());
        }

        shared.stats.tears_executed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if let Some(chain) = completion {
            chain.finish_one(shared);
        }
    }
}

impl std::fmt::Debug for Tear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tear")
            .field("name", &self.name)
            .field("has_procedure", &self.procedure.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn noop(_: *mut std::ffi::c_void) {}

    #[test]
    fn test_tear_metadata() {
        let tear = Tear::new("physics", |_| {});
        assert_eq!(tear.name(), "physics");
        assert!(tear.has_procedure());
    }

    #[test]
    fn test_raw_tear_without_procedure() {
        let tear = unsafe { Tear::from_raw("null", None, std::ptr::null_mut()) };
        assert!(!tear.has_procedure());
        let tear = unsafe { Tear::from_raw("noop", Some(noop), std::ptr::null_mut()) };
        assert!(tear.has_procedure());
    }
}
