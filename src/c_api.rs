//! C surface for the bootstrap, split and unchain protocol.
//!
//! Split and unchain find the running fiber through the worker's thread-local
//! record. Called outside a fiber they return the `FeatureUnsupported` code.
//! Every function returning `i32` uses 0 for success and
//! [`RivenError::code`] otherwise.

use crate::PinningStrategy;
use crate::chain::{Chain, ExiledChain, unchain_exile};
use crate::context::Context;
use crate::error::RivenError;
use crate::rift::{Rift, RiftConfig, RiftHints, RiftMemory};
use crate::tear::{RawProcedure, SendPtr, Tear};
use std::ffi::c_void;
use std::ptr::{self, NonNull};

/// Bootstrap hints; zero fields take their default.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RivenHints {
    pub thread_count: u32,
    pub fiber_count: u32,
    pub fiber_stack_size: usize,
    pub queue_log2_size: u32,
    /// Non-zero pins worker `i` to logical processor `i`.
    pub pin_threads: u32,
}

/// One work item: `procedure(argument)`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RivenTear {
    pub procedure: Option<RawProcedure>,
    pub argument: *mut c_void,
}

/// Opaque chain owned by the fiber that split it.
pub struct RivenChain(Chain);

/// Opaque chain any fiber or thread may wait on.
pub struct RivenExile(ExiledChain);

const OK: i32 = 0;

fn unsupported_outside_fiber() -> i32 {
    RivenError::FeatureUnsupported("called outside a fiber".into()).code()
}

unsafe fn config_from(hints: *const RivenHints) -> Result<RiftConfig, RivenError> {
    // SAFETY: the caller passes null or a valid pointer.
    let hints = unsafe { hints.as_ref() }.copied().unwrap_or_default();
    RiftConfig::from_hints(&RiftHints {
        thread_count: hints.thread_count as usize,
        fiber_count: hints.fiber_count as usize,
        fiber_stack_size: hints.fiber_stack_size,
        queue_log2_size: hints.queue_log2_size,
        pinning: if hints.pin_threads != 0 {
            PinningStrategy::Linear
        } else {
            PinningStrategy::None
        },
        ..Default::default()
    })
}

unsafe fn tears_from(tears: *const RivenTear, count: usize) -> Result<Vec<Tear>, RivenError> {
    if count == 0 {
        return Ok(Vec::new());
    }
    if tears.is_null() {
        return Err(RivenError::invalid("null tear array"));
    }
    // SAFETY: the caller passes `count` valid tears.
    let tears = unsafe { std::slice::from_raw_parts(tears, count) };
    Ok(tears
        .iter()
        // SAFETY: the caller guarantees each procedure may run on any worker.
        .map(|tear| unsafe { Tear::from_raw("c_tear", tear.procedure, tear.argument) })
        .collect())
}

/// Bytes of buffer `riven_bootstrap` needs for `hints`, or 0 if the hints are
/// invalid. A null `hints` means all defaults.
///
/// # Safety
///
/// `hints` must be null or point to a valid `RivenHints`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn riven_query_memory(hints: *const RivenHints) -> usize {
    match unsafe { config_from(hints) } {
        Ok(config) => Rift::query_memory(&config),
        Err(err) => {
            log::warn!("riven_query_memory: {err}");
            0
        }
    }
}

/// Runs `entry(argument)` on a fiber, making the calling thread worker 0.
/// Returns once the entry procedure has returned and all workers joined;
/// the buffer may be freed after that.
///
/// `size` is in/out. With a null `buffer` nothing runs: the bytes needed for
/// `hints` are written to `*size` and 0 is returned. Otherwise `*size` is the
/// length of `buffer`.
///
/// # Safety
///
/// `size` must be valid for reads and writes. `buffer` must be null or point
/// to `*size` writable bytes not used elsewhere until this returns. `entry`
/// must be safe to call with `argument` on any thread.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn riven_bootstrap(
    hints: *const RivenHints,
    buffer: *mut u8,
    size: *mut usize,
    entry: Option<RawProcedure>,
    argument: *mut c_void,
) -> i32 {
    let config = match unsafe { config_from(hints) } {
        Ok(config) => config,
        Err(err) => return err.code(),
    };
    if size.is_null() {
        return RivenError::invalid("null size").code();
    }
    let Some(buffer) = NonNull::new(buffer) else {
        // SAFETY: checked non-null above.
        unsafe { *size = Rift::query_memory(&config) };
        return OK;
    };
    let Some(entry) = entry else {
        return RivenError::invalid("null entry procedure").code();
    };
    // SAFETY: checked non-null above.
    let size = unsafe { *size };

    // SAFETY: upheld by the caller.
    let memory = unsafe { RiftMemory::from_raw_parts(buffer, size) };
    let argument = SendPtr(argument);
    let result = Rift::bootstrap(&config, memory, move |_| {
        let argument = argument;
        // SAFETY: upheld by the caller.
        unsafe { entry(argument.0) }
    });
    match result {
        Ok(_) => OK,
        Err(err) => {
            log::error!("riven_bootstrap: {err}");
            err.code()
        }
    }
}

/// Enqueues `count` tears and stores a chain for them in `out`.
///
/// # Safety
///
/// `tears` must point to `count` valid tears, `out` must be writable, and
/// every procedure must be safe to call with its argument on any thread.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn riven_split(
    tears: *const RivenTear,
    count: usize,
    out: *mut *mut RivenChain,
) -> i32 {
    if out.is_null() {
        return RivenError::invalid("null chain output").code();
    }
    let tears = match unsafe { tears_from(tears, count) } {
        Ok(tears) => tears,
        Err(err) => return err.code(),
    };
    let result = Context::with_current(|ctx| ctx.split(tears));
    match result {
        Some(Ok(chain)) => {
            // SAFETY: checked non-null above.
            unsafe { *out = Box::into_raw(Box::new(RivenChain(chain))) };
            OK
        }
        Some(Err(err)) => err.code(),
        None => unsupported_outside_fiber(),
    }
}

/// Suspends the calling fiber until `chain` completes, then frees it.
///
/// # Safety
///
/// `chain` must come from `riven_split` on this fiber and not be used again.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn riven_unchain(chain: *mut RivenChain) -> i32 {
    if chain.is_null() {
        return RivenError::invalid("null chain").code();
    }
    // SAFETY: ownership comes back from `riven_split`.
    let RivenChain(chain) = *unsafe { Box::from_raw(chain) };
    match Context::with_current(move |ctx| ctx.unchain(chain)) {
        Some(()) => OK,
        None => unsupported_outside_fiber(),
    }
}

/// `riven_split` followed by `riven_unchain`.
///
/// # Safety
///
/// Same as [`riven_split`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn riven_split_and_unchain(tears: *const RivenTear, count: usize) -> i32 {
    let tears = match unsafe { tears_from(tears, count) } {
        Ok(tears) => tears,
        Err(err) => return err.code(),
    };
    match Context::with_current(|ctx| ctx.split_and_unchain(tears)) {
        Some(Ok(())) => OK,
        Some(Err(err)) => err.code(),
        None => unsupported_outside_fiber(),
    }
}

/// Detaches `chain` from its fiber. Returns null for a null chain.
///
/// # Safety
///
/// `chain` must come from `riven_split` and not be used again.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn riven_chain_exile(chain: *mut RivenChain) -> *mut RivenExile {
    if chain.is_null() {
        return ptr::null_mut();
    }
    // SAFETY: ownership comes back from `riven_split`.
    let RivenChain(chain) = *unsafe { Box::from_raw(chain) };
    Box::into_raw(Box::new(RivenExile(chain.exile())))
}

/// Waits for an exiled chain, then frees it.
///
/// On a fiber the wait suspends the fiber; anywhere else it blocks the thread.
///
/// # Safety
///
/// `exile` must come from `riven_chain_exile` and not be used again.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn riven_unchain_exile(exile: *mut RivenExile) -> i32 {
    if exile.is_null() {
        return RivenError::invalid("null exiled chain").code();
    }
    // SAFETY: ownership comes back from `riven_chain_exile`.
    let exile = unsafe { Box::from_raw(exile) };
    if Context::with_current(|ctx| ctx.unchain_exiled(&exile.0)).is_none() {
        unchain_exile(&exile.0);
    }
    OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_with_null_hints_uses_defaults() {
        let size = unsafe { riven_query_memory(ptr::null()) };
        assert!(size >= 128 * 64 * 1024);
    }

    #[test]
    fn test_query_with_invalid_hints_returns_zero() {
        let hints = RivenHints {
            fiber_stack_size: 100,
            ..Default::default()
        };
        assert_eq!(unsafe { riven_query_memory(&hints) }, 0);
    }

    #[test]
    fn test_calls_outside_fiber_are_unsupported() {
        let mut chain = ptr::null_mut();
        let code = unsafe { riven_split(ptr::null(), 0, &mut chain) };
        assert_eq!(code, RivenError::FeatureUnsupported(String::new()).code());
        assert!(chain.is_null());
    }

    #[test]
    fn test_bootstrap_rejects_null_entry() {
        let hints = RivenHints {
            thread_count: 1,
            fiber_count: 4,
            ..Default::default()
        };
        let size = unsafe { riven_query_memory(&hints) };
        let mut buffer = vec![0u8; size];
        let mut size = size;
        let code = unsafe {
            riven_bootstrap(&hints, buffer.as_mut_ptr(), &mut size, None, ptr::null_mut())
        };
        assert_eq!(code, RivenError::invalid("").code());
    }

    #[test]
    fn test_bootstrap_with_null_buffer_reports_size() {
        let hints = RivenHints {
            thread_count: 1,
            fiber_count: 4,
            ..Default::default()
        };
        let mut size = 0;
        let code = unsafe {
            riven_bootstrap(&hints, ptr::null_mut(), &mut size, None, ptr::null_mut())
        };
        assert_eq!(code, OK);
        assert_eq!(size, unsafe { riven_query_memory(&hints) });
        assert!(size > 0);
    }

    #[test]
    fn test_bootstrap_rejects_null_size() {
        let code = unsafe {
            riven_bootstrap(ptr::null(), ptr::null_mut(), ptr::null_mut(), None, ptr::null_mut())
        };
        assert_eq!(code, RivenError::invalid("").code());
    }
}
