//! Worker threads.
//!
//! Every worker runs the same dispatch loop: resume ready fibers first, then
//! start new tears on free fibers, taking tears from the local deque, the
//! global injector, and finally other workers' deques. A worker that finds
//! nothing spins for a while, then parks on the rift's condition variable.

use crate::PinningStrategy;
use crate::context;
use crate::error::{Result, RivenError};
use crate::fiber::{FiberHandle, FiberInput, FiberState, FiberYield, SharedPtr};
use crate::rift::Shared;
use crate::tear::Tear;
use core_affinity::CoreId;
use crossbeam::deque::{Steal, Worker as Deque};
use std::sync::atomic::Ordering;
use std::thread;

/// Empty polls before a worker parks.
const IDLE_SPINS: u32 = 64;

/// Runs worker 0 on the calling thread and the rest on scoped threads.
///
/// Returns after every worker has observed shutdown and joined.
pub(crate) fn run_workers(shared: &Shared, deques: Vec<Deque<Tear>>) -> Result<()> {
    let mut deques = deques.into_iter();
    let Some(main_queue) = deques.next() else {
        return Err(RivenError::invalid("rift needs at least one worker"));
    };

    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(shared.config.thread_count - 1);
        for (offset, local) in deques.enumerate() {
            let id = offset + 1;
            let spawned = thread::Builder::new()
                .name(format!("riven-worker-{id}"))
                .spawn_scoped(scope, move || {
                    pin_current(id, shared.config.pinning);
                    run(id, shared, local);
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    log::error!("failed to spawn worker {id}: {err}");
                    shared.begin_shutdown();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(RivenError::ThreadSpawn(err));
                }
            }
        }

        run(0, shared, main_queue);

        let mut panicked = 0;
        for handle in handles {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            log::error!("{panicked} worker thread(s) panicked");
            return Err(RivenError::WorkerPanicked(panicked));
        }
        Ok(())
    })
}

fn run(id: usize, shared: &Shared, local: Deque<Tear>) {
    log::debug!("worker {id} started");
    let mut idle = 0;

    while !shared.is_shutting_down() {
        if let Some(handle) = shared.ready.pop() {
            shared.stats.fibers_resumed.fetch_add(1, Ordering::Relaxed);
            resume(id, shared, &local, handle, FiberInput::Resume);
            idle = 0;
            continue;
        }

        if let Some(handle) = shared.pool.acquire() {
            if let Some(tear) = find_tear(id, shared, &local) {
                shared.stats.fibers_started.fetch_add(1, Ordering::Relaxed);
                let input = FiberInput::Start {
                    tear,
                    shared: SharedPtr(shared),
                    handle,
                };
                resume(id, shared, &local, handle, input);
                idle = 0;
                continue;
            }
            shared.pool.release(handle);
        }

        if idle < IDLE_SPINS {
            idle += 1;
            std::hint::spin_loop();
            continue;
        }
        shared.stats.parks.fetch_add(1, Ordering::Relaxed);
        shared.sleep.park(|| shared.has_work());
        idle = 0;
    }

    if shared.config.trace {
        shared.trace.collect_local();
    }
    let dropped = local.len();
    if dropped > 0 {
        log::warn!("worker {id} stopped with {dropped} tear(s) still queued");
    } else {
        log::debug!("worker {id} stopped");
    }
}

fn find_tear(id: usize, shared: &Shared, local: &Deque<Tear>) -> Option<Tear> {
    if let Some(tear) = local.pop() {
        return Some(tear);
    }

    loop {
        match shared.injector.steal_batch_and_pop(local) {
            Steal::Success(tear) => return Some(tear),
            Steal::Empty => break,
            Steal::Retry => continue,
        }
    }

    let count = shared.stealers.len();
    for offset in 1..count {
        let victim = (id + offset) % count;
        loop {
            match shared.stealers[victim].steal() {
                Steal::Success(tear) => {
                    shared.stats.steals.fetch_add(1, Ordering::Relaxed);
                    return Some(tear);
                }
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
    }
    None
}

/// Switches into `handle` until it completes its tear or waits on a chain.
fn resume(id: usize, shared: &Shared, local: &Deque<Tear>, handle: FiberHandle, input: FiberInput) {
    let slot = shared.pool.slot(handle);
    slot.bind(id, local);
    context::set_current(Some((SharedPtr(shared), handle)));

    // SAFETY: the handle came from the free list or the ready ring, so this
    // worker is the only one touching the fiber.
    let fiber = unsafe { slot.fiber_mut() };
    let outcome = fiber.resume(input);
    context::set_current(None);

    if !fiber.stack_intact() {
        log::error!(
            "fiber {} overran its {}-byte stack",
            handle.index(),
            shared.config.fiber_stack_size
        );
        std::process::abort();
    }

    match outcome {
        FiberYield::Complete => {
            slot.set_state(FiberState::Finished);
            shared.pool.release(handle);
        }
        FiberYield::Unchain(chain) => {
            // The fiber is switched out; from here on any thread completing
            // the chain may queue it.
            slot.set_state(FiberState::Waiting);
            shared.stats.fibers_suspended.fetch_add(1, Ordering::Relaxed);
            if !chain.add_waiter(shared, handle) {
                shared.make_ready(handle);
            }
        }
    }
}

/// Picks the core worker `id` runs on under `strategy`.
pub(crate) fn core_for(
    id: usize,
    strategy: PinningStrategy,
    cores: &[CoreId],
    physical: usize,
) -> Option<CoreId> {
    if cores.is_empty() {
        return None;
    }
    match strategy {
        PinningStrategy::None => None,
        PinningStrategy::Linear => Some(cores[id % cores.len()]),
        PinningStrategy::AvoidSMT => {
            // With SMT enabled, logical processors 2n and 2n+1 share a core.
            if physical < cores.len() {
                let even: Vec<CoreId> = cores.iter().copied().step_by(2).collect();
                Some(even[id % even.len()])
            } else {
                Some(cores[id % cores.len()])
            }
        }
    }
}

fn pin_current(id: usize, strategy: PinningStrategy) {
    if strategy == PinningStrategy::None {
        return;
    }
    let Some(cores) = core_affinity::get_core_ids() else {
        log::warn!("worker {id}: core ids unavailable, running unpinned");
        return;
    };
    if let Some(core) = core_for(id, strategy, &cores, num_cpus::get_physical()) {
        if core_affinity::set_for_current(core) {
            log::trace!("worker {id} pinned to core {}", core.id);
        } else {
            log::warn!("worker {id}: failed to pin to core {}", core.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cores(n: usize) -> Vec<CoreId> {
        (0..n).map(|id| CoreId { id }).collect()
    }

    #[test]
    fn test_linear_pinning_wraps() {
        let cores = cores(4);
        assert_eq!(core_for(1, PinningStrategy::Linear, &cores, 4), Some(CoreId { id: 1 }));
        assert_eq!(core_for(5, PinningStrategy::Linear, &cores, 4), Some(CoreId { id: 1 }));
        assert_eq!(core_for(0, PinningStrategy::None, &cores, 4), None);
    }

    #[test]
    fn test_avoid_smt_uses_even_processors() {
        let cores = cores(8);
        let picked: Vec<usize> = (0..5)
            .filter_map(|id| core_for(id, PinningStrategy::AvoidSMT, &cores, 4))
            .map(|core| core.id)
            .collect();
        assert_eq!(picked, vec![0, 2, 4, 6, 0]);
    }

    #[test]
    fn test_avoid_smt_without_smt_is_linear() {
        let cores = cores(4);
        assert_eq!(core_for(3, PinningStrategy::AvoidSMT, &cores, 4), Some(CoreId { id: 3 }));
    }

    #[test]
    fn test_no_cores_means_no_pinning() {
        assert_eq!(core_for(0, PinningStrategy::Linear, &[], 0), None);
    }
}
