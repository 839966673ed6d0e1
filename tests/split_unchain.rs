use crossbeam::channel::RecvTimeoutError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use riven::{Context, ExiledChain, Rift, RiftConfig, RiftHints, RivenError, Tear, unchain_exile};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn config(threads: usize, fibers: usize) -> RiftConfig {
    RiftConfig::from_hints(&RiftHints {
        thread_count: threads,
        fiber_count: fibers,
        fiber_stack_size: 32 * 1024,
        ..Default::default()
    })
    .unwrap()
}

fn counting_tears(count: usize, counter: &Arc<AtomicUsize>) -> Vec<Tear> {
    (0..count)
        .map(|_| {
            let counter = counter.clone();
            Tear::new("increment", move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            })
        })
        .collect()
}

#[test]
fn test_concurrent_increments_are_exact() {
    let mut rng = StdRng::seed_from_u64(0x5249_5645);
    for round in 0..20 {
        let count = rng.random_range(1..=2000);
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        Rift::run(&config(4, 64), move |ctx| {
            ctx.split_and_unchain(counting_tears(count, &counter_clone))
                .unwrap();
            assert_eq!(counter_clone.load(Ordering::Relaxed), count);
        })
        .unwrap();

        assert_eq!(counter.load(Ordering::Relaxed), count, "round {round}");
    }
}

#[test]
fn test_every_tear_runs_exactly_once() {
    let hits: Arc<Vec<AtomicUsize>> = Arc::new((0..512).map(|_| AtomicUsize::new(0)).collect());
    let hits_clone = hits.clone();

    Rift::run(&config(4, 32), move |ctx| {
        let tears = (0..512).map(|i| {
            let hits = hits_clone.clone();
            Tear::new("mark", move |_| {
                hits[i].fetch_add(1, Ordering::SeqCst);
            })
        });
        ctx.split_and_unchain(tears).unwrap();
    })
    .unwrap();

    assert!(hits.iter().all(|hit| hit.load(Ordering::SeqCst) == 1));
}

#[test]
fn test_empty_split_is_already_complete() {
    let elapsed = Arc::new(Mutex::new(None));
    let elapsed_clone = elapsed.clone();

    Rift::run(&config(2, 8), move |ctx| {
        let chain = ctx.split(Vec::new()).unwrap();
        assert!(chain.is_complete());
        let start = Instant::now();
        ctx.unchain(chain);
        *elapsed_clone.lock().unwrap() = Some(start.elapsed());
    })
    .unwrap();

    let elapsed = elapsed.lock().unwrap().unwrap();
    assert!(elapsed < Duration::from_millis(5), "empty unchain took {elapsed:?}");
}

#[test]
fn test_null_procedure_rejects_the_whole_split() {
    unsafe extern "C" fn bump(arg: *mut std::ffi::c_void) {
        let counter = unsafe { &*(arg as *const AtomicUsize) };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    let counter = Arc::new(AtomicUsize::new(0));
    let counter_clone = counter.clone();
    let outcome = Arc::new(Mutex::new(None));
    let outcome_clone = outcome.clone();

    Rift::run(&config(2, 8), move |ctx| {
        let arg = Arc::as_ptr(&counter_clone) as *mut std::ffi::c_void;
        let tears = unsafe {
            vec![
                Tear::from_raw("good", Some(bump), arg),
                Tear::from_raw("null", None, arg),
                Tear::from_raw("good", Some(bump), arg),
            ]
        };
        let result = ctx.split(tears);
        *outcome_clone.lock().unwrap() = Some(matches!(result, Err(RivenError::InvalidArgument(_))));
    })
    .unwrap();

    assert_eq!(*outcome.lock().unwrap(), Some(true));
    // Nothing was enqueued.
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

fn fan_out(ctx: &Context<'_>, depth: u32, width: usize, leaves: Arc<AtomicUsize>) {
    if depth == 0 {
        leaves.fetch_add(1, Ordering::SeqCst);
        return;
    }
    let tears = (0..width).map(|_| {
        let leaves = leaves.clone();
        Tear::new("fan_out", move |ctx| fan_out(ctx, depth - 1, width, leaves))
    });
    ctx.split_and_unchain(tears).unwrap();
}

#[test]
fn test_nested_fan_out_completes_inner_first() {
    let leaves = Arc::new(AtomicUsize::new(0));
    let observed = Arc::new(Mutex::new(Vec::new()));
    let leaves_clone = leaves.clone();
    let observed_clone = observed.clone();

    // 1 + 4 + 16 fibers can be waiting at once.
    Rift::run(&config(4, 64), move |ctx| {
        let tears = (0..4).map(|_| {
            let leaves = leaves_clone.clone();
            let observed = observed_clone.clone();
            Tear::new("outer", move |ctx| {
                let inner = Arc::new(AtomicUsize::new(0));
                fan_out(ctx, 2, 4, inner.clone());
                // The inner chain has completed before we get here.
                observed.lock().unwrap().push(inner.load(Ordering::SeqCst));
                leaves.fetch_add(inner.load(Ordering::SeqCst), Ordering::SeqCst);
            })
        });
        ctx.split_and_unchain(tears).unwrap();
        assert_eq!(leaves_clone.load(Ordering::SeqCst), 64);
    })
    .unwrap();

    assert_eq!(leaves.load(Ordering::SeqCst), 4 * 16);
    assert_eq!(*observed.lock().unwrap(), vec![16; 4]);
}

/// Runs `body` on its own thread and fails the test if it has not finished
/// within `limit`, so a scheduler deadlock shows up as a failure.
fn within<F>(limit: Duration, body: F)
where
    F: FnOnce() + Send + 'static,
{
    let (done, finished) = crossbeam::channel::bounded::<()>(1);
    let runner = std::thread::spawn(move || {
        body();
        let _ = done.send(());
    });
    match finished.recv_timeout(limit) {
        // Disconnected means the body panicked; joining re-raises it.
        Ok(()) | Err(RecvTimeoutError::Disconnected) => runner.join().unwrap(),
        Err(RecvTimeoutError::Timeout) => panic!("rift did not finish within {limit:?}"),
    }
}

#[test]
fn test_parents_outnumbering_fibers_each_nest_a_child() {
    for threads in [1, 4] {
        let children = Arc::new(AtomicUsize::new(0));
        let children_clone = children.clone();

        within(Duration::from_secs(30), move || {
            Rift::run(&config(threads, 16), move |ctx| {
                let parents = (0..200).map(|_| {
                    let children = children_clone.clone();
                    Tear::new("parent", move |ctx| {
                        let child = Tear::new("child", move |_| {
                            children.fetch_add(1, Ordering::SeqCst);
                        });
                        ctx.split_and_unchain([child]).unwrap();
                    })
                });
                ctx.split_and_unchain(parents).unwrap();
            })
            .unwrap();
        });

        assert_eq!(children.load(Ordering::SeqCst), 200, "threads = {threads}");
    }
}

#[test]
fn test_exiled_chain_waited_by_plain_thread() {
    let (sender, receiver) = crossbeam::channel::bounded::<ExiledChain>(1);
    let counter = Arc::new(AtomicUsize::new(0));
    let counter_clone = counter.clone();

    let waiter = std::thread::spawn(move || {
        let chain = receiver.recv().unwrap();
        unchain_exile(&chain);
        assert!(chain.is_complete());
    });

    Rift::run(&config(2, 16), move |ctx| {
        let tears = (0..8).map(|_| {
            let counter = counter_clone.clone();
            Tear::new("slow", move |_| {
                std::thread::sleep(Duration::from_millis(2));
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });
        let chain = ctx.split(tears).unwrap().exile();
        sender.send(chain.clone()).unwrap();
        ctx.unchain_exiled(&chain);
    })
    .unwrap();

    waiter.join().unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 8);
}

#[test]
fn test_exiled_chain_waited_by_another_fiber() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let order_clone = order.clone();

    Rift::run(&config(2, 16), move |ctx| {
        let work_order = order_clone.clone();
        let work = ctx
            .split([Tear::new("work", move |_| {
                std::thread::sleep(Duration::from_millis(5));
                work_order.lock().unwrap().push("work");
            })])
            .unwrap()
            .exile();

        let supervisor_order = order_clone.clone();
        let supervisor = ctx
            .split([Tear::new("supervisor", move |ctx| {
                ctx.unchain_exiled(&work);
                supervisor_order.lock().unwrap().push("supervisor");
            })])
            .unwrap();
        ctx.unchain(supervisor);
    })
    .unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["work", "supervisor"]);
}

#[test]
fn test_many_waiters_on_one_chain() {
    let woken = Arc::new(AtomicUsize::new(0));
    let woken_clone = woken.clone();

    Rift::run(&config(4, 64), move |ctx| {
        let gate = ctx
            .split([Tear::new("gate", |_| {
                std::thread::sleep(Duration::from_millis(10));
            })])
            .unwrap()
            .exile();

        let waiters = (0..16).map(|_| {
            let gate = gate.clone();
            let woken = woken_clone.clone();
            Tear::new("waiter", move |ctx| {
                ctx.unchain_exiled(&gate);
                assert!(gate.is_complete());
                woken.fetch_add(1, Ordering::SeqCst);
            })
        });
        ctx.split_and_unchain(waiters).unwrap();
    })
    .unwrap();

    assert_eq!(woken.load(Ordering::SeqCst), 16);
}
