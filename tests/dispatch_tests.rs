//! Integration tests for post and send
//!
//! These run against the loopback host, which owns real named threads.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use parking_lot::Mutex;
use thread_affine::prelude::*;

#[test]
fn test_post_returns_before_callback_runs() {
    let (_host, dispatcher) = common::start_delayed_host(Duration::from_millis(100));
    let game = dispatcher.context(ThreadId::GAME_THREAD);

    let ran = Arc::new(AtomicUsize::new(0));
    let (done_tx, done_rx) = mpsc::channel();
    {
        let ran = Arc::clone(&ran);
        game.post(move || {
            ran.fetch_add(1, Ordering::SeqCst);
            done_tx.send(common::thread_name()).unwrap();
        });
    }

    // The host holds the callback back for 100ms
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    let ran_on = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(ran_on, "loopback-GameThread");

    thread::sleep(Duration::from_millis(50));
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn test_posts_to_one_queue_run_in_order() {
    let (_host, dispatcher) = common::start_host();
    let render = dispatcher.context(ThreadId::ACTUAL_RENDERING_THREAD_LOCAL);
    let order = Arc::new(Mutex::new(Vec::new()));

    for i in 0..100 {
        let order = Arc::clone(&order);
        render.post(move || order.lock().push(i));
    }

    // A send on the same queue lands behind every post
    render.send(|| ()).unwrap();
    assert_eq!(*order.lock(), (0..100).collect::<Vec<_>>());
}

#[test]
fn test_send_blocks_until_callback_ran() {
    let (host, dispatcher) = common::start_host();
    let game = dispatcher.context(ThreadId::GAME_THREAD);
    let finished = Arc::new(AtomicBool::new(false));

    let finished_clone = Arc::clone(&finished);
    let ran_on = game
        .send(move || {
            thread::sleep(Duration::from_millis(30));
            finished_clone.store(true, Ordering::SeqCst);
            common::thread_name()
        })
        .unwrap();

    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(ran_on, "loopback-GameThread");
    assert_eq!(host.stats().tasks_queued, 1);
}

#[test]
fn test_concurrent_senders_each_run_once() {
    let (host, dispatcher) = common::start_host();
    let game = dispatcher.context(ThreadId::GAME_THREAD);
    let counter = Arc::new(AtomicUsize::new(0));

    let senders: Vec<_> = (0..8)
        .map(|_| {
            let game = Arc::clone(&game);
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                for _ in 0..25 {
                    let before = counter.load(Ordering::SeqCst);
                    let counter_clone = Arc::clone(&counter);
                    let name = game
                        .send(move || {
                            counter_clone.fetch_add(1, Ordering::SeqCst);
                            common::thread_name()
                        })
                        .unwrap();
                    assert_eq!(name, "loopback-GameThread");
                    // Our own increment is visible as soon as send returns
                    assert!(counter.load(Ordering::SeqCst) > before);
                }
            })
        })
        .collect();

    for sender in senders {
        sender.join().unwrap();
    }

    assert_eq!(counter.load(Ordering::SeqCst), 200);
    assert_eq!(host.stats().tasks_queued, 200);
    assert_eq!(host.registry().outstanding(), 0);
}

#[test]
fn test_send_on_target_thread_runs_inline() {
    let (host, dispatcher) = common::start_host();
    let game = dispatcher.context(ThreadId::GAME_THREAD);

    let inner = Arc::clone(&game);
    let host_clone = Arc::clone(&host);
    let (queued_before, queued_after, inner_thread) = game
        .send(move || {
            let before = host_clone.stats().tasks_queued;
            // Would deadlock if it went through the game thread's queue
            let name = inner.send(common::thread_name).unwrap();
            (before, host_clone.stats().tasks_queued, name)
        })
        .unwrap();

    assert_eq!(queued_before, queued_after);
    assert_eq!(inner_thread, "loopback-GameThread");
}

#[test]
fn test_send_to_local_queue_from_game_thread_runs_inline() {
    let (_host, dispatcher) = common::start_host();
    let game = dispatcher.context(ThreadId::GAME_THREAD);
    let game_local = dispatcher.context(ThreadId::GAME_THREAD_LOCAL);

    let value = game.send(move || game_local.send(|| 11).unwrap()).unwrap();
    assert_eq!(value, 11);
}

#[test]
fn test_any_thread_dispatch() {
    let (_host, dispatcher) = common::start_host();
    let game = dispatcher.context(ThreadId::GAME_THREAD);
    let background = dispatcher.context(ThreadId::ANY_BACKGROUND_HI_PRI_TASK);

    // From a named thread the pool is a different thread
    let name = game.send(move || background.send(common::thread_name)).unwrap().unwrap();
    assert!(name.starts_with("loopback-AnyThread-"), "{}", name);
}

#[test]
fn test_any_thread_send_from_unnamed_thread_runs_inline() {
    let (host, dispatcher) = common::start_host();
    let any = dispatcher.context(ThreadId::ANY_THREAD);

    let name = any.send(common::thread_name).unwrap();
    assert_eq!(name, common::thread_name());
    assert_eq!(host.stats().tasks_queued, 0);
}

#[test]
fn test_nested_any_thread_send_on_single_worker_pool() {
    let (host, _) = common::start_host_with(LoopbackConfig {
        any_thread_workers: 1,
        ..Default::default()
    });
    let dispatcher = host.dispatcher_with_config(DispatchConfig {
        send_timeout: Some(Duration::from_secs(2)),
        ..Default::default()
    });
    let game = dispatcher.context(ThreadId::GAME_THREAD);
    let any = dispatcher.context(ThreadId::ANY_THREAD);
    let inner = dispatcher.context(ThreadId::ANY_NORMAL_THREAD_NORMAL_TASK);

    // The only pool worker sends to the pool again; that must not wait on itself
    let (outer_name, inner_name) = game
        .send(move || {
            any.send(move || {
                let nested = inner.send(common::thread_name);
                (common::thread_name(), nested)
            })
        })
        .unwrap()
        .unwrap();

    assert!(outer_name.starts_with("loopback-AnyThread-"), "{}", outer_name);
    assert_eq!(inner_name, Ok(outer_name));
    assert_eq!(host.stats().tasks_queued, 2);
}

#[test]
fn test_run_on_thread_targets_explicit_world() {
    let (host, dispatcher) = common::start_host();
    host.open_execution_context(ExecutionContext(7));
    assert_eq!(dispatcher.current_thread().unwrap(), ThreadId::ANY_THREAD);

    let (done_tx, done_rx) = mpsc::channel();
    dispatcher
        .run_on_thread(ExecutionContext(7), ThreadId::GAME_THREAD, move || {
            done_tx.send(common::thread_name()).unwrap();
        })
        .unwrap();
    assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap(), "loopback-GameThread");

    // Contexts can be bound to that world too, while the host stays in world 1
    let side = dispatcher.context_in(ThreadId::RHI_THREAD, ExecutionContext(7));
    assert_eq!(side.execution_context(), ExecutionContext(7));
    assert_eq!(side.send(|| 4).unwrap(), 4);
    assert_eq!(host.current_execution_context(), ExecutionContext(1));

    // Unknown worlds are refused and the callback is released unrun
    let result = dispatcher.run_on_thread(ExecutionContext(9), ThreadId::GAME_THREAD, || panic!("must not run"));
    assert!(matches!(result, Err(Error::DispatchFailure { .. })));
    host.close_execution_context(ExecutionContext(7));
    assert!(side.send(|| ()).is_err());
    assert_eq!(dispatcher.outstanding(), 0);
    assert_eq!(host.registry().outstanding(), 0);
}

#[test]
fn test_execution_context_is_read_once() {
    let (host, dispatcher) = common::start_host();
    let stale = dispatcher.context(ThreadId::GAME_THREAD);
    assert_eq!(stale.execution_context(), ExecutionContext(1));

    host.switch_execution_context(ExecutionContext(2));

    // The old context still targets world 1, which the host no longer serves
    assert!(matches!(stale.send(|| ()), Err(Error::DispatchFailure { .. })));

    let fresh = dispatcher.context(ThreadId::GAME_THREAD);
    assert_eq!(fresh.execution_context(), ExecutionContext(2));
    assert!(fresh.send(|| ()).is_ok());
    assert_eq!(host.registry().outstanding(), 0);
}

#[test]
fn test_send_after_host_shutdown_fails() {
    let (host, dispatcher) = common::start_host();
    let game = dispatcher.context(ThreadId::GAME_THREAD);
    host.shutdown();

    assert!(matches!(game.send(|| ()), Err(Error::DispatchFailure { .. })));
    // Posting is fire-and-forget; the failure is dropped
    game.post(|| ());
    assert_eq!(host.registry().outstanding(), 0);
}

#[test]
fn test_host_shutdown_wakes_blocked_sender() {
    let (host, dispatcher) = common::start_delayed_host(Duration::from_millis(300));
    let game = dispatcher.context(ThreadId::GAME_THREAD);

    // Occupy the game thread so the next token stays queued
    game.post(|| ());

    let sender = {
        let game = Arc::clone(&game);
        thread::spawn(move || game.send(|| ()))
    };
    while host.stats().tasks_queued < 2 {
        thread::yield_now();
    }
    host.shutdown();

    let result = sender.join().unwrap();
    assert!(matches!(result, Err(Error::DispatchFailure { .. })));
}

#[test]
fn test_dispatch_racing_shutdown_never_strands_a_sender() {
    for _ in 0..20 {
        let (host, _) = common::start_host();
        let dispatcher = host.dispatcher_with_config(DispatchConfig {
            send_timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let game = dispatcher.context(ThreadId::GAME_THREAD);

        let senders: Vec<_> = (0..4)
            .map(|_| {
                let game = Arc::clone(&game);
                thread::spawn(move || loop {
                    if let Err(e) = game.send(|| ()) {
                        return e;
                    }
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(2));
        host.shutdown();

        // Every sender is refused or released, none waits out the timeout
        for sender in senders {
            let error = sender.join().unwrap();
            assert!(matches!(error, Error::DispatchFailure { .. }), "{:?}", error);
        }
        assert_eq!(dispatcher.outstanding(), 0);
        assert_eq!(host.registry().outstanding(), 0);
    }
}

#[test]
fn test_panicking_callback_fails_send() {
    let (host, dispatcher) = common::start_host();
    let rhi = dispatcher.context(ThreadId::RHI_THREAD);

    let result = rhi.send(|| -> () { panic!("callback failure") });
    assert!(matches!(result, Err(Error::DispatchFailure { .. })));

    // The thread survives and keeps serving
    assert_eq!(rhi.send(|| 3).unwrap(), 3);
    assert_eq!(host.stats().tasks_failed, 1);
}

/// Host simulator that delivers every token twice on the calling thread
struct DoubleDeliveryHost {
    registry: Arc<HandleRegistry>,
    second_delivery: Mutex<Vec<Result<()>>>,
}

impl HostDispatcher for DoubleDeliveryHost {
    fn run_on_thread(&self, _context: ExecutionContext, _thread_code: i32, token: DispatchToken) -> Result<()> {
        self.registry.invoke_and_release(token)?;
        let second = self.registry.invoke_and_release(token);
        self.second_delivery.lock().push(second);
        Ok(())
    }

    fn current_named_thread(&self) -> i32 {
        ThreadId::ANY_THREAD.code()
    }

    fn current_execution_context(&self) -> ExecutionContext {
        ExecutionContext::NONE
    }
}

#[test]
fn test_double_delivery_is_detected() {
    let registry = Arc::new(HandleRegistry::new());
    let host = Arc::new(DoubleDeliveryHost {
        registry: Arc::clone(&registry),
        second_delivery: Mutex::new(Vec::new()),
    });
    let dispatcher = Dispatcher::with_registry(host.clone(), Arc::clone(&registry), DispatchConfig::default());

    let counter = Arc::new(AtomicUsize::new(0));
    let counter_clone = Arc::clone(&counter);
    dispatcher.context(ThreadId::GAME_THREAD).post(move || {
        counter_clone.fetch_add(1, Ordering::SeqCst);
    });

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    let second = host.second_delivery.lock().pop().unwrap();
    assert!(matches!(second, Err(Error::StaleToken { .. })));
    assert_eq!(registry.stats().rejected, 1);
}

/// Host that accepts tokens and never delivers them
struct BlackHoleHost {
    accepted: AtomicUsize,
}

impl HostDispatcher for BlackHoleHost {
    fn run_on_thread(&self, _context: ExecutionContext, _thread_code: i32, _token: DispatchToken) -> Result<()> {
        self.accepted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn current_named_thread(&self) -> i32 {
        ThreadId::ANY_THREAD.code()
    }

    fn current_execution_context(&self) -> ExecutionContext {
        ExecutionContext::NONE
    }
}

#[test]
fn test_dispatcher_shutdown_releases_undelivered_tokens() {
    let host = Arc::new(BlackHoleHost { accepted: AtomicUsize::new(0) });
    let registry = Arc::new(HandleRegistry::new());
    let dispatcher = Dispatcher::with_registry(host.clone(), Arc::clone(&registry), DispatchConfig::default());
    let game = dispatcher.context(ThreadId::GAME_THREAD);

    game.post(|| ());
    let sender = {
        let game = Arc::clone(&game);
        thread::spawn(move || game.send(|| ()))
    };
    while host.accepted.load(Ordering::SeqCst) < 2 {
        thread::yield_now();
    }

    assert_eq!(dispatcher.shutdown(), 2);
    assert!(matches!(sender.join().unwrap(), Err(Error::DispatchFailure { .. })));
    assert_eq!(registry.outstanding(), 0);
}

#[test]
fn test_dispatcher_shutdown_leaves_other_dispatchers_alone() {
    let registry = Arc::new(HandleRegistry::new());
    let slow = LoopbackHost::with_registry(
        LoopbackConfig {
            any_thread_workers: 1,
            dispatch_delay: Some(Duration::from_millis(100)),
            ..Default::default()
        },
        Arc::clone(&registry),
    )
    .unwrap();
    let other = LoopbackHost::with_registry(
        LoopbackConfig {
            any_thread_workers: 1,
            ..Default::default()
        },
        Arc::clone(&registry),
    )
    .unwrap();
    let slow_dispatcher = slow.dispatcher();
    let other_dispatcher = other.dispatcher();

    let ran = Arc::new(AtomicUsize::new(0));
    let game = slow_dispatcher.context(ThreadId::GAME_THREAD);
    for _ in 0..3 {
        let ran = Arc::clone(&ran);
        game.post(move || {
            ran.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert_eq!(slow_dispatcher.outstanding(), 3);

    assert_eq!(other_dispatcher.shutdown(), 0);

    // Queued behind the three posts on the same thread
    game.send(|| ()).unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 3);
    assert_eq!(slow_dispatcher.outstanding(), 0);
    assert_eq!(registry.stats().cancelled, 0);
}
