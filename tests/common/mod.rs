//! Common test harness for thread-affine tests
//!
//! Tests run against a private loopback host so they never share a registry
//! or named threads with each other. Async tests are driven with
//! futures::executor::block_on on the test thread, which keeps the ambient
//! context observable from the test body.

#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Once};
use std::time::Duration;
use futures::executor::block_on;
use thread_affine::prelude::*;

/// Initialize the test environment once
static INIT: Once = Once::new();

/// Initialize test environment (called automatically by the helpers)
pub fn init_test_env() {
    INIT.call_once(|| {
        // RUST_LOG=thread_affine=trace shows dispatch traffic for a failing test
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Start a loopback host with a small any-thread pool
pub fn start_host() -> (Arc<LoopbackHost>, Dispatcher) {
    start_host_with(LoopbackConfig::default())
}

/// Start a loopback host from `config`, capping the any-thread pool at two workers
pub fn start_host_with(config: LoopbackConfig) -> (Arc<LoopbackHost>, Dispatcher) {
    init_test_env();
    let config = LoopbackConfig {
        any_thread_workers: config.any_thread_workers.clamp(1, 2),
        ..config
    };
    let host = LoopbackHost::start(config).expect("loopback host should start");
    let dispatcher = host.dispatcher();
    (host, dispatcher)
}

/// Loopback host whose deliveries lag by `delay`
pub fn start_delayed_host(delay: Duration) -> (Arc<LoopbackHost>, Dispatcher) {
    start_host_with(LoopbackConfig {
        dispatch_delay: Some(delay),
        ..Default::default()
    })
}

/// Name of the OS thread running the caller
pub fn thread_name() -> String {
    std::thread::current().name().unwrap_or("<unnamed>").to_string()
}

/// Run an async test body on the test thread
pub fn run_test<F, Fut>(test_fn: F)
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ()>,
{
    init_test_env();
    block_on(test_fn());
}

/// Macro to define an async thread-affine test
///
/// Usage:
/// ```
/// affine_test!(async fn my_test() {
///     // test code here
/// });
/// ```
#[macro_export]
macro_rules! affine_test {
    (async fn $name:ident() $body:block) => {
        #[test]
        fn $name() {
            $crate::common::run_test(|| async move $body);
        }
    };
}
