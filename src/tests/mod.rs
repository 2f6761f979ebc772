/*
 * In-kernel test suite.
 *
 * Runs once from the init thread at boot: each test spawns kernel
 * threads, drives a scenario end-to-end and reports through the shared
 * counters; the runner reaps the threads with wait() and prints a
 * summary.
 *
 * Host-side unit tests for the pure data structures live in #[cfg(test)]
 * modules next to their code; these suites cover what needs a running
 * scheduler.
 */

pub mod lock_tests;
pub mod rcu_tests;
pub mod sched_tests;
pub mod signal_tests;

use core::sync::atomic::{AtomicUsize, Ordering};

static PASSED: AtomicUsize = AtomicUsize::new(0);
static FAILED: AtomicUsize = AtomicUsize::new(0);

pub fn check(name: &str, ok: bool) {
    if ok {
        PASSED.fetch_add(1, Ordering::SeqCst);
        log::info!("[ok] {}", name);
    } else {
        FAILED.fetch_add(1, Ordering::SeqCst);
        log::error!("[FAILED] {}", name);
    }
}

/// Reap `n` children of the calling thread, returning (tgid, status)
/// pairs in reap order.
pub fn join_children(n: usize) -> heapless::Vec<(i32, i32), 16> {
    let mut out = heapless::Vec::new();
    for _ in 0..n {
        match crate::proc::lifecycle::wait() {
            Ok(pair) => {
                let _ = out.push(pair);
            }
            Err(e) => {
                log::error!("join_children: wait failed ({})", e);
                break;
            }
        }
    }
    out
}

pub fn run_all() {
    log::info!("==== kernel test suite ====");

    sched_tests::run();
    signal_tests::run();
    lock_tests::run();
    rcu_tests::run();

    let passed = PASSED.load(Ordering::SeqCst);
    let failed = FAILED.load(Ordering::SeqCst);
    if failed == 0 {
        log::info!("==== test suite: {} passed, 0 failed ====", passed);
    } else {
        log::error!("==== test suite: {} passed, {} FAILED ====", passed, failed);
    }
}
