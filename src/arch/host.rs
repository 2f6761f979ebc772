/*
 * Host shim for non-RISC-V builds.
 *
 * Presents a single simulated hart so the architecture-independent modules
 * compile and unit test on the build host. The context switch is
 * unreachable here: host unit tests only exercise the pure data structures
 * and state machines, never a real reschedule.
 */

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::sched::context::Context;

static INTR_ENABLED: AtomicBool = AtomicBool::new(false);
static FAKE_TIME: AtomicU64 = AtomicU64::new(0);

pub fn hartid() -> usize {
    0
}

pub fn intr_on() {
    INTR_ENABLED.store(true, Ordering::SeqCst);
}

pub fn intr_off() {
    INTR_ENABLED.store(false, Ordering::SeqCst);
}

pub fn intr_get() -> bool {
    INTR_ENABLED.load(Ordering::SeqCst)
}

pub fn wfi() {}

pub fn time() -> u64 {
    // Monotonic fake timebase; advances on every read.
    FAKE_TIME.fetch_add(1, Ordering::Relaxed) + 1
}

pub fn set_timer(_stime_value: u64) {}

pub fn ipi_send_hart(_hart: usize) {}

pub fn console_putchar(_c: u8) {}

/// # Safety
/// Never called on the host; present only to satisfy the arch contract.
pub unsafe fn cswitch(_old: *mut Context, _new: *const Context) {
    unreachable!("cswitch is not available on the build host");
}

pub fn shutdown() -> ! {
    panic!("shutdown on host");
}
