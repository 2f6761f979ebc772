/*
 * oxhart kernel entry point.
 *
 * A small SMP Unix-like kernel for RISC-V virtual machines in the xv6
 * lineage: priority run queues with pluggable scheduling classes,
 * preemptible RCU, POSIX thread groups and signals, and the blocking
 * primitives built on thread queues.
 *
 * Boot flow: every hart enters _start (arch/riscv64), picks its boot
 * stack and calls kmain. Hart 0 initializes the kernel, starts the
 * secondary harts through SBI HSM, spawns the init kernel thread and
 * becomes its own idle thread; secondaries wait for the release flag and
 * do the same minus the global init.
 */

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]
#![allow(dead_code)]

extern crate alloc;

#[macro_use]
mod collections;

mod arch;
mod errno;
mod mm;
mod proc;
mod rcu;
mod sched;
mod signal;
mod smp;
mod sync;
mod syscall;
mod tests;
mod trap;
mod utils;
mod workqueue;

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Per-hart boot stack size. Referenced from the entry assembly.
pub const BOOT_STACK_SIZE: usize = 64 * 1024;

#[no_mangle]
static mut BOOT_STACKS: [u8; BOOT_STACK_SIZE * smp::NCPU] = [0; BOOT_STACK_SIZE * smp::NCPU];

/// Secondary harts spin on this until hart 0 finishes global init.
static SECONDARIES_GO: AtomicBool = AtomicBool::new(false);
static ONLINE_CPUS: AtomicUsize = AtomicUsize::new(0);

/// Number of harts that completed scheduler bring-up.
pub fn online_cpus() -> usize {
    ONLINE_CPUS.load(Ordering::Acquire).max(1)
}

#[no_mangle]
pub extern "C" fn kmain(hartid: usize) -> ! {
    if hartid == 0 {
        boot_hart();
    } else {
        while !SECONDARIES_GO.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
        secondary_hart(hartid);
    }

    ONLINE_CPUS.fetch_add(1, Ordering::SeqCst);
    arch::intr_on();
    sched::idle_loop();
}

fn boot_hart() {
    utils::logger::init();
    log::info!("oxhart kernel starting on hart 0");

    mm::heap::init();
    proc::table::table_init();
    proc::tq::chan_table_init();
    utils::timer::timer_init();
    sched::scheduler_init();

    #[cfg(target_arch = "riscv64")]
    arch::riscv64::trap::init_hart();

    sched::idle_thread_init();
    rcu::rcu_init();

    // Spawn init before the secondaries come up so orphan adoption works
    // from the first exit.
    proc::clone::kthread_create("init", init_thread_main, 0, 0)
        .expect("failed to create init thread");

    // Bring the remaining harts online through SBI HSM.
    #[cfg(target_arch = "riscv64")]
    {
        for hart in 1..smp::NCPU {
            arch::riscv64::start_hart(hart);
        }
    }
    SECONDARIES_GO.store(true, Ordering::Release);

    log::info!("kernel initialization complete");
}

fn secondary_hart(hartid: usize) {
    #[cfg(target_arch = "riscv64")]
    arch::riscv64::trap::init_hart();
    sched::idle_thread_init();
    log::info!("hart {} online", hartid);
}

/// Init: adopts orphans and reaps them forever. Runs the in-kernel test
/// suite once at boot before settling into the reap loop.
fn init_thread_main(_a0: usize, _a1: usize) {
    let me = smp::current().expect("init without identity");
    proc::lifecycle::set_init_thread(me);
    log::info!("init thread running as pid {}", me.pid);

    tests::run_all();

    // Bring up the shared deferred-work pool now that the suite's
    // child-accounting checks are done.
    let _ = workqueue::system_wq();

    loop {
        match proc::lifecycle::wait() {
            Ok((pid, status)) => {
                log::debug!("init reaped pid {} (status {})", pid, status);
            }
            Err(_) => {
                // No children right now; sleep until some orphan arrives.
                let _ = utils::timer::sleep_ms(1000);
            }
        }
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    arch::intr_off();
    if let Some(location) = info.location() {
        log::error!(
            "KERNEL PANIC at {}:{}: {}",
            location.file(),
            location.line(),
            info.message()
        );
    } else {
        log::error!("KERNEL PANIC: {}", info.message());
    }
    loop {
        arch::wfi();
    }
}
