/*
 * Architecture Layer
 *
 * The kernel targets RISC-V (Sv-less, machine-mode firmware via SBI). All
 * architecture contact points are funneled through this module:
 *
 * - hart identification (hartid lives in tp, xv6-style)
 * - interrupt enable/disable/query
 * - timebase access and timer programming
 * - inter-hart software interrupts
 * - the kernel context switch (callee-saved register swap)
 * - trap vector installation and decoding
 *
 * On non-RISC-V build hosts a tiny single-hart shim stands in so that the
 * architecture-independent modules (lists, trees, signal masks, rwlock state
 * machine, RCU segment lists) can be compiled and unit tested.
 */

#[cfg(target_arch = "riscv64")]
pub mod riscv64;
#[cfg(target_arch = "riscv64")]
pub use riscv64 as imp;

#[cfg(not(target_arch = "riscv64"))]
pub mod host;
#[cfg(not(target_arch = "riscv64"))]
pub use host as imp;

pub use imp::{
    console_putchar, cswitch, hartid, intr_get, intr_off, intr_on, ipi_send_hart, set_timer,
    shutdown, time, wfi,
};
