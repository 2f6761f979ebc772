/*
 * RISC-V (RV64GC, S-mode) architecture support.
 *
 * The kernel runs in supervisor mode on top of an SBI firmware (OpenSBI).
 * Each hart keeps its hartid in tp, which is set once in the boot stub and
 * never changed afterwards; cpu-local data is indexed with it.
 */

pub mod trap;

use core::arch::{asm, global_asm};

use crate::sched::context::Context;

// Boot stub: every hart enters here from the SBI firmware with
//   a0 = hartid, a1 = device tree blob (unused by the core)
// We stash the hartid in tp, pick this hart's boot stack and fall into kmain.
global_asm!(
    r#"
    .section .text.entry
    .globl _start
_start:
    mv   tp, a0
    la   sp, BOOT_STACKS
    li   t0, {stack_size}
    addi t1, a0, 1
    mul  t0, t0, t1
    add  sp, sp, t0
    call kmain
1:
    wfi
    j    1b
"#,
    stack_size = const crate::BOOT_STACK_SIZE,
);

// Kernel context switch.
//
//   cswitch(old: *mut Context, new: *const Context)
//
// Saves ra/sp/s0..s11 of the caller into *old and loads the same set from
// *new. Returns on the new context's stack, "returning" to wherever that
// context last called cswitch (or to the thread entry shim for a fresh
// thread).
global_asm!(
    r#"
    .text
    .globl cswitch
cswitch:
    sd ra,   0(a0)
    sd sp,   8(a0)
    sd s0,  16(a0)
    sd s1,  24(a0)
    sd s2,  32(a0)
    sd s3,  40(a0)
    sd s4,  48(a0)
    sd s5,  56(a0)
    sd s6,  64(a0)
    sd s7,  72(a0)
    sd s8,  80(a0)
    sd s9,  88(a0)
    sd s10, 96(a0)
    sd s11, 104(a0)

    ld ra,   0(a1)
    ld sp,   8(a1)
    ld s0,  16(a1)
    ld s1,  24(a1)
    ld s2,  32(a1)
    ld s3,  40(a1)
    ld s4,  48(a1)
    ld s5,  56(a1)
    ld s6,  64(a1)
    ld s7,  72(a1)
    ld s8,  80(a1)
    ld s9,  88(a1)
    ld s10, 96(a1)
    ld s11, 104(a1)
    ret
"#
);

extern "C" {
    pub fn cswitch(old: *mut Context, new: *const Context);
}

/// Hart (CPU) id of the calling hart. Must be called with interrupts
/// disabled if the result is used to index cpu-local data across a
/// potential migration point.
#[inline]
pub fn hartid() -> usize {
    let id: usize;
    unsafe { asm!("mv {}, tp", out(reg) id) };
    id
}

/// Enable supervisor interrupts on this hart.
#[inline]
pub fn intr_on() {
    unsafe { riscv::register::sstatus::set_sie() };
}

/// Disable supervisor interrupts on this hart.
#[inline]
pub fn intr_off() {
    unsafe { riscv::register::sstatus::clear_sie() };
}

/// Are supervisor interrupts currently enabled on this hart?
#[inline]
pub fn intr_get() -> bool {
    riscv::register::sstatus::read().sie()
}

/// Halt until the next interrupt (power saving in the idle loop).
#[inline]
pub fn wfi() {
    riscv::asm::wfi();
}

/// Current timebase counter value (monotonic, shared by all harts).
#[inline]
pub fn time() -> u64 {
    riscv::register::time::read64()
}

/// Program the next timer interrupt for this hart.
#[inline]
pub fn set_timer(stime_value: u64) {
    sbi_rt::set_timer(stime_value);
}

/// Raise a software interrupt on a single target hart.
pub fn ipi_send_hart(hart: usize) {
    sbi_rt::send_ipi(sbi_rt::HartMask::from_mask_base(1 << hart, 0));
}

/// Acknowledge a received software interrupt (clear SSIP).
#[inline]
pub fn clear_soft_intr() {
    unsafe { asm!("csrc sip, {}", in(reg) 1usize << 1) };
}

/// Write one byte to the firmware console.
#[inline]
pub fn console_putchar(c: u8) {
    sbi_rt::legacy::console_putchar(c as usize);
}

/// Release a secondary hart into the kernel entry point via SBI HSM.
pub fn start_hart(hart: usize) -> bool {
    extern "C" {
        fn _start();
    }
    let ret = sbi_rt::hart_start(hart, _start as usize, 0);
    if ret.error != 0 {
        log::debug!("hart {} not started (sbi error {})", hart, ret.error);
        return false;
    }
    true
}

/// Power off the machine (end of kernel self-tests, fatal errors).
pub fn shutdown() -> ! {
    sbi_rt::system_reset(sbi_rt::Shutdown, sbi_rt::NoReason);
    loop {
        wfi();
    }
}
