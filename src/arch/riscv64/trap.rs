/*
 * Supervisor trap entry and decoding.
 *
 * kernelvec is the direct-mode trap vector for traps taken while in the
 * kernel. It spills the caller-saved registers, calls into kerneltrap() and
 * returns with sret. The callee-saved registers survive the handler per the
 * C ABI (and survive an in-handler reschedule via cswitch).
 *
 * sepc/sstatus are captured into locals before dispatch and written back
 * afterwards: a voluntary yield from the tail of the handler lets another
 * thread run, and that thread's own traps clobber the CSRs in between.
 *
 * The user-side trampoline (satp switch, user register spill) is firmware/
 * platform glue outside this core; user traps funnel into crate::trap via
 * the dispatch contract there.
 */

use core::arch::{asm, global_asm};

global_asm!(
    r#"
    .text
    .globl kernelvec
    .align 4
kernelvec:
    addi sp, sp, -144
    sd ra,   0(sp)
    sd gp,   8(sp)
    sd t0,  16(sp)
    sd t1,  24(sp)
    sd t2,  32(sp)
    sd t3,  40(sp)
    sd t4,  48(sp)
    sd t5,  56(sp)
    sd t6,  64(sp)
    sd a0,  72(sp)
    sd a1,  80(sp)
    sd a2,  88(sp)
    sd a3,  96(sp)
    sd a4, 104(sp)
    sd a5, 112(sp)
    sd a6, 120(sp)
    sd a7, 128(sp)

    call kerneltrap

    ld ra,   0(sp)
    ld gp,   8(sp)
    ld t0,  16(sp)
    ld t1,  24(sp)
    ld t2,  32(sp)
    ld t3,  40(sp)
    ld t4,  48(sp)
    ld t5,  56(sp)
    ld t6,  64(sp)
    ld a0,  72(sp)
    ld a1,  80(sp)
    ld a2,  88(sp)
    ld a3,  96(sp)
    ld a4, 104(sp)
    ld a5, 112(sp)
    ld a6, 120(sp)
    ld a7, 128(sp)
    addi sp, sp, 144
    sret
"#
);

extern "C" {
    fn kernelvec();
}

const INTERRUPT_BIT: usize = 1 << 63;
const IRQ_SOFT_S: usize = INTERRUPT_BIT | 1;
const IRQ_TIMER_S: usize = INTERRUPT_BIT | 5;
const IRQ_EXTERNAL_S: usize = INTERRUPT_BIT | 9;

/// qemu-virt timebase runs at 10 MHz; a 100 Hz tick gives 10 ms jiffies.
const TIMEBASE_FREQ: u64 = 10_000_000;
pub const TICK_HZ: u64 = 100;
const TICK_INTERVAL: u64 = TIMEBASE_FREQ / TICK_HZ;

/// Install the trap vector and unmask the supervisor interrupt sources on
/// the calling hart, then arm the first tick.
pub fn init_hart() {
    unsafe {
        riscv::register::stvec::write(kernelvec as usize, riscv::register::stvec::TrapMode::Direct);
        riscv::register::sie::set_ssoft();
        riscv::register::sie::set_stimer();
        riscv::register::sie::set_sext();
    }
    super::set_timer(super::time() + TICK_INTERVAL);
}

#[no_mangle]
extern "C" fn kerneltrap() {
    let sepc: usize;
    let sstatus: usize;
    let scause: usize;
    let stval: usize;
    unsafe {
        asm!("csrr {}, sepc", out(reg) sepc);
        asm!("csrr {}, sstatus", out(reg) sstatus);
        asm!("csrr {}, scause", out(reg) scause);
        asm!("csrr {}, stval", out(reg) stval);
    }

    let cpu = crate::smp::cpu_local();
    cpu.enter_interrupt();

    match scause {
        IRQ_TIMER_S => {
            crate::trap::clock_intr();
            super::set_timer(super::time() + TICK_INTERVAL);
        }
        IRQ_SOFT_S => {
            super::clear_soft_intr();
            crate::smp::ipi::ipi_receive();
        }
        IRQ_EXTERNAL_S => {
            // Device interrupts are PLIC-routed; drivers are outside this
            // core, so just note the event.
            log::trace!("external interrupt on hart {}", super::hartid());
        }
        _ => {
            panic!(
                "kerneltrap: scause={:#x} sepc={:#x} stval={:#x} hart={}",
                scause,
                sepc,
                stval,
                super::hartid()
            );
        }
    }

    cpu.leave_interrupt();

    // Voluntary preemption point: the tick (or a reschedule IPI) may have
    // asked this hart to give up the CPU.
    crate::trap::maybe_preempt();

    unsafe {
        asm!("csrw sepc, {}", in(reg) sepc);
        asm!("csrw sstatus, {}", in(reg) sstatus);
    }
}
