/*
 * Architecture-independent trap dispatch.
 *
 * The arch layer decodes scause and funnels here: timer ticks drive the
 * jiffies clock, the scheduler tick and the RCU state machine; software
 * interrupts were already routed to the IPI mailbox; syscalls and the
 * return-to-user path come through the user-trap contract functions.
 *
 * The user-side trampoline (register spill, satp switch) is out-of-scope
 * platform glue; it is expected to call user_trap() with the thread's
 * trapframe filled in and to jump back through the sepc/registers the
 * trapframe holds after user_trap_return().
 */

use crate::signal;
use crate::smp;

/// Saved user register state plus the kernel re-entry fields consumed by
/// the trampoline. Fixed layout; the trampoline addresses fields by
/// offset.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct UTrapFrame {
    pub kernel_satp: u64,
    pub kernel_sp: u64,
    pub kernel_trap: u64,
    pub kernel_hartid: u64,
    pub kernel_gp: u64,
    pub irq_sp: u64,
    pub irq_entry: u64,

    pub ra: u64,
    pub sp: u64,
    pub gp: u64,
    pub tp: u64,
    pub t: [u64; 7],
    pub s: [u64; 12],
    pub a: [u64; 8],
    pub sepc: u64,
    pub sstatus: u64,
    pub scause: u64,
    pub stval: u64,
}

impl UTrapFrame {
    pub const fn zeroed() -> Self {
        UTrapFrame {
            kernel_satp: 0,
            kernel_sp: 0,
            kernel_trap: 0,
            kernel_hartid: 0,
            kernel_gp: 0,
            irq_sp: 0,
            irq_entry: 0,
            ra: 0,
            sp: 0,
            gp: 0,
            tp: 0,
            t: [0; 7],
            s: [0; 12],
            a: [0; 8],
            sepc: 0,
            sstatus: 0,
            scause: 0,
            stval: 0,
        }
    }
}

/// Timer interrupt body: advance the clock and the per-CPU scheduler and
/// RCU ticks. Runs with interrupts disabled, in interrupt context.
pub fn clock_intr() {
    crate::utils::timer::on_tick();
    crate::sched::sched_timer_tick();
    crate::rcu::rcu_tick();
}

/// Called at the tail of every trap handler, out of interrupt context:
/// if this hart was asked to reschedule and the interrupted code can
/// tolerate it (thread context, no spinlocks held), yield now.
pub fn maybe_preempt() {
    let cpu = smp::cpu_local();
    if !cpu.needs_resched() || cpu.in_interrupt() || cpu.spin_depth() > 0 {
        return;
    }
    if smp::current().is_none() {
        return;
    }
    crate::sched::scheduler_yield();
}

/// Environment call from user space: dispatch the syscall held in the
/// trapframe (number in a7, arguments in a0..a5, result to a0).
pub fn user_trap_syscall(tf: &mut UTrapFrame) {
    // sepc points at the ecall; step past it before anything can sleep.
    tf.sepc += 4;
    crate::arch::intr_on();
    let ret = crate::syscall::dispatch(tf);
    tf.a[0] = ret as u64;
}

/// Return-to-user processing: deliver pending signals, honor a
/// reschedule request. The trampoline invokes this last, then restores
/// user registers from the trapframe.
pub fn user_trap_return() {
    let p = match smp::current() {
        Some(p) => p,
        None => return,
    };
    if signal::signal_pending(p) || p.killed() {
        signal::handle_signal();
        // Drop a stale SIGPENDING flag once everything deliverable has
        // been consumed.
        signal::recalc_sigpending();
    }
    maybe_preempt();
}
