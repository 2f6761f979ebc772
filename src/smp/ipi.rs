/*
 * Inter-processor interrupts.
 *
 * IPIs are delivered as supervisor software interrupts through the SBI IPI
 * extension. Each hart owns a mailbox holding a bitmask of pending reason
 * codes plus a short queue of remote-call requests; the receiving hart
 * drains the mailbox from its software-interrupt handler.
 */

use core::sync::atomic::{AtomicU32, Ordering};

use crate::smp::NCPU;

pub const IPI_REASON_GENERIC: u32 = 0;
pub const IPI_REASON_RESCHEDULE: u32 = 1;
pub const IPI_REASON_CALL_FUNC: u32 = 2;
pub const IPI_REASON_TLB_FLUSH: u32 = 3;

const CALL_QUEUE_DEPTH: usize = 4;

struct IpiMailbox {
    /// Bitmask of pending reason codes (bit n = reason n).
    pending: AtomicU32,
    /// Remote-call requests for IPI_REASON_CALL_FUNC.
    calls: spin::Mutex<heapless::Vec<(fn(usize), usize), CALL_QUEUE_DEPTH>>,
}

impl IpiMailbox {
    const fn new() -> Self {
        IpiMailbox {
            pending: AtomicU32::new(0),
            calls: spin::Mutex::new(heapless::Vec::new()),
        }
    }
}

static MAILBOXES: [IpiMailbox; NCPU] = {
    const SLOT: IpiMailbox = IpiMailbox::new();
    [SLOT; NCPU]
};

/// Send an IPI with the given reason to one hart.
pub fn ipi_send_single(hart: usize, reason: u32) {
    assert!(hart < NCPU, "ipi_send_single: bad hart {}", hart);
    MAILBOXES[hart].pending.fetch_or(1 << reason, Ordering::Release);
    crate::arch::ipi_send_hart(hart);
}

/// Queue a function call on a remote hart and kick it.
/// Returns false if the target's call queue is full.
pub fn ipi_call_single(hart: usize, func: fn(usize), arg: usize) -> bool {
    assert!(hart < NCPU, "ipi_call_single: bad hart {}", hart);
    // The receive side pops from interrupt context; keep interrupts off
    // while the queue lock is held.
    crate::smp::cpu_local().push_off();
    let pushed = MAILBOXES[hart].calls.lock().push((func, arg)).is_ok();
    crate::smp::cpu_local().pop_off();
    if !pushed {
        return false;
    }
    MAILBOXES[hart].pending.fetch_or(1 << IPI_REASON_CALL_FUNC, Ordering::Release);
    crate::arch::ipi_send_hart(hart);
    true
}

/// Send an IPI to every online hart except the caller.
pub fn ipi_send_all_but_self(reason: u32) {
    let me = crate::arch::hartid();
    for hart in 0..crate::online_cpus() {
        if hart != me {
            ipi_send_single(hart, reason);
        }
    }
}

/// Drain this hart's mailbox. Called from the software-interrupt handler.
pub fn ipi_receive() {
    let hart = crate::arch::hartid();
    let mailbox = &MAILBOXES[hart];
    let pending = mailbox.pending.swap(0, Ordering::AcqRel);

    if pending & (1 << IPI_REASON_RESCHEDULE) != 0 {
        crate::smp::cpu_local().set_needs_resched();
    }
    if pending & (1 << IPI_REASON_CALL_FUNC) != 0 {
        loop {
            let call = mailbox.calls.lock().pop();
            match call {
                Some((func, arg)) => func(arg),
                None => break,
            }
        }
    }
    if pending & (1 << IPI_REASON_TLB_FLUSH) != 0 {
        // Address-space management is outside this core; the MMU layer
        // hooks this reason when present.
        log::trace!("tlb-flush ipi on hart {}", hart);
    }
    // IPI_REASON_GENERIC needs no action beyond the wakeup itself.
}
