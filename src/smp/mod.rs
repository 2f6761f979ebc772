/*
 * Per-CPU (per-hart) kernel state.
 *
 * Every hart owns one CpuLocal slot, indexed by hartid. Fields fall into
 * two classes:
 *
 * - owner-only fields (Cell): touched exclusively by the owning hart with
 *   interrupts disabled — spinlock nesting depth, interrupt nesting depth,
 *   the saved pre-push_off interrupt state
 * - cross-CPU fields (atomics): the current-thread pointer, needs_resched,
 *   and the RCU quiescent-state timestamp, which remote harts read during
 *   wakeup target selection and grace-period detection
 */

pub mod atomic;
pub mod ipi;

use core::cell::Cell;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};

use crate::proc::thread::Thread;

/// Maximum number of harts the kernel supports.
pub const NCPU: usize = 8;

pub struct CpuLocal {
    /// Currently running thread on this hart (null before the scheduler
    /// first dispatches).
    current: AtomicPtr<Thread>,

    /// Depth of push_off() nesting. Owner-only in the kernel; atomic so
    /// host unit tests (which share one simulated hart across test
    /// threads) stay data-race free.
    spin_depth: AtomicU32,

    /// Interrupt-enable state at the outermost push_off(). Owner-only.
    intr_base: AtomicBool,

    /// Nesting depth of interrupt handlers. Owner-only.
    in_interrupt: AtomicU32,

    /// Set when this hart should reschedule at the next return from trap.
    needs_resched: AtomicBool,

    /// Timebase value of this hart's last quiescent state (context switch
    /// or idle tick). Read by the RCU grace-period machinery.
    pub rcu_timestamp: AtomicU64,

    /// RCU read-side nesting used before the hart has a current thread.
    boot_rcu_nesting: Cell<i32>,

    /// Thread switched away from, consumed by context_switch_tail on the
    /// other side of cswitch. Owner-only.
    switch_prev: Cell<*mut Thread>,
}

// Owner-only Cells are never touched from another hart; the remaining
// fields are atomics.
unsafe impl Sync for CpuLocal {}

impl CpuLocal {
    const fn new() -> Self {
        CpuLocal {
            current: AtomicPtr::new(ptr::null_mut()),
            spin_depth: AtomicU32::new(0),
            intr_base: AtomicBool::new(false),
            in_interrupt: AtomicU32::new(0),
            needs_resched: AtomicBool::new(false),
            rcu_timestamp: AtomicU64::new(0),
            boot_rcu_nesting: Cell::new(0),
            switch_prev: Cell::new(ptr::null_mut()),
        }
    }

    pub fn current_raw(&self) -> *mut Thread {
        self.current.load(Ordering::Acquire)
    }

    pub fn set_current(&self, p: *mut Thread) {
        self.current.store(p, Ordering::Release);
    }

    pub fn spin_depth(&self) -> u32 {
        self.spin_depth.load(Ordering::Relaxed)
    }

    /// Disable interrupts and bump the nesting counter, remembering the
    /// pre-disable state at the outermost level.
    pub fn push_off(&self) {
        let old = crate::arch::intr_get();
        crate::arch::intr_off();
        if self.spin_depth.load(Ordering::Relaxed) == 0 {
            self.intr_base.store(old, Ordering::Relaxed);
        }
        self.spin_depth.fetch_add(1, Ordering::Relaxed);
    }

    /// Undo one push_off(); restore interrupts only when the counter
    /// reaches zero and they were enabled to begin with.
    pub fn pop_off(&self) {
        // Host unit tests share this hart between test threads, so the
        // interrupt-state invariant only holds on real hardware.
        #[cfg(not(test))]
        assert!(!crate::arch::intr_get(), "pop_off: interruptible");
        let depth = self.spin_depth.fetch_sub(1, Ordering::Relaxed);
        assert!(depth >= 1, "pop_off: unbalanced");
        if depth == 1 && self.intr_base.load(Ordering::Relaxed) {
            crate::arch::intr_on();
        }
    }

    pub fn enter_interrupt(&self) {
        self.in_interrupt.fetch_add(1, Ordering::Relaxed);
    }

    pub fn leave_interrupt(&self) {
        let d = self.in_interrupt.fetch_sub(1, Ordering::Relaxed);
        assert!(d >= 1, "leave_interrupt: unbalanced");
    }

    pub fn in_interrupt(&self) -> bool {
        self.in_interrupt.load(Ordering::Relaxed) > 0
    }

    pub fn set_needs_resched(&self) {
        self.needs_resched.store(true, Ordering::Release);
    }

    pub fn clear_needs_resched(&self) {
        self.needs_resched.store(false, Ordering::Release);
    }

    pub fn needs_resched(&self) -> bool {
        self.needs_resched.load(Ordering::Acquire)
    }

    pub fn boot_rcu_nesting(&self) -> &Cell<i32> {
        &self.boot_rcu_nesting
    }

    /// The interrupt state remembered at the outermost push_off. The
    /// scheduler snapshots this across a context switch because the value
    /// belongs to the thread, not the hart.
    pub fn intr_base_get(&self) -> bool {
        self.intr_base.load(Ordering::Relaxed)
    }

    pub fn intr_base_set(&self, enabled: bool) {
        self.intr_base.store(enabled, Ordering::Relaxed);
    }

    pub fn set_switch_prev(&self, p: *mut Thread) {
        self.switch_prev.set(p);
    }

    pub fn take_switch_prev(&self) -> *mut Thread {
        let p = self.switch_prev.get();
        self.switch_prev.set(ptr::null_mut());
        p
    }
}

static CPUS: [CpuLocal; NCPU] = {
    const SLOT: CpuLocal = CpuLocal::new();
    [SLOT; NCPU]
};

/// This hart's CpuLocal slot. Mutating owner-only fields requires
/// interrupts to be disabled so the hart cannot migrate mid-access.
#[inline]
pub fn cpu_local() -> &'static CpuLocal {
    &CPUS[crate::arch::hartid()]
}

#[inline]
pub fn cpu_by_id(id: usize) -> &'static CpuLocal {
    &CPUS[id]
}

/// The thread running on the calling hart, if the scheduler has dispatched
/// one. The reference is valid for the duration of the thread's execution:
/// a thread structure is only freed through an RCU grace period after the
/// thread can no longer be current anywhere.
#[inline]
pub fn current() -> Option<&'static Thread> {
    let p = cpu_local().current_raw();
    if p.is_null() {
        None
    } else {
        Some(unsafe { &*p })
    }
}

/// Raw current pointer, for identity comparisons.
#[inline]
pub fn current_raw() -> *mut Thread {
    cpu_local().current_raw()
}
