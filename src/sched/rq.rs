/*
 * Per-CPU run queues.
 *
 * Each hart owns an RqPercpu: 64 priority-major FIFO queues (4 minor
 * sublevels each), two bitmasks for O(1) highest-ready lookup, the idle
 * slot, a lock-free MPSC wake list for cross-CPU wakeups, and the pointer
 * to the entity currently on the CPU.
 *
 * ready_mask groups the 64 major levels into 8 groups of 8; the secondary
 * mask carries one bit per major level. Lookup is two trailing-zeros.
 *
 * Everything except the wake list and current_se is protected by the
 * per-CPU rq lock. Remote harts push wakeups onto the wake list with a
 * CAS loop; only the owning hart pops (and it takes the whole list at
 * once), so the ABA-prone pop never races a concurrent pop.
 */

use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::collections::list::{self, ListNode};
use crate::sched::entity::{SchedEntity, FIFO_SUBLEVELS, PRIORITY_MAINLEVELS};
use crate::smp::NCPU;
use crate::sync::RawSpinLock;

pub struct FifoRq {
    pub subqueues: [ListNode; FIFO_SUBLEVELS],
    pub counts: [i32; FIFO_SUBLEVELS],
    /// Bitmask of non-empty sublevels.
    pub ready_mask: u8,
    pub task_count: i32,
}

impl FifoRq {
    const fn new() -> Self {
        const EMPTY: ListNode = ListNode::new();
        FifoRq {
            subqueues: [EMPTY; FIFO_SUBLEVELS],
            counts: [0; FIFO_SUBLEVELS],
            ready_mask: 0,
            task_count: 0,
        }
    }
}

/// Idle slot: the per-CPU idle thread's entity, never on a FIFO queue.
pub struct IdleRq {
    pub idle_se: *mut SchedEntity,
}

/// Lock-protected portion of a per-CPU run queue.
pub struct RqData {
    pub fifo: [FifoRq; PRIORITY_MAINLEVELS],
    pub idle: IdleRq,
    /// Top-level ready mask: bit g = some major level in group g is ready.
    pub ready_mask: u64,
    /// Secondary mask: bit m = major level m has a ready entity.
    pub ready_mask_secondary: u64,
    /// Ticks left in the running entity's slice.
    pub slice_remaining: u32,
    pub task_count: i32,
    pub switch_count: u64,
}

impl RqData {
    const fn new() -> Self {
        const LEVEL: FifoRq = FifoRq::new();
        RqData {
            fifo: [LEVEL; PRIORITY_MAINLEVELS],
            idle: IdleRq {
                idle_se: ptr::null_mut(),
            },
            ready_mask: 0,
            ready_mask_secondary: 0,
            slice_remaining: 0,
            task_count: 0,
            switch_count: 0,
        }
    }

    pub fn mark_major_ready(&mut self, major: usize) {
        self.ready_mask_secondary |= 1 << major;
        self.ready_mask |= 1 << (major / 8);
    }

    pub fn mark_major_idle(&mut self, major: usize) {
        self.ready_mask_secondary &= !(1 << major);
        let group = major / 8;
        if self.ready_mask_secondary & (0xffu64 << (group * 8)) == 0 {
            self.ready_mask &= !(1 << group);
        }
    }

    /// Highest-ready major level, or None when every FIFO level is empty.
    pub fn highest_ready(&self) -> Option<usize> {
        if self.ready_mask == 0 {
            return None;
        }
        let group = self.ready_mask.trailing_zeros() as usize;
        let bits = (self.ready_mask_secondary >> (group * 8)) & 0xff;
        debug_assert!(bits != 0, "rq masks out of sync");
        Some(group * 8 + bits.trailing_zeros() as usize)
    }
}

pub struct RqPercpu {
    pub cpu_id: usize,
    pub lock: RawSpinLock,
    data: UnsafeCell<RqData>,
    /// MPSC stack of remotely-woken entities, drained by the owner.
    wake_list: AtomicPtr<SchedEntity>,
    current_se: AtomicPtr<SchedEntity>,
    /// Hart has finished scheduler bring-up.
    pub online: AtomicBool,
}

unsafe impl Sync for RqPercpu {}

impl RqPercpu {
    const fn new(cpu_id: usize) -> Self {
        RqPercpu {
            cpu_id,
            lock: RawSpinLock::new("rq_lock"),
            data: UnsafeCell::new(RqData::new()),
            wake_list: AtomicPtr::new(ptr::null_mut()),
            current_se: AtomicPtr::new(ptr::null_mut()),
            online: AtomicBool::new(false),
        }
    }

    /// Self-link the FIFO list heads. Once, at boot, before any enqueue.
    pub fn init(&self) {
        let data = self.data.get();
        unsafe {
            for level in (*data).fifo.iter_mut() {
                for head in level.subqueues.iter_mut() {
                    list::init(head);
                }
            }
        }
    }

    /// Access the lock-protected data.
    ///
    /// # Safety
    /// Caller must hold this rq's lock.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data(&self) -> &mut RqData {
        &mut *self.data.get()
    }

    pub fn current_se(&self) -> *mut SchedEntity {
        self.current_se.load(Ordering::Acquire)
    }

    pub fn set_current_se(&self, se: *mut SchedEntity) {
        self.current_se.store(se, Ordering::Release);
    }

    /// Push a woken entity from any hart. Lock-free.
    pub fn wake_list_push(&self, se: &SchedEntity) {
        let se_ptr = se as *const SchedEntity as *mut SchedEntity;
        let mut head = self.wake_list.load(Ordering::Acquire);
        loop {
            se.wake_next.store(head, Ordering::Relaxed);
            match self.wake_list.compare_exchange_weak(
                head,
                se_ptr,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(cur) => head = cur,
            }
        }
    }

    /// Take the entire wake list. Owner-only.
    pub fn wake_list_take(&self) -> *mut SchedEntity {
        self.wake_list.swap(ptr::null_mut(), Ordering::AcqRel)
    }
}

// The hand-expanded array below tracks NCPU.
const _: () = assert!(NCPU == 8);

static RQS: [RqPercpu; NCPU] = {
    // Indexed construction needs a loop; expand the fixed-size array by
    // hand instead of a const fn returning non-Copy data.
    [
        RqPercpu::new(0),
        RqPercpu::new(1),
        RqPercpu::new(2),
        RqPercpu::new(3),
        RqPercpu::new(4),
        RqPercpu::new(5),
        RqPercpu::new(6),
        RqPercpu::new(7),
    ]
};

pub fn rq_of(cpu: usize) -> &'static RqPercpu {
    &RQS[cpu]
}

pub fn this_rq() -> &'static RqPercpu {
    &RQS[crate::arch::hartid()]
}
