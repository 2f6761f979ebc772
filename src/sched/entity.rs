/*
 * Per-thread scheduling record.
 *
 * Separated from the thread control block so the run-queue layer never
 * touches unrelated thread fields. One-to-one with a thread; the owning
 * thread is recovered with container_of! (the entity is embedded).
 *
 * Locking: `node`, on_rq and the queue-position fields are protected by
 * the owning CPU's rq lock. pi_lock serializes concurrent wakers of the
 * same thread (it protects the sleeping→WAKENING transition, nothing
 * else). pi_lock is acquired before any rq lock.
 */

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU64, AtomicU8, Ordering};

use crate::collections::list::ListNode;
use crate::sched::context::Context;
use crate::sync::RawSpinLock;

/// Scheduling class identifiers (index into the class table).
pub const CLASS_FIFO: u8 = 0;
pub const CLASS_IDLE: u8 = 1;

/// 64 major levels, 4 minor levels each. Numerically lower = higher
/// priority; new threads start in the middle.
pub const PRIORITY_MAINLEVELS: usize = 64;
pub const FIFO_SUBLEVELS: usize = 4;
pub const PRIORITY_LEVELS: i32 = (PRIORITY_MAINLEVELS * FIFO_SUBLEVELS) as i32;
pub const PRIORITY_DEFAULT: i32 = PRIORITY_LEVELS / 2;

/// CPU affinity mask; bit n allows hart n.
pub const AFFINITY_ALL: u64 = u64::MAX;

pub struct SchedEntity {
    /// Run-queue membership node (FIFO sublevel list). rq lock.
    pub node: UnsafeCell<ListNode>,

    /// Scheduling priority (major * 4 + minor).
    pub priority: AtomicI32,

    /// Scheduling class id (CLASS_*).
    pub class: AtomicU8,

    /// Serializes concurrent wakers; taken before any rq lock.
    pub pi_lock: RawSpinLock,

    /// The entity sits on a ready queue.
    pub on_rq: AtomicBool,

    /// The entity is executing on a CPU right now.
    pub on_cpu: AtomicBool,

    /// CPU the entity is (or last was) associated with.
    pub cpu_id: AtomicI32,

    /// Link in a remote CPU's lock-free wake list.
    pub wake_next: AtomicPtr<SchedEntity>,

    /// CPU affinity mask.
    pub affinity: AtomicU64,

    // Runtime accounting (timebase units).
    pub start_time: AtomicU64,
    pub exec_start: AtomicU64,
    pub exec_end: AtomicU64,

    /// Interrupt-enable base carried across cswitch; a property of the
    /// thread, restored into the hart on resume.
    pub saved_intr_base: AtomicBool,

    /// cswitch() here to run the thread. Only touched by the scheduler
    /// with the relevant rq lock held.
    pub context: UnsafeCell<Context>,
}

impl SchedEntity {
    pub fn new(cpu: i32) -> Self {
        SchedEntity {
            node: UnsafeCell::new(ListNode::new()),
            priority: AtomicI32::new(PRIORITY_DEFAULT),
            class: AtomicU8::new(CLASS_FIFO),
            pi_lock: RawSpinLock::new("pi_lock"),
            on_rq: AtomicBool::new(false),
            on_cpu: AtomicBool::new(false),
            cpu_id: AtomicI32::new(cpu),
            wake_next: AtomicPtr::new(core::ptr::null_mut()),
            affinity: AtomicU64::new(AFFINITY_ALL),
            start_time: AtomicU64::new(0),
            exec_start: AtomicU64::new(0),
            exec_end: AtomicU64::new(0),
            saved_intr_base: AtomicBool::new(true),
            context: UnsafeCell::new(Context::zeroed()),
        }
    }

    #[inline]
    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn major(&self) -> usize {
        (self.priority() as usize / FIFO_SUBLEVELS).min(PRIORITY_MAINLEVELS - 1)
    }

    #[inline]
    pub fn minor(&self) -> usize {
        self.priority() as usize % FIFO_SUBLEVELS
    }

    #[inline]
    pub fn cpu(&self) -> usize {
        self.cpu_id.load(Ordering::Acquire) as usize
    }

    /// The thread owning this entity.
    #[inline]
    pub fn thread(&self) -> &crate::proc::thread::Thread {
        unsafe {
            &*container_of!(
                self as *const SchedEntity as *mut SchedEntity,
                crate::proc::thread::Thread,
                se
            )
        }
    }

    /// May this entity run on `cpu`?
    #[inline]
    pub fn allows_cpu(&self, cpu: usize) -> bool {
        self.affinity.load(Ordering::Relaxed) & (1 << cpu) != 0
    }
}
