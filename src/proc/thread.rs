/*
 * Thread control block.
 *
 * The thread is the atomic unit of execution: one kernel stack, one
 * scheduling entity, one per-thread signal state, and a pointer to the
 * thread group (POSIX process) it belongs to. Identified by a unique pid
 * (the POSIX TID); getpid() reports the group's tgid.
 *
 * Locking summary:
 * - state transitions take tcb_lock, usually together with the relevant
 *   queue lock (rq or wait queue); reads are lock-free atomics
 * - flags are atomic bit operations, no lock
 * - family-tree fields (parent, children, siblings, tg_entry,
 *   proctab_entry) are protected by the global pid_lock rwlock
 * - signal state is protected by the sigacts lock
 * - sched entity fields follow the rq/pi locking in sched/entity.rs
 *
 * Lock ordering: pid_lock > sigacts.lock > tcb_lock.
 *
 * A Thread is heap-allocated; the table and queues reference it by raw
 * pointer. It is freed through an RCU grace period after removal from the
 * pid table, so RCU readers never observe freed memory.
 */

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicI32, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use crate::collections::list::{self, ListNode};
use crate::mm::vm::Vm;
use crate::proc::thread_group::ThreadGroup;
use crate::rcu::RcuHead;
use crate::sched::entity::SchedEntity;
use crate::signal::sigacts::Sigacts;
use crate::signal::types::{PendingQueue, SigStack};
use crate::sync::{Completion, RawSpinLock};
use crate::trap::UTrapFrame;

pub type Pid = i32;

/// Default kernel stack: 16 KiB.
pub const KSTACK_SIZE: usize = 16 * 1024;

#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Unused = 0,
    Used,
    Interruptible,
    Killable,
    Timer,
    KillableTimer,
    Uninterruptible,
    Wakening,
    Running,
    Stopped,
    Exiting,
    Zombie,
}

impl ThreadState {
    pub fn from_usize(v: usize) -> ThreadState {
        match v {
            0 => ThreadState::Unused,
            1 => ThreadState::Used,
            2 => ThreadState::Interruptible,
            3 => ThreadState::Killable,
            4 => ThreadState::Timer,
            5 => ThreadState::KillableTimer,
            6 => ThreadState::Uninterruptible,
            7 => ThreadState::Wakening,
            8 => ThreadState::Running,
            9 => ThreadState::Stopped,
            10 => ThreadState::Exiting,
            11 => ThreadState::Zombie,
            _ => panic!("bad thread state {}", v),
        }
    }

    pub fn is_sleeping(self) -> bool {
        matches!(
            self,
            ThreadState::Interruptible
                | ThreadState::Uninterruptible
                | ThreadState::Killable
                | ThreadState::Timer
                | ThreadState::KillableTimer
        )
    }

    pub fn is_killable(self) -> bool {
        matches!(
            self,
            ThreadState::Killable | ThreadState::KillableTimer | ThreadState::Interruptible
        )
    }

    pub fn is_timer(self) -> bool {
        matches!(
            self,
            ThreadState::Timer | ThreadState::KillableTimer | ThreadState::Interruptible
        )
    }

    pub fn is_awoken(self) -> bool {
        matches!(self, ThreadState::Running | ThreadState::Wakening)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ThreadState::Unused => "unused",
            ThreadState::Used => "used",
            ThreadState::Interruptible => "interruptible",
            ThreadState::Killable => "killable",
            ThreadState::Timer => "timer",
            ThreadState::KillableTimer => "killable_timer",
            ThreadState::Uninterruptible => "uninterruptible",
            ThreadState::Wakening => "wakening",
            ThreadState::Running => "running",
            ThreadState::Stopped => "stopped",
            ThreadState::Exiting => "exiting",
            ThreadState::Zombie => "zombie",
        }
    }
}

pub const FLAG_VALID: u64 = 1 << 1;
/// Thread must exit at its next safe point. Orthogonal to state.
pub const FLAG_KILLED: u64 = 1 << 2;
/// Sleeping on a channel (sleep_on_chan).
pub const FLAG_ONCHAN: u64 = 1 << 3;
/// An unmasked signal is deliverable; tested on return to user space.
pub const FLAG_SIGPENDING: u64 = 1 << 4;
/// The thread has a user address space.
pub const FLAG_USER_SPACE: u64 = 1 << 5;
/// Non-leader CLONE_THREAD member: cleans itself up on exit instead of
/// becoming a zombie.
pub const FLAG_SELF_REAP: u64 = 1 << 6;

/// Per-thread signal state. Mutated under the sigacts lock.
pub struct ThreadSignal {
    pub pending: PendingQueue,
    /// User address of the live ucontext chain head (0 = none).
    pub sig_ucontext: AtomicU64,
    pub sig_stack: UnsafeCell<SigStack>,
    /// Signal delivered to the parent on exit (0 = none).
    pub esignal: AtomicI32,
}

impl ThreadSignal {
    pub fn new() -> Self {
        ThreadSignal {
            pending: PendingQueue::new(),
            sig_ucontext: AtomicU64::new(0),
            sig_stack: UnsafeCell::new(SigStack::disabled()),
            esignal: AtomicI32::new(0),
        }
    }
}

pub struct Thread {
    pub tcb_lock: RawSpinLock,

    state: AtomicUsize,
    flags: AtomicU64,
    pub se: SchedEntity,
    /// Channel this thread sleeps on (0 = none); see sleep_on_chan.
    pub chan: AtomicUsize,

    pub pid: Pid,
    tgid: AtomicI32,
    pub name: heapless::String<16>,

    /// Flags the thread was created with (CloneFlags bits).
    pub clone_flags: u64,
    /// Kernel-thread entry point and its arguments.
    pub kentry: Option<fn(usize, usize)>,
    pub karg: [usize; 2],

    /// Kernel stack (base address, heap-allocated).
    pub kstack: usize,
    pub kstack_size: usize,

    /// Saved user registers; present only for user threads.
    pub trapframe: UnsafeCell<Option<Box<UTrapFrame>>>,
    pub vm: UnsafeCell<Option<Arc<Vm>>>,
    pub fs: UnsafeCell<Option<Arc<crate::proc::FsStruct>>>,
    pub fdtable: UnsafeCell<Option<Arc<crate::proc::FdTable>>>,
    pub sigacts: UnsafeCell<Option<Arc<Sigacts>>>,
    pub signal: ThreadSignal,
    pub thread_group: UnsafeCell<Option<Arc<ThreadGroup>>>,

    /// Nested rcu_read_lock() count; travels with the thread across
    /// migration and yields.
    pub rcu_read_lock_nesting: AtomicI32,

    // Family tree, under pid_lock.
    pub parent: AtomicPtr<Thread>,
    pub children: UnsafeCell<ListNode>,
    pub siblings: UnsafeCell<ListNode>,
    pub children_count: AtomicI32,
    /// Exit status reported to the parent's wait().
    pub xstate: AtomicI32,
    /// Membership in thread_group.thread_list.
    pub tg_entry: UnsafeCell<ListNode>,
    /// Chain in the pid hash table.
    pub proctab_entry: UnsafeCell<ListNode>,

    /// Parent blocked in vfork waits here until exec or exit.
    pub vfork_done: Completion,
    /// Set when this thread's parent vforked it.
    pub vfork_parent: AtomicPtr<Thread>,

    /// Serializes this thread's wait(2) against child exits; the sleep
    /// itself parks on the channel keyed by this thread's address.
    pub child_wait_lock: RawSpinLock,

    /// User address zeroed at exit (CLONE_CHILD_CLEARTID).
    pub clear_child_tid: AtomicU64,

    /// Work queue this thread serves (workers only).
    pub wq: AtomicPtr<crate::workqueue::WorkQueue>,

    /// Deferred-free callback head; must stay valid until the RCU
    /// callback runs.
    pub rcu_head: UnsafeCell<RcuHead>,
}

// Interior mutability is governed by the locks documented above.
unsafe impl Sync for Thread {}
unsafe impl Send for Thread {}

impl Thread {
    pub fn new(name: &str, pid: Pid, kstack: usize, kstack_size: usize) -> Box<Thread> {
        let mut tname = heapless::String::new();
        let _ = tname.push_str(&name[..name.len().min(15)]);
        let t = Box::new(Thread {
            tcb_lock: RawSpinLock::new("tcb_lock"),
            state: AtomicUsize::new(ThreadState::Used as usize),
            flags: AtomicU64::new(FLAG_VALID),
            se: SchedEntity::new(crate::arch::hartid() as i32),
            chan: AtomicUsize::new(0),
            pid,
            tgid: AtomicI32::new(pid),
            name: tname,
            clone_flags: 0,
            kentry: None,
            karg: [0; 2],
            kstack,
            kstack_size,
            trapframe: UnsafeCell::new(None),
            vm: UnsafeCell::new(None),
            fs: UnsafeCell::new(None),
            fdtable: UnsafeCell::new(None),
            sigacts: UnsafeCell::new(None),
            signal: ThreadSignal::new(),
            thread_group: UnsafeCell::new(None),
            rcu_read_lock_nesting: AtomicI32::new(0),
            parent: AtomicPtr::new(core::ptr::null_mut()),
            children: UnsafeCell::new(ListNode::new()),
            siblings: UnsafeCell::new(ListNode::new()),
            children_count: AtomicI32::new(0),
            xstate: AtomicI32::new(0),
            tg_entry: UnsafeCell::new(ListNode::new()),
            proctab_entry: UnsafeCell::new(ListNode::new()),
            vfork_done: Completion::new("vfork_done"),
            vfork_parent: AtomicPtr::new(core::ptr::null_mut()),
            child_wait_lock: RawSpinLock::new("child_wait"),
            clear_child_tid: AtomicU64::new(0),
            wq: AtomicPtr::new(core::ptr::null_mut()),
            rcu_head: UnsafeCell::new(RcuHead::new()),
        });
        t.init_links();
        t
    }

    /// Self-link every embedded list node. Runs once, right after the
    /// control block lands at its final heap address.
    fn init_links(&self) {
        unsafe {
            list::init(self.children.get());
            list::init(self.siblings.get());
            list::init(self.tg_entry.get());
            list::init(self.proctab_entry.get());
            list::init(self.se.node.get());
        }
        self.signal.pending.init();
        self.vfork_done.init();
    }

    #[inline]
    pub fn state(&self) -> ThreadState {
        ThreadState::from_usize(self.state.load(Ordering::SeqCst))
    }

    /// Raw state store. Transitions generally require tcb_lock plus the
    /// owning queue's lock; the helpers in sched/ wrap the common ones.
    #[inline]
    pub fn set_state(&self, s: ThreadState) {
        self.state.store(s as usize, Ordering::SeqCst);
    }

    /// Compare-and-swap on the state word, for transitions that must not
    /// clobber a concurrent one (sleep vs wake).
    #[inline]
    pub fn state_cas(&self, old: ThreadState, new: ThreadState) -> bool {
        self.state
            .compare_exchange(old as usize, new as usize, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    #[inline]
    pub fn flags(&self) -> u64 {
        self.flags.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn has_flag(&self, flag: u64) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    #[inline]
    pub fn set_flag(&self, flag: u64) {
        self.flags.fetch_or(flag, Ordering::SeqCst);
    }

    #[inline]
    pub fn clear_flag(&self, flag: u64) {
        self.flags.fetch_and(!flag, Ordering::SeqCst);
    }

    #[inline]
    pub fn killed(&self) -> bool {
        self.has_flag(FLAG_KILLED)
    }

    #[inline]
    pub fn is_user(&self) -> bool {
        self.has_flag(FLAG_USER_SPACE)
    }

    /// The thread-group id (POSIX pid). Falls back to the thread's own
    /// pid when it has no group yet.
    pub fn tgid(&self) -> Pid {
        let tg = self.tgid.load(Ordering::Acquire);
        if tg > 0 {
            tg
        } else {
            self.pid
        }
    }

    pub fn set_tgid(&self, tgid: Pid) {
        self.tgid.store(tgid, Ordering::Release);
    }

    pub fn sigacts_clone(&self) -> Option<Arc<Sigacts>> {
        unsafe { (*self.sigacts.get()).clone() }
    }

    pub fn group_clone(&self) -> Option<Arc<ThreadGroup>> {
        unsafe { (*self.thread_group.get()).clone() }
    }

    pub fn vm_clone(&self) -> Option<Arc<Vm>> {
        unsafe { (*self.vm.get()).clone() }
    }

    pub fn is_group_leader(&self) -> bool {
        match self.group_clone() {
            Some(tg) => core::ptr::eq(tg.leader(), self),
            None => true,
        }
    }

    pub fn tcb_lock(&self) {
        self.tcb_lock.lock();
    }

    pub fn tcb_unlock(&self) {
        self.tcb_lock.unlock();
    }

    pub fn assert_tcb_holding(&self) {
        self.tcb_lock.assert_holding();
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("pid", &self.pid)
            .field("tgid", &self.tgid())
            .field("name", &self.name.as_str())
            .field("state", &self.state().as_str())
            .finish()
    }
}
