/*
 * Thread groups: the kernel's POSIX "process".
 *
 * Every thread created with CLONE_THREAD shares its parent's group (same
 * tgid); fork creates a fresh group of one. The group leader is the first
 * thread; its pid is the tgid, and only the leader becomes a zombie
 * visible to the parent's wait().
 *
 * Process-directed signals (kill) land in the group's shared pending
 * queue and are handled by one eligible member; SIGCONT wakes every
 * stopped member; SIGKILL bypasses the queues and force-kills everyone.
 *
 * Locking: membership (thread_list, leader) is protected by the global
 * pid_lock; shared pending state is serialized by the sigacts lock that
 * all members share via CLONE_SIGHAND. Lifetime is the Arc held by each
 * member thread.
 *
 * Lock ordering: pid_lock > sigacts.lock > tcb_lock.
 */

use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicI32, AtomicPtr, Ordering};

use crate::collections::list::{self, ListNode};
use crate::errno::{EINVAL, ESRCH};
use crate::proc::table;
use crate::proc::thread::{Pid, Thread, ThreadState, FLAG_KILLED, FLAG_SIGPENDING};
use crate::sched;
use crate::signal::types::{sig_bad, KSigInfo, PendingQueue, SigInfo, SIGKILL};
use crate::smp;

pub struct ThreadGroup {
    tgid: AtomicI32,
    group_leader: AtomicPtr<Thread>,
    /// Member threads, linked through Thread::tg_entry. pid_lock.
    pub thread_list: UnsafeCell<ListNode>,
    /// Live (non-exited) members.
    pub live_threads: AtomicI32,
    /// Process-directed pending signals; serialized by the shared sigacts
    /// lock.
    pub shared_pending: PendingQueue,

    /// Non-zero once exit_group() ran; only the first caller wins.
    pub group_exit: AtomicI32,
    pub group_exit_code: AtomicI32,

    // Group-stop bookkeeping (SIGSTOP to the process).
    pub group_stop_count: AtomicI32,
    pub group_stop_signo: AtomicI32,
}

unsafe impl Sync for ThreadGroup {}
unsafe impl Send for ThreadGroup {}

impl ThreadGroup {
    /// Fresh group with `leader` as its only member. The leader's pid
    /// becomes the tgid.
    pub fn new_for(leader: &Thread) -> Arc<ThreadGroup> {
        let tg = Arc::new(ThreadGroup {
            tgid: AtomicI32::new(leader.pid),
            group_leader: AtomicPtr::new(leader as *const Thread as *mut Thread),
            thread_list: UnsafeCell::new(ListNode::new()),
            live_threads: AtomicI32::new(1),
            shared_pending: PendingQueue::new(),
            group_exit: AtomicI32::new(0),
            group_exit_code: AtomicI32::new(0),
            group_stop_count: AtomicI32::new(0),
            group_stop_signo: AtomicI32::new(0),
        });
        unsafe {
            list::init(tg.thread_list.get());
            list::push_back(tg.thread_list.get(), leader.tg_entry.get());
        }
        tg.shared_pending.init();
        leader.set_tgid(leader.pid);
        tg
    }

    pub fn tgid(&self) -> Pid {
        self.tgid.load(Ordering::Acquire)
    }

    pub fn leader(&self) -> &Thread {
        unsafe { &*self.group_leader.load(Ordering::Acquire) }
    }

    /// Add a CLONE_THREAD child.
    ///
    /// # Safety
    /// Caller holds pid_wlock.
    pub unsafe fn add(self: &Arc<Self>, child: &Thread) {
        table::pid_assert_wholding();
        list::push_back(self.thread_list.get(), child.tg_entry.get());
        self.live_threads.fetch_add(1, Ordering::SeqCst);
        child.set_tgid(self.tgid());
        *child.thread_group.get() = Some(Arc::clone(self));
    }

    /// Remove an exiting member; returns true when it was the last one.
    /// The member's Arc reference stays in place (the zombie leader still
    /// needs the group for wait()); thread_destroy drops it.
    ///
    /// # Safety
    /// Caller holds pid_wlock.
    pub unsafe fn remove(&self, p: &Thread) -> bool {
        table::pid_assert_wholding();
        if !list::is_detached(p.tg_entry.get()) {
            list::detach(p.tg_entry.get());
        }
        self.live_threads.fetch_sub(1, Ordering::SeqCst) <= 1
    }

    /// Run `f` over every member.
    ///
    /// # Safety
    /// Caller holds pid_rlock or pid_wlock.
    pub unsafe fn for_each_member<F: FnMut(&Thread)>(&self, mut f: F) {
        for entry in list::iter(self.thread_list.get()) {
            let t = &*container_of!(entry, Thread, tg_entry);
            f(t);
        }
    }

}

/// Pick the member that should field a process-directed signal: the
/// leader if it doesn't block it, otherwise any member that doesn't,
/// otherwise the leader (it stays pending until unmasked).
///
/// # Safety
/// Caller holds pid_rlock.
unsafe fn pick_delivery_thread(tg: &ThreadGroup, signo: i32) -> Option<&Thread> {
    let leader = tg.leader();
    let leader_ok = match leader.sigacts_clone() {
        Some(sa) => {
            let state = leader.state();
            !sa.blocked_snapshot().contains(signo)
                && state != ThreadState::Zombie
                && state != ThreadState::Unused
        }
        None => false,
    };
    if leader_ok {
        return Some(leader);
    }

    let mut found: *const Thread = core::ptr::null();
    tg.for_each_member(|t| {
        if !found.is_null() || core::ptr::eq(t, leader) {
            return;
        }
        let state = t.state();
        if state == ThreadState::Unused || state == ThreadState::Zombie {
            return;
        }
        if let Some(sa) = t.sigacts_clone() {
            if !sa.blocked_snapshot().contains(signo) {
                found = t as *const Thread;
            }
        }
    });
    if found.is_null() {
        Some(leader)
    } else {
        Some(&*found)
    }
}

/// Deliver a process-directed signal to the group.
///
/// SIGKILL bypasses the pending queues: every member gets FLAG_KILLED and
/// a wakeup. Anything else lands in shared_pending (with the SA_SIGINFO
/// queue and its cap), then one eligible member is notified — except
/// SIGCONT, which wakes every stopped member.
///
/// A non-SA_SIGINFO signal that is already pending is dropped, except
/// SIGCONT whose stop-cancel side effects must run every time.
pub fn tg_signal_send(tg: &Arc<ThreadGroup>, info: &SigInfo) -> Result<(), i64> {
    let signo = info.si_signo;
    if sig_bad(signo) {
        return Err(EINVAL);
    }
    if tg.live_threads.load(Ordering::Acquire) <= 0 {
        return Err(ESRCH);
    }

    if signo == SIGKILL {
        table::pid_rlock();
        unsafe {
            tg.for_each_member(|t| {
                t.set_flag(FLAG_KILLED);
                t.set_flag(FLAG_SIGPENDING);
                sched::scheduler_wakeup_killable(t);
                sched::scheduler_wakeup_stopped(t);
            });
        }
        tg.shared_pending.set_bit(SIGKILL);
        table::pid_runlock();
        return Ok(());
    }

    table::pid_rlock();

    let leader = tg.leader();
    let sa = match leader.sigacts_clone() {
        Some(sa) => sa,
        None => {
            table::pid_runlock();
            return Err(ESRCH);
        }
    };

    let is_cont;
    let is_stop;
    let is_term;

    sa.lock();
    {
        let inner = unsafe { sa.inner() };
        if inner.ignore_mask.contains(signo) {
            sa.unlock();
            table::pid_runlock();
            return Ok(());
        }
        is_cont = inner.cont_mask.contains(signo);
        is_stop = inner.stop_mask.contains(signo);
        is_term = inner.term_mask.contains(signo);

        // SIGCONT cancels pending stops everywhere — even when SIGCONT is
        // already pending, a second one must still cancel a second stop.
        if is_cont {
            let stop_mask = inner.stop_mask;
            tg.shared_pending.clear_set(stop_mask);
            unsafe {
                tg.for_each_member(|t| {
                    t.signal.pending.clear_set(stop_mask);
                });
            }
        }
        // And a stop cancels pending SIGCONTs.
        if is_stop {
            tg.shared_pending.clear_set(inner.cont_mask);
        }

        let act = inner.actions[signo as usize];
        if act.flags.contains(crate::signal::types::SaFlags::SIGINFO) {
            let mut ksi = *info;
            ksi.si_signo = signo;
            unsafe {
                tg.shared_pending
                    .enqueue_info(alloc::boxed::Box::new(KSigInfo::new(signo, ksi)));
            }
        } else if tg.shared_pending.mask().contains(signo) && !is_cont {
            // Standard signal already pending: nothing more to do.
            sa.unlock();
            table::pid_runlock();
            return Ok(());
        }
    }
    sa.unlock();

    tg.shared_pending.set_bit(signo);

    if is_cont {
        unsafe {
            tg.for_each_member(|t| {
                t.set_flag(FLAG_SIGPENDING);
                if t.state() == ThreadState::Stopped {
                    sched::scheduler_wakeup_stopped(t);
                } else {
                    sched::scheduler_wakeup_interruptible(t);
                }
            });
        }
    } else if let Some(target) = unsafe { pick_delivery_thread(tg, signo) } {
        target.set_flag(FLAG_SIGPENDING);
        if is_term && target.state() == ThreadState::Stopped {
            sched::scheduler_wakeup_stopped(target);
        } else if target.state() == ThreadState::Interruptible {
            sched::scheduler_wakeup_interruptible(target);
        } else if is_stop && target.state() == ThreadState::Running {
            // Nudge the running member so it processes the stop promptly.
            let cpu = target.se.cpu();
            if cpu != crate::arch::hartid() {
                crate::smp::ipi::ipi_send_single(cpu, crate::smp::ipi::IPI_REASON_RESCHEDULE);
            } else {
                smp::cpu_local().set_needs_resched();
            }
        }
    }

    table::pid_runlock();
    Ok(())
}

/// Dequeue one shared-pending record for `signo`.
///
/// # Safety
/// Caller holds the shared sigacts lock (and pid_rlock for the group
/// reference).
pub unsafe fn tg_dequeue_signal(
    tg: &ThreadGroup,
    signo: i32,
) -> Option<alloc::boxed::Box<KSigInfo>> {
    tg.shared_pending.dequeue_info(signo)
}

/// Group exit: first caller records the code, force-kills every other
/// member, and then exits itself. Members parked uninterruptibly die at
/// their next killable point.
pub fn thread_group_exit(p: &Thread, code: i32) -> ! {
    let tg = match p.group_clone() {
        Some(tg) => tg,
        None => crate::proc::lifecycle::exit(code),
    };

    if tg
        .group_exit
        .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        // Another member already initiated the group exit.
        crate::proc::lifecycle::exit(code);
    }
    tg.group_exit_code.store(code, Ordering::Release);

    table::pid_rlock();
    unsafe {
        tg.for_each_member(|t| {
            if core::ptr::eq(t, p) {
                return;
            }
            t.set_flag(FLAG_KILLED);
            t.set_flag(FLAG_SIGPENDING);
            sched::scheduler_wakeup_killable(t);
            sched::scheduler_wakeup_stopped(t);
        });
    }
    table::pid_runlock();

    crate::proc::lifecycle::exit(code)
}
