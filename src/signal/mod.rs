/*
 * Signal delivery, posting side.
 *
 * All signal state is protected by the sigacts lock (shared among
 * CLONE_SIGHAND threads): the action table, the blocked masks, the
 * per-thread pending queues, and the thread group's shared pending.
 * The lock is released before any scheduler operation (wakeup, yield).
 *
 * FLAG_SIGPENDING gives the trap-return path an O(1) "anything
 * deliverable?" check; recalc_sigpending_tsk() maintains it and must be
 * called after every change to a pending mask or the blocked mask, while
 * holding the sigacts lock. The flag is never cleared on another thread
 * (it may be mid-syscall relying on it); only the owning thread clears
 * it via recalc_sigpending().
 */

pub mod deliver;
pub mod sigacts;
pub mod types;

use crate::errno::{EINVAL, ESRCH};
use crate::proc::table;
use crate::proc::thread::{Thread, ThreadState, FLAG_KILLED, FLAG_SIGPENDING};
use crate::proc::thread_group;
use crate::rcu;
use crate::sched;
use crate::smp;
use crate::signal::types::{sig_bad, KSigInfo, SaFlags, SigInfo, SIGKILL, SIGSTOP};

pub use deliver::{handle_signal, sigaction, sigpending, sigprocmask, sigreturn};

/// Recompute FLAG_SIGPENDING for `p`: set iff
/// (pending | shared_pending) & ~blocked is non-empty. Never clears for a
/// non-current thread. Caller holds the sigacts lock.
pub fn recalc_sigpending_tsk(p: &Thread) -> bool {
    let sa = match p.sigacts_clone() {
        Some(sa) => sa,
        None => return false,
    };
    let mut pending = p.signal.pending.mask();
    if let Some(tg) = p.group_clone() {
        pending = pending | tg.shared_pending.mask();
    }
    let blocked = sa.blocked_snapshot();
    if !(pending & !blocked).is_empty() {
        p.set_flag(FLAG_SIGPENDING);
        true
    } else {
        false
    }
}

/// Recompute for the calling thread; may clear the flag.
pub fn recalc_sigpending() {
    let p = match smp::current() {
        Some(p) => p,
        None => return,
    };
    let sa = match p.sigacts_clone() {
        Some(sa) => sa,
        None => return,
    };
    sa.lock();
    if !recalc_sigpending_tsk(p) {
        p.clear_flag(FLAG_SIGPENDING);
    }
    sa.unlock();
}

/// Fast check used at trap return.
pub fn signal_pending(p: &Thread) -> bool {
    p.has_flag(FLAG_SIGPENDING)
}

/// Wake `p` from an interruptible sleep so it can act on a signal.
pub fn signal_notify(p: &Thread) {
    if p.state() == ThreadState::Interruptible {
        sched::scheduler_wakeup_interruptible(p);
    }
}

/// Thread-directed signal enqueue.
///
/// Rejects dead targets, drops ignored signals, queues a KSigInfo copy
/// for SA_SIGINFO actions (evicting the oldest past the cap), then wakes
/// or nudges the target as the signal class requires.
pub fn send_to_thread(p: &Thread, info: &SigInfo) -> Result<(), i64> {
    let signo = info.si_signo;
    if sig_bad(signo) {
        return Err(EINVAL);
    }
    let state = p.state();
    if state == ThreadState::Unused || state == ThreadState::Zombie || p.killed() {
        return Err(EINVAL);
    }
    let sa = match p.sigacts_clone() {
        Some(sa) => sa,
        None => return Err(EINVAL),
    };

    sa.lock();

    let is_stop;
    let is_cont;
    let mut is_term;
    let blocked;
    {
        let inner = unsafe { sa.inner() };
        if inner.ignore_mask.contains(signo) {
            sa.unlock();
            return Ok(());
        }

        let act = inner.actions[signo as usize];
        if act.flags.contains(SaFlags::SIGINFO) {
            assert!(
                signo != SIGKILL && signo != SIGSTOP,
                "SA_SIGINFO set for SIGKILL/SIGSTOP"
            );
            unsafe {
                p.signal
                    .pending
                    .enqueue_info(alloc::boxed::Box::new(KSigInfo::new(signo, *info)));
            }
        }

        // Record the pending bit even for stop-class signals so later
        // mask changes can notice it.
        p.signal.pending.set_bit(signo);
        recalc_sigpending_tsk(p);

        blocked = inner.blocked;
        is_stop = inner.stop_mask.contains(signo) && !blocked.contains(signo);
        is_cont = inner.cont_mask.contains(signo) && !blocked.contains(signo);
        is_term = inner.term_mask.contains(signo) && !blocked.contains(signo);
    }
    sa.unlock();

    if is_stop {
        // The target stops voluntarily in handle_signal; make sure it
        // gets there soon.
        match p.state() {
            ThreadState::Interruptible => {
                sched::scheduler_wakeup_interruptible(p);
            }
            ThreadState::Running => {
                let cpu = p.se.cpu();
                if cpu != crate::arch::hartid() {
                    crate::smp::ipi::ipi_send_single(cpu, crate::smp::ipi::IPI_REASON_RESCHEDULE);
                } else {
                    smp::cpu_local().set_needs_resched();
                }
            }
            _ => {}
        }
    }
    if is_cont {
        sched::scheduler_wakeup_stopped(p);
    }
    if signo == SIGKILL {
        is_term = true;
    }
    if is_term {
        p.set_flag(FLAG_KILLED);
        if p.state() == ThreadState::Stopped {
            sched::scheduler_wakeup_stopped(p);
        }
    }

    let pending_unmasked = p.signal.pending.mask() & !blocked;
    if !pending_unmasked.is_empty() {
        signal_notify(p);
    }

    Ok(())
}

/// kill(2) semantics: pid naming a thread-group leader is
/// process-directed (shared pending); any other pid is thread-directed.
pub fn signal_send(pid: i32, info: &SigInfo) -> Result<(), i64> {
    if pid < 0 || sig_bad(info.si_signo) {
        return Err(EINVAL);
    }
    rcu::rcu_read_lock();
    let result = (|| {
        let p = table::get_pid_thread(pid)?;
        match p.group_clone() {
            Some(tg) if tg.tgid() == pid => thread_group::tg_signal_send(&tg, info),
            _ => send_to_thread(p, info),
        }
    })();
    rcu::rcu_read_unlock();
    result
}

fn info_from_current(signo: i32) -> SigInfo {
    SigInfo {
        si_signo: signo,
        si_pid: smp::current().map(|p| p.tgid()).unwrap_or(0),
        ..Default::default()
    }
}

/// Process- or thread-directed kill by pid.
pub fn kill(pid: i32, signo: i32) -> Result<(), i64> {
    signal_send(pid, &info_from_current(signo))
}

/// Directly signal a known thread (kernel-internal senders).
pub fn kill_thread(p: &Thread, signo: i32) -> Result<(), i64> {
    let info = info_from_current(signo);
    rcu::rcu_read_lock();
    let ret = send_to_thread(p, &info);
    rcu::rcu_read_unlock();
    ret
}

/// tkill(2): thread-directed by tid.
pub fn tkill(tid: i32, signo: i32) -> Result<(), i64> {
    if tid < 0 || sig_bad(signo) {
        return Err(EINVAL);
    }
    let info = info_from_current(signo);
    rcu::rcu_read_lock();
    let ret = (|| {
        let p = table::get_pid_thread(tid).map_err(|_| ESRCH)?;
        send_to_thread(p, &info)
    })();
    rcu::rcu_read_unlock();
    ret
}

/// tgkill(2): thread-directed, verifying group membership first.
pub fn tgkill(tgid: i32, tid: i32, signo: i32) -> Result<(), i64> {
    if tgid < 0 || tid < 0 || sig_bad(signo) {
        return Err(EINVAL);
    }
    let info = info_from_current(signo);
    rcu::rcu_read_lock();
    let ret = (|| {
        let p = table::get_pid_thread(tid).map_err(|_| ESRCH)?;
        match p.group_clone() {
            Some(tg) if tg.tgid() == tgid => send_to_thread(p, &info),
            _ => Err(ESRCH),
        }
    })();
    rcu::rcu_read_unlock();
    ret
}
