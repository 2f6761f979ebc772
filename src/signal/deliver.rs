/*
 * Signal delivery, consumption side.
 *
 * handle_signal() runs on the return-to-user path (and at kernel-thread
 * cancellation points) and loops until nothing unmasked remains:
 * terminal signals exit, stop signals park the thread in STOPPED, SIGCONT
 * cancels stops, everything else delivers to the lowest-numbered signal's
 * handler by building a user frame. Stop/continue cancellation applies to
 * both the per-thread and the shared pending sets.
 *
 * The user frame layout is a ucontext (saved blocked mask, machine
 * context, link to the previous frame) pushed onto the alternate stack
 * when armed, else the interrupted stack; SA_SIGINFO additionally pushes
 * the siginfo record and passes its address in a1. sigreturn unwinds it.
 */

use alloc::boxed::Box;

use crate::errno::EINVAL;
use crate::proc::thread::{Thread, ThreadState, FLAG_KILLED, FLAG_USER_SPACE};
use crate::proc::thread_group;
use crate::sched;
use crate::signal::recalc_sigpending_tsk;
use crate::signal::types::{
    sig_bad, KSigInfo, SaFlags, SigAction, SigHandler, SigInfo, SigSet, SigStackFlags, UContext,
    SIGKILL, SIGSTOP,
};
use crate::smp;

/// How the consumption loop should proceed after one pass.
enum Disposition {
    Deliver(i32, SigAction, Option<Box<KSigInfo>>),
    Stopped,
    Consumed,
    Terminal,
    Idle,
}

fn scan_one(p: &Thread) -> Disposition {
    let sa = match p.sigacts_clone() {
        Some(sa) => sa,
        None => return Disposition::Idle,
    };
    let tg = p.group_clone();

    sa.lock();

    let (blocked, term_mask, stop_mask, cont_mask);
    {
        let inner = unsafe { sa.inner() };
        blocked = inner.blocked;
        term_mask = inner.term_mask;
        stop_mask = inner.stop_mask;
        cont_mask = inner.cont_mask;
    }

    let mut pending = p.signal.pending.mask();
    let shared_pending = tg
        .as_ref()
        .map(|tg| tg.shared_pending.mask())
        .unwrap_or(SigSet::empty());
    pending = pending | shared_pending;

    let deliverable = pending & !blocked;

    if !(deliverable & term_mask).is_empty() || p.killed() {
        p.set_flag(FLAG_KILLED);
        sa.unlock();
        return Disposition::Terminal;
    }

    let pending_cont = deliverable & cont_mask;
    let pending_stop = deliverable & stop_mask;

    if !pending_cont.is_empty() {
        // A continue cancels every pending stop, thread-local and shared.
        p.signal.pending.clear_set(stop_mask);
        if let Some(tg) = tg.as_ref() {
            tg.shared_pending.clear_set(stop_mask);
        }

        // With no user handler installed the continue is consumed here;
        // with one, the stop-cancel still happened and the handler is
        // delivered below.
        let mut user_handler = false;
        {
            let inner = unsafe { sa.inner() };
            for signo in 1..crate::signal::types::NSIG as i32 {
                if pending_cont.contains(signo)
                    && matches!(inner.actions[signo as usize].handler, SigHandler::User(_))
                {
                    user_handler = true;
                    break;
                }
            }
        }
        if !user_handler {
            p.signal.pending.clear_set(pending_cont);
            if let Some(tg) = tg.as_ref() {
                tg.shared_pending.clear_set(pending_cont);
            }
            recalc_sigpending_tsk(p);
            sa.unlock();
            return Disposition::Consumed;
        }
    } else if !pending_stop.is_empty() {
        // Consume every pending stop and park.
        p.signal.pending.clear_set(pending_stop);
        if let Some(tg) = tg.as_ref() {
            tg.shared_pending.clear_set(pending_stop);
            tg.group_stop_count.fetch_add(1, core::sync::atomic::Ordering::SeqCst);
            tg.group_stop_signo
                .store(pending_stop.first(), core::sync::atomic::Ordering::Relaxed);
        }
        recalc_sigpending_tsk(p);
        sa.unlock();
        return Disposition::Stopped;
    }

    let signo = deliverable.first();
    if signo == 0 || sig_bad(signo) {
        sa.unlock();
        return Disposition::Idle;
    }
    if stop_mask.contains(signo) {
        // Stop bits were consumed above; stale view, rescan.
        sa.unlock();
        return Disposition::Consumed;
    }

    let act = unsafe { sa.inner() }.actions[signo as usize];

    // Dequeue from whichever pending set carries the signal.
    let from_shared = !p.signal.pending.mask().contains(signo);
    let info = unsafe {
        if from_shared {
            match tg.as_ref() {
                Some(tg) => thread_group::tg_dequeue_signal(tg, signo),
                None => None,
            }
        } else {
            p.signal.pending.dequeue_info(signo)
        }
    };
    recalc_sigpending_tsk(p);
    sa.unlock();

    Disposition::Deliver(signo, act, info)
}

/// Consume pending signals on the way back to user space. Loops until no
/// unmasked signal remains; exits the thread when a terminal signal (or
/// FLAG_KILLED) is found.
pub fn handle_signal() {
    let p = match smp::current() {
        Some(p) => p,
        None => return,
    };
    if p.sigacts_clone().is_none() {
        return;
    }

    loop {
        match scan_one(p) {
            Disposition::Terminal => break,
            Disposition::Consumed => continue,
            Disposition::Stopped => {
                p.tcb_lock();
                p.set_state(ThreadState::Stopped);
                p.tcb_unlock();
                // Close the stop-vs-continue window: a SIGCONT that
                // arrived before the state change found nothing to wake,
                // but its pending bit is already visible.
                if continue_pending(p) {
                    p.state_cas(ThreadState::Stopped, ThreadState::Running);
                } else {
                    sched::scheduler_yield();
                }
                if let Some(tg) = p.group_clone() {
                    tg.group_stop_count
                        .fetch_sub(1, core::sync::atomic::Ordering::SeqCst);
                }
                continue;
            }
            Disposition::Idle => break,
            Disposition::Deliver(signo, act, info) => {
                let repeat = deliver_signal(p, signo, &act, info.as_deref());
                if !repeat {
                    break;
                }
            }
        }
    }

    if p.killed() {
        // A fatal signal takes down the whole process, not just the
        // thread that fielded it.
        thread_group::thread_group_exit(p, -1);
    }
}

/// Is an unmasked continue-class signal pending (thread or shared)?
fn continue_pending(p: &Thread) -> bool {
    let sa = match p.sigacts_clone() {
        Some(sa) => sa,
        None => return false,
    };
    let mut pending = p.signal.pending.mask();
    if let Some(tg) = p.group_clone() {
        pending = pending | tg.shared_pending.mask();
    }
    sa.with(|inner| !(pending & inner.cont_mask & !inner.blocked).is_empty())
}

/// Invoke one signal's user handler: push the frame, then apply the
/// handler's mask effects. Returns whether the loop should scan again
/// (more queued instances of an unmasked SA_SIGINFO signal).
fn deliver_signal(p: &Thread, signo: i32, act: &SigAction, info: Option<&KSigInfo>) -> bool {
    let handler = match act.handler {
        SigHandler::Ignore => return true,
        SigHandler::Default => {
            // Default dispositions were routed by the classification
            // masks before delivery; nothing to run here.
            return true;
        }
        SigHandler::User(addr) => addr,
    };

    if p.has_flag(FLAG_USER_SPACE) {
        if let Err(err) = push_sigframe(p, signo, handler, act, info) {
            log::warn!(
                "pid {}: signal {} frame push failed ({}), killing",
                p.pid,
                signo,
                err
            );
            p.set_flag(FLAG_KILLED);
            return false;
        }
    }
    // Kernel threads have no user frame; the handler address is
    // meaningless for them and the signal is consumed as-is.

    let sa = match p.sigacts_clone() {
        Some(sa) => sa,
        None => return false,
    };
    sa.lock();
    let mut repeat = false;
    {
        let inner = unsafe { sa.inner() };
        if !act.flags.contains(SaFlags::NODEFER) {
            inner.blocked.add(signo);
        }
        inner.blocked = inner.blocked | act.mask;
        inner.blocked.del(SIGKILL);
        inner.blocked.del(SIGSTOP);
        recalc_sigpending_tsk(p);

        if act.flags.contains(SaFlags::RESETHAND) {
            inner
                .set_default(signo)
                .expect("sigaction reset to default failed");
        }

        if act.flags.contains(SaFlags::SIGINFO) {
            let unmasked = !inner.blocked.contains(signo);
            let mut still_pending = p.signal.pending.mask().contains(signo);
            if !still_pending {
                if let Some(tg) = p.group_clone() {
                    still_pending = tg.shared_pending.mask().contains(signo);
                }
            }
            repeat = unmasked && still_pending;
        }
    }
    sa.unlock();
    repeat
}

/// Build the user signal frame: ucontext (and siginfo for SA_SIGINFO)
/// pushed onto the alternate or current stack, registers redirected to
/// the handler. May sleep growing the user stack.
fn push_sigframe(
    p: &Thread,
    signo: i32,
    handler: u64,
    act: &SigAction,
    info: Option<&KSigInfo>,
) -> Result<(), i64> {
    let vm = p.vm_clone().ok_or(EINVAL)?;
    let tf = unsafe { (*p.trapframe.get()).as_mut().ok_or(EINVAL)? };

    let blocked = {
        let sa = p.sigacts_clone().ok_or(EINVAL)?;
        sa.with(|inner| inner.blocked)
    };

    let sig_stack = unsafe { *p.signal.sig_stack.get() };
    let on_alt = act.flags.contains(SaFlags::ONSTACK)
        && !sig_stack.flags.contains(SigStackFlags::DISABLE)
        && sig_stack.sp != 0;
    let mut sp = if on_alt {
        sig_stack.sp + sig_stack.size
    } else {
        tf.sp
    };

    let uc = UContext {
        uc_link: p.signal.sig_ucontext.load(core::sync::atomic::Ordering::Acquire),
        uc_sigmask: blocked,
        uc_stack: sig_stack,
        uc_mcontext: **tf,
    };

    // ucontext first, then (optionally) siginfo above it; 16-byte
    // alignment throughout.
    sp = (sp - core::mem::size_of::<UContext>() as u64) & !0xf;
    let uc_addr = sp;
    vm.try_grow_stack(uc_addr)?;
    vm.copy_out_val(uc_addr, &uc)?;

    let mut si_addr = 0u64;
    if act.flags.contains(SaFlags::SIGINFO) {
        let si = info.map(|k| k.info).unwrap_or(SigInfo {
            si_signo: signo,
            ..Default::default()
        });
        sp = (sp - core::mem::size_of::<SigInfo>() as u64) & !0xf;
        si_addr = sp;
        vm.try_grow_stack(si_addr)?;
        vm.copy_out_val(si_addr, &si)?;
    }

    p.signal
        .sig_ucontext
        .store(uc_addr, core::sync::atomic::Ordering::Release);

    // Re-arm handling: one-arg handlers get (signo); three-arg handlers
    // get (signo, &siginfo, &ucontext).
    tf.sepc = handler;
    tf.sp = sp;
    tf.a[0] = signo as u64;
    if act.flags.contains(SaFlags::SIGINFO) {
        tf.a[1] = si_addr;
        tf.a[2] = uc_addr;
    }
    // The return path goes through the libc sigreturn restorer; a frame
    // without one faults back into the kernel and terminates.
    tf.ra = 0;
    Ok(())
}

/// sigreturn(2): restore the machine context and blocked mask saved by
/// push_sigframe. An unreadable ucontext terminates the thread.
pub fn sigreturn() -> Result<u64, i64> {
    let p = smp::current().ok_or(EINVAL)?;
    let uc_addr = p
        .signal
        .sig_ucontext
        .load(core::sync::atomic::Ordering::Acquire);
    if uc_addr == 0 {
        return Err(EINVAL);
    }
    let vm = p.vm_clone().ok_or(EINVAL)?;
    let uc: UContext = match vm.copy_in_val(uc_addr) {
        Ok(uc) => uc,
        Err(_) => {
            log::warn!("pid {}: bad ucontext at {:#x}", p.pid, uc_addr);
            crate::proc::lifecycle::exit(-1);
        }
    };

    let tf = unsafe { (*p.trapframe.get()).as_mut().ok_or(EINVAL)? };
    let a0 = uc.uc_mcontext.a[0];
    **tf = uc.uc_mcontext;
    unsafe { *p.signal.sig_stack.get() = uc.uc_stack };
    p.signal
        .sig_ucontext
        .store(uc.uc_link, core::sync::atomic::Ordering::Release);

    let sa = p.sigacts_clone().ok_or(EINVAL)?;
    sa.lock();
    {
        let inner = unsafe { sa.inner() };
        if uc.uc_link == 0 {
            inner.blocked = inner.original_mask;
        } else {
            // Keep any bits the program blocked between frame push and
            // sigreturn: restore the saved mask OR the process-level one.
            inner.blocked = uc.uc_sigmask | inner.original_mask;
        }
        inner.scrub_mandatory();
        recalc_sigpending_tsk(p);
    }
    sa.unlock();

    // The syscall return value must not clobber the restored a0.
    Ok(a0)
}

/// sigaction(2). SIGKILL and SIGSTOP can never be caught or ignored.
pub fn sigaction(
    signo: i32,
    new: Option<&SigAction>,
    old_out: Option<&mut SigAction>,
) -> Result<(), i64> {
    if sig_bad(signo) || signo == SIGKILL || signo == SIGSTOP {
        return Err(EINVAL);
    }
    let p = smp::current().ok_or(EINVAL)?;
    let sa = p.sigacts_clone().ok_or(EINVAL)?;

    sa.lock();
    {
        let inner = unsafe { sa.inner() };
        if let Some(out) = old_out {
            *out = inner.actions[signo as usize];
        }
        if let Some(new) = new {
            inner.reset_act_mask(signo);
            match new.handler {
                SigHandler::Ignore => {
                    inner.ignore_mask.add(signo);
                }
                SigHandler::Default => {
                    if inner.set_default(signo).is_err() {
                        sa.unlock();
                        return Err(EINVAL);
                    }
                    // Back at default, a pending occurrence of a
                    // terminate-class signal condemns the thread now.
                    let pending_term =
                        p.signal.pending.mask() & inner.term_mask & !inner.blocked;
                    if !pending_term.is_empty() {
                        p.set_flag(FLAG_KILLED);
                    }
                }
                SigHandler::User(_) => {}
            }
            let mut act = *new;
            act.mask.del(SIGKILL);
            act.mask.del(SIGSTOP);
            inner.actions[signo as usize] = act;

            // A replaced action discards what was queued under the old
            // one.
            unsafe { p.signal.pending.purge(signo) };
            recalc_sigpending_tsk(p);
        }
    }
    sa.unlock();
    Ok(())
}

pub const SIG_BLOCK: i32 = 0;
pub const SIG_UNBLOCK: i32 = 1;
pub const SIG_SETMASK: i32 = 2;

/// sigprocmask(2). Returns the previous (original) mask. SIGKILL and
/// SIGSTOP are silently stripped from whatever the caller asks for.
pub fn sigprocmask(how: i32, set: Option<SigSet>) -> Result<SigSet, i64> {
    if set.is_none() && how != SIG_SETMASK {
        return Err(EINVAL);
    }
    if how != SIG_BLOCK && how != SIG_UNBLOCK && how != SIG_SETMASK {
        return Err(EINVAL);
    }
    let p = smp::current().ok_or(EINVAL)?;
    let sa = p.sigacts_clone().ok_or(EINVAL)?;

    sa.lock();
    let old;
    let pending_unmasked;
    {
        let inner = unsafe { sa.inner() };
        old = inner.original_mask;
        if let Some(set) = set {
            match how {
                SIG_SETMASK => {
                    inner.original_mask = set;
                    inner.blocked = set;
                }
                SIG_BLOCK => {
                    inner.original_mask = inner.original_mask | set;
                    inner.blocked = inner.blocked | set;
                }
                SIG_UNBLOCK => {
                    inner.original_mask = inner.original_mask & !set;
                    inner.blocked = inner.blocked & !set;
                }
                _ => {
                    sa.unlock();
                    return Err(EINVAL);
                }
            }
            inner.scrub_mandatory();
        }
        recalc_sigpending_tsk(p);

        pending_unmasked = p.signal.pending.mask() & !inner.blocked;
        if !(pending_unmasked & inner.term_mask).is_empty() {
            p.set_flag(FLAG_KILLED);
        }
    }
    sa.unlock();

    if !pending_unmasked.is_empty() {
        crate::signal::signal_notify(p);
    }
    Ok(old)
}

/// sigpending(2): signals pending for the thread but currently blocked.
pub fn sigpending() -> Result<SigSet, i64> {
    let p = smp::current().ok_or(EINVAL)?;
    let sa = p.sigacts_clone().ok_or(EINVAL)?;
    sa.lock();
    let set = unsafe { sa.inner() }.blocked & p.signal.pending.mask();
    sa.unlock();
    Ok(set)
}
