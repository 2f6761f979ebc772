/*
 * Signal actions table (sigacts).
 *
 * Holds the 32 sigaction slots plus the derived classification masks
 * (terminate/stop/continue/ignore, recomputed on every action change) and
 * the process-level blocked masks. Shared by reference (Arc) between
 * threads created with CLONE_SIGHAND; plain fork deep-copies it.
 *
 * The embedded lock is THE signal lock: all signal state — actions,
 * masks, per-thread pending queues of every sharing thread, and the
 * thread group's shared pending — is mutated under it. It is ordered
 * below pid_lock and above tcb_lock.
 */

use alloc::sync::Arc;
use core::cell::UnsafeCell;

use crate::errno::EINVAL;
use crate::signal::types::{
    sig_bad, signo_default_action, SigAction, SigDefact, SigHandler, SigSet, NSIG, SIGCONT,
    SIGKILL, SIGSTOP,
};
use crate::sync::RawSpinLock;

pub struct SigactsInner {
    /// Indexed directly by signo (slot 0 unused).
    pub actions: [SigAction; NSIG],
    /// Signals currently blocked at the process level.
    pub blocked: SigSet,
    /// Mask as last set by sigprocmask, before handler-entry additions;
    /// sigreturn folds this back in.
    pub original_mask: SigSet,
    // Derived per-disposition masks.
    pub term_mask: SigSet,
    pub stop_mask: SigSet,
    pub cont_mask: SigSet,
    pub ignore_mask: SigSet,
}

impl SigactsInner {
    /// Drop `signo` from every derived mask (SIGSTOP/SIGCONT keep their
    /// immutable classification).
    pub fn reset_act_mask(&mut self, signo: i32) {
        self.term_mask.del(signo);
        self.ignore_mask.del(signo);
        if signo != SIGSTOP {
            self.stop_mask.del(signo);
        }
        if signo != SIGCONT {
            self.cont_mask.del(signo);
        }
    }

    /// Install the default action for `signo`.
    pub fn set_default(&mut self, signo: i32) -> Result<(), i64> {
        if sig_bad(signo) {
            return Err(EINVAL);
        }
        let defact = signo_default_action(signo);
        if defact == SigDefact::Invalid {
            return Ok(());
        }

        self.reset_act_mask(signo);
        match defact {
            SigDefact::Ign => self.ignore_mask.add(signo),
            SigDefact::Cont => self.cont_mask.add(signo),
            SigDefact::Stop => self.stop_mask.add(signo),
            // Core-dump signals terminate for now; dumping is a VFS-side
            // concern.
            SigDefact::Term | SigDefact::Core | SigDefact::Invalid => self.term_mask.add(signo),
        }

        self.actions[signo as usize] = SigAction::default_action();
        Ok(())
    }

    /// SIGKILL/SIGSTOP can never be blocked or ignored.
    pub fn scrub_mandatory(&mut self) {
        self.blocked.del(SIGKILL);
        self.blocked.del(SIGSTOP);
        self.original_mask.del(SIGKILL);
        self.original_mask.del(SIGSTOP);
        self.ignore_mask.del(SIGKILL);
        self.ignore_mask.del(SIGSTOP);
    }
}

pub struct Sigacts {
    lock: RawSpinLock,
    inner: UnsafeCell<SigactsInner>,
}

unsafe impl Sync for Sigacts {}
unsafe impl Send for Sigacts {}

impl Sigacts {
    /// Fresh table with default actions for every signal.
    pub fn new() -> Arc<Sigacts> {
        let mut inner = SigactsInner {
            actions: [SigAction::default_action(); NSIG],
            blocked: SigSet::empty(),
            original_mask: SigSet::empty(),
            term_mask: SigSet::empty(),
            stop_mask: SigSet::empty(),
            cont_mask: SigSet::empty(),
            ignore_mask: SigSet::empty(),
        };
        for signo in 1..NSIG as i32 {
            inner
                .set_default(signo)
                .expect("sigacts: default action install failed");
        }
        Arc::new(Sigacts {
            lock: RawSpinLock::new("sigacts_lock"),
            inner: UnsafeCell::new(inner),
        })
    }

    /// Duplicate for a new thread: share the Arc under CLONE_SIGHAND,
    /// otherwise deep-copy the current contents (with a fresh lock).
    pub fn dup(parent: &Arc<Sigacts>, share: bool) -> Arc<Sigacts> {
        if share {
            return Arc::clone(parent);
        }
        parent.lock();
        let copy = unsafe { (*parent.inner.get()).clone_contents() };
        parent.unlock();
        Arc::new(Sigacts {
            lock: RawSpinLock::new("sigacts_lock"),
            inner: UnsafeCell::new(copy),
        })
    }

    pub fn lock(&self) {
        self.lock.lock();
    }

    pub fn unlock(&self) {
        self.lock.unlock();
    }

    pub fn holding(&self) -> bool {
        self.lock.holding()
    }

    pub fn assert_holding(&self) {
        self.lock.assert_holding();
    }

    /// Access the protected contents.
    ///
    /// # Safety
    /// Caller must hold the sigacts lock.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn inner(&self) -> &mut SigactsInner {
        &mut *self.inner.get()
    }

    /// Lock-free snapshot of the blocked mask, for send-path eligibility
    /// checks that tolerate staleness.
    pub fn blocked_snapshot(&self) -> SigSet {
        unsafe { (*self.inner.get()).blocked }
    }

    /// Convenience: run `f` under the lock.
    pub fn with<R>(&self, f: impl FnOnce(&mut SigactsInner) -> R) -> R {
        self.lock();
        let r = f(unsafe { self.inner() });
        self.unlock();
        r
    }

    /// Is `signo`'s handler a user handler right now?
    pub fn has_user_handler(&self, signo: i32) -> bool {
        self.with(|inner| matches!(inner.actions[signo as usize].handler, SigHandler::User(_)))
    }
}

impl SigactsInner {
    fn clone_contents(&self) -> SigactsInner {
        SigactsInner {
            actions: self.actions,
            blocked: self.blocked,
            original_mask: self.original_mask,
            term_mask: self.term_mask,
            stop_mask: self.stop_mask,
            cont_mask: self.cont_mask,
            ignore_mask: self.ignore_mask,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::types::{SIGCHLD, SIGSEGV, SIGTERM, SIGTSTP, SIGUSR1};

    #[test]
    fn defaults_classify_signals() {
        let sa = Sigacts::new();
        sa.with(|inner| {
            assert!(inner.term_mask.contains(SIGTERM));
            assert!(inner.term_mask.contains(SIGKILL));
            assert!(inner.term_mask.contains(SIGSEGV), "core acts as terminate");
            assert!(inner.stop_mask.contains(SIGSTOP));
            assert!(inner.stop_mask.contains(SIGTSTP));
            assert!(inner.cont_mask.contains(SIGCONT));
            assert!(inner.ignore_mask.contains(SIGCHLD));
            assert!(inner.blocked.is_empty());
        });
    }

    #[test]
    fn dup_copies_and_shares() {
        let sa = Sigacts::new();
        sa.with(|inner| {
            inner.blocked.add(SIGUSR1);
        });

        let shared = Sigacts::dup(&sa, true);
        assert!(Arc::ptr_eq(&sa, &shared));

        let copied = Sigacts::dup(&sa, false);
        assert!(!Arc::ptr_eq(&sa, &copied));
        assert!(copied.blocked_snapshot().contains(SIGUSR1));

        // Diverge after the copy.
        sa.with(|inner| inner.blocked.del(SIGUSR1));
        assert!(copied.blocked_snapshot().contains(SIGUSR1));
        assert!(!sa.blocked_snapshot().contains(SIGUSR1));
    }

    #[test]
    fn scrub_strips_mandatory_signals() {
        let sa = Sigacts::new();
        sa.with(|inner| {
            inner.blocked.add(SIGKILL);
            inner.blocked.add(SIGSTOP);
            inner.blocked.add(SIGUSR1);
            inner.scrub_mandatory();
            assert!(!inner.blocked.contains(SIGKILL));
            assert!(!inner.blocked.contains(SIGSTOP));
            assert!(inner.blocked.contains(SIGUSR1));
        });
    }
}
