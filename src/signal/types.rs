/*
 * Signal types: signal numbers, sets, actions, pending queues.
 *
 * Numbering and default actions follow the Linux x86/ARM scheme for
 * signals 1..31. SIGKILL and SIGSTOP can never be caught, blocked, or
 * ignored; every mask-mutation site strips them.
 */

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::collections::list::{self, ListNode};

pub const SIGHUP: i32 = 1;
pub const SIGINT: i32 = 2;
pub const SIGQUIT: i32 = 3;
pub const SIGILL: i32 = 4;
pub const SIGTRAP: i32 = 5;
pub const SIGABRT: i32 = 6;
pub const SIGBUS: i32 = 7;
pub const SIGFPE: i32 = 8;
pub const SIGKILL: i32 = 9;
pub const SIGUSR1: i32 = 10;
pub const SIGSEGV: i32 = 11;
pub const SIGUSR2: i32 = 12;
pub const SIGPIPE: i32 = 13;
pub const SIGALRM: i32 = 14;
pub const SIGTERM: i32 = 15;
pub const SIGSTKFLT: i32 = 16;
pub const SIGCHLD: i32 = 17;
pub const SIGCONT: i32 = 18;
pub const SIGSTOP: i32 = 19;
pub const SIGTSTP: i32 = 20;
pub const SIGTTIN: i32 = 21;
pub const SIGTTOU: i32 = 22;
pub const SIGURG: i32 = 23;
pub const SIGXCPU: i32 = 24;
pub const SIGXFSZ: i32 = 25;
pub const SIGVTALRM: i32 = 26;
pub const SIGPROF: i32 = 27;
pub const SIGWINCH: i32 = 28;
pub const SIGIO: i32 = 29;
pub const SIGPWR: i32 = 30;
pub const SIGSYS: i32 = 31;

/// Number of signals; valid signos are 1..=NSIG-1 plus NSIG itself is the
/// array bound used throughout (signo -> index signo-1).
pub const NSIG: usize = 32;

#[inline]
pub fn sig_bad(signo: i32) -> bool {
    signo < 1 || signo >= NSIG as i32
}

/// Handler disposition. Default/Ignore replace the C SIG_DFL/SIG_IGN
/// sentinel pointers; a user handler is a user-space address whose
/// one-arg/three-arg variant is selected by SA_SIGINFO when the frame is
/// built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigHandler {
    Default,
    Ignore,
    User(u64),
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SaFlags: u32 {
        const NOCLDSTOP = 0x0000_0001;
        const NOCLDWAIT = 0x0000_0002;
        const SIGINFO   = 0x0000_0004;
        const ONSTACK   = 0x0000_0008;
        const NODEFER   = 0x0000_0020;
        const RESETHAND = 0x0000_0040;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SigAction {
    pub handler: SigHandler,
    pub mask: SigSet,
    pub flags: SaFlags,
}

impl SigAction {
    pub const fn default_action() -> Self {
        SigAction {
            handler: SigHandler::Default,
            mask: SigSet::empty(),
            flags: SaFlags::empty(),
        }
    }
}

/// A set of signals, one bit per signo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigSet(pub u64);

impl SigSet {
    pub const fn empty() -> Self {
        SigSet(0)
    }

    pub const fn of(signo: i32) -> Self {
        SigSet(1 << signo)
    }

    pub fn add(&mut self, signo: i32) {
        self.0 |= 1 << signo;
    }

    pub fn del(&mut self, signo: i32) {
        self.0 &= !(1 << signo);
    }

    pub fn contains(&self, signo: i32) -> bool {
        self.0 & (1 << signo) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Lowest-numbered signal in the set, or 0 when empty. Delivery order
    /// across distinct signos is lowest first.
    pub fn first(&self) -> i32 {
        if self.0 == 0 {
            0
        } else {
            self.0.trailing_zeros() as i32
        }
    }
}

impl core::ops::BitOr for SigSet {
    type Output = SigSet;
    fn bitor(self, rhs: SigSet) -> SigSet {
        SigSet(self.0 | rhs.0)
    }
}

impl core::ops::BitAnd for SigSet {
    type Output = SigSet;
    fn bitand(self, rhs: SigSet) -> SigSet {
        SigSet(self.0 & rhs.0)
    }
}

impl core::ops::Not for SigSet {
    type Output = SigSet;
    fn not(self) -> SigSet {
        SigSet(!self.0)
    }
}

/// Per-signo default action classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigDefact {
    Invalid,
    Ign,
    Term,
    Core,
    Stop,
    Cont,
}

pub fn signo_default_action(signo: i32) -> SigDefact {
    match signo {
        SIGCHLD | SIGURG | SIGWINCH => SigDefact::Ign,
        SIGALRM | SIGUSR1 | SIGUSR2 | SIGHUP | SIGINT | SIGIO | SIGKILL | SIGPIPE | SIGPROF
        | SIGPWR | SIGSTKFLT | SIGTERM | SIGVTALRM => SigDefact::Term,
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => SigDefact::Stop,
        SIGCONT => SigDefact::Cont,
        SIGABRT | SIGBUS | SIGILL | SIGQUIT | SIGSEGV | SIGSYS | SIGTRAP | SIGXCPU | SIGXFSZ
        | SIGFPE => SigDefact::Core,
        _ => SigDefact::Invalid,
    }
}

pub const SIG_MANDATORY_MASK: SigSet = SigSet(1 << SIGKILL | 1 << SIGSTOP);

/// Additional data riding along with a queued signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct SigInfo {
    pub si_signo: i32,
    pub si_errno: i32,
    pub si_code: i32,
    /// Sending process (TGID).
    pub si_pid: i32,
    pub si_addr: u64,
    pub si_status: i32,
    pub si_value: u64,
}

/// Kernel-side queued signal record (heap-allocated, owned by the pending
/// queue it sits on).
pub struct KSigInfo {
    pub entry: ListNode,
    pub signo: i32,
    pub info: SigInfo,
}

impl KSigInfo {
    pub fn new(signo: i32, info: SigInfo) -> Self {
        KSigInfo {
            entry: ListNode::new(),
            signo,
            info,
        }
    }
}

/// Cap on queued KSigInfo entries per signal; the oldest entry is dropped
/// when a SA_SIGINFO signal overflows the queue.
pub const MAX_SIGINFO_PER_SIGNAL: usize = 8;

/// A pending-signal set: the pending bitmask plus one FIFO of KSigInfo per
/// signal. Used both per-thread and (shared) per thread-group.
///
/// The mask is atomic so recalc paths on other threads can read it with
/// acquire; all mutation — mask and queues — happens under the owning
/// sigacts lock.
pub struct PendingQueue {
    mask: AtomicU64,
    queues: UnsafeCell<[ListNode; NSIG]>,
}

unsafe impl Sync for PendingQueue {}
unsafe impl Send for PendingQueue {}

impl PendingQueue {
    pub const fn new() -> Self {
        const EMPTY: ListNode = ListNode::new();
        PendingQueue {
            mask: AtomicU64::new(0),
            queues: UnsafeCell::new([EMPTY; NSIG]),
        }
    }

    /// Self-link the per-signal queue heads. Must run once before use.
    pub fn init(&self) {
        let queues = self.queues.get();
        for i in 0..NSIG {
            unsafe { list::init(&mut (*queues)[i]) };
        }
    }

    pub fn mask(&self) -> SigSet {
        SigSet(self.mask.load(Ordering::Acquire))
    }

    pub fn set_bit(&self, signo: i32) {
        self.mask.fetch_or(1 << signo, Ordering::SeqCst);
    }

    pub fn clear_bit(&self, signo: i32) {
        self.mask.fetch_and(!(1 << signo), Ordering::SeqCst);
    }

    pub fn clear_set(&self, set: SigSet) {
        self.mask.fetch_and(!set.0, Ordering::SeqCst);
    }

    pub fn clear_all_bits(&self) {
        self.mask.store(0, Ordering::SeqCst);
    }

    /// Head of the KSigInfo FIFO for one signal.
    ///
    /// # Safety
    /// Caller must hold the owning sigacts lock.
    pub unsafe fn queue_head(&self, signo: i32) -> *mut ListNode {
        &mut (*self.queues.get())[(signo - 1) as usize]
    }

    /// Number of queued records for one signal.
    ///
    /// # Safety
    /// Caller must hold the owning sigacts lock.
    pub unsafe fn queue_len(&self, signo: i32) -> usize {
        list::iter(self.queue_head(signo)).count()
    }

    /// Append a record, evicting the oldest entry at the cap.
    ///
    /// # Safety
    /// Caller must hold the owning sigacts lock.
    pub unsafe fn enqueue_info(&self, ksi: alloc::boxed::Box<KSigInfo>) {
        let head = self.queue_head(ksi.signo);
        if self.queue_len(ksi.signo) >= MAX_SIGINFO_PER_SIGNAL {
            let oldest = list::pop(head);
            if !oldest.is_null() {
                drop(alloc::boxed::Box::from_raw(container_of!(
                    oldest, KSigInfo, entry
                )));
            }
        }
        let raw = alloc::boxed::Box::into_raw(ksi);
        list::init(&mut (*raw).entry);
        list::push_back(head, &mut (*raw).entry);
    }

    /// Pop the oldest record for `signo`, clearing the pending bit when
    /// the queue drains.
    ///
    /// # Safety
    /// Caller must hold the owning sigacts lock.
    pub unsafe fn dequeue_info(&self, signo: i32) -> Option<alloc::boxed::Box<KSigInfo>> {
        let head = self.queue_head(signo);
        let node = list::pop(head);
        if list::is_empty(head) {
            self.clear_bit(signo);
        }
        if node.is_null() {
            None
        } else {
            Some(alloc::boxed::Box::from_raw(container_of!(
                node, KSigInfo, entry
            )))
        }
    }

    /// Free every queued record, optionally for one signal only
    /// (signo == 0 purges everything and zeroes the mask).
    ///
    /// # Safety
    /// Caller must hold the owning sigacts lock.
    pub unsafe fn purge(&self, signo: i32) {
        if signo == 0 {
            for s in 1..NSIG as i32 {
                while self.dequeue_info(s).is_some() {}
            }
            self.clear_all_bits();
        } else {
            while self.dequeue_info(signo).is_some() {}
            self.clear_bit(signo);
        }
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SigStackFlags: u32 {
        const AUTOREARM = 0x1;
        const ONSTACK   = 0x2;
        const DISABLE   = 0x4;
    }
}

/// Alternate signal stack.
#[derive(Debug, Clone, Copy)]
pub struct SigStack {
    pub sp: u64,
    pub flags: SigStackFlags,
    pub size: u64,
}

impl SigStack {
    pub const fn disabled() -> Self {
        SigStack {
            sp: 0,
            flags: SigStackFlags::DISABLE,
            size: 0,
        }
    }
}

/// Saved user context for signal delivery; restored by sigreturn. Lives
/// on the user stack, linked through uc_link.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct UContext {
    pub uc_link: u64,
    pub uc_sigmask: SigSet,
    pub uc_stack: SigStack,
    pub uc_mcontext: crate::trap::UTrapFrame,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_actions_match_posix() {
        assert_eq!(signo_default_action(SIGKILL), SigDefact::Term);
        assert_eq!(signo_default_action(SIGSTOP), SigDefact::Stop);
        assert_eq!(signo_default_action(SIGCONT), SigDefact::Cont);
        assert_eq!(signo_default_action(SIGCHLD), SigDefact::Ign);
        assert_eq!(signo_default_action(SIGSEGV), SigDefact::Core);
        assert_eq!(signo_default_action(0), SigDefact::Invalid);
        assert_eq!(signo_default_action(32), SigDefact::Invalid);
        for signo in 1..NSIG as i32 {
            assert_ne!(signo_default_action(signo), SigDefact::Invalid);
        }
    }

    #[test]
    fn sigset_first_is_lowest() {
        let mut set = SigSet::empty();
        assert_eq!(set.first(), 0);
        set.add(SIGTERM);
        set.add(SIGHUP);
        assert_eq!(set.first(), SIGHUP);
        set.del(SIGHUP);
        assert_eq!(set.first(), SIGTERM);
    }

    #[test]
    fn pending_queue_caps_and_evicts_oldest() {
        let pq = PendingQueue::new();
        pq.init();
        unsafe {
            for seq in 0..(MAX_SIGINFO_PER_SIGNAL + 3) {
                let info = SigInfo {
                    si_value: seq as u64,
                    ..Default::default()
                };
                pq.enqueue_info(alloc::boxed::Box::new(KSigInfo::new(SIGUSR1, info)));
                pq.set_bit(SIGUSR1);
            }
            assert_eq!(pq.queue_len(SIGUSR1), MAX_SIGINFO_PER_SIGNAL);
            // The three oldest entries were evicted.
            let first = pq.dequeue_info(SIGUSR1).unwrap();
            assert_eq!(first.info.si_value, 3);
            pq.purge(0);
            assert!(pq.mask().is_empty());
            assert_eq!(pq.queue_len(SIGUSR1), 0);
        }
    }

    #[test]
    fn dequeue_clears_bit_on_drain() {
        let pq = PendingQueue::new();
        pq.init();
        unsafe {
            pq.enqueue_info(alloc::boxed::Box::new(KSigInfo::new(
                SIGUSR2,
                SigInfo::default(),
            )));
            pq.set_bit(SIGUSR2);
            assert!(pq.mask().contains(SIGUSR2));
            assert!(pq.dequeue_info(SIGUSR2).is_some());
            assert!(!pq.mask().contains(SIGUSR2));
            assert!(pq.dequeue_info(SIGUSR2).is_none());
        }
    }
}
