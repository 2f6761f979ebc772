/*
 * Read-Copy-Update.
 *
 * Read side: rcu_read_lock()/rcu_read_unlock() maintain a nesting counter
 * on the current thread (so a section survives yielding and migration); a
 * global count of threads inside outermost sections gates grace-period
 * completion. Readers never block on writers.
 *
 * Update side: call_rcu() queues a callback on the calling CPU's
 * segmented list; synchronize_rcu() queues a completion-firing callback
 * and sleeps. The tick only advances the grace-period machinery;
 * callbacks are invoked by the rcu kthread (the softirq stand-in), in
 * thread context, because they free memory and the heap lock is not
 * interrupt safe. Callbacks still must not block.
 *
 * Grace periods: a GP starts when any CPU's tick finds callbacks waiting
 * and none is in progress. It completes once every online CPU has passed
 * a quiescent state (context switch, idle, or a tick outside any read
 * section) after the start timestamp AND no thread sits in a read-side
 * section. Completion advances gp_seq; each CPU then promotes its
 * segments NEXT -> NEXT_READY -> WAIT -> DONE and invokes DONE callbacks.
 *
 * Expedited grace periods kick every hart with a reschedule IPI so the
 * quiescent states arrive within an IPI round-trip.
 */

use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use crate::smp::{self, NCPU};
use crate::sync::{Completion, RawSpinLock};

/// Deferred-free callback head, embedded in the object to reclaim.
pub struct RcuHead {
    pub next: *mut RcuHead,
    pub func: Option<unsafe fn(*mut RcuHead)>,
}

impl RcuHead {
    pub const fn new() -> Self {
        RcuHead {
            next: ptr::null_mut(),
            func: None,
        }
    }
}

const SEG_DONE: usize = 0;
const SEG_WAIT: usize = 1;
const SEG_NEXT_READY: usize = 2;
const SEG_NEXT: usize = 3;
const NSEGS: usize = 4;

/// Singly-linked FIFO of callbacks.
struct CbQueue {
    head: *mut RcuHead,
    tail: *mut RcuHead,
    len: u64,
}

impl CbQueue {
    const fn new() -> Self {
        CbQueue {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            len: 0,
        }
    }

    unsafe fn push(&mut self, cb: *mut RcuHead) {
        (*cb).next = ptr::null_mut();
        if self.tail.is_null() {
            self.head = cb;
        } else {
            (*self.tail).next = cb;
        }
        self.tail = cb;
        self.len += 1;
    }

    fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Append everything from `other`, leaving it empty.
    unsafe fn splice_from(&mut self, other: &mut CbQueue) {
        if other.is_empty() {
            return;
        }
        if self.tail.is_null() {
            self.head = other.head;
        } else {
            (*self.tail).next = other.head;
        }
        self.tail = other.tail;
        self.len += other.len;
        other.head = ptr::null_mut();
        other.tail = ptr::null_mut();
        other.len = 0;
    }

    unsafe fn pop(&mut self) -> *mut RcuHead {
        let cb = self.head;
        if !cb.is_null() {
            self.head = (*cb).next;
            if self.head.is_null() {
                self.tail = ptr::null_mut();
            }
            self.len -= 1;
        }
        cb
    }
}

struct RcuSegs {
    segs: [CbQueue; NSEGS],
    /// gp_seq each segment's callbacks wait for (WAIT slot meaningful).
    gp_seq_needed: [u64; NSEGS],
}

struct RcuCpuData {
    lock: RawSpinLock,
    inner: core::cell::UnsafeCell<RcuSegs>,
    qs_count: AtomicU64,
    cb_invoked: AtomicU64,
}

impl RcuCpuData {
    const fn new() -> Self {
        const Q: CbQueue = CbQueue::new();
        RcuCpuData {
            lock: RawSpinLock::new("rcu_cpu"),
            inner: core::cell::UnsafeCell::new(RcuSegs {
                segs: [Q; NSEGS],
                gp_seq_needed: [0; NSEGS],
            }),
            qs_count: AtomicU64::new(0),
            cb_invoked: AtomicU64::new(0),
        }
    }

    /// # Safety
    /// Caller must hold `lock`.
    #[allow(clippy::mut_from_ref)]
    unsafe fn segs(&self) -> &mut RcuSegs {
        &mut *self.inner.get()
    }

    fn has_callbacks(&self) -> bool {
        self.lock.lock();
        let any = unsafe { self.segs().segs.iter().any(|s| !s.is_empty()) };
        self.lock.unlock();
        any
    }
}

unsafe impl Sync for RcuCpuData {}

struct RcuState {
    /// Completed grace periods.
    gp_seq: AtomicU64,
    gp_in_progress: AtomicBool,
    gp_start_timestamp: AtomicU64,
    gp_count: AtomicU64,
    expedited_count: AtomicU64,
    cpu_data: [RcuCpuData; NCPU],
}

static RCU: RcuState = {
    const CPU: RcuCpuData = RcuCpuData::new();
    RcuState {
        gp_seq: AtomicU64::new(0),
        gp_in_progress: AtomicBool::new(false),
        gp_start_timestamp: AtomicU64::new(0),
        gp_count: AtomicU64::new(0),
        expedited_count: AtomicU64::new(0),
        cpu_data: [CPU; NCPU],
    }
};

/// Threads currently inside an outermost read-side section.
static ACTIVE_READERS: AtomicI64 = AtomicI64::new(0);

/// Callbacks invoked per tick, to bound interrupt-context work.
const CB_BATCH: usize = 32;

fn reader_nesting_bump(delta: i32) -> i32 {
    match smp::current() {
        Some(p) => {
            let old = p.rcu_read_lock_nesting.fetch_add(delta, Ordering::SeqCst);
            old + delta
        }
        None => {
            // Early boot: fall back to a per-CPU counter.
            let cell = smp::cpu_local().boot_rcu_nesting();
            let v = cell.get() + delta;
            cell.set(v);
            v
        }
    }
}

/// Enter a read-side critical section. Never blocks; sections may nest
/// and may span yields and CPU migration.
pub fn rcu_read_lock() {
    let nesting = reader_nesting_bump(1);
    if nesting == 1 {
        ACTIVE_READERS.fetch_add(1, Ordering::SeqCst);
    }
}

/// Leave a read-side critical section.
pub fn rcu_read_unlock() {
    let nesting = reader_nesting_bump(-1);
    assert!(nesting >= 0, "rcu_read_unlock: unbalanced");
    if nesting == 0 {
        ACTIVE_READERS.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Current thread's nesting depth (diagnostics, asserts).
pub fn rcu_read_lock_nesting() -> i32 {
    match smp::current() {
        Some(p) => p.rcu_read_lock_nesting.load(Ordering::SeqCst),
        None => smp::cpu_local().boot_rcu_nesting().get(),
    }
}

/// Queue `func(head)` for invocation after a full grace period. Callable
/// from any context; the callback runs in interrupt context and must not
/// block.
pub fn call_rcu(head: *mut RcuHead, func: unsafe fn(*mut RcuHead)) {
    let cpu_data = &RCU.cpu_data[crate::arch::hartid()];
    cpu_data.lock.lock();
    unsafe {
        (*head).func = Some(func);
        // New arrivals always enter NEXT; they are promoted only at a GP
        // boundary so no callback can ride a grace period that started
        // before it was queued.
        cpu_data.segs().segs[SEG_NEXT].push(head);
    }
    cpu_data.lock.unlock();
}

struct SyncWaiter {
    head: RcuHead,
    done: Completion,
}

unsafe fn sync_rcu_cb(head: *mut RcuHead) {
    let waiter = container_of!(head, SyncWaiter, head);
    (*waiter).done.complete();
}

/// Block until every reader that existed when the call began has left its
/// critical section. Must be called from thread context, no locks held.
pub fn synchronize_rcu() {
    assert!(!smp::cpu_local().in_interrupt(), "synchronize_rcu in interrupt");
    assert_eq!(rcu_read_lock_nesting(), 0, "synchronize_rcu inside read section");

    let mut waiter = SyncWaiter {
        head: RcuHead::new(),
        done: Completion::new("sync_rcu"),
    };
    waiter.done.init();
    call_rcu(&mut waiter.head, sync_rcu_cb);
    waiter.done.wait();
}

/// Expedited variant: kick every hart so quiescent states arrive at IPI
/// latency, then wait for the grace period like synchronize_rcu().
pub fn synchronize_rcu_expedited() {
    RCU.expedited_count.fetch_add(1, Ordering::Relaxed);
    crate::smp::ipi::ipi_send_all_but_self(crate::smp::ipi::IPI_REASON_RESCHEDULE);
    synchronize_rcu();
}

/// Report a quiescent state for the calling hart.
fn report_qs() {
    let cpu = smp::cpu_local();
    cpu.rcu_timestamp.store(crate::arch::time(), Ordering::Release);
    RCU.cpu_data[crate::arch::hartid()]
        .qs_count
        .fetch_add(1, Ordering::Relaxed);
}

fn gp_completed_by_all() -> bool {
    let start = RCU.gp_start_timestamp.load(Ordering::Acquire);
    for cpu in 0..crate::online_cpus() {
        if smp::cpu_by_id(cpu).rcu_timestamp.load(Ordering::Acquire) <= start {
            return false;
        }
    }
    ACTIVE_READERS.load(Ordering::SeqCst) == 0
}

/// Promote this CPU's segments across a GP boundary. Tick context.
fn advance_segments(hart: usize) -> bool {
    let cpu_data = &RCU.cpu_data[hart];
    cpu_data.lock.lock();

    let seq = RCU.gp_seq.load(Ordering::Acquire);
    let have_done;
    unsafe {
        let inner = cpu_data.segs();

        // Completed GP retires the WAIT segment.
        if seq >= inner.gp_seq_needed[SEG_WAIT] && !inner.segs[SEG_WAIT].is_empty() {
            let mut wait = core::mem::replace(&mut inner.segs[SEG_WAIT], CbQueue::new());
            inner.segs[SEG_DONE].splice_from(&mut wait);
        }

        // A GP in progress adopts NEXT_READY into WAIT (those callbacks
        // were queued before it started); NEXT moves up behind them.
        if RCU.gp_in_progress.load(Ordering::Acquire) {
            if !inner.segs[SEG_NEXT_READY].is_empty() && inner.segs[SEG_WAIT].is_empty() {
                let mut ready = core::mem::replace(&mut inner.segs[SEG_NEXT_READY], CbQueue::new());
                inner.segs[SEG_WAIT].splice_from(&mut ready);
                inner.gp_seq_needed[SEG_WAIT] = seq + 1;
            }
            if !inner.segs[SEG_NEXT].is_empty() && inner.segs[SEG_NEXT_READY].is_empty() {
                let mut next = core::mem::replace(&mut inner.segs[SEG_NEXT], CbQueue::new());
                inner.segs[SEG_NEXT_READY].splice_from(&mut next);
            }
        }

        have_done = !inner.segs[SEG_DONE].is_empty();
    }
    cpu_data.lock.unlock();
    have_done
}

/// Invoke a bounded batch of DONE callbacks for one CPU's list. Thread
/// context only (callbacks free memory). Returns the number invoked.
fn invoke_done(hart: usize) -> usize {
    let cpu_data = &RCU.cpu_data[hart];
    let mut invoked = 0;
    while invoked < CB_BATCH {
        cpu_data.lock.lock();
        let cb = unsafe { cpu_data.segs().segs[SEG_DONE].pop() };
        cpu_data.lock.unlock();
        if cb.is_null() {
            break;
        }
        let func = unsafe { (*cb).func.expect("rcu callback without function") };
        // May free its object or re-queue; must not sleep.
        unsafe { func(cb) };
        invoked += 1;
    }
    cpu_data.cb_invoked.fetch_add(invoked as u64, Ordering::Relaxed);
    invoked
}

use crate::proc::tq::Tq;

static RCU_WORK_LOCK: RawSpinLock = RawSpinLock::new("rcu_work");
static RCU_WORK_QUEUE: Tq = Tq::new("rcu_work_q");

/// The rcu kthread: the softirq stand-in that runs ready callbacks in
/// thread context. Parked on its queue until a tick reports DONE work.
pub fn rcu_thread_main(_a0: usize, _a1: usize) {
    loop {
        let mut total = 0;
        for hart in 0..crate::online_cpus() {
            total += invoke_done(hart);
        }
        if total == 0 {
            RCU_WORK_LOCK.lock();
            let _ = RCU_WORK_QUEUE.wait_in_state(
                &RCU_WORK_LOCK,
                crate::proc::thread::ThreadState::Interruptible,
            );
            RCU_WORK_LOCK.unlock();
        }
    }
}

/// Start the rcu kthread. Hart 0, after the scheduler is up.
pub fn rcu_init() {
    RCU_WORK_QUEUE.init();
    crate::proc::clone::kthread_create("rcu", rcu_thread_main, 0, 0)
        .expect("failed to start rcu kthread");
}

/// Per-hart RCU housekeeping from the timer tick (interrupt context).
pub fn rcu_tick() {
    let hart = crate::arch::hartid();

    // A tick outside any read-side section is a quiescent state.
    if rcu_read_lock_nesting() == 0 {
        report_qs();
    }

    // Start a grace period when callbacks are waiting and none runs.
    if !RCU.gp_in_progress.load(Ordering::Acquire) && RCU.cpu_data[hart].has_callbacks() {
        if RCU
            .gp_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            RCU.gp_start_timestamp.store(crate::arch::time(), Ordering::Release);
            RCU.gp_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    // Try to finish the grace period in flight.
    if RCU.gp_in_progress.load(Ordering::Acquire) && gp_completed_by_all() {
        RCU.gp_seq.fetch_add(1, Ordering::SeqCst);
        RCU.gp_in_progress.store(false, Ordering::SeqCst);
    }

    if advance_segments(hart) {
        // Ready callbacks: kick the rcu kthread.
        RCU_WORK_LOCK.lock();
        unsafe { RCU_WORK_QUEUE.wakeup(0, 0) };
        RCU_WORK_LOCK.unlock();
    }
}

/// Completed grace-period sequence number (diagnostics, tests).
pub fn gp_seq() -> u64 {
    RCU.gp_seq.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nesting_counter_balances() {
        assert_eq!(rcu_read_lock_nesting(), 0);
        rcu_read_lock();
        rcu_read_lock();
        assert_eq!(rcu_read_lock_nesting(), 2);
        rcu_read_unlock();
        assert_eq!(rcu_read_lock_nesting(), 1);
        rcu_read_unlock();
        assert_eq!(rcu_read_lock_nesting(), 0);
        assert_eq!(ACTIVE_READERS.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cb_queue_fifo_and_splice() {
        let mut a = CbQueue::new();
        let mut b = CbQueue::new();
        let mut h1 = RcuHead::new();
        let mut h2 = RcuHead::new();
        let mut h3 = RcuHead::new();
        unsafe {
            a.push(&mut h1);
            b.push(&mut h2);
            b.push(&mut h3);
            a.splice_from(&mut b);
            assert!(b.is_empty());
            assert_eq!(a.len, 3);
            assert_eq!(a.pop(), &mut h1 as *mut RcuHead);
            assert_eq!(a.pop(), &mut h2 as *mut RcuHead);
            assert_eq!(a.pop(), &mut h3 as *mut RcuHead);
            assert!(a.pop().is_null());
        }
    }
}
