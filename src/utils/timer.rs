/*
 * Kernel timekeeping: the jiffies counter and a deadline-ordered timer
 * list.
 *
 * Hart 0's timer interrupt advances jiffies and expires timers. Timer
 * callbacks run in interrupt context WITH the timer lock held: they may
 * take scheduler locks (wakeups) but must never sleep or touch the timer
 * list themselves. Waiters with stack-allocated nodes rely on this — once
 * the arming thread re-acquires the timer lock and observes `expired`,
 * the callback has fully finished and the node may go out of scope.
 */

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::collections::list::{self, ListNode};
use crate::errno::EINTR;
use crate::proc::thread::{Thread, ThreadState};
use crate::proc::tq::Tq;
use crate::sync::RawSpinLock;

/// Timer ticks per second (10 ms jiffies).
pub const TICK_HZ: u64 = 100;
pub const TICK_MS: u64 = 1000 / TICK_HZ;

static JIFFIES: AtomicU64 = AtomicU64::new(0);

static TIMER_LOCK: RawSpinLock = RawSpinLock::new("timer_lock");
/// Deadline-ordered pending timers; guarded by TIMER_LOCK.
static TIMER_LIST: TimerList = TimerList::new();
/// Threads inside sleep_ms; guarded by TIMER_LOCK.
static SLEEP_QUEUE: Tq = Tq::new("sleep_ms");

struct TimerList {
    head: core::cell::UnsafeCell<ListNode>,
}

unsafe impl Sync for TimerList {}

impl TimerList {
    const fn new() -> Self {
        TimerList {
            head: core::cell::UnsafeCell::new(ListNode::new()),
        }
    }
}

/// A pending timer. Embeds the list linkage so arming is allocation free;
/// sleep_ms keeps its node on the stack.
pub struct TimerNode {
    entry: ListNode,
    deadline: u64,
    func: fn(usize),
    arg: usize,
    expired: AtomicBool,
}

impl TimerNode {
    pub fn new(func: fn(usize), arg: usize) -> Self {
        TimerNode {
            entry: ListNode::new(),
            deadline: 0,
            func,
            arg,
            expired: AtomicBool::new(false),
        }
    }

    pub fn expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }
}

pub fn timer_init() {
    unsafe { list::init(TIMER_LIST.head.get()) };
    SLEEP_QUEUE.init();
}

/// Jiffies since boot.
pub fn jiffies() -> u64 {
    JIFFIES.load(Ordering::Acquire)
}

pub fn ms_to_jiffies(ms: u64) -> u64 {
    (ms + TICK_MS - 1) / TICK_MS
}

/// Arm a timer `ticks` jiffies from now.
///
/// # Safety
/// Caller holds TIMER_LOCK (use timer_add for the locked variant); the
/// node must stay pinned until it expires or is cancelled.
pub unsafe fn timer_set_locked(tn: *mut TimerNode, ticks: u64) {
    assert!(list::is_detached(&(*tn).entry) , "timer_set: node already armed");
    (*tn).deadline = jiffies() + ticks.max(1);
    (*tn).expired.store(false, Ordering::Release);
    list::init(&mut (*tn).entry);

    // Keep the list deadline-ordered: insert before the first later node.
    let head = TIMER_LIST.head.get();
    let mut pos = (*head).next;
    while pos != head {
        let cur = container_of!(pos, TimerNode, entry);
        if (*cur).deadline > (*tn).deadline {
            break;
        }
        pos = (*pos).next;
    }
    list::insert_before(pos, &mut (*tn).entry);
}

/// Arm a timer (locked variant of timer_set_locked).
///
/// # Safety
/// The node must stay pinned until expiry or cancellation.
pub unsafe fn timer_add(tn: *mut TimerNode, ticks: u64) {
    TIMER_LOCK.lock();
    timer_set_locked(tn, ticks);
    TIMER_LOCK.unlock();
}

/// Disarm a pending timer. Returns true when the timer was still queued
/// (and therefore will not fire).
///
/// # Safety
/// Caller holds TIMER_LOCK; `tn` must be a node previously armed.
pub unsafe fn timer_cancel_locked(tn: *mut TimerNode) -> bool {
    if list::is_detached(&(*tn).entry) {
        return false;
    }
    list::detach(&mut (*tn).entry);
    true
}

/// Hart 0's tick: advance jiffies and run expired timers.
pub fn on_tick() {
    if crate::arch::hartid() != 0 {
        return;
    }
    let now = JIFFIES.fetch_add(1, Ordering::SeqCst) + 1;

    TIMER_LOCK.lock();
    unsafe {
        let head = TIMER_LIST.head.get();
        loop {
            let first = list::first(head);
            if first.is_null() {
                break;
            }
            let tn = container_of!(first, TimerNode, entry);
            if (*tn).deadline > now {
                break;
            }
            list::detach(first);
            (*tn).expired.store(true, Ordering::Release);
            let func = (*tn).func;
            let arg = (*tn).arg;
            // Callback contract: runs under TIMER_LOCK, may wake threads,
            // must not sleep or re-arm.
            func(arg);
        }
    }
    TIMER_LOCK.unlock();
}

fn sleep_timeout_cb(arg: usize) {
    let p = unsafe { &*(arg as *const Thread) };
    crate::sched::scheduler_wakeup_timeout(p);
}

/// Interruptible timed sleep. Returns 0 after the full interval, or
/// -EINTR when a signal cut it short.
pub fn sleep_ms(ms: u64) -> i64 {
    let p = match crate::smp::current() {
        Some(p) => p,
        None => return 0,
    };
    if ms == 0 {
        crate::sched::scheduler_yield();
        return 0;
    }

    let mut tn = TimerNode::new(sleep_timeout_cb, p as *const Thread as usize);
    unsafe { list::init(&mut tn.entry) };

    TIMER_LOCK.lock();
    unsafe { timer_set_locked(&mut tn, ms_to_jiffies(ms)) };
    let (_err, _) = SLEEP_QUEUE.wait_in_state(&TIMER_LOCK, ThreadState::Interruptible);

    // Back under TIMER_LOCK. If the timer has not fired we were woken
    // early (signal): disarm it before the node leaves the stack.
    let fired = tn.expired();
    if !fired {
        unsafe { timer_cancel_locked(&mut tn) };
    }
    TIMER_LOCK.unlock();

    if fired {
        0
    } else {
        -EINTR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jiffies_conversion_rounds_up() {
        assert_eq!(ms_to_jiffies(0), 0);
        assert_eq!(ms_to_jiffies(1), 1);
        assert_eq!(ms_to_jiffies(10), 1);
        assert_eq!(ms_to_jiffies(11), 2);
        assert_eq!(ms_to_jiffies(100), 10);
    }
}
