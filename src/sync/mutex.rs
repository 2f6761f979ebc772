/*
 * Sleeping mutex.
 *
 * Fast path: a CAS on the holder pid. Contended path: take the internal
 * spinlock, retry the CAS (the holder may have just released), then park
 * on the wait queue. The releaser hands the mutex directly to the next
 * waiter by writing its pid into the holder field before waking it, so a
 * woken waiter finds itself already the owner.
 *
 * Thread context only: entry asserts no spinlock held and not in an
 * interrupt.
 */

use core::sync::atomic::{AtomicI32, Ordering};

use crate::proc::thread::Pid;
use crate::proc::tq::Tq;
use crate::smp;
use crate::sync::RawSpinLock;

const NO_HOLDER: Pid = -1;

pub struct Mutex {
    lk: RawSpinLock,
    wait_queue: Tq,
    holder: AtomicI32,
    name: &'static str,
}

unsafe impl Sync for Mutex {}
unsafe impl Send for Mutex {}

impl Mutex {
    pub const fn new(name: &'static str) -> Self {
        Mutex {
            lk: RawSpinLock::new("mutex_spin"),
            wait_queue: Tq::new("mutex_queue"),
            holder: AtomicI32::new(NO_HOLDER),
            name,
        }
    }

    pub fn init(&self) {
        self.wait_queue.init();
    }

    fn holder(&self) -> Pid {
        self.holder.load(Ordering::Acquire)
    }

    fn try_set_holder(&self, pid: Pid) -> bool {
        self.holder
            .compare_exchange(NO_HOLDER, pid, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Wake the next waiter (if any) and make it the owner; otherwise
    /// release ownership. Caller holds the internal spinlock.
    fn pass_on_locked(&self) {
        let next = unsafe { self.wait_queue.wakeup(0, 0) };
        match next {
            Some(t) => self.holder.store(t.pid, Ordering::Release),
            None => self.holder.store(NO_HOLDER, Ordering::Release),
        }
    }

    /// Acquire; blocks uninterruptibly while contended. Returns 0, or a
    /// negative errno if the wait was broken asynchronously.
    pub fn lock(&self) -> i64 {
        let p = smp::current().expect("mutex_lock: no current thread");
        let cpu = smp::cpu_local();
        assert_eq!(cpu.spin_depth(), 0, "mutex {}: spinlock held", self.name);
        assert!(!cpu.in_interrupt(), "mutex {}: interrupt context", self.name);

        if self.try_set_holder(p.pid) {
            return 0;
        }

        self.lk.lock();
        if self.try_set_holder(p.pid) {
            // Released between the fast path and taking the spinlock.
            self.lk.unlock();
            return 0;
        }
        assert!(
            self.holder() != p.pid,
            "mutex {}: deadlock, thread {} already holds it",
            self.name,
            p.pid
        );

        while self.holder() != p.pid {
            let (err, _) = self.wait_queue.wait(&self.lk);
            if err != 0 {
                // Interrupted; if ownership was handed to us anyway,
                // pass it along before bailing out.
                if self.holder() == p.pid {
                    self.pass_on_locked();
                }
                self.lk.unlock();
                return err;
            }
        }
        self.lk.unlock();
        0
    }

    /// Acquire without blocking. Returns true on success.
    pub fn try_lock(&self) -> bool {
        let p = smp::current().expect("mutex_trylock: no current thread");
        let cpu = smp::cpu_local();
        assert_eq!(cpu.spin_depth(), 0, "mutex {}: spinlock held", self.name);
        assert!(!cpu.in_interrupt(), "mutex {}: interrupt context", self.name);
        self.try_set_holder(p.pid)
    }

    pub fn unlock(&self) {
        self.lk.lock();
        let p = smp::current().expect("mutex_unlock: no current thread");
        assert!(
            self.holder() == p.pid,
            "mutex {}: unlock by non-owner {}",
            self.name,
            p.pid
        );
        self.pass_on_locked();
        self.lk.unlock();
    }

    /// Does the calling thread hold this mutex?
    pub fn holding(&self) -> bool {
        match smp::current() {
            Some(p) => self.holder() == p.pid,
            None => false,
        }
    }
}
