/*
 * Counting semaphore.
 *
 * Waiters park on the keyed thread tree, sorted by scheduling priority,
 * so a post hands the unit to the highest-priority waiter rather than
 * FIFO order.
 */

use core::cell::Cell;

use crate::errno::EAGAIN;
use crate::proc::thread::ThreadState;
use crate::proc::tq::TTree;
use crate::smp;
use crate::sync::RawSpinLock;

pub const SEM_VALUE_MAX: i32 = 2147483640;

pub struct Semaphore {
    lk: RawSpinLock,
    waiters: TTree,
    value: Cell<i32>,
    name: &'static str,
}

unsafe impl Sync for Semaphore {}
unsafe impl Send for Semaphore {}

impl Semaphore {
    pub const fn new(name: &'static str, value: i32) -> Self {
        Semaphore {
            lk: RawSpinLock::new("sem_spin"),
            waiters: TTree::new("sem_waiters"),
            value: Cell::new(value),
            name,
        }
    }

    pub fn init(&self) {}

    /// Decrement, blocking interruptibly at zero. Returns 0 or -EINTR.
    pub fn wait(&self) -> i64 {
        let cpu = smp::cpu_local();
        assert_eq!(cpu.spin_depth(), 0, "sem {}: wait with spinlock held", self.name);
        assert!(!cpu.in_interrupt(), "sem {}: wait in interrupt", self.name);
        let p = smp::current().expect("sem wait outside thread context");

        self.lk.lock();
        while self.value.get() <= 0 {
            let key = p.se.priority() as u64;
            let (err, _) = self
                .waiters
                .wait_in_state(key, &self.lk, ThreadState::Interruptible);
            if err != 0 {
                self.lk.unlock();
                return err;
            }
        }
        self.value.set(self.value.get() - 1);
        self.lk.unlock();
        0
    }

    /// Decrement without blocking. Returns 0 or -EAGAIN.
    pub fn try_wait(&self) -> i64 {
        self.lk.lock();
        let ret = if self.value.get() > 0 {
            self.value.set(self.value.get() - 1);
            0
        } else {
            -EAGAIN
        };
        self.lk.unlock();
        ret
    }

    /// Increment and wake the best-priority waiter.
    pub fn post(&self) -> i64 {
        self.lk.lock();
        if self.value.get() >= SEM_VALUE_MAX {
            self.lk.unlock();
            return -crate::errno::EINVAL;
        }
        self.value.set(self.value.get() + 1);
        unsafe {
            if let Some(key) = self.waiters.key_min() {
                self.waiters.wakeup_one(key, 0, 0);
            }
        }
        self.lk.unlock();
        0
    }

    pub fn value(&self) -> i32 {
        self.lk.lock();
        let v = self.value.get();
        self.lk.unlock();
        v
    }
}
