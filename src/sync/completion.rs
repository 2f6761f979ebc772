/*
 * Completion: a saturating done-counter plus a wait queue.
 *
 * complete() adds one unit and wakes one waiter; complete_all() saturates
 * the counter and drains every waiter. The all-wake path moves waiters to
 * a temporary queue before dropping the internal lock and wakes them
 * outside it — waking under the lock would convoy every woken thread on
 * re-acquisition inside its sleep callback.
 */

use core::cell::Cell;

use crate::proc::tq::Tq;
use crate::sync::RawSpinLock;

const MAX_COMPLETIONS: u32 = 65535;

pub struct Completion {
    lock: RawSpinLock,
    done: Cell<u32>,
    wait_queue: Tq,
}

unsafe impl Sync for Completion {}
unsafe impl Send for Completion {}

impl Completion {
    pub const fn new(name: &'static str) -> Self {
        Completion {
            lock: RawSpinLock::new("completion"),
            done: Cell::new(0),
            wait_queue: Tq::new(name),
        }
    }

    /// Self-link the wait queue. Once, before first use.
    pub fn init(&self) {
        self.wait_queue.init();
    }

    /// Reset the counter (reusing a completion for another round).
    pub fn reinit(&self) {
        self.lock.lock();
        self.done.set(0);
        self.lock.unlock();
    }

    fn try_consume_locked(&self) -> bool {
        let done = self.done.get();
        if done == 0 {
            return false;
        }
        if done != MAX_COMPLETIONS {
            self.done.set(done - 1);
        }
        true
    }

    /// Consume one unit without blocking.
    pub fn try_wait(&self) -> bool {
        self.lock.lock();
        let ok = self.try_consume_locked();
        self.lock.unlock();
        ok
    }

    /// Consume one unit, blocking (uninterruptibly) until available.
    pub fn wait(&self) {
        self.lock.lock();
        while !self.try_consume_locked() {
            let _ = self.wait_queue.wait(&self.lock);
        }
        // Units may have accumulated while we slept; pass the surplus on.
        if self.done.get() > 0 && !self.wait_queue.is_empty() {
            unsafe { self.wait_queue.wakeup(0, 0) };
        }
        self.lock.unlock();
    }

    /// Add one unit and wake one waiter.
    pub fn complete(&self) {
        self.lock.lock();
        if self.done.get() != MAX_COMPLETIONS {
            self.done.set(self.done.get() + 1);
        }
        if !self.wait_queue.is_empty() {
            unsafe { self.wait_queue.wakeup(0, 0) };
        }
        self.lock.unlock();
    }

    /// Saturate the counter and wake every waiter.
    pub fn complete_all(&self) {
        let temp = Tq::new("completion_tmp");
        temp.init();

        self.lock.lock();
        self.done.set(MAX_COMPLETIONS);
        unsafe {
            let _ = temp.bulk_move_from(&self.wait_queue);
        }
        self.lock.unlock();

        if !temp.is_empty() {
            unsafe { temp.wakeup_all(0, 0) };
        }
    }

    /// True when no thread is waiting.
    pub fn is_settled(&self) -> bool {
        self.lock.lock();
        let settled = self.wait_queue.is_empty();
        self.lock.unlock();
        settled
    }
}
