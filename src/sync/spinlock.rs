/*
 * Interrupt-disabling spinlocks.
 *
 * Acquisition disables interrupts on the calling hart (push_off), spins on
 * a test-and-set word, then records the owner hart for deadlock debugging.
 * Release clears the owner, release-stores the word, and undoes one level
 * of push_off — interrupts come back only when the outermost level pops and
 * they were enabled to begin with.
 *
 * Two shapes are exported:
 *
 * - RawSpinLock: bare lock()/unlock(), for the non-lexical flows the
 *   scheduler and wait queues need (a lock released inside a sleep callback
 *   and re-acquired after wakeup, a run-queue lock released by the thread
 *   that gets switched to).
 * - SpinLock<T>: RawSpinLock plus the protected data and an RAII guard,
 *   for plain lexical critical sections.
 *
 * Contract: holding any spinlock forbids sleeping. The sleeping primitives
 * assert `spin_depth == 0` on entry.
 */

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use crate::smp::atomic::cpu_relax;
use crate::smp::cpu_local;

const NO_OWNER: i32 = -1;

pub struct RawSpinLock {
    locked: AtomicBool,
    /// Hart currently holding the lock, for holding() and panic messages.
    owner_cpu: AtomicI32,
    name: &'static str,
}

impl RawSpinLock {
    pub const fn new(name: &'static str) -> Self {
        RawSpinLock {
            locked: AtomicBool::new(false),
            owner_cpu: AtomicI32::new(NO_OWNER),
            name,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// True when the calling hart holds this lock. Only meaningful with
    /// interrupts disabled (the result is stale otherwise).
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
            && self.owner_cpu.load(Ordering::Relaxed) == crate::arch::hartid() as i32
    }

    pub fn assert_holding(&self) {
        assert!(self.holding(), "spinlock {} not held", self.name);
    }

    pub fn lock(&self) {
        cpu_local().push_off();
        assert!(!self.holding(), "spinlock {}: recursive acquire", self.name);
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            cpu_relax();
        }
        self.owner_cpu.store(crate::arch::hartid() as i32, Ordering::Relaxed);
    }

    pub fn try_lock(&self) -> bool {
        cpu_local().push_off();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner_cpu.store(crate::arch::hartid() as i32, Ordering::Relaxed);
            true
        } else {
            cpu_local().pop_off();
            false
        }
    }

    pub fn unlock(&self) {
        assert!(self.holding(), "spinlock {}: unlock by non-owner", self.name);
        self.owner_cpu.store(NO_OWNER, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        cpu_local().pop_off();
    }
}

pub struct SpinLock<T> {
    raw: RawSpinLock,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        SpinLock {
            raw: RawSpinLock::new(name),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.raw.lock();
        SpinLockGuard { lock: self }
    }

    pub fn holding(&self) -> bool {
        self.raw.holding()
    }

    pub fn raw(&self) -> &RawSpinLock {
        &self.raw
    }

    /// Access the data while the raw lock is known to be held through a
    /// non-RAII path.
    ///
    /// # Safety
    /// The caller must hold the raw lock.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_unchecked(&self) -> &mut T {
        &mut *self.data.get()
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock();
    }
}

/// Disable interrupts and bump this hart's nesting counter.
pub fn push_off() {
    cpu_local().push_off();
}

/// Undo one push_off().
pub fn pop_off() {
    cpu_local().pop_off();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_roundtrip() {
        let lk = RawSpinLock::new("test");
        assert!(!lk.holding());
        lk.lock();
        assert!(lk.holding());
        lk.unlock();
        assert!(!lk.holding());
    }

    #[test]
    fn guard_protects_data() {
        let lk = SpinLock::new("counter", 0u32);
        {
            let mut g = lk.lock();
            *g += 7;
            assert!(lk.holding());
        }
        assert!(!lk.holding());
        assert_eq!(*lk.lock(), 7);
    }

    #[test]
    fn try_lock_follows_state() {
        let lk = RawSpinLock::new("try");
        assert!(lk.try_lock());
        assert!(lk.holding());
        lk.unlock();
        assert!(lk.try_lock());
        lk.unlock();
    }
}
