/*
 * Read-write spinlock with the whole state in one 64-bit atomic word.
 *
 * Layout:
 *
 *   63             9   8      7        0
 *  +----------------+---+---------------+
 *  |  reader count  | W |  writer hold  |
 *  +----------------+---+---------------+
 *
 * - bits 0-7: 0xFF while a writer holds the lock, 0x00 otherwise. A full
 *   byte so a writer-held state can never be mistaken for a reader count
 *   that leaked into the low bits.
 * - bit 8: writer-waiting hint. A soft-priority flag set by a spinning
 *   writer past the expedite threshold; non-expediting readers and writers
 *   back off while it is set. It may be transiently lost on unlock — the
 *   waiting writer re-sets it on its next failed CAS.
 * - bits 9-63: reader count, each reader adds READER_BIAS.
 *
 * A writer may recursively take a read lock (write→read); the reverse
 * upgrade succeeds only for the sole reader via try_update(). Writer
 * starvation under read-heavy load is bounded by the expedite threshold.
 */

use core::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use crate::smp::atomic::{cpu_relax, oper_cond, oper_cond_hook};

const STATE_UNLOCKED: u64 = 0;
const STATE_WRITER_WAITING: u64 = 1 << 8;
const STATE_WRITER_HOLDING: u64 = (1 << 8) - 1;
const STATE_WRITER_MASK: u64 = STATE_WRITER_WAITING | STATE_WRITER_HOLDING;
const READER_BIAS_SHIFT: u32 = 9;
const READER_BIAS: u64 = 1 << READER_BIAS_SHIFT;

const NONE_HOLDER: i32 = -1;

/// A writer spinning longer than this (timebase units, ~4ms) turns on
/// expedite mode and claims soft priority.
const EXPEDITE_THRESHOLD: u64 = 40_000;

#[inline]
fn w_holding(state: u64) -> bool {
    state & STATE_WRITER_HOLDING != 0
}

#[inline]
fn w_waiting(state: u64) -> bool {
    state & STATE_WRITER_WAITING != 0
}

#[inline]
fn r_count(state: u64) -> u64 {
    state >> READER_BIAS_SHIFT
}

pub struct RwLock {
    state: AtomicU64,
    /// Hart id of the current write holder, for write→read recursion and
    /// ownership assertions.
    w_holder: AtomicI32,
    name: &'static str,
}

impl RwLock {
    pub const fn new(name: &'static str) -> Self {
        RwLock {
            state: AtomicU64::new(STATE_UNLOCKED),
            w_holder: AtomicI32::new(NONE_HOLDER),
            name,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn reader_count(&self) -> u64 {
        r_count(self.state.load(Ordering::Acquire))
    }

    pub fn write_holding(&self) -> bool {
        self.w_holder.load(Ordering::Acquire) == crate::arch::hartid() as i32
    }

    fn can_rlock(&self, state: u64) -> bool {
        if state & STATE_WRITER_MASK != 0 {
            // Writer holds or is waiting: only the write holder itself may
            // recurse into a read lock.
            return self.write_holding();
        }
        true
    }

    /// One CAS attempt at a read lock.
    pub fn try_rlock(&self) -> bool {
        oper_cond(&self.state, |v| v + READER_BIAS, |v| self.can_rlock(v))
    }

    fn can_wlock(state: u64, expedite: bool) -> bool {
        if r_count(state) > 0 || w_holding(state) {
            return false;
        }
        if w_waiting(state) && !expedite {
            return false;
        }
        true
    }

    /// One CAS loop at the write lock; in expedite mode every failed
    /// iteration publishes the writer-waiting hint.
    pub fn try_wlock(&self, expedite: bool) -> bool {
        let ok = oper_cond_hook(
            &self.state,
            |_| STATE_WRITER_HOLDING,
            |v| Self::can_wlock(v, expedite),
            |v| {
                if expedite && !w_waiting(v) {
                    self.state.fetch_or(STATE_WRITER_WAITING, Ordering::SeqCst);
                }
            },
        );
        if ok {
            self.w_holder.store(crate::arch::hartid() as i32, Ordering::Release);
        }
        ok
    }

    fn can_update(state: u64) -> bool {
        // Reject the write→read→update recursion, other readers, and a
        // waiting writer's claimed priority.
        !w_holding(state) && r_count(state) == 1 && !w_waiting(state)
    }

    /// Upgrade a read lock to the write lock; succeeds only for the sole
    /// reader. On failure the read lock is still held.
    pub fn try_update(&self) -> bool {
        let ok = oper_cond(&self.state, |_| STATE_WRITER_HOLDING, Self::can_update);
        if ok {
            self.w_holder.store(crate::arch::hartid() as i32, Ordering::Release);
        }
        ok
    }

    /// Spin until a read lock is acquired.
    pub fn racquire(&self) {
        while !self.try_rlock() {
            cpu_relax();
        }
    }

    pub fn rrelease(&self) {
        let prev = self.state.fetch_sub(READER_BIAS, Ordering::Release);
        assert!(r_count(prev) > 0, "rwlock {}: reader underflow", self.name);
    }

    fn wacquire_mode(&self, mut expedite: bool, adaptive: bool) {
        let start = crate::arch::time();
        while !self.try_wlock(expedite) {
            if adaptive && !expedite && crate::arch::time().wrapping_sub(start) > EXPEDITE_THRESHOLD
            {
                expedite = true;
            }
            cpu_relax();
        }
    }

    /// Spin-acquire the write lock; switches to expedite mode after the
    /// threshold to fend off incoming readers.
    pub fn wacquire(&self) {
        self.wacquire_mode(false, true);
    }

    /// Always-expedited write acquire: lowest latency, least fair.
    pub fn wacquire_expedited(&self) {
        self.wacquire_mode(true, false);
    }

    /// Never-expedited write acquire: fair, may wait behind expediters.
    pub fn graceful_wacquire(&self) {
        self.wacquire_mode(false, false);
    }

    pub fn writer_release(&self) {
        assert!(self.write_holding(), "rwlock {}: release by non-writer", self.name);
        self.w_holder.store(NONE_HOLDER, Ordering::Release);
        // May transiently drop a waiting writer's hint; it re-asserts it
        // on its next CAS failure.
        self.state.store(STATE_UNLOCKED, Ordering::Release);
    }

    // push_off/pop_off wrappers: interrupt-safe, nestable.

    pub fn rlock(&self) {
        super::spinlock::push_off();
        self.racquire();
    }

    pub fn runlock(&self) {
        self.rrelease();
        super::spinlock::pop_off();
    }

    pub fn wlock(&self) {
        super::spinlock::push_off();
        self.wacquire();
    }

    pub fn wlock_expedited(&self) {
        super::spinlock::push_off();
        self.wacquire_expedited();
    }

    pub fn wunlock(&self) {
        self.writer_release();
        super::spinlock::pop_off();
    }

    // irqsave wrappers: raw interrupt save/restore, for paths that cannot
    // tolerate the nesting counter (early boot, trap tails).

    pub fn rlock_irqsave(&self) -> bool {
        let was = crate::arch::intr_get();
        crate::arch::intr_off();
        self.racquire();
        was
    }

    pub fn runlock_irqrestore(&self, was_enabled: bool) {
        self.rrelease();
        if was_enabled {
            crate::arch::intr_on();
        }
    }

    pub fn wlock_irqsave(&self) -> bool {
        let was = crate::arch::intr_get();
        crate::arch::intr_off();
        self.wacquire();
        was
    }

    pub fn wunlock_irqrestore(&self, was_enabled: bool) {
        self.writer_release();
        if was_enabled {
            crate::arch::intr_on();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_share_writers_exclude() {
        let rw = RwLock::new("t");
        assert!(rw.try_rlock());
        assert!(rw.try_rlock());
        assert_eq!(rw.reader_count(), 2);
        assert!(!rw.try_wlock(false), "writer must wait for readers");
        rw.rrelease();
        rw.rrelease();
        assert!(rw.try_wlock(false));
        assert!(rw.write_holding());
        assert!(!rw.try_wlock(true), "second writer excluded");
        rw.writer_release();
        assert_eq!(rw.reader_count(), 0);
    }

    #[test]
    fn write_to_read_recursion() {
        let rw = RwLock::new("t");
        assert!(rw.try_wlock(false));
        // The write holder may take a read lock on top.
        assert!(rw.try_rlock());
        assert_eq!(rw.reader_count(), 1);
        rw.rrelease();
        rw.writer_release();
    }

    #[test]
    fn sole_reader_upgrade() {
        let rw = RwLock::new("t");
        assert!(rw.try_rlock());
        assert!(rw.try_update(), "sole reader upgrades");
        assert!(rw.write_holding());
        rw.writer_release();

        assert!(rw.try_rlock());
        assert!(rw.try_rlock());
        assert!(!rw.try_update(), "two readers cannot upgrade");
        rw.rrelease();
        rw.rrelease();
    }

    #[test]
    fn waiting_hint_backs_readers_off() {
        let rw = RwLock::new("t");
        rw.state.fetch_or(STATE_WRITER_WAITING, Ordering::SeqCst);
        assert!(!rw.try_rlock(), "reader defers to waiting writer");
        assert!(!rw.try_wlock(false), "non-expedited writer defers");
        assert!(rw.try_wlock(true), "expedited writer proceeds");
        // Acquisition replaced the low bits, clearing the hint.
        assert!(!w_waiting(rw.state.load(Ordering::SeqCst)));
        rw.writer_release();
    }
}
