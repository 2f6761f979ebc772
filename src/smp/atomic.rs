/*
 * Atomic helpers shared by the lock and refcount implementations.
 *
 * The central piece is oper_cond(): a conditional compare-and-swap loop
 * where both the new-value computation and the continue-condition see the
 * most recently observed value. Refcount patterns (dec-unless,
 * inc-not-zero) and the rwlock state machine are built on it.
 */

use core::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};

/// Machine-word atomics usable with the conditional-CAS helpers.
pub trait AtomicWord {
    type Value: Copy + PartialEq;

    fn load_acquire(&self) -> Self::Value;
    fn cas(&self, old: Self::Value, new: Self::Value) -> Result<Self::Value, Self::Value>;
}

macro_rules! impl_atomic_word {
    ($atomic:ty, $value:ty) => {
        impl AtomicWord for $atomic {
            type Value = $value;

            #[inline]
            fn load_acquire(&self) -> $value {
                self.load(Ordering::Acquire)
            }

            #[inline]
            fn cas(&self, old: $value, new: $value) -> Result<$value, $value> {
                self.compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
            }
        }
    };
}

impl_atomic_word!(AtomicU64, u64);
impl_atomic_word!(AtomicI32, i32);
impl_atomic_word!(AtomicUsize, usize);

/// Conditional atomic read-modify-write.
///
/// Loads the target, then retries a CAS loop: while `cond(observed)` holds,
/// compute `new(observed)` and attempt to store it. On CAS failure the
/// observed value is refreshed and the condition re-evaluated.
///
/// Returns true if a CAS succeeded, false if the condition became false.
#[inline]
pub fn oper_cond<A, N, C>(target: &A, mut new: N, mut cond: C) -> bool
where
    A: AtomicWord,
    N: FnMut(A::Value) -> A::Value,
    C: FnMut(A::Value) -> bool,
{
    let mut val = target.load_acquire();
    while cond(val) {
        match target.cas(val, new(val)) {
            Ok(_) => return true,
            Err(cur) => val = cur,
        }
    }
    false
}

/// oper_cond() with a failure hook invoked on every failed CAS iteration
/// with the freshly observed value. The rwlock writer path uses this to
/// publish its writer-waiting hint while spinning.
#[inline]
pub fn oper_cond_hook<A, N, C, H>(target: &A, mut new: N, mut cond: C, mut on_fail: H) -> bool
where
    A: AtomicWord,
    N: FnMut(A::Value) -> A::Value,
    C: FnMut(A::Value) -> bool,
    H: FnMut(A::Value),
{
    let mut val = target.load_acquire();
    while cond(val) {
        match target.cas(val, new(val)) {
            Ok(_) => return true,
            Err(cur) => {
                on_fail(cur);
                val = cur;
            }
        }
    }
    false
}

/// Atomically decrement unless the value equals `unless`.
/// Returns true if the decrement happened.
#[inline]
pub fn dec_unless(value: &AtomicI32, unless: i32) -> bool {
    oper_cond(value, |v| v - 1, |v| v != unless)
}

/// Atomically increment unless the value is zero. Used when taking a
/// reference to an object that may concurrently be on its way to freeing.
#[inline]
pub fn inc_not_zero(value: &AtomicI32) -> bool {
    oper_cond(value, |v| v + 1, |v| v != 0)
}

/// Full memory barrier separating independent stores observed by multiple
/// readers.
#[inline]
pub fn smp_mb() {
    core::sync::atomic::fence(Ordering::SeqCst);
}

/// Spin-loop hint.
#[inline]
pub fn cpu_relax() {
    core::hint::spin_loop();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oper_cond_applies_operation_once() {
        let v = AtomicU64::new(5);
        assert!(oper_cond(&v, |x| x + 10, |x| x == 5));
        assert_eq!(v.load(Ordering::SeqCst), 15);
    }

    #[test]
    fn oper_cond_bails_when_condition_false() {
        let v = AtomicU64::new(0);
        assert!(!oper_cond(&v, |x| x + 1, |x| x != 0));
        assert_eq!(v.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn refcount_helpers() {
        let rc = AtomicI32::new(1);
        assert!(!dec_unless(&rc, 1), "last ref must not decrement");
        assert!(inc_not_zero(&rc));
        assert_eq!(rc.load(Ordering::SeqCst), 2);
        assert!(dec_unless(&rc, 1));
        assert_eq!(rc.load(Ordering::SeqCst), 1);

        let dead = AtomicI32::new(0);
        assert!(!inc_not_zero(&dead));
    }
}
