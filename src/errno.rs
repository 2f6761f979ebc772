/*
 * POSIX errno values used by the kernel core.
 *
 * Convention: library layers return `Result<T, i64>` carrying a positive
 * errno; the syscall boundary (and the C-style wait protocol's `error_no`
 * slot) flattens errors to negative values, so user space always sees
 * `-errno` in a0.
 */

pub const EPERM: i64 = 1;
pub const ESRCH: i64 = 3;
pub const EINTR: i64 = 4;
pub const EAGAIN: i64 = 11;
pub const ENOMEM: i64 = 12;
pub const EFAULT: i64 = 14;
pub const EINVAL: i64 = 22;
pub const ENOTEMPTY: i64 = 39;
pub const ENOENT: i64 = 2;
pub const ECHILD: i64 = 10;
pub const EDEADLK: i64 = 35;
pub const ENOSYS: i64 = 38;

/// Result type used throughout the kernel core.
pub type KResult<T> = Result<T, i64>;

/// Flatten a `KResult<u64>` into the negative-errno syscall convention.
pub fn into_sysret(res: KResult<u64>) -> i64 {
    match res {
        Ok(v) => v as i64,
        Err(e) => -e,
    }
}
