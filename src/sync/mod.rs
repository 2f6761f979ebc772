/*
 * Kernel synchronization primitives.
 *
 * Spinning primitives (spinlock, rwlock) disable interrupts on the owning
 * hart and may be taken anywhere; sleeping primitives (mutex, rwsem,
 * semaphore, completion) park the caller on a thread queue and must only be
 * used from thread context with no spinlock held — every entry point
 * asserts that contract.
 */

pub mod completion;
pub mod mutex;
pub mod rwlock;
pub mod rwsem;
pub mod semaphore;
pub mod spinlock;

pub use completion::Completion;
pub use mutex::Mutex;
pub use rwlock::RwLock;
pub use rwsem::{RwSem, RWSEM_PRIO_READ, RWSEM_PRIO_WRITE};
pub use semaphore::Semaphore;
pub use spinlock::{RawSpinLock, SpinLock, SpinLockGuard};
