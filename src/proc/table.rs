/*
 * PID allocation, the global pid hash table, and the parent/child graph
 * locking.
 *
 * pid_lock (a spin rwlock) protects the hash chains, PID allocation, and
 * every parent/child/sibling/thread-group link. It is acquired before any
 * tcb_lock. Traversals (wait scanning, procdump, signal target lookup)
 * take the read side; structural changes take the write side.
 *
 * Lookup by pid additionally works under rcu_read_lock() without the
 * rwlock: chains only gain entries under the write lock, and removed
 * threads are freed through a grace period, so a reader either sees a
 * thread (and must check its state) or does not.
 */

use core::sync::atomic::{AtomicI32, Ordering};

use crate::collections::list::{self, ListNode};
use crate::errno::{EAGAIN, ESRCH};
use crate::proc::thread::{Pid, Thread};
use crate::sync::RwLock;

pub const MAXPID: Pid = 0x7FF_FFF0;
const PID_HASH_BUCKETS: usize = 256;

static PID_LOCK: RwLock = RwLock::new("pid_lock");

struct PidHash {
    buckets: core::cell::UnsafeCell<[ListNode; PID_HASH_BUCKETS]>,
}

unsafe impl Sync for PidHash {}

static PID_HASH: PidHash = {
    const EMPTY: ListNode = ListNode::new();
    PidHash {
        buckets: core::cell::UnsafeCell::new([EMPTY; PID_HASH_BUCKETS]),
    }
};

static NEXT_PID: AtomicI32 = AtomicI32::new(1);

pub fn pid_wlock() {
    PID_LOCK.wlock();
}

pub fn pid_wunlock() {
    PID_LOCK.wunlock();
}

pub fn pid_rlock() {
    PID_LOCK.rlock();
}

pub fn pid_runlock() {
    PID_LOCK.runlock();
}

pub fn pid_wholding() -> bool {
    PID_LOCK.write_holding()
}

pub fn pid_assert_wholding() {
    assert!(pid_wholding(), "pid_lock write side not held");
}

pub fn table_init() {
    let buckets = PID_HASH.buckets.get();
    for i in 0..PID_HASH_BUCKETS {
        unsafe { list::init(&mut (*buckets)[i]) };
    }
}

fn bucket_of(pid: Pid) -> *mut ListNode {
    unsafe { &mut (*PID_HASH.buckets.get())[(pid as usize) % PID_HASH_BUCKETS] }
}

/// Allocate a fresh pid. PIDs are not recycled; exhaustion of the 27-bit
/// space reports -EAGAIN.
pub fn alloc_pid() -> Result<Pid, i64> {
    let pid = NEXT_PID.fetch_add(1, Ordering::SeqCst);
    if pid > MAXPID {
        NEXT_PID.store(MAXPID + 1, Ordering::SeqCst);
        return Err(EAGAIN);
    }
    Ok(pid)
}

/// Link a thread into the pid hash.
///
/// # Safety
/// Caller holds pid_wlock; the thread is pinned and not yet in the table.
pub unsafe fn table_add(p: &Thread) {
    pid_assert_wholding();
    list::push(bucket_of(p.pid), p.proctab_entry.get());
}

/// Unlink a thread from the pid hash.
///
/// # Safety
/// Caller holds pid_wlock; the thread is currently in the table.
pub unsafe fn table_remove(p: &Thread) {
    pid_assert_wholding();
    if !list::is_detached(p.proctab_entry.get()) {
        list::detach(p.proctab_entry.get());
    }
}

/// Look a thread up by pid. Caller must be inside rcu_read_lock() (or
/// hold pid_lock); the reference is valid for the critical section only.
pub fn get_pid_thread(pid: Pid) -> Result<&'static Thread, i64> {
    if pid <= 0 {
        return Err(ESRCH);
    }
    let bucket = bucket_of(pid);
    unsafe {
        for entry in list::iter(bucket) {
            let t = &*container_of!(entry, Thread, proctab_entry);
            if t.pid == pid {
                return Ok(t);
            }
        }
    }
    Err(ESRCH)
}

/// Attach `child` under `parent` in the family tree.
///
/// # Safety
/// Caller holds pid_wlock.
pub unsafe fn attach_child(parent: &Thread, child: &Thread) {
    pid_assert_wholding();
    child
        .parent
        .store(parent as *const Thread as *mut Thread, Ordering::Release);
    list::push_back(parent.children.get(), child.siblings.get());
    parent.children_count.fetch_add(1, Ordering::SeqCst);
}

/// Detach `child` from `parent`.
///
/// # Safety
/// Caller holds pid_wlock.
pub unsafe fn detach_child(parent: &Thread, child: &Thread) {
    pid_assert_wholding();
    if !list::is_detached(child.siblings.get()) {
        list::detach(child.siblings.get());
        parent.children_count.fetch_sub(1, Ordering::SeqCst);
    }
    child.parent.store(core::ptr::null_mut(), Ordering::Release);
}

/// Log one line per table entry. Debug aid for hung boots.
pub fn procdump() {
    pid_rlock();
    unsafe {
        for i in 0..PID_HASH_BUCKETS {
            let bucket = &mut (*PID_HASH.buckets.get())[i];
            for entry in list::iter(bucket) {
                let t = &*container_of!(entry, Thread, proctab_entry);
                log::info!(
                    "pid {:5} tgid {:5} {:14} {}",
                    t.pid,
                    t.tgid(),
                    t.state().as_str(),
                    t.name.as_str()
                );
            }
        }
    }
    pid_runlock();
}
