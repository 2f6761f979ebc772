/*
 * Thread exit and reaping.
 *
 * exit() releases the per-thread resources, notifies the parent, marks
 * the thread EXITING and yields for the last time. The thread that gets
 * switched to finishes the job (finish_exit): a non-leader CLONE_THREAD
 * member self-reaps (RCU-deferred destruction); a leader becomes ZOMBIE
 * and waits for the parent's wait() to reap it.
 *
 * The control block and kernel stack are freed through call_rcu: lookups
 * under rcu_read_lock() and the final context switch both finish inside
 * the grace period, so neither ever touches freed memory.
 */

use core::sync::atomic::Ordering;

use crate::collections::list;
use crate::errno::{ECHILD, EINTR, EINVAL};
use crate::proc::table;
use crate::proc::thread::{Pid, Thread, ThreadState, FLAG_SELF_REAP};
use crate::rcu::{call_rcu, RcuHead};
use crate::sched;
use crate::signal;
use crate::smp;

use core::sync::atomic::AtomicPtr;

/// The init thread adopts orphans. Installed once at boot.
static INIT_THREAD: AtomicPtr<Thread> = AtomicPtr::new(core::ptr::null_mut());

pub fn set_init_thread(p: &Thread) {
    INIT_THREAD.store(p as *const Thread as *mut Thread, Ordering::Release);
}

fn init_thread() -> Option<&'static Thread> {
    let p = INIT_THREAD.load(Ordering::Acquire);
    if p.is_null() {
        None
    } else {
        Some(unsafe { &*p })
    }
}

/// Hand `p`'s children to init.
///
/// # Safety
/// Caller holds pid_wlock.
unsafe fn reparent_children(p: &Thread) {
    let adopter = match init_thread() {
        Some(init) if !core::ptr::eq(init, p) => init,
        _ => {
            // No adopter: orphans lose their parent link and self-clean
            // when they exit.
            for entry in list::iter(p.children.get()) {
                let child = &*container_of!(entry, Thread, siblings);
                child.parent.store(core::ptr::null_mut(), Ordering::Release);
                child.set_flag(FLAG_SELF_REAP);
            }
            list::init(p.children.get());
            p.children_count.store(0, Ordering::SeqCst);
            return;
        }
    };

    let moved = p.children_count.swap(0, Ordering::SeqCst);
    if moved == 0 {
        return;
    }
    for entry in list::iter(p.children.get()) {
        let child = &*container_of!(entry, Thread, siblings);
        child
            .parent
            .store(adopter as *const Thread as *mut Thread, Ordering::Release);
    }
    let tail = (*adopter.children.get()).prev;
    list::insert_bulk(tail, p.children.get());
    adopter.children_count.fetch_add(moved, Ordering::SeqCst);
}

/// Terminate the calling thread. Never returns.
pub fn exit(code: i32) -> ! {
    let p = smp::current().expect("exit: no current thread");
    assert!(p.pid != 0, "exit: idle thread cannot exit");

    // A vforked child unblocks its parent now (exec would, too).
    if !p.vfork_parent.load(Ordering::Acquire).is_null() {
        p.vfork_done.complete_all();
    }

    // CLONE_CHILD_CLEARTID: tell the threading library this tid is gone.
    let ctid = p.clear_child_tid.load(Ordering::Acquire);
    if ctid != 0 {
        if let Some(vm) = p.vm_clone() {
            let _ = vm.copy_out_val(ctid, &0i32);
        }
    }

    // Release the resource references that may own I/O state. The
    // sigacts and thread-group references stay until destruction: late
    // signal senders still probe them under RCU.
    unsafe {
        *p.fdtable.get() = None;
        *p.fs.get() = None;
        *p.vm.get() = None;
        *p.trapframe.get() = None;
    }

    // Group-exit code wins over the caller's.
    let mut xcode = code;
    if let Some(tg) = p.group_clone() {
        if tg.group_exit.load(Ordering::Acquire) != 0 {
            xcode = tg.group_exit_code.load(Ordering::Acquire);
        }
    }
    p.xstate.store(xcode, Ordering::Release);

    let mut vanished_parent: *const Thread = core::ptr::null();
    table::pid_wlock();
    unsafe {
        reparent_children(p);
        if let Some(tg) = p.group_clone() {
            tg.remove(p);
        }
        if p.has_flag(FLAG_SELF_REAP) {
            // Invisible to wait(): disappear from the table right away.
            table::table_remove(p);
            if let Some(parent) = parent_of(p) {
                vanished_parent = parent;
                table::detach_child(parent, p);
            }
        }
    }
    table::pid_wunlock();

    // A parent blocked in wait() must re-scan when its child count drops,
    // or it would sleep forever after its last child self-reaps.
    if !vanished_parent.is_null() {
        let parent = unsafe { &*vanished_parent };
        notify_waiting_parent(parent);
    }

    // Exit signal to the parent (SIGCHLD by default for forked
    // children).
    let esignal = p.signal.esignal.load(Ordering::Acquire);
    if !p.has_flag(FLAG_SELF_REAP) && esignal != 0 {
        if let Some(parent) = parent_of(p) {
            let _ = signal::kill_thread(parent, esignal);
        }
    }

    p.set_state(ThreadState::Exiting);
    sched::scheduler_yield();
    unreachable!("exit: rescheduled after EXITING");
}

fn parent_of(p: &Thread) -> Option<&'static Thread> {
    let parent = p.parent.load(Ordering::Acquire);
    if parent.is_null() {
        None
    } else {
        Some(unsafe { &*parent })
    }
}

/// Kick a parent possibly blocked in wait(). The lock/unlock pair is a
/// barrier: after it, the parent either has not started its scan (and
/// will observe the state change) or is already parked on its channel
/// (and the wakeup finds it).
fn notify_waiting_parent(parent: &Thread) {
    parent.child_wait_lock.lock();
    parent.child_wait_lock.unlock();
    crate::proc::tq::wakeup_on_chan(parent as *const Thread as usize);
}

/// Final transition, run from context_switch_tail by the next thread once
/// the exiting thread is off its stack for good.
pub fn finish_exit(p: &Thread) {
    if p.has_flag(FLAG_SELF_REAP) {
        thread_destroy(p);
        return;
    }

    p.set_state(ThreadState::Zombie);
    if let Some(parent) = parent_of(p) {
        notify_waiting_parent(parent);
    } else {
        // Orphaned leader with no adopter: nothing will ever reap it, so
        // drop it from the table and free it here.
        table::pid_wlock();
        unsafe { table::table_remove(p) };
        table::pid_wunlock();
        thread_destroy(p);
    }
}

unsafe fn thread_free_cb(head: *mut RcuHead) {
    let p = container_of!(head, Thread, rcu_head);
    let kstack = (*p).kstack;
    let kstack_size = (*p).kstack_size;
    let boxed = alloc::boxed::Box::from_raw(p);
    drop(boxed);
    if kstack != 0 {
        crate::mm::heap::free_kstack(kstack, kstack_size);
    }
}

/// Queue the control block and kernel stack for freeing after a grace
/// period. The caller guarantees the thread is off every queue and CPU.
pub fn thread_destroy(p: &Thread) {
    unsafe {
        *p.sigacts.get() = None;
        *p.thread_group.get() = None;
        call_rcu(p.rcu_head.get(), thread_free_cb);
    }
}

/// Reap one zombie child: returns its tgid and exit status. Blocks
/// interruptibly while living children exist; -ECHILD with none.
pub fn wait() -> Result<(Pid, i32), i64> {
    let p = smp::current().ok_or(EINVAL)?;

    loop {
        p.child_wait_lock.lock();

        // Cheap scan under the read lock.
        table::pid_rlock();
        let mut have_kids = false;
        let mut candidate: *const Thread = core::ptr::null();
        unsafe {
            for entry in list::iter(p.children.get()) {
                let child = &*container_of!(entry, Thread, siblings);
                have_kids = true;
                if child.state() == ThreadState::Zombie {
                    candidate = child;
                    break;
                }
            }
        }
        table::pid_runlock();

        if !candidate.is_null() {
            // Revalidate under the write lock: a sibling's wait() may
            // have reaped the candidate between the two passes.
            let mut found: *const Thread = core::ptr::null();
            table::pid_wlock();
            unsafe {
                for entry in list::iter(p.children.get()) {
                    let child = &*container_of!(entry, Thread, siblings);
                    if core::ptr::eq(child, candidate) && child.state() == ThreadState::Zombie {
                        found = child;
                        break;
                    }
                }
                if !found.is_null() {
                    let child = &*found;
                    table::detach_child(p, child);
                    table::table_remove(child);
                }
            }
            table::pid_wunlock();
            p.child_wait_lock.unlock();

            if !found.is_null() {
                let child = unsafe { &*found };
                let tgid = child.tgid();
                let status = child.xstate.load(Ordering::Acquire);
                thread_destroy(child);
                return Ok((tgid, status));
            }
            // Lost the race; rescan.
            continue;
        }

        if !have_kids {
            p.child_wait_lock.unlock();
            return Err(ECHILD);
        }
        if p.killed() {
            p.child_wait_lock.unlock();
            return Err(EINTR);
        }

        // Park on the channel keyed by our own address; exiting children
        // ring it through notify_waiting_parent().
        let err = crate::proc::tq::sleep_on_chan(p as *const Thread as usize, &p.child_wait_lock);
        p.child_wait_lock.unlock();
        if err != 0 {
            return Err(EINTR);
        }
    }
}
