/*
 * clone(): the superset of fork.
 *
 * Resource sharing is flag-selected: address space, filesystem state, fd
 * table, signal actions, thread-group membership. CLONE_THREAD requires
 * CLONE_SIGHAND (a thread group without shared signal actions cannot
 * implement process-directed delivery). CLONE_VFORK blocks the parent on
 * the child's vfork completion until the child execs or exits.
 *
 * The child returns 0 (user clones get a0 = 0 in their copied trapframe;
 * kernel clones start at the supplied entry); the parent gets the new
 * tid, or a negative errno with the child never having run.
 */

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use crate::errno::{EINVAL, ENOMEM};
use crate::mm::heap::alloc_kstack;
use crate::mm::vm::Vm;
use crate::proc::table;
use crate::proc::thread::{Pid, Thread, FLAG_SELF_REAP, FLAG_USER_SPACE, KSTACK_SIZE};
use crate::proc::thread_group::ThreadGroup;
use crate::proc::{FdTable, FsStruct};
use crate::sched;
use crate::signal::sigacts::Sigacts;
use crate::signal::types::SIGCHLD;
use crate::smp;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CloneFlags: u64 {
        const CHILD_CLEARTID = 0x0001_0000;
        const CHILD_SETTID   = 0x0002_0000;
        const CLEAR_SIGHAND  = 0x0004_0000;
        const DETACHED       = 0x0008_0000;
        const FILES          = 0x0010_0000;
        const FS             = 0x0020_0000;
        const PARENT_SETTID  = 0x0010_0000_00;
        const SETTLS         = 0x0100_0000_00;
        const SIGHAND        = 0x0200_0000_00;
        const THREAD         = 0x1000_0000_00;
        const VFORK          = 0x4000_0000_00;
        const VM             = 0x8000_0000_00;
    }
}

/// Arguments to clone(); shared layout with user space.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CloneArgs {
    pub flags: u64,
    pub stack: u64,
    pub stack_size: u64,
    pub entry: u64,
    /// Signal delivered to the parent on child exit (0 = none). When
    /// unset, the low 8 bits of `flags` carry it (Linux convention).
    pub esignal: u64,
    pub tls: u64,
    /// Child tid address (CLONE_CHILD_SETTID / CLEARTID).
    pub ctid: u64,
    /// Parent tid address (CLONE_PARENT_SETTID).
    pub ptid: u64,
}

impl CloneArgs {
    /// fork(): new everything, SIGCHLD to the parent.
    pub fn fork() -> CloneArgs {
        CloneArgs {
            flags: SIGCHLD as u64,
            esignal: SIGCHLD as u64,
            ..Default::default()
        }
    }

    /// vfork(): shared VM, parent blocked until exec or exit.
    pub fn vfork() -> CloneArgs {
        CloneArgs {
            flags: CloneFlags::VM.bits() | CloneFlags::VFORK.bits(),
            esignal: SIGCHLD as u64,
            ..Default::default()
        }
    }

    pub fn effective_esignal(&self) -> i32 {
        if self.esignal != 0 {
            self.esignal as i32
        } else {
            (self.flags & 0xff) as i32
        }
    }
}

fn validate(parent: &Thread, flags: CloneFlags, args: &CloneArgs) -> Result<(), i64> {
    if flags.contains(CloneFlags::THREAD) && !flags.contains(CloneFlags::SIGHAND) {
        return Err(EINVAL);
    }
    // A user CLONE_VM thread needs its own stack and an entry point;
    // vfork intentionally runs on the parent's stack.
    if flags.contains(CloneFlags::VM)
        && !flags.contains(CloneFlags::VFORK)
        && parent.has_flag(FLAG_USER_SPACE)
        && (args.stack == 0 || args.stack_size == 0 || args.entry == 0)
    {
        return Err(EINVAL);
    }
    Ok(())
}

/// Create a new thread per `args`. Returns the child tid to the caller.
pub fn thread_clone(args: &CloneArgs) -> Result<Pid, i64> {
    let parent = smp::current().ok_or(EINVAL)?;
    let flags = CloneFlags::from_bits_truncate(args.flags);
    validate(parent, flags, args)?;

    let pid = table::alloc_pid()?;
    let kstack = alloc_kstack(KSTACK_SIZE).ok_or(ENOMEM)?;
    let mut child = Thread::new(parent.name.as_str(), pid, kstack, KSTACK_SIZE);
    child.clone_flags = flags.bits();
    child.signal.esignal.store(args.effective_esignal(), Ordering::Relaxed);

    // Address space.
    let vm = if flags.intersects(CloneFlags::VM | CloneFlags::VFORK) {
        parent.vm_clone()
    } else {
        // The page-table copy belongs to the external VM layer; the
        // contract object is duplicated with the same ranges.
        parent.vm_clone().map(|v| Arc::new(v.duplicate()))
    };
    unsafe { *child.vm.get() = vm };

    // Filesystem state and fd table.
    unsafe {
        *child.fs.get() = if flags.contains(CloneFlags::FS) {
            (*parent.fs.get()).clone()
        } else {
            Some(Arc::new(FsStruct::new()))
        };
        *child.fdtable.get() = if flags.contains(CloneFlags::FILES) {
            (*parent.fdtable.get()).clone()
        } else {
            Some(Arc::new(FdTable::new()))
        };
    }

    // Signal actions.
    let sigacts = if flags.contains(CloneFlags::CLEAR_SIGHAND) {
        Sigacts::new()
    } else {
        match parent.sigacts_clone() {
            Some(psa) => Sigacts::dup(&psa, flags.contains(CloneFlags::SIGHAND)),
            None => Sigacts::new(),
        }
    };
    unsafe { *child.sigacts.get() = Some(sigacts) };

    // Execution start state.
    if parent.has_flag(FLAG_USER_SPACE) {
        let parent_tf = unsafe { (*parent.trapframe.get()).as_ref().ok_or(EINVAL)? };
        let mut tf = Box::new(**parent_tf);
        tf.a[0] = 0; // child returns 0
        if flags.contains(CloneFlags::VM) && !flags.contains(CloneFlags::VFORK) {
            tf.sepc = args.entry;
            tf.sp = args.stack + args.stack_size;
        }
        if flags.contains(CloneFlags::SETTLS) {
            tf.tp = args.tls;
        }
        unsafe { *child.trapframe.get() = Some(tf) };
        child.set_flag(FLAG_USER_SPACE);
    } else {
        // Kernel-thread clone: the entry is a kernel function pointer.
        if args.entry == 0 {
            return Err(EINVAL);
        }
        child.kentry = Some(unsafe { core::mem::transmute::<u64, fn(usize, usize)>(args.entry) });
        child.karg = [args.tls as usize, 0];
    }

    // Prime the kernel context so the first dispatch lands in the entry
    // shim.
    unsafe {
        (*child.se.context.get()).prime(
            sched::thread_entry_shim as usize,
            kstack + KSTACK_SIZE,
        );
    }
    child.se.priority.store(parent.se.priority(), Ordering::Relaxed);
    child
        .se
        .affinity
        .store(parent.se.affinity.load(Ordering::Relaxed), Ordering::Relaxed);

    if flags.contains(CloneFlags::CHILD_CLEARTID) {
        child.clear_child_tid.store(args.ctid, Ordering::Relaxed);
    }

    // Tid writebacks before the child can run.
    if flags.contains(CloneFlags::PARENT_SETTID) && args.ptid != 0 {
        if let Some(vm) = parent.vm_clone() {
            vm.copy_out_val(args.ptid, &(pid as i32))?;
        }
    }
    if flags.contains(CloneFlags::CHILD_SETTID) && args.ctid != 0 {
        if let Some(vm) = child.vm_clone() {
            vm.copy_out_val(args.ctid, &(pid as i32))?;
        }
    }

    if flags.contains(CloneFlags::VFORK) {
        child
            .vfork_parent
            .store(parent as *const Thread as *mut Thread, Ordering::Release);
    }

    // Joining a group is decided before publication so failure cannot
    // leave a half-registered thread.
    let parent_tg = if flags.contains(CloneFlags::THREAD) {
        Some(parent.group_clone().ok_or(EINVAL)?)
    } else {
        None
    };

    // Publish: pid table, family tree, thread group.
    let child_ref: &'static Thread = Box::leak(child);
    table::pid_wlock();
    unsafe {
        table::table_add(child_ref);
        table::attach_child(parent, child_ref);
        match parent_tg {
            Some(tg) => {
                tg.add(child_ref);
                child_ref.set_flag(FLAG_SELF_REAP);
            }
            None => {
                let tg = ThreadGroup::new_for(child_ref);
                *child_ref.thread_group.get() = Some(tg);
            }
        }
    }
    table::pid_wunlock();

    // Hand the child to the scheduler.
    sched::activate_new_thread(child_ref);

    if flags.contains(CloneFlags::VFORK) {
        // Parent sleeps until the child execs or exits. The child runs on
        // the parent's stack, so the parent must not return first.
        child_ref.vfork_done.wait();
    }

    Ok(pid)
}

/// Create a kernel thread: fresh group, default sigacts, started at
/// `entry(arg0, arg1)`.
pub fn kthread_create(
    name: &str,
    entry: fn(usize, usize),
    arg0: usize,
    arg1: usize,
) -> Result<Pid, i64> {
    let pid = table::alloc_pid()?;
    let kstack = alloc_kstack(KSTACK_SIZE).ok_or(ENOMEM)?;
    let mut child = Thread::new(name, pid, kstack, KSTACK_SIZE);
    child.kentry = Some(entry);
    child.karg = [arg0, arg1];
    unsafe {
        *child.sigacts.get() = Some(Sigacts::new());
        (*child.se.context.get()).prime(
            sched::thread_entry_shim as usize,
            kstack + KSTACK_SIZE,
        );
    }

    let child_ref: &'static Thread = Box::leak(child);
    table::pid_wlock();
    unsafe {
        table::table_add(child_ref);
        if let Some(parent) = smp::current() {
            table::attach_child(parent, child_ref);
        }
        let tg = ThreadGroup::new_for(child_ref);
        *child_ref.thread_group.get() = Some(tg);
    }
    table::pid_wunlock();

    sched::activate_new_thread(child_ref);
    Ok(pid)
}
