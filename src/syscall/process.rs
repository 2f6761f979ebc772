/*
 * Process-management syscalls.
 */

use crate::errno::{into_sysret, EFAULT, EINVAL};
use crate::proc::clone::{thread_clone, CloneArgs};
use crate::proc::lifecycle;
use crate::proc::thread_group;
use crate::smp;
use crate::syscall::{arg_addr, arg_int};
use crate::trap::UTrapFrame;

pub fn sys_fork() -> i64 {
    into_sysret(thread_clone(&CloneArgs::fork()).map(|pid| pid as u64))
}

/// vfork() is a dedicated syscall so the user wrapper can be pure
/// assembly (ecall + ret, no frame): parent and child share the stack
/// until the child execs or exits.
pub fn sys_vfork() -> i64 {
    into_sysret(thread_clone(&CloneArgs::vfork()).map(|pid| pid as u64))
}

pub fn sys_clone(tf: &UTrapFrame) -> i64 {
    let uargs = arg_addr(tf, 0);
    let mut args = if uargs == 0 {
        // No argument block: plain fork semantics.
        CloneArgs::fork()
    } else {
        let p = match smp::current() {
            Some(p) => p,
            None => return -EINVAL,
        };
        let vm = match p.vm_clone() {
            Some(vm) => vm,
            None => return -EINVAL,
        };
        match vm.copy_in_val::<CloneArgs>(uargs) {
            Ok(args) => args,
            Err(_) => return -EFAULT,
        }
    };
    if args.esignal == 0 {
        args.esignal = args.flags & 0xff;
    }
    into_sysret(thread_clone(&args).map(|pid| pid as u64))
}

pub fn sys_exit(tf: &UTrapFrame) -> i64 {
    lifecycle::exit(arg_int(tf, 0));
}

pub fn sys_exit_group(tf: &UTrapFrame) -> i64 {
    let p = smp::current().expect("exit_group without thread");
    thread_group::thread_group_exit(p, arg_int(tf, 0));
}

pub fn sys_wait(tf: &UTrapFrame) -> i64 {
    let status_addr = arg_addr(tf, 0);
    match lifecycle::wait() {
        Ok((tgid, status)) => {
            if status_addr != 0 {
                let p = smp::current().expect("wait without thread");
                if let Some(vm) = p.vm_clone() {
                    if vm.copy_out_val(status_addr, &status).is_err() {
                        return -EFAULT;
                    }
                }
            }
            tgid as i64
        }
        Err(e) => -e,
    }
}

pub fn sys_getpid() -> i64 {
    smp::current().map(|p| p.tgid() as i64).unwrap_or(-EINVAL)
}

/// The caller's own tid; equals getpid() only in single-threaded
/// processes.
pub fn sys_gettid() -> i64 {
    smp::current().map(|p| p.pid as i64).unwrap_or(-EINVAL)
}

pub fn sys_sbrk(tf: &UTrapFrame) -> i64 {
    let delta = tf.a[0] as i64;
    let p = match smp::current() {
        Some(p) => p,
        None => return -EINVAL,
    };
    let vm = match p.vm_clone() {
        Some(vm) => vm,
        None => return -EINVAL,
    };
    match vm.grow_heap(delta) {
        Ok(old_break) => old_break as i64,
        Err(e) => -e,
    }
}

pub fn sys_sleep(tf: &UTrapFrame) -> i64 {
    let ms = arg_int(tf, 0).max(0) as u64;
    crate::utils::timer::sleep_ms(ms)
}

pub fn sys_uptime() -> i64 {
    crate::utils::timer::jiffies() as i64
}
