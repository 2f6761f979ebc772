/*
 * Syscall dispatch.
 *
 * The trap path hands over the user trapframe: number in a7, arguments
 * in a0..a5, result back in a0 (negative errno on failure). Handlers
 * validate every user pointer through the Vm contract before touching
 * it.
 */

pub mod numbers;
pub mod process;
pub mod signal;

use crate::errno::ENOSYS;
use crate::trap::UTrapFrame;
use numbers::*;

/// Fetch the n-th syscall argument.
pub fn arg_raw(tf: &UTrapFrame, n: usize) -> u64 {
    tf.a[n]
}

pub fn arg_int(tf: &UTrapFrame, n: usize) -> i32 {
    tf.a[n] as i32
}

pub fn arg_addr(tf: &UTrapFrame, n: usize) -> u64 {
    tf.a[n]
}

pub fn dispatch(tf: &mut UTrapFrame) -> i64 {
    let num = tf.a[7];
    match num {
        SYS_FORK => process::sys_fork(),
        SYS_VFORK => process::sys_vfork(),
        SYS_CLONE => process::sys_clone(tf),
        SYS_EXIT => process::sys_exit(tf),
        SYS_EXIT_GROUP => process::sys_exit_group(tf),
        SYS_WAIT => process::sys_wait(tf),
        SYS_GETPID => process::sys_getpid(),
        SYS_GETTID => process::sys_gettid(),
        SYS_SBRK => process::sys_sbrk(tf),
        SYS_SLEEP => process::sys_sleep(tf),
        SYS_UPTIME => process::sys_uptime(),
        SYS_KILL => signal::sys_kill(tf),
        SYS_TGKILL => signal::sys_tgkill(tf),
        SYS_TKILL => signal::sys_tkill(tf),
        SYS_SIGACTION => signal::sys_sigaction(tf),
        SYS_SIGPROCMASK => signal::sys_sigprocmask(tf),
        SYS_SIGPENDING => signal::sys_sigpending(tf),
        SYS_SIGRETURN => signal::sys_sigreturn(),
        _ => {
            log::warn!("unknown syscall {}", num);
            -ENOSYS
        }
    }
}
