/*
 * Signal syscalls. User-facing sigaction/sigset layouts are fixed
 * (#[repr(C)]) and converted at this boundary.
 */

use crate::errno::{EFAULT, EINVAL};
use crate::signal;
use crate::signal::types::{sig_bad, SaFlags, SigAction, SigHandler, SigSet};
use crate::smp;
use crate::syscall::{arg_addr, arg_int};
use crate::trap::UTrapFrame;

/// User-space view of struct sigaction.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct UserSigaction {
    handler: u64,
    mask: u64,
    flags: u32,
    _pad: u32,
}

const SIG_DFL: u64 = 0;
const SIG_IGN: u64 = 1;

impl UserSigaction {
    fn to_kernel(self) -> SigAction {
        let handler = match self.handler {
            SIG_DFL => SigHandler::Default,
            SIG_IGN => SigHandler::Ignore,
            addr => SigHandler::User(addr),
        };
        SigAction {
            handler,
            mask: SigSet(self.mask),
            flags: SaFlags::from_bits_truncate(self.flags),
        }
    }

    fn from_kernel(act: &SigAction) -> UserSigaction {
        let handler = match act.handler {
            SigHandler::Default => SIG_DFL,
            SigHandler::Ignore => SIG_IGN,
            SigHandler::User(addr) => addr,
        };
        UserSigaction {
            handler,
            mask: act.mask.0,
            flags: act.flags.bits(),
            _pad: 0,
        }
    }
}

fn current_vm() -> Result<alloc::sync::Arc<crate::mm::vm::Vm>, i64> {
    smp::current()
        .and_then(|p| p.vm_clone())
        .ok_or(EINVAL)
}

pub fn sys_kill(tf: &UTrapFrame) -> i64 {
    let pid = arg_int(tf, 0);
    let signo = arg_int(tf, 1);
    match signal::kill(pid, signo) {
        Ok(()) => 0,
        Err(e) => -e,
    }
}

pub fn sys_tgkill(tf: &UTrapFrame) -> i64 {
    let tgid = arg_int(tf, 0);
    let tid = arg_int(tf, 1);
    let signo = arg_int(tf, 2);
    match signal::tgkill(tgid, tid, signo) {
        Ok(()) => 0,
        Err(e) => -e,
    }
}

pub fn sys_tkill(tf: &UTrapFrame) -> i64 {
    let tid = arg_int(tf, 0);
    let signo = arg_int(tf, 1);
    match signal::tkill(tid, signo) {
        Ok(()) => 0,
        Err(e) => -e,
    }
}

pub fn sys_sigaction(tf: &UTrapFrame) -> i64 {
    let signo = arg_int(tf, 0);
    let act_addr = arg_addr(tf, 1);
    let old_addr = arg_addr(tf, 2);
    if sig_bad(signo) {
        return -EINVAL;
    }
    let vm = match current_vm() {
        Ok(vm) => vm,
        Err(e) => return -e,
    };

    let new_act = if act_addr != 0 {
        match vm.copy_in_val::<UserSigaction>(act_addr) {
            Ok(ua) => Some(ua.to_kernel()),
            Err(_) => return -EFAULT,
        }
    } else {
        None
    };

    let mut old_act = SigAction::default_action();
    let old_ref = if old_addr != 0 { Some(&mut old_act) } else { None };

    match signal::sigaction(signo, new_act.as_ref(), old_ref) {
        Ok(()) => {}
        Err(e) => return -e,
    }

    if old_addr != 0 {
        let ua = UserSigaction::from_kernel(&old_act);
        if vm.copy_out_val(old_addr, &ua).is_err() {
            return -EFAULT;
        }
    }
    0
}

pub fn sys_sigprocmask(tf: &UTrapFrame) -> i64 {
    let how = arg_int(tf, 0);
    let set_addr = arg_addr(tf, 1);
    let old_addr = arg_addr(tf, 2);
    let vm = match current_vm() {
        Ok(vm) => vm,
        Err(e) => return -e,
    };

    let set = if set_addr != 0 {
        match vm.copy_in_val::<u64>(set_addr) {
            Ok(bits) => Some(SigSet(bits)),
            Err(_) => return -EFAULT,
        }
    } else {
        None
    };

    match signal::sigprocmask(how, set) {
        Ok(old) => {
            if old_addr != 0 && vm.copy_out_val(old_addr, &old.0).is_err() {
                return -EFAULT;
            }
            0
        }
        Err(e) => -e,
    }
}

pub fn sys_sigpending(tf: &UTrapFrame) -> i64 {
    let set_addr = arg_addr(tf, 0);
    if set_addr == 0 {
        return -EINVAL;
    }
    let vm = match current_vm() {
        Ok(vm) => vm,
        Err(e) => return -e,
    };
    match signal::sigpending() {
        Ok(set) => {
            if vm.copy_out_val(set_addr, &set.0).is_err() {
                return -EFAULT;
            }
            0
        }
        Err(e) => -e,
    }
}

pub fn sys_sigreturn() -> i64 {
    match signal::sigreturn() {
        Ok(a0) => a0 as i64,
        Err(e) => -e,
    }
}
