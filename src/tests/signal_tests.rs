/*
 * Signal scenarios: mask round-trips, SIGKILL against a fully-masked
 * blocked thread, interruptible sleep cut short, stop/continue.
 */

use core::sync::atomic::{AtomicI32, AtomicI64, AtomicUsize, Ordering};

use crate::proc::clone::kthread_create;
use crate::proc::lifecycle;
use crate::sched;
use crate::signal;
use crate::signal::deliver::{SIG_BLOCK, SIG_SETMASK};
use crate::signal::types::{SigSet, SIGKILL, SIGSTOP, SIGTERM, SIGUSR1, SIGUSR2};
use crate::smp;
use crate::sync::Semaphore;
use crate::tests::{check, join_children};
use crate::utils::timer::{jiffies, sleep_ms};

pub fn run() {
    test_sigprocmask_roundtrip();
    test_sigkill_masked_blocked();
    test_sleep_interrupted();
    test_stop_cont();
}

// ───── sigprocmask ─────

fn test_sigprocmask_roundtrip() {
    let mut set = SigSet::empty();
    set.add(SIGUSR1);
    set.add(SIGUSR2);
    set.add(SIGKILL); // must be stripped
    set.add(SIGSTOP); // must be stripped

    let old = signal::sigprocmask(SIG_BLOCK, Some(set)).expect("sigprocmask failed");
    let now = signal::sigprocmask(SIG_SETMASK, Some(old)).expect("restore failed");
    check(
        "sigprocmask blocks requested signals minus KILL/STOP",
        now.contains(SIGUSR1) && now.contains(SIGUSR2) && !now.contains(SIGKILL)
            && !now.contains(SIGSTOP),
    );
    let restored = signal::sigprocmask(SIG_SETMASK, Some(old)).expect("re-read failed");
    check("sigprocmask set/restore round-trips", restored == old);
}

// ───── SIGKILL vs a blocked, fully masked thread ─────

static KILLTEST_SEM: Semaphore = Semaphore::new("t_kill_sem", 0);
static KILLTEST_WAIT_RET: AtomicI64 = AtomicI64::new(i64::MIN);
static KILLTEST_TID: AtomicI32 = AtomicI32::new(0);

fn killable_sleeper(_a0: usize, _a1: usize) {
    let me = smp::current().unwrap();
    KILLTEST_TID.store(me.pid, Ordering::SeqCst);

    // Block everything blockable; SIGKILL must still get through.
    let all = SigSet(!0);
    signal::sigprocmask(SIG_BLOCK, Some(all)).expect("mask failed");

    let ret = KILLTEST_SEM.wait();
    KILLTEST_WAIT_RET.store(ret, Ordering::SeqCst);
    lifecycle::exit(3);
}

fn test_sigkill_masked_blocked() {
    KILLTEST_WAIT_RET.store(i64::MIN, Ordering::SeqCst);
    KILLTEST_TID.store(0, Ordering::SeqCst);
    KILLTEST_SEM.init();
    kthread_create("t_killee", killable_sleeper, 0, 0).expect("spawn failed");

    // Wait for it to park on the semaphore.
    let mut spins = 0;
    while KILLTEST_TID.load(Ordering::SeqCst) == 0 && spins < 1000 {
        sleep_ms(5);
        spins += 1;
    }
    sleep_ms(20);

    let tid = KILLTEST_TID.load(Ordering::SeqCst);
    signal::tkill(tid, SIGKILL).expect("tkill failed");
    let reaped = join_children(1);

    check(
        "SIGKILL wakes and terminates a masked blocked thread",
        reaped.len() == 1 && KILLTEST_WAIT_RET.load(Ordering::SeqCst) == -crate::errno::EINTR,
    );
}

// ───── interruptible sleep (sleep_ms vs signal) ─────

static SLEEP_RET: AtomicI64 = AtomicI64::new(i64::MIN);
static SLEEP_ELAPSED: AtomicI64 = AtomicI64::new(0);
static SLEEP_TID: AtomicI32 = AtomicI32::new(0);

fn interrupted_sleeper(_a0: usize, _a1: usize) {
    let me = smp::current().unwrap();
    SLEEP_TID.store(me.pid, Ordering::SeqCst);
    let t0 = jiffies();
    let ret = sleep_ms(1000);
    SLEEP_RET.store(ret, Ordering::SeqCst);
    SLEEP_ELAPSED.store((jiffies() - t0) as i64, Ordering::SeqCst);
    lifecycle::exit(0);
}

fn test_sleep_interrupted() {
    SLEEP_RET.store(i64::MIN, Ordering::SeqCst);
    SLEEP_TID.store(0, Ordering::SeqCst);
    kthread_create("t_sleeper", interrupted_sleeper, 0, 0).expect("spawn failed");

    let mut spins = 0;
    while SLEEP_TID.load(Ordering::SeqCst) == 0 && spins < 1000 {
        sleep_ms(5);
        spins += 1;
    }
    sleep_ms(20);
    // SIGUSR1's default action terminates, which is fine: the sleep
    // return value is recorded before the thread dies.
    signal::tkill(SLEEP_TID.load(Ordering::SeqCst), SIGUSR1).expect("tkill failed");
    let _ = join_children(1);

    let ret = SLEEP_RET.load(Ordering::SeqCst);
    let elapsed = SLEEP_ELAPSED.load(Ordering::SeqCst);
    check(
        "sleep_ms returns -EINTR early on a signal",
        ret == -crate::errno::EINTR && elapsed < 80,
    );
}

// ───── stop / continue ─────

static STOP_COUNTER: AtomicUsize = AtomicUsize::new(0);
static STOP_TID: AtomicI32 = AtomicI32::new(0);

fn stoppable_worker(_a0: usize, _a1: usize) {
    let me = smp::current().unwrap();
    STOP_TID.store(me.pid, Ordering::SeqCst);
    loop {
        STOP_COUNTER.fetch_add(1, Ordering::SeqCst);
        signal::handle_signal();
        sched::scheduler_yield();
    }
}

fn test_stop_cont() {
    STOP_COUNTER.store(0, Ordering::SeqCst);
    STOP_TID.store(0, Ordering::SeqCst);
    kthread_create("t_stopper", stoppable_worker, 0, 0).expect("spawn failed");

    let mut spins = 0;
    while STOP_TID.load(Ordering::SeqCst) == 0 && spins < 1000 {
        sleep_ms(5);
        spins += 1;
    }
    let tid = STOP_TID.load(Ordering::SeqCst);

    signal::tkill(tid, SIGSTOP).expect("SIGSTOP failed");
    sleep_ms(50);
    let frozen_at = STOP_COUNTER.load(Ordering::SeqCst);
    sleep_ms(50);
    let still = STOP_COUNTER.load(Ordering::SeqCst);
    check("SIGSTOP freezes the thread", frozen_at == still);

    signal::tkill(tid, crate::signal::types::SIGCONT).expect("SIGCONT failed");
    sleep_ms(50);
    let resumed = STOP_COUNTER.load(Ordering::SeqCst);
    check("SIGCONT resumes the thread", resumed > still);

    signal::tkill(tid, SIGTERM).expect("SIGTERM failed");
    let reaped = join_children(1);
    check("stopped/continued thread terminates on SIGTERM", reaped.len() == 1);
}
