/*
 * Lifecycle and scheduler scenarios: fork/exit/wait, thread groups under
 * a group-directed terminal signal, vfork ordering, and a yield storm.
 */

use core::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

use crate::proc::clone::{kthread_create, thread_clone, CloneArgs, CloneFlags};
use crate::proc::lifecycle;
use crate::sched;
use crate::signal;
use crate::smp;
use crate::tests::{check, join_children};
use crate::utils::timer::sleep_ms;

pub fn run() {
    test_fork_exit_wait();
    test_thread_group_term();
    test_vfork_blocks_parent();
    test_yield_storm();
}

// ───── fork / exit / wait ─────

fn exit42_child(_a0: usize, _a1: usize) {
    lifecycle::exit(42);
}

fn test_fork_exit_wait() {
    let pid = kthread_create("t_exit42", exit42_child, 0, 0).expect("spawn failed");
    let reaped = join_children(1);
    check(
        "fork/exit/wait returns the child and its status",
        reaped.len() == 1 && reaped[0].0 == pid && reaped[0].1 == 42,
    );

    // No children left: wait reports -ECHILD.
    let ret = lifecycle::wait();
    check(
        "wait with no children returns ECHILD",
        matches!(ret, Err(e) if e == crate::errno::ECHILD),
    );
}

// ───── thread group + group-directed SIGTERM ─────

static GROUP_TGID: AtomicI32 = AtomicI32::new(0);
static MEMBERS_UP: AtomicUsize = AtomicUsize::new(0);

fn group_member(_a0: usize, _a1: usize) {
    MEMBERS_UP.fetch_add(1, Ordering::SeqCst);
    loop {
        signal::handle_signal();
        sched::scheduler_yield();
    }
}

fn group_leader(_a0: usize, _a1: usize) {
    let me = smp::current().unwrap();
    GROUP_TGID.store(me.tgid(), Ordering::SeqCst);

    let flags = CloneFlags::THREAD | CloneFlags::SIGHAND | CloneFlags::VM | CloneFlags::FS
        | CloneFlags::FILES;
    for _ in 0..2 {
        let args = CloneArgs {
            flags: flags.bits(),
            entry: group_member as usize as u64,
            ..Default::default()
        };
        thread_clone(&args).expect("member clone failed");
    }

    loop {
        signal::handle_signal();
        sched::scheduler_yield();
    }
}

fn test_thread_group_term() {
    // CLONE_THREAD without CLONE_SIGHAND must be rejected outright.
    let bad = CloneArgs {
        flags: CloneFlags::THREAD.bits(),
        entry: group_member as usize as u64,
        ..Default::default()
    };
    check(
        "CLONE_THREAD without CLONE_SIGHAND fails with EINVAL",
        matches!(thread_clone(&bad), Err(e) if e == crate::errno::EINVAL),
    );

    MEMBERS_UP.store(0, Ordering::SeqCst);
    GROUP_TGID.store(0, Ordering::SeqCst);
    kthread_create("t_group", group_leader, 0, 0).expect("leader spawn failed");

    // Let the leader build its group.
    let mut spins = 0;
    while MEMBERS_UP.load(Ordering::SeqCst) < 2 && spins < 1000 {
        sleep_ms(10);
        spins += 1;
    }
    let tgid = GROUP_TGID.load(Ordering::SeqCst);
    check("thread group came up", tgid != 0 && MEMBERS_UP.load(Ordering::SeqCst) == 2);

    // A process-directed SIGTERM takes the whole group down; only the
    // leader becomes a zombie visible to us.
    signal::kill(tgid, crate::signal::types::SIGTERM).expect("group kill failed");
    let reaped = join_children(1);
    check(
        "group SIGTERM reaps exactly the leader",
        reaped.len() == 1 && reaped[0].0 == tgid,
    );
    // Give the adopted members a moment to finish self-reaping.
    sleep_ms(50);
    let again = lifecycle::wait();
    check(
        "group members self-reaped (no extra zombies)",
        matches!(again, Err(e) if e == crate::errno::ECHILD),
    );
}

// ───── vfork ─────

static VFORK_CHILD_RAN: AtomicBool = AtomicBool::new(false);

fn vfork_child(_a0: usize, _a1: usize) {
    sleep_ms(20);
    VFORK_CHILD_RAN.store(true, Ordering::SeqCst);
    lifecycle::exit(7);
}

fn test_vfork_blocks_parent() {
    VFORK_CHILD_RAN.store(false, Ordering::SeqCst);
    let args = CloneArgs {
        flags: (CloneFlags::VM | CloneFlags::VFORK).bits(),
        entry: vfork_child as usize as u64,
        esignal: crate::signal::types::SIGCHLD as u64,
        ..Default::default()
    };
    let pid = thread_clone(&args).expect("vfork clone failed");
    // thread_clone only returns after the child's vfork_done fires.
    check(
        "vfork parent resumed only after child exit",
        VFORK_CHILD_RAN.load(Ordering::SeqCst),
    );
    let reaped = join_children(1);
    check(
        "vfork child reaped with its status",
        reaped.len() == 1 && reaped[0].0 == pid && reaped[0].1 == 7,
    );
}

// ───── yield storm ─────

static STORM_DONE: AtomicUsize = AtomicUsize::new(0);

fn storm_worker(id: usize, _a1: usize) {
    let mut acc: u64 = 0;
    for i in 0..200 {
        acc = acc.wrapping_add((id as u64).wrapping_mul(i));
        sched::scheduler_yield();
        if i % 50 == 0 {
            sleep_ms(1 + (id as u64 % 3));
        }
    }
    STORM_DONE.fetch_add(1, Ordering::SeqCst);
    lifecycle::exit(0);
}

fn test_yield_storm() {
    STORM_DONE.store(0, Ordering::SeqCst);
    const WORKERS: usize = 8;
    for id in 0..WORKERS {
        kthread_create("t_storm", storm_worker, id, 0).expect("storm spawn failed");
    }
    let reaped = join_children(WORKERS);
    check(
        "yield storm: every worker ran to completion",
        reaped.len() == WORKERS && STORM_DONE.load(Ordering::SeqCst) == WORKERS,
    );
}
