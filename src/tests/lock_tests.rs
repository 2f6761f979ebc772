/*
 * Blocking-primitive scenarios: mutex mutual exclusion under load, the
 * rwlock reader-checksum hammer, completion broadcast, semaphore handoff
 * and priority-ordered wakeup, rwsem, and a workqueue smoke test.
 */

use core::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use crate::proc::clone::kthread_create;
use crate::proc::lifecycle;
use crate::sched;
use crate::sync::{Completion, Mutex, RwLock, RwSem, Semaphore, RWSEM_PRIO_WRITE};
use crate::tests::{check, join_children};
use crate::utils::timer::sleep_ms;
use crate::workqueue::{WorkQueue, WorkStruct};

pub fn run() {
    test_mutex_counter();
    test_completion_broadcast();
    test_semaphore_handoff();
    test_semaphore_priority_order();
    test_rwsem_write_priority();
    test_rwlock_checksum();
    test_workqueue();
}

// ───── mutex ─────

static COUNTER_MUTEX: Mutex = Mutex::new("t_counter");
static mut SHARED_COUNTER: u64 = 0;

fn mutex_incrementer(_a0: usize, _a1: usize) {
    for _ in 0..500 {
        COUNTER_MUTEX.lock();
        unsafe {
            let v = core::ptr::read_volatile(core::ptr::addr_of!(SHARED_COUNTER));
            // Widen the race window so broken exclusion actually fails.
            sched::scheduler_yield();
            core::ptr::write_volatile(core::ptr::addr_of_mut!(SHARED_COUNTER), v + 1);
        }
        COUNTER_MUTEX.unlock();
    }
    lifecycle::exit(0);
}

fn test_mutex_counter() {
    COUNTER_MUTEX.init();
    unsafe { core::ptr::write_volatile(core::ptr::addr_of_mut!(SHARED_COUNTER), 0) };
    const THREADS: usize = 4;
    for _ in 0..THREADS {
        kthread_create("t_mtx", mutex_incrementer, 0, 0).expect("spawn failed");
    }
    join_children(THREADS);
    let total = unsafe { core::ptr::read_volatile(core::ptr::addr_of!(SHARED_COUNTER)) };
    check("mutex excludes concurrent increments", total == (THREADS as u64) * 500);
    check("mutex ends unowned", !COUNTER_MUTEX.holding());
}

// ───── completion ─────

static BCAST_COMPLETION: Completion = Completion::new("t_bcast");
static BCAST_WOKEN: AtomicUsize = AtomicUsize::new(0);

fn completion_waiter(_a0: usize, _a1: usize) {
    BCAST_COMPLETION.wait();
    BCAST_WOKEN.fetch_add(1, Ordering::SeqCst);
    lifecycle::exit(0);
}

fn test_completion_broadcast() {
    BCAST_COMPLETION.init();
    BCAST_COMPLETION.reinit();
    BCAST_WOKEN.store(0, Ordering::SeqCst);
    const WAITERS: usize = 3;
    for _ in 0..WAITERS {
        kthread_create("t_cwait", completion_waiter, 0, 0).expect("spawn failed");
    }
    sleep_ms(30);
    BCAST_COMPLETION.complete_all();
    join_children(WAITERS);
    check(
        "complete_all wakes every waiter",
        BCAST_WOKEN.load(Ordering::SeqCst) == WAITERS,
    );

    // complete-then-wait equals wait-then-complete for the counter.
    let c = Completion::new("t_order");
    c.init();
    c.complete();
    c.wait();
    check("completion complete/wait round-trip settles", c.try_wait() == false);
}

// ───── semaphore ─────

static HANDOFF_SEM: Semaphore = Semaphore::new("t_sem", 0);
static HANDOFF_RET: AtomicI64 = AtomicI64::new(i64::MIN);

fn sem_consumer(_a0: usize, _a1: usize) {
    HANDOFF_RET.store(HANDOFF_SEM.wait(), Ordering::SeqCst);
    lifecycle::exit(0);
}

fn test_semaphore_handoff() {
    HANDOFF_SEM.init();
    HANDOFF_RET.store(i64::MIN, Ordering::SeqCst);
    kthread_create("t_semc", sem_consumer, 0, 0).expect("spawn failed");
    sleep_ms(30);
    HANDOFF_SEM.post();
    join_children(1);
    check(
        "sem_wait returns 0 after a post and the value settles at 0",
        HANDOFF_RET.load(Ordering::SeqCst) == 0 && HANDOFF_SEM.value() == 0,
    );
    check("sem trywait on empty reports EAGAIN", HANDOFF_SEM.try_wait() == -crate::errno::EAGAIN);
}

static PRIO_SEM: Semaphore = Semaphore::new("t_prio_sem", 0);
static WAKE_ORDER: [AtomicUsize; 3] = [
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
];
static WAKE_SEQ: AtomicUsize = AtomicUsize::new(0);

fn prio_waiter(slot: usize, prio: usize) {
    let me = crate::smp::current().unwrap();
    sched::set_priority(me, prio as i32);
    if PRIO_SEM.wait() == 0 {
        let seq = WAKE_SEQ.fetch_add(1, Ordering::SeqCst);
        WAKE_ORDER[slot].store(seq + 1, Ordering::SeqCst);
    }
    lifecycle::exit(0);
}

fn test_semaphore_priority_order() {
    PRIO_SEM.init();
    WAKE_SEQ.store(0, Ordering::SeqCst);
    for w in WAKE_ORDER.iter() {
        w.store(0, Ordering::SeqCst);
    }
    // slot 0 lowest priority (largest number), slot 2 highest.
    kthread_create("t_prio0", prio_waiter, 0, 200).expect("spawn failed");
    kthread_create("t_prio1", prio_waiter, 1, 120).expect("spawn failed");
    kthread_create("t_prio2", prio_waiter, 2, 40).expect("spawn failed");
    sleep_ms(50);

    for _ in 0..3 {
        PRIO_SEM.post();
        sleep_ms(30);
    }
    join_children(3);

    let order = [
        WAKE_ORDER[0].load(Ordering::SeqCst),
        WAKE_ORDER[1].load(Ordering::SeqCst),
        WAKE_ORDER[2].load(Ordering::SeqCst),
    ];
    check(
        "semaphore wakes waiters in priority order",
        order == [3, 2, 1],
    );
}

// ───── rwsem ─────

static RWSEM: RwSem = RwSem::new("t_rwsem", RWSEM_PRIO_WRITE);
static RWSEM_READS: AtomicUsize = AtomicUsize::new(0);

fn rwsem_reader(_a0: usize, _a1: usize) {
    for _ in 0..50 {
        if RWSEM.acquire_read() == 0 {
            RWSEM_READS.fetch_add(1, Ordering::SeqCst);
            sched::scheduler_yield();
            RWSEM.release();
        }
    }
    lifecycle::exit(0);
}

fn rwsem_writer(_a0: usize, _a1: usize) {
    for _ in 0..20 {
        if RWSEM.acquire_write() == 0 {
            check("rwsem writer owns the lock", RWSEM.is_write_holding());
            sched::scheduler_yield();
            RWSEM.release();
        }
    }
    lifecycle::exit(0);
}

fn test_rwsem_write_priority() {
    RWSEM.init();
    RWSEM_READS.store(0, Ordering::SeqCst);
    kthread_create("t_rws_r1", rwsem_reader, 0, 0).expect("spawn failed");
    kthread_create("t_rws_r2", rwsem_reader, 0, 0).expect("spawn failed");
    kthread_create("t_rws_w", rwsem_writer, 0, 0).expect("spawn failed");
    join_children(3);
    check("rwsem readers all completed", RWSEM_READS.load(Ordering::SeqCst) == 100);
}

// ───── spin rwlock checksum hammer ─────

const RW_BUF_WORDS: usize = 8;
static RW_LOCK: RwLock = RwLock::new("t_rwlock");
static mut RW_BUF: [u64; RW_BUF_WORDS] = [0; RW_BUF_WORDS];
static mut RW_SUM: u64 = 0;
static RW_BAD: AtomicUsize = AtomicUsize::new(0);

fn rw_writer(seed: usize, _a1: usize) {
    for round in 0..200u64 {
        RW_LOCK.wlock();
        unsafe {
            let buf = &mut *core::ptr::addr_of_mut!(RW_BUF);
            let mut sum = 0;
            for (i, slot) in buf.iter_mut().enumerate() {
                *slot = round.wrapping_mul(seed as u64).wrapping_add(i as u64);
                sum += *slot;
            }
            core::ptr::write(core::ptr::addr_of_mut!(RW_SUM), sum);
        }
        RW_LOCK.wunlock();
        if round % 32 == 0 {
            sched::scheduler_yield();
        }
    }
    lifecycle::exit(0);
}

fn rw_reader(_a0: usize, _a1: usize) {
    for round in 0..400 {
        RW_LOCK.rlock();
        unsafe {
            let buf = &*core::ptr::addr_of!(RW_BUF);
            let sum: u64 = buf.iter().sum();
            if sum != core::ptr::read(core::ptr::addr_of!(RW_SUM)) {
                RW_BAD.fetch_add(1, Ordering::SeqCst);
            }
        }
        RW_LOCK.runlock();
        if round % 64 == 0 {
            sched::scheduler_yield();
        }
    }
    lifecycle::exit(0);
}

fn test_rwlock_checksum() {
    RW_BAD.store(0, Ordering::SeqCst);
    for seed in 0..2 {
        kthread_create("t_rw_w", rw_writer, seed + 3, 0).expect("spawn failed");
    }
    for _ in 0..6 {
        kthread_create("t_rw_r", rw_reader, 0, 0).expect("spawn failed");
    }
    join_children(8);
    check(
        "rwlock readers always observe a consistent version",
        RW_BAD.load(Ordering::SeqCst) == 0,
    );
}

// ───── workqueue ─────

static WQ_RUNS: AtomicUsize = AtomicUsize::new(0);

fn wq_work_fn(arg: usize) {
    WQ_RUNS.fetch_add(arg, Ordering::SeqCst);
}

fn test_workqueue() {
    WQ_RUNS.store(0, Ordering::SeqCst);
    let wq = WorkQueue::create("t_wq", 1, 4).expect("workqueue create failed");

    // Work structs must outlive their execution; the test leaks a batch.
    let works: &'static mut [WorkStruct; 8] =
        alloc::boxed::Box::leak(alloc::boxed::Box::new(core::array::from_fn(|_| {
            WorkStruct::new(wq_work_fn, 1)
        })));
    let mut accepted = true;
    for work in works.iter_mut() {
        accepted &= unsafe { wq.queue_work(work) };
    }
    check("workqueue accepted all work", accepted);

    let mut spins = 0;
    while WQ_RUNS.load(Ordering::SeqCst) < 8 && spins < 500 {
        sleep_ms(10);
        spins += 1;
    }
    check("workqueue executed all submitted work", WQ_RUNS.load(Ordering::SeqCst) == 8);
}
