/*
 * Scheduler core.
 *
 * Mechanism layer over the scheduling classes: the thread-state machine,
 * voluntary yield, the idempotent wakeup protocol, direct thread-to-thread
 * context switches, and the per-hart idle threads.
 *
 * Wakeup protocol (the WAKENING handshake):
 *
 *   A waker takes the target's pi_lock, checks the state is a matching
 *   sleeping state, and CASes it to WAKENING — claiming the wakeup.
 *   Concurrent wakers lose the CAS and coalesce to nothing.
 *
 *   If the target is still on_cpu (it set its sleeping state but has not
 *   finished switching away), the waker leaves it in WAKENING: either the
 *   target's own yield notices WAKENING and stays runnable, or the
 *   context_switch_tail on its hart commits the wakeup after the switch.
 *   Otherwise the waker commits immediately.
 *
 *   Committing CASes WAKENING -> RUNNING (again, exactly one committer
 *   wins) and enqueues the entity: directly under the local rq lock, or
 *   onto the target CPU's lock-free wake list plus a RESCHEDULE IPI.
 *
 * The rq lock is held across cswitch and released by the thread switched
 * to (context_switch_tail); a freshly created thread enters through
 * thread_entry_shim which performs the same tail.
 */

pub mod class;
pub mod context;
pub mod entity;
pub mod fifo;
pub mod idle;
pub mod rq;

use core::sync::atomic::Ordering;

use crate::proc::thread::{Thread, ThreadState};
use crate::smp::{self, atomic::smp_mb};
use class::{class_of, SchedClass};
use entity::{SchedEntity, CLASS_IDLE};
use rq::{rq_of, this_rq, RqPercpu};

/// One-time global init: self-link every rq's list heads.
pub fn scheduler_init() {
    for cpu in 0..crate::smp::NCPU {
        rq_of(cpu).init();
    }
    log::info!("scheduler: {} run queues ready", crate::smp::NCPU);
}

/// Turn the calling hart's boot context into its idle thread and mark the
/// hart schedulable. Runs once per hart, before the first yield.
pub fn idle_thread_init() {
    let hart = crate::arch::hartid();
    let mut name = alloc::string::String::new();
    core::fmt::write(&mut name, format_args!("idle/{}", hart)).ok();
    let idle = Thread::new(&name, 0, 0, 0);
    idle.se.class.store(CLASS_IDLE, Ordering::Relaxed);
    idle.se.cpu_id.store(hart as i32, Ordering::Relaxed);
    idle.se.affinity.store(1 << hart, Ordering::Relaxed);
    idle.se.on_cpu.store(true, Ordering::Relaxed);
    idle.set_state(ThreadState::Running);

    let raw = alloc::boxed::Box::into_raw(idle);
    let rq = rq_of(hart);
    rq.lock.lock();
    unsafe { rq.data().idle.idle_se = &mut (*raw).se };
    rq.set_current_se(unsafe { &mut (*raw).se });
    rq.lock.unlock();
    smp::cpu_local().set_current(raw);
    rq.online.store(true, Ordering::Release);
    log::debug!("hart {}: idle thread installed", hart);
}

/// Entry shim for freshly created threads: the first cswitch into a new
/// context "returns" here.
pub extern "C" fn thread_entry_shim() {
    context_switch_tail();
    let p = smp::current().expect("thread_entry_shim: no current thread");
    if let Some(entry) = p.kentry {
        entry(p.karg[0], p.karg[1]);
        crate::proc::lifecycle::exit(0);
    }
    // User thread: the out-of-scope trampoline resumes user mode from the
    // trapframe; run the return-to-user processing it would perform.
    crate::trap::user_trap_return();
    crate::proc::lifecycle::exit(0);
}

/// Post-switch bookkeeping, run by the thread that was switched TO:
/// restore the thread's interrupt base, release the rq lock taken by the
/// switching path, retire the previous thread, and resolve a wakeup that
/// raced with its descheduling.
pub fn context_switch_tail() {
    let cpu = smp::cpu_local();
    let rq = this_rq();

    if let Some(cur) = smp::current() {
        cpu.intr_base_set(cur.se.saved_intr_base.load(Ordering::Relaxed));
    }
    let prev = cpu.take_switch_prev();
    rq.lock.unlock();

    if !prev.is_null() {
        let prev = unsafe { &*prev };
        prev.se.on_cpu.store(false, Ordering::SeqCst);
        smp_mb();
        if prev.state() == ThreadState::Wakening {
            // A waker saw on_cpu and left the commit to us.
            wakeup_commit(prev);
        }
        if prev.state() == ThreadState::Exiting {
            crate::proc::lifecycle::finish_exit(prev);
        }
    }
}

/// Enqueue pending remote wakeups. Caller holds the rq lock.
fn drain_wake_list(rq: &'static RqPercpu) {
    let mut se_ptr = rq.wake_list_take();
    while !se_ptr.is_null() {
        let se = unsafe { &*se_ptr };
        let next = se.wake_next.load(Ordering::Relaxed);
        se.wake_next.store(core::ptr::null_mut(), Ordering::Relaxed);
        se.cpu_id.store(rq.cpu_id as i32, Ordering::Release);
        class_of(se).enqueue_task(unsafe { rq.data() }, se);
        se.on_rq.store(true, Ordering::Release);
        se_ptr = next;
    }
}

/// Pick the highest-priority ready entity, falling back to idle.
fn pick_next(rq: &'static RqPercpu) -> *mut SchedEntity {
    let data = unsafe { rq.data() };
    if let Some(se) = fifo::FIFO_CLASS.pick_next_task(data) {
        return se;
    }
    idle::IDLE_CLASS
        .pick_next_task(data)
        .expect("no idle thread on this rq")
}

/// Voluntarily give up the CPU.
///
/// Callers either run normally (state RUNNING, gets re-enqueued) or have
/// already set a sleeping state through the wait protocol (stays off the
/// queue). No spinlocks may be held.
pub fn scheduler_yield() {
    let cpu = smp::cpu_local();
    assert_eq!(cpu.spin_depth(), 0, "scheduler_yield: spinlock held");
    assert!(!cpu.in_interrupt(), "scheduler_yield: interrupt context");

    let p = smp::current().expect("scheduler_yield: no current thread");
    let rq = this_rq();

    rq.lock.lock();
    cpu.clear_needs_resched();
    drain_wake_list(rq);

    let cur_se = &p.se;
    let data = unsafe { rq.data() };

    // A wakeup that raced with an in-progress sleep leaves WAKENING;
    // claim it back to RUNNING — the sleep is cancelled.
    let mut state = p.state();
    if state == ThreadState::Wakening {
        p.state_cas(ThreadState::Wakening, ThreadState::Running);
        state = ThreadState::Running;
    }

    let runnable = state == ThreadState::Running;
    if runnable && cur_se.class.load(Ordering::Relaxed) != CLASS_IDLE {
        class_of(cur_se).yield_task(data);
        class_of(cur_se).put_prev_task(data, cur_se);
        cur_se.on_rq.store(true, Ordering::Release);
    }

    let next_ptr = pick_next(rq);
    if core::ptr::eq(next_ptr, cur_se as *const SchedEntity as *mut SchedEntity) {
        // Still the best candidate: undo the requeue and keep running.
        let next = unsafe { &*next_ptr };
        class_of(next).set_next_task(data, next);
        next.on_rq.store(false, Ordering::Release);
        rq.lock.unlock();
        return;
    }

    let next = unsafe { &*next_ptr };
    class_of(next).set_next_task(data, next);
    next.on_rq.store(false, Ordering::Release);
    next.on_cpu.store(true, Ordering::SeqCst);
    next.cpu_id.store(rq.cpu_id as i32, Ordering::Release);
    data.switch_count += 1;

    let now = crate::arch::time();
    cur_se.exec_end.store(now, Ordering::Relaxed);
    next.exec_start.store(now, Ordering::Relaxed);

    rq.set_current_se(next_ptr);
    cpu.set_switch_prev(p as *const Thread as *mut Thread);
    cpu.set_current(next.thread() as *const Thread as *mut Thread);
    cur_se.saved_intr_base.store(cpu.intr_base_get(), Ordering::Relaxed);

    // Passing through the scheduler is a quiescent state for RCU.
    cpu.rcu_timestamp.store(now, Ordering::Release);

    unsafe {
        crate::arch::cswitch(cur_se.context.get(), next.context.get());
    }

    // Back on some hart, possibly a different one.
    context_switch_tail();
}

/// Commit a claimed (WAKENING) wakeup: make the thread RUNNING and put it
/// on a run queue. Exactly one committer wins the CAS; the rest are
/// harmless.
fn wakeup_commit(p: &Thread) {
    if !p.state_cas(ThreadState::Wakening, ThreadState::Running) {
        return;
    }
    let se = &p.se;
    debug_assert!(!se.on_rq.load(Ordering::Acquire), "wakeup_commit: already queued");

    let me = crate::arch::hartid();
    let target = class_of(se).select_task_rq(se, me);

    if target == me {
        let rq = rq_of(target);
        rq.lock.lock();
        se.cpu_id.store(target as i32, Ordering::Release);
        class_of(se).enqueue_task(unsafe { rq.data() }, se);
        se.on_rq.store(true, Ordering::Release);
        rq.lock.unlock();
        smp::cpu_local().set_needs_resched();
    } else {
        rq_of(target).wake_list_push(se);
        crate::smp::ipi::ipi_send_single(target, crate::smp::ipi::IPI_REASON_RESCHEDULE);
    }
}

/// Core wakeup: serialize against other wakers with pi_lock, claim the
/// state with a CAS, and commit unless the target is still on a CPU.
/// `matches` restricts which sleeping states this waker may disturb.
fn wakeup_common(p: &Thread, matches: fn(ThreadState) -> bool) -> bool {
    let se = &p.se;
    se.pi_lock.lock();

    let state = p.state();
    if !matches(state) {
        se.pi_lock.unlock();
        return false;
    }
    if !p.state_cas(state, ThreadState::Wakening) {
        // Lost against a concurrent transition (another waker, or the
        // thread changed its own state); wakeups are idempotent.
        se.pi_lock.unlock();
        return false;
    }

    smp_mb();
    if se.on_cpu.load(Ordering::SeqCst) {
        // Still running toward its cswitch; the target's yield or its
        // hart's context_switch_tail completes the wakeup.
        se.pi_lock.unlock();
        return true;
    }

    wakeup_commit(p);
    se.pi_lock.unlock();
    true
}

/// Wake a thread from any sleeping state.
pub fn scheduler_wakeup(p: &Thread) -> bool {
    wakeup_common(p, ThreadState::is_sleeping)
}

/// Wake only an INTERRUPTIBLE sleeper (signal notification).
pub fn scheduler_wakeup_interruptible(p: &Thread) -> bool {
    wakeup_common(p, |s| s == ThreadState::Interruptible)
}

/// Wake only killable sleepers (SIGKILL delivery).
pub fn scheduler_wakeup_killable(p: &Thread) -> bool {
    wakeup_common(p, ThreadState::is_killable)
}

/// Timer expiry wakeup: applies to timer-class sleeps and leaves the
/// waiter enqueued on its wait queue (it self-detaches on resume).
pub fn scheduler_wakeup_timeout(p: &Thread) -> bool {
    wakeup_common(p, ThreadState::is_timer)
}

/// Resume a STOPPED thread (SIGCONT, or a terminal signal to a stopped
/// thread).
pub fn scheduler_wakeup_stopped(p: &Thread) -> bool {
    wakeup_common(p, |s| s == ThreadState::Stopped)
}

/// Per-hart scheduler tick, from the timer interrupt.
pub fn sched_timer_tick() {
    let rq = this_rq();
    if !rq.online.load(Ordering::Acquire) {
        return;
    }
    rq.lock.lock();
    let cur = rq.current_se();
    if !cur.is_null() {
        let cur = unsafe { &*cur };
        if class_of(cur).task_tick(unsafe { rq.data() }, cur) {
            smp::cpu_local().set_needs_resched();
        }
    }
    rq.lock.unlock();
}

/// The idle loop every hart falls into once initialized. The boot context
/// is the idle thread; anything runnable preempts it at the next tick or
/// wakeup.
pub fn idle_loop() -> ! {
    let cpu = smp::cpu_local();
    loop {
        // Idling is trivially quiescent.
        cpu.rcu_timestamp.store(crate::arch::time(), Ordering::Release);
        if cpu.needs_resched() {
            scheduler_yield();
        }
        crate::arch::wfi();
    }
}

/// Put a freshly created thread on the calling hart's run queue.
pub fn activate_new_thread(p: &Thread) {
    p.set_state(ThreadState::Running);
    let rq = this_rq();
    rq.lock.lock();
    let data = unsafe { rq.data() };
    let se = &p.se;
    class_of(se).task_fork(data, se);
    class_of(se).enqueue_task(data, se);
    se.on_rq.store(true, Ordering::Release);
    se.cpu_id.store(rq.cpu_id as i32, Ordering::Release);
    rq.lock.unlock();
}

/// Priority change with requeue when the thread sits on a queue.
pub fn set_priority(p: &Thread, priority: i32) {
    let se = &p.se;
    let clamped = priority.clamp(0, entity::PRIORITY_LEVELS - 1);
    let cpu = se.cpu();
    let rq = rq_of(cpu);
    rq.lock.lock();
    if se.on_rq.load(Ordering::Acquire) {
        let data = unsafe { rq.data() };
        class_of(se).dequeue_task(data, se);
        se.priority.store(clamped, Ordering::Relaxed);
        class_of(se).enqueue_task(data, se);
    } else {
        se.priority.store(clamped, Ordering::Relaxed);
    }
    rq.lock.unlock();
}

pub use context::Context;
pub use entity::{PRIORITY_DEFAULT, PRIORITY_LEVELS};
