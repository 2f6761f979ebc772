/*
 * Scheduling-class interface.
 *
 * A class owns placement and selection policy; the core (sched/mod.rs)
 * owns the state machine around it. on_rq/on_cpu are managed outside the
 * class, by the core.
 *
 * Task switch flow:
 *
 *   pick_next_task(rq)      select the next entity, leave it queued
 *   set_next_task(rq, se)   remove it from the queue, it becomes current
 *        ~~~ context switch ~~~
 *   put_prev_task(rq, se)   re-insert the previous entity if still
 *                           runnable
 *
 * All methods are called with the rq lock held.
 */

use crate::sched::entity::{SchedEntity, CLASS_FIFO, CLASS_IDLE};
use crate::sched::rq::RqData;
use core::sync::atomic::Ordering;

pub trait SchedClass: Sync {
    /// Add an entity to the ready structures.
    fn enqueue_task(&self, rq: &mut RqData, se: &SchedEntity);

    /// Remove an entity from the ready structures.
    fn dequeue_task(&self, rq: &mut RqData, se: &SchedEntity);

    /// Choose the CPU a waking entity should run on, honoring affinity.
    /// `waker_cpu` is the hart performing the wakeup.
    fn select_task_rq(&self, se: &SchedEntity, waker_cpu: usize) -> usize;

    /// Select the next entity to run, keeping it in the queue.
    /// None means this class has nothing ready.
    fn pick_next_task(&self, rq: &mut RqData) -> Option<*mut SchedEntity>;

    /// Remove `se` from the queue and account it as current.
    fn set_next_task(&self, rq: &mut RqData, se: &SchedEntity);

    /// Re-insert the previously running entity.
    fn put_prev_task(&self, rq: &mut RqData, se: &SchedEntity);

    /// Timer tick for the running entity. Returns true when the slice is
    /// used up and the core should reschedule.
    fn task_tick(&self, rq: &mut RqData, se: &SchedEntity) -> bool;

    /// A fresh entity enters the scheduler (clone/kthread_create).
    fn task_fork(&self, rq: &mut RqData, se: &SchedEntity);

    /// The entity will never run again.
    fn task_dead(&self, rq: &mut RqData, se: &SchedEntity);

    /// The running entity voluntarily yields.
    fn yield_task(&self, rq: &mut RqData);

    fn name(&self) -> &'static str;
}

/// Resolve an entity's class id to its implementation.
pub fn class_of(se: &SchedEntity) -> &'static dyn SchedClass {
    match se.class.load(Ordering::Relaxed) {
        CLASS_FIFO => &super::fifo::FIFO_CLASS,
        CLASS_IDLE => &super::idle::IDLE_CLASS,
        other => panic!("unknown sched class {}", other),
    }
}
