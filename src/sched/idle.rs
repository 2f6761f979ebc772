/*
 * Idle scheduling class.
 *
 * One idle thread per hart, picked only when every FIFO level is empty.
 * The idle entity is never enqueued anywhere; its "queue" is the
 * per-CPU idle slot.
 */

use crate::sched::class::SchedClass;
use crate::sched::entity::SchedEntity;
use crate::sched::rq::RqData;

pub struct IdleClass;

pub static IDLE_CLASS: IdleClass = IdleClass;

impl SchedClass for IdleClass {
    fn enqueue_task(&self, _rq: &mut RqData, _se: &SchedEntity) {}

    fn dequeue_task(&self, _rq: &mut RqData, _se: &SchedEntity) {}

    fn select_task_rq(&self, se: &SchedEntity, _waker_cpu: usize) -> usize {
        // Idle threads are pinned to their hart.
        se.cpu()
    }

    fn pick_next_task(&self, rq: &mut RqData) -> Option<*mut SchedEntity> {
        if rq.idle.idle_se.is_null() {
            None
        } else {
            Some(rq.idle.idle_se)
        }
    }

    fn set_next_task(&self, rq: &mut RqData, _se: &SchedEntity) {
        rq.slice_remaining = 1;
    }

    fn put_prev_task(&self, _rq: &mut RqData, _se: &SchedEntity) {}

    fn task_tick(&self, _rq: &mut RqData, _se: &SchedEntity) -> bool {
        // Anything becoming ready should preempt idle at the next tick.
        true
    }

    fn task_fork(&self, _rq: &mut RqData, _se: &SchedEntity) {}

    fn task_dead(&self, _rq: &mut RqData, _se: &SchedEntity) {
        panic!("idle thread exited");
    }

    fn yield_task(&self, _rq: &mut RqData) {}

    fn name(&self) -> &'static str {
        "idle"
    }
}
