/*
 * FIFO scheduling class.
 *
 * 64 major priority levels, each with 4 minor sublevels; within a
 * sublevel, strict FIFO order. A fixed slice keeps same-priority threads
 * rotating under timer ticks even though the kernel never preempts
 * mid-instruction.
 */

use crate::collections::list;
use crate::sched::class::SchedClass;
use crate::sched::entity::SchedEntity;
use crate::sched::rq::RqData;

/// Ticks per slice before task_tick requests a reschedule.
const FIFO_SLICE_TICKS: u32 = 10;

pub struct FifoClass;

pub static FIFO_CLASS: FifoClass = FifoClass;

impl SchedClass for FifoClass {
    fn enqueue_task(&self, rq: &mut RqData, se: &SchedEntity) {
        let major = se.major();
        let minor = se.minor();
        let level = &mut rq.fifo[major];
        unsafe {
            list::push_back(&mut level.subqueues[minor], se.node.get());
        }
        level.counts[minor] += 1;
        level.task_count += 1;
        level.ready_mask |= 1 << minor;
        rq.task_count += 1;
        rq.mark_major_ready(major);
    }

    fn dequeue_task(&self, rq: &mut RqData, se: &SchedEntity) {
        let major = se.major();
        let minor = se.minor();
        let level = &mut rq.fifo[major];
        assert!(level.counts[minor] > 0, "fifo rq: sublevel underflow");
        unsafe {
            list::detach(se.node.get());
        }
        level.counts[minor] -= 1;
        level.task_count -= 1;
        rq.task_count -= 1;
        if level.counts[minor] == 0 {
            level.ready_mask &= !(1 << minor);
        }
        if level.ready_mask == 0 {
            rq.mark_major_idle(major);
        }
    }

    fn select_task_rq(&self, se: &SchedEntity, waker_cpu: usize) -> usize {
        // Cache affinity first: stay where the thread last ran, then try
        // the waking hart, then the lowest allowed hart.
        let last = se.cpu();
        if last < crate::smp::NCPU && se.allows_cpu(last) && super::rq::rq_of(last).online.load(core::sync::atomic::Ordering::Acquire) {
            return last;
        }
        if se.allows_cpu(waker_cpu) {
            return waker_cpu;
        }
        for cpu in 0..crate::online_cpus() {
            if se.allows_cpu(cpu) {
                return cpu;
            }
        }
        waker_cpu
    }

    fn pick_next_task(&self, rq: &mut RqData) -> Option<*mut SchedEntity> {
        let major = rq.highest_ready()?;
        let level = &mut rq.fifo[major];
        debug_assert!(level.ready_mask != 0);
        let minor = level.ready_mask.trailing_zeros() as usize;
        let node = unsafe { list::first(&level.subqueues[minor]) };
        debug_assert!(!node.is_null(), "ready sublevel with empty queue");
        Some(unsafe { container_of!(node, SchedEntity, node) })
    }

    fn set_next_task(&self, rq: &mut RqData, se: &SchedEntity) {
        self.dequeue_task(rq, se);
        rq.slice_remaining = FIFO_SLICE_TICKS;
    }

    fn put_prev_task(&self, rq: &mut RqData, se: &SchedEntity) {
        self.enqueue_task(rq, se);
    }

    fn task_tick(&self, rq: &mut RqData, _se: &SchedEntity) -> bool {
        if rq.slice_remaining > 0 {
            rq.slice_remaining -= 1;
        }
        rq.slice_remaining == 0
    }

    fn task_fork(&self, _rq: &mut RqData, _se: &SchedEntity) {}

    fn task_dead(&self, _rq: &mut RqData, _se: &SchedEntity) {}

    fn yield_task(&self, _rq: &mut RqData) {
        // Requeue order is handled by put_prev_task; a FIFO yield simply
        // goes to the tail of its sublevel.
    }

    fn name(&self) -> &'static str {
        "fifo"
    }
}
