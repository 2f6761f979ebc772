/*
 * Work queues: named worker pools executing deferred work in thread
 * context.
 *
 * Each queue owns a FIFO of WorkStructs, a pool of worker kthreads
 * parked on an idle queue, and a manager kthread that grows the pool
 * (up to max_active) when work outruns the idle workers and trims it
 * (down to min_active) when they sit unused. Submission wakes an idle
 * worker when one exists, otherwise the manager.
 */

use alloc::boxed::Box;
use core::cell::UnsafeCell;
use core::sync::atomic::Ordering;

use crate::collections::list::{self, ListNode};
use crate::proc::clone::kthread_create;
use crate::proc::thread::ThreadState;
use crate::proc::tq::Tq;
use crate::sync::RawSpinLock;

pub const WORKQUEUE_NAME_MAX: usize = 31;

/// One unit of deferred work, embedded in its owner.
pub struct WorkStruct {
    entry: ListNode,
    func: fn(usize),
    arg: usize,
}

impl WorkStruct {
    pub fn new(func: fn(usize), arg: usize) -> Self {
        WorkStruct {
            entry: ListNode::new(),
            func,
            arg,
        }
    }
}

struct WqInner {
    work_list: ListNode,
    pending_works: i32,
    nr_workers: i32,
    nr_idle: i32,
    /// Workers past min_active that should retire.
    surplus: i32,
    active: bool,
}

pub struct WorkQueue {
    lock: RawSpinLock,
    inner: UnsafeCell<WqInner>,
    /// Workers with nothing to do park here.
    idle_queue: Tq,
    /// The manager parks here between pool adjustments.
    manager_queue: Tq,
    name: heapless::String<{ WORKQUEUE_NAME_MAX + 1 }>,
    min_active: i32,
    max_active: i32,
}

unsafe impl Sync for WorkQueue {}
unsafe impl Send for WorkQueue {}

impl WorkQueue {
    /// Create a queue and start its manager plus min_active workers.
    pub fn create(name: &str, min_active: i32, max_active: i32) -> Result<&'static WorkQueue, i64> {
        assert!(min_active >= 1 && max_active >= min_active);
        let mut qname = heapless::String::new();
        let _ = qname.push_str(&name[..name.len().min(WORKQUEUE_NAME_MAX)]);

        let wq = Box::leak(Box::new(WorkQueue {
            lock: RawSpinLock::new("workqueue"),
            inner: UnsafeCell::new(WqInner {
                work_list: ListNode::new(),
                pending_works: 0,
                nr_workers: 0,
                nr_idle: 0,
                surplus: 0,
                active: true,
            }),
            idle_queue: Tq::new("wq_idle"),
            manager_queue: Tq::new("wq_manager"),
            name: qname,
            min_active,
            max_active,
        }));
        unsafe { list::init(&mut (*wq.inner.get()).work_list) };
        wq.idle_queue.init();
        wq.manager_queue.init();

        for _ in 0..min_active {
            wq.spawn_worker()?;
        }
        kthread_create("wq_manager", wq_manager_entry, wq as *const WorkQueue as usize, 0)?;
        log::info!(
            "workqueue '{}': {}..{} workers",
            wq.name.as_str(),
            min_active,
            max_active
        );
        Ok(wq)
    }

    fn spawn_worker(&'static self) -> Result<(), i64> {
        kthread_create(
            self.name.as_str(),
            wq_worker_entry,
            self as *const WorkQueue as usize,
            0,
        )?;
        self.lock.lock();
        unsafe { (*self.inner.get()).nr_workers += 1 };
        self.lock.unlock();
        Ok(())
    }

    /// Submit work. The WorkStruct must stay pinned until its function
    /// has run.
    ///
    /// # Safety
    /// `work` is pinned and not currently queued.
    pub unsafe fn queue_work(&self, work: *mut WorkStruct) -> bool {
        self.lock.lock();
        let inner = &mut *self.inner.get();
        if !inner.active {
            self.lock.unlock();
            return false;
        }
        list::init(&mut (*work).entry);
        list::push_back(&mut inner.work_list, &mut (*work).entry);
        inner.pending_works += 1;

        if inner.nr_idle > 0 {
            self.idle_queue.wakeup(0, 0);
        } else {
            // No idle hands: let the manager consider growing the pool.
            self.manager_queue.wakeup(0, 0);
        }
        self.lock.unlock();
        true
    }

    /// Stop accepting work and retire the pool. Pending work still runs.
    pub fn destroy(&self) {
        self.lock.lock();
        unsafe {
            (*self.inner.get()).active = false;
            self.idle_queue.wakeup_all(0, 0);
            self.manager_queue.wakeup_all(0, 0);
        }
        self.lock.unlock();
    }

    pub fn pending(&self) -> i32 {
        self.lock.lock();
        let n = unsafe { (*self.inner.get()).pending_works };
        self.lock.unlock();
        n
    }
}

lazy_static::lazy_static! {
    /// Shared default pool for kernel-internal deferred work.
    static ref SYSTEM_WQ: &'static WorkQueue =
        WorkQueue::create("events", 2, 8).expect("system workqueue");
}

/// The default work queue. First use creates it; callers must be in
/// thread context with the scheduler running.
pub fn system_wq() -> &'static WorkQueue {
    *SYSTEM_WQ
}

/// Submit work to the default pool.
///
/// # Safety
/// Same contract as WorkQueue::queue_work.
pub unsafe fn schedule_work(work: *mut WorkStruct) -> bool {
    system_wq().queue_work(work)
}

fn wq_worker_entry(wq_ptr: usize, _unused: usize) {
    let wq = unsafe { &*(wq_ptr as *const WorkQueue) };
    if let Some(me) = crate::smp::current() {
        me.wq
            .store(wq_ptr as *mut WorkQueue, core::sync::atomic::Ordering::Release);
    }
    loop {
        wq.lock.lock();
        let inner = unsafe { &mut *wq.inner.get() };

        if inner.surplus > 0 && inner.pending_works == 0 {
            // Trimmed by the manager.
            inner.surplus -= 1;
            inner.nr_workers -= 1;
            wq.lock.unlock();
            break;
        }

        let work = unsafe { list::pop(&mut inner.work_list) };
        if work.is_null() {
            if !inner.active {
                inner.nr_workers -= 1;
                wq.lock.unlock();
                break;
            }
            inner.nr_idle += 1;
            let _ = wq
                .idle_queue
                .wait_in_state(&wq.lock, ThreadState::Uninterruptible);
            inner.nr_idle -= 1;
            wq.lock.unlock();
            continue;
        }

        inner.pending_works -= 1;
        let work = unsafe { &mut *container_of!(work, WorkStruct, entry) };
        let (func, arg) = (work.func, work.arg);
        wq.lock.unlock();

        func(arg);
    }
    log::debug!("workqueue '{}': worker retiring", wq.name.as_str());
}

fn wq_manager_entry(wq_ptr: usize, _unused: usize) {
    let wq = unsafe { &*(wq_ptr as *const WorkQueue) };
    loop {
        wq.lock.lock();
        let inner = unsafe { &mut *wq.inner.get() };
        if !inner.active {
            wq.lock.unlock();
            break;
        }

        let want_more = inner.pending_works > inner.nr_idle && inner.nr_workers < wq.max_active;
        let want_fewer =
            inner.pending_works == 0 && inner.nr_idle > 0 && inner.nr_workers > wq.min_active;
        if want_fewer {
            inner.surplus += 1;
            unsafe { wq.idle_queue.wakeup(0, 0) };
        }

        if want_more {
            wq.lock.unlock();
            let wq_static: &'static WorkQueue = unsafe { &*(wq_ptr as *const WorkQueue) };
            if wq_static.spawn_worker().is_err() {
                log::warn!("workqueue '{}': worker spawn failed", wq.name.as_str());
            }
            // Re-evaluate immediately; the backlog may want more hands.
            continue;
        }

        let _ = wq
            .manager_queue
            .wait_in_state(&wq.lock, ThreadState::Uninterruptible);
        wq.lock.unlock();
    }
    log::debug!("workqueue '{}': manager retiring", wq.name.as_str());
}
