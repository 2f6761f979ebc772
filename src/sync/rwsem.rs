/*
 * Read-write semaphore (sleeping).
 *
 * Reader count plus an optional writer pid, with separate reader and
 * writer wait queues. The priority flag picks who gets woken on release:
 * read-priority drains all readers first, write-priority hands off to the
 * next writer first.
 */

use core::cell::Cell;

use crate::proc::thread::Pid;
use crate::proc::tq::Tq;
use crate::smp;
use crate::sync::RawSpinLock;

pub const RWSEM_PRIO_READ: u64 = 0x0;
pub const RWSEM_PRIO_WRITE: u64 = 0x1;

const NO_HOLDER: Pid = -1;

pub struct RwSem {
    lock: RawSpinLock,
    readers: Cell<i32>,
    holder_pid: Cell<Pid>,
    read_queue: Tq,
    write_queue: Tq,
    flags: u64,
    name: &'static str,
}

unsafe impl Sync for RwSem {}
unsafe impl Send for RwSem {}

impl RwSem {
    pub const fn new(name: &'static str, flags: u64) -> Self {
        RwSem {
            lock: RawSpinLock::new("rwsem_spin"),
            readers: Cell::new(0),
            holder_pid: Cell::new(NO_HOLDER),
            read_queue: Tq::new("rwsem_readers"),
            write_queue: Tq::new("rwsem_writers"),
            flags,
            name,
        }
    }

    pub fn init(&self) {
        self.read_queue.init();
        self.write_queue.init();
    }

    fn reader_should_wait(&self) -> bool {
        if self.readers.get() == 0 && self.holder_pid.get() != NO_HOLDER {
            return true;
        }
        if self.flags & RWSEM_PRIO_WRITE != 0 && !self.write_queue.is_empty() {
            return true;
        }
        false
    }

    fn writer_should_wait(&self, pid: Pid) -> bool {
        if self.holder_pid.get() == pid {
            return false;
        }
        self.holder_pid.get() != NO_HOLDER || self.readers.get() > 0
    }

    fn wake_readers_locked(&self) {
        unsafe { self.read_queue.wakeup_all(0, 0) };
    }

    fn wake_writer_locked(&self) {
        if let Some(next) = unsafe { self.write_queue.wakeup(0, 0) } {
            self.holder_pid.set(next.pid);
        }
    }

    fn release_wake_locked(&self) {
        if self.flags & RWSEM_PRIO_WRITE != 0 {
            if !self.write_queue.is_empty() {
                self.wake_writer_locked();
            } else if !self.read_queue.is_empty() {
                self.wake_readers_locked();
            }
        } else if !self.read_queue.is_empty() {
            self.wake_readers_locked();
        } else if !self.write_queue.is_empty() {
            self.wake_writer_locked();
        }
    }

    fn assert_thread_context(&self, op: &str) {
        let cpu = smp::cpu_local();
        assert!(smp::current().is_some(), "rwsem {}: {} without thread", self.name, op);
        assert_eq!(cpu.spin_depth(), 0, "rwsem {}: {} with spinlock held", self.name, op);
        assert!(!cpu.in_interrupt(), "rwsem {}: {} in interrupt", self.name, op);
    }

    /// Shared acquisition. Returns 0, or a negative errno from an
    /// interrupted wait.
    pub fn acquire_read(&self) -> i64 {
        self.assert_thread_context("acquire_read");
        self.lock.lock();
        while self.reader_should_wait() {
            let (err, _) = self.read_queue.wait(&self.lock);
            if err != 0 {
                self.lock.unlock();
                return err;
            }
        }
        self.readers.set(self.readers.get() + 1);
        self.lock.unlock();
        0
    }

    /// Exclusive acquisition. Returns 0, or a negative errno from an
    /// interrupted wait.
    pub fn acquire_write(&self) -> i64 {
        self.assert_thread_context("acquire_write");
        let pid = smp::current().unwrap().pid;

        self.lock.lock();
        assert!(
            self.holder_pid.get() != pid,
            "rwsem {}: deadlock, writer {} re-acquiring",
            self.name,
            pid
        );
        while self.writer_should_wait(pid) {
            let (err, _) = self.write_queue.wait(&self.lock);
            if err != 0 {
                self.lock.unlock();
                return err;
            }
            // The waker may have installed us as the holder already.
            if self.holder_pid.get() == pid {
                break;
            }
        }
        self.holder_pid.set(pid);
        self.lock.unlock();
        0
    }

    /// Release either side; wakes by priority mode.
    pub fn release(&self) {
        self.lock.lock();
        let pid = smp::current().map(|p| p.pid).unwrap_or(NO_HOLDER);
        if self.holder_pid.get() == pid && pid != NO_HOLDER {
            self.holder_pid.set(NO_HOLDER);
            self.release_wake_locked();
        } else {
            assert!(self.readers.get() > 0, "rwsem {}: no readers to release", self.name);
            self.readers.set(self.readers.get() - 1);
            if self.readers.get() == 0 {
                self.release_wake_locked();
            }
        }
        self.lock.unlock();
    }

    /// Does the calling thread hold the write side?
    pub fn is_write_holding(&self) -> bool {
        let pid = match smp::current() {
            Some(p) => p.pid,
            None => return false,
        };
        self.lock.lock();
        let holding = self.holder_pid.get() == pid;
        self.lock.unlock();
        holding
    }
}
