/*
 * Thread queues: the wait-queue primitive under every blocking subsystem.
 *
 * Two variants share the TNode entry type: Tq is a FIFO list, TTree a
 * red-black tree keyed by a u64 (wakeup order follows the key, ties broken
 * by node address). Waiter nodes live on the sleeping thread's stack — no
 * allocation on the sleep path.
 *
 * Wait protocol (wait_in_state_cb):
 *   1. interrupts off (raw save; the caller's spinlock is the only one
 *      that may be held, and the sleep callback releases it)
 *   2. set the calling thread's state
 *   3. enqueue a stack TNode with error_no preset to -EINTR
 *   4. run the sleep callback (releases the caller's lock); its status is
 *      forwarded to the wakeup callback
 *   5. scheduler_yield()
 *   6. on resume, run the wakeup callback (re-acquires the lock)
 *   7. self-detach if still enqueued — the asynchronous wakeup paths
 *      (signal, timeout) wake the thread but leave the node queued
 *   8. restore interrupts; return (error_no, data)
 *
 * A waker that goes through the queue APIs (tq_wakeup & friends) detaches
 * the node itself and overwrites error_no (normally with 0), so the waiter
 * can tell a normal handoff (0) from an interruption (-EINTR).
 *
 * Locking: every queue is guarded by a caller-supplied spinlock; the
 * unsafe fns require it held. The wait functions take that lock's
 * reference explicitly (or custom callbacks doing the equivalent).
 */

use core::cell::{Cell, UnsafeCell};
use core::cmp::Ordering as CmpOrdering;
use core::ptr;

use crate::collections::list::{self, ListNode};
use crate::collections::rbtree::{self, RbNode, RbRoot};
use crate::errno::{EINTR, ENOTEMPTY};
use crate::proc::thread::{Thread, ThreadState, FLAG_ONCHAN};
use crate::sched;
use crate::smp;
use crate::sync::RawSpinLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TNodeKind {
    None,
    List,
    Tree,
}

/// Wait-queue entry, embedded on the waiter's stack.
pub struct TNode {
    kind: TNodeKind,
    list_entry: ListNode,
    tree_entry: RbNode,
    tree_key: u64,
    queue: *mut Tq,
    tree: *mut TTree,
    /// 0: woken by the queue leader; -EINTR: woken asynchronously;
    /// anything else: set by the waker.
    pub error_no: i64,
    /// Value passed by the waker.
    pub data: u64,
    pub thread: *mut Thread,
}

impl TNode {
    /// Node for the calling thread. Must run in thread context.
    pub fn new_current() -> TNode {
        TNode {
            kind: TNodeKind::None,
            list_entry: ListNode::new(),
            tree_entry: RbNode::new(),
            tree_key: 0,
            queue: ptr::null_mut(),
            tree: ptr::null_mut(),
            error_no: 0,
            data: 0,
            thread: smp::current_raw(),
        }
    }

    pub fn enqueued(&self) -> bool {
        match self.kind {
            TNodeKind::None => false,
            TNodeKind::List => !self.queue.is_null(),
            TNodeKind::Tree => !self.tree.is_null(),
        }
    }

    pub fn thread(&self) -> &Thread {
        unsafe { &*self.thread }
    }
}

/// TTree ordering: key, then node address.
unsafe fn tnode_cmp(a: *const RbNode, b: *const RbNode) -> CmpOrdering {
    let na = container_of!(a as *mut RbNode, TNode, tree_entry);
    let nb = container_of!(b as *mut RbNode, TNode, tree_entry);
    match (*na).tree_key.cmp(&(*nb).tree_key) {
        CmpOrdering::Equal => (a as usize).cmp(&(b as usize)),
        other => other,
    }
}

/// Lookup ordering for "first node with key k": the probe sorts below
/// every real node of equal key.
unsafe fn tnode_probe_cmp(a: *const RbNode, b: *const RbNode) -> CmpOrdering {
    let na = container_of!(a as *mut RbNode, TNode, tree_entry);
    let nb = container_of!(b as *mut RbNode, TNode, tree_entry);
    match (*na).tree_key.cmp(&(*nb).tree_key) {
        CmpOrdering::Equal => CmpOrdering::Less,
        other => other,
    }
}

/// FIFO thread queue.
pub struct Tq {
    head: UnsafeCell<ListNode>,
    counter: Cell<i32>,
    name: &'static str,
}

unsafe impl Sync for Tq {}
unsafe impl Send for Tq {}

impl Tq {
    pub const fn new(name: &'static str) -> Self {
        Tq {
            head: UnsafeCell::new(ListNode::new()),
            counter: Cell::new(0),
            name,
        }
    }

    /// Self-link the head. Once, before first use.
    pub fn init(&self) {
        unsafe { list::init(self.head.get()) };
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> i32 {
        self.counter.get()
    }

    pub fn is_empty(&self) -> bool {
        self.counter.get() == 0
    }

    /// Append a waiter.
    ///
    /// # Safety
    /// Caller holds the queue's guarding lock; `node` is pinned and not
    /// enqueued anywhere.
    pub unsafe fn push(&self, node: *mut TNode) {
        assert!(!(*node).enqueued(), "tq {}: node already enqueued", self.name);
        (*node).kind = TNodeKind::List;
        list::init(&mut (*node).list_entry);
        list::push_back(self.head.get(), &mut (*node).list_entry);
        (*node).queue = self as *const Tq as *mut Tq;
        self.counter.set(self.counter.get() + 1);
    }

    /// Head of the queue without removing it, or null.
    ///
    /// # Safety
    /// Caller holds the queue's guarding lock.
    pub unsafe fn first(&self) -> *mut TNode {
        let node = list::first(self.head.get());
        if node.is_null() {
            ptr::null_mut()
        } else {
            container_of!(node, TNode, list_entry)
        }
    }

    /// Detach a specific waiter.
    ///
    /// # Safety
    /// Caller holds the queue's guarding lock; `node` is enqueued here.
    pub unsafe fn remove(&self, node: *mut TNode) {
        assert!(
            (*node).queue == self as *const Tq as *mut Tq,
            "tq {}: node in different queue",
            self.name
        );
        assert!(self.counter.get() > 0, "tq {}: counter underflow", self.name);
        list::detach(&mut (*node).list_entry);
        (*node).kind = TNodeKind::None;
        (*node).queue = ptr::null_mut();
        self.counter.set(self.counter.get() - 1);
    }

    /// Pop the head, or null.
    ///
    /// # Safety
    /// Caller holds the queue's guarding lock.
    pub unsafe fn pop(&self) -> *mut TNode {
        let node = self.first();
        if !node.is_null() {
            self.remove(node);
        }
        node
    }

    /// Move every waiter to `self`, which must be empty. O(1) for the
    /// links; O(n) to retarget the queue back-pointers.
    ///
    /// # Safety
    /// Caller holds both queues' guarding locks (or exclusive access).
    pub unsafe fn bulk_move_from(&self, from: &Tq) -> Result<(), i64> {
        assert!(!core::ptr::eq(self, from), "tq bulk move onto itself");
        if self.counter.get() != 0 {
            return Err(ENOTEMPTY);
        }
        if from.counter.get() == 0 {
            return Ok(());
        }
        self.counter.set(from.counter.get());
        from.counter.set(0);
        let tail = (*self.head.get()).prev;
        list::insert_bulk(tail, from.head.get());
        for entry in list::iter(self.head.get()) {
            let node = container_of!(entry, TNode, list_entry);
            (*node).queue = self as *const Tq as *mut Tq;
        }
        Ok(())
    }

    /// Pop the first waiter and wake its thread, delivering `error_no`
    /// and `data` through the node.
    ///
    /// # Safety
    /// Caller holds the queue's guarding lock.
    pub unsafe fn wakeup(&self, error_no: i64, data: u64) -> Option<&'static Thread> {
        let node = self.pop();
        if node.is_null() {
            return None;
        }
        Some(do_wakeup(node, error_no, data))
    }

    /// Drain the queue, waking everyone. Returns the number woken.
    ///
    /// # Safety
    /// Caller holds the queue's guarding lock.
    pub unsafe fn wakeup_all(&self, error_no: i64, data: u64) -> usize {
        let mut woken = 0;
        while self.wakeup(error_no, data).is_some() {
            woken += 1;
        }
        assert!(self.counter.get() == 0, "tq {}: drain left waiters", self.name);
        woken
    }

    /// Core wait: see the protocol in the module header.
    pub fn wait_in_state_cb<S, W>(&self, sleep_cb: S, wake_cb: W, state: ThreadState) -> (i64, u64)
    where
        S: FnOnce() -> i32,
        W: FnOnce(i32),
    {
        assert!(state.is_sleeping(), "tq wait: not a sleeping state");
        let cpu = smp::cpu_local();
        assert!(!cpu.in_interrupt(), "tq wait in interrupt context");

        let was_enabled = crate::arch::intr_get();
        crate::arch::intr_off();

        let p = smp::current().expect("tq wait outside thread context");
        p.set_state(state);

        let mut waiter = TNode::new_current();
        waiter.error_no = -EINTR;
        unsafe { self.push(&mut waiter) };

        let status = sleep_cb();
        sched::scheduler_yield();
        wake_cb(status);

        if waiter.enqueued() {
            // Asynchronous wakeup (signal or timeout): the waker left the
            // node queued; detach it under the re-acquired lock.
            unsafe { self.remove(&mut waiter) };
        }
        if was_enabled {
            crate::arch::intr_on();
        }
        (waiter.error_no, waiter.data)
    }

    /// Wait with the default spinlock callbacks: release `lock` before
    /// yielding, re-acquire on wakeup.
    pub fn wait_in_state(&self, lock: &RawSpinLock, state: ThreadState) -> (i64, u64) {
        self.wait_in_state_cb(
            || {
                lock.unlock();
                1
            },
            |status| {
                if status != 0 {
                    lock.lock();
                }
            },
            state,
        )
    }

    /// Uninterruptible wait with the default spinlock callbacks.
    pub fn wait(&self, lock: &RawSpinLock) -> (i64, u64) {
        self.wait_in_state(lock, ThreadState::Uninterruptible)
    }
}

/// Deliver error/data through a detached node and wake its thread.
unsafe fn do_wakeup(node: *mut TNode, error_no: i64, data: u64) -> &'static Thread {
    (*node).error_no = error_no;
    (*node).data = data;
    let t = &*(*node).thread;
    sched::scheduler_wakeup(t);
    t
}

/// Keyed thread queue over a red-black tree.
pub struct TTree {
    root: UnsafeCell<RbRoot>,
    counter: Cell<i32>,
    name: &'static str,
}

unsafe impl Sync for TTree {}
unsafe impl Send for TTree {}

impl TTree {
    pub const fn new(name: &'static str) -> Self {
        TTree {
            root: UnsafeCell::new(RbRoot::new(tnode_cmp)),
            counter: Cell::new(0),
            name,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> i32 {
        self.counter.get()
    }

    pub fn is_empty(&self) -> bool {
        self.counter.get() == 0
    }

    /// Insert a waiter keyed by `node.tree_key`.
    ///
    /// # Safety
    /// Caller holds the tree's guarding lock; `node` is pinned and not
    /// enqueued anywhere.
    pub unsafe fn add(&self, node: *mut TNode) {
        assert!(!(*node).enqueued(), "ttree {}: node already enqueued", self.name);
        (*node).kind = TNodeKind::Tree;
        rbtree::insert(&mut *self.root.get(), &mut (*node).tree_entry);
        (*node).tree = self as *const TTree as *mut TTree;
        self.counter.set(self.counter.get() + 1);
    }

    /// Minimum-key waiter, or null.
    ///
    /// # Safety
    /// Caller holds the tree's guarding lock.
    pub unsafe fn first(&self) -> *mut TNode {
        let node = rbtree::first(&*self.root.get());
        if node.is_null() {
            ptr::null_mut()
        } else {
            container_of!(node, TNode, tree_entry)
        }
    }

    /// Minimum key present.
    ///
    /// # Safety
    /// Caller holds the tree's guarding lock.
    pub unsafe fn key_min(&self) -> Option<u64> {
        let node = self.first();
        if node.is_null() {
            None
        } else {
            Some((*node).tree_key)
        }
    }

    /// Detach a specific waiter.
    ///
    /// # Safety
    /// Caller holds the tree's guarding lock; `node` is in this tree.
    pub unsafe fn remove(&self, node: *mut TNode) {
        assert!(
            (*node).kind == TNodeKind::Tree && (*node).tree == self as *const TTree as *mut TTree,
            "ttree {}: node not in this tree",
            self.name
        );
        assert!(self.counter.get() > 0, "ttree {}: counter underflow", self.name);
        rbtree::delete(&mut *self.root.get(), &mut (*node).tree_entry);
        (*node).kind = TNodeKind::None;
        (*node).tree = ptr::null_mut();
        self.counter.set(self.counter.get() - 1);
    }

    /// Lowest-address waiter with exactly `key`, or null.
    ///
    /// # Safety
    /// Caller holds the tree's guarding lock.
    pub unsafe fn find_first_key(&self, key: u64) -> *mut TNode {
        let probe = TNode {
            kind: TNodeKind::None,
            list_entry: ListNode::new(),
            tree_entry: RbNode::new(),
            tree_key: key,
            queue: ptr::null_mut(),
            tree: ptr::null_mut(),
            error_no: 0,
            data: 0,
            thread: ptr::null_mut(),
        };
        let hit = rbtree::find_round_up(&*self.root.get(), &probe.tree_entry, tnode_probe_cmp);
        if hit.is_null() {
            return ptr::null_mut();
        }
        let node = container_of!(hit, TNode, tree_entry);
        if (*node).tree_key == key {
            node
        } else {
            ptr::null_mut()
        }
    }

    /// Wake the first waiter with exactly `key`.
    ///
    /// # Safety
    /// Caller holds the tree's guarding lock.
    pub unsafe fn wakeup_one(&self, key: u64, error_no: i64, data: u64) -> Option<&'static Thread> {
        let node = self.find_first_key(key);
        if node.is_null() {
            return None;
        }
        self.remove(node);
        Some(do_wakeup(node, error_no, data))
    }

    /// Wake every waiter with exactly `key`. Returns the number woken.
    ///
    /// # Safety
    /// Caller holds the tree's guarding lock.
    pub unsafe fn wakeup_key(&self, key: u64, error_no: i64, data: u64) -> usize {
        let mut woken = 0;
        while self.wakeup_one(key, error_no, data).is_some() {
            woken += 1;
        }
        woken
    }

    /// Drain the tree in key order, waking everyone.
    ///
    /// # Safety
    /// Caller holds the tree's guarding lock.
    pub unsafe fn wakeup_all(&self, error_no: i64, data: u64) -> usize {
        let mut woken = 0;
        loop {
            let node = self.first();
            if node.is_null() {
                break;
            }
            self.remove(node);
            do_wakeup(node, error_no, data);
            woken += 1;
        }
        woken
    }

    /// Keyed wait; identical protocol to Tq::wait_in_state_cb.
    pub fn wait_in_state_cb<S, W>(
        &self,
        key: u64,
        sleep_cb: S,
        wake_cb: W,
        state: ThreadState,
    ) -> (i64, u64)
    where
        S: FnOnce() -> i32,
        W: FnOnce(i32),
    {
        assert!(state.is_sleeping(), "ttree wait: not a sleeping state");
        let cpu = smp::cpu_local();
        assert!(!cpu.in_interrupt(), "ttree wait in interrupt context");

        let was_enabled = crate::arch::intr_get();
        crate::arch::intr_off();

        let p = smp::current().expect("ttree wait outside thread context");
        p.set_state(state);

        let mut waiter = TNode::new_current();
        waiter.error_no = -EINTR;
        waiter.tree_key = key;
        unsafe { self.add(&mut waiter) };

        let status = sleep_cb();
        sched::scheduler_yield();
        wake_cb(status);

        if waiter.enqueued() {
            unsafe { self.remove(&mut waiter) };
        }
        if was_enabled {
            crate::arch::intr_on();
        }
        (waiter.error_no, waiter.data)
    }

    pub fn wait_in_state(&self, key: u64, lock: &RawSpinLock, state: ThreadState) -> (i64, u64) {
        self.wait_in_state_cb(
            key,
            || {
                lock.unlock();
                1
            },
            |status| {
                if status != 0 {
                    lock.lock();
                }
            },
            state,
        )
    }

    pub fn wait(&self, key: u64, lock: &RawSpinLock) -> (i64, u64) {
        self.wait_in_state(key, lock, ThreadState::Uninterruptible)
    }
}

// ───── Channel sleep (xv6-style sleep/wakeup on an address) ─────

const CHAN_BUCKETS: usize = 64;

struct ChanBucket {
    lock: RawSpinLock,
    queue: Tq,
}

static CHAN_TABLE: [ChanBucket; CHAN_BUCKETS] = {
    const SLOT: ChanBucket = ChanBucket {
        lock: RawSpinLock::new("chan_lock"),
        queue: Tq::new("chan_queue"),
    };
    [SLOT; CHAN_BUCKETS]
};

fn chan_bucket(chan: usize) -> &'static ChanBucket {
    // Drop the alignment bits before hashing.
    &CHAN_TABLE[(chan >> 4) % CHAN_BUCKETS]
}

pub fn chan_table_init() {
    for bucket in CHAN_TABLE.iter() {
        bucket.queue.init();
    }
}

/// Sleep on a channel, releasing `outer` first (re-acquired on return).
/// Interruptible; returns 0 or -EINTR.
pub fn sleep_on_chan(chan: usize, outer: &RawSpinLock) -> i64 {
    let bucket = chan_bucket(chan);
    let p = smp::current().expect("sleep_on_chan outside thread context");

    bucket.lock.lock();
    p.chan.store(chan, core::sync::atomic::Ordering::Release);
    p.set_flag(FLAG_ONCHAN);
    outer.unlock();

    let (err, _) = bucket.queue.wait_in_state(&bucket.lock, ThreadState::Interruptible);

    p.clear_flag(FLAG_ONCHAN);
    p.chan.store(0, core::sync::atomic::Ordering::Release);
    bucket.lock.unlock();
    outer.lock();
    err
}

/// Wake every thread sleeping on `chan`.
pub fn wakeup_on_chan(chan: usize) {
    let bucket = chan_bucket(chan);
    bucket.lock.lock();
    unsafe {
        let mut node = bucket.queue.first();
        while !node.is_null() {
            // Capture the successor before a removal.
            let next_entry = (*node).list_entry.next;
            if (*node).thread().chan.load(core::sync::atomic::Ordering::Acquire) == chan {
                bucket.queue.remove(node);
                do_wakeup(node, 0, 0);
            }
            if next_entry == bucket.queue.head.get() {
                break;
            }
            node = container_of!(next_entry, TNode, list_entry);
        }
    }
    bucket.lock.unlock();
}
