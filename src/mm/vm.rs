/*
 * Address-space contract object.
 *
 * The real VM layer (page tables, VMAs, demand paging) is an external
 * collaborator; the core consumes only this surface: user-pointer copies
 * with bounds checks, heap growth for sbrk, and stack growth for the
 * signal-frame push. The kernel runs identity-mapped, so a validated user
 * address is directly accessible.
 */

use crate::errno::{EFAULT, ENOMEM};
use crate::sync::SpinLock;

/// Upper bound on a user heap (pages worth of bytes).
const MAX_HEAP_BYTES: u64 = 1 << 24;

struct VmInner {
    heap_start: u64,
    heap_size: u64,
    stack_low: u64,
    stack_high: u64,
    stack_limit_low: u64,
}

/// One address space; shared between threads via Arc when cloned with
/// CLONE_VM.
pub struct Vm {
    inner: SpinLock<VmInner>,
}

impl Vm {
    pub fn new(heap_start: u64, stack_low: u64, stack_high: u64, stack_limit_low: u64) -> Self {
        Vm {
            inner: SpinLock::new(
                "vm",
                VmInner {
                    heap_start,
                    heap_size: 0,
                    stack_low,
                    stack_high,
                    stack_limit_low,
                },
            ),
        }
    }

    /// A kernel-thread address space: no user ranges at all.
    pub fn new_kernel() -> Self {
        Vm::new(0, 0, 0, 0)
    }

    /// Fork-style duplicate: same ranges, independent bookkeeping. The
    /// page-content copy is the external VM layer's job.
    pub fn duplicate(&self) -> Vm {
        let inner = self.inner.lock();
        Vm {
            inner: SpinLock::new(
                "vm",
                VmInner {
                    heap_start: inner.heap_start,
                    heap_size: inner.heap_size,
                    stack_low: inner.stack_low,
                    stack_high: inner.stack_high,
                    stack_limit_low: inner.stack_limit_low,
                },
            ),
        }
    }

    /// Current heap break.
    pub fn heap_break(&self) -> u64 {
        let inner = self.inner.lock();
        inner.heap_start + inner.heap_size
    }

    /// Grow (or shrink) the heap; returns the old break.
    pub fn grow_heap(&self, delta: i64) -> Result<u64, i64> {
        let mut inner = self.inner.lock();
        let old = inner.heap_start + inner.heap_size;
        let new_size = inner.heap_size as i64 + delta;
        if new_size < 0 || new_size as u64 > MAX_HEAP_BYTES {
            return Err(ENOMEM);
        }
        inner.heap_size = new_size as u64;
        Ok(old)
    }

    fn range_ok(inner: &VmInner, addr: u64, len: u64) -> bool {
        if len == 0 {
            return true;
        }
        let end = match addr.checked_add(len) {
            Some(e) => e,
            None => return false,
        };
        let heap_end = inner.heap_start + inner.heap_size;
        (addr >= inner.heap_start && end <= heap_end)
            || (addr >= inner.stack_low && end <= inner.stack_high)
    }

    /// Copy bytes in from user memory.
    pub fn copy_in(&self, dst: &mut [u8], user_src: u64) -> Result<(), i64> {
        let inner = self.inner.lock();
        if !Self::range_ok(&inner, user_src, dst.len() as u64) {
            return Err(EFAULT);
        }
        unsafe {
            core::ptr::copy_nonoverlapping(user_src as *const u8, dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    /// Copy bytes out to user memory.
    pub fn copy_out(&self, user_dst: u64, src: &[u8]) -> Result<(), i64> {
        let inner = self.inner.lock();
        if !Self::range_ok(&inner, user_dst, src.len() as u64) {
            return Err(EFAULT);
        }
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), user_dst as *mut u8, src.len());
        }
        Ok(())
    }

    /// Copy a plain-data value out to user memory.
    pub fn copy_out_val<T: Copy>(&self, user_dst: u64, val: &T) -> Result<(), i64> {
        let bytes = unsafe {
            core::slice::from_raw_parts(val as *const T as *const u8, core::mem::size_of::<T>())
        };
        self.copy_out(user_dst, bytes)
    }

    /// Copy a plain-data value in from user memory.
    pub fn copy_in_val<T: Copy>(&self, user_src: u64) -> Result<T, i64> {
        let mut val = core::mem::MaybeUninit::<T>::uninit();
        let bytes = unsafe {
            core::slice::from_raw_parts_mut(val.as_mut_ptr() as *mut u8, core::mem::size_of::<T>())
        };
        self.copy_in(bytes, user_src)?;
        Ok(unsafe { val.assume_init() })
    }

    /// Extend the stack range downward to cover `addr` (signal-frame push
    /// onto a grown stack). May block in the full system; here it only
    /// adjusts the bound.
    pub fn try_grow_stack(&self, addr: u64) -> Result<(), i64> {
        let mut inner = self.inner.lock();
        if addr >= inner.stack_low && addr < inner.stack_high {
            return Ok(());
        }
        if addr >= inner.stack_limit_low && addr < inner.stack_low {
            inner.stack_low = addr & !0xfff;
            return Ok(());
        }
        Err(EFAULT)
    }
}
