/*
 * Kernel heap.
 *
 * A fixed early arena handed to linked_list_allocator. Thread control
 * blocks, kernel stacks, signal records and trapframes all come from
 * here; the buddy/slab machinery of the full system is an external
 * collaborator outside this core.
 */

use linked_list_allocator::LockedHeap;

#[cfg_attr(not(test), global_allocator)]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// 16 MiB early arena in .bss.
const HEAP_SIZE: usize = 16 * 1024 * 1024;

#[repr(C, align(4096))]
struct HeapArena([u8; HEAP_SIZE]);

static mut HEAP_ARENA: HeapArena = HeapArena([0; HEAP_SIZE]);

/// Hand the arena to the allocator. Hart 0, once, before any Box.
pub fn init() {
    unsafe {
        let base = core::ptr::addr_of_mut!(HEAP_ARENA.0) as *mut u8;
        ALLOCATOR.lock().init(base, HEAP_SIZE);
    }
    log::info!("heap: {} KiB arena", HEAP_SIZE / 1024);
}

/// Allocate a kernel stack; returns the base address.
pub fn alloc_kstack(size: usize) -> Option<usize> {
    let layout = core::alloc::Layout::from_size_align(size, 16).ok()?;
    let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
    if ptr.is_null() {
        None
    } else {
        Some(ptr as usize)
    }
}

/// Free a kernel stack allocated with alloc_kstack.
///
/// # Safety
/// `base`/`size` must come from a matching alloc_kstack and the stack
/// must no longer be in use by any context.
pub unsafe fn free_kstack(base: usize, size: usize) {
    let layout = core::alloc::Layout::from_size_align_unchecked(size, 16);
    alloc::alloc::dealloc(base as *mut u8, layout);
}
