//! Heap for bare-metal images (`bare-heap` feature).
//!
//! The kernel allocates arenas and vtables at boot and never per packet, so
//! a simple linked-list heap is enough. The embedding image owns the
//! `#[global_allocator]` declaration and points it at [`ALLOCATOR`]; hosted
//! builds and tests use the platform allocator instead.

use linked_list_allocator::LockedHeap;

pub static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Hand a memory region to the allocator. Call once, before the first
/// allocation, with a region that outlives the kernel.
///
/// # Safety
///
/// `start..start + size` must be writable, unused by anything else, and
/// valid for the remaining lifetime of the program.
pub unsafe fn init(start: *mut u8, size: usize) {
    ALLOCATOR.lock().init(start, size);
}
