//! Kernel heap backing `alloc` collections (inode cache, file table).

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;
use linked_list_allocator::Heap;
use spin::Mutex;

static HEAP: Mutex<Heap> = Mutex::new(Heap::empty());

pub struct HeapAllocator;

/// # Safety
///
/// `[offset, offset + size)` must be mapped, unused kernel memory.
pub unsafe fn init(offset: usize, size: usize) {
    HEAP.lock().init(offset as *mut u8, size);
}

unsafe impl GlobalAlloc for HeapAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match HEAP.lock().allocate_first_fit(layout) {
            Err(()) => panic!("kheap: allocation error: {:?}", layout),
            Ok(res) => {
                #[cfg(feature = "debug")]
                log::trace!("kheap: allocated {:?} at {:?}", layout, res.as_ptr());
                res.as_ptr()
            }
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        HEAP.lock().deallocate(NonNull::new_unchecked(ptr), layout);
        #[cfg(feature = "debug")]
        log::trace!("kheap: released {:?}", ptr);
    }
}

#[cfg_attr(not(test), global_allocator)]
#[allow(dead_code)]
static ALLOCATOR: HeapAllocator = HeapAllocator;
