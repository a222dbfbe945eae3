//! Global heap allocator.
//!
//! A first-fit linked-list heap over one contiguous region that the page
//! allocator carves out of conventional memory at boot. Every free block
//! starts with a [`Link`] header; allocated blocks store a negated size so
//! `dealloc` can flip them back. Alignment is honored up to 4 KiB, which is
//! what the VMXON/VMCS/EPT structures need from `Box`.

use {
    core::{
        alloc::{GlobalAlloc, Layout},
        ptr,
    },
    log::debug,
    spin::Mutex,
};

/// Heap size requested from the page allocator at boot.
pub const HEAP_SIZE: usize = 16 * 1024 * 1024;

static HEAP: Mutex<Option<ListHeap>> = Mutex::new(None);

#[global_allocator]
static GLOBAL_ALLOCATOR: GlobalAllocator = GlobalAllocator;

/// Hand the allocator its backing memory.
///
/// # Safety
///
/// `base` must point to `size` bytes of otherwise-unused physical memory
/// that stays valid for the rest of the kernel's life.
pub unsafe fn init(base: *mut u8, size: usize) {
    ptr::write_bytes(base, 0, size);

    let head = base as *mut Link;
    (*head).next = ptr::null_mut();
    (*head).size = size as isize - Link::SIZE as isize;

    *HEAP.lock() = Some(ListHeap { head });
    debug!("heap initialized at {:#x} ({} KiB)", base as u64, size / 1024);
}

#[repr(C, align(0x10))]
struct Link {
    next: *mut Link,
    /// Positive: free bytes after this header. Negative: allocated bytes.
    size: isize,
}

impl Link {
    const SIZE: usize = core::mem::size_of::<Link>();
}

struct ListHeap {
    head: *mut Link,
}

// The raw pointer only ever moves under the HEAP mutex.
unsafe impl Send for ListHeap {}

impl ListHeap {
    unsafe fn alloc(&mut self, layout: Layout) -> *mut u8 {
        let align = layout.align().max(core::mem::size_of::<usize>());
        let size = (layout.size().max(1) + (align - 1)) & !(align - 1);

        let mut link = self.head;
        while !link.is_null() {
            if (*link).size <= 0 {
                link = (*link).next;
                continue;
            }

            let free_start = link as usize + Link::SIZE;
            let free_end = free_start + (*link).size as usize;
            let aligned = (free_start + (align - 1)) & !(align - 1);

            if aligned + size <= free_end {
                let remaining = free_end - (aligned + size);
                let old_next = (*link).next;

                // Split off a tail free block when it is worth a header.
                let tail = if remaining > Link::SIZE {
                    let rest = (aligned + size) as *mut Link;
                    (*rest).next = old_next;
                    (*rest).size = remaining as isize - Link::SIZE as isize;
                    rest
                } else {
                    old_next
                };

                // The claimed header sits just below the aligned payload;
                // when alignment forced a gap, the gap stays on the free
                // list under the original header.
                let claimed = (aligned - Link::SIZE) as *mut Link;
                if claimed != link {
                    (*link).size = (claimed as usize - free_start) as isize;
                    (*link).next = claimed;
                }
                (*claimed).next = tail;
                (*claimed).size = -(size as isize);

                return aligned as *mut u8;
            }

            link = (*link).next;
        }

        ptr::null_mut()
    }

    unsafe fn dealloc(&mut self, ptr_in: *mut u8) {
        if ptr_in.is_null() {
            return;
        }
        let link = (ptr_in as usize - Link::SIZE) as *mut Link;
        (*link).size = -(*link).size;

        // Coalesce with the next-adjacent free block when they touch.
        let mut curr = self.head;
        while !curr.is_null() {
            if (*curr).next == link && (*curr).size > 0 {
                let end = curr as usize + Link::SIZE + (*curr).size as usize;
                if end == link as usize {
                    (*curr).size += (*link).size + Link::SIZE as isize;
                    (*curr).next = (*link).next;
                }
                break;
            }
            curr = (*curr).next;
        }
    }
}

struct GlobalAllocator;

unsafe impl GlobalAlloc for GlobalAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match HEAP.lock().as_mut() {
            Some(heap) => heap.alloc(layout),
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr_in: *mut u8, _layout: Layout) {
        if let Some(heap) = HEAP.lock().as_mut() {
            heap.dealloc(ptr_in);
        }
    }
}
