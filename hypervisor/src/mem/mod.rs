//! Physical memory management.
//!
//! Boot order matters here: the page allocator claims conventional memory
//! straight from the UEFI map (no paging changes needed, the firmware
//! identity map is still live), the heap takes its region from the page
//! allocator, and only then is the kernel's own direct map built and
//! loaded. After [`init`] returns, virtual equals physical for every
//! address the VMX core touches.

pub mod frame;
pub mod paging;

use {
    crate::{allocator, error::HvError},
    bootinfo::MemoryMap,
    log::info,
};

pub const PAGE_SIZE: usize = 4096;

/// Bring up the page allocator, the heap, and the direct map.
pub fn init(map: &MemoryMap) -> Result<(), HvError> {
    frame::init(map);

    let heap_pages = allocator::HEAP_SIZE / PAGE_SIZE;
    let heap_base = frame::alloc_pages(heap_pages)?;
    unsafe { allocator::init(heap_base as *mut u8, allocator::HEAP_SIZE) };

    paging::init()?;

    info!("memory online: direct map active, heap and page allocator ready");
    Ok(())
}
