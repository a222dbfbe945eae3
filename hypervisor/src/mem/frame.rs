//! Physical page allocator.
//!
//! Bump allocation over the conventional-memory regions of the UEFI map.
//! Frames are zeroed on hand-out and never returned; every consumer (heap,
//! EPT tables, guest RAM) keeps its frames until power-off.

use {
    crate::{error::HvError, mem::PAGE_SIZE},
    bootinfo::{MemoryMap, EFI_CONVENTIONAL_MEMORY},
    log::{debug, warn},
    spin::Mutex,
};

/// Regions below this are left alone: real-mode firmware leftovers, the
/// EBDA, nothing worth fighting for.
const MIN_PHYS_ADDR: u64 = 0x10_0000;

const MAX_REGIONS: usize = 32;

#[derive(Debug, Clone, Copy, Default)]
struct Region {
    next: u64,
    end: u64,
}

struct PagePool {
    regions: [Region; MAX_REGIONS],
    count: usize,
}

static POOL: Mutex<PagePool> = Mutex::new(PagePool {
    regions: [Region { next: 0, end: 0 }; MAX_REGIONS],
    count: 0,
});

/// Claim every usable region of the memory map.
pub fn init(map: &MemoryMap) {
    let mut pool = POOL.lock();
    let mut total = 0u64;

    for desc in map.iter() {
        if desc.ty != EFI_CONVENTIONAL_MEMORY {
            continue;
        }
        let start = desc.physical_start.max(MIN_PHYS_ADDR);
        let end = desc.physical_start + desc.number_of_pages * PAGE_SIZE as u64;
        if start >= end {
            continue;
        }
        if pool.count == MAX_REGIONS {
            warn!("memory map has more usable regions than slots, dropping {:#x}", start);
            continue;
        }
        let index = pool.count;
        pool.regions[index] = Region { next: start, end };
        pool.count += 1;
        total += end - start;
    }

    // Largest regions first so big contiguous requests (guest RAM) land in
    // one piece instead of exhausting small fragments.
    let count = pool.count;
    pool.regions[..count].sort_unstable_by_key(|r| core::cmp::Reverse(r.end - r.next));

    debug!(
        "page allocator: {} regions, {} MiB usable",
        pool.count,
        total / (1024 * 1024)
    );
}

/// Allocate `count` contiguous 4 KiB pages, zeroed. The frames are never
/// reclaimed.
pub fn alloc_pages(count: usize) -> Result<u64, HvError> {
    let bytes = (count * PAGE_SIZE) as u64;
    let mut pool = POOL.lock();

    let count = pool.count;
    for region in pool.regions[..count].iter_mut() {
        if region.end - region.next >= bytes {
            let base = region.next;
            region.next += bytes;
            unsafe { core::ptr::write_bytes(base as *mut u8, 0, bytes as usize) };
            return Ok(base);
        }
    }

    Err(HvError::OutOfMemory)
}

/// Allocate a single zeroed 4 KiB page.
pub fn alloc_page() -> Result<u64, HvError> {
    alloc_pages(1)
}
