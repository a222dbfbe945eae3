//! Kernel page tables.
//!
//! The firmware's identity map lives in boot-services memory we are about
//! to recycle, so the kernel builds its own: a direct physical map of the
//! first 512 GiB with 2 MiB pages, writable, executable. One PML4, one
//! PDPT, and 512 page directories add up to a little over 2 MiB of tables,
//! which is why the whole structure is heap-allocated.

use {
    crate::error::HvError,
    bitfield::bitfield,
    log::debug,
    x86_64::{
        registers::control::{Cr3, Cr3Flags},
        structures::paging::PhysFrame,
        PhysAddr,
    },
};

const ENTRIES: usize = 512;
const LARGE_PAGE_SIZE: u64 = 2 * 1024 * 1024;

bitfield! {
    #[derive(Clone, Copy)]
    struct Entry(u64);
    impl Debug;

    present, set_present: 0;
    writable, set_writable: 1;
    large, set_large: 7;
    pfn, set_pfn: 51, 12;
}

#[repr(C, align(4096))]
#[derive(Clone, Copy)]
struct Table {
    entries: [Entry; ENTRIES],
}

/// The kernel's direct-map page tables.
#[repr(C, align(4096))]
pub struct PageTables {
    pml4: Table,
    pdpt: Table,
    pd: [Table; ENTRIES],
}

static_assertions::const_assert_eq!(core::mem::size_of::<Table>(), 4096);

impl PageTables {
    /// Map the first 512 GiB of physical memory at identical virtual
    /// addresses.
    fn build_identity(&mut self) {
        let pml4e = &mut self.pml4.entries[0];
        pml4e.set_present(true);
        pml4e.set_writable(true);
        pml4e.set_pfn(core::ptr::addr_of!(self.pdpt) as u64 >> 12);

        let mut pa: u64 = 0;
        for (i, pdpte) in self.pdpt.entries.iter_mut().enumerate() {
            pdpte.set_present(true);
            pdpte.set_writable(true);
            pdpte.set_pfn(core::ptr::addr_of!(self.pd[i]) as u64 >> 12);

            for pde in self.pd[i].entries.iter_mut() {
                pde.set_present(true);
                pde.set_writable(true);
                pde.set_large(true);
                pde.set_pfn(pa >> 12);
                pa += LARGE_PAGE_SIZE;
            }
        }
    }

    fn pml4_pa(&self) -> u64 {
        core::ptr::addr_of!(self.pml4) as u64
    }
}

/// Build the direct map and switch CR3 to it. The tables are leaked; they
/// must outlive everything.
pub fn init() -> Result<(), HvError> {
    // Too big for the kernel stack; build it zeroed on the heap.
    let mut tables = unsafe { alloc::boxed::Box::<PageTables>::new_zeroed().assume_init() };
    tables.build_identity();

    let tables = alloc::boxed::Box::leak(tables);
    let pml4_pa = tables.pml4_pa();

    unsafe {
        Cr3::write(
            PhysFrame::from_start_address(PhysAddr::new(pml4_pa)).expect("PML4 must be page aligned"),
            Cr3Flags::empty(),
        );
    }

    debug!("direct map loaded, PML4 at {:#x}", pml4_pa);
    Ok(())
}
