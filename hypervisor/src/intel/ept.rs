//! Extended page tables.
//!
//! A 4-level table translating guest-physical to host-physical, built with
//! 4 KiB leaves only: guest RAM is one contiguous host buffer, mapped in
//! full before the first entry and never changed afterwards, so there is
//! no large-page or demand-mapping path. Intermediate tables come lazily from
//! the page allocator as the walk first touches them; the direct map makes
//! a frame's physical address usable as a pointer.
//!
//! Reference: SDM Vol 3C, 29.3 The Extended Page Table Mechanism.

use {
    crate::{error::HvError, mem::frame},
    bitfield::bitfield,
    log::debug,
};

const ENTRIES: usize = 512;
const PAGE_SHIFT: u64 = 12;
const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// EPT memory types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum MemoryType {
    Uncacheable = 0,
    WriteCombining = 1,
    WriteThrough = 4,
    WriteProtected = 5,
    WriteBack = 6,
}

bitfield! {
    /// An EPT entry at any level.
    #[derive(Clone, Copy)]
    pub struct Entry(u64);
    impl Debug;

    pub readable, set_readable: 0;
    pub writable, set_writable: 1;
    pub executable, set_executable: 2;
    pub memory_type, set_memory_type: 5, 3;
    pub ignore_pat, set_ignore_pat: 6;
    pub large, set_large: 7;
    pub pfn, set_pfn: 51, 12;
}

impl Entry {
    fn is_present(self) -> bool {
        self.readable() || self.writable() || self.executable()
    }

    fn table(self) -> *mut Table {
        (self.pfn() << PAGE_SHIFT) as *mut Table
    }
}

#[repr(C, align(4096))]
struct Table {
    entries: [Entry; ENTRIES],
}

static_assertions::const_assert_eq!(core::mem::size_of::<Table>(), 4096);

/// IA32_VMX_EPT_VPID_CAP: 4-level page walk supported.
const EPT_CAP_WALK_LENGTH_4: u64 = 1 << 6;
/// IA32_VMX_EPT_VPID_CAP: write-back EPT structures supported.
const EPT_CAP_MEMORY_TYPE_WB: u64 = 1 << 14;

/// Verify the processor supports the one EPT configuration we program.
pub fn check_ept_support() -> Result<(), HvError> {
    let cap = crate::intel::support::rdmsr(x86::msr::IA32_VMX_EPT_VPID_CAP);
    if cap & EPT_CAP_WALK_LENGTH_4 == 0 || cap & EPT_CAP_MEMORY_TYPE_WB == 0 {
        return Err(HvError::EptUnsupported);
    }
    Ok(())
}

/// The extended page table, owned through the physical address of its L4.
/// Frames come from the page allocator and are never returned.
pub struct Ept {
    pml4_pa: u64,
}

impl Ept {
    /// Allocate an empty table hierarchy (just the L4).
    pub fn new() -> Result<Self, HvError> {
        check_ept_support()?;
        Ok(Self { pml4_pa: alloc_table()? })
    }

    /// Map `[gpa, gpa + len)` to `[hpa, hpa + len)` with 4 KiB pages,
    /// read/write/execute, write-back. Both addresses and the length must
    /// be page aligned.
    pub fn map_range(&mut self, gpa: u64, hpa: u64, len: u64) -> Result<(), HvError> {
        assert!(
            gpa % PAGE_SIZE == 0 && hpa % PAGE_SIZE == 0 && len % PAGE_SIZE == 0,
            "EPT mappings must be page aligned"
        );

        let mut offset = 0;
        while offset < len {
            self.map_page(gpa + offset, hpa + offset)?;
            offset += PAGE_SIZE;
        }

        debug!(
            "EPT: mapped GPA {:#x}..{:#x} -> HPA {:#x} (4 KiB pages)",
            gpa,
            gpa + len,
            hpa
        );
        Ok(())
    }

    fn map_page(&mut self, gpa: u64, hpa: u64) -> Result<(), HvError> {
        let pml4 = unsafe { &mut *(self.pml4_pa as *mut Table) };
        let pdpt = walk_or_create(&mut pml4.entries[index(gpa, 3)])?;
        let pd = walk_or_create(&mut pdpt.entries[index(gpa, 2)])?;
        let pt = walk_or_create(&mut pd.entries[index(gpa, 1)])?;

        let leaf = &mut pt.entries[index(gpa, 0)];
        leaf.set_readable(true);
        leaf.set_writable(true);
        leaf.set_executable(true);
        leaf.set_memory_type(MemoryType::WriteBack as u64);
        leaf.set_pfn(hpa >> PAGE_SHIFT);
        Ok(())
    }

    /// The EPTP value for this table: L4 address, write-back walk memory
    /// type, page-walk length 4, no accessed/dirty tracking.
    pub fn eptp(&self) -> u64 {
        const WALK_LENGTH_4: u64 = 3 << 3;
        self.pml4_pa | WALK_LENGTH_4 | MemoryType::WriteBack as u64
    }
}

/// Index of `gpa` at the given level (0 = PT .. 3 = PML4).
fn index(gpa: u64, level: u32) -> usize {
    ((gpa >> (PAGE_SHIFT + 9 * level as u64)) & 0x1FF) as usize
}

/// Follow a non-leaf entry, allocating the next-level table on first use.
fn walk_or_create(entry: &mut Entry) -> Result<&'static mut Table, HvError> {
    if !entry.is_present() {
        let table_pa = alloc_table()?;
        entry.set_readable(true);
        entry.set_writable(true);
        entry.set_executable(true);
        entry.set_pfn(table_pa >> PAGE_SHIFT);
    }
    Ok(unsafe { &mut *entry.table() })
}

fn alloc_table() -> Result<u64, HvError> {
    // alloc_page returns zeroed memory, so every entry starts non-present.
    frame::alloc_page()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_encoding_round_trip() {
        let mut entry = Entry(0);
        entry.set_readable(true);
        entry.set_executable(true);
        entry.set_memory_type(MemoryType::WriteBack as u64);
        entry.set_pfn(0x1_2345);
        assert!(entry.is_present());
        assert_eq!(entry.memory_type(), 6);
        assert_eq!(entry.pfn(), 0x1_2345);
        assert!(!entry.writable());
        assert!(!entry.large());
    }

    #[test]
    fn gpa_indexing_matches_ia32e_split() {
        let gpa = 0x0000_7FAB_C123_D000u64;
        assert_eq!(index(gpa, 0), (gpa as usize >> 12) & 0x1FF);
        assert_eq!(index(gpa, 1), (gpa as usize >> 21) & 0x1FF);
        assert_eq!(index(gpa, 2), (gpa as usize >> 30) & 0x1FF);
        assert_eq!(index(gpa, 3), (gpa as usize >> 39) & 0x1FF);
    }

    #[test]
    fn eptp_encodes_walk_length_and_memory_type() {
        let ept = Ept { pml4_pa: 0x1234_5000 };
        let eptp = ept.eptp();
        assert_eq!(eptp & 0x7, MemoryType::WriteBack as u64);
        assert_eq!((eptp >> 3) & 0x7, 3);
        assert_eq!(eptp & !0xFFF, 0x1234_5000);
    }
}
