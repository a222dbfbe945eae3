//! Kernel GDT and TSS.
//!
//! The firmware GDT dies with boot services, so the kernel installs its own
//! before anything can take an interrupt. The layout is the smallest one a
//! 64-bit VMX host needs: null, code, data, and a TSS (VM entry requires a
//! usable host TR).

use {
    lazy_static::lazy_static,
    x86_64::{
        instructions::tables::load_tss,
        registers::segmentation::{Segment, CS, DS, ES, FS, GS, SS},
        structures::{
            gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
            tss::TaskStateSegment,
        },
        VirtAddr,
    },
};

/// Stack used by the double-fault handler, via the IST.
const DOUBLE_FAULT_STACK_SIZE: usize = 4096 * 4;

/// IST slot for the double-fault stack.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

struct Selectors {
    code: SegmentSelector,
    data: SegmentSelector,
    tss: SegmentSelector,
}

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            static mut STACK: [u8; DOUBLE_FAULT_STACK_SIZE] = [0; DOUBLE_FAULT_STACK_SIZE];
            let start = VirtAddr::from_ptr(unsafe { core::ptr::addr_of!(STACK) });
            start + DOUBLE_FAULT_STACK_SIZE as u64
        };
        tss
    };
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let code = gdt.append(Descriptor::kernel_code_segment());
        let data = gdt.append(Descriptor::kernel_data_segment());
        let tss = gdt.append(Descriptor::tss_segment(&TSS));
        (gdt, Selectors { code, data, tss })
    };
}

/// Load the kernel GDT and reload every segment register plus TR.
pub fn init() {
    GDT.0.load();
    unsafe {
        CS::set_reg(GDT.1.code);
        SS::set_reg(GDT.1.data);
        DS::set_reg(GDT.1.data);
        ES::set_reg(GDT.1.data);
        FS::set_reg(GDT.1.data);
        GS::set_reg(GDT.1.data);
        load_tss(GDT.1.tss);
    }
    log::debug!("GDT loaded, cs={:#x} tr={:#x}", GDT.1.code.0, GDT.1.tss.0);
}

/// Kernel code selector, as loaded in CS.
pub fn kernel_cs() -> u16 {
    GDT.1.code.0
}

/// Kernel data selector, as loaded in SS/DS/ES/FS/GS.
pub fn kernel_ds() -> u16 {
    GDT.1.data.0
}

/// Task register selector.
pub fn kernel_tr() -> u16 {
    GDT.1.tss.0
}

/// Base address of the TSS, needed for the VMCS host TR base.
pub fn tss_base() -> u64 {
    &*TSS as *const TaskStateSegment as u64
}
