//! Mirage, a minimal Intel VT-x type-1 hypervisor.
//!
//! The UEFI loader drops us here with boot services already exited. We own
//! the machine: bring up the platform (GDT, IDT, PIC, paging, allocators),
//! then hand control to the VMX core which runs a single Linux guest vCPU
//! in a VM-entry/exit loop until something fatal happens.

#![no_std]
#![no_main]
#![feature(abi_x86_interrupt)]

extern crate alloc;
extern crate static_assertions;

use {
    bootinfo::BootInfo,
    core::arch::global_asm,
    log::info,
};

pub mod acpi;
pub mod allocator;
pub mod boot;
pub mod error;
pub mod gdt;
pub mod idt;
pub mod intel;
pub mod linux;
pub mod logger;
pub mod mem;
pub mod panic;
pub mod pic;
pub mod serial;
pub mod vmm;

use crate::error::HvError;

/// Kernel stack size. The stack top sits one page below the end of the
/// buffer; that trailing page is the guard, never handed to anyone else.
const KERNEL_STACK_SIZE: usize = 128 * 1024;
const KERNEL_STACK_GUARD: usize = 4096;

#[repr(C, align(4096))]
struct KernelStack([u8; KERNEL_STACK_SIZE + KERNEL_STACK_GUARD]);

static mut KERNEL_STACK: KernelStack = KernelStack([0; KERNEL_STACK_SIZE + KERNEL_STACK_GUARD]);

global_asm!(
    r#"
    .global kernel_entry

kernel_entry:
    // The loader calls us with the Win64 convention: RCX = &BootInfo.
    // Switch off the loader's stack before touching anything else, then
    // call into Rust with RCX intact and proper shadow space. The call
    // never returns; the halt loop catches a broken fall-through.
    lea rsp, [rip + {stack}]
    add rsp, {stack_top}
    sub rsp, 0x20
    call {trampoline}
2:
    hlt
    jmp 2b
"#,
    stack = sym KERNEL_STACK,
    stack_top = const KERNEL_STACK_SIZE,
    trampoline = sym kernel_trampoline,
);

/// First Rust code on the kernel stack. Never returns; a failing
/// `kernel_main` is unrecoverable.
extern "win64" fn kernel_trampoline(boot_info: &'static BootInfo) -> ! {
    match kernel_main(boot_info) {
        // kernel_main only returns through the Err arm; the vCPU loop never
        // comes back.
        Ok(()) => unreachable!("vCPU loop returned"),
        Err(e) => panic!("kernel_main failed: {e:?}"),
    }
}

fn kernel_main(boot_info: &'static BootInfo) -> Result<(), HvError> {
    serial::init();
    logger::init();

    info!("Mirage hypervisor kernel starting");

    // Nothing in the handoff record can be trusted before this line.
    boot::validate(boot_info);

    gdt::init();
    idt::init();
    pic::init();
    x86_64::instructions::interrupts::enable();

    mem::init(&boot_info.memory_map)?;
    acpi::init(boot_info.acpi_rsdp);

    vmm::launch(boot_info)
}
