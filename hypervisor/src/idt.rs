//! Kernel IDT.
//!
//! Exception vectors report and halt; the remapped PIC vectors (32..48)
//! acknowledge the controller and return. The hypervisor itself should
//! never fault once the vCPU loop is running, so every exception is
//! treated as a bug.

use {
    crate::{gdt, pic},
    lazy_static::lazy_static,
    log::error,
    x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode},
};

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.general_protection_fault.set_handler_fn(general_protection_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt[pic::vector(pic::IrqLine::Timer)].set_handler_fn(timer_handler);
        idt[pic::vector(pic::IrqLine::Keyboard)].set_handler_fn(keyboard_handler);
        idt
    };
}

/// Install the IDT. Interrupts stay disabled until the caller enables them.
pub fn init() {
    IDT.load();
    log::debug!("IDT loaded");
}

extern "x86-interrupt" fn breakpoint_handler(frame: InterruptStackFrame) {
    error!("#BP at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn invalid_opcode_handler(frame: InterruptStackFrame) {
    panic!("#UD at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn general_protection_handler(frame: InterruptStackFrame, error_code: u64) {
    panic!(
        "#GP at {:#x}, error code {:#x}",
        frame.instruction_pointer.as_u64(),
        error_code
    );
}

extern "x86-interrupt" fn page_fault_handler(frame: InterruptStackFrame, error_code: PageFaultErrorCode) {
    let cr2 = x86_64::registers::control::Cr2::read_raw();
    panic!(
        "#PF at {:#x}, address {:#x}, error {:?}",
        frame.instruction_pointer.as_u64(),
        cr2,
        error_code
    );
}

extern "x86-interrupt" fn double_fault_handler(frame: InterruptStackFrame, _error_code: u64) -> ! {
    panic!("#DF at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn timer_handler(_frame: InterruptStackFrame) {
    pic::notify_eoi(pic::IrqLine::Timer);
}

extern "x86-interrupt" fn keyboard_handler(_frame: InterruptStackFrame) {
    // Drain the controller so it keeps raising interrupts, then ack.
    let _ = crate::intel::support::inb(0x60);
    pic::notify_eoi(pic::IrqLine::Keyboard);
}
