//! Thin wrappers over the privileged instructions the core needs.
//!
//! Port I/O, MSR access, control registers, and the VMX instruction set.
//! Every VMX instruction reports failure through RFLAGS: CF set means there
//! was no valid VMCS to even record an error in, ZF set means the error
//! code is sitting in the VM-instruction-error field. The wrappers fold
//! that convention into [`HvError`] once, so no call site ever looks at
//! flags.

use {
    crate::error::HvError,
    x86::{bits64::vmx, vmx::VmFail},
};

/// Read an MSR.
pub fn rdmsr(msr: u32) -> u64 {
    unsafe { x86::msr::rdmsr(msr) }
}

/// Write an MSR.
pub fn wrmsr(msr: u32, value: u64) {
    unsafe { x86::msr::wrmsr(msr, value) }
}

/// Read a byte from an I/O port.
pub fn inb(port: u16) -> u8 {
    unsafe { x86::io::inb(port) }
}

/// Write a byte to an I/O port.
pub fn outb(port: u16, value: u8) {
    unsafe { x86::io::outb(port, value) }
}

/// Read a word from an I/O port.
pub fn inw(port: u16) -> u16 {
    unsafe { x86::io::inw(port) }
}

/// Write a word to an I/O port.
pub fn outw(port: u16, value: u16) {
    unsafe { x86::io::outw(port, value) }
}

/// Read a doubleword from an I/O port.
pub fn inl(port: u16) -> u32 {
    unsafe { x86::io::inl(port) }
}

/// Write a doubleword to an I/O port.
pub fn outl(port: u16, value: u32) {
    unsafe { x86::io::outl(port, value) }
}

/// Current CR0, raw.
pub fn cr0() -> u64 {
    x86_64::registers::control::Cr0::read_raw()
}

/// Load CR0.
pub fn cr0_write(value: u64) {
    unsafe { x86_64::registers::control::Cr0::write_raw(value) }
}

/// Current CR3, raw (frame plus flags, exactly as the register holds it).
pub fn cr3() -> u64 {
    let (frame, flags) = x86_64::registers::control::Cr3::read_raw();
    frame.start_address().as_u64() | flags as u64
}

/// Current CR4, raw.
pub fn cr4() -> u64 {
    x86_64::registers::control::Cr4::read_raw()
}

/// Load CR4.
pub fn cr4_write(value: u64) {
    unsafe { x86_64::registers::control::Cr4::write_raw(value) }
}

/// Store the GDT register.
pub fn sgdt() -> x86::dtables::DescriptorTablePointer<u64> {
    let mut gdtr = x86::dtables::DescriptorTablePointer::default();
    unsafe { x86::dtables::sgdt(&mut gdtr) };
    gdtr
}

/// Store the IDT register.
pub fn sidt() -> x86::dtables::DescriptorTablePointer<u64> {
    let mut idtr = x86::dtables::DescriptorTablePointer::default();
    unsafe { x86::dtables::sidt(&mut idtr) };
    idtr
}

/// Set an extended control register. Only XCR0 exists today.
pub fn xsetbv(reg: u32, value: u64) {
    unsafe {
        core::arch::asm!(
            "xsetbv",
            in("ecx") reg,
            in("eax") value as u32,
            in("edx") (value >> 32) as u32,
            options(nomem, nostack, preserves_flags),
        );
    }
}

fn vm_fail(e: VmFail) -> HvError {
    match e {
        VmFail::VmFailInvalid => HvError::InvalidVmcsPointer,
        VmFail::VmFailValid => HvError::StatusAvailable,
    }
}

/// Enter VMX root operation with the given VMXON region.
pub fn vmxon(pa: u64) -> Result<(), HvError> {
    unsafe { vmx::vmxon(pa) }.map_err(vm_fail)
}

/// Leave VMX operation.
pub fn vmxoff() -> Result<(), HvError> {
    unsafe { vmx::vmxoff() }.map_err(vm_fail)
}

/// Clear the launch state of a VMCS and flush it to memory.
pub fn vmclear(pa: u64) -> Result<(), HvError> {
    unsafe { vmx::vmclear(pa) }.map_err(vm_fail)
}

/// Make a VMCS current on this logical processor.
pub fn vmptrld(pa: u64) -> Result<(), HvError> {
    unsafe { vmx::vmptrld(pa) }.map_err(vm_fail)
}

/// Read a field of the current VMCS.
pub fn vmread(field: u32) -> Result<u64, HvError> {
    unsafe { vmx::vmread(field) }.map_err(vm_fail)
}

/// Write a field of the current VMCS.
pub fn vmwrite(field: u32, value: u64) -> Result<(), HvError> {
    unsafe { vmx::vmwrite(field, value) }.map_err(vm_fail)
}
