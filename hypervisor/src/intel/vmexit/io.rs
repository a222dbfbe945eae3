//! I/O instruction exit handler.
//!
//! Unconditional I/O exiting means every IN/OUT lands here. The only
//! device the guest is promised is its serial console, so the COM1
//! register window is passed straight through to the host UART; that is
//! exactly what `console=ttyS0` needs to get early output flowing. Any
//! other port is a device we never claimed to have; touching one stops
//! the machine with a decoded dump.

use {
    crate::{
        error::HvError,
        intel::{
            support::{inb, inl, inw, outb, outl, outw, vmread},
            vcpu::Vcpu,
            vmexit::ExitType,
        },
        vmm::fatal_exit,
    },
    log::trace,
    x86::vmx::vmcs,
};

/// COM1 register window.
const COM1_BASE: u16 = 0x3F8;
const COM1_END: u16 = 0x3FF;

use crate::intel::vmerror::IoQualification;

pub fn handle(vcpu: &mut Vcpu) -> Result<ExitType, HvError> {
    let qual = IoQualification::from_raw(vmread(vmcs::ro::EXIT_QUALIFICATION)?);
    let port = qual.port();

    if qual.string() || qual.rep() {
        fatal_exit(vcpu, format_args!("string I/O on port {port:#x} is not emulated"));
    }
    if !(COM1_BASE..=COM1_END).contains(&port) {
        fatal_exit(
            vcpu,
            format_args!(
                "guest touched unemulated port {port:#x} ({} {} bytes)",
                if qual.input() { "in" } else { "out" },
                qual.width(),
            ),
        );
    }

    trace!(
        "I/O pass-through: port={port:#x} width={} input={}",
        qual.width(),
        qual.input()
    );

    if qual.input() {
        // Byte and word IN merge into RAX; doubleword IN zero-extends,
        // like any 32-bit destination write.
        vcpu.regs.rax = match qual.width() {
            1 => (vcpu.regs.rax & !0xFF) | inb(port) as u64,
            2 => (vcpu.regs.rax & !0xFFFF) | inw(port) as u64,
            _ => inl(port) as u64,
        };
    } else {
        match qual.width() {
            1 => outb(port, vcpu.regs.rax as u8),
            2 => outw(port, vcpu.regs.rax as u16),
            _ => outl(port, vcpu.regs.rax as u32),
        }
    }

    Ok(ExitType::IncrementRip)
}
