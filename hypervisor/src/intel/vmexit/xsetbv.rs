//! XSETBV exit handler.
//!
//! XSETBV exits unconditionally, and Linux executes it as soon as it turns
//! on XSAVE. The guest's extended-state choice is applied to the real XCR0
//! after masking it to what the host actually supports; there is no
//! per-guest FPU state to protect, the host never touches extended state.

use {
    crate::{
        error::HvError,
        intel::{
            support::{cr4, cr4_write, vmread, xsetbv},
            vcpu::Vcpu,
            vmexit::ExitType,
        },
        vmm::fatal_exit,
    },
    log::trace,
    x86::vmx::vmcs,
};

/// CR4.OSXSAVE.
const CR4_OSXSAVE: u64 = 1 << 18;
/// XCR0.X87, which must always be set.
const XCR0_X87: u64 = 1 << 0;

pub fn handle(vcpu: &mut Vcpu) -> Result<ExitType, HvError> {
    let index = vcpu.regs.rcx as u32;
    let value = (vcpu.regs.rdx << 32) | (vcpu.regs.rax & 0xFFFF_FFFF);

    // The guest must have enabled OSXSAVE (we see its intent in the
    // shadow) and may only touch XCR0 with x87 set; anything else would
    // raise #GP on real hardware.
    let shadow_cr4 = vmread(vmcs::control::CR4_READ_SHADOW)?;
    if index != 0 || shadow_cr4 & CR4_OSXSAVE == 0 || value & XCR0_X87 == 0 {
        fatal_exit(
            vcpu,
            format_args!("invalid XSETBV: xcr{index} <- {value:#x} (shadow CR4 {shadow_cr4:#x})"),
        );
    }

    let supported = supported_xcr0();
    trace!("XSETBV: xcr0 <- {value:#x} (host mask {supported:#x})");

    // Executing XSETBV here needs the host's own OSXSAVE on.
    if cr4() & CR4_OSXSAVE == 0 {
        cr4_write(cr4() | CR4_OSXSAVE);
    }
    xsetbv(0, value & supported);

    Ok(ExitType::IncrementRip)
}

/// XCR0 bits the host CPU implements, from CPUID.0D.0.
fn supported_xcr0() -> u64 {
    let result = x86::cpuid::cpuid!(0x0D, 0x00);
    (result.edx as u64) << 32 | result.eax as u64
}
