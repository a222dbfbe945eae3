//! CPUID exit handler.
//!
//! Host values are passed through with two edits: the VMX feature bit is
//! hidden (the guest cannot nest on this hypervisor) and the hypervisor
//! leaf range reports empty, so the guest treats the platform as bare
//! metal.

use {
    crate::{
        error::HvError,
        intel::{vcpu::Vcpu, vmexit::ExitType},
    },
    log::trace,
    x86::cpuid::{cpuid, CpuIdResult},
};

/// CPUID.1 ECX bit 5: VMX supported.
const FEATURE_ECX_VMX: u32 = 1 << 5;
/// CPUID.1 ECX bit 31: running under a hypervisor.
const FEATURE_ECX_HYPERVISOR: u32 = 1 << 31;

/// Hypervisor-reserved leaf range.
const LEAF_HYPERVISOR_BASE: u32 = 0x4000_0000;
const LEAF_HYPERVISOR_END: u32 = 0x4000_00FF;

pub fn handle(vcpu: &mut Vcpu) -> Result<ExitType, HvError> {
    let leaf = vcpu.regs.rax as u32;
    let subleaf = vcpu.regs.rcx as u32;

    let CpuIdResult { eax, ebx, mut ecx, mut edx } = host_cpuid(leaf, subleaf);

    match leaf {
        1 => {
            ecx &= !FEATURE_ECX_VMX;
            ecx &= !FEATURE_ECX_HYPERVISOR;
        }
        LEAF_HYPERVISOR_BASE..=LEAF_HYPERVISOR_END => {
            ecx = 0;
            edx = 0;
        }
        _ => {}
    }

    trace!("CPUID leaf={leaf:#x} subleaf={subleaf:#x}");

    // The upper halves of the 64-bit registers are zeroed, as real CPUID
    // does.
    vcpu.regs.rax = eax as u64;
    vcpu.regs.rbx = ebx as u64;
    vcpu.regs.rcx = ecx as u64;
    vcpu.regs.rdx = edx as u64;

    Ok(ExitType::IncrementRip)
}

fn host_cpuid(leaf: u32, subleaf: u32) -> CpuIdResult {
    let result = cpuid!(leaf, subleaf);
    // The hypervisor leaf range is special-cased above; everything else is
    // the host's own answer.
    let (mut eax, mut ebx) = (result.eax, result.ebx);
    if (LEAF_HYPERVISOR_BASE..=LEAF_HYPERVISOR_END).contains(&leaf) {
        eax = 0;
        ebx = 0;
    }
    CpuIdResult { eax, ebx, ecx: result.ecx, edx: result.edx }
}
