//! RDMSR / WRMSR exit handlers.
//!
//! With MSR load/store counts of zero and no MSR bitmap, every guest MSR
//! access exits. The guest gets a small synthetic machine: EFER is backed
//! by the VMCS image, the APIC base is the architectural default, and the
//! feature/misc registers read as benign constants. Writes to registers we
//! do not model are acknowledged and dropped, which is what early Linux
//! boot expects from a machine with nothing behind those MSRs.

use {
    crate::{
        error::HvError,
        intel::{
            controls::EntryControls,
            support::{vmread, vmwrite},
            vcpu::Vcpu,
            vmexit::ExitType,
        },
    },
    log::{trace, warn},
    x86::{msr, vmx::vmcs},
};

/// EFER.LME / EFER.LMA.
const EFER_LME: u64 = 1 << 8;
const EFER_LMA: u64 = 1 << 10;
/// CR0.PG.
const CR0_PG: u64 = 1 << 31;

/// Architectural default: APIC at 0xFEE00000, enabled, this is the BSP.
const APIC_BASE_DEFAULT: u64 = 0xFEE0_0000 | (1 << 11) | (1 << 8);

pub fn handle_rdmsr(vcpu: &mut Vcpu) -> Result<ExitType, HvError> {
    let index = vcpu.regs.rcx as u32;

    let value = match index {
        msr::IA32_EFER => vmread(vmcs::guest::IA32_EFER_FULL)?,
        msr::IA32_PAT => vmread(vmcs::guest::IA32_PAT_FULL)?,
        msr::IA32_FS_BASE => vmread(vmcs::guest::FS_BASE)?,
        msr::IA32_GS_BASE => vmread(vmcs::guest::GS_BASE)?,
        msr::IA32_APIC_BASE => APIC_BASE_DEFAULT,
        msr::IA32_MISC_ENABLE => 0,
        msr::IA32_BIOS_SIGN_ID => 0,
        msr::IA32_PLATFORM_ID => 0,
        msr::IA32_MTRRCAP => 0,
        _ => {
            warn!("RDMSR of unmodeled MSR {index:#x}, returning 0");
            0
        }
    };

    trace!("RDMSR {index:#x} -> {value:#x}");
    vcpu.regs.rax = value & 0xFFFF_FFFF;
    vcpu.regs.rdx = value >> 32;

    Ok(ExitType::IncrementRip)
}

pub fn handle_wrmsr(vcpu: &mut Vcpu) -> Result<ExitType, HvError> {
    let index = vcpu.regs.rcx as u32;
    let value = (vcpu.regs.rdx << 32) | (vcpu.regs.rax & 0xFFFF_FFFF);

    trace!("WRMSR {index:#x} <- {value:#x}");

    match index {
        msr::IA32_EFER => write_guest_efer(value)?,
        msr::IA32_PAT => vmwrite(vmcs::guest::IA32_PAT_FULL, value)?,
        msr::IA32_FS_BASE => vmwrite(vmcs::guest::FS_BASE, value)?,
        msr::IA32_GS_BASE => vmwrite(vmcs::guest::GS_BASE, value)?,
        msr::IA32_BIOS_UPDT_TRIG | msr::IA32_MISC_ENABLE => {}
        _ => {
            warn!("WRMSR to unmodeled MSR {index:#x} dropped (value {value:#x})");
        }
    }

    Ok(ExitType::IncrementRip)
}

/// Update the guest EFER image. When the guest has paging on, LMA must
/// mirror LME and the entry controls must agree, so the long-mode switch
/// performed by the Linux trampoline (WRMSR EFER.LME, then MOV CR0 with
/// PG) keeps the VMCS consistent at every step.
fn write_guest_efer(mut value: u64) -> Result<(), HvError> {
    let cr0 = vmread(vmcs::guest::CR0)?;
    let paging = cr0 & CR0_PG != 0;
    let lme = value & EFER_LME != 0;

    if paging && lme {
        value |= EFER_LMA;
    } else {
        value &= !EFER_LMA;
    }
    vmwrite(vmcs::guest::IA32_EFER_FULL, value)?;

    let mut entry = vmread(vmcs::control::VMENTRY_CONTROLS)?;
    if value & EFER_LMA != 0 {
        entry |= EntryControls::IA32E_MODE_GUEST.bits();
    } else {
        entry &= !EntryControls::IA32E_MODE_GUEST.bits();
    }
    vmwrite(vmcs::control::VMENTRY_CONTROLS, entry)
}
