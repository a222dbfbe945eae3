//! Control-register access exit handler.
//!
//! With both CR masks set to all ones, every guest CR0/CR4 touch exits.
//! The guest's view lives in the read shadows; the real guest fields get
//! the guest's value with the VMX fixed bits folded back in. CR3 is
//! tracked directly, CLTS and LMSW are decoded into the equivalent CR0
//! edit.

use {
    crate::{
        error::HvError,
        intel::{
            controls::EntryControls,
            support::{rdmsr, vmread, vmwrite},
            vcpu::Vcpu,
            vmexit::ExitType,
        },
    },
    log::{trace, warn},
    x86::{msr, vmx::vmcs},
};

const CR0_PE: u64 = 1 << 0;
const CR0_TS: u64 = 1 << 3;
const CR0_PG: u64 = 1 << 31;
/// The low word LMSW can touch: PE, MP, EM, TS.
const LMSW_MASK: u64 = 0xF;
const CR4_VMXE: u64 = 1 << 13;
const EFER_LME: u64 = 1 << 8;
const EFER_LMA: u64 = 1 << 10;

use crate::intel::vmerror::{CrAccessReg, CrAccessType, CrQualification};

pub fn handle(vcpu: &mut Vcpu) -> Result<ExitType, HvError> {
    let qual = CrQualification::from_raw(vmread(vmcs::ro::EXIT_QUALIFICATION)?);
    trace!("CR access: {qual:?}");

    match (qual.access, qual.reg) {
        (CrAccessType::MovToCr, CrAccessReg::Cr0) => mov_to_cr0(read_gpr(vcpu, qual.gpr)?),
        (CrAccessType::MovToCr, CrAccessReg::Cr3) => {
            vmwrite(vmcs::guest::CR3, read_gpr(vcpu, qual.gpr)?)
        }
        (CrAccessType::MovToCr, CrAccessReg::Cr4) => mov_to_cr4(read_gpr(vcpu, qual.gpr)?),
        (CrAccessType::MovFromCr, CrAccessReg::Cr0) => {
            let value = vmread(vmcs::control::CR0_READ_SHADOW)?;
            write_gpr(vcpu, qual.gpr, value)
        }
        (CrAccessType::MovFromCr, CrAccessReg::Cr3) => {
            let value = vmread(vmcs::guest::CR3)?;
            write_gpr(vcpu, qual.gpr, value)
        }
        (CrAccessType::MovFromCr, CrAccessReg::Cr4) => {
            let value = vmread(vmcs::control::CR4_READ_SHADOW)?;
            write_gpr(vcpu, qual.gpr, value)
        }
        (CrAccessType::Clts, _) => {
            let shadow = vmread(vmcs::control::CR0_READ_SHADOW)?;
            mov_to_cr0(shadow & !CR0_TS)
        }
        (CrAccessType::Lmsw, _) => {
            // LMSW replaces the low word but can set PE, never clear it.
            let shadow = vmread(vmcs::control::CR0_READ_SHADOW)?;
            let mut value = (shadow & !LMSW_MASK) | (qual.lmsw_source as u64 & LMSW_MASK);
            value |= shadow & CR0_PE;
            mov_to_cr0(value)
        }
        (access, reg) => {
            warn!("unhandled CR access {access:?} on {reg:?}");
            return Err(HvError::UnhandledVmExit);
        }
    }?;

    Ok(ExitType::IncrementRip)
}

/// The guest wrote CR0. The shadow takes the value verbatim; the live
/// field gets the fixed bits re-applied, except PE and PG which an
/// unrestricted guest may clear. A PG flip also toggles IA-32e mode when
/// the guest armed EFER.LME.
fn mov_to_cr0(value: u64) -> Result<(), HvError> {
    vmwrite(vmcs::control::CR0_READ_SHADOW, value)?;

    let fixed0 = rdmsr(msr::IA32_VMX_CR0_FIXED0) & !(CR0_PE | CR0_PG);
    let fixed1 = rdmsr(msr::IA32_VMX_CR0_FIXED1);
    let effective = (value | fixed0) & fixed1;
    vmwrite(vmcs::guest::CR0, effective)?;

    let mut efer = vmread(vmcs::guest::IA32_EFER_FULL)?;
    let long = effective & CR0_PG != 0 && efer & EFER_LME != 0;
    if long {
        efer |= EFER_LMA;
    } else {
        efer &= !EFER_LMA;
    }
    vmwrite(vmcs::guest::IA32_EFER_FULL, efer)?;

    let mut entry = vmread(vmcs::control::VMENTRY_CONTROLS)?;
    if long {
        entry |= EntryControls::IA32E_MODE_GUEST.bits();
    } else {
        entry &= !EntryControls::IA32E_MODE_GUEST.bits();
    }
    vmwrite(vmcs::control::VMENTRY_CONTROLS, entry)
}

/// The guest wrote CR4. VMXE stays hidden: the shadow never shows it, the
/// live field always carries it.
fn mov_to_cr4(value: u64) -> Result<(), HvError> {
    vmwrite(vmcs::control::CR4_READ_SHADOW, value & !CR4_VMXE)?;

    let fixed0 = rdmsr(msr::IA32_VMX_CR4_FIXED0);
    let fixed1 = rdmsr(msr::IA32_VMX_CR4_FIXED1);
    vmwrite(vmcs::guest::CR4, (value | fixed0) & fixed1)
}

/// GPR access by hardware index; index 4 is RSP, which lives in the VMCS.
fn read_gpr(vcpu: &Vcpu, gpr: u8) -> Result<u64, HvError> {
    if gpr == 4 {
        return vmread(vmcs::guest::RSP);
    }
    vcpu.regs.read_gpr(gpr).ok_or(HvError::UnhandledVmExit)
}

fn write_gpr(vcpu: &mut Vcpu, gpr: u8, value: u64) -> Result<(), HvError> {
    if gpr == 4 {
        return vmwrite(vmcs::guest::RSP, value);
    }
    vcpu.regs.write_gpr(gpr, value).ok_or(HvError::UnhandledVmExit)
}
