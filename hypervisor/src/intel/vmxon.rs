//! VMX enablement and the VMXON region.

use {
    crate::{
        error::HvError,
        intel::support::{self, rdmsr, wrmsr},
    },
    bit_field::BitField,
    log::debug,
    x86::msr,
};

/// IA32_FEATURE_CONTROL lock bit.
const FEATURE_CONTROL_LOCKED: u64 = 1 << 0;
/// IA32_FEATURE_CONTROL: VMXON allowed outside SMX operation.
const FEATURE_CONTROL_VMXON_OUTSIDE_SMX: u64 = 1 << 2;

/// The VMXON region handed to the VMXON instruction. 4 KiB, page aligned,
/// first 31 bits hold the VMCS revision identifier.
#[repr(C, align(4096))]
pub struct Vmxon {
    pub revision_id: u32,
    data: [u8; 4092],
}

static_assertions::const_assert_eq!(core::mem::size_of::<Vmxon>(), 4096);

impl Vmxon {
    /// Stamp the revision identifier from IA32_VMX_BASIC. Bit 31 must stay
    /// clear.
    pub fn init(&mut self) {
        let mut revision = rdmsr(msr::IA32_VMX_BASIC) as u32;
        revision.set_bit(31, false);
        self.revision_id = revision;
    }
}

/// Put the processor into a state where VMXON is legal.
///
/// Ordering is fixed: CR0/CR4 first (the fixed-bit MSRs apply to VMX
/// operation as a whole), then the firmware policy in
/// IA32_FEATURE_CONTROL, then CR4.VMXE.
pub fn enable_vmx() -> Result<(), HvError> {
    if !cpu_has_vmx() {
        return Err(HvError::VmxUnsupported);
    }

    adjust_fixed_control_registers();
    adjust_feature_control()?;

    // CR4.VMXE, bit 13.
    support::cr4_write(support::cr4() | (1 << 13));

    debug!("VMX operation enabled");
    Ok(())
}

fn cpu_has_vmx() -> bool {
    x86::cpuid::CpuId::new()
        .get_feature_info()
        .map(|fi| fi.has_vmx())
        .unwrap_or(false)
}

/// Force CR0 and CR4 to satisfy the VMX fixed bits: mandatory-1 bits are
/// OR'd in, mandatory-0 bits are AND'd out.
fn adjust_fixed_control_registers() {
    let fixed0 = rdmsr(msr::IA32_VMX_CR0_FIXED0);
    let fixed1 = rdmsr(msr::IA32_VMX_CR0_FIXED1);
    support::cr0_write((support::cr0() | fixed0) & fixed1);

    let fixed0 = rdmsr(msr::IA32_VMX_CR4_FIXED0);
    let fixed1 = rdmsr(msr::IA32_VMX_CR4_FIXED1);
    support::cr4_write((support::cr4() | fixed0) & fixed1);
}

/// Honor the IA32_FEATURE_CONTROL policy. If the firmware locked the MSR
/// with VMXON-outside-SMX clear there is nothing we can do; otherwise set
/// and lock it ourselves.
fn adjust_feature_control() -> Result<(), HvError> {
    let value = rdmsr(msr::IA32_FEATURE_CONTROL);

    if value & FEATURE_CONTROL_LOCKED != 0 {
        if value & FEATURE_CONTROL_VMXON_OUTSIDE_SMX == 0 {
            return Err(HvError::VmxDisabledByFirmware);
        }
        return Ok(());
    }

    wrmsr(
        msr::IA32_FEATURE_CONTROL,
        value | FEATURE_CONTROL_LOCKED | FEATURE_CONTROL_VMXON_OUTSIDE_SMX,
    );
    Ok(())
}
