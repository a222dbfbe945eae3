//! VMX control field adjustment.
//!
//! Every 32-bit control field has a capability MSR whose low half gives the
//! mandatory-1 bits and whose high half gives the allowed-1 bits. When
//! IA32_VMX_BASIC reports TRUE capability MSRs, those take precedence; they
//! relax some of the default-1 bits.

use {
    crate::intel::support::rdmsr,
    bitflags::bitflags,
    x86::msr,
};

/// IA32_VMX_BASIC bit 55: TRUE capability MSRs are available.
const VMX_BASIC_TRUE_CONTROLS: u64 = 1 << 55;

/// The five adjustable control fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxControl {
    PinBased,
    ProcessorBased,
    ProcessorBased2,
    VmExit,
    VmEntry,
}

/// Fold the capability MSR into a desired control value:
/// `(desired | mandatory_1) & allowed_1`.
pub fn adjust_vmx_controls(control: VmxControl, desired: u64) -> u64 {
    let true_controls = rdmsr(msr::IA32_VMX_BASIC) & VMX_BASIC_TRUE_CONTROLS != 0;

    let cap_msr = match (control, true_controls) {
        (VmxControl::PinBased, true) => msr::IA32_VMX_TRUE_PINBASED_CTLS,
        (VmxControl::PinBased, false) => msr::IA32_VMX_PINBASED_CTLS,
        (VmxControl::ProcessorBased, true) => msr::IA32_VMX_TRUE_PROCBASED_CTLS,
        (VmxControl::ProcessorBased, false) => msr::IA32_VMX_PROCBASED_CTLS,
        // The secondary controls have no TRUE variant.
        (VmxControl::ProcessorBased2, _) => msr::IA32_VMX_PROCBASED_CTLS2,
        (VmxControl::VmExit, true) => msr::IA32_VMX_TRUE_EXIT_CTLS,
        (VmxControl::VmExit, false) => msr::IA32_VMX_EXIT_CTLS,
        (VmxControl::VmEntry, true) => msr::IA32_VMX_TRUE_ENTRY_CTLS,
        (VmxControl::VmEntry, false) => msr::IA32_VMX_ENTRY_CTLS,
    };

    let cap = rdmsr(cap_msr);
    adjust(desired, cap)
}

/// Pure part of the adjustment, split out for the capability math itself.
pub fn adjust(desired: u64, cap: u64) -> u64 {
    let mandatory_1 = cap & 0xFFFF_FFFF;
    let allowed_1 = cap >> 32;
    (desired | mandatory_1) & allowed_1
}

bitflags! {
    /// Primary processor-based VM-execution controls we care about.
    #[derive(Debug, Clone, Copy)]
    pub struct PrimaryControls: u64 {
        const HLT_EXITING = 1 << 7;
        const UNCONDITIONAL_IO_EXITING = 1 << 24;
        const ACTIVATE_SECONDARY_CONTROLS = 1 << 31;
    }
}

bitflags! {
    /// Secondary processor-based VM-execution controls we care about.
    #[derive(Debug, Clone, Copy)]
    pub struct SecondaryControls: u64 {
        const ENABLE_EPT = 1 << 1;
        const UNRESTRICTED_GUEST = 1 << 7;
    }
}

bitflags! {
    /// VM-exit controls we care about.
    #[derive(Debug, Clone, Copy)]
    pub struct ExitControls: u64 {
        const HOST_ADDRESS_SPACE_SIZE = 1 << 9;
        const SAVE_IA32_EFER = 1 << 20;
        const LOAD_IA32_EFER = 1 << 21;
    }
}

bitflags! {
    /// VM-entry controls we care about.
    #[derive(Debug, Clone, Copy)]
    pub struct EntryControls: u64 {
        const IA32E_MODE_GUEST = 1 << 9;
        const LOAD_IA32_EFER = 1 << 15;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mandatory_bits_are_forced_on() {
        // Capability: bits 0/1 mandatory, bits 0..8 allowed.
        let cap = 0x0000_00FF_0000_0003u64;
        assert_eq!(adjust(0, cap), 0x3);
    }

    #[test]
    fn disallowed_bits_are_stripped() {
        let cap = 0x0000_00FF_0000_0003u64;
        assert_eq!(adjust(1 << 12, cap), 0x3);
        assert_eq!(adjust(1 << 4, cap), 0x13);
    }

    #[test]
    fn allowed_desired_bits_survive() {
        let cap = 0xFFFF_FFFF_0000_0000u64;
        let desired = PrimaryControls::HLT_EXITING.bits()
            | PrimaryControls::UNCONDITIONAL_IO_EXITING.bits();
        assert_eq!(adjust(desired, cap), desired);
    }
}
