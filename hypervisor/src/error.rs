//! Crate-wide error type.

use core::fmt;

/// Everything that can go wrong and is worth propagating instead of
/// panicking. Invariant violations (guest-state check failures, boot magic
/// mismatch) panic at the site instead of appearing here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HvError {
    /// The physical page or heap allocation could not be satisfied.
    OutOfMemory,
    /// A VMX instruction failed with RFLAGS.CF set: there was no current
    /// VMCS, or the operand pointer was not a valid VMCS.
    InvalidVmcsPointer,
    /// A VMX instruction failed with RFLAGS.ZF set; the detailed cause is
    /// in the VM-instruction-error VMCS field.
    StatusAvailable,
    /// CPUID reports no VMX support on this processor.
    VmxUnsupported,
    /// Firmware locked IA32_FEATURE_CONTROL with VMXON-outside-SMX clear.
    VmxDisabledByFirmware,
    /// Extended page tables are not supported in the required configuration.
    EptUnsupported,
    /// The guest image does not look like a bzImage we can stage.
    InvalidGuestImage,
    /// The guest image or initrd does not fit into guest memory.
    GuestImageTooLarge,
    /// A VM-exit reason we have no handler for.
    UnhandledVmExit,
}

impl fmt::Display for HvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::OutOfMemory => "out of physical memory",
            Self::InvalidVmcsPointer => "VMX instruction failed: invalid VMCS pointer",
            Self::StatusAvailable => "VMX instruction failed: see VM-instruction error",
            Self::VmxUnsupported => "CPU does not support VMX",
            Self::VmxDisabledByFirmware => "VMX disabled by firmware policy",
            Self::EptUnsupported => "required EPT capabilities missing",
            Self::InvalidGuestImage => "guest image is not a valid bzImage",
            Self::GuestImageTooLarge => "guest image does not fit in guest memory",
            Self::UnhandledVmExit => "unhandled VM-exit reason",
        };
        f.write_str(s)
    }
}
