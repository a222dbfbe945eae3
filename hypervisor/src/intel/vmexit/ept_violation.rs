//! EPT violation exit handler.
//!
//! Guest RAM is mapped in full before the first entry and never changes,
//! so a violation means the guest walked off its RAM (or the tables are
//! corrupt). There is no demand paging to fall back on; decode the
//! qualification, dump everything, and stop.

use {
    crate::{
        error::HvError,
        intel::{support::vmread, vcpu::Vcpu, vmerror::EptQualification, vmexit::ExitType},
        vmm::fatal_exit,
    },
    x86::vmx::vmcs,
};

pub fn handle(vcpu: &mut Vcpu) -> Result<ExitType, HvError> {
    let qual = EptQualification::from_raw(vmread(vmcs::ro::EXIT_QUALIFICATION)?);
    let guest_pa = vmread(vmcs::ro::GUEST_PHYSICAL_ADDR_FULL).unwrap_or(!0);
    let guest_la = if qual.linear_valid() {
        vmread(vmcs::ro::GUEST_LINEAR_ADDR).unwrap_or(!0)
    } else {
        !0
    };

    fatal_exit(
        vcpu,
        format_args!(
            "EPT violation at GPA {guest_pa:#x} (linear {guest_la:#x}): {qual:?}"
        ),
    );
}
