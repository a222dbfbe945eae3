//! Intel VT-x virtualization core.
//!
//! Everything that talks to the VMX hardware lives here: the instruction
//! wrappers, the VMXON/VMCS regions, the control and state setup mandated
//! by the SDM, the pre-entry guest-state validation gate, the entry/exit
//! trampoline, the extended page tables, and the per-reason exit handlers.

pub mod check;
pub mod controls;
pub mod ept;
pub mod registers;
pub mod segmentation;
pub mod support;
pub mod vcpu;
pub mod vmcs;
pub mod vmentry;
pub mod vmerror;
pub mod vmexit;
pub mod vmxon;
