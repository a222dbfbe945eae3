//! VMCS region and field setup.
//!
//! The four field groups of SDM Vol 3C 27.2: execution controls, exit and
//! entry controls, host state, and guest state. The guest starts where a
//! bzImage expects to start: flat 32-bit protected mode, paging off,
//! RIP at the 1 MiB kernel base and RSI pointing at the boot-parameter
//! block.

use {
    crate::{
        error::HvError,
        gdt,
        intel::{
            controls::{
                adjust_vmx_controls, EntryControls, ExitControls, PrimaryControls,
                SecondaryControls, VmxControl,
            },
            registers::GuestRegisters,
            segmentation::SegmentRights,
            support::{cr0, cr3, cr4, rdmsr, sgdt, sidt, vmwrite},
            vmentry,
        },
    },
    bit_field::BitField,
    log::debug,
    x86::{
        msr,
        segmentation::{cs, ds, es, fs, gs, ss},
        vmx::vmcs,
    },
};

/// Where the staged guest begins execution: the Linux protected-mode
/// kernel base.
pub const GUEST_KERNEL_BASE: u64 = 0x10_0000;

/// Recognizable marker written to the (never dereferenced) guest LDTR
/// base, so a state dump that still shows it proves the initial state was
/// never reloaded by the guest.
const LDTR_BASE_SENTINEL: u64 = 0xDEAD00;

/// Dedicated VM-exit stack. `Host.rsp` is re-armed to the live entry frame
/// before every launch; this is only the initial value programmed at setup
/// so the field is never garbage.
const EXIT_STACK_SIZE: usize = 8 * 4096;

#[repr(C, align(4096))]
struct ExitStack([u8; EXIT_STACK_SIZE]);

static mut EXIT_STACK: ExitStack = ExitStack([0; EXIT_STACK_SIZE]);

/// Initial guest CR0: PE, ET, NE. Paging off.
const GUEST_CR0_INIT: u64 = 0x1 | 0x10 | 0x20;
/// Initial guest CR4: VMXE only, which VMX operation itself mandates.
const GUEST_CR4_INIT: u64 = 1 << 13;

/// The VMCS region: revision identifier, abort indicator, and the
/// implementation-defined data area.
#[repr(C, align(4096))]
pub struct Vmcs {
    pub revision_id: u32,
    pub abort_indicator: u32,
    data: [u8; 4088],
}

static_assertions::const_assert_eq!(core::mem::size_of::<Vmcs>(), 4096);

impl Vmcs {
    /// Stamp the revision identifier from IA32_VMX_BASIC, bit 31 clear.
    pub fn init(&mut self) {
        let mut revision = rdmsr(msr::IA32_VMX_BASIC) as u32;
        revision.set_bit(31, false);
        self.revision_id = revision;
        self.abort_indicator = 0;
    }
}

/// Program the pin-based, processor-based, exit, and entry controls, plus
/// the EPT pointer and the CR shadows.
pub fn setup_control_fields(eptp: u64) -> Result<(), HvError> {
    use x86::vmx::vmcs::control;

    // Pin-based: nothing beyond what the capability MSR mandates.
    vmwrite(
        control::PINBASED_EXEC_CONTROLS,
        adjust_vmx_controls(VmxControl::PinBased, 0),
    )?;

    // Primary processor-based: secondary controls on, every I/O access
    // exits, HLT exits.
    vmwrite(
        control::PRIMARY_PROCBASED_EXEC_CONTROLS,
        adjust_vmx_controls(
            VmxControl::ProcessorBased,
            (PrimaryControls::ACTIVATE_SECONDARY_CONTROLS
                | PrimaryControls::UNCONDITIONAL_IO_EXITING
                | PrimaryControls::HLT_EXITING)
                .bits(),
        ),
    )?;

    // Secondary: EPT plus unrestricted guest, which is what lets the guest
    // run unpaged 32-bit code.
    vmwrite(
        control::SECONDARY_PROCBASED_EXEC_CONTROLS,
        adjust_vmx_controls(
            VmxControl::ProcessorBased2,
            (SecondaryControls::ENABLE_EPT | SecondaryControls::UNRESTRICTED_GUEST).bits(),
        ),
    )?;

    // Exit: back to 64-bit host, swap EFER both ways.
    vmwrite(
        control::VMEXIT_CONTROLS,
        adjust_vmx_controls(
            VmxControl::VmExit,
            (ExitControls::HOST_ADDRESS_SPACE_SIZE
                | ExitControls::SAVE_IA32_EFER
                | ExitControls::LOAD_IA32_EFER)
                .bits(),
        ),
    )?;

    // Entry: 32-bit guest (no IA-32e), load its EFER image.
    vmwrite(
        control::VMENTRY_CONTROLS,
        adjust_vmx_controls(VmxControl::VmEntry, EntryControls::LOAD_IA32_EFER.bits()),
    )?;

    // Trap every CR0/CR4 bit; the shadows mirror the initial guest view.
    // The shadow CR4 hides VMXE from the guest.
    vmwrite(control::CR0_GUEST_HOST_MASK, !0u64)?;
    vmwrite(control::CR4_GUEST_HOST_MASK, !0u64)?;
    vmwrite(control::CR0_READ_SHADOW, GUEST_CR0_INIT)?;
    vmwrite(control::CR4_READ_SHADOW, 0)?;

    vmwrite(control::VMEXIT_MSR_STORE_COUNT, 0)?;
    vmwrite(control::VMEXIT_MSR_LOAD_COUNT, 0)?;
    vmwrite(control::VMENTRY_MSR_LOAD_COUNT, 0)?;
    vmwrite(control::VMENTRY_INTERRUPTION_INFO_FIELD, 0)?;

    vmwrite(control::EPTP_FULL, eptp)?;

    debug!("VMCS control fields programmed, EPTP {:#x}", eptp);
    Ok(())
}

/// Snapshot the host into the VMCS: the state the CPU reloads on every
/// VM exit.
pub fn setup_host_state() -> Result<(), HvError> {
    use x86::vmx::vmcs::host;

    vmwrite(host::CR0, cr0())?;
    vmwrite(host::CR3, cr3())?;
    vmwrite(host::CR4, cr4())?;

    // Host selector fields must have RPL and TI clear.
    vmwrite(host::CS_SELECTOR, (cs().bits() & !0x7) as u64)?;
    vmwrite(host::SS_SELECTOR, (ss().bits() & !0x7) as u64)?;
    vmwrite(host::DS_SELECTOR, (ds().bits() & !0x7) as u64)?;
    vmwrite(host::ES_SELECTOR, (es().bits() & !0x7) as u64)?;
    vmwrite(host::FS_SELECTOR, (fs().bits() & !0x7) as u64)?;
    vmwrite(host::GS_SELECTOR, (gs().bits() & !0x7) as u64)?;
    vmwrite(host::TR_SELECTOR, (gdt::kernel_tr() & !0x7) as u64)?;

    vmwrite(host::FS_BASE, rdmsr(msr::IA32_FS_BASE))?;
    vmwrite(host::GS_BASE, rdmsr(msr::IA32_GS_BASE))?;
    vmwrite(host::TR_BASE, gdt::tss_base())?;
    vmwrite(host::GDTR_BASE, sgdt().base as u64)?;
    vmwrite(host::IDTR_BASE, sidt().base as u64)?;

    vmwrite(host::IA32_EFER_FULL, rdmsr(msr::IA32_EFER))?;
    vmwrite(host::IA32_SYSENTER_CS, rdmsr(msr::IA32_SYSENTER_CS))?;
    vmwrite(host::IA32_SYSENTER_ESP, rdmsr(msr::IA32_SYSENTER_ESP))?;
    vmwrite(host::IA32_SYSENTER_EIP, rdmsr(msr::IA32_SYSENTER_EIP))?;

    // Exits land in the assembly stub. The stack value is re-armed before
    // each entry; program a sane initial one anyway.
    vmwrite(host::RIP, vmentry::vm_exit_handler_address())?;
    let exit_stack_top =
        unsafe { core::ptr::addr_of!(EXIT_STACK) } as u64 + EXIT_STACK_SIZE as u64;
    vmwrite(host::RSP, exit_stack_top)?;

    debug!("VMCS host state captured");
    Ok(())
}

/// Program the guest to the state a bzImage's 32-bit entry point expects.
pub fn setup_guest_state(regs: &GuestRegisters) -> Result<(), HvError> {
    use x86::vmx::vmcs::guest;

    vmwrite(guest::CR0, GUEST_CR0_INIT)?;
    vmwrite(guest::CR3, 0)?;
    vmwrite(guest::CR4, GUEST_CR4_INIT)?;
    vmwrite(guest::IA32_EFER_FULL, 0)?;
    vmwrite(guest::IA32_PAT_FULL, 0x0007_0406_0007_0406)?;
    vmwrite(guest::DR7, 0x400)?;
    vmwrite(guest::IA32_DEBUGCTL_FULL, 0)?;
    vmwrite(guest::IA32_SYSENTER_CS, 0)?;
    vmwrite(guest::IA32_SYSENTER_ESP, 0)?;
    vmwrite(guest::IA32_SYSENTER_EIP, 0)?;

    // Flat 4 GiB segments, selector 0, base 0. TR and LDTR are byte
    // granular with 16-bit limits, which is what their system descriptors
    // would really contain.
    for (selector, base, limit, rights) in [
        (guest::CS_SELECTOR, guest::CS_BASE, guest::CS_LIMIT, guest::CS_ACCESS_RIGHTS),
        (guest::SS_SELECTOR, guest::SS_BASE, guest::SS_LIMIT, guest::SS_ACCESS_RIGHTS),
        (guest::DS_SELECTOR, guest::DS_BASE, guest::DS_LIMIT, guest::DS_ACCESS_RIGHTS),
        (guest::ES_SELECTOR, guest::ES_BASE, guest::ES_LIMIT, guest::ES_ACCESS_RIGHTS),
        (guest::FS_SELECTOR, guest::FS_BASE, guest::FS_LIMIT, guest::FS_ACCESS_RIGHTS),
        (guest::GS_SELECTOR, guest::GS_BASE, guest::GS_LIMIT, guest::GS_ACCESS_RIGHTS),
    ] {
        let is_code = selector == guest::CS_SELECTOR;
        vmwrite(selector, 0)?;
        vmwrite(base, 0)?;
        vmwrite(limit, 0xFFFF_FFFF)?;
        let seg_rights = if is_code {
            SegmentRights::flat_code()
        } else {
            SegmentRights::flat_data()
        };
        vmwrite(rights, seg_rights.bits() as u64)?;
    }

    vmwrite(guest::TR_SELECTOR, 0)?;
    vmwrite(guest::TR_BASE, 0)?;
    vmwrite(guest::TR_LIMIT, 0xFFFF)?;
    vmwrite(guest::TR_ACCESS_RIGHTS, SegmentRights::task_register().bits() as u64)?;

    vmwrite(guest::LDTR_SELECTOR, 0)?;
    vmwrite(guest::LDTR_BASE, LDTR_BASE_SENTINEL)?;
    vmwrite(guest::LDTR_LIMIT, 0xFFFF)?;
    vmwrite(guest::LDTR_ACCESS_RIGHTS, SegmentRights::ldtr().bits() as u64)?;

    vmwrite(guest::GDTR_BASE, 0)?;
    vmwrite(guest::GDTR_LIMIT, 0)?;
    vmwrite(guest::IDTR_BASE, 0)?;
    vmwrite(guest::IDTR_LIMIT, 0)?;

    vmwrite(guest::RIP, GUEST_KERNEL_BASE)?;
    vmwrite(guest::RSP, 0)?;
    // Bit 1 is the only architecturally-set bit at reset.
    vmwrite(guest::RFLAGS, 0x2)?;

    vmwrite(guest::ACTIVITY_STATE, 0)?;
    vmwrite(guest::INTERRUPTIBILITY_STATE, 0)?;
    vmwrite(guest::PENDING_DBG_EXCEPTIONS, 0)?;
    vmwrite(guest::LINK_PTR_FULL, !0u64)?;

    debug!(
        "VMCS guest state staged: RIP={:#x} RSI={:#x}",
        GUEST_KERNEL_BASE, regs.rsi
    );
    Ok(())
}
