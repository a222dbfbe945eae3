//! The virtual CPU.
//!
//! One vCPU drives one guest on one logical processor. The design is
//! single-CPU throughout: bringing up more processors would need one
//! `Vcpu` per logical processor (keyed by APIC id) and per-processor
//! VMXON regions, none of which exists yet.

use {
    crate::{
        error::HvError,
        intel::{
            check::partial_check_guest,
            ept::Ept,
            registers::GuestRegisters,
            support::{vmclear, vmptrld, vmread, vmwrite, vmxon},
            vmcs::{self, Vmcs},
            vmentry::asm_vm_entry,
            vmerror::{ExitReason, VmInstructionError, VmxBasicExitReason},
            vmxon::{enable_vmx, Vmxon},
        },
    },
    alloc::boxed::Box,
    log::{debug, error, info},
    x86::vmx::vmcs as vmcs_fields,
    x86_64::instructions::interrupts,
};

/// Per-guest virtual CPU state.
pub struct Vcpu {
    /// VMXON region, current on this processor from VMXON to VMXOFF.
    vmxon_region: Box<Vmxon>,
    /// VMCS region, current from the first VMPTRLD onward.
    vmcs_region: Box<Vmcs>,
    /// Guest GPR save area. RSP lives in the VMCS, never here.
    pub regs: GuestRegisters,
    /// False until the first successful VMLAUNCH, true ever after.
    pub launch_done: bool,
    /// Guest-physical to host-physical translation.
    ept: Ept,
    /// Host-physical base of the buffer backing guest RAM.
    guest_base: u64,
    /// Size of guest RAM in bytes.
    guest_size: u64,
}

impl Vcpu {
    /// Create a vCPU over an already-allocated guest-RAM buffer.
    pub fn new(guest_base: u64, guest_size: u64) -> Result<Self, HvError> {
        Ok(Self {
            vmxon_region: unsafe { Box::<Vmxon>::new_zeroed().assume_init() },
            vmcs_region: unsafe { Box::<Vmcs>::new_zeroed().assume_init() },
            regs: GuestRegisters::default(),
            launch_done: false,
            ept: Ept::new()?,
            guest_base,
            guest_size,
        })
    }

    /// The guest-RAM buffer as a slice. Guest physical address 0 is byte 0.
    pub fn guest_mem(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.guest_base as *mut u8, self.guest_size as usize) }
    }

    /// Host-physical base of guest RAM.
    pub fn guest_base(&self) -> u64 {
        self.guest_base
    }

    /// Enter VMX root operation: enable VMX, stamp the VMXON region, and
    /// execute VMXON. Interrupts are held off across the whole sequence.
    pub fn activate_vmxon(&mut self) -> Result<(), HvError> {
        interrupts::disable();

        enable_vmx()?;
        self.vmxon_region.init();

        let pa = &*self.vmxon_region as *const Vmxon as u64;
        vmxon(pa)?;

        info!("VMX root operation entered, VMXON region at {:#x}", pa);
        Ok(())
    }

    /// Make the VMCS current (VMCLEAR then VMPTRLD) and program all four
    /// field groups.
    pub fn activate_vmcs(&mut self, bootparam_addr: u64) -> Result<(), HvError> {
        self.vmcs_region.init();

        let pa = &*self.vmcs_region as *const Vmcs as u64;
        vmclear(pa)?;
        vmptrld(pa)?;
        debug!("VMCS at {:#x} is current", pa);

        // The guest sees its RAM starting at guest-physical zero.
        self.ept.map_range(0, self.guest_base, self.guest_size)?;

        // Linux protected-mode entry convention: RSI points at the
        // boot-parameter block.
        self.regs = GuestRegisters::default();
        self.regs.rsi = bootparam_addr;

        vmcs::setup_control_fields(self.ept.eptp())?;
        vmcs::setup_host_state()?;
        vmcs::setup_guest_state(&self.regs)?;

        Ok(())
    }

    /// Run the guest until the next VM-exit and decode why it stopped.
    ///
    /// The guest-state gate runs first on every call; a state that fails
    /// it must never reach the hardware.
    pub fn run(&mut self) -> Result<VmxBasicExitReason, HvError> {
        partial_check_guest()?;

        let status = unsafe { asm_vm_entry(&mut self.regs, self.launch_done as u64) };

        if status != 0 {
            // The entry instruction fell through. With a current VMCS the
            // cause is in the instruction-error field; without one even
            // that read fails.
            let raw = vmread(vmcs_fields::ro::VM_INSTRUCTION_ERROR).unwrap_or(0) as u32;
            match VmInstructionError::from_u32(raw) {
                Some(decoded) => panic!("VM entry failed: {decoded:?}"),
                None => panic!("VM entry failed: unknown instruction error {raw}"),
            }
        }

        // A VM-exit after VMLAUNCH means the launch succeeded; this is the
        // only place the flag ever flips.
        if !self.launch_done {
            self.launch_done = true;
            debug!("first VM-entry complete");
        }

        let reason = ExitReason::from_raw(vmread(vmcs_fields::ro::EXIT_REASON)? as u32);
        if reason.entry_failure() {
            self.dump();
            panic!(
                "VM-entry failure, basic reason {} qualification {:#x}",
                reason.basic(),
                vmread(vmcs_fields::ro::EXIT_QUALIFICATION).unwrap_or(0),
            );
        }

        reason.basic_reason().ok_or_else(|| {
            error!("unknown VM-exit reason {:#x}", reason.bits());
            HvError::UnhandledVmExit
        })
    }

    /// Advance guest RIP past the instruction that caused the exit.
    pub fn step_next_inst(&mut self) -> Result<(), HvError> {
        let rip = vmread(vmcs_fields::guest::RIP)?;
        let len = vmread(vmcs_fields::ro::VMEXIT_INSTRUCTION_LEN)?;
        vmwrite(vmcs_fields::guest::RIP, rip + len)
    }

    /// Log everything a post-mortem needs. Used by the panic handler and
    /// the fatal exit paths; must not itself fail.
    pub fn dump(&self) {
        let read = |field: u32| vmread(field).unwrap_or(!0u64);

        error!("=== vCPU state ===");
        error!(
            "RIP={:#018x} RSP={:#018x} RFLAGS={:#018x}",
            read(vmcs_fields::guest::RIP),
            read(vmcs_fields::guest::RSP),
            read(vmcs_fields::guest::RFLAGS),
        );
        error!("RAX={:#018x} RBX={:#018x} RCX={:#018x}", self.regs.rax, self.regs.rbx, self.regs.rcx);
        error!("RDX={:#018x} RSI={:#018x} RDI={:#018x}", self.regs.rdx, self.regs.rsi, self.regs.rdi);
        error!("RBP={:#018x} R8 ={:#018x} R9 ={:#018x}", self.regs.rbp, self.regs.r8, self.regs.r9);
        error!("R10={:#018x} R11={:#018x} R12={:#018x}", self.regs.r10, self.regs.r11, self.regs.r12);
        error!("R13={:#018x} R14={:#018x} R15={:#018x}", self.regs.r13, self.regs.r14, self.regs.r15);
        error!(
            "CR0={:#018x} CR3={:#018x} CR4={:#018x}",
            read(vmcs_fields::guest::CR0),
            read(vmcs_fields::guest::CR3),
            read(vmcs_fields::guest::CR4),
        );
        error!(
            "EFER={:#018x} CS={:#06x} base={:#x} limit={:#x}",
            read(vmcs_fields::guest::IA32_EFER_FULL),
            read(vmcs_fields::guest::CS_SELECTOR),
            read(vmcs_fields::guest::CS_BASE),
            read(vmcs_fields::guest::CS_LIMIT),
        );
        error!(
            "guest RAM: base={:#x} size={} MiB, launch_done={}",
            self.guest_base,
            self.guest_size / (1024 * 1024),
            self.launch_done,
        );
    }
}
