//! VMM bring-up and the vCPU loop.
//!
//! Everything after platform init funnels through here: carve out guest
//! RAM, stage the Linux image, virtualize, then run the VM-exit dispatch
//! loop until something fatal stops the machine.

use {
    crate::{
        intel::{
            vcpu::Vcpu,
            vmexit::{self, ExitType},
        },
        linux,
        mem::{frame, PAGE_SIZE},
        panic::{self, endless_halt},
    },
    bootinfo::BootInfo,
    core::fmt,
    log::{error, info},
};

use crate::intel::vmerror::VmxBasicExitReason;

/// Guest RAM. One contiguous host buffer; guest-physical zero is its first
/// byte.
const GUEST_MEMORY_SIZE: usize = 128 * 1024 * 1024;

/// Bring up the single vCPU and run it forever.
pub fn launch(boot_info: &'static BootInfo) -> ! {
    let guest_base = match frame::alloc_pages(GUEST_MEMORY_SIZE / PAGE_SIZE) {
        Ok(base) => base,
        Err(e) => panic!("failed to allocate guest RAM: {e:?}"),
    };
    info!(
        "guest RAM: {} MiB at host {:#x}",
        GUEST_MEMORY_SIZE / (1024 * 1024),
        guest_base
    );

    let mut vcpu = match Vcpu::new(guest_base, GUEST_MEMORY_SIZE as u64) {
        Ok(vcpu) => vcpu,
        Err(e) => panic!("failed to create vCPU: {e:?}"),
    };

    let guest_image = unsafe {
        core::slice::from_raw_parts(
            boot_info.guest_info.guest_image as *const u8,
            boot_info.guest_info.guest_size as usize,
        )
    };
    let initrd = (boot_info.guest_info.initrd != 0).then(|| unsafe {
        core::slice::from_raw_parts(
            boot_info.guest_info.initrd as *const u8,
            boot_info.guest_info.initrd_size as usize,
        )
    });

    let bootparam_addr = match linux::stage(vcpu.guest_mem(), guest_image, initrd) {
        Ok(addr) => addr,
        Err(e) => panic!("failed to stage Linux guest: {e:?}"),
    };

    if let Err(e) = vcpu.activate_vmxon() {
        panic!("failed to enter VMX operation: {e:?}");
    }
    if let Err(e) = vcpu.activate_vmcs(bootparam_addr) {
        panic!("failed to activate VMCS: {e:?}");
    }

    panic::set_vm(&vcpu);
    info!("entering guest");

    run_loop(&mut vcpu)
}

/// The VM-exit dispatch loop. Interrupts stay off; the only way out of the
/// guest is an exit, and the only way out of this loop is a fatal one.
fn run_loop(vcpu: &mut Vcpu) -> ! {
    let mut exit_count: u64 = 0;

    loop {
        let reason = match vcpu.run() {
            Ok(reason) => reason,
            Err(e) => fatal_exit(vcpu, format_args!("vCPU run failed: {e:?}")),
        };
        exit_count += 1;

        let handled = match reason {
            VmxBasicExitReason::Cpuid => vmexit::cpuid::handle(vcpu),
            VmxBasicExitReason::Rdmsr => vmexit::msr::handle_rdmsr(vcpu),
            VmxBasicExitReason::Wrmsr => vmexit::msr::handle_wrmsr(vcpu),
            VmxBasicExitReason::ControlRegisterAccesses => vmexit::cr::handle(vcpu),
            VmxBasicExitReason::IoInstruction => vmexit::io::handle(vcpu),
            VmxBasicExitReason::Xsetbv => vmexit::xsetbv::handle(vcpu),
            VmxBasicExitReason::EptViolation => vmexit::ept_violation::handle(vcpu),
            VmxBasicExitReason::Hlt => {
                fatal_exit(vcpu, format_args!("guest halted after {exit_count} exits"))
            }
            VmxBasicExitReason::TripleFault => {
                fatal_exit(vcpu, format_args!("guest triple fault after {exit_count} exits"))
            }
            other => fatal_exit(
                vcpu,
                format_args!("unhandled VM-exit {other:?} after {exit_count} exits"),
            ),
        };

        match handled {
            Ok(ExitType::IncrementRip) => {
                if let Err(e) = vcpu.step_next_inst() {
                    fatal_exit(vcpu, format_args!("failed to step RIP: {e:?}"));
                }
            }
            Ok(ExitType::Continue) => {}
            Err(e) => fatal_exit(vcpu, format_args!("handler for {reason:?} failed: {e:?}")),
        }
    }
}

/// Report an unrecoverable exit, dump the vCPU, and stop the processor.
pub fn fatal_exit(vcpu: &Vcpu, message: fmt::Arguments<'_>) -> ! {
    error!("fatal VM-exit: {message}");
    vcpu.dump();
    endless_halt()
}
