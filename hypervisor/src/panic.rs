//! Panic handling.
//!
//! A panic is the end of the machine: log what we know, dump the registered
//! vCPU if there is one, walk the frame-pointer chain, and halt forever. A
//! second panic while the first is being reported halts immediately so a
//! broken logger cannot recurse.

use {
    crate::intel::vcpu::Vcpu,
    core::sync::atomic::{AtomicBool, AtomicPtr, Ordering},
    log::error,
};

static PANICKING: AtomicBool = AtomicBool::new(false);
static VCPU: AtomicPtr<Vcpu> = AtomicPtr::new(core::ptr::null_mut());

/// Register the vCPU so the panic handler can dump guest state. The pointer
/// must stay valid for the rest of the kernel's life, which it does: the
/// vCPU lives until power-off.
pub fn set_vm(vcpu: &Vcpu) {
    VCPU.store(vcpu as *const Vcpu as *mut Vcpu, Ordering::Release);
}

/// Disable interrupts and halt until the power goes away.
pub fn endless_halt() -> ! {
    x86_64::instructions::interrupts::disable();
    loop {
        x86_64::instructions::hlt();
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    x86_64::instructions::interrupts::disable();

    if PANICKING.swap(true, Ordering::SeqCst) {
        // Recursive panic: the report path itself is broken.
        endless_halt();
    }

    error!("KERNEL PANIC: {}", info.message());
    if let Some(location) = info.location() {
        error!("  at {}:{}", location.file(), location.line());
    }

    let vcpu = VCPU.load(Ordering::Acquire);
    if !vcpu.is_null() {
        unsafe { (*vcpu).dump() };
    }

    backtrace();

    endless_halt()
}

/// Walk the saved-RBP chain. Frames are `[saved rbp][return address]`;
/// the walk stops at a null or implausible frame pointer.
fn backtrace() {
    let mut rbp: u64;
    unsafe {
        core::arch::asm!("mov {}, rbp", out(reg) rbp, options(nomem, nostack, preserves_flags));
    }

    error!("backtrace:");
    for depth in 0..32 {
        if rbp == 0 || rbp % 8 != 0 {
            break;
        }
        let frame = rbp as *const u64;
        let (next, ret) = unsafe { (*frame, *frame.add(1)) };
        if ret == 0 {
            break;
        }
        error!("  #{:02}: {:#018x}", depth, ret);
        if next <= rbp {
            // Frame pointers must strictly grow toward the stack base.
            break;
        }
        rbp = next;
    }
}
