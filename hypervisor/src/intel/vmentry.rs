//! VM-entry and VM-exit trampoline.
//!
//! Two assembly stubs share one stack contract. `asm_vm_entry` is called as
//! a normal Win64 function; a VM-exit lands in `asm_vm_exit` because that
//! address is programmed as `Host.rip`. The exit stub returns to the
//! *caller of `asm_vm_entry`*, so both stubs must agree on the exact frame
//! the entry built:
//!
//! ```text
//!   [return address]      <- pushed by the call into asm_vm_entry
//!   [rbx] [rbp] [rdi]     <- Win64 callee-saved registers, pushed in
//!   [rsi] [r12] [r13]        this order by the entry stub
//!   [r14] [r15]
//!   [&GuestRegisters]     <- save-area pointer; Host.rsp points here
//! ```
//!
//! `Host.rsp` is recorded (via `record_host_rsp`) while RSP points at the
//! save-area slot, so the exit stub wakes up with that exact stack and can
//! pop its way out in mirror order. From the caller's point of view the
//! whole thing is a function that returns 0 after a VM-exit and nonzero
//! when VMLAUNCH/VMRESUME falls through.

use {
    crate::intel::{registers::GuestRegisters, support::vmwrite},
    core::{arch::global_asm, mem::offset_of},
    x86::vmx::vmcs,
};

unsafe extern "win64" {
    /// Enter the guest. `launch_done` selects VMRESUME over VMLAUNCH.
    ///
    /// Returns 0 when control came back through a VM-exit, nonzero when the
    /// entry instruction itself failed (RFLAGS then tells which way).
    pub fn asm_vm_entry(regs: *mut GuestRegisters, launch_done: u64) -> u64;
}

/// Called from the entry stub with the stack pointer that the exit stub
/// must resume on. Keeping this in Rust means the stub does not need to
/// know VMCS field encodings.
extern "win64" fn record_host_rsp(rsp: u64) {
    // A failure here means there is no current VMCS; entry would fault
    // anyway, so surface it now.
    vmwrite(vmcs::host::RSP, rsp).expect("no current VMCS while arming Host.rsp");
}

global_asm!(
    r#"
    .global asm_vm_entry
    .global asm_vm_exit

asm_vm_entry:
    // RCX = &mut GuestRegisters, RDX = launch_done (Win64).
    push    rbx
    push    rbp
    push    rdi
    push    rsi
    push    r12
    push    r13
    push    r14
    push    r15
    push    rcx                     // save-area pointer for the exit stub

    // Stash launch_done in a register that survives the helper call.
    mov     rbx, rdx

    // Host.rsp must be the address of the save-area slot so the exit stub
    // finds the frame exactly as laid out above.
    mov     rcx, rsp
    sub     rsp, 0x20               // Win64 shadow space
    call    {record_host_rsp}
    add     rsp, 0x20

    // Load the guest GPRs. RAX doubles as the save-area base and is
    // loaded last; RBX carries the launch flag so its flags test happens
    // before its guest value is loaded. MOV does not touch RFLAGS, so the
    // ZF from this TEST survives until the branch.
    mov     rax, [rsp]
    test    rbx, rbx
    mov     rcx, [rax + {off_rcx}]
    mov     rdx, [rax + {off_rdx}]
    mov     rbp, [rax + {off_rbp}]
    mov     rsi, [rax + {off_rsi}]
    mov     rdi, [rax + {off_rdi}]
    mov     r8,  [rax + {off_r8}]
    mov     r9,  [rax + {off_r9}]
    mov     r10, [rax + {off_r10}]
    mov     r11, [rax + {off_r11}]
    mov     r12, [rax + {off_r12}]
    mov     r13, [rax + {off_r13}]
    mov     r14, [rax + {off_r14}]
    mov     r15, [rax + {off_r15}]
    mov     rbx, [rax + {off_rbx}]
    mov     rax, [rax + {off_rax}]
    jz      2f
    vmresume
    jmp     3f
2:
    vmlaunch
3:
    // Only reached when the entry instruction failed: the CPU fell through
    // instead of entering the guest. Unwind the frame and report failure;
    // the caller reads RFLAGS context out of the VMCS error field.
    add     rsp, 8                  // drop the save-area pointer
    pop     r15
    pop     r14
    pop     r13
    pop     r12
    pop     rsi
    pop     rdi
    pop     rbp
    pop     rbx
    mov     rax, 1
    ret

asm_vm_exit:
    // Host.rip target. RSP == Host.rsp, pointing at the save-area slot.
    // Guest RAX has nowhere to go until the save-area base is loaded, so
    // park it on the stack first.
    push    rax
    mov     rax, [rsp + 8]          // &mut GuestRegisters
    mov     [rax + {off_rcx}], rcx
    mov     [rax + {off_rdx}], rdx
    mov     [rax + {off_rbx}], rbx
    mov     [rax + {off_rbp}], rbp
    mov     [rax + {off_rsi}], rsi
    mov     [rax + {off_rdi}], rdi
    mov     [rax + {off_r8}],  r8
    mov     [rax + {off_r9}],  r9
    mov     [rax + {off_r10}], r10
    mov     [rax + {off_r11}], r11
    mov     [rax + {off_r12}], r12
    mov     [rax + {off_r13}], r13
    mov     [rax + {off_r14}], r14
    mov     [rax + {off_r15}], r15
    pop     rcx                     // parked guest RAX
    mov     [rax + {off_rax}], rcx
    add     rsp, 8                  // drop the save-area pointer
    pop     r15
    pop     r14
    pop     r13
    pop     r12
    pop     rsi
    pop     rdi
    pop     rbp
    pop     rbx
    xor     eax, eax
    ret
"#,
    record_host_rsp = sym record_host_rsp,
    off_rax = const offset_of!(GuestRegisters, rax),
    off_rcx = const offset_of!(GuestRegisters, rcx),
    off_rdx = const offset_of!(GuestRegisters, rdx),
    off_rbx = const offset_of!(GuestRegisters, rbx),
    off_rbp = const offset_of!(GuestRegisters, rbp),
    off_rsi = const offset_of!(GuestRegisters, rsi),
    off_rdi = const offset_of!(GuestRegisters, rdi),
    off_r8 = const offset_of!(GuestRegisters, r8),
    off_r9 = const offset_of!(GuestRegisters, r9),
    off_r10 = const offset_of!(GuestRegisters, r10),
    off_r11 = const offset_of!(GuestRegisters, r11),
    off_r12 = const offset_of!(GuestRegisters, r12),
    off_r13 = const offset_of!(GuestRegisters, r13),
    off_r14 = const offset_of!(GuestRegisters, r14),
    off_r15 = const offset_of!(GuestRegisters, r15),
);

/// Address of the exit stub, for `Host.rip`.
pub fn vm_exit_handler_address() -> u64 {
    unsafe extern "win64" {
        pub fn asm_vm_exit();
    }
    asm_vm_exit as usize as u64
}
