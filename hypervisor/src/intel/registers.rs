//! Guest general-purpose register save area.

/// The fifteen guest GPRs that the entry/exit trampoline loads and spills.
///
/// RSP is deliberately absent: the hardware saves and restores guest RSP
/// through the VMCS on every transition, and keeping a second copy here
/// would only invite the two going out of sync. Between entries this
/// struct is the ground truth for everything else.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct GuestRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

static_assertions::const_assert_eq!(core::mem::size_of::<GuestRegisters>(), 15 * 8);

impl GuestRegisters {
    /// Read a register by the hardware GPR encoding used in exit
    /// qualifications (0 = RAX .. 15 = R15). Index 4 is RSP, which lives
    /// in the VMCS; callers must fetch it from there.
    pub fn read_gpr(&self, index: u8) -> Option<u64> {
        Some(match index {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            15 => self.r15,
            _ => return None,
        })
    }

    /// Write a register by the hardware GPR encoding. Index 4 (RSP) is
    /// rejected for the same reason [`Self::read_gpr`] skips it.
    pub fn write_gpr(&mut self, index: u8, value: u64) -> Option<()> {
        match index {
            0 => self.rax = value,
            1 => self.rcx = value,
            2 => self.rdx = value,
            3 => self.rbx = value,
            5 => self.rbp = value,
            6 => self.rsi = value,
            7 => self.rdi = value,
            8 => self.r8 = value,
            9 => self.r9 = value,
            10 => self.r10 = value,
            11 => self.r11 = value,
            12 => self.r12 = value,
            13 => self.r13 = value,
            14 => self.r14 = value,
            15 => self.r15 = value,
            _ => return None,
        }
        Some(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsp_is_not_addressable() {
        let mut regs = GuestRegisters::default();
        assert_eq!(regs.read_gpr(4), None);
        assert_eq!(regs.write_gpr(4, 0xdead), None);
    }

    #[test]
    fn gpr_encoding_round_trip() {
        let mut regs = GuestRegisters::default();
        for index in (0u8..16).filter(|i| *i != 4) {
            regs.write_gpr(index, 0x1000 + index as u64).unwrap();
        }
        for index in (0u8..16).filter(|i| *i != 4) {
            assert_eq!(regs.read_gpr(index), Some(0x1000 + index as u64));
        }
    }
}
