//! Decoders for the read-only VMX reporting fields.
//!
//! Exit reasons, VM-instruction errors, and the per-reason exit
//! qualifications, all straight from the SDM Vol 3C tables. These are pure
//! value types so the dispatcher and the panic paths can decode without
//! touching hardware.

use bitfield::bitfield;

/// Basic VM-exit reasons (SDM Vol 3C, Appendix C). Only reasons that a
/// Linux guest can plausibly produce on this configuration are named; the
/// dispatcher treats everything else as fatal anyway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum VmxBasicExitReason {
    ExceptionOrNmi = 0,
    ExternalInterrupt = 1,
    TripleFault = 2,
    InitSignal = 3,
    StartupIpi = 4,
    Cpuid = 10,
    Getsec = 11,
    Hlt = 12,
    Invd = 13,
    Invlpg = 14,
    Rdpmc = 15,
    Rdtsc = 16,
    Vmcall = 18,
    Vmclear = 19,
    Vmlaunch = 20,
    Vmptrld = 21,
    Vmptrst = 22,
    Vmread = 23,
    Vmresume = 24,
    Vmwrite = 25,
    Vmxoff = 26,
    Vmxon = 27,
    ControlRegisterAccesses = 28,
    MovDr = 29,
    IoInstruction = 30,
    Rdmsr = 31,
    Wrmsr = 32,
    VmEntryFailureInvalidGuestState = 33,
    VmEntryFailureMsrLoading = 34,
    MonitorTrapFlag = 37,
    Monitor = 39,
    Pause = 40,
    VmEntryFailureMachineCheck = 41,
    EptViolation = 48,
    EptMisconfiguration = 49,
    Invept = 50,
    Rdtscp = 51,
    Invvpid = 53,
    Wbinvd = 54,
    Xsetbv = 55,
}

impl VmxBasicExitReason {
    pub fn from_u16(basic: u16) -> Option<Self> {
        use VmxBasicExitReason::*;
        Some(match basic {
            0 => ExceptionOrNmi,
            1 => ExternalInterrupt,
            2 => TripleFault,
            3 => InitSignal,
            4 => StartupIpi,
            10 => Cpuid,
            11 => Getsec,
            12 => Hlt,
            13 => Invd,
            14 => Invlpg,
            15 => Rdpmc,
            16 => Rdtsc,
            18 => Vmcall,
            19 => Vmclear,
            20 => Vmlaunch,
            21 => Vmptrld,
            22 => Vmptrst,
            23 => Vmread,
            24 => Vmresume,
            25 => Vmwrite,
            26 => Vmxoff,
            27 => Vmxon,
            28 => ControlRegisterAccesses,
            29 => MovDr,
            30 => IoInstruction,
            31 => Rdmsr,
            32 => Wrmsr,
            33 => VmEntryFailureInvalidGuestState,
            34 => VmEntryFailureMsrLoading,
            37 => MonitorTrapFlag,
            39 => Monitor,
            40 => Pause,
            41 => VmEntryFailureMachineCheck,
            48 => EptViolation,
            49 => EptMisconfiguration,
            50 => Invept,
            51 => Rdtscp,
            53 => Invvpid,
            54 => Wbinvd,
            55 => Xsetbv,
            _ => return None,
        })
    }
}

bitfield! {
    /// The raw exit-reason field: basic reason in the low 16 bits plus the
    /// flag bits above.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct ExitReason(u32);
    impl Debug;

    pub u16, basic, set_basic: 15, 0;
    pub pending_mtf, _: 26;
    pub exit_from_vmx_root, _: 27;
    pub entry_failure, set_entry_failure: 31;
}

impl ExitReason {
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn basic_reason(self) -> Option<VmxBasicExitReason> {
        VmxBasicExitReason::from_u16(self.basic())
    }
}

/// VM-instruction errors (SDM Vol 3C 31.4, Table 31-1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum VmInstructionError {
    VmcallInVmxRoot = 1,
    VmclearInvalidAddress = 2,
    VmclearVmxonPointer = 3,
    VmlaunchNonClearVmcs = 4,
    VmresumeNonLaunchedVmcs = 5,
    VmresumeAfterVmxoff = 6,
    EntryInvalidControlFields = 7,
    EntryInvalidHostState = 8,
    VmptrldInvalidAddress = 9,
    VmptrldVmxonPointer = 10,
    VmptrldIncorrectRevision = 11,
    UnsupportedVmcsField = 12,
    WriteToReadOnlyField = 13,
    VmxonInVmxRoot = 15,
    EntryInvalidExecutiveVmcs = 16,
    EntryNonLaunchedExecutiveVmcs = 17,
    EntryExecutiveVmcsNotVmxon = 18,
    VmcallNonClearVmcs = 19,
    VmcallInvalidExitControlFields = 20,
    VmcallIncorrectMsegRevision = 22,
    VmxoffUnderDualMonitor = 23,
    VmcallInvalidSmmMonitorFeatures = 24,
    EntryInvalidExecControlsSmm = 25,
    EntryEventsBlockedByMovSs = 26,
    InvalidOperandInveptInvvpid = 28,
}

impl VmInstructionError {
    pub fn from_u32(value: u32) -> Option<Self> {
        use VmInstructionError::*;
        Some(match value {
            1 => VmcallInVmxRoot,
            2 => VmclearInvalidAddress,
            3 => VmclearVmxonPointer,
            4 => VmlaunchNonClearVmcs,
            5 => VmresumeNonLaunchedVmcs,
            6 => VmresumeAfterVmxoff,
            7 => EntryInvalidControlFields,
            8 => EntryInvalidHostState,
            9 => VmptrldInvalidAddress,
            10 => VmptrldVmxonPointer,
            11 => VmptrldIncorrectRevision,
            12 => UnsupportedVmcsField,
            13 => WriteToReadOnlyField,
            15 => VmxonInVmxRoot,
            16 => EntryInvalidExecutiveVmcs,
            17 => EntryNonLaunchedExecutiveVmcs,
            18 => EntryExecutiveVmcsNotVmxon,
            19 => VmcallNonClearVmcs,
            20 => VmcallInvalidExitControlFields,
            22 => VmcallIncorrectMsegRevision,
            23 => VmxoffUnderDualMonitor,
            24 => VmcallInvalidSmmMonitorFeatures,
            25 => EntryInvalidExecControlsSmm,
            26 => EntryEventsBlockedByMovSs,
            28 => InvalidOperandInveptInvvpid,
            _ => return None,
        })
    }
}

bitfield! {
    /// Exit qualification for I/O instructions (SDM Vol 3C, Table 28-5).
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct IoQualification(u64);
    impl Debug;

    /// Access size minus one: 0, 1, or 3.
    pub size_code, set_size_code: 2, 0;
    /// Set for IN/INS, clear for OUT/OUTS.
    pub input, set_input: 3;
    /// String instruction (INS/OUTS).
    pub string, set_string: 4;
    /// REP prefixed.
    pub rep, set_rep: 5;
    /// Operand came from an immediate rather than DX.
    pub immediate, set_immediate: 6;
    /// Port number.
    pub u16, port, set_port: 31, 16;
}

impl IoQualification {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Access width in bytes.
    pub fn width(self) -> u64 {
        self.size_code() + 1
    }
}

/// Which control register a CR-access exit touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrAccessReg {
    Cr0,
    Cr3,
    Cr4,
    Cr8,
    Other(u8),
}

/// How the guest touched the register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrAccessType {
    MovToCr,
    MovFromCr,
    Clts,
    Lmsw,
}

bitfield! {
    /// Raw CR-access qualification (SDM Vol 3C, Table 28-3).
    #[derive(Clone, Copy, PartialEq, Eq)]
    struct CrQualificationBits(u64);
    impl Debug;

    cr_number, _: 3, 0;
    access_type, _: 5, 4;
    lmsw_memory_operand, _: 6;
    gpr, _: 11, 8;
    u16, lmsw_source, _: 31, 16;
}

/// Decoded CR-access qualification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrQualification {
    pub reg: CrAccessReg,
    pub access: CrAccessType,
    /// Source or destination GPR index for MOV forms (0 = RAX .. 15 = R15,
    /// RSP included per the hardware encoding).
    pub gpr: u8,
    /// The low 16 bits of the LMSW source operand.
    pub lmsw_source: u16,
}

impl CrQualification {
    pub fn from_raw(raw: u64) -> Self {
        let bits = CrQualificationBits(raw);
        let reg = match bits.cr_number() {
            0 => CrAccessReg::Cr0,
            3 => CrAccessReg::Cr3,
            4 => CrAccessReg::Cr4,
            8 => CrAccessReg::Cr8,
            n => CrAccessReg::Other(n as u8),
        };
        let access = match bits.access_type() {
            0 => CrAccessType::MovToCr,
            1 => CrAccessType::MovFromCr,
            2 => CrAccessType::Clts,
            _ => CrAccessType::Lmsw,
        };
        Self {
            reg,
            access,
            gpr: bits.gpr() as u8,
            lmsw_source: bits.lmsw_source(),
        }
    }
}

bitfield! {
    /// Exit qualification for EPT violations (SDM Vol 3C, Table 28-7).
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct EptQualification(u64);
    impl Debug;

    /// The access was a data read.
    pub read, _: 0;
    /// The access was a data write.
    pub write, _: 1;
    /// The access was an instruction fetch.
    pub fetch, _: 2;
    /// The page was readable.
    pub readable, _: 3;
    /// The page was writable.
    pub writable, _: 4;
    /// The page was executable.
    pub executable, _: 5;
    /// The guest linear address field is valid.
    pub linear_valid, _: 7;
    /// The violation happened during the translation itself.
    pub during_translation, _: 8;
}

impl EptQualification {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_reason_round_trip() {
        let raw = 0x8000_001Eu32; // entry failure, basic reason 30
        let reason = ExitReason::from_raw(raw);
        assert!(reason.entry_failure());
        assert_eq!(reason.basic(), 30);
        assert_eq!(reason.basic_reason(), Some(VmxBasicExitReason::IoInstruction));
        assert_eq!(reason.bits(), raw);
    }

    #[test]
    fn instruction_error_gaps_decode_to_none() {
        assert_eq!(VmInstructionError::from_u32(14), None);
        assert_eq!(VmInstructionError::from_u32(21), None);
        assert_eq!(
            VmInstructionError::from_u32(5),
            Some(VmInstructionError::VmresumeNonLaunchedVmcs)
        );
    }

    #[test]
    fn io_qualification_decodes_out_to_com1() {
        // OUT DX, AL to port 0x3F8: size code 0, output, DX-relative.
        let raw = (0x3F8u64) << 16;
        let qual = IoQualification::from_raw(raw);
        assert_eq!(qual.width(), 1);
        assert!(!qual.input());
        assert!(!qual.string());
        assert_eq!(qual.port(), 0x3F8);
    }

    #[test]
    fn cr_qualification_decodes_mov_to_cr3_from_rsi() {
        // CR 3, access type 0 (mov to), GPR 6 (RSI).
        let raw = 3u64 | (0 << 4) | (6 << 8);
        let qual = CrQualification::from_raw(raw);
        assert_eq!(qual.reg, CrAccessReg::Cr3);
        assert_eq!(qual.access, CrAccessType::MovToCr);
        assert_eq!(qual.gpr, 6);
    }

    #[test]
    fn cr_qualification_decodes_lmsw_source() {
        let raw = 0u64 | (3 << 4) | (0xABCDu64 << 16);
        let qual = CrQualification::from_raw(raw);
        assert_eq!(qual.access, CrAccessType::Lmsw);
        assert_eq!(qual.lmsw_source, 0xABCD);
    }
}
