//! Pre-entry guest-state validation gate.
//!
//! VM entry with a malformed guest state is implementation-defined, so the
//! SDM checks of Vol 3C 27.3.1 are re-derived in software before *every*
//! entry, release builds included. Each violation panics with the specific
//! rule; silently proceeding is never an option.
//!
//! The rules run on a [`GuestState`] snapshot rather than on live VMCS
//! reads so they stay pure and testable; [`partial_check_guest`] does the
//! capture and feeds it through.

use {
    crate::{
        error::HvError,
        intel::{
            controls::EntryControls,
            segmentation::SegmentRights,
            support::{rdmsr, vmread},
        },
    },
    x86::{msr, vmx::vmcs},
};

/// CR0 bits referenced by the rules.
const CR0_PE: u64 = 1 << 0;
const CR0_WP: u64 = 1 << 16;
const CR0_PG: u64 = 1 << 31;
/// CR4 bits referenced by the rules.
const CR4_PAE: u64 = 1 << 5;
const CR4_PCIDE: u64 = 1 << 17;
const CR4_CET: u64 = 1 << 23;
/// RFLAGS bits referenced by the rules.
const RFLAGS_RESERVED_ONE: u64 = 1 << 1;
const RFLAGS_IF: u64 = 1 << 9;
const RFLAGS_VM: u64 = 1 << 17;
/// EFER bits referenced by the rules.
const EFER_LME: u64 = 1 << 8;
const EFER_LMA: u64 = 1 << 10;

/// One guest segment register as the VMCS sees it.
#[derive(Debug, Clone, Copy)]
pub struct SegmentSnapshot {
    pub selector: u16,
    pub base: u64,
    pub limit: u64,
    pub rights: SegmentRights,
}

/// Everything the rules need, read out of the VMCS in one pass.
#[derive(Debug, Clone, Copy)]
pub struct GuestState {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub ia32_efer: u64,
    pub ia32_pat: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: SegmentSnapshot,
    pub ss: SegmentSnapshot,
    pub ds: SegmentSnapshot,
    pub es: SegmentSnapshot,
    pub fs: SegmentSnapshot,
    pub gs: SegmentSnapshot,
    pub tr: SegmentSnapshot,
    pub ldtr: SegmentSnapshot,
    pub gdtr_base: u64,
    pub gdtr_limit: u64,
    pub idtr_base: u64,
    pub idtr_limit: u64,
    pub activity_state: u64,
    pub interruptibility: u64,
    pub vmcs_link: u64,
    pub entry_controls: u64,
    pub entry_interrupt_info: u64,
    /// Capability context the CR rules are evaluated against.
    pub cr0_fixed0: u64,
    pub cr0_fixed1: u64,
    pub cr4_fixed0: u64,
    pub cr4_fixed1: u64,
    pub unrestricted_guest: bool,
    pub load_efer: bool,
    pub maxphysaddr: u8,
}

/// Capture the current guest state and run every rule. Called before each
/// VM entry.
pub fn partial_check_guest() -> Result<(), HvError> {
    GuestState::capture()?.check();
    Ok(())
}

fn read_segment(
    selector: u32,
    base: u32,
    limit: u32,
    rights: u32,
) -> Result<SegmentSnapshot, HvError> {
    Ok(SegmentSnapshot {
        selector: vmread(selector)? as u16,
        base: vmread(base)?,
        limit: vmread(limit)?,
        rights: SegmentRights::from_raw(vmread(rights)? as u32),
    })
}

impl GuestState {
    pub fn capture() -> Result<Self, HvError> {
        use x86::vmx::vmcs::{control, guest};

        let secondary = vmread(control::SECONDARY_PROCBASED_EXEC_CONTROLS)?;
        let entry_controls = vmread(control::VMENTRY_CONTROLS)?;

        Ok(Self {
            cr0: vmread(guest::CR0)?,
            cr3: vmread(guest::CR3)?,
            cr4: vmread(guest::CR4)?,
            ia32_efer: vmread(guest::IA32_EFER_FULL)?,
            ia32_pat: vmread(guest::IA32_PAT_FULL)?,
            sysenter_esp: vmread(guest::IA32_SYSENTER_ESP)?,
            sysenter_eip: vmread(guest::IA32_SYSENTER_EIP)?,
            rip: vmread(guest::RIP)?,
            rflags: vmread(guest::RFLAGS)?,
            cs: read_segment(
                guest::CS_SELECTOR,
                guest::CS_BASE,
                guest::CS_LIMIT,
                guest::CS_ACCESS_RIGHTS,
            )?,
            ss: read_segment(
                guest::SS_SELECTOR,
                guest::SS_BASE,
                guest::SS_LIMIT,
                guest::SS_ACCESS_RIGHTS,
            )?,
            ds: read_segment(
                guest::DS_SELECTOR,
                guest::DS_BASE,
                guest::DS_LIMIT,
                guest::DS_ACCESS_RIGHTS,
            )?,
            es: read_segment(
                guest::ES_SELECTOR,
                guest::ES_BASE,
                guest::ES_LIMIT,
                guest::ES_ACCESS_RIGHTS,
            )?,
            fs: read_segment(
                guest::FS_SELECTOR,
                guest::FS_BASE,
                guest::FS_LIMIT,
                guest::FS_ACCESS_RIGHTS,
            )?,
            gs: read_segment(
                guest::GS_SELECTOR,
                guest::GS_BASE,
                guest::GS_LIMIT,
                guest::GS_ACCESS_RIGHTS,
            )?,
            tr: read_segment(
                guest::TR_SELECTOR,
                guest::TR_BASE,
                guest::TR_LIMIT,
                guest::TR_ACCESS_RIGHTS,
            )?,
            ldtr: read_segment(
                guest::LDTR_SELECTOR,
                guest::LDTR_BASE,
                guest::LDTR_LIMIT,
                guest::LDTR_ACCESS_RIGHTS,
            )?,
            gdtr_base: vmread(guest::GDTR_BASE)?,
            gdtr_limit: vmread(guest::GDTR_LIMIT)?,
            idtr_base: vmread(guest::IDTR_BASE)?,
            idtr_limit: vmread(guest::IDTR_LIMIT)?,
            activity_state: vmread(guest::ACTIVITY_STATE)?,
            interruptibility: vmread(guest::INTERRUPTIBILITY_STATE)?,
            vmcs_link: vmread(guest::LINK_PTR_FULL)?,
            entry_controls,
            entry_interrupt_info: vmread(control::VMENTRY_INTERRUPTION_INFO_FIELD)?,
            cr0_fixed0: rdmsr(msr::IA32_VMX_CR0_FIXED0),
            cr0_fixed1: rdmsr(msr::IA32_VMX_CR0_FIXED1),
            cr4_fixed0: rdmsr(msr::IA32_VMX_CR4_FIXED0),
            cr4_fixed1: rdmsr(msr::IA32_VMX_CR4_FIXED1),
            unrestricted_guest: secondary & (1 << 7) != 0,
            load_efer: entry_controls & EntryControls::LOAD_IA32_EFER.bits() != 0,
            maxphysaddr: maxphysaddr(),
        })
    }

    fn ia32e_entry(&self) -> bool {
        self.entry_controls & EntryControls::IA32E_MODE_GUEST.bits() != 0
    }

    /// Run every rule, panicking on the first violation.
    pub fn check(&self) {
        self.check_control_registers_and_msrs();
        self.check_segments();
        self.check_descriptor_tables();
        self.check_rip_rflags();
        self.check_non_register_state();
    }

    fn check_control_registers_and_msrs(&self) {
        // Unrestricted guests may clear PE and PG regardless of the fixed
        // bits; everything else in CR0 still obeys them.
        let mut cr0_fixed0 = self.cr0_fixed0;
        if self.unrestricted_guest {
            cr0_fixed0 &= !(CR0_PE | CR0_PG);
        }
        if self.cr0 & cr0_fixed0 != cr0_fixed0 || self.cr0 & !self.cr0_fixed1 != 0 {
            fail("guest CR0", "fixed bits");
        }
        if self.cr0 & CR0_PG != 0 && self.cr0 & CR0_PE == 0 {
            fail("guest CR0", "PG without PE");
        }

        if self.cr4 & self.cr4_fixed0 != self.cr4_fixed0 || self.cr4 & !self.cr4_fixed1 != 0 {
            fail("guest CR4", "fixed bits");
        }
        if self.cr4 & CR4_CET != 0 && self.cr0 & CR0_WP == 0 {
            fail("guest CR4", "CET without CR0.WP");
        }

        if self.ia32e_entry() {
            if self.cr0 & CR0_PG == 0 || self.cr4 & CR4_PAE == 0 {
                fail("entry controls", "IA-32e without PG/PAE");
            }
        } else if self.cr4 & CR4_PCIDE != 0 {
            fail("guest CR4", "PCIDE outside IA-32e");
        }

        if self.cr3 >> self.maxphysaddr != 0 {
            fail("guest CR3", "upper bits");
        }

        if !is_canonical(self.sysenter_esp) || !is_canonical(self.sysenter_eip) {
            fail("guest IA32_SYSENTER", "non-canonical");
        }

        if self.load_efer {
            let lma = self.ia32_efer & EFER_LMA != 0;
            if lma != self.ia32e_entry() {
                fail("guest IA32_EFER", "LMA != entry IA-32e");
            }
            if self.cr0 & CR0_PG != 0 {
                let lme = self.ia32_efer & EFER_LME != 0;
                if lma != lme {
                    fail("guest IA32_EFER", "LMA != LME");
                }
            }
        }

        for i in 0..8 {
            let entry = (self.ia32_pat >> (i * 8)) & 0xFF;
            if !matches!(entry, 0 | 1 | 4 | 6 | 7) {
                fail("guest IA32_PAT", "memory type");
            }
        }
    }

    fn check_segments(&self) {
        // Selector rules.
        if self.tr.selector & 0b100 != 0 {
            fail("TR.selector", "TI");
        }
        if !self.ldtr.rights.unusable() && self.ldtr.selector & 0b100 != 0 {
            fail("LDTR.selector", "TI");
        }
        if self.cs.selector & 0b11 != self.ss.selector & 0b11 {
            fail("CS.selector", "RPL != SS.RPL");
        }

        // Base rules.
        for (name, seg) in [("TR", &self.tr), ("FS", &self.fs), ("GS", &self.gs), ("LDTR", &self.ldtr)] {
            if !is_canonical(seg.base) {
                fail_seg(name, "base", "non-canonical");
            }
        }
        for (name, seg) in [("CS", &self.cs), ("SS", &self.ss), ("DS", &self.ds), ("ES", &self.es)] {
            if seg.base >> 32 != 0 {
                fail_seg(name, "base", "upper half");
            }
        }

        // CS: accessed code, code/data class, present. Non-conforming code
        // requires CS.DPL == SS.DPL.
        let cs = self.cs.rights;
        if !matches!(cs.seg_type(), 9 | 11 | 13 | 15) {
            fail("CS.rights", "Invalid value (type)");
        }
        if !cs.code_or_data() {
            fail("CS.rights", "Invalid value (S)");
        }
        if !cs.present() {
            fail("CS.rights", "Invalid value (P)");
        }
        if matches!(cs.seg_type(), 9 | 11) && cs.dpl() != self.ss.rights.dpl() {
            panic!("CS.rights: Invalid value (DPL)");
        }

        // SS, when usable: writable data, accessed.
        let ss = self.ss.rights;
        if !ss.unusable() {
            if !matches!(ss.seg_type(), 3 | 7) {
                fail("SS.rights", "Invalid value (type)");
            }
            if !ss.code_or_data() || !ss.present() {
                fail("SS.rights", "Invalid value (S/P)");
            }
        }

        // DS/ES/FS/GS, when usable: accessed, readable if code.
        for (name, seg) in [("DS", &self.ds), ("ES", &self.es), ("FS", &self.fs), ("GS", &self.gs)] {
            let rights = seg.rights;
            if rights.unusable() {
                continue;
            }
            if rights.seg_type() & 0b1 == 0 {
                fail_seg(name, "rights", "not accessed");
            }
            if rights.seg_type() & 0b1000 != 0 && rights.seg_type() & 0b10 == 0 {
                fail_seg(name, "rights", "execute-only code");
            }
            if !rights.code_or_data() || !rights.present() {
                fail_seg(name, "rights", "S/P");
            }
        }

        // TR: busy 64/32-bit TSS, system class, present, always usable.
        let tr = self.tr.rights;
        if tr.seg_type() != 11 && tr.seg_type() != 3 {
            fail("TR.rights", "Invalid value (type)");
        }
        if tr.code_or_data() {
            fail("TR.rights", "Invalid value (S)");
        }
        if !tr.present() {
            fail("TR.rights", "Invalid value (P)");
        }
        if tr.unusable() {
            fail("TR.rights", "Invalid value (unusable)");
        }

        // LDTR, when usable: LDT, system class, present.
        let ldtr = self.ldtr.rights;
        if !ldtr.unusable() {
            if ldtr.seg_type() != 2 {
                fail("LDTR.rights", "Invalid value (type)");
            }
            if ldtr.code_or_data() || !ldtr.present() {
                fail("LDTR.rights", "Invalid value (S/P)");
            }
        }

        // Limit/granularity consistency for every usable segment.
        for (name, seg) in [
            ("CS", &self.cs),
            ("SS", &self.ss),
            ("DS", &self.ds),
            ("ES", &self.es),
            ("FS", &self.fs),
            ("GS", &self.gs),
            ("TR", &self.tr),
            ("LDTR", &self.ldtr),
        ] {
            if seg.rights.unusable() {
                continue;
            }
            let limit = seg.limit;
            let g = seg.rights.granularity();
            if limit & 0xFFF != 0xFFF && g {
                fail_seg(name, "limit", "granularity");
            }
            if limit >> 20 != 0 && !g {
                fail_seg(name, "limit", "granularity");
            }
        }
    }

    fn check_descriptor_tables(&self) {
        if !is_canonical(self.gdtr_base) || !is_canonical(self.idtr_base) {
            fail("guest GDTR/IDTR", "non-canonical base");
        }
        if self.gdtr_limit >> 16 != 0 || self.idtr_limit >> 16 != 0 {
            fail("guest GDTR/IDTR", "limit upper bits");
        }
    }

    fn check_rip_rflags(&self) {
        if self.rip >> 32 != 0 && !(self.ia32e_entry() && self.cs.rights.long()) {
            fail("guest RIP", "upper half");
        }

        // Bits 63:22, 15, 5, and 3 are reserved-zero; bit 1 is
        // reserved-one.
        let reserved_zero = !0u64 << 22 | 1 << 15 | 1 << 5 | 1 << 3;
        if self.rflags & reserved_zero != 0 {
            fail("guest RFLAGS", "reserved bits");
        }
        if self.rflags & RFLAGS_RESERVED_ONE == 0 {
            fail("guest RFLAGS", "bit 1");
        }
        if (self.cr0 & CR0_PE == 0 || self.ia32e_entry()) && self.rflags & RFLAGS_VM != 0 {
            fail("guest RFLAGS", "VM");
        }
        if self.entry_interrupt_info & (1 << 31) != 0 && self.rflags & RFLAGS_IF == 0 {
            fail("guest RFLAGS", "IF with pending event");
        }
    }

    fn check_non_register_state(&self) {
        if self.activity_state != 0 {
            fail("guest activity state", "not active");
        }
        if self.interruptibility >> 5 != 0 {
            fail("guest interruptibility", "upper bits");
        }
        if self.vmcs_link != !0u64 {
            fail("VMCS link pointer", "not all ones");
        }
    }
}

fn fail(what: &str, detail: &str) -> ! {
    panic!("{what}: Invalid value ({detail})");
}

fn fail_seg(name: &str, part: &str, detail: &str) -> ! {
    panic!("{name}.{part}: Invalid value ({detail})");
}

fn is_canonical(addr: u64) -> bool {
    ((addr as i64) << 16 >> 16) == addr as i64
}

fn maxphysaddr() -> u8 {
    x86::cpuid::CpuId::new()
        .get_processor_capacity_feature_info()
        .map(|info| info.physical_address_bits())
        .unwrap_or(36)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_seg(rights: SegmentRights) -> SegmentSnapshot {
        SegmentSnapshot {
            selector: 0,
            base: 0,
            limit: 0xFFFF_FFFF,
            rights,
        }
    }

    /// The initial protected-mode guest state the VMCS setup programs,
    /// expressed as a snapshot. Every rule must accept it.
    fn valid_state() -> GuestState {
        let mut tr = flat_seg(SegmentRights::task_register());
        tr.limit = 0xFFFF;
        let mut ldtr = flat_seg(SegmentRights::ldtr());
        ldtr.limit = 0xFFFF;
        ldtr.base = 0xDEAD00;

        GuestState {
            // PE | NE | ET, paging off.
            cr0: 0x31,
            cr3: 0,
            // VMXE only.
            cr4: 1 << 13,
            ia32_efer: 0,
            ia32_pat: 0x0007_0406_0007_0406,
            sysenter_esp: 0,
            sysenter_eip: 0,
            rip: 0x10_0000,
            rflags: 0x2,
            cs: flat_seg(SegmentRights::flat_code()),
            ss: flat_seg(SegmentRights::flat_data()),
            ds: flat_seg(SegmentRights::flat_data()),
            es: flat_seg(SegmentRights::flat_data()),
            fs: flat_seg(SegmentRights::flat_data()),
            gs: flat_seg(SegmentRights::flat_data()),
            tr,
            ldtr,
            gdtr_base: 0,
            gdtr_limit: 0,
            idtr_base: 0,
            idtr_limit: 0,
            activity_state: 0,
            interruptibility: 0,
            vmcs_link: !0,
            entry_controls: EntryControls::LOAD_IA32_EFER.bits(),
            entry_interrupt_info: 0,
            cr0_fixed0: 0x8000_0021,
            cr0_fixed1: 0xFFFF_FFFF,
            cr4_fixed0: 1 << 13,
            cr4_fixed1: 0x3F_FFFF,
            unrestricted_guest: true,
            load_efer: true,
            maxphysaddr: 39,
        }
    }

    #[test]
    fn initial_guest_state_passes() {
        valid_state().check();
    }

    #[test]
    #[should_panic(expected = "CS.rights: Invalid value (DPL)")]
    fn cs_ss_dpl_mismatch_is_rejected() {
        let mut state = valid_state();
        let mut ss_rights = state.ss.rights;
        ss_rights.set_dpl(3);
        state.ss.rights = ss_rights;
        state.ss.selector = 3;
        state.cs.selector = 3;
        state.check();
    }

    #[test]
    #[should_panic(expected = "guest CR0: Invalid value (PG without PE)")]
    fn paging_without_protection_is_rejected() {
        let mut state = valid_state();
        state.cr0 = (state.cr0 | super::CR0_PG) & !super::CR0_PE;
        state.check();
    }

    #[test]
    #[should_panic(expected = "limit: Invalid value (granularity)")]
    fn byte_granular_big_limit_is_rejected() {
        let mut state = valid_state();
        let mut rights = state.ds.rights;
        rights.set_granularity(false);
        state.ds.rights = rights;
        // limit still 0xFFFFFFFF: upper bits set but G is byte.
        state.check();
    }

    #[test]
    #[should_panic(expected = "VMCS link pointer")]
    fn cleared_link_pointer_is_rejected() {
        let mut state = valid_state();
        state.vmcs_link = 0;
        state.check();
    }

    #[test]
    #[should_panic(expected = "guest RFLAGS: Invalid value (bit 1)")]
    fn rflags_bit1_must_be_set() {
        let mut state = valid_state();
        state.rflags = 0;
        state.check();
    }

    #[test]
    #[should_panic(expected = "guest IA32_PAT")]
    fn bad_pat_entry_is_rejected() {
        let mut state = valid_state();
        state.ia32_pat = 0x02;
        state.check();
    }

    #[test]
    #[should_panic(expected = "TR.selector: Invalid value (TI)")]
    fn tr_in_ldt_is_rejected() {
        let mut state = valid_state();
        state.tr.selector = 0b100;
        state.check();
    }
}
