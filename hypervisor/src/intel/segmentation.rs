//! VMX segment access-rights encoding.
//!
//! The access-rights VMCS fields use the packed layout of SDM Vol 3C
//! 25.4.1: type, S, DPL, P, AVL, L, D/B, G, and the unusable bit. The
//! guest starts in flat 32-bit protected mode, so the handful of encodings
//! below cover everything the initial state needs.

use bitfield::bitfield;

bitfield! {
    /// Segment access rights as written to `*_ACCESS_RIGHTS`.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct SegmentRights(u32);
    impl Debug;

    /// Segment type (code/data/system flavor plus accessed bit).
    pub seg_type, set_seg_type: 3, 0;
    /// Descriptor class: set for code/data, clear for system (TR, LDTR).
    pub code_or_data, set_code_or_data: 4;
    /// Descriptor privilege level.
    pub dpl, set_dpl: 6, 5;
    /// Present.
    pub present, set_present: 7;
    /// Available for software use.
    pub avl, set_avl: 12;
    /// 64-bit code segment.
    pub long, set_long: 13;
    /// Default operation size (D/B).
    pub db, set_db: 14;
    /// Granularity: set scales the limit by 4 KiB.
    pub granularity, set_granularity: 15;
    /// Segment register holds no usable descriptor.
    pub unusable, set_unusable: 16;
}

/// Segment type values for the `seg_type` field.
pub mod seg_type {
    /// Code, execute/read, accessed.
    pub const CODE_ER_ACCESSED: u32 = 0b1011;
    /// Data, read/write, accessed.
    pub const DATA_RW_ACCESSED: u32 = 0b0011;
    /// System: busy 64-bit TSS. Shares the encoding of accessed ER code.
    pub const TSS_BUSY: u32 = 0b1011;
    /// System: LDT.
    pub const LDT: u32 = 0b0010;
}

impl SegmentRights {
    /// Recover rights from a raw VMCS field value.
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw field value.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Flat 32-bit code segment: ER accessed, DPL 0, 4 KiB granularity,
    /// 32-bit default size.
    pub fn flat_code() -> Self {
        let mut rights = Self(0);
        rights.set_seg_type(seg_type::CODE_ER_ACCESSED);
        rights.set_code_or_data(true);
        rights.set_present(true);
        rights.set_db(true);
        rights.set_granularity(true);
        rights
    }

    /// Flat 32-bit data segment: RW accessed, DPL 0.
    pub fn flat_data() -> Self {
        let mut rights = Self(0);
        rights.set_seg_type(seg_type::DATA_RW_ACCESSED);
        rights.set_code_or_data(true);
        rights.set_present(true);
        rights.set_db(true);
        rights.set_granularity(true);
        rights
    }

    /// Busy TSS, byte granularity, 16/32-agnostic.
    pub fn task_register() -> Self {
        let mut rights = Self(0);
        rights.set_seg_type(seg_type::TSS_BUSY);
        rights.set_present(true);
        rights
    }

    /// LDT, byte granularity.
    pub fn ldtr() -> Self {
        let mut rights = Self(0);
        rights.set_seg_type(seg_type::LDT);
        rights.set_present(true);
        rights
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_round_trip() {
        for rights in [
            SegmentRights::flat_code(),
            SegmentRights::flat_data(),
            SegmentRights::task_register(),
            SegmentRights::ldtr(),
        ] {
            assert_eq!(SegmentRights::from_raw(rights.bits()), rights);
        }
    }

    #[test]
    fn flat_code_encoding() {
        let rights = SegmentRights::flat_code();
        assert_eq!(rights.seg_type(), seg_type::CODE_ER_ACCESSED);
        assert!(rights.code_or_data());
        assert_eq!(rights.dpl(), 0);
        assert!(rights.present());
        assert!(rights.db());
        assert!(rights.granularity());
        assert!(!rights.unusable());
        // Matches the hand-computed SDM encoding.
        assert_eq!(rights.bits(), 0xC09B);
    }

    #[test]
    fn system_segments_clear_the_s_bit() {
        assert!(!SegmentRights::task_register().code_or_data());
        assert!(!SegmentRights::ldtr().code_or_data());
        assert!(!SegmentRights::task_register().granularity());
    }
}
