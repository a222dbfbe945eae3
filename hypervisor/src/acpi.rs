//! ACPI table discovery.
//!
//! Only the chain the platform bring-up needs: RSDP (revision 2) to XSDT
//! to FADT. Both RSDP checksums and the XSDT whole-table checksum are
//! verified; a firmware that fails them is not one we will run a guest on,
//! so violations panic with the specific rule.

use {
    core::sync::atomic::{AtomicU64, Ordering},
    log::{debug, info},
};

/// Failures while validating the discovery chain. Carried in the panic
/// message; callers never see these as values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcpiError {
    InvalidSignature,
    InvalidRevision,
    InvalidChecksum,
    InvalidExtendedChecksum,
    InvalidXsdtSignature,
    InvalidXsdtChecksum,
    FadtNotFound,
}

/// Physical address of the FADT once discovered.
static FADT_ADDR: AtomicU64 = AtomicU64::new(0);

const RSDP_SIGNATURE: &[u8; 8] = b"RSD PTR ";
const XSDT_SIGNATURE: &[u8; 4] = b"XSDT";
const FADT_SIGNATURE: &[u8; 4] = b"FACP";

/// ACPI 2.0 Root System Description Pointer.
#[repr(C, packed)]
struct Rsdp {
    signature: [u8; 8],
    checksum: u8,
    oem_id: [u8; 6],
    revision: u8,
    rsdt_address: u32,
    // Extended fields, only valid when revision >= 2.
    length: u32,
    xsdt_address: u64,
    extended_checksum: u8,
    reserved: [u8; 3],
}

/// Header shared by every system description table.
#[repr(C, packed)]
struct SdtHeader {
    signature: [u8; 4],
    length: u32,
    revision: u8,
    checksum: u8,
    oem_id: [u8; 6],
    oem_table_id: [u8; 8],
    oem_revision: u32,
    creator_id: u32,
    creator_revision: u32,
}

/// Walk the discovery chain starting at the RSDP the loader found.
///
/// # Panics
///
/// Panics when any signature, revision, or checksum rule fails.
pub fn init(rsdp_addr: u64) {
    let rsdp = unsafe { &*(rsdp_addr as *const Rsdp) };
    if let Err(e) = validate_rsdp_bytes(unsafe {
        core::slice::from_raw_parts(rsdp_addr as *const u8, core::mem::size_of::<Rsdp>())
    }) {
        panic!("RSDP rejected: {e:?}");
    }

    let xsdt_addr = rsdp.xsdt_address;
    debug!("RSDP ok, XSDT at {:#x}", xsdt_addr);

    let fadt = match find_fadt(xsdt_addr) {
        Ok(addr) => addr,
        Err(e) => panic!("XSDT walk failed: {e:?}"),
    };
    FADT_ADDR.store(fadt, Ordering::Release);

    info!("ACPI: FADT at {:#x}", fadt);
}

/// Physical address of the FADT, 0 before [`init`].
pub fn fadt_addr() -> u64 {
    FADT_ADDR.load(Ordering::Acquire)
}

/// Validate an RSDP image: signature, revision 2, 20-byte checksum, and
/// 36-byte extended checksum.
fn validate_rsdp_bytes(bytes: &[u8]) -> Result<(), AcpiError> {
    if bytes.len() < 36 || &bytes[..8] != RSDP_SIGNATURE {
        return Err(AcpiError::InvalidSignature);
    }
    if bytes[15] != 2 {
        return Err(AcpiError::InvalidRevision);
    }
    if checksum(&bytes[..20]) != 0 {
        return Err(AcpiError::InvalidChecksum);
    }
    if checksum(&bytes[..36]) != 0 {
        return Err(AcpiError::InvalidExtendedChecksum);
    }
    Ok(())
}

/// Walk XSDT entries looking for the FADT. Entries are 64-bit physical
/// pointers stored at 4-byte alignment, so each is read as two 32-bit
/// halves.
fn find_fadt(xsdt_addr: u64) -> Result<u64, AcpiError> {
    let header = unsafe { &*(xsdt_addr as *const SdtHeader) };
    // Copy packed fields out before comparing; references into a packed
    // struct are not allowed.
    let signature = header.signature;
    if signature != *XSDT_SIGNATURE {
        return Err(AcpiError::InvalidXsdtSignature);
    }
    let length = header.length as usize;
    let table = unsafe { core::slice::from_raw_parts(xsdt_addr as *const u8, length) };
    if checksum(table) != 0 {
        return Err(AcpiError::InvalidXsdtChecksum);
    }

    let entries_offset = core::mem::size_of::<SdtHeader>();
    let entry_count = (length - entries_offset) / 8;
    for i in 0..entry_count {
        let at = entries_offset + i * 8;
        let lo = u32::from_le_bytes(table[at..at + 4].try_into().unwrap());
        let hi = u32::from_le_bytes(table[at + 4..at + 8].try_into().unwrap());
        let entry = (hi as u64) << 32 | lo as u64;

        let sdt = unsafe { &*(entry as *const SdtHeader) };
        let sdt_signature = sdt.signature;
        if sdt_signature == *FADT_SIGNATURE {
            return Ok(entry);
        }
    }

    Err(AcpiError::FadtNotFound)
}

/// Sum of all bytes mod 256. A valid table sums to zero.
fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rsdp() -> [u8; 36] {
        let mut bytes = [0u8; 36];
        bytes[..8].copy_from_slice(b"RSD PTR ");
        bytes[15] = 2; // revision
        bytes[20..24].copy_from_slice(&36u32.to_le_bytes()); // length
        bytes[24..32].copy_from_slice(&0x7fe0_0000u64.to_le_bytes()); // xsdt
        // Fix up both checksums: first the 20-byte one, then the extended
        // one over the full 36 bytes.
        let sum20 = bytes[..20].iter().fold(0u8, |a, b| a.wrapping_add(*b));
        bytes[8] = 0u8.wrapping_sub(sum20);
        let sum36 = bytes.iter().fold(0u8, |a, b| a.wrapping_add(*b));
        bytes[32] = 0u8.wrapping_sub(sum36);
        bytes
    }

    #[test]
    fn valid_rsdp_passes() {
        assert_eq!(validate_rsdp_bytes(&sample_rsdp()), Ok(()));
    }

    #[test]
    fn corrupted_extended_checksum_is_detected() {
        let mut bytes = sample_rsdp();
        // Corrupt a byte beyond the first 20, then repair the 20-byte
        // checksum so only the extended one fails.
        bytes[30] ^= 0xA5;
        assert_eq!(
            validate_rsdp_bytes(&bytes),
            Err(AcpiError::InvalidExtendedChecksum)
        );
    }

    #[test]
    fn wrong_revision_is_rejected() {
        let mut bytes = sample_rsdp();
        bytes[15] = 0;
        // Checksums no longer matter; revision is checked first.
        assert_eq!(validate_rsdp_bytes(&bytes), Err(AcpiError::InvalidRevision));
    }

    #[test]
    fn checksum_is_sum_mod_256() {
        assert_eq!(checksum(&[0xFF, 0x01]), 0);
        assert_eq!(checksum(&[1, 2, 3]), 6);
    }
}
