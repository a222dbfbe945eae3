//! Boot-protocol validation.
//!
//! The loader hands us a [`BootInfo`] record. Until the magic constant has
//! been checked, every pointer in it is hostile.

use {
    bootinfo::{BootInfo, BOOT_MAGIC, EFI_CONVENTIONAL_MEMORY},
    log::{debug, info},
};

/// Check the handshake and log what the loader gave us.
///
/// # Panics
///
/// Panics with `invalid boot magic` when the record does not carry the
/// agreed constant. This runs before any VMX setup.
pub fn validate(boot_info: &BootInfo) {
    if boot_info.magic != BOOT_MAGIC {
        panic!(
            "invalid boot magic: expected {:#018x}, got {:#018x}",
            BOOT_MAGIC, boot_info.magic
        );
    }

    let map = &boot_info.memory_map;
    let mut total_pages = 0u64;
    let mut usable_pages = 0u64;
    for desc in map.iter() {
        total_pages += desc.number_of_pages;
        if desc.ty == EFI_CONVENTIONAL_MEMORY {
            usable_pages += desc.number_of_pages;
        }
    }

    info!(
        "boot info accepted: {} MiB total, {} MiB usable",
        total_pages * 4096 / (1024 * 1024),
        usable_pages * 4096 / (1024 * 1024),
    );
    debug!(
        "guest image at {:#x} ({} bytes), initrd at {:#x} ({} bytes), RSDP at {:#x}",
        boot_info.guest_info.guest_image,
        boot_info.guest_info.guest_size,
        boot_info.guest_info.initrd,
        boot_info.guest_info.initrd_size,
        boot_info.acpi_rsdp,
    );
}
