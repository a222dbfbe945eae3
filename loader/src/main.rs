//! Mirage UEFI boot loader.
//!
//! Loads the hypervisor kernel ELF and the guest images from the boot
//! volume, records where everything is in a [`BootInfo`] record, leaves
//! boot services, and jumps to the kernel entry point with that record as
//! the single (Win64) argument.

#![no_std]
#![no_main]

extern crate alloc;

mod elf;

use {
    bootinfo::{BootInfo, GuestInfo, MemoryMap as BootMemoryMap, BOOT_MAGIC},
    log::{error, info, warn},
    uefi::{
        boot::{self, AllocateType, MemoryType},
        cstr16,
        mem::memory_map::MemoryMap,
        prelude::*,
        proto::media::file::{Directory, File, FileAttribute, FileInfo, FileMode, FileType},
        CStr16,
    },
};

/// Files expected in the root of the boot volume.
const KERNEL_PATH: &CStr16 = cstr16!("mirage.elf");
const GUEST_PATH: &CStr16 = cstr16!("bzImage");
const INITRD_PATH: &CStr16 = cstr16!("rootfs.cpio.gz");

type KernelEntry = extern "win64" fn(*const BootInfo) -> !;

#[entry]
fn main() -> Status {
    if let Err(e) = uefi::helpers::init() {
        return e.status();
    }

    info!("Mirage loader starting");

    let mut root = match open_boot_volume() {
        Ok(root) => root,
        Err(status) => return status,
    };

    // The hypervisor kernel: parsed as ELF, each PT_LOAD placed at its
    // physical address.
    let kernel_image = match read_file(&mut root, KERNEL_PATH) {
        Ok(data) => data,
        Err(status) => {
            error!("failed to read {KERNEL_PATH}");
            return status;
        }
    };
    let entry_point = match load_kernel(kernel_image) {
        Ok(entry) => entry,
        Err(status) => return status,
    };

    // The guest payload stays wherever UEFI put it; the kernel copies it
    // into guest RAM itself.
    let guest_image = match read_file(&mut root, GUEST_PATH) {
        Ok(data) => data,
        Err(status) => {
            error!("failed to read {GUEST_PATH}");
            return status;
        }
    };
    let initrd = match read_file(&mut root, INITRD_PATH) {
        Ok(data) => Some(data),
        Err(_) => {
            warn!("no {INITRD_PATH}, booting without an initrd");
            None
        }
    };

    let acpi_rsdp = match find_acpi_rsdp() {
        Some(addr) => addr,
        None => {
            error!("no ACPI 2.0 table in the UEFI configuration table");
            return Status::UNSUPPORTED;
        }
    };

    // The record must survive ExitBootServices, so it gets its own
    // loader-data page rather than a pool allocation.
    let boot_info_page = match boot::allocate_pages(AllocateType::AnyPages, MemoryType::LOADER_DATA, 1)
    {
        Ok(page) => page.as_ptr() as *mut BootInfo,
        Err(e) => {
            error!("failed to allocate the boot-info page: {e:?}");
            return Status::OUT_OF_RESOURCES;
        }
    };

    info!(
        "handing off: kernel entry {:#x}, guest {} KiB, RSDP {:#x}",
        entry_point,
        guest_image.len() / 1024,
        acpi_rsdp,
    );

    // From here on there is no firmware console. The uefi crate retries
    // the map-key dance internally if the map changes under us.
    let memory_map = unsafe { boot::exit_boot_services(Some(MemoryType::LOADER_DATA)) };

    let boot_info = BootInfo {
        magic: BOOT_MAGIC,
        memory_map: BootMemoryMap {
            descriptors: memory_map.buffer().as_ptr() as u64,
            map_size: memory_map.meta().map_size as u64,
            descriptor_size: memory_map.meta().desc_size as u64,
            // The key died with boot services; nothing after the handoff
            // can use it.
            map_key: 0,
        },
        guest_info: GuestInfo {
            guest_image: guest_image.as_ptr() as u64,
            guest_size: guest_image.len() as u64,
            initrd: initrd.as_ref().map_or(0, |i| i.as_ptr() as u64),
            initrd_size: initrd.as_ref().map_or(0, |i| i.len() as u64),
        },
        acpi_rsdp,
    };
    unsafe { boot_info_page.write(boot_info) };
    // The map buffer must stay alive for the kernel; dropping it would
    // free loader-data pages the record points into.
    core::mem::forget(memory_map);

    let entry: KernelEntry = unsafe { core::mem::transmute(entry_point) };
    entry(boot_info_page)
}

fn open_boot_volume() -> Result<Directory, Status> {
    let mut fs = boot::get_image_file_system(boot::image_handle()).map_err(|e| {
        error!("no Simple File System on the boot device: {e:?}");
        e.status()
    })?;
    fs.open_volume().map_err(|e| {
        error!("failed to open the boot volume: {e:?}");
        e.status()
    })
}

/// Read a whole file into loader-data pages (pool memory would be fine
/// until ExitBootServices, but these buffers must outlive it).
fn read_file(root: &mut Directory, path: &CStr16) -> Result<&'static mut [u8], Status> {
    let handle = root
        .open(path, FileMode::Read, FileAttribute::empty())
        .map_err(|e| e.status())?;

    let mut file = match handle.into_type().map_err(|e| e.status())? {
        FileType::Regular(file) => file,
        FileType::Dir(_) => return Err(Status::INVALID_PARAMETER),
    };

    let info = file.get_boxed_info::<FileInfo>().map_err(|e| e.status())?;
    let size = info.file_size() as usize;

    let pages = size.div_ceil(4096);
    let base = boot::allocate_pages(AllocateType::AnyPages, MemoryType::LOADER_DATA, pages)
        .map_err(|e| e.status())?;

    let buffer = unsafe { core::slice::from_raw_parts_mut(base.as_ptr(), size) };
    let read = file.read(buffer).map_err(|e| e.status())?;
    if read != size {
        error!("{path}: short read ({read} of {size} bytes)");
        return Err(Status::LOAD_ERROR);
    }

    Ok(buffer)
}

/// Place every PT_LOAD segment at its physical address and return the
/// entry point. The whole physical span is claimed as one allocation;
/// neighboring segments may share a page, which would make a second
/// exact-address allocation fail.
fn load_kernel(image: &[u8]) -> Result<u64, Status> {
    let parsed = elf::Elf::parse(image).map_err(|e| {
        error!("{KERNEL_PATH} is not a loadable kernel: {e:?}");
        Status::LOAD_ERROR
    })?;

    let mut span_start = u64::MAX;
    let mut span_end = 0u64;
    for segment in parsed.load_segments() {
        let segment = segment.map_err(|e| {
            error!("malformed program header: {e:?}");
            Status::LOAD_ERROR
        })?;
        if segment.mem_size == 0 {
            continue;
        }
        span_start = span_start.min(segment.phys_addr & !0xFFF);
        span_end = span_end.max((segment.phys_addr + segment.mem_size as u64).div_ceil(4096) * 4096);
    }
    if span_start >= span_end {
        error!("{KERNEL_PATH} has no loadable segments");
        return Err(Status::LOAD_ERROR);
    }

    let pages = ((span_end - span_start) / 4096) as usize;
    boot::allocate_pages(AllocateType::Address(span_start), MemoryType::LOADER_DATA, pages)
        .map_err(|e| {
            error!("cannot claim {pages} pages at {span_start:#x} for the kernel: {e:?}");
            Status::LOAD_ERROR
        })?;

    for segment in parsed.load_segments() {
        let segment = segment.map_err(|_| Status::LOAD_ERROR)?;
        if segment.mem_size == 0 {
            continue;
        }
        unsafe {
            let dst = segment.phys_addr as *mut u8;
            let src = parsed.segment_data(&segment);
            core::ptr::copy_nonoverlapping(src.as_ptr(), dst, segment.file_size);
            core::ptr::write_bytes(dst.add(segment.file_size), 0, segment.mem_size - segment.file_size);
        }
        info!(
            "kernel segment: {:#x} ({} KiB file, {} KiB mem)",
            segment.phys_addr,
            segment.file_size / 1024,
            segment.mem_size / 1024,
        );
    }

    Ok(parsed.entry)
}

/// Find the ACPI 2.0 RSDP in the UEFI configuration table.
fn find_acpi_rsdp() -> Option<u64> {
    uefi::system::with_config_table(|entries| {
        entries
            .iter()
            .find(|entry| entry.guid == uefi::table::cfg::ACPI2_GUID)
            .map(|entry| entry.address as u64)
    })
}
