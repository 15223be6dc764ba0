//! Multiboot v1 boot information
//!
//! GRUB leaves an info structure in low memory and its address in EBX.
//! The PMM derives free memory from the memory map, and user executables
//! arrive as boot modules. Because low memory is released (and later
//! clobbered by VM86), everything the kernel wants to keep is copied to
//! frames right after the kernel image first.

use bitflags::bitflags;
use core::sync::atomic::{AtomicU32, Ordering};
use log::{debug, error};

use crate::{
    arch::x86::mmu,
    elf::ElfImage,
    mm::{
        pmm::{FrameTag, PMM},
        PhysicalAddress, VirtualAddress,
    },
};

/// EAX value a Multiboot-compliant loader hands to the kernel.
pub const BOOTLOADER_MAGIC: u32 = 0x2BAD_B002;

bitflags! {
    /// Which `BootInfo` fields are valid.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct InfoFlags: u32 {
        const MEMORY = 1 << 0;
        const BOOT_DEVICE = 1 << 1;
        const CMDLINE = 1 << 2;
        const MODS = 1 << 3;
        const MMAP = 1 << 6;
        const BOOT_LOADER_NAME = 1 << 9;
    }
}

/// The Multiboot v1 information structure, as far as this kernel reads it.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct BootInfo {
    flags: u32,
    mem_lower: u32,
    mem_upper: u32,
    boot_device: u32,
    cmdline: u32,
    mods_count: u32,
    mods_addr: u32,
    syms: [u32; 4],
    mmap_length: u32,
    mmap_addr: u32,
    drives_length: u32,
    drives_addr: u32,
    config_table: u32,
    boot_loader_name: u32,
    apm_table: u32,
}

/// One memory map entry. `size` precedes the entry proper, so the next
/// entry starts `size + 4` bytes further.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct MmapEntry {
    size: u32,
    base_addr: u64,
    length: u64,
    entry_type: u32,
}

/// Memory available for general use in a memory map entry.
const MMAP_AVAILABLE: u32 = 1;

/// One boot module record.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct Module {
    start: u32,
    end: u32,
    string: u32,
    reserved: u32,
}

/// Linear address of the (possibly relocated) info structure; 0 if boot
/// information is unavailable.
static INFO_ADDR: AtomicU32 = AtomicU32::new(0);

/// Reads a plain-data structure out of virtual memory, unaligned and
/// page-straddling tolerated.
fn read_struct<T: Copy>(addr: u32) -> T {
    let mut value = core::mem::MaybeUninit::<T>::uninit();
    // SAFETY: T is plain old data; the bytes come from boot structures
    // the loader placed in mapped (or pre-paging) memory.
    unsafe {
        mmu::copy_out(
            VirtualAddress::new(addr),
            core::slice::from_raw_parts_mut(
                value.as_mut_ptr().cast::<u8>(),
                core::mem::size_of::<T>(),
            ),
        );
        value.assume_init()
    }
}

fn write_struct<T: Copy>(addr: u32, value: &T) {
    // SAFETY: as in `read_struct`; the destination was allocated for
    // exactly this structure.
    unsafe {
        mmu::copy_in(
            VirtualAddress::new(addr),
            core::slice::from_raw_parts(
                (value as *const T).cast::<u8>(),
                core::mem::size_of::<T>(),
            ),
        );
    }
}

fn info() -> Option<BootInfo> {
    let addr = INFO_ADDR.load(Ordering::Relaxed);
    if addr == 0 {
        return None;
    }
    Some(read_struct::<BootInfo>(addr))
}

/// Length of the NUL-terminated string at `addr`, excluding the NUL.
fn str_len(addr: u32) -> usize {
    let mut len = 0usize;
    // SAFETY: boot strings live in loader-provided mapped memory.
    while unsafe { mmu::read_u8(VirtualAddress::new(addr + len as u32)) } != 0 {
        len += 1;
    }
    len
}

fn str_equals(addr: u32, expected: &str) -> bool {
    for (index, byte) in expected.bytes().enumerate() {
        // SAFETY: as in `str_len`.
        if unsafe { mmu::read_u8(VirtualAddress::new(addr + index as u32)) } != byte {
            return false;
        }
    }
    // SAFETY: as in `str_len`.
    (unsafe { mmu::read_u8(VirtualAddress::new(addr + expected.len() as u32)) }) == 0
}

/// Validates the loader handoff and remembers the info structure.
pub fn init(info_addr: u32, magic: u32) {
    crate::print!("Multiboot init ... ");
    if magic != BOOTLOADER_MAGIC {
        crate::print::fail("Multiboot magic not found.");
        return;
    }
    INFO_ADDR.store(info_addr, Ordering::Relaxed);
    let Some(info) = info() else {
        crate::print::fail("no boot information.");
        return;
    };
    let flags = InfoFlags::from_bits_truncate(info.flags);
    if flags.contains(InfoFlags::MEMORY) {
        crate::print!(
            "{}KB lower and {}KB upper memory, ",
            info.mem_lower,
            info.mem_upper
        );
    }
    if flags.contains(InfoFlags::MODS) {
        crate::print!("{} modules, ", info.mods_count);
    }
    if flags.contains(InfoFlags::MMAP) {
        crate::print!("memory map, ");
    }
    crate::print::ok();
}

/// Folds the loader's memory map into the PMM: available ranges become
/// Unused, everything else stays Reserved. Ranges above 4 GiB are
/// ignored — this kernel does not do PAE.
pub fn fold_memory_map() -> bool {
    let Some(info) = info() else {
        return false;
    };
    if !InfoFlags::from_bits_truncate(info.flags).contains(InfoFlags::MMAP) {
        return false;
    }
    let mut addr = info.mmap_addr;
    let end = info.mmap_addr + info.mmap_length;
    while addr < end {
        let entry = read_struct::<MmapEntry>(addr);
        let base = entry.base_addr;
        let length = entry.length;
        if base < (1u64 << 32) {
            let tag = if entry.entry_type == MMAP_AVAILABLE {
                FrameTag::Unused
            } else {
                FrameTag::Reserved
            };
            PMM.lock().use_range(
                PhysicalAddress::new(base as u32),
                length.min((1u64 << 32) - base) as usize,
                tag,
                "BIOS memory",
            );
        }
        addr += entry.size + core::mem::size_of::<u32>() as u32;
    }
    true
}

/// Copies the info structure, the memory map and every module (payload
/// and cmdline string) into kernel-owned frames, then repoints all the
/// addresses at the copies. After this, low memory can be released.
pub fn copy_boot_records() {
    let Some(mut info) = info() else {
        return;
    };
    let flags = InfoFlags::from_bits_truncate(info.flags);
    let info_len = core::mem::size_of::<BootInfo>();
    let mmap_len = info.mmap_length as usize;
    let modules_len = if flags.contains(InfoFlags::MODS) {
        info.mods_count as usize * core::mem::size_of::<Module>()
    } else {
        0
    };

    let dst = match PMM
        .lock()
        .alloc(info_len + mmap_len + modules_len, FrameTag::Kernel)
    {
        Ok(dst) => dst.as_u32(),
        Err(err) => {
            error!(target: "multiboot", "cannot copy boot records: {:?}", err);
            return;
        }
    };
    debug!(target: "multiboot", "copying boot records to {:08x}", dst);

    // SAFETY: source records are loader memory, the destination was just
    // allocated; the ranges cannot overlap.
    unsafe {
        mmu::copy(
            VirtualAddress::new(dst + info_len as u32),
            VirtualAddress::new(info.mmap_addr),
            mmap_len,
        );
    }
    info.mmap_addr = dst + info_len as u32;

    if flags.contains(InfoFlags::MODS) {
        let old_mods = info.mods_addr;
        info.mods_addr = dst + (info_len + mmap_len) as u32;
        for index in 0..info.mods_count {
            let mut module =
                read_struct::<Module>(old_mods + index * core::mem::size_of::<Module>() as u32);
            let payload_len = (module.end - module.start + 1) as usize;
            let string_len = str_len(module.string) + 1;
            let copy = match PMM.lock().alloc(payload_len + string_len, FrameTag::Kernel) {
                Ok(copy) => copy.as_u32(),
                Err(err) => {
                    error!(target: "multiboot", "cannot copy module {}: {:?}", index, err);
                    continue;
                }
            };
            // SAFETY: module payloads sit in loader memory below the
            // fresh allocation.
            unsafe {
                mmu::copy(VirtualAddress::new(copy), VirtualAddress::new(module.start), payload_len);
                mmu::copy(
                    VirtualAddress::new(copy + payload_len as u32),
                    VirtualAddress::new(module.string),
                    string_len,
                );
            }
            module.start = copy;
            module.end = copy + payload_len as u32 - 1;
            module.string = copy + payload_len as u32;
            write_struct(
                info.mods_addr + index * core::mem::size_of::<Module>() as u32,
                &module,
            );
        }
    }

    write_struct(dst, &info);
    INFO_ADDR.store(dst, Ordering::Relaxed);
}

/// Number of boot modules.
pub fn module_count() -> u32 {
    match info() {
        Some(info) if InfoFlags::from_bits_truncate(info.flags).contains(InfoFlags::MODS) => {
            info.mods_count
        }
        _ => 0,
    }
}

/// The `index`-th boot module as an ELF image handle.
pub fn module_image(index: u32) -> Option<ElfImage> {
    let info = info()?;
    if !InfoFlags::from_bits_truncate(info.flags).contains(InfoFlags::MODS)
        || index >= info.mods_count
    {
        return None;
    }
    let module =
        read_struct::<Module>(info.mods_addr + index * core::mem::size_of::<Module>() as u32);
    Some(ElfImage::new(module.start as usize))
}

/// Finds a boot module by its cmdline string.
pub fn module_by_name(name: &str) -> Option<ElfImage> {
    let info = info()?;
    if !InfoFlags::from_bits_truncate(info.flags).contains(InfoFlags::MODS) {
        return None;
    }
    for index in 0..info.mods_count {
        let module =
            read_struct::<Module>(info.mods_addr + index * core::mem::size_of::<Module>() as u32);
        if str_equals(module.string, name) {
            return Some(ElfImage::new(module.start as usize));
        }
    }
    None
}
