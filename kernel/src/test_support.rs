//! Shared plumbing for host tests
//!
//! The kernel's state is global by nature (one PMM, one current page
//! directory, one task table), so tests that touch it serialize on
//! [`kernel_lock`] and rebuild the world from scratch with
//! [`reset_kernel`] or [`boot_kernel`].

use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    vec,
    vec::Vec,
};

use crate::{
    arch::x86::mmu,
    interrupts,
    mm::{
        pmm::{FrameTag, FIRST_PAGE_TABLE_END, LOWER_MEMORY, PMM},
        vmm, PhysicalAddress,
    },
    sched, task,
};

static KERNEL_LOCK: Mutex<()> = Mutex::new(());

/// Serializes tests that touch global kernel state. A panicking test
/// poisons nothing we care about; the next test rebuilds the state.
pub fn kernel_lock() -> MutexGuard<'static, ()> {
    KERNEL_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drops every piece of global kernel state back to its pre-boot shape.
pub fn reset_kernel() {
    mmu::reset();
    vmm::reset_state();
    task::reset_table();
    sched::reset_state();
    PMM.lock().mark_all_reserved();
    interrupts::enable_interrupts(false);
}

/// Hosted equivalent of the boot path: the PMM picture `pmm::init`
/// leaves behind (15 MiB of RAM above 1 MiB, low memory reserved, the
/// kernel image claimed, 1-4 MiB released), then `vmm::init`, which
/// activates paging in the software MMU, then the VM86 monitor.
pub fn boot_kernel() {
    reset_kernel();
    {
        let mut pmm = PMM.lock();
        pmm.use_range(
            PhysicalAddress::new(LOWER_MEMORY as u32),
            15 * 1024 * 1024,
            FrameTag::Unused,
            "boot memory map",
        );
        pmm.use_range(
            PhysicalAddress::new(0),
            FIRST_PAGE_TABLE_END,
            FrameTag::Reserved,
            "VM86 memory",
        );
        let (kernel_start, kernel_len) = crate::arch::x86::kernel_image_span();
        pmm.use_range(kernel_start, kernel_len, FrameTag::Kernel, "kernel");
        pmm.use_range(
            PhysicalAddress::new(LOWER_MEMORY as u32),
            FIRST_PAGE_TABLE_END - LOWER_MEMORY,
            FrameTag::Unused,
            "released low memory",
        );
    }
    vmm::init();
    interrupts::syscall::init();
    crate::vm86::init();
}

/// Builds a minimal little-endian ELF32 executable for x86 with a single
/// PT_LOAD segment at `vaddr` holding `code`, entry point at `vaddr`.
pub fn minimal_executable(vaddr: u32, code: &[u8]) -> Vec<u8> {
    let mut image = vec![0u8; 84 + code.len()];
    // e_ident: magic, 32-bit, little endian, header version 1.
    image[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
    image[4] = 1;
    image[5] = 1;
    image[6] = 1;
    image[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    image[18..20].copy_from_slice(&3u16.to_le_bytes()); // EM_386
    image[20..24].copy_from_slice(&1u32.to_le_bytes()); // e_version
    image[24..28].copy_from_slice(&vaddr.to_le_bytes()); // e_entry
    image[28..32].copy_from_slice(&52u32.to_le_bytes()); // e_phoff
    image[42..44].copy_from_slice(&32u16.to_le_bytes()); // e_phentsize
    image[44..46].copy_from_slice(&1u16.to_le_bytes()); // e_phnum
    // The program header at offset 52, the segment payload at 84.
    image[52..56].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    image[56..60].copy_from_slice(&84u32.to_le_bytes()); // p_offset
    image[60..64].copy_from_slice(&vaddr.to_le_bytes()); // p_vaddr
    image[68..72].copy_from_slice(&(code.len() as u32).to_le_bytes()); // p_filesz
    image[72..76].copy_from_slice(&(code.len() as u32).to_le_bytes()); // p_memsz
    image[76..80].copy_from_slice(&7u32.to_le_bytes()); // RWX
    image[84..].copy_from_slice(code);
    image
}
