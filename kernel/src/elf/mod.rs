//! ELF32 loader
//!
//! User tasks come from ELF executables handed over as GRUB boot modules.
//! Only little-endian ELF32 executables for x86 are accepted; loading maps
//! every PT_LOAD segment into a fresh page directory and hands the entry
//! point to the task layer.

use bitflags::bitflags;
use log::{debug, error};

use crate::{
    arch::x86::mmu,
    interrupts,
    mm::{vmm, PhysicalAddress, VirtualAddress},
    task::{self, TaskPid},
};

const MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const EI_VERSION: usize = 6;

const CLASS_32_BIT: u8 = 1;
const DATA_LITTLE_ENDIAN: u8 = 1;
const VERSION: u8 = 1;
const TYPE_EXECUTABLE: u16 = 2;
const MACHINE_X86: u16 = 3;

/// The only program-header type the loader processes.
const PT_LOAD: u32 = 1;

bitflags! {
    /// Program header `p_flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        const EXECUTE = 1 << 0;
        const WRITE = 1 << 1;
        const READ = 1 << 2;
    }
}

/// ELF32 file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ElfHeader {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u32,
    pub e_phoff: u32,
    pub e_shoff: u32,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

/// ELF32 program header entry.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ProgramHeader {
    pub p_type: u32,
    /// Where the segment starts in the file.
    pub p_offset: u32,
    /// Where the segment lives in virtual memory.
    pub p_vaddr: u32,
    /// Physical load address; only meaningful without an MMU.
    pub p_paddr: u32,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: u32,
    pub p_align: u32,
}

/// ELF result type.
pub type Result<T> = core::result::Result<T, ElfError>;

/// Validation and load errors; all reported, the load aborts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    MagicNotFound,
    Not32Bit,
    NotLittleEndian,
    UnsupportedVersion,
    NotExecutable,
    NotX86,
    /// A PT_LOAD segment could not be mapped into the target directory.
    SegmentMapFailed { vaddr: VirtualAddress },
}

/// Non-owning handle to a contiguous ELF image in kernel-reachable
/// memory. Tasks keep one so their segments can be unloaded at
/// destruction; the boot module memory itself stays owned by the PMM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElfImage {
    base: usize,
}

impl ElfImage {
    /// Wraps the start address of an ELF file in memory.
    pub fn new(base: usize) -> Self {
        Self { base }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    fn header(&self) -> ElfHeader {
        // SAFETY: the handle was constructed over a readable image; the
        // header is read unaligned because module memory has no
        // alignment guarantee.
        unsafe { core::ptr::read_unaligned(self.base as *const ElfHeader) }
    }

    fn program_header(&self, header: &ElfHeader, index: usize) -> ProgramHeader {
        let addr = self.base + header.e_phoff as usize + index * header.e_phentsize as usize;
        // SAFETY: as in `header`; the program-header table location comes
        // from the validated file header.
        unsafe { core::ptr::read_unaligned(addr as *const ProgramHeader) }
    }
}

/// Checks that the image is a little-endian ELF32 executable for x86.
fn validate(image: ElfImage) -> Result<ElfHeader> {
    let header = image.header();
    if header.e_ident[..4] != MAGIC {
        error!(target: "elf", "ELF magic not found");
        return Err(ElfError::MagicNotFound);
    }
    if header.e_ident[EI_CLASS] != CLASS_32_BIT {
        error!(target: "elf", "ELF not 32-bit");
        return Err(ElfError::Not32Bit);
    }
    if header.e_ident[EI_DATA] != DATA_LITTLE_ENDIAN {
        error!(target: "elf", "ELF not little endian");
        return Err(ElfError::NotLittleEndian);
    }
    if header.e_ident[EI_VERSION] != VERSION || header.e_version != VERSION as u32 {
        error!(target: "elf", "ELF version not 1");
        return Err(ElfError::UnsupportedVersion);
    }
    if header.e_type != TYPE_EXECUTABLE {
        error!(target: "elf", "ELF not executable");
        return Err(ElfError::NotExecutable);
    }
    if header.e_machine != MACHINE_X86 {
        error!(target: "elf", "ELF target not x86");
        return Err(ElfError::NotX86);
    }
    Ok(header)
}

/// Maps the image's PT_LOAD segments into `directory` and returns the
/// entry point. Each segment is reserved at `p_vaddr` for `p_memsz`
/// bytes, zeroed (BSS), then filled with `p_filesz` bytes from the file.
pub fn load(image: ElfImage, directory: PhysicalAddress) -> Result<VirtualAddress> {
    let header = validate(image)?;
    debug!(target: "elf", "program header entries:");
    vmm::modify_directory(directory);
    for index in 0..header.e_phnum as usize {
        let entry = image.program_header(&header, index);
        debug!(
            target: "elf",
            "[{}] type={} offset={:08x} vaddr={:08x} filesz={:08x} memsz={:08x} flags={:03b}",
            index, entry.p_type, entry.p_offset, entry.p_vaddr, entry.p_filesz,
            entry.p_memsz, entry.p_flags
        );
        if entry.p_type != PT_LOAD || entry.p_memsz == 0 {
            continue;
        }
        let vaddr = VirtualAddress::new(entry.p_vaddr);
        let flags = if SegmentFlags::from_bits_truncate(entry.p_flags)
            .contains(SegmentFlags::WRITE)
        {
            vmm::VmFlags::USER | vmm::VmFlags::WRITABLE
        } else {
            vmm::VmFlags::USER
        };
        // Claim the memory so the copy below can write to it.
        if let Err(err) = vmm::use_virtual(vaddr, entry.p_memsz as usize, flags) {
            error!(
                target: "elf",
                "cannot reserve segment at {:08x}: {:?}",
                entry.p_vaddr, err
            );
            vmm::modified_directory();
            return Err(ElfError::SegmentMapFailed { vaddr });
        }
        // SAFETY: the segment span was just mapped writable into the
        // directory under modification; the source slice lies inside the
        // module image.
        unsafe {
            mmu::zero(vaddr, entry.p_memsz as usize);
            let src = core::slice::from_raw_parts(
                (image.base() + entry.p_offset as usize) as *const u8,
                entry.p_filesz as usize,
            );
            mmu::copy_in(vaddr, src);
        }
    }
    vmm::modified_directory();
    Ok(VirtualAddress::new(header.e_entry))
}

/// Frees the image's PT_LOAD segments inside `directory`.
pub fn unload(image: ElfImage, directory: PhysicalAddress) {
    let Ok(header) = validate(image) else {
        return;
    };
    vmm::modify_directory(directory);
    for index in 0..header.e_phnum as usize {
        let entry = image.program_header(&header, index);
        if entry.p_type == PT_LOAD {
            vmm::free(VirtualAddress::new(entry.p_vaddr), entry.p_memsz as usize);
        }
    }
    vmm::modified_directory();
}

/// Creates a user task running the image: fresh directory, segments
/// loaded, task record keeping the image reference for destruction.
pub fn create_task(
    image: ElfImage,
    kernel_stack_len: usize,
    user_stack_len: usize,
) -> Option<TaskPid> {
    let prev_interrupts = interrupts::enable_interrupts(false);
    let directory = match vmm::create_directory() {
        Ok(directory) => directory,
        Err(err) => {
            error!(target: "elf", "no page directory for ELF task: {:?}", err);
            interrupts::enable_interrupts(prev_interrupts);
            return None;
        }
    };
    let entry = match load(image, directory) {
        Ok(entry) => entry,
        Err(_) => {
            vmm::destroy_directory(directory);
            interrupts::enable_interrupts(prev_interrupts);
            return None;
        }
    };
    let pid = task::create_user(
        entry,
        Some(directory),
        kernel_stack_len,
        user_stack_len,
        Some(image),
    );
    interrupts::enable_interrupts(prev_interrupts);
    pid
}

/// Destroys an ELF task: unmaps the image's segments, then the task.
pub fn destroy_task(pid: TaskPid) {
    let prev_interrupts = interrupts::enable_interrupts(false);
    if let Some(image) = task::elf(pid) {
        unload(image, task::page_directory(pid));
    }
    task::destroy(pid);
    interrupts::enable_interrupts(prev_interrupts);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::test_support::minimal_executable;

    #[test]
    fn accepts_a_minimal_executable() {
        let image = minimal_executable(0x4000_0000, &[0xB8, 0x2A, 0, 0, 0, 0xCD, 0x30]);
        let header = validate(ElfImage::new(image.as_ptr() as usize))
            .expect("minimal ELF32 executable should validate");
        assert_eq!(header.e_entry, 0x4000_0000);
        assert_eq!(header.e_phnum, 1);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut image = minimal_executable(0x4000_0000, &[0x90]);
        image[0] = 0x7E;
        assert_eq!(
            validate(ElfImage::new(image.as_ptr() as usize)),
            Err(ElfError::MagicNotFound)
        );
    }

    #[test]
    fn rejects_wrong_class_endianness_and_machine() {
        let base = minimal_executable(0x4000_0000, &[0x90]);

        let mut image = base.clone();
        image[super::EI_CLASS] = 2;
        assert_eq!(
            validate(ElfImage::new(image.as_ptr() as usize)),
            Err(ElfError::Not32Bit)
        );

        let mut image = base.clone();
        image[super::EI_DATA] = 2;
        assert_eq!(
            validate(ElfImage::new(image.as_ptr() as usize)),
            Err(ElfError::NotLittleEndian)
        );

        let mut image = base.clone();
        // e_machine low byte: 62 would be x86-64.
        image[18] = 62;
        assert_eq!(
            validate(ElfImage::new(image.as_ptr() as usize)),
            Err(ElfError::NotX86)
        );
    }

    #[test]
    fn rejects_relocatable_objects() {
        let mut image = minimal_executable(0x4000_0000, &[0x90]);
        // e_type low byte: 1 = relocatable.
        image[16] = 1;
        assert_eq!(
            validate(ElfImage::new(image.as_ptr() as usize)),
            Err(ElfError::NotExecutable)
        );
    }
}
