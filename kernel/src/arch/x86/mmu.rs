//! Memory management unit gateway
//!
//! Thin layer over CR0/CR2/CR3 and the TLB. Everything above this module
//! speaks [`VirtualAddress`]; the only way the kernel dereferences one is
//! through [`virt_to_ptr`] and the byte accessors built on it.
//!
//! On hosted builds the same interface is backed by a software MMU: lazily
//! materialized 4 KiB frames plus the IA-32 two-level page walk. The
//! recursive self-map falls out of the walk exactly as it does in hardware,
//! so the virtual memory manager and everything above it run unmodified
//! under `cargo test`.

use bitflags::bitflags;
use log::error;

use crate::{
    interrupts,
    mm::{VirtualAddress, FRAME_SIZE},
};

bitflags! {
    /// Page-fault error word pushed by the CPU on vector 0x0E.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultCode: u32 {
        /// Set: protection violation; clear: non-present page.
        const PROTECTION = 1 << 0;
        /// Set: write access; clear: read access.
        const WRITE = 1 << 1;
        /// Set: fault in ring 3; clear: fault in ring 0.
        const USER = 1 << 2;
        /// Reserved bit set in a paging structure.
        const RESERVED = 1 << 3;
        /// Instruction fetch (with NX-capable hardware).
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

/// Registers the page-fault handler. This kernel has no demand paging, so
/// every page fault is fatal.
pub fn init() {
    interrupts::register_handler(interrupts::EXCEPTION_PAGE_FAULT, handle_page_fault);
}

fn handle_page_fault(frame: VirtualAddress) -> VirtualAddress {
    // SAFETY: `frame` is the ESP the interrupt stub saved; it points at a
    // complete CpuState on the interrupted task's kernel stack.
    let cpu = unsafe { interrupts::cpu_state(frame) };
    let code = PageFaultCode::from_bits_truncate(cpu.error);
    let addr = fault_address();
    error!(
        target: "mmu",
        "page fault caused by the virtual address {:08x} ({} while {} {}{}{})",
        addr.as_u32(),
        if code.contains(PageFaultCode::PROTECTION) {
            "protection violation"
        } else {
            "non-present page"
        },
        if code.contains(PageFaultCode::WRITE) {
            "writing"
        } else {
            "reading"
        },
        if code.contains(PageFaultCode::USER) {
            "in user space"
        } else {
            "in the kernel"
        },
        if code.contains(PageFaultCode::RESERVED) {
            ", reserved write"
        } else {
            ""
        },
        if code.contains(PageFaultCode::INSTRUCTION_FETCH) {
            ", instruction fetch"
        } else {
            ""
        },
    );
    let (intr, eip) = (cpu.intr, cpu.eip);
    interrupts::dump_cpu(frame);
    panic!("EX{:02x} (EIP={:08x})", intr, eip);
}

pub use self::hw::{
    disable_paging, enable_paging, fault_address, flush_tlb, load_directory, paging_enabled,
    virt_to_ptr,
};

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub use self::hw::reset;

/// Zeroes `len` bytes of virtual memory, page chunk by page chunk.
///
/// # Safety
///
/// The whole range must be mapped (or paging must be off) and not overlap
/// memory the caller holds references into.
pub unsafe fn zero(vaddr: VirtualAddress, len: usize) {
    let mut done = 0usize;
    while done < len {
        let addr = vaddr.offset(done as u32);
        let chunk = (len - done).min(FRAME_SIZE - addr.page_offset() as usize);
        // SAFETY: per-page chunking keeps every write inside one mapped
        // frame; the caller guarantees the mapping.
        unsafe { core::ptr::write_bytes(virt_to_ptr(addr), 0, chunk) };
        done += chunk;
    }
}

/// Copies a byte slice into virtual memory.
///
/// # Safety
///
/// See [`zero`].
pub unsafe fn copy_in(vaddr: VirtualAddress, src: &[u8]) {
    let mut done = 0usize;
    while done < src.len() {
        let addr = vaddr.offset(done as u32);
        let chunk = (src.len() - done).min(FRAME_SIZE - addr.page_offset() as usize);
        // SAFETY: per-page chunking, mapping guaranteed by the caller; the
        // source slice is valid by construction.
        unsafe {
            core::ptr::copy_nonoverlapping(src[done..].as_ptr(), virt_to_ptr(addr), chunk)
        };
        done += chunk;
    }
}

/// Copies virtual memory out into a byte slice.
///
/// # Safety
///
/// See [`zero`].
pub unsafe fn copy_out(vaddr: VirtualAddress, dst: &mut [u8]) {
    let mut done = 0usize;
    while done < dst.len() {
        let addr = vaddr.offset(done as u32);
        let chunk = (dst.len() - done).min(FRAME_SIZE - addr.page_offset() as usize);
        // SAFETY: per-page chunking, mapping guaranteed by the caller.
        unsafe {
            core::ptr::copy_nonoverlapping(virt_to_ptr(addr), dst[done..].as_mut_ptr(), chunk)
        };
        done += chunk;
    }
}

/// Copies between two virtual ranges through a bounce buffer, so neither
/// range needs to be physically contiguous.
///
/// # Safety
///
/// Both ranges must be mapped (or paging must be off) and must not
/// overlap.
pub unsafe fn copy(dst: VirtualAddress, src: VirtualAddress, len: usize) {
    let mut buffer = [0u8; 256];
    let mut moved = 0usize;
    while moved < len {
        let chunk = (len - moved).min(buffer.len());
        // SAFETY: forwarded caller contract.
        unsafe {
            copy_out(src.offset(moved as u32), &mut buffer[..chunk]);
            copy_in(dst.offset(moved as u32), &buffer[..chunk]);
        }
        moved += chunk;
    }
}

/// Reads one byte of virtual memory.
///
/// # Safety
///
/// The address must be mapped (or paging must be off).
pub unsafe fn read_u8(vaddr: VirtualAddress) -> u8 {
    let mut byte = [0u8; 1];
    // SAFETY: forwarded caller contract.
    unsafe { copy_out(vaddr, &mut byte) };
    byte[0]
}

/// Reads a little-endian word of virtual memory, page straddling allowed.
///
/// # Safety
///
/// See [`read_u8`].
pub unsafe fn read_u16(vaddr: VirtualAddress) -> u16 {
    let mut bytes = [0u8; 2];
    // SAFETY: forwarded caller contract.
    unsafe { copy_out(vaddr, &mut bytes) };
    u16::from_le_bytes(bytes)
}

/// Writes a little-endian word of virtual memory, page straddling allowed.
///
/// # Safety
///
/// See [`zero`].
pub unsafe fn write_u16(vaddr: VirtualAddress, value: u16) {
    // SAFETY: forwarded caller contract.
    unsafe { copy_in(vaddr, &value.to_le_bytes()) };
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod hw {
    use x86::controlregs::{cr0, cr0_write, cr2, cr3_write, Cr0};

    use crate::mm::{PhysicalAddress, VirtualAddress};

    /// Loads a page directory into CR3. Also flushes the TLB.
    pub fn load_directory(dir: PhysicalAddress) {
        // SAFETY: the caller hands us the physical address of a valid page
        // directory whose kernel domain covers the executing code.
        unsafe { cr3_write(dir.as_u32() as u64) };
    }

    /// Loads a page directory and turns on the paging bit in CR0.
    pub fn enable_paging(dir: PhysicalAddress) {
        load_directory(dir);
        // SAFETY: the directory identity-maps the kernel, so execution
        // continues seamlessly at the next instruction.
        unsafe {
            let flags = cr0();
            cr0_write(flags | Cr0::CR0_ENABLE_PAGING);
        }
    }

    /// Clears the paging bit; linear addresses become physical again.
    pub fn disable_paging() {
        // SAFETY: the kernel is identity-mapped, so execution continues
        // at the same linear addresses without translation.
        unsafe {
            let flags = cr0();
            cr0_write(flags & !Cr0::CR0_ENABLE_PAGING);
        }
    }

    pub fn paging_enabled() -> bool {
        // SAFETY: reading CR0 has no side effects in ring 0.
        unsafe { cr0().contains(Cr0::CR0_ENABLE_PAGING) }
    }

    /// Drops the cached translation for one page.
    pub fn flush_tlb(vaddr: VirtualAddress) {
        // SAFETY: invlpg only invalidates a TLB entry.
        unsafe { x86::tlb::flush(vaddr.as_usize()) };
    }

    /// Linear address that caused the latest page fault (CR2).
    pub fn fault_address() -> VirtualAddress {
        // SAFETY: reading CR2 has no side effects in ring 0.
        VirtualAddress::new(unsafe { cr2() } as u32)
    }

    /// With a flat segment model a mapped virtual address *is* a pointer.
    pub fn virt_to_ptr(vaddr: VirtualAddress) -> *mut u8 {
        vaddr.as_u32() as *mut u8
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
mod hw {
    //! Software MMU for hosted builds: sparse physical frames and the
    //! IA-32 page walk, including the recursive self-map behavior.

    use spin::Mutex;
    use std::{boxed::Box, collections::BTreeMap};

    use crate::mm::{
        page_table::PageFlags, PhysicalAddress, VirtualAddress, FRAME_SHIFT,
    };

    /// Backing storage for one physical frame, aligned to the frame size
    /// so pointers into it satisfy `#[repr(align(4096))]` structures like
    /// `PageDirectory`/`PageTable`.
    #[repr(C, align(4096))]
    struct Frame([u32; 1024]);

    struct SoftMmu {
        /// Frame number to backing storage. u32 words keep page-structure
        /// and CPU-frame accesses aligned.
        frames: BTreeMap<u32, Box<Frame>>,
        cr3: u32,
        paging: bool,
    }

    static SOFT_MMU: Mutex<SoftMmu> = Mutex::new(SoftMmu {
        frames: BTreeMap::new(),
        cr3: 0,
        paging: false,
    });

    /// Pointer to the backing storage of a physical frame, materializing
    /// it zero-filled on first touch. The box is never moved or dropped
    /// until [`reset`], so the pointer stays valid across calls.
    fn frame_ptr(frame: u32) -> *mut u8 {
        let mut mmu = SOFT_MMU.lock();
        mmu.frames
            .entry(frame)
            .or_insert_with(|| Box::new(Frame([0u32; 1024])))
            .0
            .as_mut_ptr()
            .cast()
    }

    fn entry(frame: u32, index: usize) -> u32 {
        let mut mmu = SOFT_MMU.lock();
        mmu.frames
            .entry(frame)
            .or_insert_with(|| Box::new(Frame([0u32; 1024])))
            .0[index]
    }

    pub fn load_directory(dir: PhysicalAddress) {
        SOFT_MMU.lock().cr3 = dir.as_u32();
    }

    pub fn enable_paging(dir: PhysicalAddress) {
        let mut mmu = SOFT_MMU.lock();
        mmu.cr3 = dir.as_u32();
        mmu.paging = true;
    }

    pub fn disable_paging() {
        SOFT_MMU.lock().paging = false;
    }

    pub fn paging_enabled() -> bool {
        SOFT_MMU.lock().paging
    }

    pub fn flush_tlb(_vaddr: VirtualAddress) {}

    pub fn fault_address() -> VirtualAddress {
        VirtualAddress::new(0)
    }

    /// The software page walk. Panics on an unmapped access, which in a
    /// test is the moral equivalent of the page-fault panic on hardware.
    pub fn virt_to_ptr(vaddr: VirtualAddress) -> *mut u8 {
        let (cr3, paging) = {
            let mmu = SOFT_MMU.lock();
            (mmu.cr3, mmu.paging)
        };
        if !paging {
            let ptr = frame_ptr(vaddr.frame().as_u32());
            return ptr.wrapping_add(vaddr.page_offset() as usize);
        }
        let pde = entry(cr3 >> FRAME_SHIFT, vaddr.directory_index());
        assert!(
            PageFlags::from_bits_truncate(pde).contains(PageFlags::PRESENT),
            "page fault at {:08x} (no page table)",
            vaddr.as_u32()
        );
        let pte = entry(pde >> FRAME_SHIFT, vaddr.table_index());
        assert!(
            PageFlags::from_bits_truncate(pte).contains(PageFlags::PRESENT),
            "page fault at {:08x} (page not present)",
            vaddr.as_u32()
        );
        frame_ptr(pte >> FRAME_SHIFT).wrapping_add(vaddr.page_offset() as usize)
    }

    /// Drops all frames and paging state. Tests call this between
    /// scenarios; they are serialized by a shared lock.
    pub fn reset() {
        let mut mmu = SOFT_MMU.lock();
        mmu.frames.clear();
        mmu.cr3 = 0;
        mmu.paging = false;
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::test_support::kernel_lock;

    #[test]
    fn page_fault_code_decodes() {
        let code = PageFaultCode::from_bits_truncate(0b00111);
        assert!(code.contains(PageFaultCode::PROTECTION));
        assert!(code.contains(PageFaultCode::WRITE));
        assert!(code.contains(PageFaultCode::USER));
        assert!(!code.contains(PageFaultCode::RESERVED));
    }

    #[test]
    fn identity_access_with_paging_off() {
        let _guard = kernel_lock();
        reset();

        let addr = VirtualAddress::new(0x10_0000);
        // SAFETY: paging is off in the soft MMU, accesses materialize frames.
        unsafe {
            copy_in(addr, b"obsidian");
            let mut buf = [0u8; 8];
            copy_out(addr, &mut buf);
            assert_eq!(&buf, b"obsidian");
        }
    }

    #[test]
    fn word_access_straddles_page_boundary() {
        let _guard = kernel_lock();
        reset();

        let addr = VirtualAddress::new(0x10_0FFF);
        // SAFETY: paging off, both touched frames materialize on demand.
        unsafe {
            write_u16(addr, 0xBEEF);
            assert_eq!(read_u16(addr), 0xBEEF);
            assert_eq!(read_u8(addr), 0xEF);
            assert_eq!(read_u8(addr.offset(1)), 0xBE);
        }
    }
}
