//! IA-32 two-level paging structures
//!
//! A page directory holds 1024 entries, each describing the page table for
//! one 4 MiB slice of the address space. The last entry of every directory
//! built by this kernel points back at the directory itself, which makes
//! the directory reachable at [`PAGEDIR_WINDOW`] and table *k* at
//! [`pagetab_window`]`(k)` whenever the directory is current.

use bitflags::bitflags;

use super::{FrameNumber, VirtualAddress, FRAME_SHIFT, FRAME_SIZE};

/// Entries per page directory and per page table.
pub const ENTRY_COUNT: usize = 1024;

/// Virtual address of the current page directory via the self-map.
pub const PAGEDIR_WINDOW: VirtualAddress = VirtualAddress::new(0xFFFF_F000);

/// Virtual address of the current directory's page table `index`.
pub const fn pagetab_window(index: usize) -> VirtualAddress {
    VirtualAddress::new(0xFFC0_0000 + (index * FRAME_SIZE) as u32)
}

bitflags! {
    /// Low bits shared by directory and table entries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE = 1 << 4;
        const ACCESSED = 1 << 5;
        /// Table entries only.
        const DIRTY = 1 << 6;
        /// Directory entries only: 4 MiB page size.
        const HUGE = 1 << 7;
        /// Table entries only: survives TLB flushes.
        const GLOBAL = 1 << 8;
    }
}

/// A page directory entry: the physical frame of a page table plus flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageDirectoryEntry(u32);

impl PageDirectoryEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn new(table: FrameNumber, flags: PageFlags) -> Self {
        Self((table.as_u32() << FRAME_SHIFT) | flags.bits())
    }

    pub fn is_present(&self) -> bool {
        self.flags().contains(PageFlags::PRESENT)
    }

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    /// Physical frame holding the page table.
    pub fn table_frame(&self) -> FrameNumber {
        FrameNumber::new(self.0 >> FRAME_SHIFT)
    }
}

/// A page table entry: the physical frame of one mapped page plus flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn new(page: FrameNumber, flags: PageFlags) -> Self {
        Self((page.as_u32() << FRAME_SHIFT) | flags.bits())
    }

    pub fn is_present(&self) -> bool {
        self.flags().contains(PageFlags::PRESENT)
    }

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    /// Physical frame this entry maps.
    pub fn frame(&self) -> FrameNumber {
        FrameNumber::new(self.0 >> FRAME_SHIFT)
    }
}

/// One page directory. Always accessed through raw pointers: the structure
/// lives in a physical frame reachable either by identity (paging off) or
/// through the self-map windows.
#[repr(C, align(4096))]
pub struct PageDirectory {
    pub entries: [PageDirectoryEntry; ENTRY_COUNT],
}

/// One page table, same access rules as [`PageDirectory`].
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [PageTableEntry; ENTRY_COUNT],
}
