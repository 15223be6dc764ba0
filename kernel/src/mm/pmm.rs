//! Physical memory manager
//!
//! Tracks every 4 KiB page frame of the 4 GiB address space in a dense
//! 2-bit-per-frame bitmap and allocates frames by first-fit. The initial
//! picture of free memory comes from the Multiboot memory map.

use log::{debug, error, trace};
use spin::Mutex;

use super::{frame_span, FrameNumber, PhysicalAddress, FRAME_COUNT, FRAME_SIZE};
use crate::boot::multiboot;

/// Bits per frame tag in the bitmap.
const TAG_BITS: usize = 2;

/// Frame tags per 32-bit bitmap word.
const TAGS_PER_WORD: usize = 32 / TAG_BITS;

/// Bitmap size in words. Static allocation costs 256 KiB of kernel image.
const BITMAP_WORDS: usize = FRAME_COUNT / TAGS_PER_WORD;

/// `0b0101...01`: every frame tagged [`FrameTag::Reserved`].
const BITMAP_INIT: u32 = 0x5555_5555;

const TAG_MASK: u32 = (1 << TAG_BITS) - 1;

/// Logical owner of a page frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameTag {
    /// Free for allocation.
    Unused = 0,
    /// BIOS, MMIO, real-mode data, null guard. Never allocated.
    Reserved = 1,
    /// Owned by the kernel (image, stacks, paging structures).
    Kernel = 2,
    /// Owned by user-space mappings.
    User = 3,
}

impl FrameTag {
    const fn from_bits(bits: u32) -> Self {
        match bits & TAG_MASK {
            0 => FrameTag::Unused,
            1 => FrameTag::Reserved,
            2 => FrameTag::Kernel,
            _ => FrameTag::User,
        }
    }
}

/// Physical allocation result type.
pub type Result<T> = core::result::Result<T, PmmError>;

/// Physical allocator errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmmError {
    /// No run of consecutive free frames was long enough.
    OutOfMemory { requested: usize },
}

/// Frame bitmap plus the bookkeeping the VMM needs at paging setup.
pub struct PhysicalMemoryManager {
    bitmap: [u32; BITMAP_WORDS],
    /// Highest frame ever tagged [`FrameTag::Kernel`]. Bounds the identity
    /// mapping the VMM builds at init.
    highest_kernel_frame: u32,
}

impl PhysicalMemoryManager {
    pub const fn new() -> Self {
        Self {
            bitmap: [BITMAP_INIT; BITMAP_WORDS],
            highest_kernel_frame: 0,
        }
    }

    fn set_tag(&mut self, frame: u32, tag: FrameTag) {
        let bit = frame as usize * TAG_BITS;
        let word = &mut self.bitmap[bit / 32];
        let shift = bit % 32;
        *word = (*word & !(TAG_MASK << shift)) | ((tag as u32) << shift);
    }

    fn tag(&self, frame: u32) -> FrameTag {
        let bit = frame as usize * TAG_BITS;
        FrameTag::from_bits(self.bitmap[bit / 32] >> (bit % 32))
    }

    /// Re-tags the whole address space as [`FrameTag::Reserved`], the
    /// assumed state before the boot memory map is folded in.
    pub fn mark_all_reserved(&mut self) {
        self.bitmap = [BITMAP_INIT; BITMAP_WORDS];
        self.highest_kernel_frame = 0;
    }

    /// Tags every frame intersecting `[addr, addr + len)`. Idempotent per
    /// frame, last write wins; zero-length ranges are a no-op.
    pub fn use_range(&mut self, addr: PhysicalAddress, len: usize, tag: FrameTag, label: &str) {
        if len == 0 {
            return;
        }
        let (first, last) = frame_span(addr.as_u32(), len);
        debug!(
            target: "pmm",
            "{} {:08x}-{:08x} (frame {:05x}-{:05x}) for {}",
            if tag == FrameTag::Unused { "free" } else { "use " },
            addr.as_u32(),
            addr.as_u32().wrapping_add(len as u32 - 1),
            first,
            last,
            label
        );
        for frame in first..=last {
            self.set_tag(frame, tag);
        }
        if tag == FrameTag::Kernel && last > self.highest_kernel_frame {
            self.highest_kernel_frame = last;
        }
    }

    /// First-fit scan for enough consecutive unused frames to hold `len`
    /// bytes.
    fn find_free(&self, len: usize) -> Option<FrameNumber> {
        if len == 0 {
            return None;
        }
        let frames = super::frames_for(len);
        let mut free = 0usize;
        for frame in 0..FRAME_COUNT as u32 {
            if self.tag(frame) == FrameTag::Unused {
                free += 1;
            } else {
                free = 0;
            }
            if free >= frames {
                return Some(FrameNumber::new(frame - free as u32 + 1));
            }
        }
        None
    }

    /// Allocates `len` bytes of consecutive frames and tags them `tag`.
    pub fn alloc(&mut self, len: usize, tag: FrameTag) -> Result<PhysicalAddress> {
        let frame = self.find_free(len).ok_or_else(|| {
            error!(target: "pmm", "not enough physical memory for {} bytes", len);
            PmmError::OutOfMemory { requested: len }
        })?;
        let addr = frame.base();
        self.use_range(addr, len, tag, "pmm_alloc");
        Ok(addr)
    }

    /// Returns the frames intersecting `[addr, addr + len)` to the free
    /// pool.
    pub fn free(&mut self, addr: PhysicalAddress, len: usize) {
        if len == 0 {
            return;
        }
        self.use_range(addr, len, FrameTag::Unused, "pmm_free");
    }

    /// Tag of the frame containing `addr`.
    pub fn check(&self, addr: PhysicalAddress) -> FrameTag {
        self.tag(addr.frame().as_u32())
    }

    pub fn highest_kernel_frame(&self) -> FrameNumber {
        FrameNumber::new(self.highest_kernel_frame)
    }

    /// Logs the bitmap state for a physical range, 64 frames per line.
    pub fn debug_dump(&self, addr: PhysicalAddress, len: usize) {
        if len == 0 {
            return;
        }
        let (first, last) = frame_span(addr.as_u32(), len);
        debug!(target: "pmm", "memory bitmap from frame {:05x} to {:05x}:", first, last);
        for line in (first..=last).step_by(64) {
            let mut tags = [0u8; 64];
            let end = (line + 63).min(last);
            for (slot, frame) in (line..=end).enumerate() {
                tags[slot] = b'0' + self.tag(frame) as u8;
            }
            let kib = line as usize * FRAME_SIZE / 1024;
            trace!(
                target: "pmm",
                "[{:7}{}B] {}",
                if kib % 1024 == 0 { kib / 1024 } else { kib },
                if kib % 1024 == 0 { 'M' } else { 'K' },
                core::str::from_utf8(&tags[..=(end - line) as usize]).unwrap_or("?")
            );
        }
    }
}

impl Default for PhysicalMemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Global physical memory manager instance.
pub static PMM: Mutex<PhysicalMemoryManager> = Mutex::new(PhysicalMemoryManager::new());

/// Low-memory span kept for VM86 and the real-mode IVT (the first MiB).
pub const LOWER_MEMORY: usize = 0x10_0000;

/// End of the region covered by the first page table (4 MiB). The kernel
/// image is linked above it.
pub const FIRST_PAGE_TABLE_END: usize = 0x40_0000;

/// Initializes the PMM from the boot loader's memory map.
///
/// All memory starts out reserved; the Multiboot map downgrades available
/// ranges, the kernel image and boot records are claimed, and finally the
/// span between 1 MiB and 4 MiB is released for paging structures.
pub fn init() {
    crate::print!("PMM init ... ");
    PMM.lock().mark_all_reserved();
    if !multiboot::fold_memory_map() {
        crate::print::fail("Memory map not found.");
        return;
    }

    // Keep the first page table's span reserved: the null guard, the BIOS
    // data area and the real-mode IVT live there, and VM86 tasks reuse it.
    debug!(target: "pmm", "reserving the first 4 MiB for VM86 and low memory");
    {
        let mut pmm = PMM.lock();
        pmm.use_range(
            PhysicalAddress::new(0),
            FIRST_PAGE_TABLE_END,
            FrameTag::Reserved,
            "VM86 memory",
        );

        let (kernel_start, kernel_len) = crate::arch::x86::kernel_image_span();
        debug!(
            target: "pmm",
            "kernel image {:08x}-{:08x}",
            kernel_start.as_u32(),
            kernel_start.as_u32() + kernel_len as u32 - 1
        );
        pmm.use_range(kernel_start, kernel_len, FrameTag::Kernel, "kernel");
    }

    // The boot records are copied right after the kernel so the span below
    // 4 MiB can be handed back before VM86 overwrites it.
    multiboot::copy_boot_records();
    PMM.lock().use_range(
        PhysicalAddress::new(LOWER_MEMORY as u32),
        FIRST_PAGE_TABLE_END - LOWER_MEMORY,
        FrameTag::Unused,
        "released low memory",
    );
    crate::print::ok();
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use std::boxed::Box;

    fn fresh() -> Box<PhysicalMemoryManager> {
        let mut pmm = Box::new(PhysicalMemoryManager::new());
        // 1 MiB reserved, then 3 MiB free, mirroring early boot.
        pmm.use_range(
            PhysicalAddress::new(LOWER_MEMORY as u32),
            3 * 1024 * 1024,
            FrameTag::Unused,
            "test range",
        );
        pmm
    }

    #[test]
    fn fresh_manager_is_fully_reserved() {
        let pmm = Box::new(PhysicalMemoryManager::new());
        assert_eq!(pmm.check(PhysicalAddress::new(0)), FrameTag::Reserved);
        assert_eq!(
            pmm.check(PhysicalAddress::new(0xFFFF_F000)),
            FrameTag::Reserved
        );
    }

    #[test]
    fn alloc_and_free_round_trip() {
        let mut pmm = fresh();

        let addr = pmm
            .alloc(2 * FRAME_SIZE, FrameTag::Kernel)
            .expect("allocation from 3 MiB of free frames should succeed");
        assert_eq!(addr.as_usize(), LOWER_MEMORY);
        assert_eq!(pmm.check(addr), FrameTag::Kernel);
        assert_eq!(
            pmm.check(addr.offset(FRAME_SIZE as u32)),
            FrameTag::Kernel
        );

        pmm.free(addr, 2 * FRAME_SIZE);
        assert_eq!(pmm.check(addr), FrameTag::Unused);
        assert_eq!(
            pmm.check(addr.offset(FRAME_SIZE as u32)),
            FrameTag::Unused
        );

        // The whole free region is allocatable again after the free.
        let all = pmm
            .alloc(3 * 1024 * 1024, FrameTag::Kernel)
            .expect("re-allocating the full region should succeed");
        assert_eq!(all.as_usize(), LOWER_MEMORY);
    }

    #[test]
    fn alloc_skips_reserved_frames() {
        let mut pmm = fresh();
        // Poke a hole into the free region.
        pmm.use_range(
            PhysicalAddress::new((LOWER_MEMORY + FRAME_SIZE) as u32),
            FRAME_SIZE,
            FrameTag::Reserved,
            "hole",
        );

        let addr = pmm
            .alloc(2 * FRAME_SIZE, FrameTag::User)
            .expect("allocation should skip past the reserved hole");
        assert_eq!(addr.as_usize(), LOWER_MEMORY + 2 * FRAME_SIZE);
    }

    #[test]
    fn alloc_fails_when_no_run_is_long_enough() {
        let mut pmm = Box::new(PhysicalMemoryManager::new());
        pmm.use_range(
            PhysicalAddress::new(LOWER_MEMORY as u32),
            FRAME_SIZE,
            FrameTag::Unused,
            "single frame",
        );
        assert_eq!(
            pmm.alloc(2 * FRAME_SIZE, FrameTag::Kernel),
            Err(PmmError::OutOfMemory {
                requested: 2 * FRAME_SIZE
            })
        );
    }

    #[test]
    fn highest_kernel_frame_tracks_kernel_tags() {
        let mut pmm = fresh();
        pmm.use_range(
            PhysicalAddress::new(0x40_0000),
            2 * FRAME_SIZE,
            FrameTag::Kernel,
            "kernel",
        );
        assert_eq!(pmm.highest_kernel_frame().as_u32(), 0x401);

        // User tags must not move the bound.
        pmm.use_range(
            PhysicalAddress::new(0x80_0000),
            FRAME_SIZE,
            FrameTag::User,
            "user",
        );
        assert_eq!(pmm.highest_kernel_frame().as_u32(), 0x401);
    }

    #[test]
    fn zero_length_operations_are_noops() {
        let mut pmm = fresh();
        pmm.use_range(PhysicalAddress::new(0), 0, FrameTag::Kernel, "empty");
        assert_eq!(pmm.check(PhysicalAddress::new(0)), FrameTag::Reserved);
        pmm.free(PhysicalAddress::new(0), 0);
        assert_eq!(pmm.check(PhysicalAddress::new(0)), FrameTag::Reserved);
    }

    #[test]
    fn last_write_wins_per_frame() {
        let mut pmm = fresh();
        let addr = PhysicalAddress::new(LOWER_MEMORY as u32);
        pmm.use_range(addr, FRAME_SIZE, FrameTag::Kernel, "first");
        pmm.use_range(addr, FRAME_SIZE, FrameTag::User, "second");
        assert_eq!(pmm.check(addr), FrameTag::User);
    }
}
