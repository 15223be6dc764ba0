//! Virtual memory manager
//!
//! Manages paging and per-task address spaces. Every page directory built
//! here carries the recursive self-map: its last entry points at the
//! directory's own frame. Once such a directory is current, the directory
//! is addressable at `0xFFFFF000` and page table *k* at
//! `0xFFC00000 + k * 4096`, so all structural edits are O(1) without
//! scratch mappings.
//!
//! Two fixed domains split the address space. The kernel domain
//! (`0x00400000..=0x3FFFFFFF`) is identity-mapped and kept in sync across
//! all directories at switch time; the user domain
//! (`0x40000000..=0xFFBFFFFF`) is private per directory. The first 4 MiB
//! are deliberately left out of the kernel domain so low memory stays
//! available for VM86, and the top 4 MiB belong to the self-map.

use bitflags::bitflags;
use log::{debug, error, trace};
use spin::Mutex;

use super::{
    page_table::{
        pagetab_window, PageDirectory, PageDirectoryEntry, PageFlags, PageTable, PageTableEntry,
        ENTRY_COUNT, PAGEDIR_WINDOW,
    },
    pmm::{FrameTag, PmmError, PMM},
    FrameNumber, PhysicalAddress, VirtualAddress, FRAME_SIZE,
};
use crate::{arch::x86::mmu, interrupts};

bitflags! {
    /// Mapping permissions. An empty set maps kernel-only, read-only.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmFlags: u32 {
        const WRITABLE = 1 << 0;
        const USER = 1 << 1;
    }
}

/// A fixed virtual range with a sharing and permission policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Domain {
    pub start: VirtualAddress,
    /// Inclusive upper bound.
    pub end: VirtualAddress,
}

impl Domain {
    pub const fn contains(&self, vaddr: VirtualAddress) -> bool {
        vaddr.as_u32() >= self.start.as_u32() && vaddr.as_u32() <= self.end.as_u32()
    }
}

/// Identity-mapped into every directory. Excludes the first page table so
/// VM86 can claim low memory.
pub const KERNEL_DOMAIN: Domain = Domain {
    start: VirtualAddress::new(0x0040_0000),
    end: VirtualAddress::new(0x3FFF_FFFF),
};

/// Private to each directory. Excludes the self-map's top 4 MiB.
pub const USER_DOMAIN: Domain = Domain {
    start: VirtualAddress::new(0x4000_0000),
    end: VirtualAddress::new(0xFFBF_FFFF),
};

/// Virtual memory result type.
pub type Result<T> = core::result::Result<T, VmmError>;

/// Virtual memory errors. All of these are reported and non-fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmError {
    /// The virtual address lies outside the domain matching the flags.
    DomainMismatch { vaddr: VirtualAddress },
    /// The target page already carries a mapping.
    AlreadyMapped { vaddr: VirtualAddress },
    /// No unmapped virtual run of the requested size in the domain.
    OutOfVirtualSpace { requested: usize },
    /// The physical allocator ran dry.
    OutOfMemory,
    /// `modify_directory` while another modification is pending.
    ModifyPending,
    /// `modified_directory` without a pending modification.
    NotModifying,
}

impl From<PmmError> for VmmError {
    fn from(_: PmmError) -> Self {
        VmmError::OutOfMemory
    }
}

/// Stashed context of a temporary foreign-directory modification.
struct ModifyStash {
    previous: PhysicalAddress,
    interrupts: bool,
}

struct VmmState {
    /// Linear address of the current page directory: a physical address
    /// while paging is off, [`PAGEDIR_WINDOW`] afterwards, or a temporary
    /// mapping while a foreign directory is torn down. Zero means none.
    current: u32,
    modify: Option<ModifyStash>,
    domain_check: bool,
}

static STATE: Mutex<VmmState> = Mutex::new(VmmState {
    current: 0,
    modify: None,
    domain_check: false,
});

/// Runs `f` on the VMM state with interrupts disabled. Disabling
/// interrupts is the kernel's sole mutual-exclusion primitive; the spin
/// lock never contends on a uniprocessor once preemption is off.
fn with_state<R>(f: impl FnOnce(&mut VmmState) -> R) -> R {
    let prev = interrupts::enable_interrupts(false);
    let result = f(&mut STATE.lock());
    interrupts::enable_interrupts(prev);
    result
}

fn current_dir(state: &VmmState) -> *mut PageDirectory {
    mmu::virt_to_ptr(VirtualAddress::new(state.current)).cast()
}

/// Pointer to the page table behind a directory entry. Through the window
/// when the self-map is active, by physical address otherwise.
fn page_table_ptr(
    state: &VmmState,
    dir_entry: PageDirectoryEntry,
    index: usize,
) -> *mut PageTable {
    if state.current == PAGEDIR_WINDOW.as_u32() {
        mmu::virt_to_ptr(pagetab_window(index)).cast()
    } else {
        mmu::virt_to_ptr(VirtualAddress::new(dir_entry.table_frame().base().as_u32())).cast()
    }
}

fn domain_of(flags: VmFlags) -> Domain {
    if flags.contains(VmFlags::USER) {
        USER_DOMAIN
    } else {
        KERNEL_DOMAIN
    }
}

fn pmm_tag(flags: VmFlags) -> FrameTag {
    if flags.contains(VmFlags::USER) {
        FrameTag::User
    } else {
        FrameTag::Kernel
    }
}

fn domain_check(state: &VmmState, vaddr: VirtualAddress, flags: VmFlags) -> Result<()> {
    if state.domain_check && !domain_of(flags).contains(vaddr) {
        error!(
            target: "vmm",
            "domain mismatch: {:08x} is not valid for {:?}",
            vaddr.as_u32(),
            flags
        );
        return Err(VmmError::DomainMismatch { vaddr });
    }
    Ok(())
}

/// Frees the page table behind directory entry `index` of the current
/// directory and clears the entry.
fn destroy_page_table(state: &VmmState, index: usize) {
    let dir = current_dir(state);
    // SAFETY: `state.current` is a dereferenceable directory by the state
    // invariant; the entry is cleared before anything can reuse the frame.
    unsafe {
        let entry = (*dir).entries[index];
        PMM.lock().free(entry.table_frame().base(), FRAME_SIZE);
        (*dir).entries[index] = PageDirectoryEntry::empty();
    }
}

fn map_with(
    state: &mut VmmState,
    vaddr: VirtualAddress,
    paddr: PhysicalAddress,
    flags: VmFlags,
) -> Result<()> {
    domain_check(state, vaddr, flags)?;
    let dir = current_dir(state);
    let index = vaddr.directory_index();
    // SAFETY: the state invariant makes `dir` dereferenceable; table
    // pointers come from `page_table_ptr` which follows the same rules.
    unsafe {
        let mut dir_entry = (*dir).entries[index];
        if !dir_entry.is_present() {
            // Lazily create the covering page table. The directory entry
            // is writable and user-visible; the individual pages override.
            let table_phys = PMM.lock().alloc(FRAME_SIZE, FrameTag::Kernel)?;
            dir_entry = PageDirectoryEntry::new(
                table_phys.frame(),
                PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER,
            );
            (*dir).entries[index] = dir_entry;
            let table = page_table_ptr(state, dir_entry, index);
            core::ptr::write_bytes(table.cast::<u8>(), 0, FRAME_SIZE);
        }
        let table = page_table_ptr(state, dir_entry, index);
        let entry = &mut (*table).entries[vaddr.table_index()];
        if entry.is_present() {
            error!(target: "vmm", "{:08x} is already mapped", vaddr.as_u32());
            return Err(VmmError::AlreadyMapped { vaddr });
        }
        let mut page_flags = PageFlags::PRESENT;
        if flags.contains(VmFlags::WRITABLE) {
            page_flags |= PageFlags::WRITABLE;
        }
        if flags.contains(VmFlags::USER) {
            page_flags |= PageFlags::USER;
        }
        *entry = PageTableEntry::new(paddr.frame(), page_flags);
    }
    if state.current == PAGEDIR_WINDOW.as_u32() {
        mmu::flush_tlb(vaddr);
    }
    Ok(())
}

fn unmap_with(state: &mut VmmState, vaddr: VirtualAddress) {
    let dir = current_dir(state);
    let index = vaddr.directory_index();
    // SAFETY: same access rules as `map_with`.
    unsafe {
        let dir_entry = (*dir).entries[index];
        if !dir_entry.is_present() {
            return;
        }
        let table = page_table_ptr(state, dir_entry, index);
        let entry = &mut (*table).entries[vaddr.table_index()];
        if !entry.is_present() {
            return;
        }
        *entry = PageTableEntry::empty();
        // A table with no remaining mappings goes back to the allocator.
        if (*table).entries.iter().all(|entry| !entry.is_present()) {
            destroy_page_table(state, index);
        }
    }
    if state.current == PAGEDIR_WINDOW.as_u32() {
        mmu::flush_tlb(vaddr);
    }
}

fn map_range_with(
    state: &mut VmmState,
    vaddr: VirtualAddress,
    paddr: PhysicalAddress,
    len: usize,
    flags: VmFlags,
) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    domain_check(state, vaddr, flags)?;
    let pages = super::frame_span(vaddr.as_u32(), len);
    let pages = (pages.1 - pages.0 + 1) as usize;
    debug!(
        target: "vmm",
        "map   virtual {:08x}-{:08x} to physical {:08x}-{:08x}",
        vaddr.as_u32(),
        vaddr.as_u32().wrapping_add(len as u32 - 1),
        paddr.as_u32(),
        paddr.as_u32().wrapping_add(len as u32 - 1)
    );
    let mut result = Ok(());
    for page in 0..pages {
        let offset = (page * FRAME_SIZE) as u32;
        let mapped = map_with(
            state,
            VirtualAddress::new(vaddr.frame().base().as_u32() + offset),
            PhysicalAddress::new(paddr.frame().base().as_u32() + offset),
            flags,
        );
        // Keep going: partially mapped ranges are still torn down page by
        // page, and the error has already been reported.
        if result.is_ok() {
            result = mapped;
        }
    }
    result
}

fn unmap_range_with(state: &mut VmmState, vaddr: VirtualAddress, len: usize) {
    if len == 0 {
        return;
    }
    let pages = super::frame_span(vaddr.as_u32(), len);
    let pages = (pages.1 - pages.0 + 1) as usize;
    debug!(
        target: "vmm",
        "unmap virtual {:08x}-{:08x}",
        vaddr.as_u32(),
        vaddr.as_u32().wrapping_add(len as u32 - 1)
    );
    for page in 0..pages {
        let offset = (page * FRAME_SIZE) as u32;
        unmap_with(
            state,
            VirtualAddress::new(vaddr.frame().base().as_u32() + offset),
        );
    }
}

fn translate_with(state: &VmmState, vaddr: VirtualAddress) -> Option<PhysicalAddress> {
    if !mmu::paging_enabled() {
        return Some(PhysicalAddress::new(vaddr.as_u32()));
    }
    let dir = current_dir(state);
    // SAFETY: same access rules as `map_with`; reads only.
    unsafe {
        let dir_entry = (*dir).entries[vaddr.directory_index()];
        if !dir_entry.is_present() {
            return None;
        }
        let table = page_table_ptr(state, dir_entry, vaddr.directory_index());
        let entry = (*table).entries[vaddr.table_index()];
        if !entry.is_present() {
            return None;
        }
        Some(entry.frame().base().offset(vaddr.page_offset()))
    }
}

/// First-fit scan for `len` bytes of unmapped pages inside `domain`.
fn find_free_with(state: &VmmState, len: usize, domain: Domain) -> Result<VirtualAddress> {
    if len == 0 {
        return Err(VmmError::OutOfVirtualSpace { requested: 0 });
    }
    let pages = super::frames_for(len);
    let mut free = 0usize;
    let mut frame = domain.start.frame().as_u32();
    let last = domain.end.frame().as_u32();
    while frame <= last {
        if translate_with(state, FrameNumber::new(frame).base_virtual()).is_none() {
            free += 1;
        } else {
            free = 0;
        }
        if free >= pages {
            return Ok(FrameNumber::new(frame - pages as u32 + 1).base_virtual());
        }
        frame += 1;
    }
    error!(target: "vmm", "not enough virtual memory for {} bytes", len);
    Err(VmmError::OutOfVirtualSpace { requested: len })
}

fn map_physical_with(
    state: &mut VmmState,
    paddr: PhysicalAddress,
    len: usize,
    flags: VmFlags,
) -> Result<VirtualAddress> {
    if !mmu::paging_enabled() {
        return Ok(VirtualAddress::new(paddr.as_u32()));
    }
    let vaddr = find_free_with(state, len, domain_of(flags))?;
    map_range_with(state, vaddr, paddr, len, flags)?;
    Ok(vaddr)
}

fn unmap_physical_with(state: &mut VmmState, vaddr: VirtualAddress, len: usize) {
    if mmu::paging_enabled() {
        unmap_range_with(state, vaddr, len);
    }
}

/// Copies the kernel-domain directory entries from the current directory
/// into `dir`, so kernel mappings stay shared across address spaces.
fn refresh_directory_with(state: &mut VmmState, dir: PhysicalAddress) -> Result<()> {
    let dir_vaddr = map_physical_with(state, dir, FRAME_SIZE, VmFlags::empty())?;
    let src = current_dir(state);
    let dst: *mut PageDirectory = mmu::virt_to_ptr(dir_vaddr).cast();
    // SAFETY: `src` is the current directory, `dst` was just mapped; the
    // kernel-domain slice never overlaps the self-map entry.
    unsafe {
        for index in KERNEL_DOMAIN.start.directory_index()..=KERNEL_DOMAIN.end.directory_index() {
            (*dst).entries[index] = (*src).entries[index];
        }
    }
    unmap_physical_with(state, dir_vaddr, FRAME_SIZE);
    Ok(())
}

fn load_directory_with(state: &mut VmmState, new: PhysicalAddress) -> PhysicalAddress {
    debug!(target: "vmm", "loading page directory at {:08x}", new.as_u32());
    let previous = if state.current != 0 {
        translate_with(state, VirtualAddress::new(state.current))
            .unwrap_or(PhysicalAddress::new(0))
    } else {
        PhysicalAddress::new(0)
    };
    if mmu::paging_enabled() {
        if let Err(err) = refresh_directory_with(state, new) {
            error!(target: "vmm", "kernel-domain refresh failed: {:?}", err);
        }
        mmu::load_directory(new);
    } else {
        mmu::enable_paging(new);
    }
    state.current = PAGEDIR_WINDOW.as_u32();
    previous
}

/// Creates an empty page directory with the self-map installed and
/// returns its physical address.
pub fn create_directory() -> Result<PhysicalAddress> {
    let dir_phys = PMM.lock().alloc(FRAME_SIZE, FrameTag::Kernel)?;
    debug!(target: "vmm", "creating page directory at {:08x}", dir_phys.as_u32());
    with_state(|state| {
        let dir_vaddr = map_physical_with(state, dir_phys, FRAME_SIZE, VmFlags::empty())?;
        let dir: *mut PageDirectory = mmu::virt_to_ptr(dir_vaddr).cast();
        // SAFETY: the frame was just mapped (or is identity-reachable
        // before paging); nothing else references it yet.
        unsafe {
            core::ptr::write_bytes(dir.cast::<u8>(), 0, FRAME_SIZE);
            // The self-map: present, non-writable, kernel-only.
            (*dir).entries[ENTRY_COUNT - 1] =
                PageDirectoryEntry::new(dir_phys.frame(), PageFlags::PRESENT);
        }
        unmap_physical_with(state, dir_vaddr, FRAME_SIZE);
        Ok(dir_phys)
    })
}

/// Destroys a page directory: the VM86 page table, every present
/// user-domain page table, and finally the directory frame itself, which
/// the self-map exposes as the last "page table".
pub fn destroy_directory(dir: PhysicalAddress) {
    debug!(target: "vmm", "destroying page directory at {:08x}", dir.as_u32());
    with_state(|state| {
        let previous = state.current;
        let dir_vaddr = match map_physical_with(state, dir, FRAME_SIZE, VmFlags::empty()) {
            Ok(vaddr) => vaddr,
            Err(err) => {
                error!(target: "vmm", "cannot reach directory {:08x}: {:?}", dir.as_u32(), err);
                return;
            }
        };
        state.current = dir_vaddr.as_u32();
        // SAFETY: `state.current` now points at the doomed directory's
        // temporary mapping; only its entries are read.
        unsafe {
            if (*current_dir(state)).entries[0].is_present() {
                destroy_page_table(state, 0);
            }
            for index in
                USER_DOMAIN.start.directory_index()..=USER_DOMAIN.end.directory_index()
            {
                if (*current_dir(state)).entries[index].is_present() {
                    destroy_page_table(state, index);
                }
            }
        }
        destroy_page_table(state, ENTRY_COUNT - 1);
        state.current = previous;
        unmap_physical_with(state, dir_vaddr, FRAME_SIZE);
    });
}

/// Switches to `new`, refreshing its kernel domain first. Returns the
/// previously loaded directory's physical address.
pub fn load_directory(new: PhysicalAddress) -> PhysicalAddress {
    with_state(|state| load_directory_with(state, new))
}

/// Loads `new` so the self-map exposes its tables for direct edits and
/// disables interrupts until [`modified_directory`]. Nesting is rejected.
pub fn modify_directory(new: PhysicalAddress) {
    let prev_interrupts = interrupts::enable_interrupts(false);
    let mut state = STATE.lock();
    if state.modify.is_some() {
        error!(target: "vmm", "already modifying a page directory");
        drop(state);
        interrupts::enable_interrupts(prev_interrupts);
        return;
    }
    let previous = load_directory_with(&mut *state, new);
    state.modify = Some(ModifyStash {
        previous,
        interrupts: prev_interrupts,
    });
    // Interrupts stay off until the matching modified_directory().
}

/// Ends a [`modify_directory`] window: restores the previous directory
/// and the previous interrupt flag.
pub fn modified_directory() {
    let mut state = STATE.lock();
    let Some(stash) = state.modify.take() else {
        error!(target: "vmm", "not modifying a page directory");
        return;
    };
    load_directory_with(&mut *state, stash.previous);
    drop(state);
    interrupts::enable_interrupts(stash.interrupts);
}

/// Maps one page. Fails if the target entry already holds a mapping.
pub fn map(vaddr: VirtualAddress, paddr: PhysicalAddress, flags: VmFlags) -> Result<()> {
    with_state(|state| map_with(state, vaddr, paddr, flags))
}

/// Clears one mapping; reclaims the page table if it became empty.
pub fn unmap(vaddr: VirtualAddress) {
    with_state(|state| unmap_with(state, vaddr));
}

pub fn map_range(
    vaddr: VirtualAddress,
    paddr: PhysicalAddress,
    len: usize,
    flags: VmFlags,
) -> Result<()> {
    with_state(|state| map_range_with(state, vaddr, paddr, len, flags))
}

pub fn unmap_range(vaddr: VirtualAddress, len: usize) {
    with_state(|state| unmap_range_with(state, vaddr, len));
}

/// Walks the current directory and returns the backing physical address,
/// or `None` while `vaddr` is unmapped.
pub fn translate(vaddr: VirtualAddress) -> Option<PhysicalAddress> {
    with_state(|state| translate_with(state, vaddr))
}

/// Maps already-owned physical memory somewhere into the matching domain.
/// Before paging this is the identity.
pub fn map_physical(paddr: PhysicalAddress, len: usize, flags: VmFlags) -> Result<VirtualAddress> {
    with_state(|state| map_physical_with(state, paddr, len, flags))
}

/// Undoes [`map_physical`] once paging is on.
pub fn unmap_physical(vaddr: VirtualAddress, len: usize) {
    with_state(|state| unmap_physical_with(state, vaddr, len));
}

/// Claims the frames behind `paddr` in the PMM and maps them at `vaddr`.
pub fn use_range(
    vaddr: VirtualAddress,
    paddr: PhysicalAddress,
    len: usize,
    flags: VmFlags,
) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    with_state(|state| {
        domain_check(state, vaddr, flags)?;
        PMM.lock().use_range(paddr, len, pmm_tag(flags), "vmm_use");
        map_range_with(state, vaddr, paddr, len, flags)
    })
}

/// Claims the frames behind `paddr` and maps them somewhere free.
pub fn use_physical(paddr: PhysicalAddress, len: usize, flags: VmFlags) -> Result<VirtualAddress> {
    with_state(|state| {
        let vaddr = find_free_with(state, len, domain_of(flags))?;
        PMM.lock().use_range(paddr, len, pmm_tag(flags), "vmm_use");
        map_range_with(state, vaddr, paddr, len, flags)?;
        Ok(vaddr)
    })
}

/// Allocates frames and maps them at the given virtual address. Returns
/// the physical address backing the mapping.
pub fn use_virtual(vaddr: VirtualAddress, len: usize, flags: VmFlags) -> Result<PhysicalAddress> {
    with_state(|state| {
        domain_check(state, vaddr, flags)?;
        let paddr = PMM.lock().alloc(len, pmm_tag(flags))?;
        map_range_with(state, vaddr, paddr, len, flags)?;
        Ok(paddr)
    })
}

/// Allocates frames and maps them into a free virtual run of the matching
/// domain. The mapping is not necessarily identity.
pub fn alloc(len: usize, flags: VmFlags) -> Result<VirtualAddress> {
    with_state(|state| {
        let paddr = PMM.lock().alloc(len, pmm_tag(flags))?;
        let vaddr = match find_free_with(state, len, domain_of(flags)) {
            Ok(vaddr) => vaddr,
            Err(err) => {
                PMM.lock().free(paddr, len);
                return Err(err);
            }
        };
        map_range_with(state, vaddr, paddr, len, flags)?;
        Ok(vaddr)
    })
}

/// Frees an [`alloc`]ed range: unmaps it and returns the frames.
pub fn free(vaddr: VirtualAddress, len: usize) {
    if len == 0 {
        return;
    }
    with_state(|state| {
        let paddr = translate_with(state, vaddr);
        unmap_range_with(state, vaddr, len);
        if let Some(paddr) = paddr {
            PMM.lock().free(paddr, len);
        }
    });
}

/// Turns the domain policy on or off. VM86 setup bypasses it briefly to
/// identity-map low memory with user permissions.
pub fn set_domain_check(enable: bool) {
    with_state(|state| state.domain_check = enable);
}

/// Logs every present mapping of the current directory.
pub fn debug_dump() {
    with_state(|state| {
        debug!(target: "vmm", "page directory at {:08x}:", state.current);
        let dir = current_dir(state);
        for index in 0..ENTRY_COUNT {
            // SAFETY: read-only walk of the current directory.
            unsafe {
                let dir_entry = (*dir).entries[index];
                if !dir_entry.is_present() {
                    continue;
                }
                let table = page_table_ptr(state, dir_entry, index);
                for slot in 0..ENTRY_COUNT {
                    let entry = (*table).entries[slot];
                    if entry.is_present() {
                        let vpage = (index * ENTRY_COUNT + slot) as u32;
                        let ppage = entry.frame().as_u32();
                        if vpage == ppage {
                            trace!(target: "vmm", "{:05x} to itself", vpage);
                        } else {
                            trace!(target: "vmm", "{:05x} to {:05x}", vpage, ppage);
                        }
                    }
                }
            }
        }
    });
}

/// Creates the first directory, identity-maps the frames the boot path
/// claimed, activates paging through the self-map, and turns the domain
/// policy on.
pub fn init() {
    crate::print!("VMM init ... ");
    mmu::init();
    let dir = match create_directory() {
        Ok(dir) => dir,
        Err(err) => panic!("VMM init failed: {:?}", err),
    };
    with_state(|state| {
        state.current = dir.as_u32();
        // Identity-map every kernel or reserved frame below the highest
        // kernel frame; the PMM memorized the bound.
        let highest = PMM.lock().highest_kernel_frame().as_u32();
        for frame in 0..=highest {
            let addr = FrameNumber::new(frame).base();
            let tag = PMM.lock().check(addr);
            if tag == FrameTag::Kernel || tag == FrameTag::Reserved {
                if let Err(err) = map_with(
                    state,
                    FrameNumber::new(frame).base_virtual(),
                    addr,
                    VmFlags::WRITABLE,
                ) {
                    error!(target: "vmm", "identity map of {:08x} failed: {:?}", addr.as_u32(), err);
                }
            }
        }
        state.domain_check = true;
        load_directory_with(state, dir);
    });
    // Keep the console alive under paging.
    #[cfg(target_os = "none")]
    crate::drivers::vga::use_video_memory();
    crate::print::ok();
}

impl FrameNumber {
    /// The frame's base interpreted as a virtual page address.
    pub(crate) const fn base_virtual(&self) -> VirtualAddress {
        VirtualAddress::new(self.0 << super::FRAME_SHIFT)
    }
}

#[cfg(all(test, not(target_os = "none")))]
pub(crate) fn reset_state() {
    let mut state = STATE.lock();
    state.current = 0;
    state.modify = None;
    state.domain_check = false;
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn domains_do_not_overlap() {
        assert!(KERNEL_DOMAIN.end.as_u32() < USER_DOMAIN.start.as_u32());
        assert!(!KERNEL_DOMAIN.contains(USER_DOMAIN.start));
        assert!(!USER_DOMAIN.contains(KERNEL_DOMAIN.end));
        // The self-map's 4 MiB stay outside the user domain.
        assert!(!USER_DOMAIN.contains(PAGEDIR_WINDOW));
        // Low memory stays outside the kernel domain for VM86.
        assert!(!KERNEL_DOMAIN.contains(VirtualAddress::new(0x0000_0500)));
    }

    #[test]
    fn flags_pick_the_matching_domain_and_tag() {
        assert_eq!(domain_of(VmFlags::USER | VmFlags::WRITABLE), USER_DOMAIN);
        assert_eq!(domain_of(VmFlags::WRITABLE), KERNEL_DOMAIN);
        assert_eq!(pmm_tag(VmFlags::USER), FrameTag::User);
        assert_eq!(pmm_tag(VmFlags::empty()), FrameTag::Kernel);
    }
}
