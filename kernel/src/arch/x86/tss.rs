//! Task state segment
//!
//! With software multitasking a single TSS suffices: the CPU only reads
//! `ss0`/`esp0` from it when a ring-3 task traps into ring 0. The
//! scheduler rewrites `esp0` at every context switch so the trap lands
//! one past the next task's saved frame.

use core::cell::UnsafeCell;

use crate::mm::VirtualAddress;

/// The 104-byte IA-32 TSS. Only `esp0`, `ss0` and the I/O bitmap offset
/// matter to this kernel; the rest exists for the hardware layout.
#[repr(C, packed)]
pub struct Tss {
    link: u32,
    /// Stack pointer loaded when entering ring 0.
    esp0: u32,
    /// Stack segment loaded when entering ring 0; always the kernel data
    /// selector.
    ss0: u32,
    unused: [u32; 22],
    /// Offset of the I/O permission bitmap; none is attached.
    iopb: u32,
}

struct TssCell(UnsafeCell<Tss>);

// SAFETY: all mutation happens with interrupts disabled on a
// uniprocessor (scheduler context switch and boot init), so there is no
// concurrent access.
unsafe impl Sync for TssCell {}

static TSS: TssCell = TssCell(UnsafeCell::new(Tss {
    link: 0,
    esp0: 0,
    ss0: 0,
    unused: [0; 22],
    iopb: 0,
}));

/// Fixes the ring-0 stack segment to the kernel data selector.
pub fn init() {
    // SAFETY: boot-time single-threaded write, see TssCell.
    unsafe {
        (*TSS.0.get()).ss0 = crate::arch::x86::gdt::selector(
            crate::arch::x86::gdt::RING0_DATA_SEG,
        ) as u32;
    }
}

/// Points `esp0` at the kernel stack position for the next ring-3 trap.
/// Called by the scheduler with interrupts disabled.
pub fn set_kernel_stack(stack_pointer: VirtualAddress) {
    // SAFETY: see TssCell; single u32 store.
    unsafe {
        (*TSS.0.get()).esp0 = stack_pointer.as_u32();
    }
}

/// Current `esp0`, for diagnostics.
pub fn kernel_stack() -> VirtualAddress {
    // SAFETY: see TssCell; single u32 load.
    VirtualAddress::new(unsafe { (*TSS.0.get()).esp0 })
}

/// Physical base of the TSS for its GDT descriptor.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn base() -> u32 {
    TSS.0.get() as u32
}

/// Descriptor limit of the TSS.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn limit() -> u32 {
    (core::mem::size_of::<Tss>() - 1) as u32
}

/// Loads the TSS selector into the task register.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn load() {
    use x86::{segmentation::SegmentSelector, task::load_tr, Ring};

    // SAFETY: the selector names the TSS descriptor installed by
    // gdt::init right before this call.
    unsafe {
        load_tr(SegmentSelector::new(
            crate::arch::x86::gdt::TASK_STATE_SEG as u16,
            Ring::Ring3,
        ));
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn tss_matches_the_hardware_layout() {
        assert_eq!(core::mem::size_of::<Tss>(), 104);
        assert_eq!(core::mem::offset_of!(Tss, esp0), 4);
        assert_eq!(core::mem::offset_of!(Tss, ss0), 8);
        assert_eq!(core::mem::offset_of!(Tss, iopb), 100);
    }

    #[test]
    fn kernel_stack_round_trips() {
        set_kernel_stack(VirtualAddress::new(0x1234_5678));
        assert_eq!(kernel_stack().as_u32(), 0x1234_5678);
    }
}
