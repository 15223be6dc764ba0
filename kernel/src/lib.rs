//! obsidian kernel library
//!
//! A small IA-32 preemptive multitasking kernel: Multiboot boot, flat
//! segmentation with user/kernel separation, paging with per-task page
//! directories and a recursive self-map, a round-robin scheduler driven
//! by the PIT, a fixed syscall surface, an ELF32 loader, and a VM86
//! monitor for 16-bit BIOS code.
//!
//! On bare metal the crate is `no_std`. Hosted builds link `std` so the
//! standard test harness runs; privileged instructions are confined to
//! `arch::x86` and replaced by a software MMU there, which lets the
//! memory, task, scheduler, ELF and VM86 logic run under `cargo test`.

#![no_std]

// Host target: the standard library backs the unit tests.
#[cfg(not(target_os = "none"))]
extern crate std;

#[macro_use]
pub mod print;

pub mod arch;
pub mod boot;
pub mod drivers;
pub mod elf;
pub mod interrupts;
pub mod logger;
pub mod mm;
pub mod sched;
pub mod task;
pub mod vm86;

#[cfg(all(test, not(target_os = "none")))]
pub(crate) mod test_support;

#[cfg(all(test, not(target_os = "none")))]
mod integration_tests;

// Re-export the address types; nearly every interface speaks them.
pub use mm::{FrameNumber, PhysicalAddress, VirtualAddress, FRAME_SIZE};
