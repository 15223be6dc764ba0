//! Global descriptor table
//!
//! Flat memory model: every segment covers the full 4 GiB linear space,
//! so segmentation only contributes the ring separation. Fixed slots:
//! null, ring-0 code/data, ring-3 code/data, and the TSS.

pub const NULL_SEG: usize = 0;
pub const RING0_CODE_SEG: usize = 1;
pub const RING0_DATA_SEG: usize = 2;
pub const RING3_CODE_SEG: usize = 3;
pub const RING3_DATA_SEG: usize = 4;
pub const TASK_STATE_SEG: usize = 5;

const ENTRIES: usize = 6;

/// Privilege level baked into each slot's selector.
const DPL: [u16; ENTRIES] = [0, 0, 0, 3, 3, 3];

/// Selector for a GDT slot, ready to load into a segment register or an
/// IDT gate: index in the high bits, the slot's DPL in the low two.
pub fn selector(entry: usize) -> u16 {
    ((entry as u16) << 3) | DPL[entry]
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod hw {
    use lazy_static::lazy_static;
    use x86::dtables::{lgdt, DescriptorTablePointer};

    use super::{selector, ENTRIES, RING0_CODE_SEG, RING0_DATA_SEG, RING3_CODE_SEG, RING3_DATA_SEG, TASK_STATE_SEG};
    use crate::arch::x86::tss;

    /// Packs one 8-byte segment descriptor.
    fn descriptor(base: u32, limit: u32, access: u8, flags: u8) -> u64 {
        (limit as u64 & 0xFFFF)
            | ((base as u64 & 0xFF_FFFF) << 16)
            | ((access as u64) << 40)
            | (((limit as u64 >> 16) & 0xF) << 48)
            | ((flags as u64 & 0xF) << 52)
            | (((base as u64 >> 24) & 0xFF) << 56)
    }

    lazy_static! {
        static ref GDT: [u64; ENTRIES] = {
            let mut gdt = [0u64; ENTRIES];
            // Code: present | ring | code+readable; data: | data+writable.
            // Flags 0xC = 4 KiB granularity + 32-bit operands.
            gdt[RING0_CODE_SEG] = descriptor(0, 0xF_FFFF, 0x9A, 0xC);
            gdt[RING0_DATA_SEG] = descriptor(0, 0xF_FFFF, 0x92, 0xC);
            gdt[RING3_CODE_SEG] = descriptor(0, 0xF_FFFF, 0xFA, 0xC);
            gdt[RING3_DATA_SEG] = descriptor(0, 0xF_FFFF, 0xF2, 0xC);
            // 32-bit available TSS, reachable from ring 3, byte granular.
            gdt[TASK_STATE_SEG] =
                descriptor(tss::base(), tss::limit(), 0xE9, 0x4);
            gdt
        };
    }

    pub fn init() {
        crate::print!("GDT init ... ");
        tss::init();
        let pointer = DescriptorTablePointer {
            limit: (core::mem::size_of::<[u64; ENTRIES]>() - 1) as u16,
            base: GDT.as_ptr(),
        };
        // SAFETY: the GDT is a 'static flat-model table; reloading the
        // segment registers right after keeps execution consistent.
        unsafe {
            lgdt(&pointer);
            // CS can only change through a far transfer.
            core::arch::asm!(
                "push {code}",
                "mov {scratch}, offset 2f",
                "push {scratch}",
                "retf",
                "2:",
                "mov ds, {data:x}",
                "mov es, {data:x}",
                "mov fs, {data:x}",
                "mov gs, {data:x}",
                "mov ss, {data:x}",
                code = in(reg) selector(RING0_CODE_SEG) as u32,
                data = in(reg) selector(RING0_DATA_SEG) as u32,
                scratch = out(reg) _,
            );
        }
        tss::load();
        crate::print::ok();
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
mod hw {
    pub fn init() {
        crate::arch::x86::tss::init();
    }
}

pub use hw::init;
