//! 8259 programmable interrupt controller
//!
//! After boot the master PIC's IRQs collide with the CPU exception
//! vectors, so both controllers are re-initialized: IRQ0-7 move to
//! 0x20-0x27, IRQ8-15 to 0x28-0x2F. Everything from 0x30 up stays free
//! for the syscall gate.

use crate::arch::x86::port::{io_wait, outb};

const PIC1_CMD: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_CMD: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

/// "End of interrupt" command.
const PIC_EOI: u8 = 0x20;

/// Vector of the master PIC's IRQ0 after remapping.
pub const INT_IRQ0: u8 = 0x20;

/// Vector of the slave PIC's IRQ8 after remapping.
pub const INT_IRQ8: u8 = 0x28;

/// Remaps and unmasks both PICs. io_wait between writes gives slow
/// controllers time to settle.
pub fn init() {
    crate::print!("PIC init ... ");
    // Master: ICW1 init + expect ICW4, ICW2 vector base, ICW3 slave on
    // IRQ2 (bitmask), ICW4 8086 mode, then unmask all lines.
    outb(PIC1_CMD, 0x11);
    io_wait();
    outb(PIC1_DATA, INT_IRQ0);
    io_wait();
    outb(PIC1_DATA, 0x04);
    io_wait();
    outb(PIC1_DATA, 0x01);
    io_wait();
    outb(PIC1_DATA, 0x00);
    io_wait();
    // Slave: same dance, cascade identity 2 instead of the bitmask.
    outb(PIC2_CMD, 0x11);
    io_wait();
    outb(PIC2_DATA, INT_IRQ8);
    io_wait();
    outb(PIC2_DATA, 0x02);
    io_wait();
    outb(PIC2_DATA, 0x01);
    io_wait();
    outb(PIC2_DATA, 0x00);
    io_wait();
    crate::print::status_ok();
    crate::println!(". IRQ0=INT{:02x}, IRQ8=INT{:02x}.", INT_IRQ0, INT_IRQ8);
}

/// Signals that an IRQ has been handled. Slave IRQs notify both PICs.
pub fn send_eoi(vector: u8) {
    if vector.wrapping_sub(INT_IRQ0) >= 0x08 {
        outb(PIC2_CMD, PIC_EOI);
    }
    outb(PIC1_CMD, PIC_EOI);
}
