//! 8253/8254 programmable interval timer
//!
//! Channel 0 runs as a rate generator and fires IRQ0; its handler counts
//! ticks and hands the saved frame to the scheduler, which makes the PIT
//! the heartbeat of preemption.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::{
    arch::x86::port::outb,
    interrupts::{self, irq},
    mm::VirtualAddress,
    sched,
};

const PIT_CHANNEL0: u16 = 0x40;
const PIT_INIT: u16 = 0x43;

/// The PIT's fixed input clock in Hz.
const PIT_FREQ: u32 = 1_193_182;

/// Binary rate generator mode for channel 0.
const MODE_RATE: u8 = 0x02;

static TICKS: AtomicU32 = AtomicU32::new(0);

/// Timer ticks since boot.
pub fn ticks() -> u32 {
    TICKS.load(Ordering::Relaxed)
}

/// Programs a channel's reload counter. The counter divides [`PIT_FREQ`];
/// 16-bit reload values bound the usable frequency range on both ends
/// (below 19 Hz the divisor overflows, and a divisor of 1 never fires).
fn init_channel(channel: u8, mode: u8, freq: u32) -> bool {
    if freq < 19 || freq > PIT_FREQ / 2 {
        return false;
    }
    let counter = (PIT_FREQ / freq) as u16;
    // Command: channel, access low-then-high byte, mode, binary format.
    outb(PIT_INIT, (channel << 6) | 0x30 | (mode << 1));
    outb(PIT_CHANNEL0 + channel as u16, (counter & 0xFF) as u8);
    outb(PIT_CHANNEL0 + channel as u16, (counter >> 8) as u8);
    true
}

/// The IRQ0 handler: account the tick, then let the scheduler decide
/// which frame the interrupt stub restores.
fn handle_timer(frame: VirtualAddress) -> VirtualAddress {
    TICKS.fetch_add(1, Ordering::Relaxed);
    sched::schedule(frame)
}

/// Programs channel 0 to `freq` Hz and installs the scheduler tick.
pub fn init(freq: u32) {
    crate::print!("PIT init ... ");
    interrupts::register_handler(irq(0), handle_timer);
    if init_channel(0, MODE_RATE, freq) {
        crate::print::status_ok();
        crate::println!(". Frequency={}Hz.", freq);
    } else {
        crate::print::fail("Frequency must be > 18Hz and < 0.59MHz.");
    }
}
