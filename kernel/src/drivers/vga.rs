//! VGA text-mode console
//!
//! The kernel's only output device: the 80x25 text buffer at physical
//! 0xB8000. Writing happens in the bottom row; newlines scroll. The
//! current attribute byte colors everything printed, which is how boot
//! status and error reporting get their green and red. Hosted builds
//! write into a shadow buffer of the same shape.

use core::fmt;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::interrupts;

const BUFFER_HEIGHT: usize = 25;
const BUFFER_WIDTH: usize = 80;

/// Physical address of the text-mode framebuffer.
const VIDEO_MEMORY: u32 = 0xB8000;

/// Light gray on black.
pub const ATTR_DEFAULT: u8 = 0x07;

/// Green on black: boot-stage success.
pub const ATTR_OK: u8 = 0x02;

/// Red on black: reported errors.
pub const ATTR_ERROR: u8 = 0x04;

pub struct Writer {
    column_position: usize,
    attr: u8,
    /// Pointer to the 16-bit character cells, stored as an address so
    /// the Writer stays Send behind its Mutex.
    buffer: usize,
}

impl Writer {
    fn cell(&mut self, row: usize, col: usize) -> *mut u16 {
        (self.buffer as *mut u16).wrapping_add(row * BUFFER_WIDTH + col)
    }

    pub fn write_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => self.new_line(),
            byte => {
                if self.column_position >= BUFFER_WIDTH {
                    self.new_line();
                }
                let row = BUFFER_HEIGHT - 1;
                let col = self.column_position;
                let cell = ((self.attr as u16) << 8) | byte as u16;
                // SAFETY: the buffer covers 25x80 cells; row/col are in
                // range, and write_volatile keeps MMIO writes intact.
                unsafe { core::ptr::write_volatile(self.cell(row, col), cell) };
                self.column_position += 1;
            }
        }
    }

    fn new_line(&mut self) {
        for row in 1..BUFFER_HEIGHT {
            for col in 0..BUFFER_WIDTH {
                // SAFETY: both cells lie inside the buffer.
                unsafe {
                    let ch = core::ptr::read_volatile(self.cell(row, col));
                    core::ptr::write_volatile(self.cell(row - 1, col), ch);
                }
            }
        }
        self.clear_row(BUFFER_HEIGHT - 1);
        self.column_position = 0;
    }

    fn clear_row(&mut self, row: usize) {
        let blank = ((self.attr as u16) << 8) | b' ' as u16;
        for col in 0..BUFFER_WIDTH {
            // SAFETY: col is bounded by the buffer width.
            unsafe { core::ptr::write_volatile(self.cell(row, col), blank) };
        }
    }

    pub fn clear(&mut self) {
        for row in 0..BUFFER_HEIGHT {
            self.clear_row(row);
        }
        self.column_position = 0;
    }

    pub fn write_string(&mut self, s: &str) {
        for byte in s.bytes() {
            match byte {
                0x20..=0x7E | b'\n' => self.write_byte(byte),
                _ => self.write_byte(0xFE),
            }
        }
    }
}

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_string(s);
        Ok(())
    }
}

#[cfg(target_os = "none")]
fn initial_buffer() -> usize {
    VIDEO_MEMORY as usize
}

#[cfg(not(target_os = "none"))]
fn initial_buffer() -> usize {
    // A shadow screen so console plumbing runs under tests.
    std::boxed::Box::leak(std::boxed::Box::new([0u16; BUFFER_HEIGHT * BUFFER_WIDTH]))
        .as_mut_ptr() as usize
}

lazy_static! {
    pub static ref WRITER: Mutex<Writer> = Mutex::new(Writer {
        column_position: 0,
        attr: ATTR_DEFAULT,
        buffer: initial_buffer(),
    });
}

/// Writes one character; the kernel side of the `io_putchar` syscall.
pub fn putchar(byte: u8) {
    interrupts::without_interrupts(|| {
        WRITER.lock().write_byte(byte);
    });
}

/// Sets the attribute byte and returns the previous one; the kernel side
/// of the `io_attr` syscall.
pub fn set_attr(attr: u8) -> u8 {
    interrupts::without_interrupts(|| {
        let mut writer = WRITER.lock();
        core::mem::replace(&mut writer.attr, attr)
    })
}

/// Current attribute byte.
pub fn attr() -> u8 {
    interrupts::without_interrupts(|| WRITER.lock().attr)
}

/// Runs `f` with a temporary attribute, restoring the previous one.
pub fn with_attr<R>(attr: u8, f: impl FnOnce() -> R) -> R {
    let previous = set_attr(attr);
    let result = f();
    set_attr(previous);
    result
}

/// Blanks the screen, e.g. to clear leftover loader output.
pub fn clear() {
    interrupts::without_interrupts(|| {
        WRITER.lock().clear();
    });
}

/// Remaps the framebuffer into the kernel domain so the console keeps
/// working once the identity mapping of low memory is gone.
#[cfg(target_os = "none")]
pub fn use_video_memory() {
    use crate::mm::{vmm, PhysicalAddress};

    let size = BUFFER_HEIGHT * BUFFER_WIDTH * core::mem::size_of::<u16>();
    match vmm::use_physical(
        PhysicalAddress::new(VIDEO_MEMORY),
        size,
        vmm::VmFlags::WRITABLE,
    ) {
        Ok(vaddr) => {
            interrupts::without_interrupts(|| {
                WRITER.lock().buffer = vaddr.as_usize();
            });
        }
        Err(err) => {
            log::error!(target: "vga", "cannot remap video memory: {:?}", err);
        }
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    // The console is shared with IRQ-path diagnostics; keep the lock
    // uninterruptible.
    interrupts::without_interrupts(|| {
        let _ = WRITER.lock().write_fmt(args);
    });
}
