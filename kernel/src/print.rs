//! Console print macros and boot-stage status helpers

/// Prints to the VGA console.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::drivers::vga::_print(format_args!($($arg)*)));
}

/// Prints to the VGA console with a trailing newline.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

use crate::drivers::vga;

/// Green "ok" without ending the line, for stages that append details.
pub fn status_ok() {
    vga::with_attr(vga::ATTR_OK, || crate::print!("ok"));
}

/// Finishes a boot stage line: green "ok" plus the closing period.
pub fn ok() {
    status_ok();
    crate::println!(".");
}

/// Finishes a boot stage line with a red "fail" and a reason.
pub fn fail(reason: &str) {
    vga::with_attr(vga::ATTR_ERROR, || crate::print!("fail"));
    crate::println!(". {}", reason);
}
