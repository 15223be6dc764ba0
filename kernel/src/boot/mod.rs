//! Boot protocol support

pub mod multiboot;
