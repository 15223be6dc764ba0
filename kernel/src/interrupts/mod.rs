//! Interrupt service dispatch
//!
//! One common low-level stub per vector saves a [`CpuState`] on the
//! interrupted task's kernel stack and calls [`handle_interrupt`] with the
//! resulting stack pointer. Whatever pointer comes back is the stack the
//! stub restores on the way out, so returning a different task's saved
//! frame *is* the context switch.

pub mod syscall;

use bitflags::bitflags;
use log::{error, warn};
use spin::Mutex;

use crate::{arch::x86::pic, mm::VirtualAddress};

/// Number of interrupt vectors the IDT and the handler table cover.
pub const IDT_ENTRIES: usize = 256;

/// CPU exception vectors are 0x00..=0x1F.
pub const fn exception(vector: u8) -> usize {
    vector as usize
}

/// Remapped IRQ vectors start at 0x20.
pub const fn irq(line: u8) -> usize {
    0x20 + line as usize
}

/// General protection fault, the VM86 monitor's entry point.
pub const EXCEPTION_GPF: usize = exception(0x0D);

/// Page fault, handled by the MMU gateway.
pub const EXCEPTION_PAGE_FAULT: usize = exception(0x0E);

/// The syscall trap gate.
pub const SYSCALL_VECTOR: usize = 0x30;

const fn is_exception(vector: u32) -> bool {
    vector <= 0x1F
}

const fn is_irq(vector: u32) -> bool {
    vector >= 0x20 && vector <= 0x2F
}

const fn is_syscall(vector: u32) -> bool {
    vector == SYSCALL_VECTOR as u32
}

bitflags! {
    /// The EFLAGS register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EFlags: u32 {
        const CARRY = 1 << 0;
        /// Architecturally always one.
        const RESERVED = 1 << 1;
        const PARITY = 1 << 2;
        const ZERO = 1 << 6;
        const SIGN = 1 << 7;
        const TRAP = 1 << 8;
        const INTERRUPT = 1 << 9;
        const DIRECTION = 1 << 10;
        const OVERFLOW = 1 << 11;
        /// Virtual 8086 mode.
        const VM = 1 << 17;
    }
}

/// General purpose registers in `pusha` memory order.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Registers {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// Pushed by `pusha` but ignored by `popa`.
    pub esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
}

/// The register image the interrupt stub pushes, low addresses first.
///
/// The field order and widths are the ABI with the assembly stub; do not
/// reorder. `user_esp`/`user_ss` exist on the hardware stack only when the
/// interrupted context was ring 3 or VM86, the `vm86_*` selectors only in
/// VM86 — the struct always reserves space for them so the initial frame
/// carved at stack-top has a single shape.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct CpuState {
    // Segment selectors, pushed as 32-bit words; low halves significant.
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub r: Registers,
    /// Vector of the fired interrupt.
    pub intr: u32,
    /// Error code, or the stub's zero placeholder.
    pub error: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    /// Only restored on a ring transition.
    pub user_esp: u32,
    pub user_ss: u32,
    // Only restored when entering a VM86 task.
    pub vm86_es: u32,
    pub vm86_ds: u32,
    pub vm86_fs: u32,
    pub vm86_gs: u32,
}

/// A registered per-vector handler. It receives the address of the saved
/// frame and returns the frame to restore, which may belong to another
/// task.
pub type InterruptHandler = fn(VirtualAddress) -> VirtualAddress;

static HANDLERS: Mutex<[Option<InterruptHandler>; IDT_ENTRIES]> =
    Mutex::new([None; IDT_ENTRIES]);

/// Borrows the [`CpuState`] saved at `frame`.
///
/// # Safety
///
/// `frame` must address a complete saved frame on a mapped kernel stack,
/// and the borrow must not outlive or alias another borrow of that frame.
pub unsafe fn cpu_state<'a>(frame: VirtualAddress) -> &'a mut CpuState {
    // SAFETY: forwarded caller contract; frames are 4-byte aligned by the
    // stack carving in task creation and by hardware pushes.
    unsafe { &mut *crate::arch::x86::mmu::virt_to_ptr(frame).cast::<CpuState>() }
}

/// Registers `handler` for an interrupt vector.
pub fn register_handler(vector: usize, handler: InterruptHandler) {
    if vector >= IDT_ENTRIES {
        error!(target: "isr", "interrupt vector {:#x} not allowed", vector);
        return;
    }
    without_interrupts(|| {
        HANDLERS.lock()[vector] = Some(handler);
    });
}

/// The common C-level entry, called by the assembly stub with the stack
/// pointer after all pushes. The return value becomes the stack pointer
/// the stub pops the frame from.
#[no_mangle]
pub extern "C" fn handle_interrupt(frame: VirtualAddress) -> VirtualAddress {
    // Save the vector before a handler possibly swaps the frame.
    // SAFETY: the stub passes its own ESP, which points at the frame it
    // just pushed.
    let vector = unsafe { cpu_state(frame) }.intr;
    let handler = HANDLERS.lock()[vector as usize];
    let frame = match handler {
        Some(handler) => handler(frame),
        None => {
            if is_exception(vector) {
                // SAFETY: as above; the frame is still the stub's.
                let eip = unsafe { cpu_state(frame) }.eip;
                panic!("EX{:02x} (EIP={:08x})", vector, eip);
            }
            if is_irq(vector) {
                warn!(target: "isr", "unhandled IRQ{}", vector - irq(0) as u32);
            }
            if is_syscall(vector) {
                // SAFETY: as above.
                let id = unsafe { cpu_state(frame) }.r.eax;
                error!(target: "isr", "unknown syscall {:08x}", id);
            }
            frame
        }
    };
    if is_irq(vector) {
        pic::send_eoi(vector as u8);
    }
    frame
}

/// Logs the saved register image, two lines as on a fault report.
pub fn dump_cpu(frame: VirtualAddress) {
    // SAFETY: callers hand in a valid frame address.
    let cpu = unsafe { cpu_state(frame) };
    log::debug!(
        target: "isr",
        "uss={:08x} usp={:08x} efl={:08x}  cs=    {:04x} eip={:08x} err={:08x} \
         int={:08x} eax={:08x} ecx={:08x} edx={:08x}",
        cpu.user_ss, cpu.user_esp, cpu.eflags, cpu.cs, cpu.eip,
        cpu.error, cpu.intr, cpu.r.eax, cpu.r.ecx, cpu.r.edx
    );
    log::debug!(
        target: "isr",
        "ebx={:08x} esp={:08x} ebp={:08x} esi={:08x} edi={:08x}  \
         ds=    {:04x}  es=    {:04x}  fs=    {:04x}  gs=    {:04x}",
        cpu.r.ebx, cpu.r.esp, cpu.r.ebp, cpu.r.esi, cpu.r.edi,
        cpu.ds, cpu.es, cpu.fs, cpu.gs
    );
}

pub use self::hw::{enable_interrupts, get_interrupts};

/// Runs `f` with interrupts disabled, restoring the previous flag after.
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    let prev = enable_interrupts(false);
    let result = f();
    enable_interrupts(prev);
    result
}

/// Registers the syscall dispatcher and turns interrupts on.
pub fn init() {
    crate::print!("ISR init ... ");
    register_handler(SYSCALL_VECTOR, syscall::handle_syscall);
    syscall::init();
    enable_interrupts(true);
    crate::print::ok();
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod hw {
    use super::EFlags;

    /// Whether the architectural interrupt flag is set.
    pub fn get_interrupts() -> bool {
        let eflags: u32;
        // SAFETY: pushfd/pop only reads EFLAGS.
        unsafe {
            core::arch::asm!("pushfd", "pop {}", out(reg) eflags, options(preserves_flags));
        }
        EFlags::from_bits_truncate(eflags).contains(EFlags::INTERRUPT)
    }

    /// Sets the interrupt flag, returning its previous value. Only acts
    /// when the state actually changes.
    pub fn enable_interrupts(enable: bool) -> bool {
        let old = get_interrupts();
        if enable && !old {
            // SAFETY: ring 0; enabling interrupts is the desired effect.
            unsafe { x86::irq::enable() };
        } else if !enable && old {
            // SAFETY: ring 0.
            unsafe { x86::irq::disable() };
        }
        old
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
mod hw {
    use core::sync::atomic::{AtomicBool, Ordering};

    /// Hosted stand-in for the interrupt flag; tests observe critical
    /// sections through it.
    static INTERRUPT_FLAG: AtomicBool = AtomicBool::new(false);

    pub fn get_interrupts() -> bool {
        INTERRUPT_FLAG.load(Ordering::Relaxed)
    }

    pub fn enable_interrupts(enable: bool) -> bool {
        INTERRUPT_FLAG.swap(enable, Ordering::Relaxed)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn cpu_state_layout_matches_the_stub_contract() {
        assert_eq!(core::mem::size_of::<CpuState>(), 23 * 4);
        assert_eq!(core::mem::offset_of!(CpuState, gs), 0);
        assert_eq!(core::mem::offset_of!(CpuState, r), 16);
        assert_eq!(core::mem::offset_of!(CpuState, intr), 48);
        assert_eq!(core::mem::offset_of!(CpuState, error), 52);
        assert_eq!(core::mem::offset_of!(CpuState, eip), 56);
        assert_eq!(core::mem::offset_of!(CpuState, cs), 60);
        assert_eq!(core::mem::offset_of!(CpuState, eflags), 64);
        assert_eq!(core::mem::offset_of!(CpuState, user_esp), 68);
        assert_eq!(core::mem::offset_of!(CpuState, user_ss), 72);
        assert_eq!(core::mem::offset_of!(CpuState, vm86_es), 76);
    }

    #[test]
    fn interrupt_flag_save_and_restore() {
        let _guard = crate::test_support::kernel_lock();
        enable_interrupts(true);
        let prev = enable_interrupts(false);
        assert!(prev);
        assert!(!get_interrupts());
        enable_interrupts(prev);
        assert!(get_interrupts());
    }

    #[test]
    fn vector_classification() {
        assert!(is_exception(0x0D));
        assert!(!is_exception(0x20));
        assert!(is_irq(0x20));
        assert!(is_irq(0x2F));
        assert!(!is_irq(0x30));
        assert!(is_syscall(0x30));
    }
}
