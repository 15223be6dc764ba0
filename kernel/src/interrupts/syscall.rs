//! Syscall interface
//!
//! Userspace requests kernel services by firing interrupt 0x30 with a
//! syscall id in EAX and up to five arguments in EBX/ECX/EDX/ESI/EDI; the
//! result comes back in EAX. Handlers receive a mutable reference to the
//! frame address so a syscall can switch tasks — `exit` is the one that
//! does.

use log::{debug, error};
use spin::Mutex;

use super::{cpu_state, without_interrupts};
use crate::{drivers::vga, mm::VirtualAddress, sched, task};

/// Size of the syscall table.
pub const SYSCALL_COUNT: usize = 4;

pub const SYS_EXIT: usize = 0;
pub const SYS_GETPID: usize = 1;
pub const SYS_IO_PUTCHAR: usize = 2;
pub const SYS_IO_ATTR: usize = 3;

/// Kernel-side syscall handler. Arguments arrive in register order; the
/// frame reference allows a task switch, in which case the dispatcher
/// leaves EAX of the new task untouched.
pub type SyscallHandler =
    fn(ebx: u32, ecx: u32, edx: u32, esi: u32, edi: u32, frame: &mut VirtualAddress) -> u32;

static SYSCALLS: Mutex<[Option<SyscallHandler>; SYSCALL_COUNT]> =
    Mutex::new([None; SYSCALL_COUNT]);

/// Registers a handler for a syscall id.
pub fn register(id: usize, handler: SyscallHandler) {
    if id >= SYSCALL_COUNT {
        error!(target: "syscall", "syscall {} not allowed", id);
        return;
    }
    without_interrupts(|| {
        SYSCALLS.lock()[id] = Some(handler);
    });
}

/// The vector-0x30 interrupt handler: second-level dispatch keyed by EAX.
pub fn handle_syscall(frame: VirtualAddress) -> VirtualAddress {
    // Copy the registers out so no borrow of the frame is live while a
    // handler runs (a handler may inspect or switch the frame itself).
    // SAFETY: the common dispatch hands us the stub's frame address.
    let registers = unsafe { cpu_state(frame) }.r;
    let id = registers.eax as usize;
    let handler = if id < SYSCALL_COUNT {
        SYSCALLS.lock()[id]
    } else {
        None
    };
    let Some(handler) = handler else {
        error!(target: "syscall", "unknown syscall {:08x}", registers.eax);
        return frame;
    };
    let mut new_frame = frame;
    let ret = handler(
        registers.ebx,
        registers.ecx,
        registers.edx,
        registers.esi,
        registers.edi,
        &mut new_frame,
    );
    // Write the result back only if the handler did not switch tasks;
    // EAX of an unrelated frame must stay untouched.
    if new_frame == frame {
        // SAFETY: the handler has returned; this is the only live borrow.
        unsafe { cpu_state(frame) }.r.eax = ret;
    }
    new_frame
}

/// Stops the calling task and switches to the next Running one. Used by
/// `exit` and by the VM86 monitor's task-done path. Refuses to stop the
/// last Running task.
pub(crate) fn exit_current(frame: &mut VirtualAddress) -> bool {
    let current = sched::current_task();
    let next = sched::next_running_task();
    if next == 0 || next == current {
        error!(target: "syscall", "the last task cannot exit");
        return false;
    }
    // The stopped task still executes on its own kernel stack, so it is
    // only marked here; the scheduler's finalizer reaps it later.
    task::stop(current);
    *frame = sched::switch_task(next);
    true
}

fn sys_exit(status: u32, _: u32, _: u32, _: u32, _: u32, frame: &mut VirtualAddress) -> u32 {
    debug!(
        target: "syscall",
        "task {} exits with status {}",
        sched::current_task(),
        status
    );
    if exit_current(frame) {
        // Unreached from the caller's perspective: the returned frame
        // belongs to the next task.
        0
    } else {
        u32::MAX
    }
}

fn sys_getpid(_: u32, _: u32, _: u32, _: u32, _: u32, _: &mut VirtualAddress) -> u32 {
    sched::current_task()
}

fn sys_io_putchar(ch: u32, _: u32, _: u32, _: u32, _: u32, _: &mut VirtualAddress) -> u32 {
    vga::putchar(ch as u8);
    0
}

fn sys_io_attr(attr: u32, _: u32, _: u32, _: u32, _: u32, _: &mut VirtualAddress) -> u32 {
    vga::set_attr(attr as u8) as u32
}

/// Installs the fixed syscall set.
pub fn init() {
    register(SYS_EXIT, sys_exit);
    register(SYS_GETPID, sys_getpid);
    register(SYS_IO_PUTCHAR, sys_io_putchar);
    register(SYS_IO_ATTR, sys_io_attr);
}
