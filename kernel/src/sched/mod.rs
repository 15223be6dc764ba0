//! Round-robin scheduler
//!
//! Runs inside the timer IRQ: the common stub saves the interrupted
//! task's frame and [`schedule`] decides which frame the stub restores.
//! Switching tasks is nothing more than returning a different task's
//! saved frame after pointing the TSS and CR3 at that task's stack and
//! address space.

use core::sync::atomic::{AtomicU32, Ordering};

use log::debug;

use crate::{
    arch::x86::tss,
    elf,
    interrupts::CpuState,
    mm::{vmm, VirtualAddress},
    task::{self, TaskPid, TaskState},
};

/// PID of the task currently on the CPU; 0 while the kernel bootstraps.
static CURRENT_TASK: AtomicU32 = AtomicU32::new(0);

/// Timer ticks a task runs before preemption considers switching.
static TICKS_PER_SLICE: AtomicU32 = AtomicU32::new(1);

/// Picks the frame to restore for this timer tick.
///
/// Returns the incoming frame unchanged while the kernel is still
/// bootstrapping, while the current task's time slice is not used up, or
/// when no other Running task exists.
pub fn schedule(frame: VirtualAddress) -> VirtualAddress {
    let next = next_running_task();
    if next == 0 {
        return frame;
    }
    let current = CURRENT_TASK.load(Ordering::Relaxed);
    if current != 0 {
        // Burn one tick; switch only once the slice is used up.
        if task::set_ticks(current, task::ticks(current).wrapping_sub(1)) > 1 {
            return frame;
        }
        // Remember where this task's state was saved so it can resume.
        task::set_cpu(current, frame);
    }
    if current == next {
        return frame;
    }
    switch_task(next)
}

/// Switches to `next` and returns its saved frame.
pub fn switch_task(next: TaskPid) -> VirtualAddress {
    let current = CURRENT_TASK.load(Ordering::Relaxed);
    if current != 0 {
        debug!(target: "sched", "task switch from task {} to task {}", current, next);
    } else {
        debug!(target: "sched", "initial task switch to task {}", next);
    }
    let frame = task::cpu(next);
    // After the frame is fully popped, ESP sits one past it; that is the
    // kernel stack position the CPU must load on the next ring-3 trap.
    tss::set_kernel_stack(VirtualAddress::new(
        frame.as_u32() + core::mem::size_of::<CpuState>() as u32,
    ));
    task::set_ticks(next, TICKS_PER_SLICE.load(Ordering::Relaxed));
    vmm::load_directory(task::page_directory(next));
    CURRENT_TASK.store(next, Ordering::Relaxed);
    frame
}

/// PID of the task currently on the CPU, 0 during bootstrap.
pub fn current_task() -> TaskPid {
    CURRENT_TASK.load(Ordering::Relaxed)
}

/// PID of the next Running task after the current one.
pub fn next_running_task() -> TaskPid {
    task::next_task_with_state(current_task(), TaskState::Running)
}

/// Sets the quantum in timer ticks.
pub fn set_time_slice(ticks: u32) {
    TICKS_PER_SLICE.store(ticks.max(1), Ordering::Relaxed);
}

/// Destroys every Stopped task. Called from the kernel's idle loop, never
/// from the IRQ path: a task that just stopped may still be running on
/// the kernel stack an IRQ-path destroy would free.
pub fn finalize_tasks() {
    let mut pid: TaskPid = 0;
    loop {
        pid = task::next_task_with_state(pid, TaskState::Stopped);
        if pid == 0 {
            return;
        }
        match task::elf(pid) {
            Some(_) => elf::destroy_task(pid),
            None => task::destroy(pid),
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
pub(crate) fn reset_state() {
    CURRENT_TASK.store(0, Ordering::Relaxed);
    TICKS_PER_SLICE.store(1, Ordering::Relaxed);
}
