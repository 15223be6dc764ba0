//! Task model
//!
//! Each task owns two stacks — a kernel stack for interrupt handling and a
//! user stack for the task's own code — plus a page directory, so every
//! task runs in its own virtual address space. The saved [`CpuState`]
//! lives at the top of the kernel stack; restoring it is how a task
//! resumes.

use log::{debug, error};
use spin::Mutex;

use crate::{
    arch::x86::{gdt, mmu},
    elf::ElfImage,
    interrupts::{self, CpuState, EFlags},
    mm::{vmm, PhysicalAddress, VirtualAddress},
};

/// Maximum number of tasks; bounds the PID space.
pub const MAX_TASKS: usize = 1024;

/// Unique task id. 0 is reserved as the invalid/error sentinel.
pub type TaskPid = u32;

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Marked for removal; the scheduler's finalizer will reap it.
    Stopped = 0,
    /// Schedulable.
    Running = 1,
}

/// One task record. Owned stacks and directory are freed exactly once, by
/// [`destroy`]; the ELF reference is non-owning and only locates the image
/// so its segments can be unloaded along with the task.
#[derive(Debug, Clone, Copy)]
pub struct Task {
    pub(crate) state: TaskState,
    pub(crate) page_directory: PhysicalAddress,
    pub(crate) kernel_stack: VirtualAddress,
    pub(crate) user_stack: VirtualAddress,
    pub(crate) kernel_stack_len: usize,
    pub(crate) user_stack_len: usize,
    /// Address of the saved CPU state on the kernel stack.
    pub(crate) cpu: VirtualAddress,
    /// Remaining timer ticks in the current time slice.
    pub(crate) ticks: u32,
    pub(crate) vm86: bool,
    pub(crate) elf: Option<ElfImage>,
}

struct TaskTable {
    slots: [Option<Task>; MAX_TASKS],
}

static TASKS: Mutex<TaskTable> = Mutex::new(TaskTable {
    slots: [const { None }; MAX_TASKS],
});

/// Runs `f` on the task table inside an interrupt-disabled critical
/// section, the kernel's only mutual-exclusion primitive.
fn with_table<R>(f: impl FnOnce(&mut TaskTable) -> R) -> R {
    interrupts::without_interrupts(|| f(&mut TASKS.lock()))
}

fn with_task<R>(pid: TaskPid, f: impl FnOnce(&mut Task) -> R) -> Option<R> {
    with_table(|table| match table.slots.get_mut(pid as usize).and_then(Option::as_mut) {
        Some(task) => Some(f(task)),
        None => {
            error!(target: "task", "task {} does not exist", pid);
            None
        }
    })
}

/// Inserts a task at the first free PID slot and returns its PID.
/// Reaching the table bound is fatal.
pub(crate) fn add(task: Task) -> TaskPid {
    with_table(|table| {
        // PID 0 is the error sentinel, never handed out.
        for pid in 1..MAX_TASKS {
            if table.slots[pid].is_none() {
                table.slots[pid] = Some(task);
                return pid as TaskPid;
            }
        }
        panic!("maximum task number reached");
    })
}

/// Writes the initial CPU frame at the top of a freshly allocated kernel
/// stack and returns its address. All registers zeroed, EFLAGS carries IF
/// (interrupts enabled on first dispatch) and the always-one reserved bit.
pub(crate) fn carve_initial_frame(
    kernel_stack: VirtualAddress,
    kernel_stack_len: usize,
) -> VirtualAddress {
    let frame =
        VirtualAddress::new(kernel_stack.as_u32() + kernel_stack_len as u32
            - core::mem::size_of::<CpuState>() as u32);
    // SAFETY: the kernel stack was just allocated and mapped; the frame
    // span lies fully inside it and is 4-byte aligned.
    unsafe {
        mmu::zero(frame, core::mem::size_of::<CpuState>());
        let cpu = interrupts::cpu_state(frame);
        cpu.eflags = (EFlags::INTERRUPT | EFlags::RESERVED).bits();
    }
    frame
}

fn create_detailed(
    entry_point: VirtualAddress,
    page_directory: Option<PhysicalAddress>,
    kernel_stack_len: usize,
    user_stack_len: usize,
    elf: Option<ElfImage>,
    code_segment: usize,
    data_segment: usize,
) -> Option<TaskPid> {
    let prev_interrupts = interrupts::enable_interrupts(false);
    debug!(
        target: "task",
        "creating task with {} byte kernel and {} byte user stack",
        kernel_stack_len, user_stack_len
    );
    let created_directory = page_directory.is_none();
    let directory = match page_directory {
        Some(dir) => dir,
        None => match vmm::create_directory() {
            Ok(dir) => dir,
            Err(err) => {
                error!(target: "task", "no page directory for new task: {:?}", err);
                interrupts::enable_interrupts(prev_interrupts);
                return None;
            }
        },
    };

    // Allocate inside the new address space so the stacks are visible
    // there; kernel-domain entries propagate to the others at switch time.
    vmm::modify_directory(directory);
    let stacks = (|| {
        let kernel_stack = vmm::alloc(kernel_stack_len, vmm::VmFlags::WRITABLE)?;
        let user_stack = if user_stack_len > 0 {
            vmm::alloc(user_stack_len, vmm::VmFlags::USER | vmm::VmFlags::WRITABLE)?
        } else {
            VirtualAddress::new(0)
        };
        Ok::<_, vmm::VmmError>((kernel_stack, user_stack))
    })();
    let (kernel_stack, user_stack) = match stacks {
        Ok(stacks) => stacks,
        Err(err) => {
            error!(target: "task", "no stacks for new task: {:?}", err);
            vmm::modified_directory();
            if created_directory {
                vmm::destroy_directory(directory);
            }
            interrupts::enable_interrupts(prev_interrupts);
            return None;
        }
    };

    let frame = carve_initial_frame(kernel_stack, kernel_stack_len);
    // SAFETY: `frame` addresses the frame just carved on the new kernel
    // stack, mapped in the directory being modified.
    unsafe {
        let cpu = interrupts::cpu_state(frame);
        let data_selector = gdt::selector(data_segment) as u32;
        cpu.gs = data_selector;
        cpu.fs = data_selector;
        cpu.es = data_selector;
        cpu.ds = data_selector;
        cpu.eip = entry_point.as_u32();
        cpu.cs = gdt::selector(code_segment) as u32;
        // Popped by iret only on a ring transition; ignored for ring 0.
        if user_stack_len > 0 {
            cpu.user_esp = user_stack.as_u32() + user_stack_len as u32 - 1;
            cpu.user_ss = data_selector;
        }
    }
    vmm::modified_directory();

    let pid = add(Task {
        state: TaskState::Running,
        page_directory: directory,
        kernel_stack,
        user_stack,
        kernel_stack_len,
        user_stack_len,
        cpu: frame,
        ticks: 0,
        vm86: false,
        elf,
    });
    interrupts::enable_interrupts(prev_interrupts);
    Some(pid)
}

/// Creates a ring-0 task. Kernel tasks have no user stack; `iret` never
/// leaves ring 0 for them.
pub fn create_kernel(
    entry_point: VirtualAddress,
    page_directory: Option<PhysicalAddress>,
    kernel_stack_len: usize,
) -> Option<TaskPid> {
    create_detailed(
        entry_point,
        page_directory,
        kernel_stack_len,
        0,
        None,
        gdt::RING0_CODE_SEG,
        gdt::RING0_DATA_SEG,
    )
}

/// Creates a ring-3 task with its own user stack.
pub fn create_user(
    entry_point: VirtualAddress,
    page_directory: Option<PhysicalAddress>,
    kernel_stack_len: usize,
    user_stack_len: usize,
    elf: Option<ElfImage>,
) -> Option<TaskPid> {
    create_detailed(
        entry_point,
        page_directory,
        kernel_stack_len,
        user_stack_len,
        elf,
        gdt::RING3_CODE_SEG,
        gdt::RING3_DATA_SEG,
    )
}

/// Marks a task Stopped without removing it from the table. The task is
/// still executing on its own kernel stack, so that stack cannot be freed
/// here; the scheduler's finalizer reaps it once it is off the CPU.
pub fn stop(pid: TaskPid) {
    with_task(pid, |task| task.state = TaskState::Stopped);
}

/// Destroys a stopped task: frees both stacks inside its address space,
/// then the directory, then the table slot.
pub fn destroy(pid: TaskPid) {
    let prev_interrupts = interrupts::enable_interrupts(false);
    let Some(task) = with_task(pid, |task| *task) else {
        interrupts::enable_interrupts(prev_interrupts);
        return;
    };
    if task.state == TaskState::Running {
        error!(target: "task", "refusing to destroy running task {}", pid);
        interrupts::enable_interrupts(prev_interrupts);
        return;
    }
    debug!(target: "task", "destroying task {}", pid);
    vmm::modify_directory(task.page_directory);
    vmm::free(task.kernel_stack, task.kernel_stack_len);
    // A VM86 task's "user stack" is borrowed low memory; the whole low
    // mapping goes away with the directory's first page table instead.
    if task.user_stack_len > 0 && !task.vm86 {
        vmm::free(task.user_stack, task.user_stack_len);
    }
    vmm::modified_directory();
    vmm::destroy_directory(task.page_directory);
    with_table(|table| table.slots[pid as usize] = None);
    interrupts::enable_interrupts(prev_interrupts);
}

/// Next occupied PID after `pid`, wrapping past the table end. Returns 0
/// when the table is empty.
pub fn next_task(pid: TaskPid) -> TaskPid {
    with_table(|table| {
        let next = |from: usize| -> Option<usize> {
            (from..MAX_TASKS).find(|&slot| table.slots[slot].is_some())
        };
        match next(pid as usize + 1) {
            Some(found) => found as TaskPid,
            None => next(1).map(|found| found as TaskPid).unwrap_or(0),
        }
    })
}

/// Next PID after `pid` whose task has the wanted state, bounded by one
/// full sweep of the table. Returns 0 if there is none.
pub fn next_task_with_state(pid: TaskPid, state: TaskState) -> TaskPid {
    let mut candidate = pid;
    for _ in 0..=MAX_TASKS {
        candidate = next_task(candidate);
        if candidate == 0 {
            return 0;
        }
        if with_task(candidate, |task| task.state) == Some(state) {
            return candidate;
        }
    }
    0
}

pub fn ticks(pid: TaskPid) -> u32 {
    with_task(pid, |task| task.ticks).unwrap_or(0)
}

/// Sets a task's remaining ticks and returns the previous value.
pub fn set_ticks(pid: TaskPid, ticks: u32) -> u32 {
    with_task(pid, |task| core::mem::replace(&mut task.ticks, ticks)).unwrap_or(0)
}

/// Address of the task's saved CPU state.
pub fn cpu(pid: TaskPid) -> VirtualAddress {
    with_task(pid, |task| task.cpu).unwrap_or(VirtualAddress::new(0))
}

pub fn set_cpu(pid: TaskPid, frame: VirtualAddress) {
    with_task(pid, |task| task.cpu = frame);
}

pub fn page_directory(pid: TaskPid) -> PhysicalAddress {
    with_task(pid, |task| task.page_directory).unwrap_or(PhysicalAddress::new(0))
}

pub fn is_vm86(pid: TaskPid) -> bool {
    with_task(pid, |task| task.vm86).unwrap_or(false)
}

pub fn elf(pid: TaskPid) -> Option<ElfImage> {
    with_task(pid, |task| task.elf).flatten()
}

/// Logs the task list.
pub fn debug_dump() {
    let initial = next_task(0);
    if initial == 0 {
        debug!(target: "task", "there are no tasks");
        return;
    }
    let mut pid = initial;
    loop {
        let (state, vm86) =
            with_task(pid, |task| (task.state, task.vm86)).unwrap_or((TaskState::Stopped, false));
        debug!(
            target: "task",
            "{} task with pid {}{}",
            if state == TaskState::Running { "running" } else { "stopped" },
            pid,
            if vm86 { " (VM86)" } else { "" }
        );
        pid = next_task(pid);
        if pid == 0 || pid == initial {
            break;
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
pub(crate) fn reset_table() {
    let mut table = TASKS.lock();
    table.slots = [const { None }; MAX_TASKS];
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::test_support::kernel_lock;

    fn dummy(state: TaskState) -> Task {
        Task {
            state,
            page_directory: PhysicalAddress::new(0x1000),
            kernel_stack: VirtualAddress::new(0),
            user_stack: VirtualAddress::new(0),
            kernel_stack_len: 0,
            user_stack_len: 0,
            cpu: VirtualAddress::new(0),
            ticks: 0,
            vm86: false,
            elf: None,
        }
    }

    #[test]
    fn add_assigns_ascending_pids_skipping_zero() {
        let _guard = kernel_lock();
        reset_table();
        assert_eq!(add(dummy(TaskState::Running)), 1);
        assert_eq!(add(dummy(TaskState::Running)), 2);
        assert_eq!(add(dummy(TaskState::Running)), 3);
    }

    #[test]
    fn next_task_wraps_around() {
        let _guard = kernel_lock();
        reset_table();
        let a = add(dummy(TaskState::Running));
        let b = add(dummy(TaskState::Running));
        let c = add(dummy(TaskState::Running));
        assert_eq!(next_task(a), b);
        assert_eq!(next_task(b), c);
        assert_eq!(next_task(c), a);
        // From PID 0 the scan starts at the lowest occupied slot.
        assert_eq!(next_task(0), a);
    }

    #[test]
    fn next_task_with_state_filters_and_terminates() {
        let _guard = kernel_lock();
        reset_table();
        let a = add(dummy(TaskState::Running));
        let b = add(dummy(TaskState::Stopped));
        let c = add(dummy(TaskState::Running));
        assert_eq!(next_task_with_state(a, TaskState::Running), c);
        assert_eq!(next_task_with_state(c, TaskState::Running), a);
        assert_eq!(next_task_with_state(a, TaskState::Stopped), b);

        // With no Running task left the sweep must come back empty.
        stop(a);
        stop(c);
        assert_eq!(next_task_with_state(0, TaskState::Running), 0);
    }

    #[test]
    fn freed_pid_slot_is_reused() {
        let _guard = kernel_lock();
        reset_table();
        let a = add(dummy(TaskState::Running));
        let _b = add(dummy(TaskState::Running));
        with_table(|table| table.slots[a as usize] = None);
        assert_eq!(add(dummy(TaskState::Running)), a);
    }

    #[test]
    fn tick_accounting_returns_previous_value() {
        let _guard = kernel_lock();
        reset_table();
        let a = add(dummy(TaskState::Running));
        assert_eq!(set_ticks(a, 5), 0);
        assert_eq!(set_ticks(a, 7), 5);
        assert_eq!(ticks(a), 7);
    }
}
