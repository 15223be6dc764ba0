//! Virtual 8086 mode monitor
//!
//! VM86 tasks run 16-bit real-mode code (BIOS calls, mostly) inside a
//! supervised ring-3 task. The CPU raises #GP on the sensitive
//! instructions; the monitor decodes the faulting instruction at CS:IP
//! and emulates it. The supported-opcode set is deliberately small and
//! anything else panics — failing loudly beats silently skipping.

use log::{debug, error};

use crate::{
    arch::x86::{gdt, mmu, port},
    interrupts::{self, cpu_state, syscall, CpuState, EFlags, Registers},
    mm::{pmm::LOWER_MEMORY, vmm, PhysicalAddress, VirtualAddress},
    sched,
    task::{self, Task, TaskPid, TaskState},
};

/// Where 16-bit code is copied: the start of conventional memory. The
/// fixed location means only one VM86 task can run at a time.
const CODE_ADDRESS: u32 = 0x500;

/// The real-mode interrupt vector table at physical 0. One of the few
/// legitimate occasions to dereference the null page.
const IVT_ADDRESS: u32 = 0;

const OPERAND_SIZE: u8 = 0x66;
const OPCODE_PUSHF: u8 = 0x9C;
const OPCODE_POPF: u8 = 0x9D;
const OPCODE_INT_3: u8 = 0xCC;
const OPCODE_INT: u8 = 0xCD;
const OPCODE_IRET: u8 = 0xCF;
const OPCODE_CLI: u8 = 0xFA;
const OPCODE_STI: u8 = 0xFB;

/// A real-mode far pointer, `segment * 16 + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FarPtr {
    pub offset: u16,
    pub segment: u16,
}

impl FarPtr {
    /// Splits a linear address below the 1 MiB bound. The split keeps the
    /// code inside a single segment: the low word becomes the offset,
    /// everything above goes into the segment.
    pub fn from_linear(addr: u32) -> Self {
        if addr >= LOWER_MEMORY as u32 {
            error!(target: "vm86", "address {:08x} too large for VM86 mode", addr);
            return Self {
                offset: 0,
                segment: 0,
            };
        }
        let offset = (addr & 0xFFFF) as u16;
        Self {
            offset,
            segment: ((addr - offset as u32) >> 4) as u16,
        }
    }

    pub const fn linear(&self) -> VirtualAddress {
        VirtualAddress::new(((self.segment as u32) << 4) + self.offset as u32)
    }
}

/// Creates a task that runs `code` in virtual 8086 mode.
///
/// The first MiB is identity-mapped user-writable — it lies outside the
/// user domain, so domain checks are bypassed for this one mapping. The
/// code is copied to the fixed low address and the user stack borrows the
/// conventional memory right after it.
pub fn create_task(
    code: &[u8],
    page_directory: Option<PhysicalAddress>,
    kernel_stack_len: usize,
    user_stack_len: usize,
    registers: &Registers,
) -> Option<TaskPid> {
    let prev_interrupts = interrupts::enable_interrupts(false);
    debug!(
        target: "vm86",
        "creating VM86 task with {} byte kernel and {} byte user stack",
        kernel_stack_len, user_stack_len
    );
    let created_directory = page_directory.is_none();
    let directory = match page_directory {
        Some(dir) => dir,
        None => match vmm::create_directory() {
            Ok(dir) => dir,
            Err(err) => {
                error!(target: "vm86", "no page directory for VM86 task: {:?}", err);
                interrupts::enable_interrupts(prev_interrupts);
                return None;
            }
        },
    };

    vmm::modify_directory(directory);
    vmm::set_domain_check(false);
    let mapped = vmm::map_range(
        VirtualAddress::new(0),
        PhysicalAddress::new(0),
        LOWER_MEMORY,
        vmm::VmFlags::USER | vmm::VmFlags::WRITABLE,
    );
    vmm::set_domain_check(true);
    if mapped.is_err() {
        error!(target: "vm86", "cannot identity-map low memory");
        vmm::modified_directory();
        if created_directory {
            vmm::destroy_directory(directory);
        }
        interrupts::enable_interrupts(prev_interrupts);
        return None;
    }

    // The code must be position independent; for calling the BIOS that
    // is enough.
    // SAFETY: low memory was just mapped writable in the directory under
    // modification.
    unsafe { mmu::copy_in(VirtualAddress::new(CODE_ADDRESS), code) };

    let kernel_stack = match vmm::alloc(kernel_stack_len, vmm::VmFlags::WRITABLE) {
        Ok(stack) => stack,
        Err(err) => {
            error!(target: "vm86", "no kernel stack for VM86 task: {:?}", err);
            vmm::modified_directory();
            if created_directory {
                vmm::destroy_directory(directory);
            }
            interrupts::enable_interrupts(prev_interrupts);
            return None;
        }
    };
    let user_stack = VirtualAddress::new(CODE_ADDRESS + code.len() as u32);

    let frame = task::carve_initial_frame(kernel_stack, kernel_stack_len);
    let entry = FarPtr::from_linear(CODE_ADDRESS);
    // SAFETY: `frame` is the frame just carved on the new kernel stack.
    unsafe {
        let cpu = cpu_state(frame);
        // Overwritten by the vm86_* selectors on iret; set anyway.
        let data_selector = gdt::selector(gdt::RING3_DATA_SEG) as u32;
        cpu.gs = data_selector;
        cpu.fs = data_selector;
        cpu.es = data_selector;
        cpu.ds = data_selector;
        // Inputs for the 16-bit code travel in the general registers.
        cpu.r = *registers;
        // Real-mode addressing: CS:IP for code, SS:SP for the stack.
        cpu.eip = entry.offset as u32;
        cpu.cs = entry.segment as u32;
        cpu.eflags = (EFlags::INTERRUPT | EFlags::RESERVED | EFlags::VM).bits();
        let stack_top =
            FarPtr::from_linear(user_stack.as_u32() + user_stack_len as u32 - 1);
        cpu.user_esp = stack_top.offset as u32;
        cpu.user_ss = stack_top.segment as u32;
        // Code, data and stack share one low-memory segment.
        cpu.vm86_es = entry.segment as u32;
        cpu.vm86_ds = entry.segment as u32;
        cpu.vm86_fs = entry.segment as u32;
        cpu.vm86_gs = entry.segment as u32;
    }
    vmm::modified_directory();

    let pid = task::add(Task {
        state: TaskState::Running,
        page_directory: directory,
        kernel_stack,
        user_stack,
        kernel_stack_len,
        user_stack_len,
        cpu: frame,
        ticks: 0,
        vm86: true,
        elf: None,
    });
    interrupts::enable_interrupts(prev_interrupts);
    Some(pid)
}

/// 16-bit template for [`call_bios`]: `INT imm8; INT3`. The immediate is
/// patched before the copy; INT3 reports the results and ends the task.
const CALL_BIOS_TEMPLATE: [u8; 3] = [OPCODE_INT, 0x00, OPCODE_INT_3];
const CALL_BIOS_INT_OPERAND: usize = 1;

/// Spawns a VM86 task that calls one BIOS interrupt with the given
/// register inputs.
pub fn call_bios(interrupt: u8, registers: &Registers) -> Option<TaskPid> {
    let mut code = CALL_BIOS_TEMPLATE;
    code[CALL_BIOS_INT_OPERAND] = interrupt;
    create_task(&code, None, 4096, 4096, registers)
}

/// Pushes a 16-bit value onto the task's real-mode stack.
fn push(cpu: &mut CpuState, value: u16) {
    let stack = FarPtr {
        offset: cpu.user_esp as u16,
        segment: cpu.user_ss as u16,
    };
    let new_top = stack.linear().as_u32() - 2;
    // SAFETY: the VM86 stack lies in the identity-mapped first MiB.
    unsafe { mmu::write_u16(VirtualAddress::new(new_top), value) };
    let far = FarPtr::from_linear(new_top);
    cpu.user_ss = far.segment as u32;
    cpu.user_esp = far.offset as u32;
}

/// Pops a 16-bit value off the task's real-mode stack.
fn pop(cpu: &mut CpuState) -> u16 {
    let stack = FarPtr {
        offset: cpu.user_esp as u16,
        segment: cpu.user_ss as u16,
    };
    // SAFETY: as in `push`.
    let value = unsafe { mmu::read_u16(stack.linear()) };
    let far = FarPtr::from_linear(stack.linear().as_u32() + 2);
    cpu.user_ss = far.segment as u32;
    cpu.user_esp = far.offset as u32;
    value
}

/// Completes an emulated instruction by advancing CS:IP by its length.
fn increment_ip(cpu: &mut CpuState, len: u32) {
    let csip = FarPtr {
        offset: cpu.eip as u16,
        segment: cpu.cs as u16,
    };
    let next = FarPtr::from_linear(csip.linear().as_u32() + len);
    cpu.cs = next.segment as u32;
    cpu.eip = next.offset as u32;
}

fn set_al(cpu: &mut CpuState, value: u8) {
    cpu.r.eax = (cpu.r.eax & !0xFF) | value as u32;
}

fn set_ax(cpu: &mut CpuState, value: u16) {
    cpu.r.eax = (cpu.r.eax & !0xFFFF) | value as u32;
}

/// Emulates the sensitive instruction that faulted at CS:IP. Returns
/// false when the current task is not a VM86 task and the fault belongs
/// to the regular panic path.
fn monitor(frame: &mut VirtualAddress) -> bool {
    if !task::is_vm86(sched::current_task()) {
        return false;
    }
    // SAFETY: `frame` is the frame address the dispatcher received.
    let cpu = unsafe { cpu_state(*frame) };
    let csip = FarPtr {
        offset: cpu.eip as u16,
        segment: cpu.cs as u16,
    }
    .linear();
    // SAFETY: CS:IP of a running VM86 task points into mapped low memory.
    let byte = |offset: u32| unsafe { mmu::read_u8(csip.offset(offset)) };
    // One-byte 0x66 prefix folds into a 16-bit opcode as in a disassembly
    // table; `imm` is the operand position behind prefix and opcode.
    let (opcode, imm) = if byte(0) == OPERAND_SIZE {
        ((OPERAND_SIZE as u16) << 8 | byte(1) as u16, 2)
    } else {
        (byte(0) as u16, 1)
    };
    match opcode {
        op if op == OPCODE_PUSHF as u16 => {
            let flags = cpu.eflags as u16;
            push(cpu, flags);
            increment_ip(cpu, 1);
        }
        op if op == OPCODE_POPF as u16 => {
            // The emulated flags image is ignored.
            pop(cpu);
            increment_ip(cpu, 1);
        }
        op if op == OPCODE_INT_3 as u16 => {
            // The 16-bit code is done; report its outputs and exit.
            crate::println!(
                "BIOS call returned EAX={:08x}, EBX={:08x}, ECX={:08x}, EDX={:08x}",
                cpu.r.eax,
                cpu.r.ebx,
                cpu.r.ecx,
                cpu.r.edx
            );
            syscall::exit_current(frame);
        }
        op if op == OPCODE_INT as u16 => {
            let vector = byte(1);
            debug!(target: "vm86", "emulating INT {:02x}", vector);
            // Set up the user stack the way an 8086 would: FLAGS, CS, IP
            // of the next instruction. The BIOS handler's IRET pops them.
            let next = FarPtr::from_linear(csip.as_u32() + 2);
            let flags = cpu.eflags as u16;
            push(cpu, flags);
            push(cpu, next.segment);
            push(cpu, next.offset);
            // Continue at the handler the IVT names.
            let entry = VirtualAddress::new(IVT_ADDRESS + vector as u32 * 4);
            // SAFETY: the IVT lies in the identity-mapped first MiB.
            unsafe {
                cpu.eip = mmu::read_u16(entry) as u32;
                cpu.cs = mmu::read_u16(entry.offset(2)) as u32;
            }
        }
        op if op == OPCODE_IRET as u16 => {
            debug!(target: "vm86", "emulating IRET");
            // A BIOS call finished; reverse the INT pushes.
            cpu.eip = pop(cpu) as u32;
            cpu.cs = pop(cpu) as u32;
            pop(cpu); // FLAGS
        }
        // Port-mapped I/O in all its widths. A TSS I/O bitmap could
        // restrict this; for now any port is allowed.
        0xE4 => {
            let value = port::inb(byte(imm) as u16);
            set_al(cpu, value);
            increment_ip(cpu, 2);
        }
        0xE5 => {
            let value = port::inw(byte(imm) as u16);
            set_ax(cpu, value);
            increment_ip(cpu, 2);
        }
        0x66E5 => {
            cpu.r.eax = port::inl(byte(imm) as u16);
            increment_ip(cpu, 3);
        }
        0xE6 => {
            port::outb(byte(imm) as u16, cpu.r.eax as u8);
            increment_ip(cpu, 2);
        }
        0xE7 => {
            port::outw(byte(imm) as u16, cpu.r.eax as u16);
            increment_ip(cpu, 2);
        }
        0x66E7 => {
            port::outl(byte(imm) as u16, cpu.r.eax);
            increment_ip(cpu, 3);
        }
        0xEC => {
            let value = port::inb(cpu.r.edx as u16);
            set_al(cpu, value);
            increment_ip(cpu, 1);
        }
        0xED => {
            let value = port::inw(cpu.r.edx as u16);
            set_ax(cpu, value);
            increment_ip(cpu, 1);
        }
        0x66ED => {
            cpu.r.eax = port::inl(cpu.r.edx as u16);
            increment_ip(cpu, 2);
        }
        0xEE => {
            port::outb(cpu.r.edx as u16, cpu.r.eax as u8);
            increment_ip(cpu, 1);
        }
        0xEF => {
            port::outw(cpu.r.edx as u16, cpu.r.eax as u16);
            increment_ip(cpu, 1);
        }
        0x66EF => {
            port::outl(cpu.r.edx as u16, cpu.r.eax);
            increment_ip(cpu, 2);
        }
        op if op == OPCODE_CLI as u16 || op == OPCODE_STI as u16 => {
            // Pretend interrupt-flag virtualization; good enough for
            // BIOS code.
            increment_ip(cpu, 1);
        }
        _ => panic!(
            "VM86 opcode {:02x} unhandled (CS:IP={:04x}:{:04x})",
            opcode, cpu.cs, cpu.eip
        ),
    }
    true
}

/// The #GP handler. VM86 emulation if the current task runs in VM86
/// mode, the regular exception panic otherwise.
fn handle_gpf(frame: VirtualAddress) -> VirtualAddress {
    let mut frame = frame;
    if !monitor(&mut frame) {
        // SAFETY: the dispatcher's frame address.
        let cpu = unsafe { cpu_state(frame) };
        panic!("EX{:02x} (EIP={:08x})", cpu.intr, cpu.eip);
    }
    frame
}

/// Registers the monitor on the general-protection-fault vector.
pub fn init() {
    interrupts::register_handler(interrupts::EXCEPTION_GPF, handle_gpf);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn far_pointer_round_trip() {
        let far = FarPtr::from_linear(0x500);
        assert_eq!(far.offset, 0x500);
        assert_eq!(far.segment, 0);
        assert_eq!(far.linear().as_u32(), 0x500);

        let far = FarPtr::from_linear(0x1_2345);
        assert_eq!(far.offset, 0x2345);
        assert_eq!(far.segment, 0x1000);
        assert_eq!(far.linear().as_u32(), 0x1_2345);
    }

    #[test]
    fn far_pointer_rejects_addresses_beyond_low_memory() {
        let far = FarPtr::from_linear(0x10_0000);
        assert_eq!(far, FarPtr { offset: 0, segment: 0 });
    }

    #[test]
    fn partial_register_writes_preserve_high_bits() {
        let mut cpu = unsafe { core::mem::zeroed::<CpuState>() };
        cpu.r.eax = 0xAABB_CCDD;
        set_al(&mut cpu, 0x11);
        assert_eq!(cpu.r.eax, 0xAABB_CC11);
        set_ax(&mut cpu, 0x2233);
        assert_eq!(cpu.r.eax, 0xAABB_2233);
    }
}
