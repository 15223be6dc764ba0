//! Kernel-wide scenarios on the hosted software MMU
//!
//! These run the real memory, task, scheduler, syscall, ELF and VM86
//! code paths end to end: the soft MMU performs the same two-level page
//! walk the hardware would, so the recursive self-map, directory
//! switches and frame-level side effects behave as on metal.

use crate::{
    arch::x86::{gdt, mmu, tss},
    elf::{self, ElfImage},
    interrupts::{self, cpu_state, syscall, CpuState, EFlags, Registers},
    mm::{
        page_table::{pagetab_window, PageFlags, PAGEDIR_WINDOW},
        pmm::{FrameTag, PMM},
        vmm, PhysicalAddress, VirtualAddress, FRAME_SIZE,
    },
    sched,
    task::{self, TaskState},
    test_support::{boot_kernel, kernel_lock, minimal_executable},
    vm86::{self, FarPtr},
};

fn read_u32(vaddr: VirtualAddress) -> u32 {
    let mut bytes = [0u8; 4];
    // SAFETY: scenario addresses are mapped by construction.
    unsafe { mmu::copy_out(vaddr, &mut bytes) };
    u32::from_le_bytes(bytes)
}

#[test]
fn self_map_makes_directories_reach_themselves() {
    let _guard = kernel_lock();
    boot_kernel();

    let dir = vmm::create_directory().expect("directory creation after boot should succeed");

    // Activate the fresh directory and walk it through its own window.
    vmm::modify_directory(dir);
    assert_eq!(
        vmm::translate(PAGEDIR_WINDOW),
        Some(PhysicalAddress::new(dir.as_u32())),
        "the pagedir window must resolve to the directory frame itself"
    );
    // Entry 1023 read through the window: present, non-writable,
    // kernel-only, pointing back at the directory.
    let raw = read_u32(PAGEDIR_WINDOW.offset(1023 * 4));
    let flags = PageFlags::from_bits_truncate(raw);
    assert!(flags.contains(PageFlags::PRESENT));
    assert!(!flags.contains(PageFlags::WRITABLE));
    assert!(!flags.contains(PageFlags::USER));
    assert_eq!(raw >> 12, dir.frame().as_u32());
    vmm::modified_directory();

    // Destruction returns the directory frame to the allocator.
    vmm::destroy_directory(dir);
    assert_eq!(PMM.lock().check(dir), FrameTag::Unused);
}

#[test]
fn map_translate_unmap_reclaims_empty_tables() {
    let _guard = kernel_lock();
    boot_kernel();

    // 0x00800000 sits in the kernel domain, in a page table the boot
    // identity mapping never touched.
    let vaddr = VirtualAddress::new(0x0080_0000);
    let paddr = PMM
        .lock()
        .alloc(FRAME_SIZE, FrameTag::Kernel)
        .expect("frame allocation should succeed");

    vmm::map(vaddr, paddr, vmm::VmFlags::WRITABLE).expect("mapping a free page should succeed");
    assert_eq!(vmm::translate(vaddr), Some(paddr));
    assert_eq!(
        vmm::translate(vaddr.offset(0x123)),
        Some(paddr.offset(0x123)),
        "translation must preserve the page offset"
    );

    // The mapping is real storage.
    // SAFETY: just mapped writable.
    unsafe {
        mmu::copy_in(vaddr, b"paging");
        let mut buf = [0u8; 6];
        mmu::copy_out(vaddr, &mut buf);
        assert_eq!(&buf, b"paging");
    }

    // Mapping over an existing mapping is refused.
    assert_eq!(
        vmm::map(vaddr, paddr, vmm::VmFlags::WRITABLE),
        Err(vmm::VmmError::AlreadyMapped { vaddr })
    );

    // The covering table was created lazily; remember its frame.
    let table = vmm::translate(pagetab_window(vaddr.directory_index()))
        .expect("the new page table must be visible through its window");

    vmm::unmap(vaddr);
    assert_eq!(vmm::translate(vaddr), None);
    // The table became empty, so its frame went back to the PMM.
    assert_eq!(PMM.lock().check(table), FrameTag::Unused);
    assert_eq!(vmm::translate(pagetab_window(vaddr.directory_index())), None);
}

#[test]
fn domain_policy_rejects_mismatched_mappings() {
    let _guard = kernel_lock();
    boot_kernel();

    let paddr = PMM
        .lock()
        .alloc(FRAME_SIZE, FrameTag::Kernel)
        .expect("frame allocation should succeed");
    let user_vaddr = VirtualAddress::new(0x4000_0000);
    let kernel_vaddr = VirtualAddress::new(0x0090_0000);

    // Kernel permissions outside the kernel domain.
    assert_eq!(
        vmm::map(user_vaddr, paddr, vmm::VmFlags::WRITABLE),
        Err(vmm::VmmError::DomainMismatch { vaddr: user_vaddr })
    );
    // User permissions outside the user domain.
    assert_eq!(
        vmm::map(kernel_vaddr, paddr, vmm::VmFlags::USER | vmm::VmFlags::WRITABLE),
        Err(vmm::VmmError::DomainMismatch {
            vaddr: kernel_vaddr
        })
    );
    // Matching domain and permissions go through.
    vmm::map(user_vaddr, paddr, vmm::VmFlags::USER | vmm::VmFlags::WRITABLE)
        .expect("user mapping in the user domain should succeed");
    assert_eq!(vmm::translate(user_vaddr), Some(paddr));
    vmm::unmap(user_vaddr);
}

#[test]
fn alloc_finds_a_free_run_and_free_returns_the_frames() {
    let _guard = kernel_lock();
    boot_kernel();

    let vaddr = vmm::alloc(2 * FRAME_SIZE, vmm::VmFlags::WRITABLE)
        .expect("allocation in the kernel domain should succeed");
    assert!(vmm::KERNEL_DOMAIN.contains(vaddr));
    let paddr = vmm::translate(vaddr).expect("allocated range must be mapped");

    // Writes across the page boundary land in the backing frames.
    // SAFETY: both pages were just mapped writable.
    unsafe {
        mmu::copy_in(vaddr.offset(FRAME_SIZE as u32 - 2), &[0xAB, 0xCD, 0xEF, 0x01]);
        let mut buf = [0u8; 4];
        mmu::copy_out(vaddr.offset(FRAME_SIZE as u32 - 2), &mut buf);
        assert_eq!(buf, [0xAB, 0xCD, 0xEF, 0x01]);
    }

    vmm::free(vaddr, 2 * FRAME_SIZE);
    assert_eq!(vmm::translate(vaddr), None);
    assert_eq!(PMM.lock().check(paddr), FrameTag::Unused);
    assert_eq!(
        PMM.lock().check(paddr.offset(FRAME_SIZE as u32)),
        FrameTag::Unused
    );
}

#[test]
fn scheduler_round_robins_kernel_tasks() {
    let _guard = kernel_lock();
    boot_kernel();

    let entry = VirtualAddress::new(0x0040_1000);
    let k1 = task::create_kernel(entry, None, FRAME_SIZE).expect("task 1 should be created");
    let k2 = task::create_kernel(entry, None, FRAME_SIZE).expect("task 2 should be created");

    // Bootstrap: the first tick performs the initial switch.
    let f1 = sched::schedule(VirtualAddress::new(0));
    assert_eq!(f1, task::cpu(k1));
    assert_eq!(sched::current_task(), k1);

    // The initial frame: ring-0 selectors, entry point, IF + reserved.
    // SAFETY: f1 addresses the carved frame of k1.
    let cpu = unsafe { cpu_state(f1) };
    assert_eq!(cpu.cs, gdt::selector(gdt::RING0_CODE_SEG) as u32);
    assert_eq!(cpu.ds, gdt::selector(gdt::RING0_DATA_SEG) as u32);
    assert_eq!(cpu.eip, entry.as_u32());
    let eflags = EFlags::from_bits_truncate(cpu.eflags);
    assert!(eflags.contains(EFlags::INTERRUPT));
    assert!(eflags.contains(EFlags::RESERVED));
    assert!(!eflags.contains(EFlags::VM));

    // The TSS points one past the saved frame.
    assert_eq!(
        tss::kernel_stack().as_u32(),
        f1.as_u32() + core::mem::size_of::<CpuState>() as u32
    );

    // Quantum 1: every tick rotates through the Running set.
    let f2 = sched::schedule(f1);
    assert_eq!(f2, task::cpu(k2));
    assert_eq!(sched::current_task(), k2);
    let f3 = sched::schedule(f2);
    assert_eq!(f3, task::cpu(k1));
    let f4 = sched::schedule(f3);
    assert_eq!(f4, task::cpu(k2));

    // A longer quantum keeps the current task on the CPU until it is
    // used up.
    sched::set_time_slice(2);
    let f5 = sched::schedule(f4); // refills happened at switch; burn 1
    assert_eq!(f5, task::cpu(k1));
    let f6 = sched::schedule(f5);
    assert_eq!(f6, f5, "slice not exhausted, no switch expected");
    let f7 = sched::schedule(f6);
    assert_eq!(f7, task::cpu(k2));
}

#[test]
fn exit_switches_away_and_finalize_reuses_the_pid() {
    let _guard = kernel_lock();
    boot_kernel();

    let entry = VirtualAddress::new(0x0040_1000);
    let a = task::create_kernel(entry, None, FRAME_SIZE).expect("task a");
    let b = task::create_kernel(entry, None, FRAME_SIZE).expect("task b");
    let c = task::create_kernel(entry, None, FRAME_SIZE).expect("task c");

    let fa = sched::schedule(VirtualAddress::new(0));
    assert_eq!(sched::current_task(), a);

    // A issues exit(0): EAX carries the syscall id.
    // SAFETY: fa is a's carved frame.
    unsafe { cpu_state(fa) }.r.eax = syscall::SYS_EXIT as u32;
    let fb = syscall::handle_syscall(fa);
    assert_eq!(fb, task::cpu(b), "exit must switch to the next Running task");
    assert_eq!(sched::current_task(), b);
    assert_eq!(task::next_task_with_state(0, TaskState::Stopped), a);

    // The finalizer reaps a; its directory frame returns to the pool.
    let dir_a = task::page_directory(a);
    sched::finalize_tasks();
    assert_eq!(task::next_task_with_state(0, TaskState::Stopped), 0);
    assert_eq!(PMM.lock().check(dir_a), FrameTag::Unused);

    // b and c keep scheduling; a is never selected again.
    let fc = sched::schedule(fb);
    assert_eq!(fc, task::cpu(c));
    let fb2 = sched::schedule(fc);
    assert_eq!(fb2, task::cpu(b));

    // The freed PID slot is handed out again.
    let d = task::create_kernel(entry, None, FRAME_SIZE).expect("task d");
    assert_eq!(d, a);
}

#[test]
fn the_last_running_task_cannot_exit() {
    let _guard = kernel_lock();
    boot_kernel();

    let only =
        task::create_kernel(VirtualAddress::new(0x0040_1000), None, FRAME_SIZE).expect("task");
    let frame = sched::schedule(VirtualAddress::new(0));
    assert_eq!(sched::current_task(), only);

    // SAFETY: frame is the task's carved frame.
    unsafe { cpu_state(frame) }.r.eax = syscall::SYS_EXIT as u32;
    let after = syscall::handle_syscall(frame);
    assert_eq!(after, frame, "a refused exit must not switch");
    // The refusal is reported through EAX, and the task keeps running.
    // SAFETY: as above.
    assert_eq!(unsafe { cpu_state(frame) }.r.eax, u32::MAX);
    assert_eq!(task::next_task_with_state(0, TaskState::Running), only);
}

#[test]
fn elf_loader_builds_a_user_task() {
    let _guard = kernel_lock();
    boot_kernel();

    // mov eax, 42; int 0x30 — the classic exit(42), were it executed.
    let code = [0xB8, 0x2A, 0x00, 0x00, 0x00, 0xCD, 0x30];
    let bytes = minimal_executable(0x4000_0000, &code);
    let image = ElfImage::new(bytes.as_ptr() as usize);

    let pid = elf::create_task(image, FRAME_SIZE, FRAME_SIZE).expect("ELF task creation");

    // Ring-3 frame pointed at the image's entry.
    let frame = task::cpu(pid);
    // SAFETY: frame addresses the carved frame on the task's kernel stack.
    let cpu = unsafe { cpu_state(frame) };
    assert_eq!(cpu.eip, 0x4000_0000);
    assert_eq!(cpu.cs, gdt::selector(gdt::RING3_CODE_SEG) as u32);
    assert_eq!(cpu.user_ss, gdt::selector(gdt::RING3_DATA_SEG) as u32);
    assert_ne!(cpu.user_esp, 0);

    // The segment got mapped into the task's user domain with its bytes.
    let dir = task::page_directory(pid);
    vmm::modify_directory(dir);
    let segment = vmm::translate(VirtualAddress::new(0x4000_0000))
        .expect("the PT_LOAD segment must be mapped");
    assert_eq!(PMM.lock().check(segment), FrameTag::User);
    let mut loaded = [0u8; 7];
    // SAFETY: the segment was mapped by the loader.
    unsafe { mmu::copy_out(VirtualAddress::new(0x4000_0000), &mut loaded) };
    assert_eq!(loaded, code);
    vmm::modified_directory();

    // Destruction unmaps the segments and frees everything.
    task::stop(pid);
    sched::finalize_tasks();
    assert_eq!(task::next_task(0), 0, "the task table should be empty again");
    assert_eq!(PMM.lock().check(segment), FrameTag::Unused);
    assert_eq!(PMM.lock().check(dir), FrameTag::Unused);
}

#[test]
fn rejecting_an_invalid_image_creates_no_task() {
    let _guard = kernel_lock();
    boot_kernel();

    let mut bytes = minimal_executable(0x4000_0000, &[0x90]);
    bytes[0] = 0; // break the magic
    let image = ElfImage::new(bytes.as_ptr() as usize);
    assert!(elf::create_task(image, FRAME_SIZE, FRAME_SIZE).is_none());
    assert_eq!(task::next_task(0), 0);
}

#[test]
fn vm86_monitor_emulates_int_iret_and_exits_on_int3() {
    let _guard = kernel_lock();
    boot_kernel();

    // A synthetic real-mode world: IVT entry 0x10 points at 0000:0400,
    // where a single IRET waits.
    // SAFETY: the boot identity mapping covers low memory.
    unsafe {
        mmu::write_u16(VirtualAddress::new(0x10 * 4), 0x0400);
        mmu::write_u16(VirtualAddress::new(0x10 * 4 + 2), 0x0000);
        mmu::copy_in(VirtualAddress::new(0x400), &[0xCF]);
    }

    // The idle task exists so the VM86 task has somewhere to exit to.
    let idle =
        task::create_kernel(VirtualAddress::new(0x0040_1000), None, FRAME_SIZE).expect("idle");

    // INT 0x10; INT3.
    let code = [0xCD, 0x10, 0xCC];
    let pid = vm86::create_task(&code, None, FRAME_SIZE, 1024, &Registers::default())
        .expect("VM86 task creation");
    assert!(task::is_vm86(pid));

    let frame = sched::switch_task(pid);
    assert_eq!(sched::current_task(), pid);
    // SAFETY: frame addresses the VM86 task's carved frame.
    let cpu = unsafe { cpu_state(frame) };
    assert!(EFlags::from_bits_truncate(cpu.eflags).contains(EFlags::VM));
    assert_eq!((cpu.cs, cpu.eip), (0x0000, 0x0500), "CS:IP at the code copy");
    let initial_sp = cpu.user_esp;
    let initial_flags = cpu.eflags as u16;

    // First sensitive instruction: INT 0x10 traps with a #GP.
    cpu.intr = 0x0D;
    let after_int = interrupts::handle_interrupt(frame);
    assert_eq!(after_int, frame, "emulation must not switch tasks");
    // SAFETY: as above; the previous borrow ended.
    let cpu = unsafe { cpu_state(frame) };
    assert_eq!(
        (cpu.cs, cpu.eip),
        (0x0000, 0x0400),
        "CS:IP must follow the IVT to the handler"
    );
    // Real-mode convention: FLAGS, CS, then the return IP were pushed.
    assert_eq!(cpu.user_esp, initial_sp - 6);
    let stack = FarPtr {
        offset: cpu.user_esp as u16,
        segment: cpu.user_ss as u16,
    }
    .linear();
    // SAFETY: the VM86 stack lies in mapped low memory.
    unsafe {
        assert_eq!(mmu::read_u16(stack), 0x0502, "return IP after the INT");
        assert_eq!(mmu::read_u16(stack.offset(2)), 0x0000, "return CS");
        assert_eq!(mmu::read_u16(stack.offset(4)), initial_flags, "FLAGS image");
    }

    // The handler's IRET returns to the instruction after the INT.
    let after_iret = interrupts::handle_interrupt(frame);
    assert_eq!(after_iret, frame);
    // SAFETY: as above.
    let cpu = unsafe { cpu_state(frame) };
    assert_eq!((cpu.cs, cpu.eip), (0x0000, 0x0502));
    assert_eq!(cpu.user_esp, initial_sp, "IRET must pop all three words");

    // INT3 ends the task: the monitor reports and exits into idle.
    let after_int3 = interrupts::handle_interrupt(frame);
    assert_eq!(after_int3, task::cpu(idle));
    assert_eq!(sched::current_task(), idle);
    assert_eq!(task::next_task_with_state(0, TaskState::Stopped), pid);

    // The finalizer reaps it, low-memory table included.
    let dir = task::page_directory(pid);
    sched::finalize_tasks();
    assert_eq!(task::next_task_with_state(0, TaskState::Stopped), 0);
    assert_eq!(PMM.lock().check(dir), FrameTag::Unused);
}

#[test]
fn kernel_mappings_propagate_across_directories() {
    let _guard = kernel_lock();
    boot_kernel();

    // Creating a task allocates its kernel stack inside its own
    // directory; after the modify window closes, the switch-time refresh
    // must have propagated the kernel-domain mapping back.
    let k1 = task::create_kernel(VirtualAddress::new(0x0040_1000), None, FRAME_SIZE)
        .expect("task 1");
    let stack_frame = task::cpu(k1);
    assert!(
        vmm::translate(stack_frame).is_some(),
        "k1's kernel stack must be visible in the boot directory"
    );

    // And it stays visible after switching into a second task's space.
    let k2 = task::create_kernel(VirtualAddress::new(0x0040_1000), None, FRAME_SIZE)
        .expect("task 2");
    sched::switch_task(k2);
    assert!(
        vmm::translate(stack_frame).is_some(),
        "kernel domain must be shared into k2's directory"
    );
}
