//! obsidian kernel entry
//!
//! `_start` (arch/x86/boot.rs) hands over the Multiboot registers; the
//! staged init below brings up segmentation, interrupts, memory and the
//! syscall surface, spawns the demo workload, and sacrifices the boot
//! context to the scheduler.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod kernel {
    use core::panic::PanicInfo;
    use core::sync::atomic::{AtomicU32, Ordering};

    use log::LevelFilter;
    use obsidian_kernel::{
        arch::{
            self,
            x86::{gdt, idt, pic, pit},
        },
        boot::multiboot,
        drivers::vga,
        elf, interrupts, logger,
        mm::{pmm, vmm, VirtualAddress},
        print, println, sched, task, vm86,
    };

    /// Shared counter the two demo kernel tasks increment in turns.
    static DEMO_COUNTER: AtomicU32 = AtomicU32::new(0);

    /// The idle task: reap stopped tasks, then sleep until the next
    /// interrupt. It exists from the start so any other task may exit.
    extern "C" fn idle_task() -> ! {
        loop {
            sched::finalize_tasks();
            // SAFETY: ring 0; hlt resumes on the next interrupt.
            unsafe { core::arch::asm!("hlt") };
        }
    }

    fn demo_loop(tag: u8) -> ! {
        loop {
            let count = interrupts::without_interrupts(|| {
                DEMO_COUNTER.fetch_add(1, Ordering::Relaxed) + 1
            });
            if count % 1_000_000 == 0 {
                print!("{}", tag as char);
            }
        }
    }

    extern "C" fn demo_task_a() -> ! {
        demo_loop(b'a')
    }

    extern "C" fn demo_task_b() -> ! {
        demo_loop(b'b')
    }

    fn entry_of(task: extern "C" fn() -> !) -> VirtualAddress {
        VirtualAddress::new(task as usize as u32)
    }

    #[no_mangle]
    pub extern "C" fn kernel_main(info: u32, magic: u32) -> ! {
        vga::clear();
        println!("Welcome to obsidian!");
        logger::init(LevelFilter::Info);

        multiboot::init(info, magic);
        gdt::init();
        idt::init();
        pic::init();
        pit::init(20);
        pmm::init();
        vmm::init();
        interrupts::init();
        vm86::init();
        sched::set_time_slice(1);

        // The idle task must exist before anything that may exit.
        task::create_kernel(entry_of(idle_task), None, 0x1000);
        task::create_kernel(entry_of(demo_task_a), None, 0x1000);
        task::create_kernel(entry_of(demo_task_b), None, 0x1000);

        // Every boot module is a user executable.
        for index in 0..multiboot::module_count() {
            if let Some(image) = multiboot::module_image(index) {
                elf::create_task(image, 0x1000, 0x1000);
            }
        }

        // Ask the BIOS for the current video mode, exercising VM86.
        let mut registers = interrupts::Registers::default();
        registers.eax = 0x0F00;
        vm86::call_bios(0x10, &registers);

        task::debug_dump();
        println!("boot complete, handing over to the scheduler");

        // The boot context is not a task; the first timer tick switches
        // away for good.
        loop {
            // SAFETY: ring 0; hlt resumes on the next interrupt.
            unsafe { core::arch::asm!("hlt") };
        }
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        vga::set_attr(vga::ATTR_ERROR);
        println!("KERNEL PANIC: {}", info);
        arch::halt();
    }
}

/// Hosted builds only exist so `cargo test` can link the binary target;
/// the kernel proper boots via Multiboot on bare metal.
#[cfg(not(target_os = "none"))]
fn main() {
    println!("obsidian is a Multiboot kernel; build it for an i686 bare-metal target.");
}
