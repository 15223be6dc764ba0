//! Multiboot entry point
//!
//! GRUB finds the Multiboot v1 header in the first section of the image,
//! loads us at 4 MiB per `link.ld`, and jumps to `_start` with the info
//! pointer in EBX and the magic in EAX. The stub only sets up the boot
//! stack and hands both registers to `kernel_main`.

use core::arch::global_asm;

global_asm!(
    r#"
.section .multiboot, "a"
.align 4
    .long 0x1BADB002
    .long 0x00000003
    .long -(0x1BADB002 + 0x00000003)

.section .bss
.align 16
main_kernel_stack:
    .skip 0x4000
.global main_kernel_stack_end
main_kernel_stack_end:

.section .text
.global _start
_start:
    mov esp, offset main_kernel_stack_end
    push eax
    push ebx
    call kernel_main
1:
    hlt
    jmp 1b
"#
);
