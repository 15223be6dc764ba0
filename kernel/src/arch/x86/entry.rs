//! Common interrupt entry stubs
//!
//! One tiny stub per vector pushes a zero placeholder where the CPU did
//! not push an error code, then the vector number, and joins the common
//! path. That path saves the rest of the CpuState in the exact layout
//! `interrupts::CpuState` declares, calls `handle_interrupt` with ESP,
//! and restores whatever stack pointer comes back — restoring a
//! different task's frame is the context switch.
//!
//! Vectors 8, 10-14 and 17 push a hardware error code; everything else
//! gets the placeholder.

use core::arch::global_asm;

global_asm!(
    r#"
.macro isr_stub vector, has_error
    .global isr_stub_\vector
isr_stub_\vector:
    .if \has_error == 0
    push 0
    .endif
    push \vector
    jmp isr_common
.endm

isr_common:
    pusha
    push ds
    push es
    push fs
    push gs
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
    push esp
    call handle_interrupt
    mov esp, eax
    pop gs
    pop fs
    pop es
    pop ds
    popa
    add esp, 8
    iretd

    isr_stub 0, 0
    isr_stub 1, 0
    isr_stub 2, 0
    isr_stub 3, 0
    isr_stub 4, 0
    isr_stub 5, 0
    isr_stub 6, 0
    isr_stub 7, 0
    isr_stub 8, 1
    isr_stub 9, 0
    isr_stub 10, 1
    isr_stub 11, 1
    isr_stub 12, 1
    isr_stub 13, 1
    isr_stub 14, 1
    isr_stub 15, 0
    isr_stub 16, 0
    isr_stub 17, 1
    isr_stub 18, 0
    isr_stub 19, 0
    isr_stub 20, 0
    isr_stub 21, 0
    isr_stub 22, 0
    isr_stub 23, 0
    isr_stub 24, 0
    isr_stub 25, 0
    isr_stub 26, 0
    isr_stub 27, 0
    isr_stub 28, 0
    isr_stub 29, 0
    isr_stub 30, 0
    isr_stub 31, 0
    isr_stub 32, 0
    isr_stub 33, 0
    isr_stub 34, 0
    isr_stub 35, 0
    isr_stub 36, 0
    isr_stub 37, 0
    isr_stub 38, 0
    isr_stub 39, 0
    isr_stub 40, 0
    isr_stub 41, 0
    isr_stub 42, 0
    isr_stub 43, 0
    isr_stub 44, 0
    isr_stub 45, 0
    isr_stub 46, 0
    isr_stub 47, 0
    isr_stub 48, 0

.section .rodata
.global isr_stub_table
isr_stub_table:
    .long isr_stub_0
    .long isr_stub_1
    .long isr_stub_2
    .long isr_stub_3
    .long isr_stub_4
    .long isr_stub_5
    .long isr_stub_6
    .long isr_stub_7
    .long isr_stub_8
    .long isr_stub_9
    .long isr_stub_10
    .long isr_stub_11
    .long isr_stub_12
    .long isr_stub_13
    .long isr_stub_14
    .long isr_stub_15
    .long isr_stub_16
    .long isr_stub_17
    .long isr_stub_18
    .long isr_stub_19
    .long isr_stub_20
    .long isr_stub_21
    .long isr_stub_22
    .long isr_stub_23
    .long isr_stub_24
    .long isr_stub_25
    .long isr_stub_26
    .long isr_stub_27
    .long isr_stub_28
    .long isr_stub_29
    .long isr_stub_30
    .long isr_stub_31
    .long isr_stub_32
    .long isr_stub_33
    .long isr_stub_34
    .long isr_stub_35
    .long isr_stub_36
    .long isr_stub_37
    .long isr_stub_38
    .long isr_stub_39
    .long isr_stub_40
    .long isr_stub_41
    .long isr_stub_42
    .long isr_stub_43
    .long isr_stub_44
    .long isr_stub_45
    .long isr_stub_46
    .long isr_stub_47
    .long isr_stub_48
.text
"#
);
