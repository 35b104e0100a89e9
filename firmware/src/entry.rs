//! Firmware entry: real mode to long mode in three jumps.
//!
//! The guest starts executing at guest physical 0x1000, which is the jump
//! header of the [`GuestParams`] blob; the jump lands here. The stub loads
//! a flat GDT, enters protected mode, builds an identity mapping of the
//! low 4 GiB with 2 MiB pages, enables long mode, and calls [`fw_main`]
//! with the blob's address.
//!
//! The EFER write and the CR0.PG flip both trap to the VMM, which is how
//! the VMM's long-mode bookkeeping (IA-32e entry control, EFER.LMA, the
//! TR type fixup) gets exercised before any kernel runs.
//!
//! [`GuestParams`]: crate::params::GuestParams
//! [`fw_main`]: crate::fw_main

use crate::params::GuestParams;

/// The parameters slot at the head of the firmware image. The VMM checks
/// the jump header already present here before overwriting the slot with
/// the real parameters.
#[cfg(target_os = "none")]
#[link_section = ".guest_params"]
#[no_mangle]
#[used]
pub static GUEST_PARAMS_SLOT: GuestParams = GuestParams::image_placeholder();

/// Rust landing point of the entry stub.
///
/// # Safety
/// Called exactly once by the stub, in long mode, with `params` pointing
/// at the installed blob.
#[no_mangle]
unsafe extern "C" fn fw_entry64(params: *const GuestParams) -> ! {
    crate::fw_main(&*params)
}

// The stub proper. Absolute references tie this to the firmware link
// address, so it only exists in the bare-metal build.
#[cfg(target_os = "none")]
core::arch::global_asm!(
    r#"
.section .text.fw_entry, "ax"
.global fw_entry
.code16
fw_entry:
    cli
    xorw %ax, %ax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %ss
    lgdtl FW_GDT_DESC
    movl %cr0, %eax
    orl $1, %eax
    movl %eax, %cr0
    ljmpl $0x08, $1f

.code32
1:
    movw $0x10, %ax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %ss
    movl $0xa0000, %esp

    # Identity-map 4 GiB: 2048 page-directory entries of 2 MiB each.
    movl $FW_PD, %edi
    xorl %ecx, %ecx
2:
    movl %ecx, %eax
    shll $21, %eax
    orl $0x83, %eax
    movl %eax, (%edi,%ecx,8)
    movl $0, 4(%edi,%ecx,8)
    incl %ecx
    cmpl $2048, %ecx
    jne 2b

    movl $FW_PDPT, %edi
    movl $FW_PD, %eax
    orl $3, %eax
    movl $0, %ecx
3:
    movl %eax, (%edi,%ecx,8)
    movl $0, 4(%edi,%ecx,8)
    addl $0x1000, %eax
    incl %ecx
    cmpl $4, %ecx
    jne 3b

    movl $FW_PML4, %edi
    movl $FW_PDPT, %eax
    orl $3, %eax
    movl %eax, (%edi)
    movl $0, 4(%edi)

    # PAE, then the root, then long mode, then paging.
    movl %cr4, %eax
    orl $0x20, %eax
    movl %eax, %cr4
    movl $FW_PML4, %eax
    movl %eax, %cr3
    movl $0xc0000080, %ecx
    xorl %edx, %edx
    movl $0x100, %eax
    wrmsr
    movl %cr0, %eax
    orl $0x80000001, %eax
    movl %eax, %cr0
    ljmpl $0x18, $4f

.code64
4:
    movw $0x10, %ax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %ss
    movl $0xa0000, %esp
    movl $0x1000, %edi
    call fw_entry64
5:
    hlt
    jmp 5b

.balign 8
FW_GDT:
    .quad 0
    .quad 0x00cf9b000000ffff   # 0x08: 32-bit flat code
    .quad 0x00cf93000000ffff   # 0x10: flat data
    .quad 0x00af9b000000ffff   # 0x18: 64-bit code
FW_GDT_DESC:
    .word FW_GDT_DESC - FW_GDT - 1
    .long FW_GDT

.balign 4096
FW_PML4:
    .skip 4096
FW_PDPT:
    .skip 4096
FW_PD:
    .skip 16384
"#,
    options(att_syntax)
);
