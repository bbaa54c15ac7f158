//! Compile-time configuration of the privilege core.

use crate::idt::Ist;

/// Number of per-core TSS slots reserved in the GDT.
pub const MAX_CPUS: usize = 8;

/// Vector of the `int 0x80` system-call gate, the only software gate user
/// mode may invoke by default.
pub const SYSCALL_VECTOR: u8 = 0x80;

/// 4 KiB pages.
pub const PAGE_SIZE: u64 = 4096;

/// The CPU aligns the stack to this boundary before pushing a frame.
pub const STACK_ALIGN: u64 = 16;

/// Size of each core's ring-0 entry stack (`rsp0`).
pub const KERNEL_STACK_SIZE: u64 = 16 * PAGE_SIZE;

/// Size of each dedicated IST stack.
pub const IST_STACK_SIZE: u64 = 4 * PAGE_SIZE;

/// IST slot the double-fault gate switches to.
pub const DOUBLE_FAULT_IST: Ist = Ist::Ist1;

const _: () = {
    assert!(MAX_CPUS > 0);
    assert!(KERNEL_STACK_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(IST_STACK_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(PAGE_SIZE.is_multiple_of(STACK_ALIGN));
};
