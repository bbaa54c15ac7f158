//! # The instructions behind the model
//!
//! Everything here executes privileged instructions and is only compiled for
//! `x86_64`. Nothing in this module decides policy; the callers in
//! [`crate::tables`] and [`crate::transition`] validate first.
//!
//! ## Preconditions
//! - Long mode and paging are enabled.
//! - Tables passed in stay mapped and readable for the lifetime of the core.

use crate::address::VirtualAddress;
use crate::frame::{InterruptFrame, SyscallFrame};
use crate::gdt::Gdt;
use crate::gdt::selectors::{CodeSel, DataSel, SegmentSelector, TssSel};
use crate::idt::Idt;
use crate::tables;
use crate::transition::UserEntry;
use core::arch::{asm, naked_asm};
use kernel_registers::{LoadRegister, Rflags};
use log::trace;

/// Value left in `rax` when no system-call dispatcher is registered.
pub const NO_DISPATCHER: u64 = u64::MAX;

/// Pointer format required by `lgdt` / `lidt`.
#[repr(C, packed)]
struct DescTablePtr {
    /// Size of the table **minus one** in bytes.
    limit: u16,
    /// Base **linear (virtual) address** of the table.
    base: u64,
}

/// Load a GDT with `lgdt`.
///
/// # Safety
/// - Must run at CPL 0.
/// - `gdt` must remain **mapped and readable** for the lifetime of the CPU.
#[inline]
pub unsafe fn load_gdt<const CPUS: usize>(gdt: &'static Gdt<CPUS>) {
    let ptr = DescTablePtr {
        limit: gdt.limit(),
        base: VirtualAddress::from_ptr(gdt).as_u64(),
    };
    unsafe {
        asm!(
            "lgdt [{}]",
            in(reg) &raw const ptr,
            options(readonly, nostack, preserves_flags)
        );
    }
}

/// Load an IDT with `lidt`.
///
/// # Safety
/// - Must run at CPL 0.
/// - `idt` must point to a fully built table that remains mapped for the
///   lifetime of the CPU.
#[inline]
pub unsafe fn load_idt(idt: *const Idt) {
    #[allow(clippy::cast_possible_truncation)]
    let ptr = DescTablePtr {
        limit: (size_of::<Idt>() - 1) as u16,
        base: VirtualAddress::from_ptr(idt).as_u64(),
    };
    unsafe {
        asm!(
            "lidt [{}]",
            in(reg) &raw const ptr,
            options(readonly, nostack, preserves_flags)
        );
    }
}

/// Load the Task Register with a TSS selector.
///
/// # Safety
/// - The active GDT must hold a present, available 64-bit TSS descriptor at
///   `sel`; `ltr` marks it busy.
/// - The TSS memory must remain **resident**; the CPU reads from it on every
///   privilege change.
#[inline]
pub unsafe fn load_task_register(sel: SegmentSelector<TssSel>) {
    let sel = sel.encode();
    unsafe {
        asm!(
            "ltr {0:x}",
            in(reg) sel,
            options(nostack, preserves_flags)
        );
    }
}

/// Reload DS/ES/SS with `data` and CS with `code` (far return).
///
/// # Safety
/// Both selectors must reference present ring-0 descriptors of the active GDT.
#[inline]
pub unsafe fn reload_segments(code: SegmentSelector<CodeSel>, data: SegmentSelector<DataSel>) {
    unsafe {
        asm!(
            "mov ds, {0:x}",
            "mov es, {0:x}",
            "mov ss, {0:x}",
            in(reg) data.encode(),
            options(nostack, preserves_flags)
        );

        // Far reload of CS; long mode has no far jmp to an immediate selector.
        asm!(
            "push {cs}",
            "lea {tmp}, [rip + 2f]",
            "push {tmp}",
            "retfq",
            "2:",
            cs = in(reg) u64::from(code.encode()),
            tmp = lateout(reg) _,
        );
    }
}

/// Enter ring 3 through `iretq`.
///
/// Pushes ss, rsp, rflags, cs, rip, clears every general purpose register so
/// no kernel value reaches user mode, and executes `iretq`.
///
/// # Safety
/// - Must run at CPL 0 with the GDT, IDT and this core's TSS loaded.
/// - The TSS must hold a valid `rsp0` ([`UserEntry::check_task_state`]).
/// - Both selectors must name segments of their kind in the loaded GDT
///   ([`UserEntry::check_segments`]).
/// - The current kernel stack is abandoned; nothing on it is dropped.
pub unsafe fn enter_user_mode(entry: &UserEntry) -> ! {
    let frame = entry.frame();
    trace!(
        "entering user mode at {} with rsp {}",
        entry.rip(),
        entry.rsp()
    );

    unsafe {
        asm!(
            "mov ds, {ss:x}",
            "mov es, {ss:x}",
            "push {ss}",
            "push {rsp}",
            "push {rflags}",
            "push {cs}",
            "push {rip}",
            "xor eax, eax",
            "xor ebx, ebx",
            "xor ecx, ecx",
            "xor edx, edx",
            "xor esi, esi",
            "xor edi, edi",
            "xor ebp, ebp",
            "xor r8d, r8d",
            "xor r9d, r9d",
            "xor r10d, r10d",
            "xor r11d, r11d",
            "xor r12d, r12d",
            "xor r13d, r13d",
            "xor r14d, r14d",
            "xor r15d, r15d",
            "iretq",
            ss = in(reg) frame.ss,
            rsp = in(reg) frame.rsp,
            rflags = in(reg) frame.rflags,
            cs = in(reg) frame.cs,
            rip = in(reg) frame.rip,
            options(noreturn)
        )
    }
}

/// Resume whatever context `frame` describes, in whichever ring it encodes.
///
/// # Safety
/// - Must run at CPL 0.
/// - `frame` must be a frame the CPU pushed or one built by
///   [`UserEntry::frame`]; `iretq` faults on anything it rejects.
/// - The current kernel stack is abandoned.
pub unsafe fn return_from_interrupt(frame: &InterruptFrame) -> ! {
    trace!("iretq to {} in {:?}", frame.rip(), frame.ring());
    unsafe {
        asm!(
            "mov rsp, {frame}",
            "xor eax, eax",
            "xor ebx, ebx",
            "xor ecx, ecx",
            "xor edx, edx",
            "xor esi, esi",
            "xor edi, edi",
            "xor ebp, ebp",
            "xor r8d, r8d",
            "xor r9d, r9d",
            "xor r10d, r10d",
            "xor r11d, r11d",
            "xor r12d, r12d",
            "xor r13d, r13d",
            "xor r14d, r14d",
            "xor r15d, r15d",
            "iretq",
            frame = in(reg) core::ptr::from_ref(frame),
            options(noreturn)
        )
    }
}

/// RAII guard that masks maskable interrupts on the current core and
/// restores the previous `IF` on drop.
///
/// Requires CPL 0.
pub struct InterruptsMasked {
    were_enabled: bool,
}

impl Default for InterruptsMasked {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptsMasked {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = Rflags::load().if_interrupt_enable();
        if enabled {
            unsafe { asm!("cli", options(nomem, nostack, preserves_flags)) }
        }
        Self {
            were_enabled: enabled,
        }
    }
}

impl Drop for InterruptsMasked {
    fn drop(&mut self) {
        if self.were_enabled {
            unsafe { asm!("sti", options(nomem, nostack, preserves_flags)) }
        }
    }
}

/// Entry stub of the `int 0x80` gate.
///
/// Saves all general purpose registers on the ring-0 stack, hands them to
/// the registered dispatch hook as a [`SyscallFrame`], restores them and
/// returns with `iretq`.
#[unsafe(naked)]
pub extern "C" fn int80_entry() {
    naked_asm!(
        "push r15",
        "push r14",
        "push r13",
        "push r12",
        "push r11",
        "push r10",
        "push r9",
        "push r8",
        "push rbp",
        "push rdi",
        "push rsi",
        "push rdx",
        "push rcx",
        "push rbx",
        "push rax",
        // 40-byte CPU frame + 120 bytes of registers keeps rsp 16-aligned.
        "mov rdi, rsp",
        "cld",
        "call {dispatch}",
        "pop rax",
        "pop rbx",
        "pop rcx",
        "pop rdx",
        "pop rsi",
        "pop rdi",
        "pop rbp",
        "pop r8",
        "pop r9",
        "pop r10",
        "pop r11",
        "pop r12",
        "pop r13",
        "pop r14",
        "pop r15",
        "iretq",
        dispatch = sym int80_dispatch
    );
}

/// Address to install in the `int 0x80` gate.
#[must_use]
pub fn int80_entry_address() -> VirtualAddress {
    VirtualAddress::from_ptr(int80_entry as *const ())
}

extern "C" fn int80_dispatch(frame: *mut SyscallFrame) {
    // SAFETY: the stub passes its own stack pointer, which points at the
    // registers it just pushed followed by the CPU frame.
    let frame = unsafe { &mut *frame };
    match tables::syscall_dispatch() {
        Some(dispatch) => dispatch(frame),
        None => frame.regs.rax = NO_DISPATCHER,
    }
}
