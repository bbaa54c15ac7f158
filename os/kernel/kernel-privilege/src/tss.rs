//! # 64-bit Task State Segment (TSS)
//!
//! In 64-bit mode the CPU no longer performs hardware task switching, but it
//! **still uses the TSS** to find safe stacks:
//!
//! - `rsp0` is the **Ring-0 stack** loaded on every Ring-3 → Ring-0 transition
//!   through an interrupt or trap gate (`int 0x80`, page faults from user
//!   mode, device interrupts). User code never supplies this stack.
//! - `ist1..ist7` are **Interrupt Stack Table** entries an IDT gate can name
//!   to guarantee a clean stack (double fault) even if the current kernel
//!   stack is corrupted.
//! - `iopb_offset` set to the end of the TSS disables the I/O permission
//!   bitmap, so user-mode port I/O faults.
//!
//! Every core owns exactly one [`TaskState`]. It can be neither sent nor
//! shared across cores, so one core can never rewrite another core's `rsp0`.

use crate::address::VirtualAddress;
use crate::idt::Ist;
use crate::stack::KernelStack;
use core::marker::PhantomData;
use core::mem::offset_of;
use log::trace;

/// 64-bit Task State Segment (TSS) as used by x86-64 long mode.
///
/// All `_reserved*` fields must be zero.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct Tss64 {
    _reserved0: u32,

    /* ─────────────── Privilege Stack Table ─────────────── */
    /// **Ring-0 stack pointer** loaded on privilege elevation to CPL 0.
    pub rsp0: VirtualAddress,
    /// Ring-1 stack pointer; unused.
    pub rsp1: VirtualAddress,
    /// Ring-2 stack pointer; unused.
    pub rsp2: VirtualAddress,

    _reserved1: u64,

    /* ─────────────── Interrupt Stack Table ─────────────── */
    /// `ist1..ist7`; a gate with IST index `n` loads `ist[n-1]`.
    pub ist: [VirtualAddress; 7],

    _reserved2: u64,
    _reserved3: u16,

    /// Byte offset of the I/O permission bitmap. `>= limit` means none.
    pub iopb_offset: u16,
}

const _: () = {
    assert!(size_of::<Tss64>() == 104);
    assert!(offset_of!(Tss64, rsp0) == 4);
    assert!(offset_of!(Tss64, ist) == 36);
    assert!(offset_of!(Tss64, iopb_offset) == 102);
};

impl Default for Tss64 {
    fn default() -> Self {
        Self::new()
    }
}

impl Tss64 {
    /// `limit` field for the TSS system descriptor.
    #[allow(clippy::cast_possible_truncation)]
    pub const LIMIT: u32 = (size_of::<Self>() - 1) as u32;

    /// Zeroed, with the I/O bitmap disabled.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new() -> Self {
        Self {
            _reserved0: 0,
            rsp0: VirtualAddress::zero(),
            rsp1: VirtualAddress::zero(),
            rsp2: VirtualAddress::zero(),
            _reserved1: 0,
            ist: [VirtualAddress::zero(); 7],
            _reserved2: 0,
            _reserved3: 0,
            iopb_offset: size_of::<Self>() as u16,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum TssError {
    #[error("Ist::None does not name a stack slot")]
    NotAnIstSlot,
}

/// The task state of one logical core.
///
/// Must stay at a fixed address once its descriptor has been built with
/// [`base`](Self::base) and loaded with `ltr`; the CPU reads `rsp0` and the
/// IST slots from that address on every privilege change.
pub struct TaskState {
    cpu: usize,
    tss: Tss64,
    // Core-local: neither `Send` nor `Sync`.
    _core_local: PhantomData<*mut ()>,
}

impl TaskState {
    #[must_use]
    pub const fn new(cpu: usize) -> Self {
        Self {
            cpu,
            tss: Tss64::new(),
            _core_local: PhantomData,
        }
    }

    #[must_use]
    pub const fn cpu(&self) -> usize {
        self.cpu
    }

    /// Point `rsp0` at a verified supervisor stack.
    pub fn set_kernel_stack(&mut self, stack: &KernelStack) {
        trace!("cpu {}: rsp0 = {}", self.cpu, stack.top());
        self.tss.rsp0 = stack.top();
    }

    /// Bind an IST slot to a verified supervisor stack.
    ///
    /// # Errors
    /// [`TssError::NotAnIstSlot`] for [`Ist::None`].
    pub fn set_ist(&mut self, ist: Ist, stack: &KernelStack) -> Result<(), TssError> {
        let slot = ist.tss_index().ok_or(TssError::NotAnIstSlot)?;
        trace!("cpu {}: {ist:?} = {}", self.cpu, stack.top());
        let mut table = self.tss.ist;
        table[slot] = stack.top();
        self.tss.ist = table;
        Ok(())
    }

    #[must_use]
    pub const fn rsp0(&self) -> VirtualAddress {
        self.tss.rsp0
    }

    /// The stack an IST gate switches to. `None` for [`Ist::None`].
    #[must_use]
    pub const fn ist(&self, ist: Ist) -> Option<VirtualAddress> {
        match ist.tss_index() {
            Some(slot) => {
                let table = self.tss.ist;
                Some(table[slot])
            }
            None => None,
        }
    }

    /// User mode may only be entered once `rsp0` names a kernel stack.
    #[must_use]
    pub const fn is_ready_for_user_entry(&self) -> bool {
        let rsp0 = self.tss.rsp0;
        !rsp0.is_null()
    }

    #[must_use]
    pub const fn tss(&self) -> &Tss64 {
        &self.tss
    }

    /// Address of the hardware TSS, for the GDT system descriptor.
    #[must_use]
    pub fn base(&self) -> VirtualAddress {
        VirtualAddress::from_ptr(&raw const self.tss)
    }
}
