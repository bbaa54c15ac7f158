//! # Fault taxonomy
//!
//! Two families of failure exist around a privilege transition:
//!
//! - **Software rejections** ([`crate::gdt::selectors::InvalidSelector`],
//!   [`crate::gate::GateError`], ...) happen before any register is touched
//!   and are ordinary `Result`s.
//! - **Hardware faults** ([`Fault`]) are raised by the processor and delivered
//!   through the IDT to the fault-dispatch collaborator. A hardware transition
//!   never returns them; they are observed by handlers or by
//!   [`crate::sim::Machine`].
//!
//! Vectors that push an error code: `#DF` (8), `#TS` (10), `#NP` (11),
//! `#SS` (12), `#GP` (13), `#PF` (14), `#AC` (17).

use crate::address::VirtualAddress;
use bitfield_struct::bitfield;

pub const DIVIDE_ERROR_VECTOR: u8 = 0x00;
pub const BREAKPOINT_VECTOR: u8 = 0x03;
pub const DOUBLE_FAULT_VECTOR: u8 = 0x08;
pub const INVALID_TSS_VECTOR: u8 = 0x0A;
pub const SEGMENT_NOT_PRESENT_VECTOR: u8 = 0x0B;
pub const STACK_SEGMENT_VECTOR: u8 = 0x0C;
pub const GENERAL_PROTECTION_VECTOR: u8 = 0x0D;
pub const PAGE_FAULT_VECTOR: u8 = 0x0E;
pub const ALIGNMENT_CHECK_VECTOR: u8 = 0x11;

/// Whether the CPU pushes an error code before the frame for `vector`.
#[must_use]
pub const fn pushes_error_code(vector: u8) -> bool {
    matches!(
        vector,
        DOUBLE_FAULT_VECTOR
            | INVALID_TSS_VECTOR
            | SEGMENT_NOT_PRESENT_VECTOR
            | STACK_SEGMENT_VECTOR
            | GENERAL_PROTECTION_VECTOR
            | PAGE_FAULT_VECTOR
            | ALIGNMENT_CHECK_VECTOR
    )
}

/// Error code of `#TS`, `#NP`, `#SS` and `#GP`: which selector or IDT vector
/// caused the fault.
///
/// Reference: Intel SDM Vol. 3A, §6.13 “Error Code”.
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct SelectorErrorCode {
    /// Raised while delivering an event external to the program.
    pub external: bool, // bit 0

    /// `index` refers to an IDT gate.
    pub idt: bool, // bit 1

    /// `index` refers to the LDT (only meaningful when `idt == false`).
    pub ti: bool, // bit 2

    #[bits(13)]
    pub index: u16, // bits 3..16

    #[bits(48)]
    __: u64,
}

impl SelectorErrorCode {
    /// Error code naming an IDT vector, e.g. `0x81 * 8 + 2` for a
    /// ring-3 `int 0x81` on a DPL0 gate.
    #[must_use]
    pub const fn for_vector(vector: u8) -> Self {
        Self::new().with_idt(true).with_index(vector as u16)
    }

    /// Error code naming a raw selector (its RPL bits are dropped).
    #[must_use]
    pub const fn for_selector(selector: u16) -> Self {
        Self::new()
            .with_ti(selector & 0b100 != 0)
            .with_index(selector >> 3)
    }
}

/// Page-fault error code layout (x86-64).
///
/// Reference: Intel SDM Vol. 3A, §6.15 “Page-Fault Exception (#PF)”.
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct PageFaultError {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool, // bit 0

    /// 0 = read or execute.
    /// 1 = write access.
    pub write: bool, // bit 1

    /// 0 = supervisor (CPL 0).
    /// 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// 1 = caused by reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// 1 = instruction fetch (execute access).
    pub instruction_fetch: bool, // bit 4

    /// 1 = protection-key violation (if CR4.PKE=1).
    pub protection_key: bool, // bit 5

    /// 1 = shadow stack access (if CET-SS enabled).
    pub shadow_stack: bool, // bit 6

    #[bits(57)]
    __: u64,
}

impl PageFaultError {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if !self.present() {
            "Non-present page (page not mapped or swapped out)"
        } else if self.instruction_fetch() {
            if self.user() {
                "User-mode instruction fetch on protected page (likely NX or supervisor-only)"
            } else {
                "Kernel instruction fetch on protected page"
            }
        } else if self.write() {
            if self.user() {
                "User-mode write to read-only or supervisor-only page"
            } else {
                "Write access to protected page"
            }
        } else if self.user() {
            "User-mode read of supervisor-only page"
        } else {
            "Read access to protected page"
        }
    }
}

/// A processor fault raised around a privilege transition.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum Fault {
    /// `#GP`: privilege or selector check failed.
    #[error("general protection fault (error {:#x})", .error.into_bits())]
    GeneralProtection { error: SelectorErrorCode },
    /// `#NP`: referenced segment or gate is not present.
    #[error("segment not present (error {:#x})", .error.into_bits())]
    SegmentNotPresent { error: SelectorErrorCode },
    /// `#PF`: paging permission violation.
    #[error("page fault at {address}: {}", .error.explain())]
    PageFault {
        address: VirtualAddress,
        error: PageFaultError,
    },
    /// `#DF`: a fault occurred while delivering another event.
    #[error("double fault")]
    DoubleFault,
    /// A fault while delivering `#DF`; the core shuts down.
    #[error("triple fault")]
    TripleFault,
}

impl Fault {
    /// IDT vector the fault is delivered on. `None` for a triple fault,
    /// which is never delivered.
    #[must_use]
    pub const fn vector(&self) -> Option<u8> {
        match self {
            Self::GeneralProtection { .. } => Some(GENERAL_PROTECTION_VECTOR),
            Self::SegmentNotPresent { .. } => Some(SEGMENT_NOT_PRESENT_VECTOR),
            Self::PageFault { .. } => Some(PAGE_FAULT_VECTOR),
            Self::DoubleFault => Some(DOUBLE_FAULT_VECTOR),
            Self::TripleFault => None,
        }
    }

    /// The error code pushed with the frame. `#DF` always pushes zero.
    #[must_use]
    pub const fn error_code(&self) -> u64 {
        match self {
            Self::GeneralProtection { error } | Self::SegmentNotPresent { error } => {
                error.into_bits()
            }
            Self::PageFault { error, .. } => error.into_bits(),
            Self::DoubleFault | Self::TripleFault => 0,
        }
    }

    /// Faulting linear address (`CR2`) of a page fault.
    #[must_use]
    pub const fn address(&self) -> Option<VirtualAddress> {
        match self {
            Self::PageFault { address, .. } => Some(*address),
            _ => None,
        }
    }

    #[must_use]
    pub const fn gp_vector(vector: u8) -> Self {
        Self::GeneralProtection {
            error: SelectorErrorCode::for_vector(vector),
        }
    }

    #[must_use]
    pub const fn gp_selector(selector: u16) -> Self {
        Self::GeneralProtection {
            error: SelectorErrorCode::for_selector(selector),
        }
    }
}
