//! # Privilege Levels (x86-64)
//!
//! x86-64 implements four hierarchical *rings* (`0–3`); this kernel uses two:
//!
//! - **Ring 0**: kernel / supervisor mode (highest privilege)
//! - **Ring 3**: user mode (least privilege)
//!
//! The levels appear in three places that the CPU checks against each other:
//!
//! | Concept | Stored in | Purpose |
//! |----------|------------|----------|
//! | [`Ring`] | the current `CS` selector | the **current privilege level** (`CPL`) |
//! | [`Rpl`]  | the low 2 bits of a selector | the **requested privilege level** |
//! | [`Dpl`]  | bits 45–46 of a descriptor | the **descriptor privilege level** of the target |
//!
//! Checks enforced by the processor:
//!
//! - **Data segment load:** `max(CPL, RPL) ≤ DPL`
//! - **Stack segment load:** `CPL == RPL == DPL`
//! - **Software interrupt (`int n`):** `CPL ≤ gate DPL`, otherwise `#GP`
//! - **Interrupt return (`iretq`):** return `CS.RPL ≥ CPL`, code `DPL == CS.RPL`
//!
//! [`Ring`] decodes any hardware value, including the unused rings 1 and 2.
//! [`Rpl`] and [`Dpl`] can only be 0 or 3: anything this kernel builds is
//! either a kernel or a user object, so the intermediate rings are not
//! representable.
//!
//! ## References
//! - Intel® SDM, Vol 3A: *Protection; Privilege Levels*
//! - AMD64 Architecture Programmer’s Manual, Vol 2: *System Programming*

mod dpl;
mod ring;
mod rpl;

pub use dpl::Dpl;
pub use ring::Ring;
pub use rpl::{KERNEL_RPL, RPL_MASK, Rpl, USER_RPL};
