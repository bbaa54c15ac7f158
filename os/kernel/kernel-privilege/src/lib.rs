//! # Privilege transitions for x86-64
//!
//! Everything the kernel needs to run code in ring 3 and get back into
//! ring 0 safely:
//!
//! - [`gdt`]: the segment layout (`0x08`/`0x10` kernel, `0x1B`/`0x23` user,
//!   one TSS descriptor per core) and typed [selectors](gdt::selectors).
//! - [`idt`] and [`gate`]: 16-byte gates, deny-by-default software gate
//!   policy. Only the system-call vector `0x80` is reachable from ring 3
//!   unless a kernel explicitly configures more.
//! - [`tss`] and [`stack`]: per-core `rsp0`/IST stacks, accepted only after
//!   the paging collaborator confirms they are supervisor-only.
//! - [`transition`]: validated [`UserEntry`] requests; the forward
//!   transition always enters user mode with `RFLAGS = 0x202`.
//! - [`tables`]: one-time publication of the GDT/IDT and per-core loading.
//! - [`hw`]: the `lgdt`/`lidt`/`ltr`/`iretq` instructions (x86-64 only).
//! - [`sim`]: a processor model that performs the same privilege checks in
//!   software, for tests and for reasoning about faults.
//!
//! ```
//! use kernel_privilege::gdt::{USER_CS_SEL, USER_DS_SEL};
//! use kernel_privilege::{UserEntry, VirtualAddress};
//!
//! let entry = UserEntry::new(
//!     VirtualAddress::new(0x40_0000),
//!     VirtualAddress::new(0x7FFF_0000),
//!     USER_CS_SEL,
//!     USER_DS_SEL,
//! )
//! .expect("valid user entry");
//! assert_eq!(entry.frame().push_order(), [0x23, 0x7FFF_0000, 0x202, 0x1B, 0x40_0000]);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod address;
#[cfg(feature = "qemu")]
pub mod boot_logging;
pub mod fault;
pub mod frame;
pub mod gate;
pub mod gdt;
#[cfg(target_arch = "x86_64")]
pub mod hw;
pub mod idt;
pub mod layout;
pub mod privilege;
pub mod sim;
pub mod stack;
pub mod tables;
pub mod transition;
pub mod tss;

pub use address::VirtualAddress;
pub use fault::Fault;
pub use frame::InterruptFrame;
pub use gate::{GateError, IdtBuilder, build_idt};
pub use gdt::{Gdt, build_gdt};
pub use idt::Idt;
pub use transition::{UserEntry, UserEntryError};
pub use tss::TaskState;
