//! # Typed `x86_64` Registers
//!
//! The registers that take part in a privilege transition: `RFLAGS` and the
//! `CS`/`SS` segment registers. Everything else the transition touches (RIP,
//! RSP) is a plain address and needs no model.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod rflags;
pub mod segment;

pub use rflags::Rflags;
pub use segment::{CodeSegment, StackSegment};

pub trait LoadRegister {
    /// Reading this register is allowed at any privilege level.
    fn load() -> Self;
}
