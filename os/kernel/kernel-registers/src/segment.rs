//! Raw `CS` / `SS` selector values.
//!
//! The low two bits of `CS` are the current privilege level (CPL). In long
//! mode `SS` may legitimately hold the null selector (with RPL = CPL) after an
//! interrupt raised the privilege level.

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
use crate::LoadRegister;

/// Current `CS` value.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct CodeSegment(pub u16);

/// Current `SS` value.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct StackSegment(pub u16);

impl CodeSegment {
    /// Current privilege level encoded in `CS[1:0]`.
    #[inline]
    #[must_use]
    pub const fn cpl(self) -> u8 {
        (self.0 & 0b11) as u8
    }
}

impl StackSegment {
    #[inline]
    #[must_use]
    pub const fn rpl(self) -> u8 {
        (self.0 & 0b11) as u8
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl LoadRegister for CodeSegment {
    #[inline]
    fn load() -> Self {
        let cs: u16;
        unsafe {
            core::arch::asm!("mov {0:x}, cs", out(reg) cs, options(nomem, nostack, preserves_flags));
        }
        Self(cs)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl LoadRegister for StackSegment {
    #[inline]
    fn load() -> Self {
        let ss: u16;
        unsafe {
            core::arch::asm!("mov {0:x}, ss", out(reg) ss, options(nomem, nostack, preserves_flags));
        }
        Self(ss)
    }
}
