//! The interrupt stack frame exchanged by every privilege transition.
//!
//! Lowest address first, exactly as the CPU leaves it on the handler stack
//! and as `iretq` consumes it:
//!
//! ```text
//! [rsp + 0]   (error code, vectors 8, 10–14, 17 only)
//! [rsp + 0]   rip
//! [rsp + 8]   cs
//! [rsp + 16]  rflags
//! [rsp + 24]  rsp
//! [rsp + 32]  ss
//! ```
//!
//! Building one by hand means pushing in reverse: ss, rsp, rflags, cs, rip.

use crate::address::VirtualAddress;
use crate::privilege::Ring;
use core::mem::offset_of;
use kernel_registers::Rflags;

const _: () = {
    assert!(size_of::<InterruptFrame>() == 40);
    assert!(offset_of!(InterruptFrame, rip) == 0);
    assert!(offset_of!(InterruptFrame, cs) == 8);
    assert!(offset_of!(InterruptFrame, rflags) == 16);
    assert!(offset_of!(InterruptFrame, rsp) == 24);
    assert!(offset_of!(InterruptFrame, ss) == 32);
    assert!(size_of::<ErrorFrame>() == 48);
    assert!(size_of::<SyscallFrame>() == 160);
    assert!(size_of::<SyscallFrame>().is_multiple_of(16));
};

#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct InterruptFrame {
    pub rip: u64,
    /// Zero-extended selector.
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    /// Zero-extended selector.
    pub ss: u64,
}

impl InterruptFrame {
    #[must_use]
    pub const fn new(rip: VirtualAddress, cs: u16, rflags: Rflags, rsp: VirtualAddress, ss: u16) -> Self {
        Self {
            rip: rip.as_u64(),
            cs: cs as u64,
            rflags: rflags.into_bits(),
            rsp: rsp.as_u64(),
            ss: ss as u64,
        }
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn cs(&self) -> u16 {
        self.cs as u16
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn ss(&self) -> u16 {
        self.ss as u16
    }

    #[inline]
    #[must_use]
    pub const fn rip(&self) -> VirtualAddress {
        VirtualAddress::new(self.rip)
    }

    #[inline]
    #[must_use]
    pub const fn rsp(&self) -> VirtualAddress {
        VirtualAddress::new(self.rsp)
    }

    #[inline]
    #[must_use]
    pub const fn rflags(&self) -> Rflags {
        Rflags::from_bits(self.rflags)
    }

    /// Ring the frame returns to: the RPL of its code selector.
    #[inline]
    #[must_use]
    pub const fn ring(&self) -> Ring {
        Ring::from_low_bits(self.cs())
    }

    /// The five values in the order a manual transition pushes them.
    #[must_use]
    pub const fn push_order(&self) -> [u64; 5] {
        [self.ss, self.rsp, self.rflags, self.cs, self.rip]
    }
}

/// Frame of an exception that pushes an error code.
#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct ErrorFrame {
    pub error_code: u64,
    pub frame: InterruptFrame,
}

/// General purpose registers saved by the `int 0x80` entry stub, in the
/// order they end up on the stack (`rax` pushed last, lowest address).
#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct SavedRegisters {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

/// Everything on the kernel stack when the system-call dispatch hook runs.
///
/// Registers written here are restored into user mode by the stub's
/// `iretq`; `rax` carries the return value.
#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct SyscallFrame {
    pub regs: SavedRegisters,
    pub frame: InterruptFrame,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_order_is_the_reverse_of_memory_order() {
        let f = InterruptFrame::new(
            VirtualAddress::new(0x40_0000),
            0x1B,
            Rflags::user_mode_entry(),
            VirtualAddress::new(0x7FFF_0000),
            0x23,
        );
        assert_eq!(f.push_order(), [0x23, 0x7FFF_0000, 0x202, 0x1B, 0x40_0000]);
        assert_eq!(f.ring(), Ring::Ring3);
        assert_eq!(f.rflags(), Rflags::user_mode_entry());
    }
}
