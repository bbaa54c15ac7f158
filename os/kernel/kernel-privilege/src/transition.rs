//! # Privilege transitions
//!
//! Forward (ring 0 → ring 3) transitions are requested through a
//! [`UserEntry`]: the only way to obtain one is [`UserEntry::new`], which
//! rejects selectors without RPL 3 and addresses outside the user half. The
//! flags image is not a parameter; [`UserEntry::frame`] always carries
//! `0x202` (`IF` plus the fixed bit).
//!
//! The transition itself is a single `iretq` over that frame
//! ([`crate::hw::enter_user_mode`]), which loads rip, cs, rflags, rsp and ss
//! atomically. The reverse direction is performed by the processor on
//! interrupt delivery and undone by `iretq` over the saved frame
//! ([`crate::hw::return_from_interrupt`]).

use crate::address::VirtualAddress;
use crate::frame::InterruptFrame;
use crate::gdt::Gdt;
use crate::gdt::selectors::{CodeSel, DataSel, InvalidSelector, SegmentSelector};
use crate::privilege::Rpl;
use crate::stack::{AddressSpaceView, StackError, UserStack, verify_user_code};
use crate::tss::TaskState;
use kernel_registers::Rflags;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum UserEntryError {
    #[error(transparent)]
    Selector(#[from] InvalidSelector),
    #[error("selector {0:#06x} does not request ring 3")]
    KernelSelector(u16),
    #[error("{0} is not a canonical user address")]
    NotUserAddress(VirtualAddress),
    #[error(transparent)]
    Isolation(#[from] StackError),
    #[error("cpu {0} has no ring-0 stack in its TSS")]
    KernelStackMissing(usize),
}

/// A validated request to enter user mode.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct UserEntry {
    rip: VirtualAddress,
    rsp: VirtualAddress,
    cs: SegmentSelector<CodeSel>,
    ss: SegmentSelector<DataSel>,
}

impl UserEntry {
    /// # Errors
    /// - [`UserEntryError::KernelSelector`] if either selector has RPL 0,
    /// - [`UserEntryError::NotUserAddress`] if `rip` or `rsp` is not in the
    ///   canonical lower half.
    pub const fn new(
        rip: VirtualAddress,
        rsp: VirtualAddress,
        cs: SegmentSelector<CodeSel>,
        ss: SegmentSelector<DataSel>,
    ) -> Result<Self, UserEntryError> {
        if !matches!(cs.rpl(), Rpl::Ring3) {
            return Err(UserEntryError::KernelSelector(cs.encode()));
        }
        if !matches!(ss.rpl(), Rpl::Ring3) {
            return Err(UserEntryError::KernelSelector(ss.encode()));
        }
        if !rip.is_user() {
            return Err(UserEntryError::NotUserAddress(rip));
        }
        if !rsp.is_user() {
            return Err(UserEntryError::NotUserAddress(rsp));
        }
        Ok(Self { rip, rsp, cs, ss })
    }

    /// Validate raw selector values first, e.g. ones coming from a loader.
    ///
    /// # Errors
    /// [`UserEntryError::Selector`] for undecodable selectors, otherwise as
    /// [`new`](Self::new).
    pub fn from_raw(
        rip: VirtualAddress,
        rsp: VirtualAddress,
        cs: u16,
        ss: u16,
    ) -> Result<Self, UserEntryError> {
        let cs = SegmentSelector::<CodeSel>::decode(cs)?;
        let ss = SegmentSelector::<DataSel>::decode(ss)?;
        Self::new(rip, rsp, cs, ss)
    }

    /// Ask the paging collaborator whether the entry point is user-executable
    /// and the first stack slot is user-writable and non-executable.
    ///
    /// # Errors
    /// [`UserEntryError::Isolation`] naming the failed requirement.
    pub fn verify(&self, view: &impl AddressSpaceView) -> Result<(), UserEntryError> {
        verify_user_code(view, self.rip)?;
        UserStack::verify(view, self.rsp, 8)?;
        Ok(())
    }

    /// Both selectors must name descriptors of their kind in `gdt`: a 64-bit
    /// code segment for `cs` and a writable data segment for `ss`.
    ///
    /// # Errors
    /// [`InvalidSelector::WrongKind`] naming the offending selector.
    pub fn check_segments<const CPUS: usize>(
        &self,
        gdt: &Gdt<CPUS>,
    ) -> Result<(), UserEntryError> {
        let wrong_kind =
            |selector: u16| -> UserEntryError { InvalidSelector::WrongKind(selector).into() };
        match gdt.descriptor(self.cs.index()) {
            Some(code) if code.is_long_code() => {}
            _ => return Err(wrong_kind(self.cs.encode())),
        }
        match gdt.descriptor(self.ss.index()) {
            Some(data) if data.is_writable_data() => Ok(()),
            _ => Err(wrong_kind(self.ss.encode())),
        }
    }

    /// The calling core must have `rsp0` set before any user code runs, or
    /// the first interrupt from ring 3 has no stack to land on.
    ///
    /// # Errors
    /// [`UserEntryError::KernelStackMissing`].
    pub const fn check_task_state(&self, task: &TaskState) -> Result<(), UserEntryError> {
        if task.is_ready_for_user_entry() {
            Ok(())
        } else {
            Err(UserEntryError::KernelStackMissing(task.cpu()))
        }
    }

    /// The `iretq` frame. Flags are always [`Rflags::user_mode_entry`].
    #[must_use]
    pub const fn frame(&self) -> InterruptFrame {
        InterruptFrame::new(
            self.rip,
            self.cs.encode(),
            Rflags::user_mode_entry(),
            self.rsp,
            self.ss.encode(),
        )
    }

    #[must_use]
    pub const fn rip(&self) -> VirtualAddress {
        self.rip
    }

    #[must_use]
    pub const fn rsp(&self) -> VirtualAddress {
        self.rsp
    }

    #[must_use]
    pub const fn code_selector(&self) -> SegmentSelector<CodeSel> {
        self.cs
    }

    #[must_use]
    pub const fn stack_selector(&self) -> SegmentSelector<DataSel> {
        self.ss
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gdt::{
        KERNEL_CS_SEL, KERNEL_DS_SEL, SegmentSlot, USER_CODE_INDEX, USER_CS_SEL, USER_DATA_INDEX,
        USER_DS_SEL, build_gdt,
    };
    use crate::gdt::descriptors::SegmentDescriptor;

    fn va(v: u64) -> VirtualAddress {
        VirtualAddress::new(v)
    }

    #[test]
    fn user_entry_frame() {
        let e = UserEntry::new(va(0x40_0000), va(0x7FFF_0000), USER_CS_SEL, USER_DS_SEL)
            .expect("valid");
        let f = e.frame();
        assert_eq!(f.rip, 0x40_0000);
        assert_eq!(f.cs, 0x1B);
        assert_eq!(f.rflags, 0x202);
        assert_eq!(f.rsp, 0x7FFF_0000);
        assert_eq!(f.ss, 0x23);
    }

    #[test]
    fn kernel_selectors_are_refused() {
        assert_eq!(
            UserEntry::new(va(0x40_0000), va(0x7FFF_0000), KERNEL_CS_SEL, USER_DS_SEL),
            Err(UserEntryError::KernelSelector(0x08))
        );
        assert_eq!(
            UserEntry::new(va(0x40_0000), va(0x7FFF_0000), USER_CS_SEL, KERNEL_DS_SEL),
            Err(UserEntryError::KernelSelector(0x10))
        );
    }

    #[test]
    fn kernel_addresses_are_refused() {
        let kernel = va(0xFFFF_8000_0000_0000);
        assert_eq!(
            UserEntry::new(kernel, va(0x7FFF_0000), USER_CS_SEL, USER_DS_SEL),
            Err(UserEntryError::NotUserAddress(kernel))
        );
        assert_eq!(
            UserEntry::new(va(0x40_0000), kernel, USER_CS_SEL, USER_DS_SEL),
            Err(UserEntryError::NotUserAddress(kernel))
        );
    }

    #[test]
    fn raw_selectors_are_decoded() {
        assert!(UserEntry::from_raw(va(0x40_0000), va(0x7FFF_0000), 0x1B, 0x23).is_ok());
        assert_eq!(
            UserEntry::from_raw(va(0x40_0000), va(0x7FFF_0000), 0x1A, 0x23),
            Err(UserEntryError::Selector(InvalidSelector::Rpl(2)))
        );
    }

    #[test]
    fn task_state_must_have_rsp0() {
        let e = UserEntry::new(va(0x40_0000), va(0x7FFF_0000), USER_CS_SEL, USER_DS_SEL)
            .expect("valid");
        assert_eq!(
            e.check_task_state(&TaskState::new(3)),
            Err(UserEntryError::KernelStackMissing(3))
        );
    }

    #[test]
    fn selectors_must_name_segments_of_their_kind() {
        let gdt = build_gdt();
        let entry = UserEntry::new(va(0x40_0000), va(0x7FFF_0000), USER_CS_SEL, USER_DS_SEL)
            .expect("valid");
        assert_eq!(entry.check_segments(&gdt), Ok(()));

        let crossed = UserEntry::new(
            va(0x40_0000),
            va(0x7FFF_0000),
            SegmentSelector::<CodeSel>::new(USER_DATA_INDEX, Rpl::Ring3),
            SegmentSelector::<DataSel>::new(USER_CODE_INDEX, Rpl::Ring3),
        )
        .expect("RPL 3 selectors");
        assert_eq!(
            crossed.check_segments(&gdt),
            Err(UserEntryError::Selector(InvalidSelector::WrongKind(0x23)))
        );

        let no_stack = gdt.with_segment(
            SegmentSlot::UserData,
            SegmentDescriptor::code64(crate::privilege::Dpl::Ring3),
        );
        assert_eq!(
            entry.check_segments(&no_stack),
            Err(UserEntryError::Selector(InvalidSelector::WrongKind(0x23)))
        );
    }
}
