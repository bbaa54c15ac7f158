//! Requested Privilege Level (RPL).
//!
//! RPL lives in the **low 2 bits of a segment selector**. Don’t confuse it with:
//! - **CPL** (Current Privilege Level): taken from the running `CS`.
//! - **DPL** (Descriptor Privilege Level): stored in the target descriptor.
//!
//! Only `0` and `3` are representable; a selector asking for ring 1 or 2 is
//! rejected where it is constructed, long before the processor sees it.

use crate::gdt::selectors::InvalidSelector;
use crate::privilege::Ring;

/// RPL mask in a 16-bit selector.
pub const RPL_MASK: u16 = 0b11;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
#[repr(u8)]
pub enum Rpl {
    Ring0 = 0,
    Ring3 = 3,
}

pub const KERNEL_RPL: Rpl = Rpl::Ring0;
pub const USER_RPL: Rpl = Rpl::Ring3;

impl Rpl {
    /// Convert to the matching `Ring`.
    #[inline]
    #[must_use]
    pub const fn to_ring(self) -> Ring {
        match self {
            Self::Ring0 => Ring::Ring0,
            Self::Ring3 => Ring::Ring3,
        }
    }

    /// Encode as the low two bits of a selector.
    #[inline]
    #[must_use]
    pub const fn into_bits(self) -> u16 {
        self as u16
    }

    /// Decode the low two bits of a selector.
    ///
    /// # Errors
    /// [`InvalidSelector::Rpl`] for ring 1 or 2.
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_bits(bits: u16) -> Result<Self, InvalidSelector> {
        match bits & RPL_MASK {
            0 => Ok(Self::Ring0),
            3 => Ok(Self::Ring3),
            other => Err(InvalidSelector::Rpl(other as u8)),
        }
    }

    /// Extract the `RPL` of a raw selector value.
    ///
    /// # Errors
    /// [`InvalidSelector::Rpl`] for ring 1 or 2.
    #[inline]
    pub const fn from_selector(selector: u16) -> Result<Self, InvalidSelector> {
        Self::from_bits(selector & RPL_MASK)
    }

    /// Return `selector` with its `RPL` bits replaced by `self`.
    #[inline]
    #[must_use]
    pub const fn apply_to_selector(self, selector: u16) -> u16 {
        (selector & !RPL_MASK) | self.into_bits()
    }

    /// The *effective requester level* of a data-segment check: `max(CPL, RPL)`.
    #[inline]
    #[must_use]
    pub const fn effective_with(self, cpl: Ring) -> Ring {
        if cpl as u8 >= self as u8 {
            cpl
        } else {
            self.to_ring()
        }
    }
}

impl TryFrom<u8> for Rpl {
    type Error = InvalidSelector;

    #[inline]
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Ring0),
            3 => Ok(Self::Ring3),
            other => Err(InvalidSelector::Rpl(other)),
        }
    }
}

impl From<Rpl> for Ring {
    #[inline]
    fn from(rpl: Rpl) -> Self {
        rpl.to_ring()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rings_0_and_3() {
        assert_eq!(Rpl::try_from(0), Ok(Rpl::Ring0));
        assert_eq!(Rpl::try_from(3), Ok(Rpl::Ring3));
        assert_eq!(Rpl::try_from(1), Err(InvalidSelector::Rpl(1)));
        assert_eq!(Rpl::try_from(2), Err(InvalidSelector::Rpl(2)));
        assert_eq!(Rpl::try_from(4), Err(InvalidSelector::Rpl(4)));
    }

    #[test]
    fn selector_pack_unpack() {
        let base: u16 = 0x1234 & !RPL_MASK;
        let with_user = USER_RPL.apply_to_selector(base);
        assert_eq!(Rpl::from_selector(with_user), Ok(USER_RPL));
        let with_kernel = KERNEL_RPL.apply_to_selector(base);
        assert_eq!(Rpl::from_selector(with_kernel), Ok(KERNEL_RPL));
        assert_eq!(with_user & !RPL_MASK, base);
        assert_eq!(with_kernel & !RPL_MASK, base);
        assert_eq!(Rpl::from_selector(base | 1), Err(InvalidSelector::Rpl(1)));
        assert_eq!(Rpl::from_bits(0xFFFE), Err(InvalidSelector::Rpl(2)));
    }

    #[test]
    fn effective_level_is_the_weaker_one() {
        assert_eq!(USER_RPL.effective_with(Ring::Ring0), Ring::Ring3);
        assert_eq!(KERNEL_RPL.effective_with(Ring::Ring3), Ring::Ring3);
        assert_eq!(KERNEL_RPL.effective_with(Ring::Ring0), Ring::Ring0);
    }
}
