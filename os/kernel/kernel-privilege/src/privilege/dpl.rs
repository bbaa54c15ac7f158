use crate::privilege::{Ring, Rpl};

/// Descriptor Privilege Level (lives *in the descriptor*).
///
/// For segments it is the ring the segment belongs to; for interrupt gates it
/// is the least privileged ring that may invoke the gate with a software
/// interrupt instruction. Hardware-delivered interrupts ignore a gate's DPL.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
#[repr(u8)]
pub enum Dpl {
    Ring0 = 0,
    Ring3 = 3,
}

impl Dpl {
    #[inline]
    #[must_use]
    pub const fn to_ring(self) -> Ring {
        match self {
            Self::Ring0 => Ring::Ring0,
            Self::Ring3 => Ring::Ring3,
        }
    }

    #[inline]
    #[must_use]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }

    /// Decode a 2-bit DPL field. Rings 1 and 2 are never written by this
    /// crate, so they decode to `None`.
    #[inline]
    #[must_use]
    pub const fn from_bits(v: u8) -> Option<Self> {
        match v & 0b11 {
            0 => Some(Self::Ring0),
            3 => Some(Self::Ring3),
            _ => None,
        }
    }

    /// Data segment: allowed iff `max(CPL, RPL) ≤ DPL`.
    #[inline]
    #[must_use]
    pub const fn permits_data_load(self, cpl: Ring, rpl: Rpl) -> bool {
        (rpl.effective_with(cpl) as u8) <= (self as u8)
    }

    /// Stack segment load in long mode: `CPL == RPL == DPL`.
    #[inline]
    #[must_use]
    pub const fn permits_ss_load(self, cpl: Ring, rpl: Rpl) -> bool {
        (self as u8) == (cpl as u8) && (cpl as u8) == (rpl as u8)
    }

    /// Software-triggered gate invocation (`int n`, `int3`, `into`): `CPL ≤ DPL`.
    #[inline]
    #[must_use]
    pub const fn permits_software_invocation(self, cpl: Ring) -> bool {
        (cpl as u8) <= (self as u8)
    }
}

impl From<Rpl> for Dpl {
    #[inline]
    fn from(rpl: Rpl) -> Self {
        match rpl {
            Rpl::Ring0 => Self::Ring0,
            Rpl::Ring3 => Self::Ring3,
        }
    }
}

impl From<Dpl> for Ring {
    #[inline]
    fn from(dpl: Dpl) -> Self {
        dpl.to_ring()
    }
}
