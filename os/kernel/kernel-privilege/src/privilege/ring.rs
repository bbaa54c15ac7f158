/// CPU privilege rings (0–3).
///
/// | Ring | Typical Use |
/// |------|-------------|
/// | **Ring 0** | Kernel / supervisor mode |
/// | **Ring 1** | unused |
/// | **Ring 2** | unused |
/// | **Ring 3** | User-mode tasks |
///
/// The current ring (CPL) is always the RPL field of the loaded `CS`. Rings 1
/// and 2 exist only so that any hardware value can be decoded; nothing in this
/// crate produces them.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
#[repr(u8)]
pub enum Ring {
    /// **Ring 0**: kernel or supervisor mode.
    Ring0 = 0,

    #[deprecated]
    Ring1 = 1,

    #[deprecated]
    Ring2 = 2,

    /// **Ring 3**: user mode.
    Ring3 = 3,
}

impl Ring {
    #[inline]
    #[must_use]
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    /// Decode the low two bits of a selector or descriptor field.
    #[inline]
    #[must_use]
    #[allow(deprecated)]
    pub const fn from_low_bits(v: u16) -> Self {
        match v & 0b11 {
            0 => Self::Ring0,
            1 => Self::Ring1,
            2 => Self::Ring2,
            _ => Self::Ring3,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_supervisor(self) -> bool {
        matches!(self, Self::Ring0)
    }

    #[inline]
    #[must_use]
    pub const fn is_user(self) -> bool {
        matches!(self, Self::Ring3)
    }
}

impl From<Ring> for u8 {
    #[inline]
    fn from(r: Ring) -> Self {
        r.to_u8()
    }
}

impl TryFrom<u8> for Ring {
    type Error = u8;

    #[inline]
    fn try_from(r: u8) -> Result<Self, Self::Error> {
        if r <= 3 {
            Ok(Self::from_low_bits(u16::from(r)))
        } else {
            Err(r)
        }
    }
}
