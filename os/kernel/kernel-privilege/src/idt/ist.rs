/// IST slot named by a gate.
///
/// A gate with a non-zero slot always switches to `TSS.ist[n - 1]`, even
/// when the event arrives in ring 0. That is what lets `#DF` run when the
/// current kernel stack (or `rsp0`) is the thing that failed. Slot 0 means
/// "`rsp0` on a privilege change, otherwise keep the current stack".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Ist {
    None = 0,
    Ist1 = 1,
    Ist2 = 2,
    Ist3 = 3,
    Ist4 = 4,
    Ist5 = 5,
    Ist6 = 6,
    Ist7 = 7,
}

impl Ist {
    /// Decode the 3-bit gate field.
    #[inline]
    #[must_use]
    pub const fn from_bits(value: u8) -> Self {
        const SLOTS: [Ist; 8] = [
            Ist::None,
            Ist::Ist1,
            Ist::Ist2,
            Ist::Ist3,
            Ist::Ist4,
            Ist::Ist5,
            Ist::Ist6,
            Ist::Ist7,
        ];
        SLOTS[(value & 0b111) as usize]
    }

    #[inline]
    #[must_use]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }

    /// Position in `Tss64::ist`; `None` for [`Ist::None`].
    #[inline]
    #[must_use]
    pub const fn tss_index(self) -> Option<usize> {
        match self {
            Self::None => None,
            slot => Some(slot as usize - 1),
        }
    }
}
