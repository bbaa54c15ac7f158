//! # Strongly-typed segment selectors for long mode
//!
//! Segment selectors are 16-bit values loaded into CS/DS/ES/SS (and TR for the
//! TSS). A selector encodes:
//!
//! ```text
//!  15            3 2  1  0
//! +----------------+--+----+
//! |   Index[12:0]  |TI| RPL|
//! +----------------+--+----+  (TI=0 → GDT, TI=1 → LDT; RPL=0..3)
//! ```
//!
//! The type layer keeps a data selector out of `CS` and a random value out of
//! `ltr`. Construction from untrusted bits goes through
//! [`SegmentSelector::try_new`] / [`SegmentSelector::decode`], which reject
//! anything this kernel never builds: RPL 1 or 2, the null index, and LDT
//! references (there is no LDT).

use crate::privilege::Rpl;
use bitfield_struct::bitfield;
use core::fmt;
use core::marker::PhantomData;

/// Number of descriptors addressable through the 13-bit index field.
pub const MAX_DESCRIPTORS: u16 = 1 << 13;

/// A selector rejected in software, before any register was touched.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum InvalidSelector {
    #[error("requested privilege level {0} is neither 0 nor 3")]
    Rpl(u8),
    #[error("descriptor index {0} is outside the table")]
    Index(u16),
    #[error("the null selector cannot be used here")]
    Null,
    #[error("selector {0:#06x} refers to a local descriptor table")]
    LocalTable(u16),
    #[error("selector {0:#06x} does not refer to a descriptor of the expected kind")]
    WrongKind(u16),
}

/// Raw 16-bit selector encoding (index/TI/RPL).
#[bitfield(u16)]
#[derive(Eq, PartialEq)]
pub struct SegmentSelectorRaw {
    /// Requested Privilege Level (bits 0..1).
    #[bits(2)]
    pub rpl: u8,
    /// Table Indicator (bit 2): 0 = GDT, 1 = LDT.
    pub ti: bool,
    /// Descriptor index (bits 3..15).
    #[bits(13)]
    pub index: u16,
}

/// Marker trait for typed selectors.
pub trait SelectorKind: Copy {
    const NAME: &'static str;
}

/// Code segment (CS) selector.
#[derive(Copy, Clone, Eq, PartialEq)]
pub enum CodeSel {}

/// Data/stack (DS/ES/SS) selector.
#[derive(Copy, Clone, Eq, PartialEq)]
pub enum DataSel {}

/// TSS system segment selector (for `ltr`).
#[derive(Copy, Clone, Eq, PartialEq)]
pub enum TssSel {}

impl SelectorKind for CodeSel {
    const NAME: &'static str = "code";
}

impl SelectorKind for DataSel {
    const NAME: &'static str = "data";
}

impl SelectorKind for TssSel {
    const NAME: &'static str = "tss";
}

/// Strongly-typed selector wrapper. Always refers to the GDT.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct SegmentSelector<K: SelectorKind>(SegmentSelectorRaw, PhantomData<K>);

impl<K: SelectorKind> SegmentSelector<K> {
    #[allow(clippy::cast_possible_truncation)]
    const fn from_parts(index: u16, rpl: Rpl) -> Self {
        Self(
            SegmentSelectorRaw::new()
                .with_index(index)
                .with_ti(false)
                .with_rpl(rpl.into_bits() as u8),
            PhantomData,
        )
    }

    /// Build a selector from an index and a raw ring number.
    ///
    /// # Errors
    /// - [`InvalidSelector::Rpl`] if `ring` is not 0 or 3,
    /// - [`InvalidSelector::Null`] for index 0,
    /// - [`InvalidSelector::Index`] if the index does not fit 13 bits.
    pub fn try_new(index: u16, ring: u8) -> Result<Self, InvalidSelector> {
        let rpl = Rpl::try_from(ring)?;
        if index == 0 {
            return Err(InvalidSelector::Null);
        }
        if index >= MAX_DESCRIPTORS {
            return Err(InvalidSelector::Index(index));
        }
        Ok(Self::from_parts(index, rpl))
    }

    /// Validate a raw selector value, e.g. one read back from a frame.
    ///
    /// # Errors
    /// - [`InvalidSelector::LocalTable`] if TI selects the LDT,
    /// - [`InvalidSelector::Rpl`] for RPL 1 or 2,
    /// - [`InvalidSelector::Null`] for a null selector.
    pub const fn decode(raw: u16) -> Result<Self, InvalidSelector> {
        let bits = SegmentSelectorRaw::from_bits(raw);
        if bits.ti() {
            return Err(InvalidSelector::LocalTable(raw));
        }
        let rpl = match Rpl::from_bits(raw) {
            Ok(rpl) => rpl,
            Err(e) => return Err(e),
        };
        if bits.index() == 0 {
            return Err(InvalidSelector::Null);
        }
        Ok(Self::from_parts(bits.index(), rpl))
    }

    /// Access the raw selector (index/TI/RPL).
    #[inline]
    #[must_use]
    pub const fn raw(self) -> SegmentSelectorRaw {
        self.0
    }

    /// Encode as `u16` (for `iretq` frames, `mov ss, ax`, etc.).
    #[inline]
    #[must_use]
    pub const fn encode(self) -> u16 {
        self.0.into_bits()
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> u16 {
        self.0.index()
    }

    /// Byte offset of the descriptor inside the GDT.
    #[inline]
    #[must_use]
    pub const fn offset(self) -> u16 {
        self.0.index() << 3
    }

    #[inline]
    #[must_use]
    pub const fn rpl(self) -> Rpl {
        match Rpl::from_bits(self.0.into_bits()) {
            Ok(rpl) => rpl,
            // Every constructor goes through `Rpl`.
            Err(_) => Rpl::Ring3,
        }
    }
}

impl SegmentSelector<CodeSel> {
    /// Create a **code** selector from a GDT index and desired RPL.
    ///
    /// For user code, pass [`Rpl::Ring3`] to produce `…|3` (e.g. `0x1b`).
    #[inline]
    #[must_use]
    pub const fn new(index: u16, rpl: Rpl) -> Self {
        Self::from_parts(index, rpl)
    }
}

impl SegmentSelector<DataSel> {
    /// Create a **data/stack** selector from a GDT index and RPL.
    ///
    /// For a user stack (SS), RPL must match CPL (Ring-3).
    #[inline]
    #[must_use]
    pub const fn new(index: u16, rpl: Rpl) -> Self {
        Self::from_parts(index, rpl)
    }
}

impl SegmentSelector<TssSel> {
    /// Create a **TSS** selector for `ltr`. RPL is architecturally ignored.
    #[inline]
    #[must_use]
    pub const fn new(index: u16) -> Self {
        Self::from_parts(index, Rpl::Ring0)
    }
}

impl<K: SelectorKind> fmt::Debug for SegmentSelector<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:#06x})", K::NAME, self.encode())
    }
}

impl<K: SelectorKind> From<SegmentSelector<K>> for u16 {
    #[inline]
    fn from(value: SegmentSelector<K>) -> Self {
        value.encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_of_user_code() {
        let s = SegmentSelector::<CodeSel>::new(3, Rpl::Ring3);
        assert_eq!(s.encode(), 0x1B);
        assert_eq!(s.index(), 3);
        assert_eq!(s.offset(), 0x18);
        assert_eq!(s.rpl(), Rpl::Ring3);
        assert!(!s.raw().ti());
    }

    #[test]
    fn try_new_rejects_middle_rings() {
        assert_eq!(
            SegmentSelector::<DataSel>::try_new(4, 1),
            Err(InvalidSelector::Rpl(1))
        );
        assert_eq!(
            SegmentSelector::<DataSel>::try_new(4, 2),
            Err(InvalidSelector::Rpl(2))
        );
        assert_eq!(
            SegmentSelector::<DataSel>::try_new(4, 3).map(SegmentSelector::encode),
            Ok(0x23)
        );
    }

    #[test]
    fn try_new_rejects_null_and_oversized_index() {
        assert_eq!(
            SegmentSelector::<CodeSel>::try_new(0, 0),
            Err(InvalidSelector::Null)
        );
        assert_eq!(
            SegmentSelector::<CodeSel>::try_new(MAX_DESCRIPTORS, 0),
            Err(InvalidSelector::Index(MAX_DESCRIPTORS))
        );
    }

    #[test]
    fn decode_checks_table_and_rpl() {
        assert_eq!(
            SegmentSelector::<CodeSel>::decode(0x1B).map(SegmentSelector::encode),
            Ok(0x1B)
        );
        assert_eq!(
            SegmentSelector::<CodeSel>::decode(0x1F),
            Err(InvalidSelector::LocalTable(0x1F))
        );
        assert_eq!(
            SegmentSelector::<CodeSel>::decode(0x19),
            Err(InvalidSelector::Rpl(1))
        );
        assert_eq!(
            SegmentSelector::<DataSel>::decode(0x3),
            Err(InvalidSelector::Null)
        );
    }
}
