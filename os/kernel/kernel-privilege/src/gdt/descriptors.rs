//! # 64-bit GDT code/data descriptor encodings
//!
//! In long mode, **base** and **limit** fields of *code/data* descriptors are
//! ignored for linear address calculation; paging provides memory protection.
//! What **does** matter is:
//! - **Type** (code vs data, readable/writable),
//! - **S** (descriptor class: code/data vs system),
//! - **DPL** (descriptor privilege level),
//! - **P** (present),
//! - **L** (64-bit code enable for CS),
//! - **DB** (must be 0 for 64-bit code segments).
//!
//! [`SegmentDescriptor`] wraps one bitfield view for both classes and decodes
//! it back into the properties the privilege checks look at.

use crate::privilege::Dpl;
use bitfield_struct::bitfield;

/// Type nibble of an execute/read code segment.
const TYPE_CODE_EXEC_READ: u8 = 0b1010;
/// Type nibble of a read/write data segment.
const TYPE_DATA_READ_WRITE: u8 = 0b0010;
/// Bit 3 of the type nibble selects code (1) or data (0).
const TYPE_CODE_BIT: u8 = 0b1000;
/// Bit 1 of the type nibble: readable (code) or writable (data).
const TYPE_RW_BIT: u8 = 0b0010;

/// Bit layout shared by code and data segment descriptors.
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct SegmentDescriptorBits {
    pub limit_lo: u16, // [15:0]   (ignored in long mode)
    pub base_lo: u16,  // [31:16]  (ignored in long mode)
    pub base_mid: u8,  // [39:32]
    #[bits(4)]
    pub typ: u8, // [43:40]  0b1010 code, 0b0010 data
    pub s: bool,       // [44]     = 1 (code/data)
    #[bits(2)]
    pub dpl: u8, // [46:45]  = 0 or 3
    pub p: bool,       // [47]
    #[bits(4)]
    pub limit_hi: u8, // [51:48]
    pub avl: bool,     // [52]
    pub l: bool,       // [53]     = 1 for 64-bit code
    pub db: bool,      // [54]     = 0 when L=1
    pub g: bool,       // [55]
    pub base_hi: u8,   // [63:56]
}

/// What a code/data descriptor describes.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SegmentKind {
    /// 64-bit execute/read code (`L=1`).
    Code,
    /// Read/write data, also usable as a stack segment.
    Data,
}

/// One 8-byte GDT code or data entry.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct SegmentDescriptor(SegmentDescriptorBits);

impl SegmentDescriptor {
    /// The null descriptor at GDT index 0.
    pub const NULL: Self = Self(SegmentDescriptorBits::new());

    /// Build a present descriptor.
    ///
    /// `limit` is a 20-bit byte-granular value; higher bits are dropped.
    /// Code descriptors are always 64-bit (`L=1`, `DB=0`).
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new(base: u32, limit: u32, kind: SegmentKind, dpl: Dpl) -> Self {
        let (typ, long) = match kind {
            SegmentKind::Code => (TYPE_CODE_EXEC_READ, true),
            SegmentKind::Data => (TYPE_DATA_READ_WRITE, false),
        };
        Self(
            SegmentDescriptorBits::new()
                .with_limit_lo((limit & 0xFFFF) as u16)
                .with_base_lo((base & 0xFFFF) as u16)
                .with_base_mid(((base >> 16) & 0xFF) as u8)
                .with_typ(typ)
                .with_s(true)
                .with_dpl(dpl.into_bits())
                .with_p(true)
                .with_limit_hi(((limit >> 16) & 0xF) as u8)
                .with_avl(false)
                .with_l(long)
                .with_db(false)
                .with_g(false)
                .with_base_hi(((base >> 24) & 0xFF) as u8),
        )
    }

    /// 64-bit code segment, flat.
    #[must_use]
    pub const fn code64(dpl: Dpl) -> Self {
        Self::new(0, 0, SegmentKind::Code, dpl)
    }

    /// Data/stack segment, flat.
    #[must_use]
    pub const fn data(dpl: Dpl) -> Self {
        Self::new(0, 0, SegmentKind::Data, dpl)
    }

    /// Same descriptor with the present bit replaced.
    #[must_use]
    pub const fn with_present(self, present: bool) -> Self {
        Self(self.0.with_p(present))
    }

    #[inline]
    #[must_use]
    pub const fn into_bits(self) -> u64 {
        self.0.into_bits()
    }

    #[inline]
    #[must_use]
    pub const fn from_bits(raw: u64) -> Self {
        Self(SegmentDescriptorBits::from_bits(raw))
    }

    #[inline]
    #[must_use]
    pub const fn bits(self) -> SegmentDescriptorBits {
        self.0
    }

    /// `None` for the null descriptor and for system descriptors.
    #[must_use]
    pub const fn kind(self) -> Option<SegmentKind> {
        if !self.0.s() {
            return None;
        }
        if self.0.typ() & TYPE_CODE_BIT != 0 {
            Some(SegmentKind::Code)
        } else {
            Some(SegmentKind::Data)
        }
    }

    /// `None` if the descriptor carries DPL 1 or 2.
    #[inline]
    #[must_use]
    pub const fn dpl(self) -> Option<Dpl> {
        Dpl::from_bits(self.0.dpl())
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0.p()
    }

    /// 64-bit code segment; presence is checked separately.
    #[must_use]
    pub const fn is_long_code(self) -> bool {
        matches!(self.kind(), Some(SegmentKind::Code)) && self.0.l() && !self.0.db()
    }

    /// Data segment with the write bit set, i.e. loadable into SS.
    #[must_use]
    pub const fn is_writable_data(self) -> bool {
        matches!(self.kind(), Some(SegmentKind::Data)) && self.0.typ() & TYPE_RW_BIT != 0
    }

    #[must_use]
    pub const fn base(self) -> u32 {
        (self.0.base_lo() as u32)
            | ((self.0.base_mid() as u32) << 16)
            | ((self.0.base_hi() as u32) << 24)
    }

    #[must_use]
    pub const fn limit(self) -> u32 {
        (self.0.limit_lo() as u32) | ((self.0.limit_hi() as u32) << 16)
    }
}

impl core::fmt::Debug for SegmentDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SegmentDescriptor")
            .field("kind", &self.kind())
            .field("dpl", &self.0.dpl())
            .field("present", &self.is_present())
            .field("long", &self.0.l())
            .finish()
    }
}

const _: () = {
    assert!(size_of::<SegmentDescriptorBits>() == 8);
    assert!(size_of::<SegmentDescriptor>() == 8);
};
