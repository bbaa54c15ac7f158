use crate::address::VirtualAddress;
use bitfield_struct::bitfield;

/// System descriptor type for an available 64-bit TSS. `ltr` flips it to
/// busy (0xB), so each slot can be loaded exactly once.
pub const TSS_TYPE_AVAILABLE: u8 = 0x9;

/// Low 8 bytes of a 64-bit *Available TSS* descriptor (type = 0x9, S=0).
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct TssDescLow {
    pub limit_lo: u16, // [15:0]
    pub base_lo: u16,  // [31:16]

    pub base_mid: u8, // [39:32]
    #[bits(4)]
    pub typ: u8, // [43:40] = 0x9 (Available 64-bit TSS)
    pub s: bool,      // [44]    = 0 (system)
    #[bits(2)]
    pub dpl: u8, // [46:45] 0
    pub p: bool,      // [47]    = 1

    #[bits(4)]
    pub limit_hi: u8, // [51:48]
    pub avl: bool,   // [52]    = 0
    pub zero1: bool, // [53]    = 0 (must be 0 for system types)
    pub zero2: bool, // [54]    = 0 (must be 0 for system types)
    pub g: bool,     // [55] granularity (byte)
    pub base_hi: u8, // [63:56]
}

/// High 8 bytes of a 64-bit TSS descriptor: `base[63:32]`, reserved=0.
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct TssDescHigh {
    pub base_upper: u32, // [31:0]  base[63:32]
    __reserved: u32, // [63:32] must be 0
}

/// 16-byte TSS system descriptor (two consecutive GDT entries).
#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct TssDesc64 {
    pub low: TssDescLow,
    pub high: TssDescHigh,
}

impl TssDesc64 {
    /// An empty, non-present slot. Loading it with `ltr` raises `#NP`.
    pub const EMPTY: Self = Self {
        low: TssDescLow::new(),
        high: TssDescHigh::new(),
    };

    /// Build a 64-bit *Available TSS* descriptor (type 0x9).
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new(tss_base: VirtualAddress, tss_limit: u32) -> Self {
        let base = tss_base.as_u64();
        // System descriptor, DPL 0, byte granularity; the rest stays zero.
        Self {
            low: TssDescLow::new()
                .with_limit_lo(tss_limit as u16)
                .with_limit_hi((tss_limit >> 16) as u8 & 0xF)
                .with_base_lo(base as u16)
                .with_base_mid((base >> 16) as u8)
                .with_base_hi((base >> 24) as u8)
                .with_typ(TSS_TYPE_AVAILABLE)
                .with_p(true),
            high: TssDescHigh::new().with_base_upper((base >> 32) as u32),
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_present(&self) -> bool {
        self.low.p()
    }

    /// Reassembled 64-bit base address.
    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        let base = (self.low.base_lo() as u64)
            | ((self.low.base_mid() as u64) << 16)
            | ((self.low.base_hi() as u64) << 24)
            | ((self.high.base_upper() as u64) << 32);
        VirtualAddress::new(base)
    }

    #[must_use]
    pub const fn limit(&self) -> u32 {
        (self.low.limit_lo() as u32) | ((self.low.limit_hi() as u32) << 16)
    }
}

const _: () = {
    assert!(size_of::<TssDescLow>() == 8);
    assert!(size_of::<TssDescHigh>() == 8);
    assert!(size_of::<TssDesc64>() == 16);
};
