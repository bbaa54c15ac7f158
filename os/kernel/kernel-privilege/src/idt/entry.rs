use crate::address::VirtualAddress;
use crate::gdt::selectors::{CodeSel, SegmentSelector};
use crate::idt::Ist;
use crate::privilege::Dpl;
use bitfield_struct::bitfield;

const _: () = assert!(size_of::<IdtEntry>() == 16);
const _: () = assert!(size_of::<IdtGateAttr>() == 2);

/// System type nibble of a 64-bit interrupt gate.
const TYPE_INTERRUPT_GATE: u8 = 0xE;
/// System type nibble of a 64-bit trap gate.
const TYPE_TRAP_GATE: u8 = 0xF;

/// Two bytes of an IDT entry that pack:
///
/// - **low byte**: `IST` (3 bits) + 5 reserved zero bits
/// - **high byte**: `| P | DPL(2) | S(0) | Type(4) |`
#[bitfield(u16)]
#[derive(Eq, PartialEq)]
pub struct IdtGateAttr {
    /// **IST** – Interrupt Stack Table index (0 disables IST switching).
    #[bits(3)]
    pub ist: u8,

    /// Must be zero (hardware-reserved).
    #[bits(5)]
    __zero0: u8,

    /// **Type** – 0xE = *Interrupt gate*, 0xF = *Trap gate*.
    #[bits(4)]
    pub typ: u8,

    /// **S** – System bit (must be `0` for interrupt/trap gates).
    pub s: bool,

    /// **DPL** – the least privileged ring allowed to raise this vector with
    /// `int n`. Hardware interrupts and exceptions ignore it.
    #[bits(2)]
    pub dpl: u8,

    /// **P** – Present bit. A non-present gate raises `#NP` on delivery.
    pub present: bool,
}

impl IdtGateAttr {
    #[inline]
    #[must_use]
    pub const fn interrupt_gate() -> Self {
        Self::new().with_typ(TYPE_INTERRUPT_GATE).with_s(false)
    }

    #[inline]
    #[must_use]
    pub const fn trap_gate() -> Self {
        Self::new().with_typ(TYPE_TRAP_GATE).with_s(false)
    }
}

/// Gate kinds supported by this IDT.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum GateType {
    /// Masks further maskable interrupts upon entry (clears `IF`).
    InterruptGate,
    /// Leaves `IF` unchanged.
    TrapGate,
}

/// One **16-byte** x86-64 IDT gate descriptor.
///
/// ```text
/// bytes 0..2   offset[15:0]
/// bytes 2..4   code segment selector
/// bytes 4..6   IST | type | S | DPL | P      (IdtGateAttr)
/// bytes 6..8   offset[31:16]
/// bytes 8..12  offset[63:32]
/// bytes 12..16 reserved, zero
/// ```
#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct IdtEntry {
    offset_lo: u16,
    selector: u16,
    attr: IdtGateAttr,
    offset_mid: u16,
    offset_hi: u32,
    zero: u32,
}

impl IdtEntry {
    /// A zeroed, non-present, DPL0 entry.
    pub const MISSING: Self = Self {
        offset_lo: 0,
        selector: 0,
        attr: IdtGateAttr::new(),
        offset_mid: 0,
        offset_hi: 0,
        zero: 0,
    };

    /// A present 64-bit interrupt gate without IST.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new(handler: VirtualAddress, selector: SegmentSelector<CodeSel>, dpl: Dpl) -> Self {
        let addr = handler.as_u64();
        Self {
            offset_lo: (addr & 0xFFFF) as u16,
            selector: selector.encode(),
            attr: IdtGateAttr::interrupt_gate()
                .with_dpl(dpl.into_bits())
                .with_ist(0)
                .with_present(true),
            offset_mid: ((addr >> 16) & 0xFFFF) as u16,
            offset_hi: (addr >> 32) as u32,
            zero: 0,
        }
    }

    #[must_use]
    pub const fn with_gate_type(mut self, gate_type: GateType) -> Self {
        let typ = match gate_type {
            GateType::InterruptGate => TYPE_INTERRUPT_GATE,
            GateType::TrapGate => TYPE_TRAP_GATE,
        };
        self.attr = self.attr.with_typ(typ).with_s(false);
        self
    }

    #[must_use]
    pub const fn with_ist(mut self, ist: Ist) -> Self {
        self.attr = self.attr.with_ist(ist.into_bits());
        self
    }

    #[must_use]
    pub const fn with_dpl(mut self, dpl: Dpl) -> Self {
        self.attr = self.attr.with_dpl(dpl.into_bits());
        self
    }

    #[must_use]
    pub const fn with_present(mut self, present: bool) -> Self {
        self.attr = self.attr.with_present(present);
        self
    }

    #[must_use]
    pub const fn handler(&self) -> VirtualAddress {
        VirtualAddress::new(
            (self.offset_lo as u64) | ((self.offset_mid as u64) << 16) | ((self.offset_hi as u64) << 32),
        )
    }

    /// Raw code selector the handler runs with.
    #[must_use]
    pub const fn selector(&self) -> u16 {
        self.selector
    }

    #[must_use]
    pub const fn attr(&self) -> IdtGateAttr {
        self.attr
    }

    #[must_use]
    pub const fn is_present(&self) -> bool {
        self.attr.present()
    }

    /// Gate DPL. Levels 1 and 2 are never written and would deny ring 3
    /// exactly like DPL 0, so they read back as [`Dpl::Ring0`].
    #[must_use]
    pub const fn dpl(&self) -> Dpl {
        match Dpl::from_bits(self.attr.dpl()) {
            Some(dpl) => dpl,
            None => Dpl::Ring0,
        }
    }

    /// `None` if the type nibble is neither a 64-bit interrupt nor trap gate.
    #[must_use]
    pub const fn gate_type(&self) -> Option<GateType> {
        if self.attr.s() {
            return None;
        }
        match self.attr.typ() {
            TYPE_INTERRUPT_GATE => Some(GateType::InterruptGate),
            TYPE_TRAP_GATE => Some(GateType::TrapGate),
            _ => None,
        }
    }

    #[must_use]
    pub const fn ist(&self) -> Ist {
        Ist::from_bits(self.attr.ist())
    }
}

impl core::fmt::Debug for IdtEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IdtEntry")
            .field("handler", &self.handler())
            .field("selector", &format_args!("{:#06x}", self.selector))
            .field("type", &self.gate_type())
            .field("dpl", &self.dpl())
            .field("ist", &self.ist())
            .field("present", &self.is_present())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gdt::KERNEL_CS_SEL;

    #[test]
    fn handler_offset_is_split_and_rejoined() {
        let handler = VirtualAddress::new(0xFFFF_8000_DEAD_BEEF);
        let e = IdtEntry::new(handler, KERNEL_CS_SEL, Dpl::Ring3);
        assert_eq!(e.handler(), handler);
        assert_eq!(e.selector(), 0x08);
        assert_eq!(e.dpl(), Dpl::Ring3);
        assert_eq!(e.gate_type(), Some(GateType::InterruptGate));
        assert_eq!(e.ist(), Ist::None);
        assert!(e.is_present());
    }

    #[test]
    fn attribute_word_encoding() {
        let handler = VirtualAddress::new(0x1000);
        let e = IdtEntry::new(handler, KERNEL_CS_SEL, Dpl::Ring0);
        assert_eq!(e.attr().into_bits(), 0x8E00);
        let e = e.with_dpl(Dpl::Ring3).with_gate_type(GateType::TrapGate).with_ist(Ist::Ist1);
        assert_eq!(e.attr().into_bits(), 0xEF01);
    }

    #[test]
    fn missing_entry_is_inert() {
        let e = IdtEntry::MISSING;
        assert!(!e.is_present());
        assert_eq!(e.dpl(), Dpl::Ring0);
        assert_eq!(e.handler(), VirtualAddress::zero());
    }

    #[test]
    fn debug_shows_decoded_fields() {
        let e = IdtEntry::new(VirtualAddress::new(0x1000), KERNEL_CS_SEL, Dpl::Ring3);
        let text = format!("{e:?}");
        assert!(text.starts_with("IdtEntry {"), "{text}");
        assert!(text.contains("selector: 0x0008"), "{text}");
        assert!(text.contains("dpl: Ring3"), "{text}");
        assert!(text.ends_with(", .. }"), "{text}");
    }
}
