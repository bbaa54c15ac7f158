#[cfg(all(feature = "asm", target_arch = "x86_64"))]
use crate::LoadRegister;
use bitfield_struct::bitfield;

/// Architectural RFLAGS model for x86-64.
///
/// Bits that are architecturally fixed in 64-bit mode are read-only here and
/// carry their fixed value as default, so [`Rflags::new`] is always a legal
/// flags image. Use [`Rflags::normalized`] to force the fixed bits on a raw
/// value coming from an untrusted frame.
#[bitfield(u64, order = Lsb)]
#[derive(PartialEq, Eq)]
pub struct Rflags {
    /// Carry Flag
    pub cf_carry: bool, // 0

    /// Always 1 in 64-bit mode.
    #[bits(default = true, access = RO)]
    pub reserved_one: bool, // 1

    /// Parity Flag
    pub pf_parity: bool, // 2

    #[bits(access = RO)]
    pub reserved3: bool, // 3

    /// Adjust Flag
    pub af_adjust: bool, // 4

    #[bits(access = RO)]
    pub reserved5: bool, // 5

    /// Zero Flag
    pub zf_zero: bool, // 6

    /// Sign Flag
    pub sf_sign: bool, // 7

    /// Trap Flag
    pub tf_trap: bool, // 8

    /// Interrupt Enable Flag
    pub if_interrupt_enable: bool, // 9

    /// Direction Flag
    pub df_direction: bool, // 10

    /// Overflow Flag
    pub of_overflow: bool, // 11

    /// I/O Privilege Level (2 bits)
    #[bits(2)]
    pub iopl: u8, // 12–13

    /// Nested Task
    pub nt_nested: bool, // 14

    #[bits(access = RO)]
    pub reserved15: bool, // 15

    /// Resume Flag
    pub rf_resume: bool, // 16

    /// Virtual 8086 mode, must be 0 in 64-bit mode.
    pub vm_virtual_8086: bool, // 17

    /// Alignment Check
    pub ac_alignment_check: bool, // 18

    /// Virtual Interrupt Flag
    pub vif_virtual_interrupt: bool, // 19

    /// Virtual Interrupt Pending
    pub vip_virtual_interrupt_pending: bool, // 20

    /// ID Flag: allows toggling CPUID.
    pub id_cpuid: bool, // 21

    /// Reserved 22–63 (all zero)
    #[bits(42, access = RO)]
    pub reserved_high: u64,
}

impl Rflags {
    /// Bit 1; reads as one on every x86 processor.
    pub const RESERVED_ONE: u64 = 1 << 1;

    /// Bit 9, `IF`.
    pub const INTERRUPT_ENABLE: u64 = 1 << 9;

    /// Bits that read as zero in 64-bit mode (3, 5, 15, 22..=63).
    pub const RESERVED_ZERO: u64 = (1 << 3) | (1 << 5) | (1 << 15) | !((1 << 22) - 1);

    /// Raw encoding of [`Rflags::user_mode_entry`].
    pub const USER_MODE_ENTRY: u64 = Self::RESERVED_ONE | Self::INTERRUPT_ENABLE;

    /// The only flags image used to enter user mode: the fixed bit and `IF`,
    /// everything else clear (`0x202`).
    #[inline]
    #[must_use]
    pub const fn user_mode_entry() -> Self {
        Self::new().with_if_interrupt_enable(true)
    }

    /// Force the architecturally fixed bits of a raw value, as the processor
    /// does when it loads `RFLAGS` from a frame.
    #[inline]
    #[must_use]
    pub const fn normalized(raw: u64) -> Self {
        Self::from_bits((raw | Self::RESERVED_ONE) & !Self::RESERVED_ZERO)
    }

    /// Flags as the processor leaves them on entry to an interrupt or trap
    /// handler: `TF`, `NT`, `RF` and `VM` always cleared, `IF` cleared for
    /// interrupt gates only.
    #[inline]
    #[must_use]
    pub const fn on_gate_entry(self, clear_interrupt_enable: bool) -> Self {
        let flags = self
            .with_tf_trap(false)
            .with_nt_nested(false)
            .with_rf_resume(false)
            .with_vm_virtual_8086(false);
        if clear_interrupt_enable {
            flags.with_if_interrupt_enable(false)
        } else {
            flags
        }
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl LoadRegister for Rflags {
    #[inline]
    fn load() -> Self {
        let raw: u64;
        unsafe {
            core::arch::asm!("pushfq", "pop {}", out(reg) raw, options(nomem, preserves_flags));
        }
        Self::from_bits(raw)
    }
}
