//! # x86-64 Interrupt Descriptor Table (IDT)
//!
//! The **IDT** tells the CPU which handler to call for each **interrupt**,
//! **exception**, or **software trap**: 256 gate descriptors of 16 bytes each,
//! located through the **IDTR** (`lidt`).
//!
//! ## Acronyms
//! - **IDT** – *Interrupt Descriptor Table*
//! - **DPL** – *Descriptor Privilege Level* (0=kernel … 3=user)
//! - **IST** – *Interrupt Stack Table* (per-entry alternate stack from the TSS)
//! - **TSS** – *Task State Segment* (holds `rsp0` and up to 7 IST pointers)
//!
//! ## How the IDT relates to the GDT/TSS
//! On a Ring-3 → Ring-0 transition through a gate, the CPU loads the stack
//! pointer from the TSS (`rsp0`), or from `istN` when the gate names an IST
//! slot. Load the GDT and TSS first, then `lidt`, then enable interrupts.
//!
//! A gate's DPL only governs `int n` / `int3` / `into` executed by software.
//! Every table built by [`crate::gate::IdtBuilder`] starts with DPL 0
//! everywhere; only the vectors listed in its [`crate::gate::GatePolicy`] are
//! reachable from user mode.

mod entry;
mod ist;

pub use entry::{GateType, IdtEntry, IdtGateAttr};
pub use ist::Ist;

use core::ops::Index;

const _: () = assert!(size_of::<Idt>() == 256 * 16);
const _: () = assert!(align_of::<Idt>() == 16);

/// Number of interrupt vectors.
pub const VECTORS: usize = 256;

/// A 256-entry **Interrupt Descriptor Table**.
///
/// Entries are only written by [`crate::gate::IdtBuilder`] and, after install,
/// by [`crate::tables::patch_gate`].
#[repr(C, align(16))]
#[derive(Clone)]
pub struct Idt {
    entries: [IdtEntry; VECTORS],
}

impl Default for Idt {
    fn default() -> Self {
        Self::new()
    }
}

impl Idt {
    /// All gates **not present**, DPL 0.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [IdtEntry::MISSING; VECTORS],
        }
    }

    #[inline]
    #[must_use]
    pub const fn entry(&self, vector: u8) -> &IdtEntry {
        &self.entries[vector as usize]
    }

    #[inline]
    pub(crate) const fn set(&mut self, vector: u8, entry: IdtEntry) {
        self.entries[vector as usize] = entry;
    }

    /// Raw slot pointer for in-place patching of a published table.
    ///
    /// # Safety
    /// `this` must point to a live `Idt`.
    #[inline]
    pub(crate) const unsafe fn entry_ptr(this: *mut Self, vector: u8) -> *mut IdtEntry {
        unsafe { (&raw mut (*this).entries).cast::<IdtEntry>().add(vector as usize) }
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &IdtEntry)> {
        (0..=u8::MAX).zip(self.entries.iter())
    }

    /// Every vector a ring-3 `int n` can reach: present gates with DPL 3.
    pub fn user_invocable(&self) -> impl Iterator<Item = u8> + '_ {
        self.iter()
            .filter(|(_, e)| e.is_present() && e.dpl() == crate::privilege::Dpl::Ring3)
            .map(|(v, _)| v)
    }

    /// `lidt` limit: size of the table minus one.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn limit(&self) -> u16 {
        (size_of::<Self>() - 1) as u16
    }
}

impl Index<u8> for Idt {
    type Output = IdtEntry;

    fn index(&self, vector: u8) -> &Self::Output {
        self.entry(vector)
    }
}
