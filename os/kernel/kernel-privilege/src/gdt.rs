//! # Global Descriptor Table (GDT) for long mode
//!
//! In 64-bit mode classic segmentation for code/data is largely disabled, but
//! **segment selectors still matter**:
//!
//! - They distinguish **code vs. data/stack** segments.
//! - They carry the **Descriptor Privilege Level (DPL)** used by the CPU to
//!   enforce privilege transitions (Ring-0 ↔ Ring-3).
//! - They locate each core's **Task State Segment (TSS)** through a **16-byte
//!   system descriptor** so the CPU can fetch `rsp0` and IST stacks.
//!
//! ## Layout
//! Index | Selector | Meaning
//! ------|----------|--------
//! 0     | 0x00     | Null (never loaded)
//! 1     | 0x08     | Kernel code (64-bit, DPL=0; [`KERNEL_CS_SEL`])
//! 2     | 0x10     | Kernel data (DPL=0; [`KERNEL_DS_SEL`])
//! 3     | 0x18     | User   code (64-bit, DPL=3) → with RPL=3: **0x1b** ([`USER_CS_SEL`])
//! 4     | 0x20     | User   data (DPL=3)         → with RPL=3: **0x23** ([`USER_DS_SEL`])
//! 5+2n  | 0x28+16n | TSS of core `n` (16-byte system descriptor)
//!
//! The table is built once with all TSS slots filled, installed through
//! [`crate::tables::install`], and shared read-only by every core. Each core
//! loads it with `lgdt` and then points its task register at its own slot.

pub mod descriptors;
pub mod selectors;
pub mod tss_desc;

use crate::address::VirtualAddress;
use crate::gdt::descriptors::SegmentDescriptor;
use crate::gdt::selectors::{CodeSel, DataSel, SegmentSelector, TssSel};
use crate::gdt::tss_desc::TssDesc64;
use crate::layout::MAX_CPUS;
use crate::privilege::{Dpl, Rpl};
use crate::tss::{TaskState, Tss64};

pub const KERNEL_CODE_INDEX: u16 = 1;
pub const KERNEL_DATA_INDEX: u16 = 2;
pub const USER_CODE_INDEX: u16 = 3;
pub const USER_DATA_INDEX: u16 = 4;
/// Index of core 0's TSS descriptor; each further core adds two entries.
pub const FIRST_TSS_INDEX: u16 = 5;

pub const KERNEL_CS_SEL: SegmentSelector<CodeSel> =
    SegmentSelector::<CodeSel>::new(KERNEL_CODE_INDEX, Rpl::Ring0);
pub const KERNEL_DS_SEL: SegmentSelector<DataSel> =
    SegmentSelector::<DataSel>::new(KERNEL_DATA_INDEX, Rpl::Ring0);
pub const USER_CS_SEL: SegmentSelector<CodeSel> =
    SegmentSelector::<CodeSel>::new(USER_CODE_INDEX, Rpl::Ring3);
pub const USER_DS_SEL: SegmentSelector<DataSel> =
    SegmentSelector::<DataSel>::new(USER_DATA_INDEX, Rpl::Ring3);
pub const TSS_SYS_SEL: SegmentSelector<TssSel> = SegmentSelector::<TssSel>::new(FIRST_TSS_INDEX);

// Encoded selector numbers as `u16` (what the CPU actually loads).
pub const KERNEL_CS: u16 = KERNEL_CS_SEL.encode(); // 0x08
pub const KERNEL_DS: u16 = KERNEL_DS_SEL.encode(); // 0x10
pub const USER_CS: u16 = USER_CS_SEL.encode(); // 0x1b
pub const USER_DS: u16 = USER_DS_SEL.encode(); // 0x23
pub const TSS_SEL: u16 = TSS_SYS_SEL.encode(); // 0x28

#[allow(clippy::items_after_statements)]
const _: () = {
    assert!(KERNEL_CS == 0x08);
    assert!(KERNEL_DS == 0x10);
    assert!(USER_CS == 0x1b);
    assert!(USER_DS == 0x23);
    assert!(TSS_SEL == 0x28);

    // Encoding formula: (index << 3) | (TI=0) | RPL
    const fn enc(index: u16, rpl: u16) -> u16 {
        (index << 3) | rpl
    }

    assert!(KERNEL_CS == enc(1, 0));
    assert!(KERNEL_DS == enc(2, 0));
    assert!(USER_CS == enc(3, 3));
    assert!(USER_DS == enc(4, 3));
    assert!(TSS_SEL == enc(5, 0));

    assert!(size_of::<Gdt<1>>() == 5 * 8 + 16);
    assert!(size_of::<Gdt<MAX_CPUS>>() == 5 * 8 + 16 * MAX_CPUS);
};

/// The four loadable segment slots of the table.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SegmentSlot {
    KernelCode,
    KernelData,
    UserCode,
    UserData,
}

impl SegmentSlot {
    #[must_use]
    pub const fn index(self) -> u16 {
        match self {
            Self::KernelCode => KERNEL_CODE_INDEX,
            Self::KernelData => KERNEL_DATA_INDEX,
            Self::UserCode => USER_CODE_INDEX,
            Self::UserData => USER_DATA_INDEX,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum GdtError {
    #[error("no TSS slot for cpu {cpu}; the table holds {slots}")]
    NoTssSlot { cpu: usize, slots: usize },
    #[error("TSS descriptor of cpu {cpu} does not describe its task state")]
    TssMismatch { cpu: usize },
}

/// GDT index of the TSS descriptor belonging to `cpu`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn tss_index(cpu: usize) -> u16 {
    FIRST_TSS_INDEX + 2 * (cpu as u16)
}

/// The complete GDT shared by all cores.
///
/// Each TSS occupies two consecutive entries (a 16-byte system descriptor).
#[repr(C)]
#[derive(Clone)]
pub struct Gdt<const CPUS: usize = MAX_CPUS> {
    /// Null descriptor (must be present at index 0).
    null: SegmentDescriptor, // 0
    kcode: SegmentDescriptor, // 1
    kdata: SegmentDescriptor, // 2
    ucode: SegmentDescriptor, // 3
    udata: SegmentDescriptor, // 4
    tss: [TssDesc64; CPUS], // 5 + 2n
}

impl<const CPUS: usize> Default for Gdt<CPUS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const CPUS: usize> Gdt<CPUS> {
    /// Canonical layout with every TSS slot still empty.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            null: SegmentDescriptor::NULL,
            kcode: SegmentDescriptor::code64(Dpl::Ring0),
            kdata: SegmentDescriptor::data(Dpl::Ring0),
            ucode: SegmentDescriptor::code64(Dpl::Ring3),
            udata: SegmentDescriptor::data(Dpl::Ring3),
            tss: [TssDesc64::EMPTY; CPUS],
        }
    }

    /// Fill the TSS slot of `cpu`.
    ///
    /// # Errors
    /// [`GdtError::NoTssSlot`] if `cpu` is outside the table.
    pub const fn with_tss(
        mut self,
        cpu: usize,
        base: VirtualAddress,
        limit: u32,
    ) -> Result<Self, GdtError> {
        if cpu >= CPUS {
            return Err(GdtError::NoTssSlot { cpu, slots: CPUS });
        }
        self.tss[cpu] = TssDesc64::new(base, limit);
        Ok(self)
    }

    /// Replace one of the loadable segments, e.g. to mark it not present.
    #[must_use]
    pub const fn with_segment(mut self, slot: SegmentSlot, descriptor: SegmentDescriptor) -> Self {
        match slot {
            SegmentSlot::KernelCode => self.kcode = descriptor,
            SegmentSlot::KernelData => self.kdata = descriptor,
            SegmentSlot::UserCode => self.ucode = descriptor,
            SegmentSlot::UserData => self.udata = descriptor,
        }
        self
    }

    /// Decode a code/data entry. `None` for TSS entries and indices past the
    /// end of the table.
    #[must_use]
    pub const fn descriptor(&self, index: u16) -> Option<SegmentDescriptor> {
        match index {
            0 => Some(self.null),
            KERNEL_CODE_INDEX => Some(self.kcode),
            KERNEL_DATA_INDEX => Some(self.kdata),
            USER_CODE_INDEX => Some(self.ucode),
            USER_DATA_INDEX => Some(self.udata),
            _ => None,
        }
    }

    #[must_use]
    pub const fn tss_descriptor(&self, cpu: usize) -> Option<&TssDesc64> {
        if cpu < CPUS {
            Some(&self.tss[cpu])
        } else {
            None
        }
    }

    /// Selector for `ltr` on `cpu`.
    #[must_use]
    pub const fn tss_selector(&self, cpu: usize) -> Option<SegmentSelector<TssSel>> {
        if cpu < CPUS {
            Some(SegmentSelector::<TssSel>::new(tss_index(cpu)))
        } else {
            None
        }
    }

    /// Selector to load into TR for `task`, after checking that the slot of
    /// its core describes exactly that task state.
    ///
    /// # Errors
    /// - [`GdtError::NoTssSlot`] if the core has no slot,
    /// - [`GdtError::TssMismatch`] if the slot is empty or points elsewhere.
    pub fn tss_selector_for(&self, task: &TaskState) -> Result<SegmentSelector<TssSel>, GdtError> {
        let cpu = task.cpu();
        let (Some(desc), Some(selector)) = (self.tss_descriptor(cpu), self.tss_selector(cpu)) else {
            return Err(GdtError::NoTssSlot { cpu, slots: CPUS });
        };
        if !desc.is_present() || desc.base() != task.base() || desc.limit() != Tss64::LIMIT {
            return Err(GdtError::TssMismatch { cpu });
        }
        Ok(selector)
    }

    /// Number of 8-byte entries.
    #[must_use]
    pub const fn entries(&self) -> usize {
        5 + 2 * CPUS
    }

    /// `lgdt` limit: last byte of the last descriptor.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn limit(&self) -> u16 {
        (self.entries() * 8 - 1) as u16
    }
}

/// Canonical GDT for [`MAX_CPUS`] cores with empty TSS slots.
#[must_use]
pub const fn build_gdt() -> Gdt {
    Gdt::new()
}
