//! # Software gate policy
//!
//! Deny by default: every vector [`IdtBuilder`] installs gets DPL 0, so a
//! ring-3 `int n` on it raises `#GP` before any handler runs. A vector becomes
//! reachable from user mode only through [`IdtBuilder::configure_software_gate`],
//! and every such promotion is recorded in the builder's [`GatePolicy`], the
//! single place to audit what user code can invoke.
//!
//! ```
//! use kernel_privilege::address::VirtualAddress;
//! use kernel_privilege::gate::IdtBuilder;
//! use kernel_privilege::gdt::KERNEL_CS_SEL;
//! use kernel_privilege::privilege::Dpl;
//!
//! let syscall_entry = VirtualAddress::new(0xFFFF_8000_0010_0000);
//! let idt = IdtBuilder::new()
//!     .configure_software_gate(0x80, syscall_entry, KERNEL_CS_SEL, Dpl::Ring3)
//!     .expect("valid gate")
//!     .build();
//! assert_eq!(idt.user_invocable().collect::<Vec<_>>(), [0x80]);
//! ```

use crate::address::VirtualAddress;
use crate::gdt::selectors::{CodeSel, SegmentSelector};
use crate::gdt::{KERNEL_CODE_INDEX, KERNEL_CS_SEL};
use crate::idt::{GateType, Idt, IdtEntry, Ist, VECTORS};
use crate::layout::SYSCALL_VECTOR;
use crate::privilege::{Dpl, Rpl};
use log::debug;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum GateError {
    #[error("gate {vector:#04x}: selector {selector:#06x} is not the ring-0 code segment")]
    HandlerNotKernelCode { vector: u8, selector: u16 },
    #[error("gate {vector:#04x}: handler address {handler} is null or not canonical")]
    InvalidHandler { vector: u8, handler: VirtualAddress },
    #[error("gate {vector:#04x} has already been configured")]
    AlreadyConfigured { vector: u8 },
}

/// One `{vector → DPL}` entry of the whitelist.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct GateGrant {
    pub vector: u8,
    pub dpl: Dpl,
}

/// Vectors user mode may raise with `int n` unless a kernel opts otherwise.
pub const DEFAULT_SOFTWARE_GATES: [GateGrant; 1] = [GateGrant {
    vector: SYSCALL_VECTOR,
    dpl: Dpl::Ring3,
}];

/// A whitelisted vector together with its handler.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SoftwareGate {
    pub vector: u8,
    pub handler: VirtualAddress,
    pub dpl: Dpl,
}

impl SoftwareGate {
    #[must_use]
    pub const fn from_grant(grant: GateGrant, handler: VirtualAddress) -> Self {
        Self {
            vector: grant.vector,
            handler,
            dpl: grant.dpl,
        }
    }
}

/// The explicit override list: every vector whose DPL was set through
/// [`IdtBuilder::configure_software_gate`].
#[derive(Clone, Eq, PartialEq)]
pub struct GatePolicy {
    overrides: [Option<Dpl>; VECTORS],
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl GatePolicy {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            overrides: [None; VECTORS],
        }
    }

    /// The DPL a gate for `vector` gets: its override, otherwise 0.
    #[must_use]
    pub const fn dpl_for(&self, vector: u8) -> Dpl {
        match self.overrides[vector as usize] {
            Some(dpl) => dpl,
            None => Dpl::Ring0,
        }
    }

    #[must_use]
    pub const fn is_configured(&self, vector: u8) -> bool {
        self.overrides[vector as usize].is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = GateGrant> + '_ {
        (0..=u8::MAX)
            .zip(self.overrides.iter())
            .filter_map(|(vector, dpl)| dpl.map(|dpl| GateGrant { vector, dpl }))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.overrides.iter().filter(|o| o.is_some()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    const fn record(&mut self, vector: u8, dpl: Dpl) {
        self.overrides[vector as usize] = Some(dpl);
    }
}

impl core::fmt::Debug for GatePolicy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

fn check_handler(vector: u8, handler: VirtualAddress) -> Result<(), GateError> {
    if handler.is_null() || !handler.is_canonical() {
        return Err(GateError::InvalidHandler { vector, handler });
    }
    Ok(())
}

/// Builds an [`Idt`] in which every gate is DPL 0 unless promoted explicitly.
#[derive(Clone, Default)]
pub struct IdtBuilder {
    idt: Idt,
    policy: GatePolicy,
}

impl IdtBuilder {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            idt: Idt::new(),
            policy: GatePolicy::new(),
        }
    }

    /// Install a kernel-only interrupt gate for `vector`.
    ///
    /// # Errors
    /// - [`GateError::InvalidHandler`] for a null or non-canonical handler,
    /// - [`GateError::AlreadyConfigured`] if `vector` was promoted already;
    ///   replacing it here would silently revoke the grant.
    pub fn handler(self, vector: u8, handler: VirtualAddress) -> Result<Self, GateError> {
        self.handler_with(vector, handler, GateType::InterruptGate, Ist::None)
    }

    /// Like [`handler`](Self::handler) with an explicit gate type and IST slot.
    ///
    /// # Errors
    /// See [`handler`](Self::handler).
    pub fn handler_with(
        mut self,
        vector: u8,
        handler: VirtualAddress,
        gate_type: GateType,
        ist: Ist,
    ) -> Result<Self, GateError> {
        check_handler(vector, handler)?;
        if self.policy.is_configured(vector) {
            return Err(GateError::AlreadyConfigured { vector });
        }
        let entry = IdtEntry::new(handler, KERNEL_CS_SEL, Dpl::Ring0)
            .with_gate_type(gate_type)
            .with_ist(ist);
        self.idt.set(vector, entry);
        Ok(self)
    }

    /// Make `vector` invocable by software at `dpl`.
    ///
    /// The handler always runs in the kernel code segment; only the gate's
    /// own DPL changes.
    ///
    /// # Errors
    /// - [`GateError::HandlerNotKernelCode`] unless `code_selector` is the
    ///   ring-0 code selector,
    /// - [`GateError::InvalidHandler`] for a null or non-canonical handler,
    /// - [`GateError::AlreadyConfigured`] on a second call for `vector`.
    pub fn configure_software_gate(
        mut self,
        vector: u8,
        handler: VirtualAddress,
        code_selector: SegmentSelector<CodeSel>,
        dpl: Dpl,
    ) -> Result<Self, GateError> {
        if code_selector.index() != KERNEL_CODE_INDEX || code_selector.rpl() != Rpl::Ring0 {
            return Err(GateError::HandlerNotKernelCode {
                vector,
                selector: code_selector.encode(),
            });
        }
        check_handler(vector, handler)?;
        if self.policy.is_configured(vector) {
            return Err(GateError::AlreadyConfigured { vector });
        }

        debug!("gate {vector:#04x}: software invocation allowed at {dpl:?}");
        self.idt.set(vector, IdtEntry::new(handler, code_selector, dpl));
        self.policy.record(vector, dpl);
        Ok(self)
    }

    /// Apply a whitelist entry.
    ///
    /// # Errors
    /// See [`configure_software_gate`](Self::configure_software_gate).
    pub fn software_gate(self, gate: SoftwareGate) -> Result<Self, GateError> {
        self.configure_software_gate(gate.vector, gate.handler, KERNEL_CS_SEL, gate.dpl)
    }

    #[must_use]
    pub const fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    #[must_use]
    pub fn build(self) -> Idt {
        self.idt
    }
}

/// Build an IDT with one kernel-only gate per `(vector, handler)` and the
/// given software gates on top.
///
/// # Errors
/// Any [`GateError`] raised while adding a gate.
pub fn build_idt(
    handlers: &[(u8, VirtualAddress)],
    gates: &[SoftwareGate],
) -> Result<Idt, GateError> {
    let mut builder = IdtBuilder::new();
    for &(vector, handler) in handlers {
        builder = builder.handler(vector, handler)?;
    }
    for &gate in gates {
        builder = builder.software_gate(gate)?;
    }
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gdt::{USER_CS_SEL, USER_CODE_INDEX};

    const H: VirtualAddress = VirtualAddress::new(0xFFFF_8000_0000_2000);

    #[test]
    fn handlers_default_to_dpl0() {
        let idt = build_idt(&[(0x20, H), (0x81, H), (0x0E, H)], &[]).expect("valid");
        assert_eq!(idt.entry(0x81).dpl(), Dpl::Ring0);
        assert!(idt.entry(0x81).is_present());
        assert!(!idt.entry(0x82).is_present());
        assert_eq!(idt.user_invocable().count(), 0);
    }

    #[test]
    fn user_code_selector_is_refused() {
        let err = IdtBuilder::new()
            .configure_software_gate(0x80, H, USER_CS_SEL, Dpl::Ring3)
            .err();
        assert_eq!(
            err,
            Some(GateError::HandlerNotKernelCode {
                vector: 0x80,
                selector: 0x1B
            })
        );

        let ring0_user_index = SegmentSelector::<CodeSel>::new(USER_CODE_INDEX, Rpl::Ring0);
        assert!(
            IdtBuilder::new()
                .configure_software_gate(0x80, H, ring0_user_index, Dpl::Ring3)
                .is_err()
        );
    }

    #[test]
    fn null_and_noncanonical_handlers_are_refused() {
        assert!(matches!(
            IdtBuilder::new().configure_software_gate(0x80, VirtualAddress::zero(), KERNEL_CS_SEL, Dpl::Ring3),
            Err(GateError::InvalidHandler { vector: 0x80, .. })
        ));
        assert!(matches!(
            IdtBuilder::new().handler(0x20, VirtualAddress::new(0x0000_8000_0000_0000)),
            Err(GateError::InvalidHandler { vector: 0x20, .. })
        ));
    }

    #[test]
    fn second_configuration_is_refused() {
        let builder = IdtBuilder::new()
            .configure_software_gate(0x80, H, KERNEL_CS_SEL, Dpl::Ring3)
            .expect("first");
        assert_eq!(
            builder
                .clone()
                .configure_software_gate(0x80, H, KERNEL_CS_SEL, Dpl::Ring3)
                .err(),
            Some(GateError::AlreadyConfigured { vector: 0x80 })
        );
        assert_eq!(
            builder.handler(0x80, H).err(),
            Some(GateError::AlreadyConfigured { vector: 0x80 })
        );
    }

    #[test]
    fn policy_lists_exactly_the_overrides() {
        let gates = DEFAULT_SOFTWARE_GATES.map(|g| SoftwareGate::from_grant(g, H));
        let builder = IdtBuilder::new()
            .handler(0x0D, H)
            .and_then(|b| b.software_gate(gates[0]))
            .expect("valid");
        assert_eq!(builder.policy().len(), 1);
        assert_eq!(
            builder.policy().iter().collect::<Vec<_>>(),
            [GateGrant {
                vector: 0x80,
                dpl: Dpl::Ring3
            }]
        );
        assert_eq!(builder.policy().dpl_for(0x0D), Dpl::Ring0);

        let idt = builder.build();
        assert_eq!(idt.entry(0x80).selector(), 0x08);
        assert_eq!(idt.user_invocable().collect::<Vec<_>>(), [0x80]);
    }
}
