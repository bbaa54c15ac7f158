//! # Processor model
//!
//! [`Machine`] replays the privilege checks one x86-64 core performs on
//! `iretq` and on interrupt delivery, against the same [`Gdt`], [`Idt`] and
//! [`TaskState`] the kernel loads and an [`AddressSpaceView`] of the paging
//! structures. It keeps no memory contents: pushed frames live on a bounded
//! frame stack next to the register state.
//!
//! The model assumes `CR0.WP`, `CR4.SMEP` and `CR4.SMAP` are set. Supervisor
//! writes honour read-only pages, and supervisor code never fetches from or
//! implicitly writes to user pages.
//!
//! Every state change is one assignment of [`CpuState`]. A check that fails
//! leaves the state as it was and delivers the resulting fault instead:
//!
//! ```text
//! event ──► gate checks ──► stack push ──► handler          Step::Entered
//!               │               │
//!               └──── fault ────┴──► fault handler          Step::Faulted
//!                                        │
//!                                        └─ fault ─► #DF    Step::Faulted
//!                                                     │
//!                                                     └─ fault ─► Step::Shutdown
//! ```

use crate::address::VirtualAddress;
use crate::fault::{
    DOUBLE_FAULT_VECTOR, Fault, PageFaultError, SelectorErrorCode, pushes_error_code,
};
use crate::frame::InterruptFrame;
use crate::gdt::descriptors::SegmentDescriptor;
use crate::gdt::selectors::{CodeSel, DataSel, SegmentSelector};
use crate::gdt::{Gdt, GdtError, KERNEL_CS, KERNEL_DS};
use crate::idt::{GateType, Idt};
use crate::layout::{MAX_CPUS, PAGE_SIZE, STACK_ALIGN};
use crate::privilege::{Dpl, RPL_MASK, Ring, Rpl};
use crate::stack::AddressSpaceView;
use crate::transition::UserEntry;
use crate::tss::TaskState;
use kernel_registers::{CodeSegment, Rflags, StackSegment};
use log::{trace, warn};

/// Frames the model holds before it treats the kernel stack as exhausted.
pub const MAX_NESTING: usize = 16;

/// Architectural state touched by a transition.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct CpuState {
    pub rip: VirtualAddress,
    pub rsp: VirtualAddress,
    pub rflags: Rflags,
    pub cs: CodeSegment,
    pub ss: StackSegment,
}

impl CpuState {
    #[must_use]
    pub const fn cpl(&self) -> Ring {
        Ring::from_low_bits(self.cs.0)
    }

    /// The frame an event delivered now would push.
    #[must_use]
    pub const fn frame(&self) -> InterruptFrame {
        InterruptFrame::new(self.rip, self.cs.0, self.rflags, self.rsp, self.ss.0)
    }
}

/// Where an event comes from. Only software events are subject to the gate
/// DPL; only hardware interrupts are masked by `IF`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Source {
    /// `int n`, `int3`, `into`.
    Software,
    /// Device interrupt.
    Hardware,
    /// Processor exception.
    Exception,
}

/// A frame pushed by a successful delivery.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Delivery {
    pub vector: u8,
    pub source: Source,
    /// The interrupted context.
    pub frame: InterruptFrame,
    pub error_code: Option<u64>,
    /// Handler `rsp`: the error code if one was pushed, else the frame.
    pub stack_pointer: VirtualAddress,
}

/// Result of one step of the model.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Step {
    /// Execution continues in the current context.
    Resumed,
    /// The requested event's handler runs.
    Entered(Delivery),
    /// `fault` was raised instead and its handler runs.
    Faulted { fault: Fault, delivery: Delivery },
    /// A hardware interrupt arrived with `IF` clear and stays pending.
    Masked,
    /// Triple fault; the core no longer executes.
    Shutdown,
}

impl Step {
    #[must_use]
    pub const fn fault(&self) -> Option<Fault> {
        match self {
            Self::Faulted { fault, .. } => Some(*fault),
            Self::Shutdown => Some(Fault::TripleFault),
            _ => None,
        }
    }

    #[must_use]
    pub const fn delivery(&self) -> Option<&Delivery> {
        match self {
            Self::Entered(delivery) | Self::Faulted { delivery, .. } => Some(delivery),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Access {
    Write,
    Fetch,
}

/// One logical core.
pub struct Machine<'a, V: AddressSpaceView, const CPUS: usize = MAX_CPUS> {
    gdt: &'a Gdt<CPUS>,
    idt: &'a Idt,
    task: &'a TaskState,
    view: V,
    state: CpuState,
    frames: [Option<Delivery>; MAX_NESTING],
    depth: usize,
    shutdown: bool,
}

impl<'a, V: AddressSpaceView, const CPUS: usize> Machine<'a, V, CPUS> {
    /// A core in ring 0 on the kernel selectors with interrupts disabled,
    /// its task register loaded from `task`'s GDT slot.
    ///
    /// # Errors
    /// As [`Gdt::tss_selector_for`].
    pub fn boot(
        gdt: &'a Gdt<CPUS>,
        idt: &'a Idt,
        task: &'a TaskState,
        view: V,
        rip: VirtualAddress,
        rsp: VirtualAddress,
    ) -> Result<Self, GdtError> {
        gdt.tss_selector_for(task)?;
        Ok(Self {
            gdt,
            idt,
            task,
            view,
            state: CpuState {
                rip,
                rsp,
                rflags: Rflags::new(),
                cs: CodeSegment(KERNEL_CS),
                ss: StackSegment(KERNEL_DS),
            },
            frames: [None; MAX_NESTING],
            depth: 0,
            shutdown: false,
        })
    }

    #[must_use]
    pub const fn state(&self) -> &CpuState {
        &self.state
    }

    #[must_use]
    pub const fn cpl(&self) -> Ring {
        self.state.cpl()
    }

    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Frames currently on the kernel stacks, oldest first.
    pub fn frames(&self) -> impl Iterator<Item = &Delivery> {
        self.frames[..self.depth].iter().flatten()
    }

    #[must_use]
    pub const fn depth(&self) -> usize {
        self.depth
    }

    #[must_use]
    pub const fn view(&self) -> &V {
        &self.view
    }

    /// The address space may change under a running core.
    pub const fn view_mut(&mut self) -> &mut V {
        &mut self.view
    }

    /// `iretq` over the frame of `entry`. On success the kernel stack is
    /// abandoned.
    pub fn enter_user_mode(&mut self, entry: &UserEntry) -> Step {
        trace!("model: entering user mode at {}", entry.rip());
        self.return_from_interrupt(&entry.frame())
    }

    /// `iretq` over `frame`. The frame it returns through is discarded, and
    /// a return to ring 3 discards every kernel frame.
    pub fn return_from_interrupt(&mut self, frame: &InterruptFrame) -> Step {
        if self.shutdown {
            return Step::Shutdown;
        }
        match self.iretq(frame) {
            Ok(()) => {
                let depth = if self.state.cpl().is_user() {
                    0
                } else {
                    self.depth.saturating_sub(1)
                };
                self.unwind(depth);
                Step::Resumed
            }
            Err(fault) => self.escalate(fault, None),
        }
    }

    /// Return through the most recent frame, as a handler's final `iretq`
    /// after discarding any error code. An empty kernel stack yields a null
    /// CS and `#GP`.
    pub fn iret(&mut self) -> Step {
        match self.depth.checked_sub(1).and_then(|top| self.frames[top]) {
            Some(top) => self.return_from_interrupt(&top.frame),
            None => self.escalate(Fault::gp_selector(0), None),
        }
    }

    /// `int vector`.
    pub fn software_interrupt(&mut self, vector: u8) -> Step {
        self.deliver(Source::Software, vector, None)
    }

    /// A device interrupt on `vector`, held pending while `IF` is clear.
    pub fn hardware_interrupt(&mut self, vector: u8) -> Step {
        if !self.shutdown && !self.state.rflags.if_interrupt_enable() {
            return Step::Masked;
        }
        self.deliver(Source::Hardware, vector, None)
    }

    /// A processor exception. `error_code` is pushed only for the vectors
    /// that carry one.
    pub fn exception(&mut self, vector: u8, error_code: u64) -> Step {
        let error_code = pushes_error_code(vector).then_some(error_code);
        self.deliver(Source::Exception, vector, error_code)
    }

    /// `cli` / `sti`; both require `CPL <= IOPL`.
    pub fn set_interrupts(&mut self, enabled: bool) -> Step {
        if self.shutdown {
            return Step::Shutdown;
        }
        if self.state.cpl().to_u8() > self.state.rflags.iopl() {
            return self.escalate(Fault::gp_selector(0), None);
        }
        self.state.rflags = self.state.rflags.with_if_interrupt_enable(enabled);
        Step::Resumed
    }

    /// Fetch the instruction at `rip` with the current privilege.
    pub fn fetch(&mut self) -> Step {
        if self.shutdown {
            return Step::Shutdown;
        }
        match self.check_access(self.state.rip, 1, Access::Fetch, self.state.cpl()) {
            Ok(()) => Step::Resumed,
            Err(fault) => self.escalate(fault, None),
        }
    }

    /// An 8-byte push on the current stack with the current privilege, the
    /// first stack access a user program makes.
    pub fn push_user_stack(&mut self) -> Step {
        if self.shutdown {
            return Step::Shutdown;
        }
        let Some(slot) = self.state.rsp.checked_sub(8) else {
            return self.escalate(Fault::gp_selector(0), None);
        };
        match self.check_access(slot, 8, Access::Write, self.state.cpl()) {
            Ok(()) => {
                self.state.rsp = slot;
                Step::Resumed
            }
            Err(fault) => self.escalate(fault, None),
        }
    }

    fn deliver(&mut self, source: Source, vector: u8, error_code: Option<u64>) -> Step {
        if self.shutdown {
            return Step::Shutdown;
        }
        match self.attempt(source, vector, error_code) {
            Ok(delivery) => Step::Entered(delivery),
            Err(fault) => self.escalate(fault, Some((source, vector))),
        }
    }

    /// Deliver `fault`, raised while delivering `during`, or by the running
    /// context when `None`.
    fn escalate(&mut self, fault: Fault, during: Option<(Source, u8)>) -> Step {
        warn!("cpu {}: {fault}", self.task.cpu());
        match during {
            Some((Source::Exception, DOUBLE_FAULT_VECTOR)) => return self.triple_fault(),
            Some((Source::Exception, _)) => return self.double_fault(),
            _ => {}
        }
        let Some(vector) = fault.vector() else {
            return self.triple_fault();
        };
        let error_code = pushes_error_code(vector).then(|| fault.error_code());
        match self.attempt(Source::Exception, vector, error_code) {
            Ok(delivery) => Step::Faulted { fault, delivery },
            Err(_) if vector == DOUBLE_FAULT_VECTOR => self.triple_fault(),
            Err(_) => self.double_fault(),
        }
    }

    fn double_fault(&mut self) -> Step {
        warn!("cpu {}: double fault", self.task.cpu());
        match self.attempt(Source::Exception, DOUBLE_FAULT_VECTOR, Some(0)) {
            Ok(delivery) => Step::Faulted {
                fault: Fault::DoubleFault,
                delivery,
            },
            Err(_) => self.triple_fault(),
        }
    }

    fn triple_fault(&mut self) -> Step {
        warn!("cpu {}: triple fault, shutting down", self.task.cpu());
        self.shutdown = true;
        Step::Shutdown
    }

    fn unwind(&mut self, depth: usize) {
        self.frames[depth..].fill(None);
        self.depth = depth;
    }

    /// Decode a selector that must name a 64-bit code segment. Presence is
    /// left to the caller, which checks it last.
    fn code_descriptor(
        &self,
        selector: u16,
    ) -> Result<(SegmentSelector<CodeSel>, SegmentDescriptor), Fault> {
        let gp = Fault::gp_selector(selector);
        let sel = SegmentSelector::<CodeSel>::decode(selector).map_err(|_| gp)?;
        let desc = self.gdt.descriptor(sel.index()).ok_or(gp)?;
        if !desc.is_long_code() {
            return Err(gp);
        }
        Ok((sel, desc))
    }

    /// SS checks of a 64-bit `iretq` returning to `rpl`.
    fn check_stack_segment(&self, selector: u16, rpl: Rpl) -> Result<(), Fault> {
        let gp = Fault::gp_selector(selector);
        if selector & !RPL_MASK == 0 {
            // Null SS is only loadable for ring 0.
            return if rpl == Rpl::Ring0 { Ok(()) } else { Err(gp) };
        }
        let sel = SegmentSelector::<DataSel>::decode(selector).map_err(|_| gp)?;
        if sel.rpl() != rpl {
            return Err(gp);
        }
        let desc = self.gdt.descriptor(sel.index()).ok_or(gp)?;
        if !desc.is_writable_data() || desc.dpl() != Some(Dpl::from(rpl)) {
            return Err(gp);
        }
        if !desc.is_present() {
            return Err(Fault::SegmentNotPresent {
                error: SelectorErrorCode::for_selector(selector),
            });
        }
        Ok(())
    }

    fn iretq(&mut self, frame: &InterruptFrame) -> Result<(), Fault> {
        let cpl = self.state.cpl();
        let (cs, code) = self.code_descriptor(frame.cs())?;
        let rpl = cs.rpl();
        if rpl.to_ring() < cpl || code.dpl() != Some(Dpl::from(rpl)) {
            return Err(Fault::gp_selector(frame.cs()));
        }
        if !code.is_present() {
            return Err(Fault::SegmentNotPresent {
                error: SelectorErrorCode::for_selector(frame.cs()),
            });
        }
        self.check_stack_segment(frame.ss(), rpl)?;
        if !frame.rip().is_canonical() {
            return Err(Fault::gp_selector(0));
        }

        let mut rflags = Rflags::normalized(frame.rflags);
        if !cpl.is_supervisor() {
            rflags = rflags
                .with_if_interrupt_enable(self.state.rflags.if_interrupt_enable())
                .with_iopl(self.state.rflags.iopl());
        }

        self.state = CpuState {
            rip: frame.rip(),
            rsp: frame.rsp(),
            rflags,
            cs: CodeSegment(frame.cs()),
            ss: StackSegment(frame.ss()),
        };
        trace!("model: iretq to {} in {:?}", frame.rip(), rpl);
        Ok(())
    }

    /// Gate checks, stack selection and frame push for one event.
    fn attempt(
        &mut self,
        source: Source,
        vector: u8,
        error_code: Option<u64>,
    ) -> Result<Delivery, Fault> {
        let cpl = self.state.cpl();
        let gate = *self.idt.entry(vector);
        let gate_error =
            SelectorErrorCode::for_vector(vector).with_external(source != Source::Software);

        if source == Source::Software && !gate.dpl().permits_software_invocation(cpl) {
            return Err(Fault::GeneralProtection { error: gate_error });
        }
        if !gate.is_present() {
            return Err(Fault::SegmentNotPresent { error: gate_error });
        }
        let Some(gate_type) = gate.gate_type() else {
            return Err(Fault::GeneralProtection { error: gate_error });
        };

        let (_, code) = self.code_descriptor(gate.selector())?;
        let target = code
            .dpl()
            .map(Dpl::to_ring)
            .filter(|&target| target <= cpl)
            .ok_or_else(|| Fault::gp_selector(gate.selector()))?;
        if !code.is_present() {
            return Err(Fault::SegmentNotPresent {
                error: SelectorErrorCode::for_selector(gate.selector()),
            });
        }
        let switching = target != cpl;

        // An IST gate always switches; otherwise only a privilege change does.
        let stack = match self.task.ist(gate.ist()) {
            Some(ist) => ist,
            None if switching => self.task.rsp0(),
            None => self.state.rsp,
        };
        let size = if error_code.is_some() { 48 } else { 40 };
        // A null rsp0 or IST slot wraps into the top of the address space,
        // where the push finds no page.
        let stack_pointer = stack.align_down(STACK_ALIGN).wrapping_sub(size);
        self.check_access(stack_pointer, size, Access::Write, Ring::Ring0)?;
        if self.depth == MAX_NESTING {
            return Err(Fault::PageFault {
                address: stack_pointer,
                error: PageFaultError::new().with_write(true),
            });
        }

        let delivery = Delivery {
            vector,
            source,
            frame: self.state.frame(),
            error_code,
            stack_pointer,
        };
        self.state = CpuState {
            rip: gate.handler(),
            rsp: stack_pointer,
            rflags: self
                .state
                .rflags
                .on_gate_entry(gate_type == GateType::InterruptGate),
            cs: CodeSegment(gate.selector()),
            // Long mode loads a null SS on a privilege change.
            ss: if switching {
                StackSegment(0)
            } else {
                self.state.ss
            },
        };
        self.frames[self.depth] = Some(delivery);
        self.depth += 1;

        trace!(
            "model: vector {vector:#04x} ({source:?}) from {cpl:?}, handler {} on stack {stack_pointer}",
            gate.handler()
        );
        Ok(delivery)
    }

    /// Page-level checks of an access of `len` bytes at `address` made
    /// with privilege `ring`.
    fn check_access(
        &self,
        address: VirtualAddress,
        len: u64,
        access: Access,
        ring: Ring,
    ) -> Result<(), Fault> {
        let last = address + (len - 1);
        if !address.is_canonical() || !last.is_canonical() || last < address {
            return Err(Fault::gp_selector(0));
        }

        let error = PageFaultError::new()
            .with_write(access == Access::Write)
            .with_user(ring.is_user())
            .with_instruction_fetch(access == Access::Fetch);

        let mut page = address.align_down(PAGE_SIZE);
        let last_page = last.align_down(PAGE_SIZE);
        loop {
            let at = page.max(address);
            let Some(p) = self.view.permissions(at) else {
                return Err(Fault::PageFault { address: at, error });
            };
            let wrong_half = if ring.is_user() { !p.user } else { p.user };
            let denied = wrong_half
                || (access == Access::Write && !p.writable)
                || (access == Access::Fetch && !p.executable);
            if denied {
                return Err(Fault::PageFault {
                    address: at,
                    error: error.with_present(true),
                });
            }
            if page == last_page {
                return Ok(());
            }
            page = page + PAGE_SIZE;
        }
    }
}
