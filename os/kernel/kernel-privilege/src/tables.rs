//! # Installed descriptor tables
//!
//! The GDT and IDT are built once during boot, published through
//! [`install`], and never moved afterwards. Every core loads the same pair
//! with [`load_on_this_core`] and then its own TSS selector.
//!
//! After publication the GDT is immutable. IDT gates may be replaced in place
//! with [`InstalledTables::patch_gate`], but only while every other core is
//! parked through a [`CoreRendezvous`], and never in a way that changes what
//! user mode may invoke: promoting or demoting a gate means building a new
//! IDT.

use crate::frame::SyscallFrame;
use crate::gate::GateError;
use crate::gdt::{Gdt, GdtError, KERNEL_CS};
use crate::idt::{Idt, IdtEntry};
use crate::privilege::Dpl;
use crate::tss::TaskState;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU8, Ordering, fence};
use log::{debug, info};

const UNINIT: u8 = 0;
const INITING: u8 = 1;
const READY: u8 = 2;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum TablesError {
    #[error("value has already been installed")]
    AlreadyInstalled,
    #[error("descriptor tables have not been installed")]
    NotInstalled,
    #[error(transparent)]
    Gdt(#[from] GdtError),
    #[error("gate {vector:#04x}: patch would change DPL from {from:?} to {to:?}")]
    PolicyChange { vector: u8, from: Dpl, to: Dpl },
    #[error(transparent)]
    Gate(#[from] GateError),
}

/// A value written exactly once and shared read-only afterwards.
pub struct Installed<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Default for Installed<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Installed<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    #[inline]
    #[must_use]
    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == READY {
            // SAFETY: READY is only stored after the value was written.
            Some(unsafe { (*self.value.get()).assume_init_ref() })
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.state.load(Ordering::Acquire) == READY
    }

    /// Publish `value`. Only the first call succeeds; a concurrent or later
    /// call drops its value and fails.
    ///
    /// # Errors
    /// [`TablesError::AlreadyInstalled`].
    pub fn install(&self, value: T) -> Result<&T, TablesError> {
        if self
            .state
            .compare_exchange(UNINIT, INITING, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(TablesError::AlreadyInstalled);
        }

        // SAFETY: winning the exchange makes this the only writer, and no
        // reader looks at the value before READY.
        let value = unsafe { (*self.value.get()).write(value) };
        self.state.store(READY, Ordering::Release);
        Ok(value)
    }
}

impl<T> Drop for Installed<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == READY {
            // SAFETY: READY means initialized; `&mut self` means unshared.
            unsafe { self.value.get_mut().assume_init_drop() }
        }
    }
}

// SAFETY: written once by the exchange winner, read-only after READY.
unsafe impl<T: Sync + Send> Sync for Installed<T> {}
unsafe impl<T: Send> Send for Installed<T> {}

/// Parks every other core for the duration of `f` and masks interrupts on
/// the calling one, so no core can be delivering through a table while it
/// changes.
pub trait CoreRendezvous {
    fn exclusive<R>(&self, f: impl FnOnce() -> R) -> R;
}

/// Rendezvous for the time before application processors are started: the
/// boot core only has to mask its own interrupts.
#[cfg(target_arch = "x86_64")]
#[derive(Debug, Default, Copy, Clone)]
pub struct BootCore;

#[cfg(target_arch = "x86_64")]
impl CoreRendezvous for BootCore {
    fn exclusive<R>(&self, f: impl FnOnce() -> R) -> R {
        let _masked = crate::hw::InterruptsMasked::new();
        let result = f();
        fence(Ordering::SeqCst);
        result
    }
}

/// The published GDT/IDT pair.
pub struct InstalledTables {
    gdt: Gdt,
    idt: UnsafeCell<Idt>,
}

// SAFETY: the GDT is never written after construction. IDT slots are only
// written by `patch_gate` while every other core is parked in a
// `CoreRendezvous`, and read by copy; no reference into the IDT is ever
// handed out.
unsafe impl Sync for InstalledTables {}

impl InstalledTables {
    #[must_use]
    pub const fn new(gdt: Gdt, idt: Idt) -> Self {
        Self {
            gdt,
            idt: UnsafeCell::new(idt),
        }
    }

    #[must_use]
    pub const fn gdt(&self) -> &Gdt {
        &self.gdt
    }

    /// Copy of the current gate for `vector`.
    #[must_use]
    pub fn gate(&self, vector: u8) -> IdtEntry {
        // SAFETY: the cell lives as long as `self`; see the `Sync` impl.
        unsafe { Idt::entry_ptr(self.idt.get(), vector).read() }
    }

    /// Vectors a ring-3 `int n` currently reaches.
    pub fn user_invocable(&self) -> impl Iterator<Item = u8> + '_ {
        (0..=u8::MAX).filter(|&v| {
            let gate = self.gate(v);
            gate.is_present() && gate.dpl() == Dpl::Ring3
        })
    }

    /// Address for `lidt`.
    #[must_use]
    pub const fn idt_ptr(&self) -> *const Idt {
        self.idt.get()
    }

    /// Replace the gate of `vector` and return the previous one.
    ///
    /// The new gate must run in the kernel code segment and keep the DPL
    /// of the gate it replaces.
    ///
    /// # Errors
    /// - [`GateError::HandlerNotKernelCode`] / [`GateError::InvalidHandler`]
    ///   for a present gate with a bad selector or handler,
    /// - [`TablesError::PolicyChange`] if the DPL would change.
    pub fn patch_gate(
        &self,
        rendezvous: &impl CoreRendezvous,
        vector: u8,
        entry: IdtEntry,
    ) -> Result<IdtEntry, TablesError> {
        if entry.is_present() {
            if entry.selector() != KERNEL_CS {
                return Err(GateError::HandlerNotKernelCode {
                    vector,
                    selector: entry.selector(),
                }
                .into());
            }
            let handler = entry.handler();
            if handler.is_null() || !handler.is_canonical() {
                return Err(GateError::InvalidHandler { vector, handler }.into());
            }
        }

        let from = self.gate(vector).dpl();
        let to = entry.dpl();
        if from != to {
            return Err(TablesError::PolicyChange { vector, from, to });
        }

        let previous = rendezvous.exclusive(|| {
            // SAFETY: every other core is parked and interrupts are masked
            // here, so nothing delivers through this slot while it changes.
            unsafe {
                let slot = Idt::entry_ptr(self.idt.get(), vector);
                slot.replace(entry)
            }
        });
        fence(Ordering::SeqCst);

        debug!("gate {vector:#04x} patched: {previous:?} -> {entry:?}");
        Ok(previous)
    }
}

static TABLES: Installed<InstalledTables> = Installed::new();

/// Publish the tables every core will load.
///
/// # Errors
/// [`TablesError::AlreadyInstalled`] on a second call.
pub fn install(gdt: Gdt, idt: Idt) -> Result<&'static InstalledTables, TablesError> {
    let tables = TABLES.install(InstalledTables::new(gdt, idt))?;
    info!(
        "descriptor tables installed: {} GDT entries, user-invocable gates {:?}",
        tables.gdt.entries(),
        InvocableList(tables)
    );
    Ok(tables)
}

#[must_use]
pub fn installed() -> Option<&'static InstalledTables> {
    TABLES.get()
}

/// Replace a gate of the installed IDT.
///
/// # Errors
/// [`TablesError::NotInstalled`], otherwise as
/// [`InstalledTables::patch_gate`].
pub fn patch_gate(
    rendezvous: &impl CoreRendezvous,
    vector: u8,
    entry: IdtEntry,
) -> Result<IdtEntry, TablesError> {
    installed()
        .ok_or(TablesError::NotInstalled)?
        .patch_gate(rendezvous, vector, entry)
}

/// Load the installed GDT, kernel segments, this core's TSS and the IDT.
///
/// # Errors
/// [`TablesError::NotInstalled`], or [`TablesError::Gdt`] if the GDT slot of
/// `task`'s core does not describe it ([`Gdt::tss_selector_for`]). Nothing
/// is loaded on error.
///
/// # Safety
/// - Must run at CPL 0 on the core `task` belongs to, once per core.
/// - `task` must stay at its address for the lifetime of the core.
#[cfg(target_arch = "x86_64")]
pub unsafe fn load_on_this_core(task: &'static TaskState) -> Result<(), TablesError> {
    use crate::gdt::{KERNEL_CS_SEL, KERNEL_DS, KERNEL_DS_SEL};
    use crate::hw;
    use kernel_registers::{CodeSegment, LoadRegister, StackSegment};

    debug_assert_eq!(CodeSegment::load().cpl(), 0);

    let tables = installed().ok_or(TablesError::NotInstalled)?;
    let tss = tables.gdt.tss_selector_for(task)?;

    unsafe {
        hw::load_gdt(&tables.gdt);
        hw::reload_segments(KERNEL_CS_SEL, KERNEL_DS_SEL);
        debug_assert_eq!(StackSegment::load(), StackSegment(KERNEL_DS));
        hw::load_task_register(tss);
        hw::load_idt(tables.idt_ptr());
    }

    info!("cpu {}: GDT, TSS {tss:?} and IDT loaded", task.cpu());
    Ok(())
}

/// Signature of the system-call dispatcher behind the `int 0x80` gate.
pub type SyscallDispatch = fn(&mut SyscallFrame);

static SYSCALL_DISPATCH: Installed<SyscallDispatch> = Installed::new();

/// Register the system-call dispatcher. Only the first registration wins.
///
/// # Errors
/// [`TablesError::AlreadyInstalled`].
pub fn set_syscall_dispatch(dispatch: SyscallDispatch) -> Result<(), TablesError> {
    SYSCALL_DISPATCH.install(dispatch).map(|_| ())
}

#[must_use]
pub fn syscall_dispatch() -> Option<SyscallDispatch> {
    SYSCALL_DISPATCH.get().copied()
}

struct InvocableList<'a>(&'a InstalledTables);

impl core::fmt::Debug for InvocableList<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.0.user_invocable()).finish()
    }
}
