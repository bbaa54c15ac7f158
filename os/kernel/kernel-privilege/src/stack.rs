//! # Stack isolation
//!
//! The processor never trusts the interrupted stack on a Ring-3 → Ring-0
//! transition: it switches to `rsp0` (or an IST stack) from the TSS before
//! pushing anything. That only isolates the kernel if those stacks are
//! unreachable from user mode, which is a property of the page tables owned
//! by the virtual-memory manager.
//!
//! [`AddressSpaceView`] is the seam to that collaborator. The witnesses
//! [`KernelStack`] and [`UserStack`] can only be obtained by walking every
//! page of the stack through it, and [`crate::tss::TaskState`] only accepts a
//! [`KernelStack`].
//!
//! Effective permissions combine all four paging levels:
//!
//! | Permission | Combination |
//! |------------|-------------|
//! | present    | AND |
//! | writable   | AND |
//! | user       | AND |
//! | no-execute | OR  |

use crate::address::VirtualAddress;
use crate::layout::{PAGE_SIZE, STACK_ALIGN};
use bitfield_struct::bitfield;

/// Permission bits of one paging-structure entry (PML4E, PDPTE, PDE or PTE).
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct PageEntryFlags {
    /// Present (P, bit 0).
    pub present: bool,
    /// Writable (RW, bit 1).
    pub writable: bool,
    /// User/Supervisor (US, bit 2). Clear restricts to supervisor only.
    pub user_access: bool,
    #[bits(60)]
    __: u64,
    /// Execute disable (NX, bit 63).
    pub no_execute: bool,
}

impl PageEntryFlags {
    /// Non-leaf entry that defers every decision to the levels below.
    #[must_use]
    pub const fn table() -> Self {
        Self::new().with_present(true).with_writable(true).with_user_access(true)
    }

    #[must_use]
    pub const fn kernel_code() -> Self {
        Self::new().with_present(true)
    }

    #[must_use]
    pub const fn kernel_data() -> Self {
        Self::new().with_present(true).with_writable(true).with_no_execute(true)
    }

    #[must_use]
    pub const fn user_code() -> Self {
        Self::new().with_present(true).with_user_access(true)
    }

    #[must_use]
    pub const fn user_data() -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(true)
            .with_no_execute(true)
    }
}

/// Effective permissions of a translation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[allow(clippy::struct_excessive_bools)]
pub struct Permissions {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub executable: bool,
}

/// The entries visited when translating one address, PML4E first.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PageWalk {
    pub levels: [PageEntryFlags; 4],
}

impl PageWalk {
    #[must_use]
    pub const fn new(levels: [PageEntryFlags; 4]) -> Self {
        Self { levels }
    }

    /// Permissive upper levels with `leaf` deciding.
    #[must_use]
    pub const fn leaf(leaf: PageEntryFlags) -> Self {
        Self::new([
            PageEntryFlags::table(),
            PageEntryFlags::table(),
            PageEntryFlags::table(),
            leaf,
        ])
    }

    /// Combine the levels the way the MMU does.
    #[must_use]
    pub const fn effective(&self) -> Permissions {
        let mut p = Permissions {
            present: true,
            writable: true,
            user: true,
            executable: true,
        };
        let mut i = 0;
        while i < self.levels.len() {
            let e = self.levels[i];
            p.present &= e.present();
            p.writable &= e.writable();
            p.user &= e.user_access();
            p.executable &= !e.no_execute();
            i += 1;
        }
        p
    }
}

/// Read-only view of the active address space.
pub trait AddressSpaceView {
    /// Entries on the translation path of `address`, or `None` if the walk
    /// stops at a missing table.
    fn walk(&self, address: VirtualAddress) -> Option<PageWalk>;

    /// Effective permissions, `None` unless every level is present.
    fn permissions(&self, address: VirtualAddress) -> Option<Permissions> {
        self.walk(address)
            .map(|w| w.effective())
            .filter(|p| p.present)
    }
}

impl<T: AddressSpaceView + ?Sized> AddressSpaceView for &T {
    fn walk(&self, address: VirtualAddress) -> Option<PageWalk> {
        (**self).walk(address)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum StackError {
    #[error("{0} is not canonical")]
    NotCanonical(VirtualAddress),
    #[error("stack top {0} is not 16-byte aligned")]
    Misaligned(VirtualAddress),
    #[error("stack length {0:#x} is empty or wraps around")]
    BadLength(u64),
    #[error("{0} is not mapped")]
    Unmapped(VirtualAddress),
    #[error("{0} is not writable")]
    NotWritable(VirtualAddress),
    #[error("{0} is reachable from user mode")]
    UserAccessible(VirtualAddress),
    #[error("{0} is supervisor-only")]
    SupervisorOnly(VirtualAddress),
    #[error("{0} is executable")]
    Executable(VirtualAddress),
    #[error("{0} is not executable")]
    NotExecutable(VirtualAddress),
    #[error("{0} lies in the kernel half")]
    NotUserAddress(VirtualAddress),
    #[error("no free region slot")]
    MapFull,
    #[error("region at {0} overlaps an existing mapping")]
    Overlap(VirtualAddress),
}

/// Start addresses of every page in `[top - len, top)`.
#[allow(clippy::cast_possible_truncation)]
fn pages(
    top: VirtualAddress,
    len: u64,
) -> Result<impl Iterator<Item = VirtualAddress>, StackError> {
    let bottom = top.checked_sub(len).ok_or(StackError::BadLength(len))?;
    if len == 0 {
        return Err(StackError::BadLength(len));
    }
    let first = bottom.align_down(PAGE_SIZE).as_u64();
    Ok((first..top.as_u64())
        .step_by(PAGE_SIZE as usize)
        .map(VirtualAddress::new))
}

fn mapped(view: &impl AddressSpaceView, page: VirtualAddress) -> Result<Permissions, StackError> {
    view.permissions(page).ok_or(StackError::Unmapped(page))
}

/// A stack the CPU may switch to on entry to ring 0: every page present,
/// writable and supervisor-only.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KernelStack {
    top: VirtualAddress,
    len: u64,
}

impl KernelStack {
    /// Walk every page of `[top - len, top)`.
    ///
    /// # Errors
    /// The first violated requirement, naming the offending page.
    pub fn verify(
        view: &impl AddressSpaceView,
        top: VirtualAddress,
        len: u64,
    ) -> Result<Self, StackError> {
        if !top.is_canonical() {
            return Err(StackError::NotCanonical(top));
        }
        if !top.is_aligned(STACK_ALIGN) {
            return Err(StackError::Misaligned(top));
        }
        for page in pages(top, len)? {
            let p = mapped(view, page)?;
            if !p.writable {
                return Err(StackError::NotWritable(page));
            }
            if p.user {
                return Err(StackError::UserAccessible(page));
            }
        }
        Ok(Self { top, len })
    }

    /// Skip the page walk for a stack the kernel set up itself.
    ///
    /// # Safety
    /// `[top - len, top)` must be mapped writable and supervisor-only for as
    /// long as the stack is referenced from a TSS, and `top` must be 16-byte
    /// aligned.
    #[must_use]
    pub const unsafe fn new_unchecked(top: VirtualAddress, len: u64) -> Self {
        Self { top, len }
    }

    #[must_use]
    pub const fn top(&self) -> VirtualAddress {
        self.top
    }

    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A user stack: lower half, present, writable, user-accessible and
/// non-executable at every level.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct UserStack {
    top: VirtualAddress,
    len: u64,
}

impl UserStack {
    /// # Errors
    /// The first violated requirement, naming the offending page.
    pub fn verify(
        view: &impl AddressSpaceView,
        top: VirtualAddress,
        len: u64,
    ) -> Result<Self, StackError> {
        // `top` itself is one past the stack and may be the end of the half.
        if top.is_null() || !(top - 1).is_user() {
            return Err(StackError::NotUserAddress(top));
        }
        for page in pages(top, len)? {
            let p = mapped(view, page)?;
            if !p.writable {
                return Err(StackError::NotWritable(page));
            }
            if !p.user {
                return Err(StackError::SupervisorOnly(page));
            }
            if p.executable {
                return Err(StackError::Executable(page));
            }
        }
        Ok(Self { top, len })
    }

    #[must_use]
    pub const fn top(&self) -> VirtualAddress {
        self.top
    }

    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// The page holding `rip` must be present, user-accessible and executable.
///
/// # Errors
/// The violated requirement.
pub fn verify_user_code(view: &impl AddressSpaceView, rip: VirtualAddress) -> Result<(), StackError> {
    if !rip.is_user() {
        return Err(StackError::NotUserAddress(rip));
    }
    let p = mapped(view, rip)?;
    if !p.user {
        return Err(StackError::SupervisorOnly(rip));
    }
    if !p.executable {
        return Err(StackError::NotExecutable(rip));
    }
    Ok(())
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct Region {
    start: u64,
    end: u64,
    walk: PageWalk,
}

/// Fixed-capacity address space: up to `N` regions, each with one uniform
/// translation path.
#[derive(Debug, Clone)]
pub struct RegionMap<const N: usize> {
    regions: [Option<Region>; N],
}

impl<const N: usize> Default for RegionMap<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> RegionMap<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self { regions: [None; N] }
    }

    /// Map `[start, start + len)`.
    ///
    /// # Errors
    /// - [`StackError::BadLength`] for an empty or wrapping range,
    /// - [`StackError::Overlap`] if the range intersects a mapped region,
    /// - [`StackError::MapFull`] once `N` regions are mapped.
    pub fn map(&mut self, start: VirtualAddress, len: u64, walk: PageWalk) -> Result<(), StackError> {
        let end = start
            .as_u64()
            .checked_add(len)
            .filter(|_| len > 0)
            .ok_or(StackError::BadLength(len))?;
        let start = start.as_u64();
        if self
            .regions
            .iter()
            .flatten()
            .any(|r| start < r.end && r.start < end)
        {
            return Err(StackError::Overlap(VirtualAddress::new(start)));
        }
        let slot = self
            .regions
            .iter_mut()
            .find(|r| r.is_none())
            .ok_or(StackError::MapFull)?;
        *slot = Some(Region { start, end, walk });
        Ok(())
    }

    /// Builder form of [`map`](Self::map).
    ///
    /// # Errors
    /// See [`map`](Self::map).
    pub fn with(mut self, start: VirtualAddress, len: u64, walk: PageWalk) -> Result<Self, StackError> {
        self.map(start, len, walk)?;
        Ok(self)
    }

    /// Drop the region starting exactly at `start`. Returns whether one existed.
    pub fn unmap(&mut self, start: VirtualAddress) -> bool {
        self.regions
            .iter_mut()
            .find(|r| r.is_some_and(|r| r.start == start.as_u64()))
            .map(Option::take)
            .is_some()
    }
}

impl<const N: usize> AddressSpaceView for RegionMap<N> {
    fn walk(&self, address: VirtualAddress) -> Option<PageWalk> {
        let a = address.as_u64();
        self.regions
            .iter()
            .flatten()
            .find(|r| r.start <= a && a < r.end)
            .map(|r| r.walk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KSTACK_TOP: VirtualAddress = VirtualAddress::new(0xFFFF_8000_0001_0000);

    #[test]
    fn effective_permissions_and_across_levels() {
        let mut walk = PageWalk::leaf(PageEntryFlags::user_data());
        assert!(walk.effective().user);
        walk.levels[1] = walk.levels[1].with_user_access(false);
        assert!(!walk.effective().user);
        walk.levels[0] = walk.levels[0].with_no_execute(true);
        assert!(!walk.effective().executable);
        walk.levels[2] = walk.levels[2].with_present(false);
        assert!(!walk.effective().present);
    }

    #[test]
    fn kernel_stack_must_be_supervisor_only() {
        let map = RegionMap::<2>::new()
            .with(KSTACK_TOP - 0x4000, 0x4000, PageWalk::leaf(PageEntryFlags::kernel_data()))
            .expect("mapped");
        assert!(KernelStack::verify(&map, KSTACK_TOP, 0x4000).is_ok());

        let leaky = RegionMap::<2>::new()
            .with(KSTACK_TOP - 0x4000, 0x4000, PageWalk::leaf(PageEntryFlags::user_data()))
            .expect("mapped");
        assert_eq!(
            KernelStack::verify(&leaky, KSTACK_TOP, 0x4000),
            Err(StackError::UserAccessible(KSTACK_TOP - 0x4000))
        );
    }

    #[test]
    fn kernel_stack_shape_checks() {
        let map = RegionMap::<1>::new();
        assert_eq!(
            KernelStack::verify(&map, KSTACK_TOP + 8, 0x1000),
            Err(StackError::Misaligned(KSTACK_TOP + 8))
        );
        assert_eq!(
            KernelStack::verify(&map, KSTACK_TOP, 0),
            Err(StackError::BadLength(0))
        );
        assert_eq!(
            KernelStack::verify(&map, KSTACK_TOP, 0x1000),
            Err(StackError::Unmapped(KSTACK_TOP - 0x1000))
        );
    }

    #[test]
    fn user_stack_must_not_be_executable() {
        let top = VirtualAddress::new(0x7FFF_0000);
        let map = RegionMap::<1>::new()
            .with(top - 0x2000, 0x2000, PageWalk::leaf(PageEntryFlags::user_code().with_writable(true)))
            .expect("mapped");
        assert_eq!(
            UserStack::verify(&map, top, 0x2000),
            Err(StackError::Executable(top - 0x2000))
        );
    }

    #[test]
    fn user_code_checks() {
        let rip = VirtualAddress::new(0x40_0000);
        let map = RegionMap::<1>::new()
            .with(rip, 0x1000, PageWalk::leaf(PageEntryFlags::user_data()))
            .expect("mapped");
        assert_eq!(verify_user_code(&map, rip), Err(StackError::NotExecutable(rip)));
        assert_eq!(
            verify_user_code(&map, KSTACK_TOP),
            Err(StackError::NotUserAddress(KSTACK_TOP))
        );
    }

    #[test]
    fn region_map_rejects_overlap_and_overflow() {
        let walk = PageWalk::leaf(PageEntryFlags::kernel_data());
        let mut map = RegionMap::<1>::new();
        map.map(VirtualAddress::new(0x1000), 0x2000, walk).expect("mapped");
        assert_eq!(
            map.map(VirtualAddress::new(0x2000), 0x1000, walk),
            Err(StackError::Overlap(VirtualAddress::new(0x2000)))
        );
        assert_eq!(
            map.map(VirtualAddress::new(0x8000), 0x1000, walk),
            Err(StackError::MapFull)
        );
        assert!(map.unmap(VirtualAddress::new(0x1000)));
        assert!(map.walk(VirtualAddress::new(0x1800)).is_none());
    }
}
