//! # The copy-on-write fault handler.
//!
//! After a fork, every page that was writable is mapped read-only with
//! [`PteFlags::COW`] in both environments. The first write to such a page
//! faults, and the kernel delivers the fault to [`pgfault`] through the
//! environment's upcall.
//!
//! The handler never trusts the fault blindly. It first decodes a
//! [`PageFaultReason`] from the trap frame and the environment's own page
//! table, and only a write to a present COW page is resolved. Anything else
//! (a read of an unmapped page, a write to a genuinely read-only page) is a
//! bug in the program, and the environment is terminated without copying
//! anything.
//!
//! Resolving a COW fault takes three system calls:
//! 1. `page_alloc` a fresh page at the scratch address [`PFTEMP`], then copy
//!    the contents of the faulting page into it;
//! 2. `page_map` the scratch page over the faulting page, writable and
//!    without `COW`;
//! 3. `page_unmap` the scratch address.
//!
//! Steps 1 and 2-3 are the two halves of a [`ScratchPage`]: it is created by
//! [`ScratchPage::stage`] and consumed by [`ScratchPage::commit`]. If it is
//! dropped in between, the scratch address is unmapped again.
//!
//! [`PFTEMP`]: ulib::mm::PFTEMP

use crate::{ForkError, fatal};
use core::mem::ManuallyDrop;
use ulib::{
    addressing::Va,
    env::{EnvId, UserEnv},
    mm::{PFTEMP, UserMemory, page_table::{PageTableView, PteFlags}},
    pgfault::{FaultErrorCode, UTrapframe},
    syscall::{Syscall, SyscallNumber},
    warning,
};

/// Represents the reason for a page fault in user space.
///
/// This struct contains information about the faulting address, the kind of
/// access, and the state of the faulting page as seen in the environment's
/// own page table at the time of the fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFaultReason {
    /// The faulting address, as reported by the CPU.
    pub fault_va: usize,
    /// The page containing the faulting address, if the address is
    /// canonical.
    pub page: Option<Va>,
    /// The raw error code.
    pub err: FaultErrorCode,
    /// Whether the fault was caused by a write access.
    pub is_write_access: bool,
    /// Whether the fault hit a present page (a protection violation), as
    /// opposed to a missing one.
    pub is_present: bool,
    /// Flags of the faulting page, or `None` if it is not mapped.
    pub perm: Option<PteFlags>,
}

impl PageFaultReason {
    /// Decodes `utf` and looks the faulting page up in `view`.
    pub fn probe<V: PageTableView + ?Sized>(utf: &UTrapframe, view: &V) -> Self {
        let page = Va::new(utf.fault_va).map(Va::page_down);
        PageFaultReason {
            fault_va: utf.fault_va,
            page,
            err: utf.err,
            is_write_access: utf.err.contains(FaultErrorCode::WRITE),
            is_present: utf.err.contains(FaultErrorCode::PRESENT),
            perm: page.and_then(|page| view.lookup(page)),
        }
    }

    /// Returns `true` if the fault is a **copy-on-write** violation: a write
    /// to a present page marked [`PteFlags::COW`].
    #[inline]
    pub fn is_cow_fault(&self) -> bool {
        self.is_write_access
            && self.is_present
            && self.perm.is_some_and(|perm| perm.contains(PteFlags::COW))
    }

    fn reject(&self) -> ForkError {
        ForkError::NotCopyOnWrite {
            fault_va: self.fault_va,
            err: self.err,
            perm: self.perm,
        }
    }
}

/// A private copy of a page, staged at [`PFTEMP`] during one fault.
///
/// [`PFTEMP`]: ulib::mm::PFTEMP
pub struct ScratchPage<'a, E: Syscall + ?Sized> {
    env: &'a E,
}

impl<'a, E: Syscall + UserMemory + ?Sized> ScratchPage<'a, E> {
    /// Allocates a fresh writable page at `PFTEMP` and copies the page at
    /// `src` into it.
    pub fn stage(env: &'a E, src: Va) -> Result<Self, ForkError> {
        env.page_alloc(EnvId::CURRENT, PFTEMP, PteFlags::USER_RW)
            .map_err(ForkError::syscall(SyscallNumber::PageAlloc, Some(PFTEMP)))?;
        let scratch = ScratchPage { env };
        env.copy_page(PFTEMP, src);
        Ok(scratch)
    }

    /// Installs the copy at `dst`, writable and private, and releases the
    /// scratch address.
    ///
    /// The mapping at `dst` is replaced, so the frame it used to share is not
    /// touched.
    pub fn commit(self, dst: Va) -> Result<(), ForkError> {
        let this = ManuallyDrop::new(self);
        let env = this.env;
        let mapped = env
            .page_map(EnvId::CURRENT, PFTEMP, EnvId::CURRENT, dst, PteFlags::USER_RW)
            .map_err(ForkError::syscall(SyscallNumber::PageMap, Some(dst)));
        let unmapped = env
            .page_unmap(EnvId::CURRENT, PFTEMP)
            .map_err(ForkError::syscall(SyscallNumber::PageUnmap, Some(PFTEMP)));
        mapped.and(unmapped)
    }
}

impl<E: Syscall + ?Sized> Drop for ScratchPage<'_, E> {
    fn drop(&mut self) {
        if let Err(e) = self.env.page_unmap(EnvId::CURRENT, PFTEMP) {
            warning!("pgfault: cannot release scratch page {}: {}", PFTEMP, e);
        }
    }
}

/// Resolves a copy-on-write fault described by `utf`.
///
/// # Errors
/// - [`ForkError::NotCopyOnWrite`] if the fault is anything but a write to a
///   present COW page. No page is copied and no system call is made.
/// - [`ForkError::Syscall`] if allocating, mapping, or unmapping the copy
///   fails.
pub fn handle_cow_fault<E>(env: &E, utf: &UTrapframe) -> Result<(), ForkError>
where
    E: Syscall + PageTableView + UserMemory + ?Sized,
{
    let reason = PageFaultReason::probe(utf, env);
    let page = match reason.page {
        Some(page) if reason.is_cow_fault() => page,
        _ => return Err(reason.reject()),
    };
    ScratchPage::stage(env, page)?.commit(page)
}

/// The page fault handler `fork` installs.
///
/// Resolves COW faults with [`handle_cow_fault`]; any error terminates the
/// environment.
pub fn pgfault<E: UserEnv + ?Sized>(env: &E, utf: &UTrapframe) {
    if let Err(e) = handle_cow_fault(env, utf) {
        fatal(env, e)
    }
}
