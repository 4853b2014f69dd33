//! # Duplicating one page into the child.
//!
//! [`duppage`] decides how a single present page of the parent appears in
//! the child, based on the page's flags:
//!
//! | Parent flags        | Child gets               | Parent afterwards        |
//! |---------------------|--------------------------|--------------------------|
//! | `SHARE`             | same flags, same frame   | unchanged                |
//! | `RW` or `COW`       | `COW`, read-only         | `COW`, read-only         |
//! | anything else       | same flags, same frame   | unchanged                |
//!
//! In every case the child maps the parent's physical frame; no data is
//! copied here.

use crate::ForkError;
use ulib::{
    addressing::Va,
    env::EnvId,
    mm::page_table::{PageTableView, PteFlags},
    syscall::{Syscall, SyscallNumber},
};

/// Maps virtual page `pn` of the caller into `child` at the same address.
///
/// A writable or already-COW page is mapped into the child as COW first, and
/// only then remapped as COW in the caller itself. The caller's remap happens
/// even when the page was COW already.
///
/// The page must be present and user-accessible in the caller.
pub fn duppage<E>(env: &E, child: EnvId, pn: usize) -> Result<(), ForkError>
where
    E: Syscall + PageTableView + ?Sized,
{
    let va = Va::from_page_number(pn);
    let perm = env.permissions(va) & PteFlags::SYSCALL;
    let map = |dst: EnvId, perm: PteFlags| {
        env.page_map(EnvId::CURRENT, va, dst, va, perm)
            .map_err(ForkError::syscall(SyscallNumber::PageMap, Some(va)))
    };

    if perm.contains(PteFlags::SHARE) {
        map(child, perm)
    } else if perm.intersects(PteFlags::RW | PteFlags::COW) {
        let cow = (perm | PteFlags::P | PteFlags::US | PteFlags::COW) - PteFlags::RW;
        map(child, cow)?;
        map(EnvId::CURRENT, cow)
    } else {
        map(child, perm)
    }
}
