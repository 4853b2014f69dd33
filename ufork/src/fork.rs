//! # `Fork` with Copy-On-Write optimization.
//!
//! `fork` creates a new environment by duplicating the calling one. The child
//! inherits the parent's memory layout and register state, and both continue
//! from the point of the call. The only difference is what the call returns:
//! the parent gets [`ForkResult::Parent`] with the child's id, the child gets
//! [`ForkResult::Child`] with its own descriptor.
//!
//! The whole duplication runs in the parent, in user space:
//! 1. Install [`pgfault`] as the parent's page fault handler. The first
//!    installation also allocates the parent's exception stack.
//! 2. `exofork` a blank, not-yet-runnable child.
//! 3. Walk the user range `[UTEXT, USTACKTOP)` with [`PresentPages`] and
//!    [`duppage`] every present, user-accessible page into the child.
//! 4. Register the fault upcall for the child, and give it a fresh exception
//!    stack. The exception stack is the one page that is never shared: the
//!    kernel writes trap frames onto it, which must not itself fault.
//! 5. Mark the child runnable.
//!
//! If anything fails after step 2, the half-built child is destroyed before
//! the error is returned, so a failed fork leaves no environment behind.
//!
//! [`pgfault`]: crate::fault::pgfault
//! [`duppage`]: crate::duppage::duppage

use crate::{ForkError, duppage::duppage, fatal, fault::pgfault, walk::PresentPages};
use ulib::{
    addressing::PAGE_SIZE,
    debug,
    env::{Env, EnvId, EnvStatus, UserEnv},
    mm::{USTACKTOP, UTEXT, UXSTACKTOP, page_table::PteFlags},
    pgfault::set_pgfault_handler,
    syscall::SyscallNumber,
    warning,
};

/// What [`fork`] returns, on each side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkResult {
    /// Returned in the parent: the id of the new child.
    Parent(EnvId),
    /// Returned in the child: its own descriptor.
    Child(Env),
}

/// Creates a child environment sharing the caller's memory copy-on-write.
///
/// # Errors
/// - [`ForkError::Syscall`] if any primitive fails. When the child had
///   already been created, it is destroyed first.
/// - [`ForkError::NoSuchEnv`] if, in the child, the environment table has no
///   entry for the child itself.
pub fn try_fork<E: UserEnv + ?Sized>(env: &E) -> Result<ForkResult, ForkError> {
    set_pgfault_handler(env, pgfault::<E>)?;

    let child = env
        .exofork()
        .map_err(ForkError::syscall(SyscallNumber::Exofork, None))?;
    if child.is_current() {
        let id = env.getenvid();
        return env
            .env(id)
            .map(ForkResult::Child)
            .ok_or(ForkError::NoSuchEnv(id));
    }

    debug!("fork: [{}] created child [{}]", env.getenvid(), child);
    match populate(env, child) {
        Ok(()) => Ok(ForkResult::Parent(child)),
        Err(e) => {
            if let Err(destroy) = env.env_destroy(child) {
                warning!("fork: cannot destroy child [{}]: {}", child, destroy);
            }
            Err(e)
        }
    }
}

/// Fills the blank `child` with the caller's address space and starts it.
fn populate<E: UserEnv + ?Sized>(env: &E, child: EnvId) -> Result<(), ForkError> {
    for va in PresentPages::new(env, UTEXT, USTACKTOP) {
        if env.permissions(va).contains(PteFlags::US) {
            duppage(env, child, va.page_number())?;
        }
    }

    env.env_set_pgfault_upcall(child, env.upcall_entry())
        .map_err(ForkError::syscall(SyscallNumber::EnvSetPgfaultUpcall, None))?;
    let uxstack = UXSTACKTOP - PAGE_SIZE;
    env.page_alloc(child, uxstack, PteFlags::USER_RW)
        .map_err(ForkError::syscall(SyscallNumber::PageAlloc, Some(uxstack)))?;
    env.env_set_status(child, EnvStatus::Runnable)
        .map_err(ForkError::syscall(SyscallNumber::EnvSetStatus, None))
}

/// Like [`try_fork`], but terminates the caller on failure.
pub fn fork<E: UserEnv + ?Sized>(env: &E) -> ForkResult {
    match try_fork(env) {
        Ok(r) => r,
        Err(e) => fatal(env, e),
    }
}

/// Fork sharing all memory except the stack.
///
/// Not implemented: always fails with [`ForkError::Unsupported`].
pub fn try_sfork<E: UserEnv + ?Sized>(_env: &E) -> Result<ForkResult, ForkError> {
    Err(ForkError::Unsupported)
}

/// Like [`try_sfork`], but terminates the caller on failure, which is always.
pub fn sfork<E: UserEnv + ?Sized>(env: &E) -> ForkResult {
    match try_sfork(env) {
        Ok(r) => r,
        Err(e) => fatal(env, e),
    }
}
