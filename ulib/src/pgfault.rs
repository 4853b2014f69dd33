//! User-level page fault handling.
//!
//! The kernel does not resolve page faults taken in user mode. It pushes a
//! [`UTrapframe`] onto the faulting environment's exception stack (the page
//! just below [`UXSTACKTOP`]) and resumes the environment at its registered
//! upcall. The upcall is a small trampoline shared by every environment; it
//! calls [`dispatch`], which runs whatever handler the environment installed
//! with [`set_pgfault_handler`], and then restores the trap frame.
//!
//! The exception stack is the one page the environment must never fault on:
//! a fault while pushing a trap frame there cannot be delivered anywhere.
//! [`set_pgfault_handler`] therefore allocates it eagerly, writable and
//! private, the first time an environment installs a handler.
//!
//! [`UXSTACKTOP`]: crate::mm::UXSTACKTOP

use crate::{
    env::{EnvId, UserEnv},
    mm::{UXSTACKTOP, page_table::PteFlags},
    syscall::{SyscallError, SyscallNumber},
};
use abyss::addressing::PAGE_SIZE;

bitflags::bitflags! {
    /// Error code of a page fault, as pushed by the CPU.
    pub struct FaultErrorCode: usize {
        /// The fault was caused by a page-level protection violation; if
        /// clear, by a non-present page.
        const PRESENT = 1 << 0;
        /// The access causing the fault was a write.
        const WRITE = 1 << 1;
        /// The access was made in user mode.
        const USER = 1 << 2;
    }
}

/// Snapshot of an environment at the moment of a user-mode page fault.
///
/// The kernel builds this on the exception stack and passes it by reference
/// to the handler. It is only valid for the duration of that one call.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UTrapframe {
    /// The faulting virtual address (`%cr2`).
    pub fault_va: usize,
    /// Why the fault happened.
    pub err: FaultErrorCode,
    /// Instruction pointer of the faulting instruction.
    pub rip: usize,
    /// Flags register at the time of the fault.
    pub rflags: usize,
    /// Stack pointer at the time of the fault.
    pub rsp: usize,
}

/// A user-level page fault handler.
///
/// The handler runs on the exception stack in the faulting environment.
/// Returning resumes the faulting instruction; a handler that cannot resolve
/// the fault must terminate the environment instead of returning.
pub type PgFaultHandler<E> = fn(&E, &UTrapframe);

/// Installs `handler` as the caller's user-level page fault handler.
///
/// The first call in an environment also allocates the environment's
/// exception stack and registers the shared upcall with the kernel. Later
/// calls only replace the handler, so calling this repeatedly is cheap and
/// safe.
///
/// # Errors
/// The failed `page_alloc` or `env_set_pgfault_upcall`. The handler is not
/// installed in that case.
pub fn set_pgfault_handler<E: UserEnv + ?Sized>(
    env: &E,
    handler: PgFaultHandler<E>,
) -> Result<(), SyscallError> {
    if env.pgfault_handler().is_none() {
        let uxstack = UXSTACKTOP - PAGE_SIZE;
        env.page_alloc(EnvId::CURRENT, uxstack, PteFlags::USER_RW)
            .map_err(SyscallError::with(SyscallNumber::PageAlloc, Some(uxstack)))?;
        env.env_set_pgfault_upcall(EnvId::CURRENT, env.upcall_entry())
            .map_err(SyscallError::with(SyscallNumber::EnvSetPgfaultUpcall, None))?;
    }
    env.store_pgfault_handler(handler);
    Ok(())
}

/// Runs the caller's registered handler on `utf`.
///
/// This is what the upcall trampoline calls. A fault in an environment
/// without a handler cannot be resolved; the environment exits.
pub fn dispatch<E: UserEnv + ?Sized>(env: &E, utf: &UTrapframe) {
    match env.pgfault_handler() {
        Some(handler) => handler(env, utf),
        None => {
            println!(
                "[{}] unhandled page fault va {:#x} ip {:#x}",
                env.getenvid(),
                utf.fault_va,
                utf.rip
            );
            env.exit()
        }
    }
}
