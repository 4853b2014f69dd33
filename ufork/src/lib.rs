//! # Copy-on-write `fork` in user space
//!
//! In an exokernel, `fork` is not a system call. The kernel only knows how to
//! create a blank child environment ([`Syscall::exofork`]) and how to map a
//! page of one environment into another ([`Syscall::page_map`]). This crate
//! builds a Unix-style `fork` out of those primitives, with copy-on-write
//! (COW) sharing so that duplicating an address space copies no data up
//! front.
//!
//! The implementation consists of three cooperating pieces:
//!
//! - [`Fault Handler`]: runs on every user-mode page fault. A write to a
//!   page marked [`PteFlags::COW`] gets a private, writable copy of the page;
//!   any other fault is a real error and terminates the environment.
//!
//! - [`Page Duplicator`]: maps one page into the child. Writable or COW
//!   pages become read-only COW pages in *both* the child and the parent,
//!   sharing one physical frame; read-only pages are simply shared.
//!
//! - [`Fork`]: registers the fault handler, creates the child, walks the
//!   parent's user address space with [`PresentPages`] and duplicates every
//!   present page, gives the child its own exception stack and fault upcall,
//!   and finally marks it runnable.
//!
//! ## Copy-On-Write
//!
//! After `fork`, parent and child share every page. Neither side has a
//! hardware-writable mapping of a shared page, so the first write by either
//! side faults. The fault handler then allocates a fresh page at the scratch
//! address [`PFTEMP`], copies the shared contents into it, and maps it over
//! the faulting address, writable and no longer COW. The other side keeps
//! the original frame and faults on its own first write.
//!
//! The order in [`duppage`] matters: the child's mapping is installed before
//! the parent's own mapping is downgraded. If the parent went first, a write
//! by the parent between the two steps (on its stack, say) would give the
//! parent a private copy and leave the child mapping the *old* frame, which
//! the parent would no longer consider shared.
//!
//! ## Errors
//!
//! Every operation reports failure as a [`ForkError`]. The `try_*` variants
//! return it; [`fork`], [`sfork`] and [`pgfault`] treat any error as fatal
//! and terminate the environment through [`fatal`].
//!
//! [`Fault Handler`]: mod@fault
//! [`Page Duplicator`]: mod@duppage
//! [`Fork`]: mod@crate::fork
//! [`Syscall::exofork`]: ulib::syscall::Syscall::exofork
//! [`Syscall::page_map`]: ulib::syscall::Syscall::page_map
//! [`PteFlags::COW`]: ulib::mm::page_table::PteFlags::COW
//! [`PFTEMP`]: ulib::mm::PFTEMP
//! [`PresentPages`]: walk::PresentPages
//! [`duppage`]: duppage::duppage
//! [`fork`]: fork::fork
//! [`sfork`]: fork::sfork
//! [`pgfault`]: fault::pgfault

#![no_std]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod duppage;
pub mod fault;
pub mod fork;
pub mod walk;

pub use fork::{ForkResult, fork, sfork, try_fork, try_sfork};

use ulib::{
    KernelError,
    addressing::Va,
    env::EnvId,
    mm::page_table::PteFlags,
    pgfault::FaultErrorCode,
    println,
    syscall::{Syscall, SyscallError, SyscallNumber},
};

/// Reasons a fork or a fault resolution fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkError {
    /// A page fault that is not a write to a present COW page.
    ///
    /// Nothing was copied. `perm` is `None` if the faulting page is not
    /// mapped at all.
    NotCopyOnWrite {
        /// The faulting address, as reported by the CPU.
        fault_va: usize,
        /// The CPU's error code.
        err: FaultErrorCode,
        /// Flags of the faulting page at the time of the fault.
        perm: Option<PteFlags>,
    },
    /// A kernel primitive failed.
    Syscall {
        /// The primitive that failed.
        sysno: SyscallNumber,
        /// The page the call was about, if any.
        va: Option<Va>,
        /// What the kernel returned.
        error: KernelError,
    },
    /// The new child could not find its own descriptor in the environment
    /// table.
    NoSuchEnv(EnvId),
    /// The operation is not implemented.
    Unsupported,
}

impl ForkError {
    /// Returns a closure that turns a [`KernelError`] from the primitive
    /// `sysno` into a [`ForkError::Syscall`].
    pub fn syscall(sysno: SyscallNumber, va: Option<Va>) -> impl FnOnce(KernelError) -> Self {
        move |error| ForkError::Syscall { sysno, va, error }
    }
}

impl From<SyscallError> for ForkError {
    fn from(SyscallError { sysno, va, error }: SyscallError) -> Self {
        ForkError::Syscall { sysno, va, error }
    }
}

impl From<ForkError> for KernelError {
    fn from(e: ForkError) -> KernelError {
        match e {
            ForkError::NotCopyOnWrite { .. } => KernelError::BadAddress,
            ForkError::Syscall { error, .. } => error,
            ForkError::NoSuchEnv(_) => KernelError::NoSuchEnv,
            ForkError::Unsupported => KernelError::InvalidArgument,
        }
    }
}

impl core::fmt::Display for ForkError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ForkError::NotCopyOnWrite {
                fault_va,
                err,
                perm: Some(perm),
            } => write!(
                f,
                "not a write to a COW page: va {:#x} err {:#x} perm {:#x}",
                fault_va,
                err.bits(),
                perm.bits()
            ),
            ForkError::NotCopyOnWrite {
                fault_va,
                err,
                perm: None,
            } => write!(
                f,
                "not a write to a COW page: va {:#x} err {:#x} (unmapped)",
                fault_va,
                err.bits()
            ),
            ForkError::Syscall {
                sysno,
                va: Some(va),
                error,
            } => write!(f, "{} at {}: {}", sysno, va, error),
            ForkError::Syscall {
                sysno,
                va: None,
                error,
            } => write!(f, "{}: {}", sysno, error),
            ForkError::NoSuchEnv(id) => write!(f, "no descriptor for environment {}", id),
            ForkError::Unsupported => write!(f, "sfork is not supported"),
        }
    }
}

/// Prints `err` as a user panic and terminates the calling environment.
///
/// The message reads `[<envid>] user panic: <err>`.
pub fn fatal<E: Syscall + ?Sized>(env: &E, err: ForkError) -> ! {
    println!("[{}] user panic: {}", env.getenvid(), err);
    env.exit()
}
