//! System call infrastructure.
//!
//! The kernel exports a deliberately small set of primitives. Each of them
//! acts either on the caller (named by [`EnvId::CURRENT`]) or on one of the
//! caller's immediate children; the kernel rejects anything else with
//! [`KernelError::NoSuchEnv`].
//!
//! | Primitive                   | Number |
//! |-----------------------------|--------|
//! | `cputs`                     | 0      |
//! | `getenvid`                  | 2      |
//! | `env_destroy`               | 3      |
//! | `page_alloc`                | 4      |
//! | `page_map`                  | 5      |
//! | `page_unmap`                | 6      |
//! | `exofork`                   | 7      |
//! | `env_set_status`            | 8      |
//! | `env_set_pgfault_upcall`    | 9      |
//!
//! Code in this workspace never issues a `syscall` instruction itself. It
//! calls the methods of the [`Syscall`] trait, which a backend implements:
//! `native` on a real machine, a simulated kernel in tests.
use crate::{
    KernelError,
    addressing::Va,
    env::{EnvId, EnvStatus},
    mm::page_table::PteFlags,
};
pub use abyss::syscall::SyscallNumber;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod native;

/// Decodes the raw return value of a system call.
///
/// A non-negative value is a success and is returned as is. A negative value
/// is an errno; values this library does not know are reported as
/// [`KernelError::InvalidArgument`].
pub fn decode(ret: isize) -> Result<usize, KernelError> {
    if ret >= 0 {
        Ok(ret as usize)
    } else {
        Err(KernelError::try_from(ret).unwrap_or(KernelError::InvalidArgument))
    }
}

/// A failed system call, with enough context to report it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallError {
    /// The primitive that failed.
    pub sysno: SyscallNumber,
    /// The page the call was about, if any.
    pub va: Option<Va>,
    /// What the kernel returned.
    pub error: KernelError,
}

impl SyscallError {
    /// Returns a closure that attaches `sysno` and `va` to a [`KernelError`].
    ///
    /// Meant for `map_err`:
    ///
    /// ```
    /// # use ulib::{KernelError, syscall::{SyscallError, SyscallNumber}};
    /// let r: Result<(), KernelError> = Err(KernelError::NoMemory);
    /// let e = r.map_err(SyscallError::with(SyscallNumber::Exofork, None)).unwrap_err();
    /// assert_eq!(e.error, KernelError::NoMemory);
    /// ```
    pub fn with(sysno: SyscallNumber, va: Option<Va>) -> impl FnOnce(KernelError) -> Self {
        move |error| SyscallError { sysno, va, error }
    }
}

impl From<SyscallError> for KernelError {
    fn from(e: SyscallError) -> KernelError {
        e.error
    }
}

impl core::fmt::Display for SyscallError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.va {
            Some(va) => write!(f, "{} at {}: {}", self.sysno, va, self.error),
            None => write!(f, "{}: {}", self.sysno, self.error),
        }
    }
}

/// The kernel primitives available to a user environment.
///
/// Each method is a single, synchronous call into the kernel. None of them
/// retries or blocks on the caller's behalf.
pub trait Syscall {
    /// Returns the identifier of the calling environment.
    fn getenvid(&self) -> EnvId;

    /// Writes `s` to the system console.
    fn cputs(&self, s: &str);

    /// Allocates a zero-filled page and maps it at `va` in `env` with `perm`.
    ///
    /// Any page previously mapped at `va` is unmapped first.
    ///
    /// # Errors
    /// - [`KernelError::NoSuchEnv`]: `env` is not the caller or its child.
    /// - [`KernelError::InvalidArgument`]: `va` is at or above
    ///   [`UTOP`](crate::mm::UTOP), not page-aligned, or `perm` is not a
    ///   subset of [`PteFlags::SYSCALL`] containing `P | US`.
    /// - [`KernelError::NoMemory`]: no frame or page table could be
    ///   allocated.
    fn page_alloc(&self, env: EnvId, va: Va, perm: PteFlags) -> Result<(), KernelError>;

    /// Maps the frame behind `src_va` in `src_env` at `dst_va` in `dst_env`
    /// with `perm`.
    ///
    /// Both environments then share one physical frame.
    ///
    /// # Errors
    /// In addition to the errors of [`Syscall::page_alloc`]:
    /// - [`KernelError::InvalidArgument`]: nothing is mapped at `src_va`, or
    ///   `perm` asks for `RW` but the source mapping is read-only.
    fn page_map(
        &self,
        src_env: EnvId,
        src_va: Va,
        dst_env: EnvId,
        dst_va: Va,
        perm: PteFlags,
    ) -> Result<(), KernelError>;

    /// Unmaps the page at `va` in `env`. Unmapping an absent page succeeds.
    fn page_unmap(&self, env: EnvId, va: Va) -> Result<(), KernelError>;

    /// Creates a child environment with an empty address space and the
    /// caller's register state.
    ///
    /// The child starts out [`EnvStatus::NotRunnable`]. In the parent this
    /// returns the child's identifier; when the child is eventually
    /// scheduled, the very same call returns [`EnvId::CURRENT`] in it.
    ///
    /// # Errors
    /// - [`KernelError::TryAgain`]: the environment table is full.
    /// - [`KernelError::NoMemory`]: out of memory.
    fn exofork(&self) -> Result<EnvId, KernelError>;

    /// Sets the scheduling status of `env`.
    fn env_set_status(&self, env: EnvId, status: EnvStatus) -> Result<(), KernelError>;

    /// Registers `upcall` as the page fault entry point of `env`.
    fn env_set_pgfault_upcall(&self, env: EnvId, upcall: Va) -> Result<(), KernelError>;

    /// Destroys `env`, releasing every page it maps.
    fn env_destroy(&self, env: EnvId) -> Result<(), KernelError>;

    /// Destroys the calling environment. Never returns.
    fn exit(&self) -> !;
}
