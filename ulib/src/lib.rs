//! # ulib: the user-level library of an exokernel environment
//!
//! In an exokernel, the kernel only multiplexes the hardware. It hands out
//! physical pages, installs mappings on request, creates blank environments,
//! and forwards page faults back to the environment that took them. Policies
//! that a monolithic kernel would implement internally, such as `fork`, live
//! in user space on top of a handful of system calls.
//!
//! This crate is that handful of system calls plus the read-only views an
//! environment has of its own state, expressed as Rust interfaces:
//!
//! - [`Syscall`]: the kernel primitives (allocate, map, unmap, create a child,
//!   set status, register the fault upcall, ...).
//! - [`PageTableView`]: a read-only view of the caller's own 4-level page
//!   table.
//! - [`UserMemory`]: raw access to the caller's own pages.
//! - [`UserEnv`]: everything above, plus the process-wide page fault handler
//!   slot and the kernel's environment table.
//!
//! Algorithms (see the `ufork` crate) are written against these traits only.
//! The `syscall::native` module implements them for a real x86_64
//! environment; a test harness can implement them over a simulated machine.
//!
//! ## Error convention
//!
//! Every primitive returns `Result<_, KernelError>`. On the wire the kernel
//! returns a negative errno; [`KernelError::try_from`] turns it back into a
//! variant.
//!
//! [`Syscall`]: syscall::Syscall
//! [`PageTableView`]: mm::page_table::PageTableView
//! [`UserMemory`]: mm::UserMemory
//! [`UserEnv`]: env::UserEnv

#![no_std]
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

#[macro_use]
extern crate abyss;

pub mod env;
pub mod mm;
pub mod pgfault;
pub mod syscall;

pub use abyss::{QUITE, addressing, debug, info, kprint, print, println, warning};

/// Enum representing errors that the kernel reports to a user environment.
///
/// Each variant corresponds to a specific errno the kernel may return from a
/// system call. The numeric values follow the Linux errno table.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum KernelError {
    /// Operation is not permitted. (EPERM)
    OperationNotPermitted,
    /// The environment does not exist or the caller may not touch it. (ESRCH)
    NoSuchEnv,
    /// No free environment slot; try again later. (EAGAIN)
    TryAgain,
    /// Out of memory. (ENOMEM)
    NoMemory,
    /// Permission denied. (EACCES)
    InvalidAccess,
    /// Bad address. (EFAULT)
    BadAddress,
    /// Invalid arguement. (EINVAL)
    InvalidArgument,
    /// Invalid system call number. (ENOSYS)
    NoSuchSyscall,
    /// Operation is not supported. (ENOTSUPP)
    NotSupportedOperation,
}

impl KernelError {
    /// Converts the [`KernelError`] enum into the negative errno the kernel
    /// places in `%rax`.
    pub fn into_isize(self) -> isize {
        match self {
            KernelError::OperationNotPermitted => -1,
            KernelError::NoSuchEnv => -3,
            KernelError::TryAgain => -11,
            KernelError::NoMemory => -12,
            KernelError::InvalidAccess => -13,
            KernelError::BadAddress => -14,
            KernelError::InvalidArgument => -22,
            KernelError::NoSuchSyscall => -38,
            KernelError::NotSupportedOperation => -524,
        }
    }

    /// Converts the [`KernelError`] enum into a corresponding `usize` error
    /// code, as seen in a raw register.
    pub fn into_usize(self) -> usize {
        self.into_isize() as usize
    }
}

impl core::fmt::Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?} ({})", self, self.into_isize())
    }
}

/// The given `isize` does not indicate an [`KernelError`].
#[derive(Debug, Eq, PartialEq)]
pub struct TryFromError {
    e: isize,
}

impl TryFrom<isize> for KernelError {
    type Error = TryFromError;

    fn try_from(value: isize) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::OperationNotPermitted),
            -3 => Ok(Self::NoSuchEnv),
            -11 => Ok(Self::TryAgain),
            -12 => Ok(Self::NoMemory),
            -13 => Ok(Self::InvalidAccess),
            -14 => Ok(Self::BadAddress),
            -22 => Ok(Self::InvalidArgument),
            -38 => Ok(Self::NoSuchSyscall),
            -524 => Ok(Self::NotSupportedOperation),
            e => Err(TryFromError { e }),
        }
    }
}
