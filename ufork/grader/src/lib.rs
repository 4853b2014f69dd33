//! Host-side grader for `ufork`.
//!
//! The fork library only talks to the kernel through the traits of `ulib`.
//! This crate implements those traits over a simulated kernel, [`Machine`],
//! so the library can be exercised with plain `cargo test`:
//!
//! - [`Machine`] owns the environment table, the physical frames, every
//!   environment's page table, and a log of the system calls made.
//! - [`SimEnv`] is one environment's view of the machine. It implements
//!   [`UserEnv`], and its [`SimEnv::read`] and [`SimEnv::write`] act like
//!   user-mode memory accesses: a protection violation is delivered to the
//!   environment's page fault upcall, just as the real kernel would.
//!
//! An environment that terminates (through [`Syscall::exit`], or because the
//! kernel killed it) unwinds with an [`EnvExit`] payload. Wrap code that may
//! terminate in [`run`].
//!
//! [`UserEnv`]: ulib::env::UserEnv
//! [`Syscall::exit`]: ulib::syscall::Syscall::exit

pub mod console;
mod env;
mod machine;

pub use env::SimEnv;
pub use machine::{Call, Machine};

use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use ulib::env::EnvId;

/// Unwinding payload of a terminated environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvExit(pub EnvId);

/// Runs `f`, catching the termination of a simulated environment.
///
/// Any other panic keeps unwinding.
pub fn run<R>(f: impl FnOnce() -> R) -> Result<R, EnvExit> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(r) => Ok(r),
        Err(payload) => match payload.downcast::<EnvExit>() {
            Ok(exit) => Err(*exit),
            Err(payload) => resume_unwind(payload),
        },
    }
}
