//! The abyss of the user library that talks to the kernel directly.
//!
//! This crate contains the pieces of a user environment that sit right on top
//! of the hardware and the kernel's system call boundary: address types, the
//! `syscall` instruction, and the console sink behind the print macros.
//!
//! You are **not** supposed to use this crate directly to build the fork
//! library. Instead, see the [`ulib`] crate which wraps every item here in the
//! interfaces the rest of the workspace programs against.
//!
//! [`ulib`]: ../ulib/index.html
#![no_std]
#![allow(clippy::missing_safety_doc)]

use core::sync::atomic::AtomicBool;

#[macro_use]
pub mod kprint;
pub mod addressing;
#[macro_use]
pub mod syscall;

pub use addressing::{Pa, Va};

/// Silences `info!`, `warning!`, and `debug!` when set.
#[doc(hidden)]
pub static QUITE: AtomicBool = AtomicBool::new(false);
