//! Environments.
//!
//! An environment is this system's process: an isolated address space with a
//! single thread of execution, a scheduling status, and an optional page
//! fault upcall. The kernel keeps a fixed-size table of [`Env`] descriptors
//! and exports it read-only to every environment.
//!
//! An environment never changes another environment's descriptor directly.
//! It uses the [`Syscall`] primitives, which the kernel only allows on the
//! caller itself or on its immediate children.

use crate::{
    addressing::Va,
    mm::{UserMemory, page_table::PageTableView},
    pgfault::PgFaultHandler,
    syscall::Syscall,
};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Log2 of the size of the environment table.
pub const LOG2NENV: usize = 10;

/// Number of slots in the environment table.
pub const NENV: usize = 1 << LOG2NENV;

/// Identifier of an environment.
///
/// The low [`LOG2NENV`] bits select the slot in the environment table; the
/// upper bits are a generation number, so a stale identifier of a destroyed
/// environment never names the slot's next occupant. The value `0` is
/// reserved: passed to a system call it means "the caller", and returned by
/// [`Syscall::exofork`] it means "you are the new child".
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EnvId(pub u32);

impl EnvId {
    /// The calling environment, in any system call argument.
    pub const CURRENT: EnvId = EnvId(0);

    /// Slot of this environment in the environment table (`ENVX`).
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize & (NENV - 1)
    }

    /// Whether this is the reserved identifier `0`.
    #[inline]
    pub const fn is_current(self) -> bool {
        self.0 == 0
    }
}

impl core::fmt::Debug for EnvId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "EnvId({:08x})", self.0)
    }
}

impl core::fmt::Display for EnvId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Scheduling status of an environment.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum EnvStatus {
    /// The slot is unused.
    Free = 0,
    /// The environment is being torn down.
    Dying = 1,
    /// The scheduler may pick the environment.
    Runnable = 2,
    /// The environment is on a CPU right now.
    Running = 3,
    /// The environment exists but must not be scheduled.
    NotRunnable = 4,
}

/// An environment descriptor, as exported by the kernel's environment table.
///
/// This is a snapshot: the kernel may change the live descriptor at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Env {
    /// Identifier of the environment.
    pub id: EnvId,
    /// Identifier of the environment that created it.
    pub parent_id: EnvId,
    /// Current scheduling status.
    pub status: EnvStatus,
    /// Registered page fault upcall, if any.
    pub pgfault_upcall: Option<Va>,
}

/// The full context a user environment runs in.
///
/// This bundles the system call interface with the caller's read-only views
/// of itself, plus two pieces of process-wide state that live in the
/// environment's own memory: the user-level page fault handler and the
/// address of the shared upcall trampoline.
pub trait UserEnv: Syscall + PageTableView + UserMemory {
    /// Address of the fault trampoline every environment shares.
    ///
    /// The kernel transfers control here, on the exception stack, whenever
    /// the environment takes a page fault in user mode.
    fn upcall_entry(&self) -> Va;

    /// The user-level page fault handler of this environment, if one has
    /// been registered.
    fn pgfault_handler(&self) -> Option<PgFaultHandler<Self>>;

    /// Stores `handler` as this environment's user-level page fault handler.
    ///
    /// Use [`set_pgfault_handler`] instead, which also makes sure the kernel
    /// knows where to deliver the faults.
    ///
    /// [`set_pgfault_handler`]: crate::pgfault::set_pgfault_handler
    fn store_pgfault_handler(&self, handler: PgFaultHandler<Self>);

    /// Reads the descriptor of `id` from the kernel's environment table.
    ///
    /// Returns `None` if the slot holds a different (or no) environment.
    fn env(&self, id: EnvId) -> Option<Env>;
}
