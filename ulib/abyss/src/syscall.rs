//! The system call boundary.
//!
//! A user environment enters the kernel with the `syscall` instruction. The
//! system call number is passed in `%rax` and up to five arguments in `%rdi`,
//! `%rsi`, `%rdx`, `%r10`, and `%r8`. The kernel returns a single `isize` in
//! `%rax`: a non-negative value on success, or a negative errno on failure.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// System call numbers understood by the kernel.
///
/// The numeric values are part of the kernel ABI and must not change.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum SyscallNumber {
    /// Print a string to the system console.
    Cputs = 0,
    /// Get the identifier of the calling environment.
    Getenvid = 2,
    /// Destroy an environment.
    EnvDestroy = 3,
    /// Allocate a zeroed page and map it.
    PageAlloc = 4,
    /// Map a page of one environment into another.
    PageMap = 5,
    /// Remove a mapping.
    PageUnmap = 6,
    /// Create a blank, not-runnable child environment.
    Exofork = 7,
    /// Change the scheduling status of an environment.
    EnvSetStatus = 8,
    /// Register the page fault upcall of an environment.
    EnvSetPgfaultUpcall = 9,
}

impl SyscallNumber {
    /// Short name used in diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            SyscallNumber::Cputs => "sys_cputs",
            SyscallNumber::Getenvid => "sys_getenvid",
            SyscallNumber::EnvDestroy => "sys_env_destroy",
            SyscallNumber::PageAlloc => "sys_page_alloc",
            SyscallNumber::PageMap => "sys_page_map",
            SyscallNumber::PageUnmap => "sys_page_unmap",
            SyscallNumber::Exofork => "sys_exofork",
            SyscallNumber::EnvSetStatus => "sys_env_set_status",
            SyscallNumber::EnvSetPgfaultUpcall => "sys_env_set_pgfault_upcall",
        }
    }
}

impl core::fmt::Display for SyscallNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Execute a syscall instruction with given arguments.
#[cfg(target_arch = "x86_64")]
#[macro_export]
macro_rules! syscall {
    ($nr:expr) => {
        unsafe {
            let result: isize;
            core::arch::asm!(
                "syscall",
                inlateout("rax") $nr as usize => result,
                lateout("rcx") _,
                lateout("r11") _,
                options(nostack)
            );
            result
        }
    };
    ($nr:expr, $arg1:expr) => {
        unsafe {
            let result: isize;
            core::arch::asm!(
                "syscall",
                inlateout("rax") $nr as usize => result,
                in("rdi") $arg1,
                lateout("rcx") _,
                lateout("r11") _,
                options(nostack)
            );
            result
        }
    };
    ($nr:expr, $arg1:expr, $arg2:expr) => {
        unsafe {
            let result: isize;
            core::arch::asm!(
                "syscall",
                inlateout("rax") $nr as usize => result,
                in("rdi") $arg1,
                in("rsi") $arg2,
                lateout("rcx") _,
                lateout("r11") _,
                options(nostack)
            );
            result
        }
    };
    ($nr:expr, $arg1:expr, $arg2:expr, $arg3:expr) => {
        unsafe {
            let result: isize;
            core::arch::asm!(
                "syscall",
                inlateout("rax") $nr as usize => result,
                in("rdi") $arg1,
                in("rsi") $arg2,
                in("rdx") $arg3,
                lateout("rcx") _,
                lateout("r11") _,
                options(nostack)
            );
            result
        }
    };
    ($nr:expr, $arg1:expr, $arg2:expr, $arg3:expr, $arg4:expr, $arg5:expr) => {
        unsafe {
            let result: isize;
            core::arch::asm!(
                "syscall",
                inlateout("rax") $nr as usize => result,
                in("rdi") $arg1,
                in("rsi") $arg2,
                in("rdx") $arg3,
                in("r10") $arg4,
                in("r8") $arg5,
                lateout("rcx") _,
                lateout("r11") _,
                options(nostack)
            );
            result
        }
    };
}
