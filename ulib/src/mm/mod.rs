//! User address space layout and raw page access.
//!
//! The lower half of the virtual address space belongs to the environment.
//! Its layout is fixed at compile time and shared with the kernel:
//!
//! ```text
//!                      +------------------------------+ UVPT + ...
//!                      |  recursive page-table views  |  (read-only)
//!    UVPT ---------->  +------------------------------+ 0x100_0000_0000
//!                      |            unused            |
//!                      +------------------------------+
//!                      |  environment table (RO, 2M)  |
//!    UENVS --------->  +------------------------------+ 0x80_0020_0000
//!                      |            unused            |
//!    UTOP,UXSTACKTOP > +------------------------------+ 0x80_0000_0000
//!                      |   user exception stack (1p)  |  private, never COW
//!                      +------------------------------+
//!                      |      empty guard page        |
//!    USTACKTOP ----->  +------------------------------+
//!                      |   normal user stack, data,   |
//!                      |   text ... (walked by fork)  |
//!    UTEXT --------->  +------------------------------+ 0x80_0000
//!                      |  PFTEMP (fault scratch page) |
//!    UTEMP --------->  +------------------------------+ 0x20_0000
//!                      |            unused            |
//!                      +------------------------------+ 0
//! ```
pub mod page_table;

use crate::addressing::{PAGE_SIZE, Va};

/// Bytes mapped by one page directory entry (2 MiB).
pub const PTSIZE: usize = PAGE_SIZE * 512;

/// Start of the scratch region used for temporary mappings.
pub const UTEMP: Va = Va::from_page_number(PTSIZE / PAGE_SIZE);

/// The page the copy-on-write fault handler stages its copies in.
pub const PFTEMP: Va = Va::from_page_number((UTEMP.into_usize() + PTSIZE - PAGE_SIZE) / PAGE_SIZE);

/// Lowest address of a user program's text.
pub const UTEXT: Va = Va::from_page_number(4 * PTSIZE / PAGE_SIZE);

/// Top of the user-controlled part of the address space.
pub const UTOP: Va = Va::from_page_number(0x80_0000_0000 / PAGE_SIZE);

/// Read-only copy of the kernel's environment table.
pub const UENVS: Va = Va::from_page_number((UTOP.into_usize() + PTSIZE) / PAGE_SIZE);

/// Top of the one-page user exception stack.
pub const UXSTACKTOP: Va = UTOP;

/// Top of the normal user stack.
///
/// One unmapped page separates it from the exception stack, so an overflow
/// of the exception stack faults instead of silently corrupting the stack.
pub const USTACKTOP: Va = Va::from_page_number((UTOP.into_usize() - 2 * PAGE_SIZE) / PAGE_SIZE);

/// Raw access to the calling environment's own pages.
pub trait UserMemory {
    /// Copies the whole page at `src` over the whole page at `dst`.
    ///
    /// Both addresses must be page-aligned and mapped in the caller; `dst`
    /// must be writable.
    fn copy_page(&self, dst: Va, src: Va);
}
