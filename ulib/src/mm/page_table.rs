//! Read-only view of the environment's own four-level page table.
//!
//! x86_64 translates a virtual address through four tables. Each level
//! consumes nine bits of the address:
//!
//! ```text
//! 63          48 47            39 38            30 29            21 20         12 11         0
//! +-------------+----------------+----------------+----------------+-------------+------------+
//! | Sign Extend |    Page-Map    | Page-Directory | Page-directory |  Page-Table |    Page    |
//! |             | Level-4 Offset |    Pointer     |     Offset     |   Offset    |   Offset   |
//! +-------------+----------------+----------------+----------------+-------------+------------+
//! ```
//!
//! The kernel owns these tables. A user environment may not write them, but
//! it may *read* its own entries: the kernel installs the root table into
//! one of its own slots ([`UVPT_SLOT`]), so the tables appear as plain,
//! read-only arrays at fixed addresses. [`Uvpt`] is that view.
//!
//! Algorithms never touch [`Uvpt`] directly. They take any
//! [`PageTableView`], which is all they need: presence of an entry at a
//! given level, and the permission bits of a leaf entry.

use crate::addressing::{PAGE_SHIFT, Va};

bitflags::bitflags! {
    /// Flags for pte.
    ///
    /// Bits 9 to 11 are ignored by the MMU and available to software. This
    /// library uses two of them: [`PteFlags::SHARE`] and [`PteFlags::COW`].
    pub struct PteFlags: usize {
        /// Present; must be 1 to map a 4-KByte page
        const P = 1 << 0;
        /// Read/write; if 0, writes may not be allowed to the 4-KByte page referenced by this entry
        const RW = 1 << 1;
        /// User/supervisor; if 0, user-mode accesses are not allowed to the 4-KByte page referenced by this entry
        const US = 1 << 2;
        /// Page-level write-through
        const PWT = 1 << 3;
        /// Page-level cache disable
        const PCD = 1 << 4;
        /// Accessed; indicates whether software has accessed the 4-KByte page referenced by this entry
        const A = 1 << 5;
        /// Dirty; indicates whether software has written to the 4-KByte page referenced by this entry
        const D = 1 << 6;
        /// Indirectly determines the memory type used to access the 4-KByte page referenced by this entry
        const PAT = 1 << 7;
        /// Global; if CR4.PGE = 1, determines whether the translation is global
        const G = 1 << 8;
        /// Available for software use; no meaning assigned.
        const AVAIL = 1 << 9;
        /// Shared page: `fork` maps it into the child as-is, writes stay visible to both.
        const SHARE = 1 << 10;
        /// Copy-on-write page: read-only in hardware, privately copied on the first write.
        const COW = 1 << 11;
        /// If IA32_EFER.NXE = 1, execute-disable
        const XD = 1 << 63;
    }
}

impl PteFlags {
    /// A present, user-accessible, writable page.
    pub const USER_RW: PteFlags =
        PteFlags::from_bits_truncate(PteFlags::P.bits() | PteFlags::US.bits() | PteFlags::RW.bits());

    /// Flags a user environment may pass to the mapping system calls.
    pub const SYSCALL: PteFlags = PteFlags::from_bits_truncate(
        PteFlags::P.bits()
            | PteFlags::RW.bits()
            | PteFlags::US.bits()
            | PteFlags::AVAIL.bits()
            | PteFlags::SHARE.bits()
            | PteFlags::COW.bits(),
    );

    /// Mask of the flag bits inside a raw entry; the rest is the frame
    /// address.
    pub const MASK: usize = 0xfff | (1 << 63);
}

/// One level of the four-level page table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    /// Page Map Level 4.
    Pml4,
    /// Page Directory Pointer table.
    Pdp,
    /// Page Directory.
    Pd,
    /// Page Table.
    Pt,
}

impl Level {
    /// All levels, from the root down to the leaf.
    pub const ALL: [Level; 4] = [Level::Pml4, Level::Pdp, Level::Pd, Level::Pt];

    /// Bit position of this level's index within a virtual address.
    #[inline]
    pub const fn shift(self) -> usize {
        match self {
            Level::Pml4 => 39,
            Level::Pdp => 30,
            Level::Pd => 21,
            Level::Pt => PAGE_SHIFT,
        }
    }

    /// Bytes of address space covered by a single entry at this level.
    ///
    /// When an entry at this level is absent, nothing in this span is
    /// mapped.
    #[inline]
    pub const fn span(self) -> usize {
        1 << self.shift()
    }

    /// Index of the entry covering `va` within its table at this level.
    #[inline]
    pub const fn index(self, va: Va) -> usize {
        (va.into_usize() >> self.shift()) & 0x1ff
    }
}

/// Page table indices of a given virtual address.
///
/// This decomposes a virtual address into the index it selects at each of
/// the four levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtIndices {
    /// The virtual address this breakdown belongs to.
    pub va: Va,
    /// Page Map Level 4 Index (PML4EI).
    pub pml4ei: usize,
    /// Page Directory Pointer table Index (PDPTEI).
    pub pdptei: usize,
    /// Page Directory Index (PDEI).
    pub pdei: usize,
    /// Page Table Index (PTEI).
    pub ptei: usize,
}

impl PtIndices {
    /// Extracts page table indices from a given virtual address ([`Va`]).
    pub const fn from_va(va: Va) -> Self {
        Self {
            va,
            pml4ei: Level::Pml4.index(va),
            pdptei: Level::Pdp.index(va),
            pdei: Level::Pd.index(va),
            ptei: Level::Pt.index(va),
        }
    }
}

/// Read-only access to the calling environment's own page table.
///
/// Implementations must always agree with the tables the kernel actually
/// uses for the caller. They are never written through.
pub trait PageTableView {
    /// Whether the entry at `level` that covers `va` is present.
    ///
    /// Callers must only ask about a level after they have observed every
    /// level above it present.
    fn is_present(&self, level: Level, va: Va) -> bool;

    /// Flags of the leaf entry mapping `va`.
    ///
    /// Callers must only ask after observing all four levels present.
    fn permissions(&self, va: Va) -> PteFlags;

    /// Flags of the leaf entry mapping `va`, or `None` if any level on the
    /// way to it is absent.
    fn lookup(&self, va: Va) -> Option<PteFlags> {
        if Level::ALL.iter().all(|level| self.is_present(*level, va)) {
            Some(self.permissions(va))
        } else {
            None
        }
    }
}

/// The recursive slot of the root table, chosen by the kernel.
pub const UVPT_SLOT: usize = 2;

/// Base of the page-table-entry view: `UVPT + 8 * vpn` holds the leaf entry
/// for virtual page number `vpn`.
pub const UVPT: usize = UVPT_SLOT << 39;
/// Base of the page-directory-entry view.
pub const UVPD: usize = UVPT | (UVPT_SLOT << 30);
/// Base of the page-directory-pointer-entry view.
pub const UVPDPE: usize = UVPD | (UVPT_SLOT << 21);
/// Base of the root-table view.
pub const UVPML4E: usize = UVPDPE | (UVPT_SLOT << 12);

/// The kernel-maintained, read-only recursive mapping of the caller's own
/// page table.
///
/// Each level is a flat array of raw 64-bit entries, indexed by the virtual
/// address shifted right by that level's [`Level::shift`].
pub struct Uvpt {
    _p: (),
}

impl Uvpt {
    /// Creates the view.
    ///
    /// # Safety
    /// The kernel must have installed the recursive mapping at [`UVPT`] for
    /// the calling environment.
    pub const unsafe fn new() -> Self {
        Self { _p: () }
    }

    fn entry(&self, level: Level, va: Va) -> usize {
        let (base, index) = match level {
            Level::Pml4 => (UVPML4E, va.into_usize() >> Level::Pml4.shift()),
            Level::Pdp => (UVPDPE, va.into_usize() >> Level::Pdp.shift()),
            Level::Pd => (UVPD, va.into_usize() >> Level::Pd.shift()),
            Level::Pt => (UVPT, va.into_usize() >> Level::Pt.shift()),
        };
        // The index is already bounded by the user half of the address space.
        unsafe { core::ptr::read_volatile((base as *const usize).add(index & 0xf_ffff_ffff)) }
    }
}

impl PageTableView for Uvpt {
    fn is_present(&self, level: Level, va: Va) -> bool {
        self.entry(level, va) & PteFlags::P.bits() != 0
    }

    fn permissions(&self, va: Va) -> PteFlags {
        PteFlags::from_bits_truncate(self.entry(Level::Pt, va) & PteFlags::MASK)
    }
}
