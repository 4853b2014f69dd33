//! Physical and Virtual Memory Addressing Schemes.
//!
//! A user environment never dereferences physical memory. It still needs to
//! talk about it: the kernel hands out physical frames, and two environments
//! that share a copy-on-write page share the same frame. This module provides
//! [`Va`] for virtual addresses and [`Pa`] for physical addresses, plus the
//! page-granularity helpers the paging code relies on.
//!
//! Both types support the arithmetic operators (`+`, `-`, `|`, `&` with a
//! `usize`), so address arithmetic reads the same as it would on raw integers
//! while keeping the two address spaces apart at the type level.
//!
//! ## Example Usage:
//!
//! ```
//! use abyss::addressing::{PAGE_SIZE, Va};
//!
//! let va = Va::new(0x80_1234).unwrap();
//! assert_eq!(va.page_down().into_usize(), 0x80_1000);
//! assert_eq!((va.page_down() + PAGE_SIZE).into_usize(), 0x80_2000);
//! ```

/// The size of a single page in memory, in bytes.
///
/// Every mapping the kernel installs for a user environment covers exactly
/// one page of this size, and the fault handler always copies exactly this
/// many bytes.
pub const PAGE_SIZE: usize = 0x1000;

/// The shift amount to get the page number from a given address.
///
/// ## Example:
/// ```
/// # use abyss::addressing::PAGE_SHIFT;
/// let page_number = 0x5000usize >> PAGE_SHIFT;
/// assert_eq!(page_number, 5);
/// ```
pub const PAGE_SHIFT: usize = 12; // 12 bits (log2 of 4 KB)

/// A mask for extracting the offset within a page from a given address.
pub const PAGE_MASK: usize = 0xfff;

/// Represents a physical address.
///
/// User environments only ever observe physical addresses as opaque frame
/// identities (e.g. to tell whether two mappings share one frame).
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Pa(usize);

impl Pa {
    /// The physical address `0`.
    pub const ZERO: Self = Self(0);

    /// Creates a new physical address if the address is valid.
    ///
    /// The address must be less than `0xffff_0000_0000_0000`.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < 0xffff_0000_0000_0000 {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Cast the physical address into a raw `usize`.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Align down the physical address to the page boundary.
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Extracts the page offset from the physical address.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }
}

/// Represents a virtual address.
///
/// The [`Va`] (Virtual Address) struct represents an address in the virtual
/// memory space of a user environment.
///
/// This abstraction provides utility methods for validation, alignment, and
/// conversion between addresses and page numbers.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Va(usize);

impl Va {
    /// Creates a new virtual address if the address is canonical.
    ///
    /// # Returns
    /// - `Some(Va)`: If bits 47..=63 are all zeros or all ones.
    /// - `None`: If the address is not canonical.
    ///
    /// # Example
    /// ```
    /// # use abyss::addressing::Va;
    /// assert!(Va::new(0xFFFF_8000_1234_5678).is_some());
    /// assert!(Va::new(0xFFFF_7000_1234_5678).is_none());
    /// ```
    #[inline(always)]
    pub const fn new(addr: usize) -> Option<Self> {
        match addr & 0xffff_8000_0000_0000 {
            m if m == 0xffff_8000_0000_0000 || m == 0 => Some(Self(addr)),
            _ => None,
        }
    }

    /// Builds the virtual address of the first byte of page number `pn`.
    ///
    /// Only meaningful for the lower half of the address space, which is the
    /// only half a user environment owns.
    #[inline]
    pub const fn from_page_number(pn: usize) -> Self {
        Self(pn << PAGE_SHIFT)
    }

    /// Returns the raw `usize` representation of the virtual address.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Returns the virtual page number of this address.
    #[inline]
    pub const fn page_number(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// Aligns the virtual address down to the nearest page boundary.
    ///
    /// # Example
    /// ```
    /// # use abyss::addressing::Va;
    /// let va = Va::new(0x1234_5678).unwrap();
    /// assert_eq!(va.page_down().into_usize(), 0x1234_5000);
    /// ```
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Aligns the virtual address up to the nearest page boundary.
    #[inline]
    pub const fn page_up(self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    /// Aligns the address down to a multiple of `span`.
    ///
    /// `span` must be a power of two. This is how a walk finds the first
    /// address covered by the same page-table entry as `self`.
    #[inline]
    pub const fn align_down(self, span: usize) -> Self {
        Self(self.0 & !(span - 1))
    }

    /// Extracts the offset within the memory page from the virtual address.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Whether the address lies on a page boundary.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.offset() == 0
    }

    /// Subtracts `bytes`, returning `None` on underflow.
    #[inline]
    pub const fn checked_sub(self, bytes: usize) -> Option<Self> {
        match self.0.checked_sub(bytes) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<usize> for $t {
            type Output = Self;

            fn add(self, other: usize) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::AddAssign<usize> for $t {
            fn add_assign(&mut self, other: usize) {
                self.0 = self.0 + other
            }
        }
        impl core::ops::Sub<usize> for $t {
            type Output = Self;

            fn sub(self, other: usize) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::Sub<Self> for $t {
            type Output = usize;

            fn sub(self, other: Self) -> Self::Output {
                self.0 - other.0
            }
        }
        impl core::ops::SubAssign<usize> for $t {
            fn sub_assign(&mut self, other: usize) {
                self.0 = self.0 - other
            }
        }
        impl core::ops::BitOr<usize> for $t {
            type Output = Self;

            fn bitor(self, other: usize) -> Self {
                Self(self.0 | other)
            }
        }
        impl core::ops::BitAnd<usize> for $t {
            type Output = Self;

            fn bitand(self, other: usize) -> Self {
                Self(self.0 & other)
            }
        }
    };
}

impl_arith!(Va);
impl_arith!(Pa);

impl core::fmt::Debug for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:x})", self.0)
    }
}
impl core::fmt::Display for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}
impl core::fmt::Debug for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa(0x{:x})", self.0)
    }
}
impl core::fmt::Display for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}
