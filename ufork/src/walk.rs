//! # Walking the present pages of an address range.
//!
//! A naive walk probes every page of the range, but the user range of an
//! environment is half a terabyte and almost all of it is empty. The walk
//! here consults the page table top-down instead: when the entry at some
//! level is absent, nothing in the region it covers can be mapped, so the
//! whole region (512 GiB, 1 GiB, or 2 MiB) is skipped in one step.
//!
//! Pages are visited from the top of the range down, the way the stack and
//! then the data and text of a program are laid out.

use ulib::{
    addressing::{PAGE_SIZE, Va},
    mm::page_table::{Level, PageTableView},
};

/// Iterator over the pages of `[bottom, top)` that are mapped in a
/// [`PageTableView`], highest address first.
///
/// A page is yielded when the entries at all four levels are present. The
/// leaf flags are not inspected; callers filter on them as they need.
pub struct PresentPages<'a, V: PageTableView + ?Sized> {
    view: &'a V,
    bottom: Va,
    next: Option<Va>,
}

impl<'a, V: PageTableView + ?Sized> PresentPages<'a, V> {
    /// Walks the pages of `[bottom, top)`. Both bounds must be page-aligned.
    pub fn new(view: &'a V, bottom: Va, top: Va) -> Self {
        PresentPages {
            view,
            bottom,
            next: top.checked_sub(PAGE_SIZE),
        }
    }
}

impl<V: PageTableView + ?Sized> Iterator for PresentPages<'_, V> {
    type Item = Va;

    fn next(&mut self) -> Option<Va> {
        while let Some(va) = self.next.filter(|va| *va >= self.bottom) {
            match Level::ALL
                .into_iter()
                .find(|level| !self.view.is_present(*level, va))
            {
                None => {
                    self.next = va.checked_sub(PAGE_SIZE);
                    return Some(va);
                }
                // Nothing below `va` in this entry's region is mapped either.
                Some(level) => self.next = va.align_down(level.span()).checked_sub(PAGE_SIZE),
            }
        }
        self.next = None;
        None
    }
}
