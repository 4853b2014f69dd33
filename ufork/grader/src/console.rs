//! Console capture.
//!
//! Everything printed by the library, and everything the simulated kernel
//! prints, is appended to a buffer owned by the current thread. Since each
//! test runs on its own thread, tests can assert on their own output with
//! [`take`].

use abyss::kprint::set_console;
use std::{cell::RefCell, sync::Once};

thread_local! {
    static OUTPUT: RefCell<String> = const { RefCell::new(String::new()) };
}

static INSTALL: Once = Once::new();

/// Routes the print macros to the per-thread buffer.
pub fn install() {
    INSTALL.call_once(|| set_console(puts));
}

/// Appends `s` to the current thread's buffer and echoes it to stdout.
pub fn puts(s: &str) {
    std::print!("{s}");
    OUTPUT.with(|output| output.borrow_mut().push_str(s));
}

/// Returns and clears everything the current thread printed so far.
pub fn take() -> String {
    OUTPUT.with(|output| std::mem::take(&mut *output.borrow_mut()))
}
