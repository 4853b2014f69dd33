//! Console print utilities.
//!
//! Every message an environment prints goes through one process-wide sink.
//! On the real machine that sink is the `cputs` system call; a test harness
//! installs its own to capture diagnostics.
//!
//! Printing only ever loads the sink. Diagnostics are printed on the page
//! fault path, where the environment's statics may sit on copy-on-write
//! pages that must not be written.

use core::fmt::Write;
use crossbeam_utils::atomic::AtomicCell;

/// Writes a piece of console output.
pub type Puts = fn(&str);

static CONSOLE: AtomicCell<Option<Puts>> = AtomicCell::new(None);

/// Installs `puts` as the destination of the print macros.
///
/// Messages printed before any console is installed are discarded.
pub fn set_console(puts: Puts) {
    CONSOLE.store(Some(puts));
}

struct Sink(Puts);

impl Write for Sink {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        (self.0)(s);
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(fmt: core::fmt::Arguments<'_>) {
    if let Some(puts) = CONSOLE.load() {
        let _ = write!(&mut Sink(puts), "{fmt}");
    }
}

/// Prints out the message.
///
/// Use the format! syntax to write data to the console.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::kprint::_print(format_args!($($arg)*)));
}

/// Prints out the message with a newline.
///
/// Use the format! syntax to write data to the console.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Display an information message.
#[macro_export]
macro_rules! info {
    () => (if !$crate::QUITE.load(core::sync::atomic::Ordering::SeqCst) { $crate::print!("[INFO]\n") });
    ($($arg:tt)*) => (if !$crate::QUITE.load(core::sync::atomic::Ordering::SeqCst) { $crate::print!("[INFO] {}\n", format_args!($($arg)*)) });
}

/// Display a warning message.
#[macro_export]
macro_rules! warning {
    () => (if !$crate::QUITE.load(core::sync::atomic::Ordering::SeqCst) { $crate::print!("[WARN]\n") });
    ($($arg:tt)*) => (if !$crate::QUITE.load(core::sync::atomic::Ordering::SeqCst) { $crate::print!("[WARN] {}\n", format_args!($($arg)*)) });
}

/// Display a debug message.
#[macro_export]
macro_rules! debug {
    () => (if !$crate::QUITE.load(core::sync::atomic::Ordering::SeqCst) { $crate::print!("[DEBUG]\n") });
    ($($arg:tt)*) => (if !$crate::QUITE.load(core::sync::atomic::Ordering::SeqCst) { $crate::print!("[DEBUG] {}\n", format_args!($($arg)*))} );
}
