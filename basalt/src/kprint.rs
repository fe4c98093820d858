//! Hypervisor print utilities.
//!
//! Output goes to a byte sink registered at boot, normally the physical
//! mini UART. Nothing is printed before [`register`] runs.

use core::fmt::Write;
use core::sync::atomic::{AtomicUsize, Ordering};

static SINK: AtomicUsize = AtomicUsize::new(0);

/// Install the byte sink used by the print macros.
pub fn register(putc: fn(u8)) {
    SINK.store(putc as usize, Ordering::Relaxed);
}

struct Sink(fn(u8));

impl Write for Sink {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for b in s.bytes() {
            (self.0)(b);
        }
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(fmt: core::fmt::Arguments<'_>) {
    let raw = SINK.load(Ordering::Relaxed);
    if raw != 0 {
        // Only ever stored from `register`, so the value is a fn(u8).
        let putc: fn(u8) = unsafe { core::mem::transmute(raw) };
        let _ = write!(Sink(putc), "{}", fmt);
    }
}

/// Prints out the message.
///
/// Use the format! syntax to write data to the hypervisor console.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::kprint::_print(format_args!($($arg)*)));
}

/// Prints out the message with a newline.
///
/// Use the format! syntax to write data to the hypervisor console.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Display an information message.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => ($crate::kprint::_print(
            format_args!(
                "[INFO] {}\n",
                format_args!($($arg)*)
            )
        )
    );
}

/// Display a warning message.
#[macro_export]
macro_rules! warning {
    ($($arg:tt)*) => ($crate::kprint::_print(
            format_args!(
                "[WARNING] {}\n",
                format_args!($($arg)*)
            )
        )
    );
}
