//! Kernel console output, over the UART.
//!
//! No input path, no line editing, no device file registration: this
//! kernel runs no user processes, so the console exists purely for
//! diagnostic output via [`kprint!`]/[`kprintln!`].

pub mod uart;

use core::sync::atomic::AtomicBool;

/// Set by the panic handler. Once set, [`uart::Writer`] stops waiting for
/// the transmitter to drain and spins forever instead, so a panic on one
/// hart can't be starved by another hart wedged mid-write.
pub static PANICKED: AtomicBool = AtomicBool::new(false);

pub fn init() {
    uart::init();
}

#[doc(hidden)]
pub fn _print(args: core::fmt::Arguments) {
    use core::fmt::Write as _;
    let _ = uart::Writer.write_fmt(args);
}

#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::console::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kprintln {
    () => {
        $crate::kprint!("\n")
    };
    ($($arg:tt)*) => {
        $crate::console::_print(format_args!("{}\n", format_args!($($arg)*)))
    };
}
