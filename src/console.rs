//! Kernel diagnostics output.
//!
//! The actual character sink (the UART driver, PLIC wiring, and line
//! discipline) is a fixed-contract collaborator outside this crate's
//! scope; what lives here is the `Printer` that formats `core::fmt`
//! arguments into it and the `print!`/`println!`/`kprintf!` macros built
//! on top, plus the panic handler, which is this crate's responsibility
//! since it must run correctly with nothing else initialized.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::lock::Spinlock;

/// The raw character sink. Implemented by the surrounding system (a UART
/// driver); this crate only ever writes one byte at a time to it.
pub trait Console {
    fn putc(&self, c: u8);
}

struct NullConsole;

impl Console for NullConsole {
    fn putc(&self, _c: u8) {}
}

static CONSOLE: Spinlock<&'static dyn Console> = Spinlock::new("console", &NullConsole);

/// Installs the concrete console implementation. Called once, during
/// kernel init, before any other hart is started.
pub fn init(console: &'static dyn Console) {
    *CONSOLE.lock() = console;
}

/// Set once a panic is in flight so concurrent `print!`s don't interleave
/// with the panic message.
pub static PANICKED: AtomicBool = AtomicBool::new(false);

pub struct Printer;

impl Write for Printer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let console = *CONSOLE.lock();
        for c in s.bytes() {
            console.putc(c);
        }
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
    let _ = Printer.write_fmt(args);
}

/// Prints to the console, like `std::print!`.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::console::_print(format_args!($($arg)*)));
}

/// Prints to the console with a trailing newline, like `std::println!`.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Alias for `println!`, matching the fixed-contract name `kprintf`.
#[macro_export]
macro_rules! kprintf {
    ($($arg:tt)*) => ($crate::println!($($arg)*));
}

#[cfg(not(test))]
#[panic_handler]
fn panic_handler(info: &core::panic::PanicInfo<'_>) -> ! {
    PANICKED.store(true, Ordering::Release);
    println!("kernel panic: {}", info);
    loop {
        core::hint::spin_loop();
    }
}
