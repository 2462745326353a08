//! COM1 serial console
//!
//! Output side of the serial console. Input polling lives in `input`.

use core::fmt;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use lazy_static::lazy_static;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use spin::Mutex;

/// COM1 base port
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub const COM1: u16 = 0x3F8;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
lazy_static! {
    /// Shared COM1 port, initialized on first use
    pub static ref SERIAL1: Mutex<uart_16550::SerialPort> = {
        // SAFETY: 0x3F8 is the standard COM1 base; no other code drives
        // these ports.
        let mut port = unsafe { uart_16550::SerialPort::new(COM1) };
        port.init();
        Mutex::new(port)
    };
}

#[doc(hidden)]
pub fn _serial_print(args: fmt::Arguments) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        use core::fmt::Write;
        SERIAL1.lock().write_fmt(args).ok();
    }

    #[cfg(not(target_os = "none"))]
    {
        use std::io::Write as _;
        std::io::stdout().write_fmt(args).ok();
    }
}

/// Print to the serial console only.
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_serial_print(format_args!($($arg)*))
    };
}

/// Print to the serial console only, with a newline.
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => {
        $crate::serial_print!("{}\n", format_args!($($arg)*))
    };
}
