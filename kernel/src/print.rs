// Print macros for kernel output

/// Print to the kernel console (VGA text plus serial mirror on bare metal,
/// stdout on host builds).
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::print::_print(format_args!($($arg)*)));
}

/// Print to the kernel console with a trailing newline.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

#[doc(hidden)]
pub fn _print(args: core::fmt::Arguments) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        crate::vga::_print(args);
        crate::serial::_serial_print(args);
    }

    #[cfg(not(target_os = "none"))]
    crate::serial::_serial_print(args);
}
