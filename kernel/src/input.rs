//! Console input
//!
//! Polls the PS/2 controller and the serial port for key bytes; no
//! interrupts are used. Scancodes are decoded with `pc_keyboard`. The
//! blocking line reader yields between polls so other threads keep
//! running, and supports backspace editing.

#![cfg(all(target_arch = "x86_64", target_os = "none"))]

use lazy_static::lazy_static;
use pc_keyboard::{layouts::Us104Key, DecodedKey, HandleControl, Keyboard, ScancodeSet1};
use spin::Mutex;
use x86_64::instructions::port::Port;

use crate::print;

const PS2_STATUS_PORT: u16 = 0x64;
const PS2_DATA_PORT: u16 = 0x60;
const PS2_OUTPUT_FULL: u8 = 1;

const COM1_LINE_STATUS: u16 = crate::serial::COM1 + 5;
const COM1_DATA_READY: u8 = 1;

lazy_static! {
    static ref KEYBOARD: Mutex<Keyboard<Us104Key, ScancodeSet1>> = Mutex::new(Keyboard::new(
        ScancodeSet1::new(),
        Us104Key,
        HandleControl::Ignore
    ));
}

/// Poll the PS/2 controller for one decoded character.
fn ps2_try_getc() -> Option<char> {
    let mut status = Port::<u8>::new(PS2_STATUS_PORT);
    let mut data = Port::<u8>::new(PS2_DATA_PORT);
    // SAFETY: standard PS/2 controller ports; reads have no side effects
    // beyond consuming the pending scancode.
    let scancode = unsafe {
        if status.read() & PS2_OUTPUT_FULL == 0 {
            return None;
        }
        data.read()
    };

    let mut keyboard = KEYBOARD.lock();
    let event = keyboard.add_byte(scancode).ok().flatten()?;
    match keyboard.process_keyevent(event)? {
        DecodedKey::Unicode(ch) => Some(ch),
        DecodedKey::RawKey(_) => None,
    }
}

/// Poll the serial port for one received byte.
fn serial_try_getc() -> Option<char> {
    let mut line_status = Port::<u8>::new(COM1_LINE_STATUS);
    let mut data = Port::<u8>::new(crate::serial::COM1);
    // SAFETY: COM1 registers; reading the data register consumes the byte.
    unsafe {
        if line_status.read() & COM1_DATA_READY == 0 {
            return None;
        }
        Some(data.read() as char)
    }
}

/// One character from any input source, if pending.
pub fn try_getc() -> Option<char> {
    ps2_try_getc().or_else(serial_try_getc)
}

/// Block (yielding) until a character arrives.
pub fn getc() -> char {
    loop {
        if let Some(ch) = try_getc() {
            return ch;
        }
        crate::sched::yield_now();
        core::hint::spin_loop();
    }
}

/// Read an edited line into `buf`, echoing as it goes. Returns the line
/// length (bytes, without the newline).
pub fn readline(buf: &mut [u8]) -> usize {
    let mut len = 0;
    loop {
        let mut ch = getc();
        if ch == '\r' {
            ch = '\n';
        }
        match ch {
            '\n' => {
                print!("\n");
                return len;
            }
            '\u{8}' | '\u{7f}' => {
                if len > 0 {
                    len -= 1;
                    print!("\u{8} \u{8}");
                }
            }
            ch if ch.is_ascii() && !ch.is_control() => {
                if len + 1 < buf.len() {
                    buf[len] = ch as u8;
                    len += 1;
                    print!("{}", ch);
                }
            }
            _ => {}
        }
    }
}
