//! Low-level driver routines for the 16550a UART.

use core::{fmt, hint, ptr, sync::atomic::Ordering};

use crate::{interrupt, memlayout::UART0};

use super::PANICKED;

const unsafe fn reg(offset: usize) -> *mut u8 {
    unsafe { ptr::without_provenance_mut::<u8>(UART0).byte_add(offset) }
}

// the UART control registers; see http://byterunner.com/16550.html

const THR: usize = 0;
const IER: usize = 1;
const FCR: usize = 2;
const LCR: usize = 3;
const LCR_EIGHT_BITS: u8 = 3;
const LCR_BAUD_LATCH: u8 = 1 << 7;
const LSR: usize = 5;
const LSR_TX_IDLE: u8 = 1 << 5;

unsafe fn read_reg(offset: usize) -> u8 {
    unsafe { reg(offset).read_volatile() }
}

unsafe fn write_reg(offset: usize, data: u8) {
    unsafe { reg(offset).write_volatile(data) }
}

pub fn init() {
    unsafe {
        write_reg(IER, 0x00); // disable interrupts
        write_reg(LCR, LCR_BAUD_LATCH); // special mode to set baud rate
        write_reg(0, 0x03); // LSB for baud rate of 38.4K
        write_reg(1, 0x00); // MSB for baud rate of 38.4K
        write_reg(LCR, LCR_EIGHT_BITS); // leave set-baud mode, 8 bits, no parity
        write_reg(FCR, 0x01 | (0x03 << 1)); // reset and enable FIFOs
    }
}

/// Sends a character to the UART synchronously, spinning until the
/// transmit holding register is idle.
fn putc_sync(c: u8) {
    interrupt::with_push_disabled(|| {
        if PANICKED.load(Ordering::Relaxed) {
            loop {
                hint::spin_loop();
            }
        }

        while (unsafe { read_reg(LSR) } & LSR_TX_IDLE) == 0 {
            hint::spin_loop();
        }

        unsafe {
            write_reg(THR, c);
        }
    });
}

pub struct Writer;

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes() {
            putc_sync(b);
        }
        Ok(())
    }
}
