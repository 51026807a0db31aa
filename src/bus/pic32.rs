//! Memory-mapped [`Peripheral`] for the PIC32MX I2C controller.
//!
//! Each register has CLR, SET and INV aliases at +0x4, +0x8 and +0xC, so
//! single bits are changed without read-modify-write.

use super::{Condition, Peripheral};

/// I2C1 on PIC32MX3xx/4xx parts.
pub const I2C1_BASE: usize = 0xBF80_5000;
/// I2C2 on PIC32MX3xx/4xx parts.
pub const I2C2_BASE: usize = 0xBF80_5200;

const CON: usize = 0x00;
const STAT: usize = 0x10;
const BRG: usize = 0x40;
const TRN: usize = 0x50;
const RCV: usize = 0x60;

const CLR: usize = 0x4;
const SET: usize = 0x8;

const CON_SEN: u32 = 1 << 0;
const CON_RSEN: u32 = 1 << 1;
const CON_PEN: u32 = 1 << 2;
const CON_RCEN: u32 = 1 << 3;
const CON_ACKEN: u32 = 1 << 4;
const CON_ACKDT: u32 = 1 << 5;
const CON_DISSLW: u32 = 1 << 9;
const CON_ON: u32 = 1 << 15;

const STAT_RBF: u32 = 1 << 1;
const STAT_TRSTAT: u32 = 1 << 14;
const STAT_ACKSTAT: u32 = 1 << 15;

fn request_bit(condition: Condition) -> u32 {
    match condition {
        Condition::Start => CON_SEN,
        Condition::Restart => CON_RSEN,
        Condition::Stop => CON_PEN,
        Condition::Receive => CON_RCEN,
        Condition::Acknowledge => CON_ACKEN,
    }
}

/// One PIC32MX I2C controller instance.
#[derive(Debug)]
pub struct Pic32I2c {
    base: usize,
}

impl Pic32I2c {
    /// # Safety
    ///
    /// `base` must be the address of an I2C controller register block (or
    /// memory laid out like one) that stays valid for the lifetime of the
    /// returned value, and nothing else may drive that controller meanwhile.
    pub unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    fn read(&self, offset: usize) -> u32 {
        // SAFETY: the constructor's contract covers every register offset used here.
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u32) }
    }

    fn write(&mut self, offset: usize, value: u32) {
        // SAFETY: as in `read`.
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }
}

impl Peripheral for Pic32I2c {
    fn disable(&mut self) {
        self.write(CON, 0);
    }

    fn enable(&mut self) {
        self.write(CON + SET, CON_ON);
    }

    fn configure(&mut self, baud_divisor: u16, slew_rate_control: bool) {
        self.write(BRG, baud_divisor as u32);
        if slew_rate_control {
            self.write(CON + CLR, CON_DISSLW);
        } else {
            self.write(CON + SET, CON_DISSLW);
        }
    }

    fn request(&mut self, condition: Condition) {
        self.write(CON + SET, request_bit(condition));
    }

    fn is_pending(&mut self, condition: Condition) -> bool {
        self.read(CON) & request_bit(condition) != 0
    }

    fn set_ack_data(&mut self, nack: bool) {
        if nack {
            self.write(CON + SET, CON_ACKDT);
        } else {
            self.write(CON + CLR, CON_ACKDT);
        }
    }

    fn write_transmit(&mut self, byte: u8) {
        self.write(TRN, byte as u32);
    }

    fn transmit_in_progress(&mut self) -> bool {
        self.read(STAT) & STAT_TRSTAT != 0
    }

    fn nack_received(&mut self) -> bool {
        self.read(STAT) & STAT_ACKSTAT != 0
    }

    fn receive_buffer_full(&mut self) -> bool {
        self.read(STAT) & STAT_RBF != 0
    }

    fn read_receive(&mut self) -> u8 {
        self.read(RCV) as u8
    }
}
