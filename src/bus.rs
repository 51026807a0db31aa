//! I2C master bus driver
//!
//! A thin synchronous driver over a single I2C controller. The five bus
//! primitives (start, restart, send byte, receive byte, stop) are exposed
//! directly, and the `embedded-hal` blocking I2C traits are built from them so
//! that sensor drivers can use the bus like any other HAL implementation.
//!
//! All waits are busy-polls against the [`Peripheral`] status bits, bounded by
//! [`BusConfig::poll_limit`]. A controller that never completes yields
//! [`BusError::Timeout`] instead of hanging the caller.

pub mod pic32;

use embedded_hal_async::i2c::{Error, ErrorKind, NoAcknowledgeSource};

/// Bus conditions and sequences that are requested through a control bit
/// which the hardware clears once the sequence has completed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Condition {
    /// Start condition
    Start,
    /// Repeated start condition
    Restart,
    /// Stop condition
    Stop,
    /// Receive enable (clock in one byte)
    Receive,
    /// Acknowledge sequence (drives ACK or NACK after a received byte)
    Acknowledge,
}

/// What the driver was waiting for when a poll limit ran out.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Wait {
    Start,
    Restart,
    Stop,
    Receive,
    Acknowledge,
    /// Transmit-in-progress flag to clear
    Transmit,
    /// Receive-buffer-full flag to set
    ReceiveData,
}

impl From<Condition> for Wait {
    fn from(condition: Condition) -> Self {
        match condition {
            Condition::Start => Wait::Start,
            Condition::Restart => Wait::Restart,
            Condition::Stop => Wait::Stop,
            Condition::Receive => Wait::Receive,
            Condition::Acknowledge => Wait::Acknowledge,
        }
    }
}

/// Errors reported by the bus driver.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BusError {
    /// The target did not acknowledge the address or a data byte.
    NoAcknowledge(NoAcknowledgeSource),
    /// The controller did not complete within the poll limit.
    Timeout(Wait),
}

impl Error for BusError {
    fn kind(&self) -> ErrorKind {
        match self {
            BusError::NoAcknowledge(source) => ErrorKind::NoAcknowledge(*source),
            BusError::Timeout(_) => ErrorKind::Other,
        }
    }
}

/// Shorthand for all functions returning an error in this module.
pub type Result<T> = core::result::Result<T, BusError>;

/// Register-level interface of one I2C controller instance.
///
/// Implementations map these onto the memory-mapped control, status,
/// baud-rate, transmit and receive registers of the target platform. The
/// driver depends only on the semantics: request bits clear themselves on
/// completion and status bits are polled.
pub trait Peripheral {
    /// Turns the controller off.
    fn disable(&mut self);

    /// Turns the controller on.
    fn enable(&mut self);

    /// Programs the baud-rate divisor and the slew-rate control option.
    fn configure(&mut self, baud_divisor: u16, slew_rate_control: bool);

    /// Sets the request bit for `condition`.
    fn request(&mut self, condition: Condition);

    /// Whether the request bit for `condition` is still set.
    fn is_pending(&mut self, condition: Condition) -> bool;

    /// Selects what the next acknowledge sequence drives: ACK (`false`) or
    /// NACK (`true`).
    fn set_ack_data(&mut self, nack: bool);

    /// Loads the transmit register, which starts clocking the byte out.
    fn write_transmit(&mut self, byte: u8);

    /// Transmit-in-progress status flag.
    fn transmit_in_progress(&mut self) -> bool;

    /// Acknowledge status of the last transmitted byte; `true` if the target
    /// did not acknowledge.
    fn nack_received(&mut self) -> bool;

    /// Receive-buffer-full status flag.
    fn receive_buffer_full(&mut self) -> bool;

    /// Reads the receive register.
    fn read_receive(&mut self) -> u8;
}

/// Bus controller configuration.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BusConfig {
    /// Clock feeding the controller, in Hz
    pub peripheral_clock_hz: u32,
    /// Bus (SCL) frequency in Hz
    pub frequency_hz: u32,
    /// Slew-rate control; only meaningful for 400 kHz operation
    pub slew_rate_control: bool,
    /// Number of status polls before a wait is abandoned
    pub poll_limit: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            peripheral_clock_hz: 40_000_000,
            frequency_hz: 100_000,
            slew_rate_control: false,
            poll_limit: 100_000,
        }
    }
}

impl BusConfig {
    /// Sets the clock feeding the controller.
    pub fn with_peripheral_clock(mut self, hz: u32) -> Self {
        self.peripheral_clock_hz = hz;
        self
    }

    /// Sets the bus (SCL) frequency.
    pub fn with_frequency(mut self, hz: u32) -> Self {
        self.frequency_hz = hz;
        self
    }

    /// Enables or disables slew-rate control.
    pub fn with_slew_rate_control(mut self, enabled: bool) -> Self {
        self.slew_rate_control = enabled;
        self
    }

    /// Sets how many status polls a wait may take before it times out.
    pub fn with_poll_limit(mut self, polls: u32) -> Self {
        self.poll_limit = polls;
        self
    }

    /// Baud-rate divisor for the configured clocks: `pbclk / (2 * scl) - 2`.
    pub fn baud_divisor(&self) -> u16 {
        let half_period = self.peripheral_clock_hz / self.frequency_hz.max(1).saturating_mul(2);
        half_period.saturating_sub(2).min(u16::MAX as u32) as u16
    }
}

/// Blocking I2C master over a [`Peripheral`].
#[derive(Debug)]
pub struct I2cMaster<P> {
    peripheral: P,
    poll_limit: u32,
}

impl<P: Peripheral> I2cMaster<P> {
    /// Sets up the controller: disable, program the baud rate and slew-rate
    /// option, enable.
    pub fn new(mut peripheral: P, config: BusConfig) -> Self {
        let baud_divisor = config.baud_divisor();

        peripheral.disable();
        peripheral.configure(baud_divisor, config.slew_rate_control);
        peripheral.enable();

        log::debug!(
            "I2C master enabled at {} Hz (divisor {})",
            config.frequency_hz,
            baud_divisor
        );

        Self {
            peripheral,
            poll_limit: config.poll_limit.max(1),
        }
    }

    /// Gives the peripheral back.
    pub fn release(self) -> P {
        self.peripheral
    }

    /// Asserts a start condition.
    pub fn start(&mut self) -> Result<()> {
        self.complete(Condition::Start)
    }

    /// Asserts a repeated start condition without releasing the bus.
    pub fn restart(&mut self) -> Result<()> {
        self.complete(Condition::Restart)
    }

    /// Asserts a stop condition, releasing the bus.
    pub fn stop(&mut self) -> Result<()> {
        self.complete(Condition::Stop)
    }

    /// Clocks one byte onto the bus and checks the target's acknowledgment.
    pub fn send_byte(&mut self, byte: u8) -> Result<()> {
        self.peripheral.write_transmit(byte);
        self.wait_while(Wait::Transmit, |p| p.transmit_in_progress())?;

        if self.peripheral.nack_received() {
            log::warn!("I2C: no ACK for byte {:#04x}", byte);
            return Err(BusError::NoAcknowledge(NoAcknowledgeSource::Data));
        }

        Ok(())
    }

    /// Receives one byte, then drives ACK (`nack == false`, more bytes wanted)
    /// or NACK (`nack == true`, last byte).
    pub fn recv_byte(&mut self, nack: bool) -> Result<u8> {
        self.peripheral.request(Condition::Receive);
        self.wait_while(Wait::ReceiveData, |p| !p.receive_buffer_full())?;
        let byte = self.peripheral.read_receive();

        self.peripheral.set_ack_data(nack);
        self.complete(Condition::Acknowledge)?;

        Ok(byte)
    }

    /// Sends the address byte: 7-bit address shifted left, R/W in bit 0.
    pub fn send_address(&mut self, address: u8, read: bool) -> Result<()> {
        self.send_byte((address << 1) | read as u8)
            .map_err(|error| match error {
                BusError::NoAcknowledge(_) => {
                    BusError::NoAcknowledge(NoAcknowledgeSource::Address)
                }
                other => other,
            })
    }

    fn complete(&mut self, condition: Condition) -> Result<()> {
        self.peripheral.request(condition);
        self.wait_while(condition.into(), |p| p.is_pending(condition))
    }

    fn wait_while(&mut self, wait: Wait, mut busy: impl FnMut(&mut P) -> bool) -> Result<()> {
        for _ in 0..self.poll_limit {
            if !busy(&mut self.peripheral) {
                return Ok(());
            }
        }

        log::warn!("I2C: timed out waiting for {:?}", wait);
        Err(BusError::Timeout(wait))
    }

    /// Runs `body` between a start and a stop. The stop is issued even when
    /// `body` fails; the first error wins.
    fn framed<T>(&mut self, body: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let result = self.start().and_then(|()| body(self));
        let stopped = self.stop();
        let value = result?;
        stopped.map(|()| value)
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        for &byte in bytes {
            self.send_byte(byte)?;
        }
        Ok(())
    }

    /// Fills `buffer`, ACKing every byte except the last one when `nack_last`.
    fn read_bytes(&mut self, buffer: &mut [u8], nack_last: bool) -> Result<()> {
        let last = buffer.len().saturating_sub(1);
        for (index, slot) in buffer.iter_mut().enumerate() {
            *slot = self.recv_byte(nack_last && index == last)?;
        }
        Ok(())
    }
}

impl<P: Peripheral> embedded_hal::blocking::i2c::Write for I2cMaster<P> {
    type Error = BusError;

    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<()> {
        self.framed(|bus| {
            bus.send_address(address, false)?;
            bus.write_bytes(bytes)
        })
    }
}

impl<P: Peripheral> embedded_hal::blocking::i2c::Read for I2cMaster<P> {
    type Error = BusError;

    /// An empty `buffer` is a no-op: no byte could carry the final NACK.
    fn read(&mut self, address: u8, buffer: &mut [u8]) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }

        self.framed(|bus| {
            bus.send_address(address, true)?;
            bus.read_bytes(buffer, true)
        })
    }
}

impl<P: Peripheral> embedded_hal::blocking::i2c::WriteRead for I2cMaster<P> {
    type Error = BusError;

    fn write_read(&mut self, address: u8, bytes: &[u8], buffer: &mut [u8]) -> Result<()> {
        self.framed(|bus| {
            bus.send_address(address, false)?;
            bus.write_bytes(bytes)?;
            if buffer.is_empty() {
                return Ok(());
            }

            bus.restart()?;
            bus.send_address(address, true)?;
            bus.read_bytes(buffer, true)
        })
    }
}

#[cfg(feature = "async")]
mod asynch {
    use super::{BusError, I2cMaster, Peripheral, Result};
    use embedded_hal_async::i2c::{ErrorType, I2c, Operation, SevenBitAddress};

    impl<P: Peripheral> ErrorType for I2cMaster<P> {
        type Error = BusError;
    }

    impl<P: Peripheral> I2cMaster<P> {
        /// Adjacent operations of the same direction are merged; a direction
        /// change issues a restart and a fresh address byte. Empty reads are
        /// skipped, so the last byte actually received is the one NACKed.
        fn run_operations(&mut self, address: u8, operations: &mut [Operation<'_>]) -> Result<()> {
            let mut reading: Option<bool> = None;

            for index in 0..operations.len() {
                let next_is_read = matches!(
                    operations[index + 1..].iter().find(|op| !is_empty_read(op)),
                    Some(Operation::Read(_))
                );

                match &mut operations[index] {
                    Operation::Write(bytes) => {
                        if reading != Some(false) {
                            if reading.is_some() {
                                self.restart()?;
                            }
                            self.send_address(address, false)?;
                        }
                        let bytes: &[u8] = bytes;
                        self.write_bytes(bytes)?;
                        reading = Some(false);
                    }
                    Operation::Read(buffer) if buffer.is_empty() => {}
                    Operation::Read(buffer) => {
                        if reading != Some(true) {
                            if reading.is_some() {
                                self.restart()?;
                            }
                            self.send_address(address, true)?;
                        }
                        self.read_bytes(&mut buffer[..], !next_is_read)?;
                        reading = Some(true);
                    }
                }
            }

            Ok(())
        }
    }

    fn is_empty_read(operation: &Operation<'_>) -> bool {
        matches!(operation, Operation::Read(buffer) if buffer.is_empty())
    }

    impl<P: Peripheral> I2c<SevenBitAddress> for I2cMaster<P> {
        async fn transaction(
            &mut self,
            address: SevenBitAddress,
            operations: &mut [Operation<'_>],
        ) -> Result<()> {
            self.framed(|bus| bus.run_operations(address, operations))
        }
    }
}

/// Simulated controller for tests. Requests complete immediately unless the
/// matching wait is marked as stuck; every bus-visible event is recorded.
#[cfg(test)]
pub(crate) mod sim {
    use super::{Condition, Peripheral, Wait};
    use std::collections::VecDeque;
    use std::vec::Vec;

    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub enum Event {
        Start,
        Restart,
        Stop,
        /// Byte clocked out by the master
        Send(u8),
        /// Byte received and ACKed
        Ack(u8),
        /// Byte received and NACKed
        Nack(u8),
    }

    #[derive(Debug, Default)]
    pub struct SimPeripheral {
        pub events: Vec<Event>,
        /// Bytes the target returns, in order
        pub responses: VecDeque<u8>,
        /// Indices of sent bytes (counted from 0) the target does not ACK
        pub nack_sends: Vec<usize>,
        pub stuck: Option<Wait>,
        pub enabled: bool,
        pub baud_divisor: u16,
        pub slew_rate_control: bool,
        sent: usize,
        nacked: bool,
        rx: Option<u8>,
        last_rx: u8,
        ack_data: bool,
    }

    impl SimPeripheral {
        pub fn with_responses(responses: &[u8]) -> Self {
            Self {
                responses: responses.iter().copied().collect(),
                ..Self::default()
            }
        }
    }

    impl Peripheral for SimPeripheral {
        fn disable(&mut self) {
            self.enabled = false;
        }

        fn enable(&mut self) {
            self.enabled = true;
        }

        fn configure(&mut self, baud_divisor: u16, slew_rate_control: bool) {
            self.baud_divisor = baud_divisor;
            self.slew_rate_control = slew_rate_control;
        }

        fn request(&mut self, condition: Condition) {
            match condition {
                Condition::Start => self.events.push(Event::Start),
                Condition::Restart => self.events.push(Event::Restart),
                Condition::Stop => self.events.push(Event::Stop),
                Condition::Receive => self.rx = Some(self.responses.pop_front().unwrap_or(0xFF)),
                Condition::Acknowledge => self.events.push(if self.ack_data {
                    Event::Nack(self.last_rx)
                } else {
                    Event::Ack(self.last_rx)
                }),
            }
        }

        fn is_pending(&mut self, condition: Condition) -> bool {
            self.stuck == Some(condition.into())
        }

        fn set_ack_data(&mut self, nack: bool) {
            self.ack_data = nack;
        }

        fn write_transmit(&mut self, byte: u8) {
            self.events.push(Event::Send(byte));
            self.nacked = self.nack_sends.contains(&self.sent);
            self.sent += 1;
        }

        fn transmit_in_progress(&mut self) -> bool {
            self.stuck == Some(Wait::Transmit)
        }

        fn nack_received(&mut self) -> bool {
            self.nacked
        }

        fn receive_buffer_full(&mut self) -> bool {
            self.rx.is_some() && self.stuck != Some(Wait::ReceiveData)
        }

        fn read_receive(&mut self) -> u8 {
            self.last_rx = self.rx.take().unwrap_or(0xFF);
            self.last_rx
        }
    }
}
