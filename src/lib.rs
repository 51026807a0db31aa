//! This crate provides a platform agnostic no_std driver for the TSL2561 ambient light sensor,
//! a small I2C master driver to talk to it, and the core of an ambient-light monitor built on top.
//! The sensor driver is compatible with the [`embedded-hal`](https://crates.io/crates/embedded-hal) traits,
//! so it runs on any HAL I2C implementation as well as on [`bus::I2cMaster`].
//!
//! The datasheet of the sensor can be found [here](https://cdn-shop.adafruit.com/datasheets/TSL2561.pdf).
//!
//! ## Supported features
//! * Power control and integration time / gain configuration
//! * Device ID check with the two known part IDs
//! * Reading both raw ADC channels
//! * Converting the raw values into the ambient light intensity in lux
//! * Async driver on top of `embedded-hal-async` (feature `async`)
//!
//! ## Unsupported features
//! * Interrupt and threshold functionality
//! * Manual integration mode
//!
//! ## Usage
//!
//! ```ignore
//! use tsl2561::{Config, TSL2561};
//!
//! let mut sensor = TSL2561::new(Config::default());
//!
//! // Powers the sensor up, checks its ID and configures 402 ms integration
//! // (blocks for roughly 700 ms)
//! let id_check = sensor.init(&mut delay, &mut i2c).unwrap();
//! if !id_check.is_recognized() {
//!     log::warn!("Unknown device on the bus, continuing anyway");
//! }
//!
//! match sensor.read_lux(&mut i2c) {
//!     Ok(lux) => log::info!("Ambient light intensity: {} lux", lux),
//!     Err(e) => log::error!("Error reading sensor: {:?}", e),
//! }
//! ```

#![cfg_attr(not(test), no_std)]

pub mod app;
#[cfg(feature = "async")]
pub mod r#async;
pub mod bus;

/// Command register select bit, prefixed to every register index.
const COMMAND_BIT: u8 = 0x80;

/// Control register value that powers the device up.
const POWER_ON: u8 = 0x03;

/// Control register value that powers the device down.
const POWER_OFF: u8 = 0x00;

/// Time the sensor needs after power-up before it answers reliably.
const POWER_UP_DELAY_MS: u32 = 200;

/// ADC value reported when a channel is saturated.
const SATURATED: u16 = 0xFFFF;

/// Represents an I2C-connected TSL2561 sensor.
#[derive(Copy, Clone, Debug)]
pub struct TSL2561<I2C, D> {
    /// Marker to satisfy the compiler.
    _delay: core::marker::PhantomData<D>,

    /// I2C Interface for communcating with the sensor.
    _i2c: core::marker::PhantomData<I2C>,

    /// Driver configuration, including the active timing.
    config: Config,

    /// Lifecycle state of the sensor session.
    state: State,
}

impl<I2C, D> TSL2561<I2C, D> {
    /// Creates a driver instance. No bus traffic happens until [`init`](Self::init).
    pub fn new(config: Config) -> Self {
        Self {
            _delay: core::marker::PhantomData,
            _i2c: core::marker::PhantomData,
            config,
            state: State::Uninitialized,
        }
    }

    /// Active configuration, including the last timing written.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Lifecycle state of the sensor session.
    pub fn state(&self) -> State {
        self.state
    }

    fn address(&self) -> u8 {
        self.config.address.into_u8()
    }
}

impl<I2C, D, E> TSL2561<I2C, D>
where
    D: embedded_hal::blocking::delay::DelayMs<u32>,
    I2C: embedded_hal::blocking::i2c::Read<Error = E>
        + embedded_hal::blocking::i2c::Write<Error = E>
        + embedded_hal::blocking::i2c::WriteRead<Error = E>,
{
    /// Brings the sensor into a state where it can be read.
    ///
    /// Powers the device on, waits for it to settle, checks the ID register,
    /// writes the configured timing and waits for one full integration cycle.
    ///
    /// An unknown ID is reported as [`IdCheck::Unexpected`] and initialization
    /// continues, unless [`Config::strict_id_check`] is set, in which case
    /// [`TSL2561Error::UnexpectedDeviceId`] is returned and the timing is left
    /// untouched.
    pub fn init(&mut self, delay: &mut D, i2c: &mut I2C) -> Result<IdCheck, E> {
        self.state = State::PoweringUp;
        self.power_on(i2c)?;
        delay.delay_ms(POWER_UP_DELAY_MS);

        let id_check = self.check_id(i2c)?;

        self.set_timing(self.config.timing, i2c)?;
        delay.delay_ms(self.config.timing.integration_time.settle_ms());

        self.state = State::Ready;
        Ok(id_check)
    }

    /// Powers the sensor on.
    pub fn power_on(&mut self, i2c: &mut I2C) -> Result<(), E> {
        self.write_register(Register::Control, POWER_ON, i2c)
    }

    /// Powers the sensor off. The driver has to be initialized again afterwards.
    pub fn power_off(&mut self, i2c: &mut I2C) -> Result<(), E> {
        self.write_register(Register::Control, POWER_OFF, i2c)?;
        self.state = State::Uninitialized;
        Ok(())
    }

    /// Write the integration time and gain to the sensor.
    pub fn set_timing(&mut self, timing: Timing, i2c: &mut I2C) -> Result<(), E> {
        self.write_register(Register::Timing, timing.into_reg_value(), i2c)?;
        self.config.timing = timing;
        Ok(())
    }

    /// Reads the raw ID register (part number in the high nibble, revision in the low one).
    pub fn read_id(&mut self, i2c: &mut I2C) -> Result<u8, E> {
        self.read_register(Register::ID, i2c)
    }

    /// Reads one ADC channel, low byte first.
    pub fn read_channel(&mut self, channel: Channel, i2c: &mut I2C) -> Result<u16, E> {
        let mut read_data = [0; 2];

        i2c.write_read(
            self.address(),
            &[channel.low_register() as u8 | COMMAND_BIT],
            &mut read_data,
        )
        .map_err(TSL2561Error::ReadI2CError)?;

        Ok(((read_data[1] as u16) << 8) | read_data[0] as u16)
    }

    /// Reads both channels, CH0 first.
    pub fn read_raw(&mut self, i2c: &mut I2C) -> Result<RawReading, E> {
        let ch0 = self.read_channel(Channel::Broadband, i2c)?;
        let ch1 = self.read_channel(Channel::Infrared, i2c)?;

        log::debug!("Read raw values: CH0={} CH1={}", ch0, ch1);

        Ok(RawReading { ch0, ch1 })
    }

    /// Reads the ambient light intensity in lux.
    ///
    /// Fails with [`TSL2561Error::NotInitialized`] before a successful
    /// [`init`](Self::init), and with [`TSL2561Error::SensorFault`] when a
    /// channel is saturated or the broadband channel reads zero (see
    /// [`Config::zero_baseline_is_fault`]).
    pub fn read_lux(&mut self, i2c: &mut I2C) -> Result<u32, E> {
        if self.state != State::Ready {
            return Err(TSL2561Error::NotInitialized);
        }

        let raw = self.read_raw(i2c)?;
        if raw.is_fault(self.config.zero_baseline_is_fault) {
            log::warn!("Sensor fault: CH0={} CH1={}", raw.ch0, raw.ch1);
            return Err(TSL2561Error::SensorFault(raw));
        }

        Ok(calculate_lux(raw))
    }

    /// Writes a new value to a specific register
    pub fn write_register(&mut self, register: Register, data: u8, i2c: &mut I2C) -> Result<(), E> {
        let command_reg_value = register as u8 | COMMAND_BIT;

        i2c.write(self.address(), &[command_reg_value, data])
            .map_err(TSL2561Error::WriteI2CError)
    }

    /// Reads the value of a specific register
    pub fn read_register(&mut self, register: Register, i2c: &mut I2C) -> Result<u8, E> {
        let command_reg_value = register as u8 | COMMAND_BIT;
        let mut read_data = [0; 1];

        i2c.write_read(self.address(), &[command_reg_value], &mut read_data)
            .map_err(TSL2561Error::ReadI2CError)?;

        Ok(read_data[0])
    }

    fn check_id(&mut self, i2c: &mut I2C) -> Result<IdCheck, E> {
        let id_check = IdCheck::classify(self.read_id(i2c)?);
        self.state = id_check.next_state();
        report_id_check(id_check, self.config.strict_id_check)
    }
}

/// Logs the outcome of an ID check; in strict mode an unknown ID is an error.
pub(crate) fn report_id_check<E>(id_check: IdCheck, strict: bool) -> Result<IdCheck, E> {
    match id_check {
        IdCheck::Recognized(part) => {
            log::info!("TSL2561 detected ({:?})", part);
            Ok(id_check)
        }
        IdCheck::Unexpected(id) if strict => {
            log::error!("Unexpected device ID {:#04x}, giving up", id);
            Err(TSL2561Error::UnexpectedDeviceId(id))
        }
        IdCheck::Unexpected(id) => {
            log::warn!("Unexpected device ID {:#04x}, continuing", id);
            Ok(id_check)
        }
    }
}

/// Converts a raw reading into lux.
///
/// The reading is assumed valid (see [`RawReading::is_fault`]). The result
/// is clamped at zero and truncated.
pub fn calculate_lux(raw: RawReading) -> u32 {
    let ch0 = raw.ch0 as f32;
    let ch1 = raw.ch1 as f32;
    let ratio = ch1 / ch0;

    let lux = LuxSegment::for_ratio(ratio).lux(ch0, ch1, ratio);
    if lux > 0.0 {
        lux as u32
    } else {
        0
    }
}

/// Branches of the piecewise CH1/CH0 calibration. Each upper bound is
/// inclusive.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LuxSegment {
    /// ratio <= 0.50
    UpTo0_50,
    /// 0.50 < ratio <= 0.61
    UpTo0_61,
    /// 0.61 < ratio <= 0.80
    UpTo0_80,
    /// 0.80 < ratio <= 1.30
    UpTo1_30,
    /// ratio > 1.30, or no ratio at all (CH0 of zero)
    Above1_30,
}

impl LuxSegment {
    /// Picks the segment for `ratio = CH1 / CH0`. A ratio exactly on a
    /// boundary belongs to the lower segment; NaN falls into the last one.
    pub fn for_ratio(ratio: f32) -> Self {
        if ratio <= 0.50 {
            LuxSegment::UpTo0_50
        } else if ratio <= 0.61 {
            LuxSegment::UpTo0_61
        } else if ratio <= 0.80 {
            LuxSegment::UpTo0_80
        } else if ratio <= 1.30 {
            LuxSegment::UpTo1_30
        } else {
            LuxSegment::Above1_30
        }
    }

    /// Unclamped lux for this branch.
    pub fn lux(self, ch0: f32, ch1: f32, ratio: f32) -> f32 {
        match self {
            LuxSegment::UpTo0_50 => 0.0304 * ch0 - 0.062 * ch0 * libm::powf(ratio, 1.4),
            LuxSegment::UpTo0_61 => 0.0224 * ch0 - 0.031 * ch1,
            LuxSegment::UpTo0_80 => 0.0128 * ch0 - 0.0153 * ch1,
            LuxSegment::UpTo1_30 => 0.00146 * ch0 - 0.00112 * ch1,
            LuxSegment::Above1_30 => 0.0,
        }
    }
}

/// Shorthand for all functions returning an error in this crate.
pub type Result<T, E> = core::result::Result<T, TSL2561Error<E>>;

/// Represents any error that may happen while talking to the sensor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TSL2561Error<E> {
    /// An error occurred while reading from the sensor.
    ReadI2CError(E),
    /// An error occurred while writing to the sensor.
    WriteI2CError(E),
    /// A channel is saturated or the broadband channel reads zero. This is
    /// not a dark reading.
    SensorFault(RawReading),
    /// The ID register holds neither known part ID (strict mode only).
    UnexpectedDeviceId(u8),
    /// The sensor has not been initialized yet.
    NotInitialized,
}

/// Raw ADC counts of both channels.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RawReading {
    /// Visible plus infrared
    pub ch0: u16,
    /// Infrared only
    pub ch1: u16,
}

impl RawReading {
    /// A saturated channel, or a zero broadband channel when
    /// `zero_baseline_is_fault` is set, cannot be converted.
    pub fn is_fault(&self, zero_baseline_is_fault: bool) -> bool {
        self.ch0 == SATURATED
            || self.ch1 == SATURATED
            || (zero_baseline_is_fault && self.ch0 == 0)
    }
}

// All registers of the TSL2561 sensor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Register {
    /// Power control register
    Control = 0x00,

    /// Integration time and gain register
    Timing = 0x01,

    /// Part number and revision register
    ID = 0x0A,

    /// ADC channel 0 (Low byte)
    Data0Low = 0x0C,

    /// ADC channel 0 (High byte)
    Data0High = 0x0D,

    /// ADC channel 1 (Low byte)
    Data1Low = 0x0E,

    /// ADC channel 1 (High byte)
    Data1High = 0x0F,
}

/// ADC channels of the sensor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Channel {
    /// CH0, visible plus infrared
    Broadband,
    /// CH1, infrared only
    Infrared,
}

impl Channel {
    /// Register holding the low byte of the channel.
    pub fn low_register(self) -> Register {
        match self {
            Channel::Broadband => Register::Data0Low,
            Channel::Infrared => Register::Data1Low,
        }
    }

    /// Register holding the high byte of the channel.
    pub fn high_register(self) -> Register {
        match self {
            Channel::Broadband => Register::Data0High,
            Channel::Infrared => Register::Data1High,
        }
    }
}

/// Bus address, selected by the ADDR SEL pin.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Address {
    /// ADDR SEL tied to ground
    Ground = 0x29,
    /// ADDR SEL floating
    Float = 0x39,
    /// ADDR SEL tied to VDD
    Vdd = 0x49,
}

impl Address {
    /// 7-bit bus address.
    pub fn into_u8(self) -> u8 {
        self as u8
    }
}

/// Integration time of the ADC.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum IntegrationTime {
    /// 13.7 ms
    Ms13_7 = 0x00,
    /// 101 ms
    Ms101 = 0x01,
    /// 402 ms
    Ms402 = 0x02,
}

impl IntegrationTime {
    /// Time to wait after configuring before the first complete conversion
    /// is available.
    pub fn settle_ms(self) -> u32 {
        match self {
            IntegrationTime::Ms13_7 => 15,
            IntegrationTime::Ms101 => 120,
            IntegrationTime::Ms402 => 500,
        }
    }
}

/// Analog gain of the sensor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Gain {
    /// 1x
    Low = 0x00,
    /// 16x
    High = 0x10,
}

/// Contents of the timing register.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Timing {
    pub integration_time: IntegrationTime,
    pub gain: Gain,
}

impl Default for Timing {
    /// 402 ms at 1x, register value 0x02.
    fn default() -> Self {
        Self::new(IntegrationTime::Ms402, Gain::Low)
    }
}

impl Timing {
    /// Combines an integration time and a gain.
    pub const fn new(integration_time: IntegrationTime, gain: Gain) -> Self {
        Self {
            integration_time,
            gain,
        }
    }

    /// Converts the timing into the corresponding register value
    pub fn into_reg_value(self) -> u8 {
        self.gain as u8 | self.integration_time as u8
    }
}

/// Driver configuration.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// Bus address of the sensor
    pub address: Address,
    /// Timing written during initialization
    pub timing: Timing,
    /// Treat a broadband reading of zero as a fault instead of darkness
    pub zero_baseline_is_fault: bool,
    /// Fail initialization on an unknown device ID
    pub strict_id_check: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: Address::Float,
            timing: Timing::default(),
            zero_baseline_is_fault: true,
            strict_id_check: false,
        }
    }
}

impl Config {
    /// Selects the bus address.
    pub fn with_address(mut self, address: Address) -> Self {
        self.address = address;
        self
    }

    /// Selects the timing written during initialization.
    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// Whether a zero broadband reading counts as a sensor fault.
    pub fn with_zero_baseline_fault(mut self, enabled: bool) -> Self {
        self.zero_baseline_is_fault = enabled;
        self
    }

    /// Whether an unknown device ID aborts initialization.
    pub fn with_strict_id_check(mut self, enabled: bool) -> Self {
        self.strict_id_check = enabled;
        self
    }
}

/// Lifecycle of a sensor session.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum State {
    Uninitialized,
    PoweringUp,
    IdValidated,
    IdInvalid,
    /// Timing configured, readings available
    Ready,
}

/// Known parts, identified by the ID register.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Part {
    /// TSL2561CS (chipscale package), ID 0x10
    Tsl2561Cs,
    /// TSL2561T/FN/CL, ID 0x50
    Tsl2561T,
}

/// Outcome of the ID check during initialization.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IdCheck {
    Recognized(Part),
    Unexpected(u8),
}

impl IdCheck {
    /// Classifies a raw ID register value.
    pub fn classify(id: u8) -> Self {
        match id {
            0x10 => IdCheck::Recognized(Part::Tsl2561Cs),
            0x50 => IdCheck::Recognized(Part::Tsl2561T),
            other => IdCheck::Unexpected(other),
        }
    }

    /// Whether the ID belongs to a known part.
    pub fn is_recognized(&self) -> bool {
        matches!(self, IdCheck::Recognized(_))
    }

    fn next_state(&self) -> State {
        match self {
            IdCheck::Recognized(_) => State::IdValidated,
            IdCheck::Unexpected(_) => State::IdInvalid,
        }
    }
}
