//! Async API
//!
//! This module contains the async API for the TSL2561 sensor, built on the
//! `embedded-hal-async` I2C and delay traits. Protocol, configuration and
//! errors are shared with the blocking driver.

use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{I2c, SevenBitAddress};

use crate::{
    calculate_lux, report_id_check, Channel, Config, IdCheck, RawReading, Register, Result, State,
    TSL2561Error, Timing, COMMAND_BIT, POWER_OFF, POWER_ON, POWER_UP_DELAY_MS,
};

/// Represents an I2C-connected TSL2561 sensor driven through async traits.
#[derive(Copy, Clone, Debug)]
pub struct TSL2561Async<I2C, D> {
    /// Marker to satisfy the compiler.
    _delay: core::marker::PhantomData<D>,

    /// I2C Interface for communcating with the sensor.
    _i2c: core::marker::PhantomData<I2C>,

    config: Config,
    state: State,
}

impl<I2C, D> TSL2561Async<I2C, D>
where
    D: DelayNs,
    I2C: I2c<SevenBitAddress>,
{
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

    /// Brings the sensor into a state where it can be read.
    ///
    /// Same sequence as the blocking [`crate::TSL2561::init`].
    pub async fn init(&mut self, delay: &mut D, i2c: &mut I2C) -> Result<IdCheck, I2C::Error> {
        self.state = State::PoweringUp;
        self.power_on(i2c).await?;
        delay.delay_ms(POWER_UP_DELAY_MS).await;

        let id_check = IdCheck::classify(self.read_id(i2c).await?);
        self.state = id_check.next_state();
        report_id_check::<I2C::Error>(id_check, self.config.strict_id_check)?;

        self.set_timing(self.config.timing, i2c).await?;
        delay
            .delay_ms(self.config.timing.integration_time.settle_ms())
            .await;

        self.state = State::Ready;
        Ok(id_check)
    }

    /// Powers the sensor on.
    pub async fn power_on(&mut self, i2c: &mut I2C) -> Result<(), I2C::Error> {
        self.write_register(Register::Control, POWER_ON, i2c).await
    }

    /// Powers the sensor off. The driver has to be initialized again afterwards.
    pub async fn power_off(&mut self, i2c: &mut I2C) -> Result<(), I2C::Error> {
        self.write_register(Register::Control, POWER_OFF, i2c)
            .await?;
        self.state = State::Uninitialized;
        Ok(())
    }

    /// Write the integration time and gain to the sensor.
    pub async fn set_timing(&mut self, timing: Timing, i2c: &mut I2C) -> Result<(), I2C::Error> {
        self.write_register(Register::Timing, timing.into_reg_value(), i2c)
            .await?;
        self.config.timing = timing;
        Ok(())
    }

    /// Reads the raw ID register.
    pub async fn read_id(&mut self, i2c: &mut I2C) -> Result<u8, I2C::Error> {
        self.read_register(Register::ID, i2c).await
    }

    /// Reads one ADC channel, low byte first.
    pub async fn read_channel(
        &mut self,
        channel: Channel,
        i2c: &mut I2C,
    ) -> Result<u16, I2C::Error> {
        let mut read_data = [0; 2];

        i2c.write_read(
            self.config.address.into_u8(),
            &[channel.low_register() as u8 | COMMAND_BIT],
            &mut read_data,
        )
        .await
        .map_err(TSL2561Error::ReadI2CError)?;

        Ok(u16::from_le_bytes(read_data))
    }

    /// Reads both channels, CH0 first.
    pub async fn read_raw(&mut self, i2c: &mut I2C) -> Result<RawReading, I2C::Error> {
        let ch0 = self.read_channel(Channel::Broadband, i2c).await?;
        let ch1 = self.read_channel(Channel::Infrared, i2c).await?;

        Ok(RawReading { ch0, ch1 })
    }

    /// Reads the ambient light intensity in lux.
    pub async fn read_lux(&mut self, i2c: &mut I2C) -> Result<u32, I2C::Error> {
        if self.state != State::Ready {
            return Err(TSL2561Error::NotInitialized);
        }

        let raw = self.read_raw(i2c).await?;
        if raw.is_fault(self.config.zero_baseline_is_fault) {
            log::warn!("Sensor fault: CH0={} CH1={}", raw.ch0, raw.ch1);
            return Err(TSL2561Error::SensorFault(raw));
        }

        Ok(calculate_lux(raw))
    }

    /// Writes a new value to a specific register
    pub async fn write_register(
        &mut self,
        register: Register,
        data: u8,
        i2c: &mut I2C,
    ) -> Result<(), I2C::Error> {
        let command_reg_value = register as u8 | COMMAND_BIT;

        i2c.write(self.config.address.into_u8(), &[command_reg_value, data])
            .await
            .map_err(TSL2561Error::WriteI2CError)
    }

    /// Reads the value of a specific register
    pub async fn read_register(
        &mut self,
        register: Register,
        i2c: &mut I2C,
    ) -> Result<u8, I2C::Error> {
        let command_reg_value = register as u8 | COMMAND_BIT;
        let mut read_data = [0; 1];

        i2c.write_read(self.config.address.into_u8(), &[command_reg_value], &mut read_data)
            .await
            .map_err(TSL2561Error::ReadI2CError)?;

        Ok(read_data[0])
    }
}
