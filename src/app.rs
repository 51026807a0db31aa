//! Ambient-light monitor application core
//!
//! The pieces of the monitor that sit above the sensor driver: application
//! state, the serial menu commands, the LED bar, display lines, the button
//! latch and persistence of the last reading. UART, LCD, LEDs and flash are
//! reached through the collaborator traits below; the board crate provides
//! them and runs the outer loop:
//!
//! ```ignore
//! monitor.show_menu();
//! loop {
//!     if !monitor.state().monitoring {
//!         let line = uart.read_line();
//!         monitor.handle_line(&line);
//!     }
//!     monitor.poll(&BUTTON, &mut sensor, &mut i2c, &mut delay);
//! }
//! ```

use core::fmt::{Debug, Write as _};
use core::sync::atomic::{AtomicBool, Ordering};

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::i2c::{Read, Write, WriteRead};
use heapless::String;

use crate::{TSL2561Error, TSL2561};

/// Number of LEDs in the bar.
pub const NUM_LEDS: u32 = 8;

/// Illuminance at which the bar is completely dark.
pub const MAX_LUX: u32 = 1800;

/// Pause between two readings while monitoring.
pub const POLL_PERIOD_MS: u32 = 500;

/// Width of one line of the character display.
pub const LCD_COLUMNS: usize = 16;

const CONSOLE_LINE_CAPACITY: usize = 48;

/// Storage addresses of the persisted reading, little endian.
const LAST_LUX_LOW: u32 = 0x00;
const LAST_LUX_HIGH: u32 = 0x01;

/// Serial text output.
pub trait Console {
    fn write_line(&mut self, line: &str);
}

/// Two-line character display.
pub trait CharDisplay {
    /// Clears the display and shows both lines.
    fn show(&mut self, first: &str, second: &str);
}

/// LED bar, status LED and beeper.
pub trait Indicators {
    /// Bit `n` lights LED `n` of the bar.
    fn set_bar(&mut self, pattern: u8);

    fn set_status(&mut self, status: Status);

    fn beep(&mut self);
}

/// Byte-addressed non-volatile memory.
pub trait Storage {
    type Error: Debug;

    /// Erases the whole storage; erased bytes read back as 0xFF.
    fn erase(&mut self) -> Result<(), Self::Error>;

    fn write_byte(&mut self, address: u32, value: u8) -> Result<(), Self::Error>;

    fn read_byte(&mut self, address: u32) -> Result<u8, Self::Error>;
}

/// What the status LED shows.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Status {
    /// Waiting for a menu command
    Idle,
    Monitoring,
}

/// Set from the button interrupt, consumed by the main loop. The interrupt
/// never touches the bus.
#[derive(Debug, Default)]
pub struct ButtonLatch {
    pressed: AtomicBool,
}

impl ButtonLatch {
    pub const fn new() -> Self {
        Self {
            pressed: AtomicBool::new(false),
        }
    }

    /// Called from interrupt context.
    pub fn press(&self) {
        self.pressed.store(true, Ordering::Release);
    }

    /// Returns whether the button was pressed since the last call.
    pub fn take(&self) -> bool {
        // load/store instead of swap: not every core has atomic read-modify-write
        let pressed = self.pressed.load(Ordering::Acquire);
        if pressed {
            self.pressed.store(false, Ordering::Release);
        }
        pressed
    }
}

/// Menu commands read from the serial console.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Command {
    /// `1`
    StartMonitoring,
    /// `2`
    ShowLast,
    /// `3`
    ResetLast,
}

impl Command {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "1" => Some(Command::StartMonitoring),
            "2" => Some(Command::ShowLast),
            "3" => Some(Command::ResetLast),
            _ => None,
        }
    }
}

/// Application state, owned by the [`Monitor`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct AppState {
    /// Last valid reading
    pub last_lux: Option<u32>,
    pub monitoring: bool,
}

/// Result of one [`Monitor::poll`] step.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PollOutcome {
    /// Not monitoring, nothing done
    Idle,
    /// New reading shown
    Measured(u32),
    /// The sensor could not deliver a valid reading
    Failed,
    /// Button pressed: last reading persisted, monitoring stopped
    Stopped,
}

/// Brightness on the bar scale: `lux * 8 / 1800`, not clamped.
pub fn led_level(lux: u32) -> u32 {
    lux.saturating_mul(NUM_LEDS) / MAX_LUX
}

/// Number of bar LEDs lit for `lux`: all of them in the dark, none from
/// [`MAX_LUX`] upwards.
pub fn lit_leds(lux: u32) -> u32 {
    NUM_LEDS.saturating_sub(led_level(lux))
}

/// Bar pattern for `lux`, lowest LEDs first.
pub fn led_pattern(lux: u32) -> u8 {
    ((1u16 << lit_leds(lux)) - 1) as u8
}

/// The monitor application.
pub struct Monitor<C, V, L, S> {
    console: C,
    display: V,
    indicators: L,
    storage: S,
    state: AppState,
}

impl<C, V, L, S> Monitor<C, V, L, S>
where
    C: Console,
    V: CharDisplay,
    L: Indicators,
    S: Storage,
{
    pub fn new(console: C, display: V, mut indicators: L, storage: S) -> Self {
        indicators.set_status(Status::Idle);

        Self {
            console,
            display,
            indicators,
            storage,
            state: AppState::default(),
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Gives the collaborators back.
    pub fn release(self) -> (C, V, L, S) {
        (self.console, self.display, self.indicators, self.storage)
    }

    pub fn show_menu(&mut self) {
        self.console.write_line("Menu:");
        self.console.write_line("1. Start ambient light monitoring");
        self.console.write_line("2. Show last stored detection");
        self.console.write_line("3. Reset last stored detection");
    }

    /// Dispatches one line typed on the console.
    pub fn handle_line(&mut self, line: &str) -> Option<Command> {
        let command = Command::parse(line);

        match command {
            Some(Command::StartMonitoring) => self.start_monitoring(),
            Some(Command::ShowLast) => {
                self.show_last();
                self.show_menu();
            }
            Some(Command::ResetLast) => {
                self.reset_last();
                self.show_menu();
            }
            None => {
                self.console.write_line("Error: invalid command");
                self.show_menu();
            }
        }

        command
    }

    pub fn start_monitoring(&mut self) {
        log::info!("Monitoring started");
        self.state.monitoring = true;
        self.indicators.beep();
        self.indicators.set_status(Status::Monitoring);
    }

    pub fn stop_monitoring(&mut self) {
        log::info!("Monitoring stopped");
        self.state.monitoring = false;
        self.indicators.set_status(Status::Idle);
        self.show_menu();
    }

    /// Prints the persisted reading.
    pub fn show_last(&mut self) {
        match self.load_last() {
            Ok(Some(lux)) => self.print(format_args!("Last Light: {} LUX", lux)),
            Ok(None) => self.console.write_line("No detection stored"),
            Err(e) => {
                log::error!("Storage read failed: {:?}", e);
                self.console.write_line("Error: storage read failed");
            }
        }
    }

    /// Erases the persisted reading.
    pub fn reset_last(&mut self) {
        self.console.write_line("Erasing storage...");
        match self.storage.erase() {
            Ok(()) => self.console.write_line("Last detection reset."),
            Err(e) => {
                log::error!("Storage erase failed: {:?}", e);
                self.console.write_line("Error: storage erase failed");
            }
        }
    }

    /// One iteration of the main loop.
    ///
    /// A button press while monitoring persists the last reading and stops
    /// monitoring. Otherwise, while monitoring, takes a reading, shows it and
    /// waits [`POLL_PERIOD_MS`].
    pub fn poll<I2C, D, E>(
        &mut self,
        button: &ButtonLatch,
        sensor: &mut TSL2561<I2C, D>,
        i2c: &mut I2C,
        delay: &mut D,
    ) -> PollOutcome
    where
        D: DelayMs<u32>,
        I2C: Read<Error = E> + Write<Error = E> + WriteRead<Error = E>,
        E: Debug,
    {
        if button.take() {
            if self.state.monitoring {
                self.print(format_args!(
                    "Button pressed. Last lux: {}",
                    self.state.last_lux.unwrap_or(0)
                ));
                self.persist_last();
                self.stop_monitoring();
                return PollOutcome::Stopped;
            }
            log::debug!("Button press ignored, not monitoring");
        }

        if !self.state.monitoring {
            return PollOutcome::Idle;
        }

        let outcome = match sensor.read_lux(i2c) {
            Ok(lux) => {
                self.state.last_lux = Some(lux);
                self.print(format_args!("Light:{} LUX", lux));
                self.show_reading(lux);
                PollOutcome::Measured(lux)
            }
            Err(TSL2561Error::SensorFault(raw)) => {
                self.print(format_args!("Sensor fault (CH0={}, CH1={})", raw.ch0, raw.ch1));
                self.display.show("Light: fault", "Check sensor");
                PollOutcome::Failed
            }
            Err(e) => {
                log::error!("Reading the sensor failed: {:?}", e);
                self.display.show("Light: error", "Check sensor");
                PollOutcome::Failed
            }
        };

        delay.delay_ms(POLL_PERIOD_MS);
        outcome
    }

    fn show_reading(&mut self, lux: u32) {
        self.indicators.set_bar(led_pattern(lux));

        let mut first: String<LCD_COLUMNS> = String::new();
        let mut second: String<LCD_COLUMNS> = String::new();
        // Too long for the display only if the reading is absurd; keep what fits.
        let _ = write!(first, "Light:{} LUX", lux);
        let _ = write!(second, "LED level:{}", led_level(lux));
        self.display.show(&first, &second);
    }

    /// Erases the storage, then writes the last reading. Without a reading
    /// the storage is left erased, so an older session's value never shows up
    /// as this one's.
    fn persist_last(&mut self) {
        let lux = self.state.last_lux;
        let result = self.storage.erase().and_then(|()| match lux {
            Some(lux) => {
                let [low, high] = u16::try_from(lux).unwrap_or(u16::MAX).to_le_bytes();
                self.storage.write_byte(LAST_LUX_LOW, low)?;
                self.storage.write_byte(LAST_LUX_HIGH, high)
            }
            None => Ok(()),
        });

        match result {
            Ok(()) => match lux {
                Some(lux) => log::info!("Persisted last reading: {} lux", lux),
                None => log::warn!("No reading this session, storage left erased"),
            },
            Err(e) => {
                log::error!("Persisting the last reading failed: {:?}", e);
                self.console.write_line("Error: storage write failed");
            }
        }
    }

    fn load_last(&mut self) -> Result<Option<u32>, S::Error> {
        let low = self.storage.read_byte(LAST_LUX_LOW)?;
        let high = self.storage.read_byte(LAST_LUX_HIGH)?;

        if low == 0xFF && high == 0xFF {
            return Ok(None);
        }
        Ok(Some(u16::from_le_bytes([low, high]) as u32))
    }

    fn print(&mut self, args: core::fmt::Arguments<'_>) {
        let mut line: String<CONSOLE_LINE_CAPACITY> = String::new();
        let _ = line.write_fmt(args);
        self.console.write_line(&line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Config, RawReading};
    use embedded_hal_mock::delay::MockNoop as DelayMock;
    use embedded_hal_mock::i2c::{Mock as I2cMock, Transaction as I2cTransaction};

    const ADDR: u8 = 0x39;

    #[derive(Default)]
    struct Lines(Vec<std::string::String>);

    impl Console for Lines {
        fn write_line(&mut self, line: &str) {
            self.0.push(line.to_string());
        }
    }

    #[derive(Default)]
    struct Screen(Vec<(std::string::String, std::string::String)>);

    impl CharDisplay for Screen {
        fn show(&mut self, first: &str, second: &str) {
            self.0.push((first.to_string(), second.to_string()));
        }
    }

    #[derive(Default)]
    struct Leds {
        bar: Vec<u8>,
        status: Vec<Status>,
        beeps: usize,
    }

    impl Indicators for Leds {
        fn set_bar(&mut self, pattern: u8) {
            self.bar.push(pattern);
        }

        fn set_status(&mut self, status: Status) {
            self.status.push(status);
        }

        fn beep(&mut self) {
            self.beeps += 1;
        }
    }

    struct Flash {
        bytes: [u8; 4],
        erases: usize,
        broken: bool,
    }

    impl Default for Flash {
        fn default() -> Self {
            Self {
                bytes: [0xFF; 4],
                erases: 0,
                broken: false,
            }
        }
    }

    impl Storage for Flash {
        type Error = ();

        fn erase(&mut self) -> Result<(), ()> {
            if self.broken {
                return Err(());
            }
            self.erases += 1;
            self.bytes = [0xFF; 4];
            Ok(())
        }

        fn write_byte(&mut self, address: u32, value: u8) -> Result<(), ()> {
            self.bytes[address as usize] = value;
            Ok(())
        }

        fn read_byte(&mut self, address: u32) -> Result<u8, ()> {
            Ok(self.bytes[address as usize])
        }
    }

    type TestMonitor = Monitor<Lines, Screen, Leds, Flash>;

    fn monitor() -> TestMonitor {
        Monitor::new(
            Lines::default(),
            Screen::default(),
            Leds::default(),
            Flash::default(),
        )
    }

    fn ready_sensor(
        readings: &[(u16, u16)],
    ) -> (TSL2561<I2cMock, DelayMock>, I2cMock, DelayMock) {
        let mut expectations = vec![
            I2cTransaction::write(ADDR, [0x80, 0x03].to_vec()),
            I2cTransaction::write_read(ADDR, [0x8A].to_vec(), [0x50].to_vec()),
            I2cTransaction::write(ADDR, [0x81, 0x02].to_vec()),
        ];
        for (ch0, ch1) in readings {
            expectations.push(I2cTransaction::write_read(
                ADDR,
                [0x8C].to_vec(),
                ch0.to_le_bytes().to_vec(),
            ));
            expectations.push(I2cTransaction::write_read(
                ADDR,
                [0x8E].to_vec(),
                ch1.to_le_bytes().to_vec(),
            ));
        }

        let mut i2c = I2cMock::new(&expectations);
        let mut delay = DelayMock::new();
        let mut sensor = TSL2561::new(Config::default());
        sensor.init(&mut delay, &mut i2c).unwrap();
        (sensor, i2c, delay)
    }

    #[test]
    fn test_led_pattern() {
        assert_eq!(led_pattern(0), 0xFF);
        assert_eq!(led_pattern(224), 0xFF);
        assert_eq!(led_pattern(225), 0x7F);
        assert_eq!(led_pattern(900), 0x0F);
        assert_eq!(led_pattern(1800), 0x00);
        assert_eq!(led_pattern(u32::MAX), 0x00);
        assert_eq!(lit_leds(13), 8);
        assert_eq!(led_level(13), 0);
        assert_eq!(led_level(900), 4);
        assert_eq!(led_level(3600), 16);
    }

    #[test]
    fn test_command_parse() {
        assert_eq!(Command::parse("1"), Some(Command::StartMonitoring));
        assert_eq!(Command::parse(" 2\r\n"), Some(Command::ShowLast));
        assert_eq!(Command::parse("3"), Some(Command::ResetLast));
        assert_eq!(Command::parse("4"), None);
        assert_eq!(Command::parse("12"), None);
        assert_eq!(Command::parse(""), None);
    }

    #[test]
    fn test_button_latch() {
        let button = ButtonLatch::new();
        assert!(!button.take());
        button.press();
        button.press();
        assert!(button.take());
        assert!(!button.take());
    }

    #[test]
    fn test_invalid_command_reprints_menu() {
        let mut monitor = monitor();
        assert_eq!(monitor.handle_line("x"), None);

        let (console, ..) = monitor.release();
        assert_eq!(console.0[0], "Error: invalid command");
        assert_eq!(console.0[1], "Menu:");
        assert_eq!(console.0.len(), 5);
    }

    #[test]
    fn test_poll_idle_does_not_touch_sensor() {
        let (mut sensor, mut i2c, mut delay) = ready_sensor(&[]);
        let mut monitor = monitor();
        let button = ButtonLatch::new();

        assert_eq!(
            monitor.poll(&button, &mut sensor, &mut i2c, &mut delay),
            PollOutcome::Idle
        );

        // A press while idle is dropped
        button.press();
        assert_eq!(
            monitor.poll(&button, &mut sensor, &mut i2c, &mut delay),
            PollOutcome::Idle
        );
        assert!(!button.take());

        i2c.done();
    }

    #[test]
    fn test_monitoring_shows_readings() {
        let (mut sensor, mut i2c, mut delay) = ready_sensor(&[(1000, 400), (1000, 550)]);
        let mut monitor = monitor();
        let button = ButtonLatch::new();

        assert_eq!(
            monitor.handle_line("1"),
            Some(Command::StartMonitoring)
        );
        assert!(monitor.state().monitoring);

        assert_eq!(
            monitor.poll(&button, &mut sensor, &mut i2c, &mut delay),
            PollOutcome::Measured(13)
        );
        assert_eq!(
            monitor.poll(&button, &mut sensor, &mut i2c, &mut delay),
            PollOutcome::Measured(5)
        );
        assert_eq!(monitor.state().last_lux, Some(5));

        let (console, screen, leds, _) = monitor.release();
        assert_eq!(console.0, ["Light:13 LUX", "Light:5 LUX"]);
        assert_eq!(
            screen.0,
            [
                ("Light:13 LUX".to_string(), "LED level:0".to_string()),
                ("Light:5 LUX".to_string(), "LED level:0".to_string()),
            ]
        );
        assert_eq!(leds.bar, [0xFF, 0xFF]);
        assert_eq!(leds.status, [Status::Idle, Status::Monitoring]);
        assert_eq!(leds.beeps, 1);

        i2c.done();
    }

    #[test]
    fn test_sensor_fault_keeps_last_reading() {
        let (mut sensor, mut i2c, mut delay) = ready_sensor(&[(1000, 400), (0xFFFF, 10)]);
        let mut monitor = monitor();
        let button = ButtonLatch::new();
        monitor.start_monitoring();

        monitor.poll(&button, &mut sensor, &mut i2c, &mut delay);
        assert_eq!(
            monitor.poll(&button, &mut sensor, &mut i2c, &mut delay),
            PollOutcome::Failed
        );
        assert_eq!(monitor.state().last_lux, Some(13));

        let (console, screen, ..) = monitor.release();
        assert_eq!(
            console.0.last().map(|s| s.as_str()),
            Some("Sensor fault (CH0=65535, CH1=10)")
        );
        assert_eq!(screen.0.last().unwrap().0, "Light: fault");

        i2c.done();
    }

    #[test]
    fn test_button_persists_and_stops() {
        let (mut sensor, mut i2c, mut delay) = ready_sensor(&[(40_000, 4_000)]);
        let mut monitor = monitor();
        let button = ButtonLatch::new();
        monitor.start_monitoring();

        let outcome = monitor.poll(&button, &mut sensor, &mut i2c, &mut delay);
        let PollOutcome::Measured(lux) = outcome else {
            panic!("unexpected outcome {:?}", outcome);
        };
        assert!(lux > 255);

        button.press();
        assert_eq!(
            monitor.poll(&button, &mut sensor, &mut i2c, &mut delay),
            PollOutcome::Stopped
        );
        assert!(!monitor.state().monitoring);

        monitor.show_last();

        let (console, _, leds, flash) = monitor.release();
        assert_eq!(flash.erases, 1);
        assert_eq!(u16::from_le_bytes([flash.bytes[0], flash.bytes[1]]) as u32, lux);
        assert_eq!(leds.status.last(), Some(&Status::Idle));
        assert_eq!(console.0.last().unwrap(), &format!("Last Light: {} LUX", lux));

        i2c.done();
    }

    #[test]
    fn test_button_before_first_reading_clears_storage() {
        let (mut sensor, mut i2c, mut delay) = ready_sensor(&[]);
        let flash = Flash {
            bytes: [0x2A, 0x00, 0xFF, 0xFF],
            ..Flash::default()
        };
        let mut monitor = Monitor::new(Lines::default(), Screen::default(), Leds::default(), flash);
        let button = ButtonLatch::new();
        monitor.start_monitoring();

        button.press();
        assert_eq!(
            monitor.poll(&button, &mut sensor, &mut i2c, &mut delay),
            PollOutcome::Stopped
        );
        assert!(!monitor.state().monitoring);

        monitor.show_last();

        let (console, _, _, flash) = monitor.release();
        assert_eq!(flash.erases, 1);
        assert_eq!(flash.bytes, [0xFF; 4]);
        assert_eq!(console.0.last().unwrap(), "No detection stored");

        i2c.done();
    }

    #[test]
    fn test_show_and_reset_last() {
        let mut monitor = monitor();

        monitor.show_last();
        assert_eq!(monitor.handle_line("3"), Some(Command::ResetLast));

        let (console, _, _, mut flash) = monitor.release();
        assert_eq!(console.0[0], "No detection stored");
        assert!(console.0.contains(&"Last detection reset.".to_string()));
        assert_eq!(flash.erases, 1);

        flash.broken = true;
        let mut monitor = Monitor::new(Lines::default(), Screen::default(), Leds::default(), flash);
        monitor.reset_last();
        let (console, ..) = monitor.release();
        assert_eq!(console.0[1], "Error: storage erase failed");
    }

    #[test]
    fn test_fault_status_is_not_a_reading() {
        let raw = RawReading { ch0: 0, ch1: 0 };
        assert!(raw.is_fault(true));
        assert!(!raw.is_fault(false));
    }
}
