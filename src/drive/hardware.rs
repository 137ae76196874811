use rppal::gpio::{Gpio, OutputPin};
use rppal::i2c::I2c;
use std::thread;
use std::time::Duration;

use super::{check_pwm_args, prescale_for, DriveError, LedOutput, PwmOutput};
use crate::config::Pca9685Config;

const MODE1: u8 = 0x00;
const MODE2: u8 = 0x01;
const LED0_ON_L: u8 = 0x06;
const PRESCALE: u8 = 0xFE;

const MODE1_RESTART: u8 = 0x80;
const MODE1_AUTO_INCREMENT: u8 = 0x20;
const MODE1_SLEEP: u8 = 0x10;
const MODE2_OUTDRV: u8 = 0x04;

/// PCA9685 16-channel PWM controller on an I2C bus
pub struct Pca9685 {
    i2c: I2c,
}

impl Pca9685 {
    pub fn new(config: &Pca9685Config) -> Result<Self, DriveError> {
        let mut i2c = I2c::with_bus(config.i2c_bus)?;
        i2c.set_slave_address(u16::from(config.address))?;

        let mut pca = Pca9685 { i2c };
        pca.reset()?;
        pca.write_reg(MODE2, MODE2_OUTDRV)?;
        pca.set_frequency(config.oscillator_hz, config.pwm_hz)?;

        log::info!(
            "PCA9685 initialised on bus {} addr {:#04x} at {} Hz",
            config.i2c_bus,
            config.address,
            config.pwm_hz
        );
        Ok(pca)
    }

    fn write_reg(&mut self, reg: u8, val: u8) -> Result<(), DriveError> {
        self.i2c.write(&[reg, val])?;
        Ok(())
    }

    fn read_reg(&mut self, reg: u8) -> Result<u8, DriveError> {
        let mut data = [0u8; 1];
        self.i2c.write_read(&[reg], &mut data)?;
        Ok(data[0])
    }

    fn reset(&mut self) -> Result<(), DriveError> {
        self.write_reg(MODE1, MODE1_RESTART)?;
        thread::sleep(Duration::from_millis(10));
        Ok(())
    }

    /// The prescaler can only be written while the oscillator sleeps
    fn set_frequency(&mut self, oscillator_hz: u32, pwm_hz: u32) -> Result<(), DriveError> {
        let prescale = prescale_for(oscillator_hz, pwm_hz);

        let old_mode = self.read_reg(MODE1)?;
        let sleep_mode = (old_mode & !MODE1_RESTART) | MODE1_SLEEP;
        self.write_reg(MODE1, sleep_mode)?;
        self.write_reg(PRESCALE, prescale)?;
        self.write_reg(MODE1, old_mode)?;
        thread::sleep(Duration::from_millis(5));
        self.write_reg(MODE1, old_mode | MODE1_RESTART | MODE1_AUTO_INCREMENT)?;
        Ok(())
    }
}

impl PwmOutput for Pca9685 {
    fn set_pwm(&mut self, channel: u8, on: u16, off: u16) -> Result<(), DriveError> {
        check_pwm_args(channel, on, off)?;
        let [on_l, on_h] = on.to_le_bytes();
        let [off_l, off_h] = off.to_le_bytes();
        self.i2c.write(&[LED0_ON_L + 4 * channel, on_l, on_h, off_l, off_h])?;
        Ok(())
    }
}

/// Status LED on a GPIO pin
pub struct GpioLed {
    pin: OutputPin,
}

impl GpioLed {
    pub fn new(pin: u8) -> Result<Self, DriveError> {
        let pin = Gpio::new()?.get(pin)?.into_output_low();
        Ok(Self { pin })
    }
}

impl LedOutput for GpioLed {
    fn set(&mut self, on: bool) -> Result<(), DriveError> {
        if on {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        Ok(())
    }
}
