//! Motor, servo, buzzer and LED outputs of the car.
//!
//! All actuators except the LED hang off one 16-channel PWM controller.
//! Each wheel uses two channels (forward and backward); driving one of them
//! while holding the other at zero sets the direction.

#[cfg(feature = "hardware")]
mod hardware;
mod sim;

#[cfg(feature = "hardware")]
pub use hardware::{GpioLed, Pca9685};
pub use sim::{PwmWrite, SimLed, SimPwm};

use std::str::FromStr;
use std::thread;
use std::time::Duration;
use thiserror::Error;

use crate::config::{MotorConfig, ServoConfig};

/// Full scale of the 12-bit PWM counter
pub const PWM_FULL: u16 = 4095;

#[derive(Error, Debug)]
pub enum DriveError {
    #[cfg(feature = "hardware")]
    #[error("I2C error: {0}")]
    I2c(#[from] rppal::i2c::Error),

    #[cfg(feature = "hardware")]
    #[error("GPIO error: {0}")]
    Gpio(#[from] rppal::gpio::Error),

    #[error("PWM channel {0} out of range")]
    InvalidChannel(u8),

    #[error("PWM value {0} out of range")]
    InvalidValue(u16),
}

pub trait PwmOutput: Send {
    /// Sets one channel's on/off counter positions (0..=4095)
    fn set_pwm(&mut self, channel: u8, on: u16, off: u16) -> Result<(), DriveError>;
}

pub trait LedOutput: Send {
    fn set(&mut self, on: bool) -> Result<(), DriveError>;
}

pub(crate) fn check_pwm_args(channel: u8, on: u16, off: u16) -> Result<(), DriveError> {
    if channel > 15 {
        return Err(DriveError::InvalidChannel(channel));
    }
    if on > PWM_FULL {
        return Err(DriveError::InvalidValue(on));
    }
    if off > PWM_FULL {
        return Err(DriveError::InvalidValue(off));
    }
    Ok(())
}

/// Duty counter for a power percentage; anything above 100 is full power
pub fn duty_for_percent(percent: u8) -> u16 {
    let percent = u32::from(percent.min(100));
    (u32::from(PWM_FULL) * percent / 100) as u16
}

/// Servo pulse counter for a position between 0 and 100
pub fn servo_pulse(min_pulse: u16, position: u8) -> u16 {
    min_pulse.saturating_add(2 * u16::from(position.min(100))).min(PWM_FULL)
}

/// PCA9685 prescaler for the wanted output frequency
pub fn prescale_for(oscillator_hz: u32, pwm_hz: u32) -> u8 {
    let value = (f64::from(oscillator_hz) / (4096.0 * f64::from(pwm_hz.max(1)))).round() - 1.0;
    value.clamp(3.0, 255.0) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveCommand {
    Stop,
    Left,
    Right,
    Forward,
    Back,
}

impl DriveCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            DriveCommand::Stop => "stop",
            DriveCommand::Left => "left",
            DriveCommand::Right => "right",
            DriveCommand::Forward => "forward",
            DriveCommand::Back => "back",
        }
    }

    /// (left, right) wheel speeds in percent; negative runs backwards
    pub fn wheel_speeds(self, speed: u8) -> (i16, i16) {
        let s = i16::from(speed);
        match self {
            DriveCommand::Stop => (0, 0),
            DriveCommand::Left => (0, s),
            DriveCommand::Right => (s, 0),
            DriveCommand::Forward => (s, s),
            DriveCommand::Back => (-s, -s),
        }
    }
}

impl FromStr for DriveCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stop" => Ok(DriveCommand::Stop),
            "left" => Ok(DriveCommand::Left),
            "right" => Ok(DriveCommand::Right),
            "forward" => Ok(DriveCommand::Forward),
            "back" => Ok(DriveCommand::Back),
            other => Err(format!("unknown drive command '{}'", other)),
        }
    }
}

pub struct Car {
    pwm: Box<dyn PwmOutput>,
    led: Box<dyn LedOutput>,
    motors: MotorConfig,
    servo: ServoConfig,
    led_on: bool,
    servo_position: Option<u8>,
    drive: Option<DriveCommand>,
}

impl Car {
    pub fn new(
        pwm: Box<dyn PwmOutput>,
        led: Box<dyn LedOutput>,
        motors: MotorConfig,
        servo: ServoConfig,
    ) -> Self {
        Self {
            pwm,
            led,
            motors,
            servo,
            led_on: false,
            servo_position: None,
            drive: None,
        }
    }

    pub fn led_on(&self) -> bool {
        self.led_on
    }

    pub fn servo_position(&self) -> Option<u8> {
        self.servo_position
    }

    pub fn drive(&self) -> Option<DriveCommand> {
        self.drive
    }

    pub fn set_pwm_channel(&mut self, channel: u8, percent: u8) -> Result<(), DriveError> {
        self.pwm.set_pwm(channel, 0, duty_for_percent(percent))
    }

    fn set_wheel(&mut self, forward: u8, backward: u8, speed: i16) -> Result<(), DriveError> {
        let percent = speed.unsigned_abs().min(100) as u8;
        if speed > 0 {
            self.set_pwm_channel(backward, 0)?;
            self.set_pwm_channel(forward, percent)
        } else if speed < 0 {
            self.set_pwm_channel(forward, 0)?;
            self.set_pwm_channel(backward, percent)
        } else {
            self.set_pwm_channel(backward, 0)?;
            self.set_pwm_channel(forward, 0)
        }
    }

    pub fn set_left_wheel(&mut self, speed: i16) -> Result<(), DriveError> {
        self.set_wheel(self.motors.left_forward, self.motors.left_backward, speed)
    }

    pub fn set_right_wheel(&mut self, speed: i16) -> Result<(), DriveError> {
        self.set_wheel(self.motors.right_forward, self.motors.right_backward, speed)
    }

    pub fn apply_drive(&mut self, command: DriveCommand) -> Result<(), DriveError> {
        let (left, right) = command.wheel_speeds(self.motors.turn_speed);
        self.set_left_wheel(left)?;
        self.set_right_wheel(right)?;
        self.drive = Some(command);
        Ok(())
    }

    pub fn set_servo(&mut self, position: u8) -> Result<(), DriveError> {
        let position = position.min(100);
        let pulse = servo_pulse(self.servo.min_pulse, position);
        self.pwm.set_pwm(self.servo.channel, 0, pulse)?;
        self.servo_position = Some(position);
        Ok(())
    }

    pub fn set_led(&mut self, on: bool) -> Result<(), DriveError> {
        self.led.set(on)?;
        self.led_on = on;
        Ok(())
    }

    pub fn toggle_led(&mut self) -> Result<(), DriveError> {
        self.set_led(!self.led_on)
    }

    pub fn buzzer(&mut self, on: bool) -> Result<(), DriveError> {
        let duty = if on { PWM_FULL } else { 0 };
        self.pwm.set_pwm(self.motors.buzzer_channel, 0, duty)
    }

    /// One short flash of the status LED (blocks ~200ms)
    pub fn blink(&mut self) -> Result<(), DriveError> {
        let was_on = self.led_on;
        self.set_led(true)?;
        thread::sleep(Duration::from_millis(5));
        self.set_led(false)?;
        thread::sleep(Duration::from_millis(195));
        if was_on {
            self.set_led(true)?;
        }
        Ok(())
    }

    /// Both wheels stopped and the servo at its starting position
    pub fn init(&mut self) -> Result<(), DriveError> {
        self.apply_drive(DriveCommand::Stop)?;
        self.buzzer(false)?;
        self.set_servo(self.servo.initial_position)
    }
}
